use anyhow::Result;
use regex::Regex;
use std::sync::{LazyLock, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, MutexGuard as AsyncMutexGuard};

/// Lock a mutex and return a Result.
/// Finds poison errors and returns them as Anyhow errors.
pub fn lock_mutex<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|e| anyhow::anyhow!("Mutex poisoned: {}", e))
}

pub async fn lock_async_mutex<T>(mutex: &AsyncMutex<T>) -> AsyncMutexGuard<'_, T> {
    mutex.lock().await
}

static FOLDER_ID_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/folders/([a-zA-Z0-9_-]+)").expect("folder id pattern is valid")
});

/// Pulls the folder id out of a Drive folder URL.
pub fn extract_folder_id(url: &str) -> Option<String> {
    FOLDER_ID_RE
        .captures(url)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
