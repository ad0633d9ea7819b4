use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Registry, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

pub type LogHandle = reload::Handle<EnvFilter, Registry>;

pub const LOG_FILE_NAME: &str = "delivery-ops.log";

pub fn init(log_dir: &Path) -> (WorkerGuard, LogHandle) {
    let file_appender = tracing_appender::rolling::never(log_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .compact();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let (filter_layer, reload_handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(file_layer)
        .init();

    (guard, reload_handle)
}

/// Swaps the active filter for the persisted level. `RUST_LOG` wins when set.
pub fn apply_level(handle: &LogHandle, level: &str) {
    if std::env::var_os("RUST_LOG").is_some() {
        return;
    }
    match EnvFilter::try_new(level) {
        Ok(filter) => {
            if let Err(e) = handle.reload(filter) {
                tracing::error!("Failed to apply persisted log level '{}': {}", level, e);
            } else {
                tracing::info!("Applied persisted log level: {}", level);
            }
        }
        Err(e) => tracing::warn!("Ignoring invalid log level '{}': {}", level, e),
    }
}
