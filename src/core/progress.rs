use serde::{Deserialize, Serialize};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Info,
    Success,
    Error,
}

/// Something that happened while copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    // Batch level
    BatchStarted { total: usize, concurrency: usize },
    FolderStarted { folder_id: String },
    AccessVerified { name: String, detail: String },
    FolderCompleted { name: String, files: usize, subfolders: usize },
    FolderFailed { reason: String },
    BatchFinished { completed: usize, total: usize, files: usize, subfolders: usize },

    // Tree level
    FolderProcessing { name: String },
    FolderCreated { name: String },
    ItemsListed { folder: String, count: usize },
    ListingFailed { folder: String, reason: String },
    FileCopied { name: String },
    FileFailed { name: String, reason: String },
    SubfolderStarted { name: String },
    SubfolderFailed { name: String, reason: String },
    TreeFailed { folder_id: String, reason: String },
}

impl ProgressEvent {
    pub fn kind(&self) -> ProgressKind {
        match self {
            ProgressEvent::FolderCompleted { .. } | ProgressEvent::BatchFinished { .. } => {
                ProgressKind::Success
            }
            ProgressEvent::FolderFailed { .. }
            | ProgressEvent::ListingFailed { .. }
            | ProgressEvent::FileFailed { .. }
            | ProgressEvent::SubfolderFailed { .. }
            | ProgressEvent::TreeFailed { .. } => ProgressKind::Error,
            _ => ProgressKind::Info,
        }
    }

    pub fn message(&self) -> String {
        match self {
            ProgressEvent::BatchStarted { total, concurrency } => format!(
                "Starting parallel copy of {} folders with {} concurrent operations...",
                total, concurrency
            ),
            ProgressEvent::FolderStarted { folder_id } => format!("Starting folder: {}...", folder_id),
            ProgressEvent::AccessVerified { name, detail } => {
                format!("Processing: {} ({})", name, detail)
            }
            ProgressEvent::FolderCompleted { name, files, subfolders } => format!(
                "Completed: {} ({} files, {} subfolders)",
                name, files, subfolders
            ),
            ProgressEvent::FolderFailed { reason } => format!("Failed: {}", reason),
            ProgressEvent::BatchFinished { completed, total, files, subfolders } => format!(
                "Parallel copy complete! {}/{} folders, {} files, {} subfolders copied.",
                completed, total, files, subfolders
            ),
            ProgressEvent::FolderProcessing { name } => format!("Processing folder: {}", name),
            ProgressEvent::FolderCreated { name } => format!("Created folder: {}", name),
            ProgressEvent::ItemsListed { folder, count } => {
                format!("Found {} items in {}", count, folder)
            }
            ProgressEvent::ListingFailed { folder, reason } => {
                format!("Cannot list contents of {}: {}", folder, reason)
            }
            ProgressEvent::FileCopied { name } => format!("Copied: {}", name),
            ProgressEvent::FileFailed { name, reason } => {
                format!("Failed to copy {}: {}", name, reason)
            }
            ProgressEvent::SubfolderStarted { name } => format!("Copying subfolder: {}", name),
            ProgressEvent::SubfolderFailed { name, reason } => {
                format!("Failed to copy subfolder {}: {}", name, reason)
            }
            ProgressEvent::TreeFailed { folder_id, reason } => {
                format!("Failed to copy folder {}: {}", folder_id, reason)
            }
        }
    }
}

/// Position of a top-level folder inside a batch, 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FolderSlot {
    pub index: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub slot: Option<FolderSlot>,
    pub event: ProgressEvent,
}

impl ProgressUpdate {
    pub fn kind(&self) -> ProgressKind {
        self.event.kind()
    }

    pub fn message(&self) -> String {
        match self.slot {
            Some(slot) => format!("[{}/{}] {}", slot.index, slot.total, self.event.message()),
            None => self.event.message(),
        }
    }
}

pub type ProgressListener = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;

/// Best-effort delivery of progress updates.
///
/// Listeners run synchronously on the emitting task. A listener that panics
/// is logged and otherwise ignored.
#[derive(Clone)]
pub struct ProgressReporter {
    listener: Option<ProgressListener>,
    slot: Option<FolderSlot>,
}

impl ProgressReporter {
    pub fn new(listener: ProgressListener) -> Self {
        Self {
            listener: Some(listener),
            slot: None,
        }
    }

    pub fn noop() -> Self {
        Self {
            listener: None,
            slot: None,
        }
    }

    pub fn from_fn<F>(f: F) -> Self
    where
        F: Fn(&ProgressUpdate) + Send + Sync + 'static,
    {
        Self::new(Arc::new(f))
    }

    /// Same listener, with every update tagged as belonging to `slot`.
    pub fn scoped(&self, slot: FolderSlot) -> Self {
        Self {
            listener: self.listener.clone(),
            slot: Some(slot),
        }
    }

    pub fn emit(&self, event: ProgressEvent) {
        let Some(listener) = &self.listener else {
            return;
        };
        let update = ProgressUpdate {
            slot: self.slot,
            event,
        };
        if catch_unwind(AssertUnwindSafe(|| listener(&update))).is_err() {
            warn!("Progress listener panicked on: {}", update.message());
        }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::noop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_scoped_message_has_slot_prefix() {
        let update = ProgressUpdate {
            slot: Some(FolderSlot { index: 2, total: 5 }),
            event: ProgressEvent::FolderCompleted {
                name: "Deliverable".to_string(),
                files: 4,
                subfolders: 1,
            },
        };
        assert_eq!(
            update.message(),
            "[2/5] Completed: Deliverable (4 files, 1 subfolders)"
        );
        assert_eq!(update.kind(), ProgressKind::Success);
    }

    #[test]
    fn test_failure_events_are_errors() {
        let events = [
            ProgressEvent::FolderFailed { reason: "x".into() },
            ProgressEvent::FileFailed { name: "a".into(), reason: "x".into() },
            ProgressEvent::SubfolderFailed { name: "a".into(), reason: "x".into() },
            ProgressEvent::ListingFailed { folder: "a".into(), reason: "x".into() },
        ];
        for event in events {
            assert_eq!(event.kind(), ProgressKind::Error, "{:?}", event);
        }
        assert_eq!(
            ProgressEvent::FileCopied { name: "a".into() }.kind(),
            ProgressKind::Info
        );
    }

    #[test]
    fn test_reporter_delivers_with_scope() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = ProgressReporter::from_fn(move |u| {
            sink.lock().unwrap().push(u.message());
        });

        reporter.emit(ProgressEvent::FolderCreated { name: "root".into() });
        reporter
            .scoped(FolderSlot { index: 1, total: 3 })
            .emit(ProgressEvent::FileCopied { name: "a.txt".into() });

        let seen = seen.lock().unwrap();
        assert_eq!(seen[0], "Created folder: root");
        assert_eq!(seen[1], "[1/3] Copied: a.txt");
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let reporter = ProgressReporter::from_fn(|_| panic!("listener bug"));
        reporter.emit(ProgressEvent::FileCopied { name: "a".into() });
        // Reaching this line is the assertion.
    }

    #[test]
    fn test_noop_reporter() {
        ProgressReporter::noop().emit(ProgressEvent::FileCopied { name: "a".into() });
    }
}
