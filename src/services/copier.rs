use crate::core::config::Config;
use crate::core::model::{
    AccessCheck, BatchCopyResult, CopyResult, RemoteFile, RemoteFolder, partition_entries,
};
use crate::core::progress::{FolderSlot, ProgressEvent, ProgressReporter, ProgressUpdate};
use crate::services::drive::RemoteStorage;
use anyhow::{Context, Result};
use futures::future::{BoxFuture, join_all};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyLimits {
    /// Files copied together per batch inside one folder.
    pub file_batch_size: usize,
    /// Subfolders recursed into together per batch.
    pub subfolder_batch_size: usize,
    /// Top-level folders copied together per batch.
    pub folder_batch_size: usize,
    /// Remote calls in flight across the whole engine, at any depth.
    pub max_in_flight_requests: usize,
}

impl Default for CopyLimits {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for CopyLimits {
    fn from(config: &Config) -> Self {
        Self {
            file_batch_size: config.file_batch_size.max(1),
            subfolder_batch_size: config.subfolder_batch_size.max(1),
            folder_batch_size: config.folder_batch_size.max(1),
            max_in_flight_requests: config.max_in_flight_requests.max(1),
        }
    }
}

/// Recursively reproduces remote folder trees under a destination folder.
///
/// Within a folder, files are copied in sequential batches of
/// `file_batch_size` concurrent copies, then subfolders in sequential batches
/// of `subfolder_batch_size` concurrent recursive copies. Every remote call
/// also takes a permit from one engine-wide semaphore, so the number of
/// requests in flight stays bounded however deep or wide the tree is. A
/// permit is held for a single call only, never across recursion.
pub struct CopyEngine {
    storage: Arc<dyn RemoteStorage>,
    permits: Arc<Semaphore>,
    limits: CopyLimits,
}

impl CopyEngine {
    pub fn new(storage: Arc<dyn RemoteStorage>, config: &Config) -> Self {
        Self::with_limits(storage, CopyLimits::from(config))
    }

    pub fn with_limits(storage: Arc<dyn RemoteStorage>, limits: CopyLimits) -> Self {
        let limits = CopyLimits {
            file_batch_size: limits.file_batch_size.max(1),
            subfolder_batch_size: limits.subfolder_batch_size.max(1),
            folder_batch_size: limits.folder_batch_size.max(1),
            max_in_flight_requests: limits.max_in_flight_requests.max(1),
        };
        Self {
            storage,
            permits: Arc::new(Semaphore::new(limits.max_in_flight_requests)),
            limits,
        }
    }

    pub fn limits(&self) -> CopyLimits {
        self.limits
    }

    async fn throttled<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let _permit = self
            .permits
            .acquire()
            .await
            .context("Request limiter closed")?;
        call.await
    }

    /// Verifies the folder can be read and carries a name.
    ///
    /// Never fails: problems are classified into the returned check.
    pub async fn check_access(&self, folder_id: &str) -> AccessCheck {
        match self.throttled(self.storage.get_metadata(folder_id)).await {
            Ok(folder) if !folder.name.trim().is_empty() => AccessCheck::granted(folder),
            Ok(_) => AccessCheck::denied("Folder data is incomplete or corrupted"),
            Err(e) => {
                debug!("Access check failed for {}: {:#}", folder_id, e);
                AccessCheck::denied(&format!("{:#}", e))
            }
        }
    }

    /// Copies `source_id` and everything below it into `destination_parent_id`.
    ///
    /// Fails only when the source folder cannot be read or its copy cannot be
    /// created. Failures further down are recorded in the result's `errors`.
    pub fn copy_folder_tree<'a>(
        &'a self,
        source_id: &'a str,
        destination_parent_id: &'a str,
        progress: &'a ProgressReporter,
    ) -> BoxFuture<'a, Result<CopyResult>> {
        Box::pin(async move {
            let outcome = self
                .copy_tree_node(source_id, destination_parent_id, progress)
                .await;
            if let Err(e) = &outcome {
                progress.emit(ProgressEvent::TreeFailed {
                    folder_id: source_id.to_string(),
                    reason: format!("{:#}", e),
                });
            }
            outcome
        })
    }

    async fn copy_tree_node(
        &self,
        source_id: &str,
        destination_parent_id: &str,
        progress: &ProgressReporter,
    ) -> Result<CopyResult> {
        let source = self
            .throttled(self.storage.get_metadata(source_id))
            .await?;
        progress.emit(ProgressEvent::FolderProcessing {
            name: source.name.clone(),
        });

        let created = self
            .throttled(
                self.storage
                    .create_folder(&source.name, Some(destination_parent_id)),
            )
            .await?;
        progress.emit(ProgressEvent::FolderCreated {
            name: created.name.clone(),
        });

        let mut result = CopyResult::new(created.id.clone(), created.name.clone());

        let entries = match self.throttled(self.storage.list_children(source_id)).await {
            Ok(entries) => entries,
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!("Cannot list contents of {}: {}", source.name, reason);
                progress.emit(ProgressEvent::ListingFailed {
                    folder: source.name.clone(),
                    reason: reason.clone(),
                });
                result
                    .errors
                    .push(format!("Cannot access folder contents: {}", reason));
                return Ok(result);
            }
        };
        progress.emit(ProgressEvent::ItemsListed {
            folder: source.name.clone(),
            count: entries.len(),
        });

        let (files, folders) = partition_entries(entries);
        let dest_id = created.id.as_str();

        for batch in files.chunks(self.limits.file_batch_size) {
            let outcomes = join_all(
                batch
                    .iter()
                    .map(|file| self.copy_one_file(file, dest_id, progress)),
            )
            .await;
            for outcome in outcomes {
                match outcome {
                    Ok(()) => result.items_copied += 1,
                    Err(message) => result.errors.push(message),
                }
            }
        }

        for batch in folders.chunks(self.limits.subfolder_batch_size) {
            let outcomes = join_all(
                batch
                    .iter()
                    .map(|folder| self.copy_subfolder(folder, dest_id, progress)),
            )
            .await;
            for outcome in outcomes {
                match outcome {
                    Ok(child) => result.absorb_subfolder(child),
                    Err(message) => result.errors.push(message),
                }
            }
        }

        debug!(
            "Copied {} -> {}: {} files, {} subfolders, {} errors",
            source_id,
            result.folder_id,
            result.items_copied,
            result.subfolders,
            result.errors.len()
        );
        Ok(result)
    }

    async fn copy_one_file(
        &self,
        file: &RemoteFile,
        dest_id: &str,
        progress: &ProgressReporter,
    ) -> std::result::Result<(), String> {
        match self.throttled(self.storage.copy_file(&file.id, dest_id)).await {
            Ok(_) => {
                progress.emit(ProgressEvent::FileCopied {
                    name: file.name.clone(),
                });
                Ok(())
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                progress.emit(ProgressEvent::FileFailed {
                    name: file.name.clone(),
                    reason: reason.clone(),
                });
                Err(format!("Failed to copy {}: {}", file.name, reason))
            }
        }
    }

    async fn copy_subfolder(
        &self,
        folder: &RemoteFolder,
        dest_id: &str,
        progress: &ProgressReporter,
    ) -> std::result::Result<CopyResult, String> {
        progress.emit(ProgressEvent::SubfolderStarted {
            name: folder.name.clone(),
        });
        match self.copy_folder_tree(&folder.id, dest_id, progress).await {
            Ok(child) => Ok(child),
            Err(e) => {
                let reason = format!("{:#}", e);
                progress.emit(ProgressEvent::SubfolderFailed {
                    name: folder.name.clone(),
                    reason: reason.clone(),
                });
                Err(format!("Failed to copy subfolder {}: {}", folder.name, reason))
            }
        }
    }

    /// Copies several top-level folders into `destination_parent_id`.
    ///
    /// `None` ids (URLs without a folder id) fail their access check. One
    /// failing folder never stops the others. `folder_results` follow input
    /// order.
    pub async fn copy_many_folder_trees(
        &self,
        source_ids: &[Option<String>],
        destination_parent_id: &str,
        progress: &ProgressReporter,
    ) -> BatchCopyResult {
        let total = source_ids.len();
        let batch_size = self.limits.folder_batch_size;
        let mut results = BatchCopyResult::new(total);

        info!(
            "Copying {} top-level folders into {} ({} at a time)",
            total, destination_parent_id, batch_size
        );
        progress.emit(ProgressEvent::BatchStarted {
            total,
            concurrency: batch_size,
        });

        for (batch_no, batch) in source_ids.chunks(batch_size).enumerate() {
            let outcomes = join_all(batch.iter().enumerate().map(|(offset, id)| {
                let slot = FolderSlot {
                    index: batch_no * batch_size + offset + 1,
                    total,
                };
                self.copy_top_level(id.as_deref(), destination_parent_id, slot, progress)
            }))
            .await;

            for outcome in outcomes {
                match outcome {
                    Ok(result) => results.record_success(result),
                    Err(message) => results.record_failure(message),
                }
            }
        }

        info!(
            "Batch copy finished: {}/{} folders, {} files, {} subfolders, {} errors",
            results.completed_folders,
            results.total_folders,
            results.total_files,
            results.total_subfolders,
            results.errors.len()
        );
        progress.emit(ProgressEvent::BatchFinished {
            completed: results.completed_folders,
            total: results.total_folders,
            files: results.total_files,
            subfolders: results.total_subfolders,
        });

        results
    }

    async fn copy_top_level(
        &self,
        source_id: Option<&str>,
        destination_parent_id: &str,
        slot: FolderSlot,
        progress: &ProgressReporter,
    ) -> std::result::Result<CopyResult, String> {
        let progress = progress.scoped(slot);
        let label = source_id.unwrap_or("<unresolved>");
        progress.emit(ProgressEvent::FolderStarted {
            folder_id: label.to_string(),
        });

        let fail = |reason: String| {
            let event = ProgressEvent::FolderFailed { reason };
            let message = ProgressUpdate {
                slot: Some(slot),
                event: event.clone(),
            }
            .message();
            warn!("{}", message);
            progress.emit(event);
            message
        };

        let Some(source_id) = source_id else {
            let check = AccessCheck::denied("Folder not found: no folder id in the deliverable URL");
            return Err(fail(format!("{} (ID: {})", check.message, label)));
        };

        let check = self.check_access(source_id).await;
        if !check.has_access {
            return Err(fail(format!("{} (ID: {})", check.message, source_id)));
        }
        let name = check
            .folder
            .as_ref()
            .map(|f| f.name.clone())
            .unwrap_or_default();
        progress.emit(ProgressEvent::AccessVerified {
            name,
            detail: check.message.clone(),
        });

        match self
            .copy_folder_tree(source_id, destination_parent_id, &progress)
            .await
        {
            Ok(result) => {
                progress.emit(ProgressEvent::FolderCompleted {
                    name: result.folder_name.clone(),
                    files: result.items_copied,
                    subfolders: result.subfolders,
                });
                Ok(result)
            }
            Err(e) => Err(fail(format!("{:#}", e))),
        }
    }
}
