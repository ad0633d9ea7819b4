use crate::core::config::Config;
use crate::core::model::BatchCopyResult;
use crate::core::progress::{ProgressEvent, ProgressKind, ProgressReporter};
use crate::services::copier::CopyEngine;
use crate::services::drive::StorageConnector;
use crate::utils::{extract_folder_id, lock_async_mutex, lock_mutex};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub type JobId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Running,
    Copying,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Running => "running",
            JobStatus::Copying => "copying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub batch_id: String,
    pub folders: Vec<String>,
    #[serde(skip)]
    pub token: String,
    pub status: JobStatus,
    pub progress: f64,
    pub completed_folders: usize,
    pub total_folders: usize,
    pub errors: Vec<String>,
    pub error: Option<String>,
    pub batch_folder_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub results: Option<BatchCopyResult>,
}

/// Fields to overwrite on a stored job. Unset fields are left alone.
#[derive(Debug, Clone, Default)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub progress: Option<f64>,
    pub completed_folders: Option<usize>,
    pub errors: Option<Vec<String>>,
    pub error: Option<String>,
    pub batch_folder_id: Option<String>,
    pub end_time: Option<DateTime<Utc>>,
    pub results: Option<BatchCopyResult>,
}

impl JobPatch {
    fn apply(self, job: &mut Job) {
        if let Some(status) = self.status {
            job.status = status;
        }
        if let Some(progress) = self.progress {
            job.progress = progress;
        }
        if let Some(completed) = self.completed_folders {
            job.completed_folders = completed;
        }
        if let Some(errors) = self.errors {
            job.errors = errors;
        }
        if let Some(error) = self.error {
            job.error = Some(error);
        }
        if let Some(id) = self.batch_folder_id {
            job.batch_folder_id = Some(id);
        }
        if let Some(end) = self.end_time {
            job.end_time = Some(end);
        }
        if let Some(results) = self.results {
            job.results = Some(results);
        }
    }
}

/// Push notification about a job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: f64,
    pub message: String,
    pub kind: ProgressKind,
    pub batch_folder_id: Option<String>,
}

pub trait IdSource: Send + Sync {
    fn next_id(&self) -> JobId;
}

/// Process-local counter starting at 1.
#[derive(Debug)]
pub struct SequentialIds(AtomicU64);

impl SequentialIds {
    pub fn new() -> Self {
        Self(AtomicU64::new(1))
    }
}

impl Default for SequentialIds {
    fn default() -> Self {
        Self::new()
    }
}

impl IdSource for SequentialIds {
    fn next_id(&self) -> JobId {
        self.0.fetch_add(1, Ordering::Relaxed)
    }
}

/// Progress while copying: 10 once the batch folder exists, 95 at most until
/// the job completes.
pub fn calculate_progress(completed: usize, total: usize) -> f64 {
    if total == 0 {
        return 10.0;
    }
    let ratio = completed.min(total) as f64 / total as f64;
    (10.0 + ratio * 85.0).min(95.0)
}

/// In-memory job registry.
pub struct JobStore {
    ids: Box<dyn IdSource>,
    jobs: Mutex<HashMap<JobId, Job>>,
}

impl JobStore {
    pub fn new(ids: Box<dyn IdSource>) -> Self {
        Self {
            ids,
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn create(&self, batch_id: &str, folders: Vec<String>, token: &str) -> Result<Job> {
        let job = Job {
            id: self.ids.next_id(),
            batch_id: batch_id.to_string(),
            total_folders: folders.len(),
            folders,
            token: token.to_string(),
            status: JobStatus::Created,
            progress: 0.0,
            completed_folders: 0,
            errors: Vec::new(),
            error: None,
            batch_folder_id: None,
            start_time: Utc::now(),
            end_time: None,
            results: None,
        };
        let mut jobs = lock_mutex(&self.jobs)?;
        if jobs.contains_key(&job.id) {
            anyhow::bail!("Job id {} is already taken", job.id);
        }
        jobs.insert(job.id, job.clone());
        Ok(job)
    }

    pub fn get(&self, id: JobId) -> Result<Option<Job>> {
        Ok(lock_mutex(&self.jobs)?.get(&id).cloned())
    }

    pub fn update(&self, id: JobId, patch: JobPatch) -> Result<Option<Job>> {
        let mut jobs = lock_mutex(&self.jobs)?;
        Ok(jobs.get_mut(&id).map(|job| {
            patch.apply(job);
            job.clone()
        }))
    }

    /// Moves a `Created` job to `Running` under one lock, so a job can only
    /// be started once.
    pub fn start(&self, id: JobId) -> Result<Job> {
        let mut jobs = lock_mutex(&self.jobs)?;
        let job = jobs
            .get_mut(&id)
            .with_context(|| format!("Job {} not found", id))?;
        if job.status != JobStatus::Created {
            anyhow::bail!("Job {} already {}", id, job.status.as_str());
        }
        job.status = JobStatus::Running;
        Ok(job.clone())
    }

    pub fn remove(&self, id: JobId) -> Result<Option<Job>> {
        Ok(lock_mutex(&self.jobs)?.remove(&id))
    }

    /// All jobs, oldest id first.
    pub fn list(&self) -> Result<Vec<Job>> {
        let mut jobs: Vec<Job> = lock_mutex(&self.jobs)?.values().cloned().collect();
        jobs.sort_by_key(|j| j.id);
        Ok(jobs)
    }

    /// Counts a finished top-level folder if `folder_completed`, then moves
    /// progress forward. Progress never goes back.
    fn record_progress(&self, id: JobId, folder_completed: bool) -> Result<Option<Job>> {
        let mut jobs = lock_mutex(&self.jobs)?;
        Ok(jobs.get_mut(&id).map(|job| {
            if folder_completed {
                job.completed_folders += 1;
            }
            let next = calculate_progress(job.completed_folders, job.total_folders);
            job.progress = job.progress.max(next);
            job.clone()
        }))
    }
}

impl Default for JobStore {
    fn default() -> Self {
        Self::new(Box::new(SequentialIds::new()))
    }
}

fn notify(tx: &Option<UnboundedSender<JobUpdate>>, update: JobUpdate) {
    if let Some(tx) = tx
        && let Err(e) = tx.send(update)
    {
        debug!("Job update for {} dropped: subscriber gone", e.0.job_id);
    }
}

#[derive(Clone)]
pub struct Coordinator {
    store: Arc<JobStore>,
    connector: Arc<dyn StorageConnector>,
    config: Arc<AsyncMutex<Config>>,
    updates_tx: Option<UnboundedSender<JobUpdate>>,
}

impl Coordinator {
    pub fn new(
        store: Arc<JobStore>,
        connector: Arc<dyn StorageConnector>,
        config: Arc<AsyncMutex<Config>>,
        updates_tx: Option<UnboundedSender<JobUpdate>>,
    ) -> Self {
        Self {
            store,
            connector,
            config,
            updates_tx,
        }
    }

    pub fn create_job(&self, batch_id: &str, folder_urls: Vec<String>, token: &str) -> Result<Job> {
        let job = self.store.create(batch_id, folder_urls, token)?;
        info!(
            "Created job {} for batch {} ({} folders)",
            job.id, job.batch_id, job.total_folders
        );
        Ok(job)
    }

    pub fn get_job(&self, id: JobId) -> Result<Option<Job>> {
        self.store.get(id)
    }

    pub fn update_job(&self, id: JobId, patch: JobPatch) -> Result<Option<Job>> {
        self.store.update(id, patch)
    }

    pub fn evict_job(&self, id: JobId) -> Result<Option<Job>> {
        let removed = self.store.remove(id)?;
        if let Some(job) = &removed {
            debug!("Evicted job {} ({})", job.id, job.status.as_str());
        }
        Ok(removed)
    }

    pub fn list_jobs(&self) -> Result<Vec<Job>> {
        self.store.list()
    }

    /// Runs the job on a detached task.
    pub fn spawn_job(&self, id: JobId) -> JoinHandle<Result<Job>> {
        let coord = self.clone();
        tokio::spawn(async move {
            let outcome = coord.run_job(id).await;
            if let Err(e) = &outcome {
                error!("Job {} could not run: {:#}", id, e);
            }
            outcome
        })
    }

    /// Runs a created job to completion and returns its final state.
    ///
    /// Copy failures end up on the job itself. `Err` means the job could not
    /// be found or its record could not be updated.
    pub async fn run_job(&self, id: JobId) -> Result<Job> {
        let job = self.store.start(id)?;
        info!("Job {} running", id);
        let config = lock_async_mutex(&self.config).await.clone();

        if let Err(e) = self.copy_batch(&job, &config).await {
            let message = format!("{:#}", e);
            error!("Job {} failed: {}", id, message);
            let failed = self.store.update(
                id,
                JobPatch {
                    status: Some(JobStatus::Failed),
                    error: Some(message.clone()),
                    end_time: Some(Utc::now()),
                    ..Default::default()
                },
            )?;
            notify(
                &self.updates_tx,
                JobUpdate {
                    job_id: id,
                    status: JobStatus::Failed,
                    progress: failed.as_ref().map(|j| j.progress).unwrap_or_default(),
                    message: format!("Copy failed: {}", message),
                    kind: ProgressKind::Error,
                    batch_folder_id: failed.as_ref().and_then(|j| j.batch_folder_id.clone()),
                },
            );
        }

        self.store
            .get(id)?
            .with_context(|| format!("Job {} disappeared while running", id))
    }

    async fn copy_batch(&self, job: &Job, config: &Config) -> Result<()> {
        let storage = self.connector.connect(&job.token)?;

        let batch_name = format!("{}{}", config.batch_folder_prefix, job.batch_id);
        let batch_folder = storage
            .create_folder(&batch_name, config.destination_parent_id.as_deref())
            .await
            .context("Failed to create batch folder")?;
        info!("Job {}: created batch folder {} ({})", job.id, batch_folder.name, batch_folder.id);

        self.store.update(
            job.id,
            JobPatch {
                status: Some(JobStatus::Copying),
                progress: Some(10.0),
                batch_folder_id: Some(batch_folder.id.clone()),
                ..Default::default()
            },
        )?;
        notify(
            &self.updates_tx,
            JobUpdate {
                job_id: job.id,
                status: JobStatus::Copying,
                progress: 10.0,
                message: format!("Created batch folder: {}", batch_folder.name),
                kind: ProgressKind::Info,
                batch_folder_id: None,
            },
        );

        let source_ids: Vec<Option<String>> = job
            .folders
            .iter()
            .map(|url| {
                let id = extract_folder_id(url);
                if id.is_none() {
                    warn!("Job {}: no folder id in {}", job.id, url);
                }
                id
            })
            .collect();

        let reporter = self.job_reporter(job.id);
        let engine = CopyEngine::new(storage, config);
        let results = engine
            .copy_many_folder_trees(&source_ids, &batch_folder.id, &reporter)
            .await;

        let message = format!(
            "Copy completed! {}/{} folders, {} files copied.",
            results.completed_folders, results.total_folders, results.total_files
        );
        self.store.update(
            job.id,
            JobPatch {
                status: Some(JobStatus::Completed),
                progress: Some(100.0),
                completed_folders: Some(results.completed_folders),
                errors: Some(results.errors.clone()),
                end_time: Some(Utc::now()),
                results: Some(results),
                ..Default::default()
            },
        )?;
        info!("Job {}: {}", job.id, message);
        notify(
            &self.updates_tx,
            JobUpdate {
                job_id: job.id,
                status: JobStatus::Completed,
                progress: 100.0,
                message,
                kind: ProgressKind::Success,
                batch_folder_id: Some(batch_folder.id),
            },
        );
        Ok(())
    }

    /// Forwards engine progress to the subscriber and keeps the job's
    /// counters current.
    fn job_reporter(&self, id: JobId) -> ProgressReporter {
        let store = self.store.clone();
        let tx = self.updates_tx.clone();
        ProgressReporter::from_fn(move |update| {
            let completed = matches!(update.event, ProgressEvent::FolderCompleted { .. });
            match store.record_progress(id, completed) {
                Ok(Some(job)) => notify(
                    &tx,
                    JobUpdate {
                        job_id: id,
                        status: job.status,
                        progress: job.progress,
                        message: update.message(),
                        kind: update.kind(),
                        batch_folder_id: None,
                    },
                ),
                Ok(None) => debug!("Progress for evicted job {} ignored", id),
                Err(e) => warn!("Could not record progress for job {}: {:#}", id, e),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::drive::RemoteStorage;

    struct Unreachable;

    impl StorageConnector for Unreachable {
        fn connect(&self, _token: &str) -> Result<Arc<dyn RemoteStorage>> {
            anyhow::bail!("Drive is unreachable")
        }
    }

    /// Hands out the same id every time.
    struct StuckIds;

    impl IdSource for StuckIds {
        fn next_id(&self) -> JobId {
            7
        }
    }

    fn coordinator(tx: Option<UnboundedSender<JobUpdate>>) -> Coordinator {
        Coordinator::new(
            Arc::new(JobStore::default()),
            Arc::new(Unreachable),
            Arc::new(AsyncMutex::new(Config::default())),
            tx,
        )
    }

    #[test]
    fn test_calculate_progress() {
        assert_eq!(calculate_progress(0, 4), 10.0);
        assert_eq!(calculate_progress(2, 4), 52.5);
        assert_eq!(calculate_progress(4, 4), 95.0);
        assert_eq!(calculate_progress(9, 4), 95.0);
        assert_eq!(calculate_progress(0, 0), 10.0);
    }

    #[test]
    fn test_sequential_ids_start_at_one() {
        let ids = SequentialIds::new();
        assert_eq!(ids.next_id(), 1);
        assert_eq!(ids.next_id(), 2);
    }

    #[test]
    fn test_create_and_get_job() -> Result<()> {
        let coord = coordinator(None);
        let job = coord.create_job("42", vec!["u1".into(), "u2".into()], "tok")?;
        assert_eq!(job.id, 1);
        assert_eq!(job.status, JobStatus::Created);
        assert_eq!(job.total_folders, 2);
        assert_eq!(job.progress, 0.0);

        let fetched = coord.get_job(job.id)?.expect("job exists");
        assert_eq!(fetched.batch_id, "42");
        assert!(coord.get_job(99)?.is_none());
        Ok(())
    }

    #[test]
    fn test_update_job_merges_fields() -> Result<()> {
        let coord = coordinator(None);
        let job = coord.create_job("1", vec![], "tok")?;

        let updated = coord
            .update_job(
                job.id,
                JobPatch {
                    progress: Some(40.0),
                    batch_folder_id: Some("b1".into()),
                    ..Default::default()
                },
            )?
            .expect("job exists");
        assert_eq!(updated.progress, 40.0);
        assert_eq!(updated.batch_folder_id.as_deref(), Some("b1"));
        assert_eq!(updated.status, JobStatus::Created);

        assert!(coord.update_job(123, JobPatch::default())?.is_none());
        Ok(())
    }

    #[test]
    fn test_evict_and_list() -> Result<()> {
        let coord = coordinator(None);
        let a = coord.create_job("a", vec![], "tok")?;
        let b = coord.create_job("b", vec![], "tok")?;

        let ids: Vec<JobId> = coord.list_jobs()?.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);

        assert!(coord.evict_job(a.id)?.is_some());
        assert!(coord.evict_job(a.id)?.is_none());
        assert_eq!(coord.list_jobs()?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_duplicate_ids_are_rejected() -> Result<()> {
        let store = JobStore::new(Box::new(StuckIds));
        store.create("a", vec![], "tok")?;
        assert!(store.create("b", vec![], "tok").is_err());
        Ok(())
    }

    #[test]
    fn test_token_is_not_serialized() -> Result<()> {
        let store = JobStore::default();
        let job = store.create("a", vec!["u".into()], "secret-token")?;
        let json = serde_json::to_string(&job)?;
        assert!(!json.contains("secret-token"));
        assert!(json.contains("\"batchId\":\"a\""));
        assert!(json.contains("\"status\":\"created\""));
        Ok(())
    }

    #[test]
    fn test_record_progress_is_monotonic() -> Result<()> {
        let store = JobStore::default();
        let job = store.create("a", vec!["x".into(), "y".into()], "tok")?;
        store.update(
            job.id,
            JobPatch {
                progress: Some(60.0),
                ..Default::default()
            },
        )?;

        // 10 + 1/2 * 85 = 52.5, below the current value
        let after = store.record_progress(job.id, true)?.expect("job exists");
        assert_eq!(after.completed_folders, 1);
        assert_eq!(after.progress, 60.0);

        let after = store.record_progress(job.id, true)?.expect("job exists");
        assert_eq!(after.progress, 95.0);
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_storage_fails_job() -> Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let coord = coordinator(Some(tx));
        let job = coord.create_job("5", vec!["u".into()], "tok")?;

        let finished = coord.run_job(job.id).await?;
        assert_eq!(finished.status, JobStatus::Failed);
        assert_eq!(finished.error.as_deref(), Some("Drive is unreachable"));
        assert_eq!(finished.progress, 0.0);
        assert!(finished.end_time.is_some());

        let update = rx.recv().await.expect("failure pushed");
        assert_eq!(update.status, JobStatus::Failed);
        assert_eq!(update.message, "Copy failed: Drive is unreachable");
        assert_eq!(update.kind, ProgressKind::Error);
        Ok(())
    }

    #[test]
    fn test_start_only_succeeds_once() -> Result<()> {
        let store = JobStore::default();
        let job = store.create("1", vec!["u".into()], "tok")?;

        assert_eq!(store.start(job.id)?.status, JobStatus::Running);
        let err = store.start(job.id).unwrap_err();
        assert_eq!(err.to_string(), "Job 1 already running");
        assert!(store.start(99).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_finished_job_is_not_run_again() -> Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let coord = coordinator(Some(tx));
        let job = coord.create_job("5", vec!["u".into()], "tok")?;
        let first = coord.run_job(job.id).await?;
        assert_eq!(first.status, JobStatus::Failed);
        rx.recv().await.expect("failure pushed");

        let err = coord.run_job(job.id).await.unwrap_err();
        assert_eq!(err.to_string(), format!("Job {} already failed", job.id));

        let after = coord.get_job(job.id)?.expect("job kept");
        assert_eq!(after.status, JobStatus::Failed);
        assert_eq!(after.end_time, first.end_time);
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_run_unknown_job() {
        let coord = coordinator(None);
        assert!(coord.run_job(404).await.is_err());
    }

    #[tokio::test]
    async fn test_closed_subscriber_does_not_affect_job() -> Result<()> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        drop(rx);
        let coord = coordinator(Some(tx));
        let job = coord.create_job("5", vec![], "tok")?;
        let finished = coord.spawn_job(job.id).await??;
        assert_eq!(finished.status, JobStatus::Failed);
        Ok(())
    }
}
