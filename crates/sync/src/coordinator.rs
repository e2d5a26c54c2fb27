//! Sync coordinator.
//!
//! Owns job lifetimes: registers one job per file, drives the upload and
//! restore pipelines, records failures on the job, and streams progress
//! events to the presentation layer. All jobs share one worker pool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use televault_index::IndexStore;
use televault_transport::{ErrorKind, RemoteTransport};
use televault_types::{FileManifest, JobKind, JobOutcome, JobProgress, JobState};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace, warn};

use crate::config::SyncConfig;
use crate::download::run_restore;
use crate::error::SyncError;
use crate::inflight::InFlightPuts;
use crate::job::SyncJob;
use crate::retry::with_retry;
use crate::upload::run_upload;

/// Events emitted while jobs run.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    StateChanged {
        job_id: String,
        file_id: String,
        state: JobState,
    },
    Progress(JobProgress),
    Finished(JobReport),
}

/// Final result of a job.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_id: String,
    pub file_id: String,
    pub outcome: JobOutcome,
    pub progress: JobProgress,
    /// Where a successful restore was written.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restored_to: Option<PathBuf>,
}

impl JobReport {
    pub fn is_complete(&self) -> bool {
        matches!(self.outcome, JobOutcome::Complete { .. })
    }
}

/// Result of deleting a file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReport {
    pub file_id: String,
    /// Remote blobs deleted.
    pub removed: usize,
    /// Orphaned blobs the remote had already dropped.
    pub already_gone: usize,
    /// Orphaned blobs that could not be deleted and stay on the remote.
    pub failed: usize,
}

/// Shared handles every pipeline task needs.
#[derive(Clone)]
pub(crate) struct Engine {
    pub(crate) index: Arc<dyn IndexStore>,
    pub(crate) transport: Arc<dyn RemoteTransport>,
    pub(crate) config: Arc<SyncConfig>,
    pub(crate) pool: Arc<Semaphore>,
    pub(crate) inflight: Arc<InFlightPuts>,
    events_tx: mpsc::Sender<SyncEvent>,
}

impl Engine {
    fn emit(&self, event: SyncEvent) {
        // Progress is advisory; a slow or absent listener never stalls a job.
        if let Err(e) = self.events_tx.try_send(event) {
            trace!("dropped sync event: {e}");
        }
    }

    pub(crate) fn emit_progress(&self, job: &SyncJob) {
        self.emit(SyncEvent::Progress(job.progress()));
    }

    /// Moves `job` to `state` and announces it.
    pub(crate) fn set_state(&self, job: &SyncJob, state: JobState) -> bool {
        if !job.transition(state) {
            return false;
        }
        self.emit(SyncEvent::StateChanged {
            job_id: job.id(),
            file_id: job.file_id(),
            state,
        });
        true
    }
}

/// Runs uploads, restores and deletions against one index and transport.
pub struct SyncCoordinator {
    engine: Engine,
    events_rx: Option<mpsc::Receiver<SyncEvent>>,
    /// Active jobs by file id.
    jobs: Mutex<HashMap<String, Arc<SyncJob>>>,
    shutdown: CancellationToken,
}

/// Removes a job from the active table when dropped.
struct ActiveJob<'a> {
    jobs: &'a Mutex<HashMap<String, Arc<SyncJob>>>,
    job: Arc<SyncJob>,
}

impl Drop for ActiveJob<'_> {
    fn drop(&mut self) {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs
            .get(&self.job.file_id())
            .is_some_and(|j| Arc::ptr_eq(j, &self.job))
        {
            jobs.remove(&self.job.file_id());
        }
    }
}

impl SyncCoordinator {
    /// Creates a coordinator. Fails if `config` does not fit the transport.
    pub fn new(
        index: Arc<dyn IndexStore>,
        transport: Arc<dyn RemoteTransport>,
        config: SyncConfig,
    ) -> Result<Self, SyncError> {
        config.validate(transport.max_payload_size())?;
        let (events_tx, events_rx) = mpsc::channel(256);
        Ok(Self {
            engine: Engine {
                index,
                transport,
                pool: Arc::new(Semaphore::new(config.concurrency)),
                config: Arc::new(config),
                inflight: Arc::new(InFlightPuts::default()),
                events_tx,
            },
            events_rx: Some(events_rx),
            jobs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.events_rx.take()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.engine.config
    }

    pub fn index(&self) -> &Arc<dyn IndexStore> {
        &self.engine.index
    }

    /// Token that cancels every current and future job.
    pub fn cancel_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Progress of every running job.
    pub fn active_jobs(&self) -> Vec<JobProgress> {
        self.jobs
            .lock()
            .unwrap()
            .values()
            .map(|j| j.progress())
            .collect()
    }

    /// Requests cancellation of a running job.
    pub fn cancel(&self, job_id: &str) -> Result<(), SyncError> {
        let jobs = self.jobs.lock().unwrap();
        let job = jobs
            .values()
            .find(|j| j.id() == job_id)
            .ok_or_else(|| SyncError::UnknownJob(job_id.to_string()))?;
        info!(job_id, file_id = %job.file_id(), "cancelling job");
        job.cancel();
        Ok(())
    }

    /// Uploads a local file as a new vault entry.
    pub async fn upload(&self, path: &Path) -> Result<JobReport, SyncError> {
        let meta = tokio::fs::metadata(path).await?;
        if !meta.is_file() {
            return Err(SyncError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", path.display()),
            )));
        }
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                SyncError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("{} has no usable file name", path.display()),
                ))
            })?
            .to_string();
        let source = tokio::fs::canonicalize(path).await?;

        let file_id = uuid::Uuid::new_v4().to_string();
        let chunk_size = self.engine.config.chunk_size;
        let manifest = FileManifest::skeleton(
            file_id.clone(),
            name,
            meta.len(),
            chunk_size as u64,
            Some(source.to_string_lossy().into_owned()),
        )
        .ok_or(televault_chunker::ChunkError::TooManyChunks(chunk_size))?;

        let active = self.register(&file_id, JobKind::Upload)?;
        let job = Arc::clone(&active.job);
        info!(job_id = %job.id(), file_id = %file_id, name = %manifest.name, size = manifest.size, "upload started");

        let result = async {
            self.engine.set_state(&job, JobState::Chunking);
            self.engine.index.begin_file(manifest.clone())?;
            run_upload(&self.engine, &job, manifest, source).await
        }
        .await;
        Ok(self.finish(&job, result.map(|_| None)))
    }

    /// Continues an unfinished upload from its recorded source path.
    ///
    /// Chunks committed by earlier attempts are not uploaded again.
    pub async fn resume(&self, file_id: &str) -> Result<JobReport, SyncError> {
        let active = self.register(file_id, JobKind::Upload)?;
        let job = Arc::clone(&active.job);

        let result = async {
            self.engine.set_state(&job, JobState::Chunking);
            let manifest = self.engine.index.read_manifest(file_id)?;
            let source = manifest
                .source_path
                .clone()
                .map(PathBuf::from)
                .ok_or_else(|| SyncError::NoSource(file_id.to_string()))?;
            info!(
                job_id = %job.id(),
                file_id,
                missing = manifest.missing_ordinals().len(),
                "resuming upload"
            );

            if manifest.is_complete() {
                // Nothing left to send; walk the remaining states.
                self.engine.set_state(&job, JobState::Uploading);
                self.engine.set_state(&job, JobState::Committing);
                return Ok(None);
            }
            run_upload(&self.engine, &job, manifest, source)
                .await
                .map(|_| None)
        }
        .await;
        Ok(self.finish(&job, result))
    }

    /// Restores a complete file into `dest_dir`.
    ///
    /// An existing file with the same name is never overwritten; the
    /// restored copy gets a ` (N)` suffix instead.
    pub async fn restore(&self, file_id: &str, dest_dir: &Path) -> Result<JobReport, SyncError> {
        let active = self.register(file_id, JobKind::Restore)?;
        let job = Arc::clone(&active.job);
        info!(job_id = %job.id(), file_id, dest = ?dest_dir, "restore started");

        let result = async {
            self.engine.set_state(&job, JobState::Fetching);
            run_restore(&self.engine, &job, file_id, dest_dir)
                .await
                .map(Some)
        }
        .await;
        Ok(self.finish(&job, result))
    }

    /// Removes a file from the index and deletes remote chunks no other
    /// file references.
    pub async fn delete_file(&self, file_id: &str) -> Result<DeleteReport, SyncError> {
        if self.jobs.lock().unwrap().contains_key(file_id) {
            return Err(SyncError::JobAlreadyActive(file_id.to_string()));
        }
        let orphans = self.engine.index.remove_file(file_id)?;
        let mut report = DeleteReport {
            file_id: file_id.to_string(),
            ..DeleteReport::default()
        };

        for locator in &orphans {
            let result = with_retry(
                &self.engine.config.retry,
                self.engine.transport.as_ref(),
                &self.shutdown,
                "delete",
                || self.engine.transport.delete(locator),
            )
            .await;
            match result {
                Ok(()) => report.removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => report.already_gone += 1,
                Err(e) => {
                    warn!(file_id, address = %locator.address, error = %e, "remote chunk left behind");
                    report.failed += 1;
                }
            }
        }
        info!(
            file_id,
            removed = report.removed,
            already_gone = report.already_gone,
            failed = report.failed,
            "file deleted"
        );
        Ok(report)
    }

    /// Unfinished uploads with no job currently running.
    pub fn pending_uploads(&self) -> Result<Vec<FileManifest>, SyncError> {
        let jobs = self.jobs.lock().unwrap();
        Ok(self
            .engine
            .index
            .incomplete_files()?
            .into_iter()
            .filter(|m| !jobs.contains_key(&m.id))
            .collect())
    }

    fn register(&self, file_id: &str, kind: JobKind) -> Result<ActiveJob<'_>, SyncError> {
        let mut jobs = self.jobs.lock().unwrap();
        if jobs.contains_key(file_id) {
            return Err(SyncError::JobAlreadyActive(file_id.to_string()));
        }
        let job = Arc::new(SyncJob::new(
            uuid::Uuid::new_v4().to_string(),
            file_id,
            kind,
            self.shutdown.child_token(),
        ));
        jobs.insert(file_id.to_string(), Arc::clone(&job));
        Ok(ActiveJob {
            jobs: &self.jobs,
            job,
        })
    }

    /// Settles a job in its terminal state and reports it.
    fn finish(&self, job: &SyncJob, result: Result<Option<PathBuf>, SyncError>) -> JobReport {
        let file_id = job.file_id();
        let (outcome, restored_to) = match result {
            Ok(path) => {
                self.engine.set_state(job, JobState::Complete);
                info!(job_id = %job.id(), file_id = %file_id, elapsed = ?job.elapsed(), "job complete");
                (
                    JobOutcome::Complete {
                        file_id: file_id.clone(),
                    },
                    path,
                )
            }
            Err(e) if job.is_cancelled() || matches!(e, SyncError::Cancelled) => {
                self.engine.set_state(job, JobState::Cancelled);
                info!(job_id = %job.id(), file_id = %file_id, "job cancelled");
                (JobOutcome::Cancelled, None)
            }
            Err(e) => {
                let class = e.class();
                let reason = e.to_string();
                error!(job_id = %job.id(), file_id = %file_id, ?class, error = %reason, "job failed");
                if job.fail(class, &reason) {
                    self.engine.emit(SyncEvent::StateChanged {
                        job_id: job.id(),
                        file_id: file_id.clone(),
                        state: JobState::Failed,
                    });
                }
                (JobOutcome::Failed { class, reason }, None)
            }
        };

        let report = JobReport {
            job_id: job.id(),
            file_id,
            outcome,
            progress: job.progress(),
            restored_to,
        };
        self.engine.emit(SyncEvent::Finished(report.clone()));
        report
    }
}
