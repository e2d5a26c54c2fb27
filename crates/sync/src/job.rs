//! Per-file unit of work.

use std::sync::RwLock;
use std::time::Instant;

use televault_types::{ErrorClass, JobKind, JobProgress, JobState};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::progress::RateMeter;

/// Tracks one upload or restore (thread-safe).
///
/// Jobs live only in memory. After a restart, unfinished uploads are found
/// again through the index.
pub struct SyncJob {
    inner: RwLock<JobInner>,
    cancel: CancellationToken,
    meter: RateMeter,
}

struct JobInner {
    id: String,
    file_id: String,
    kind: JobKind,
    state: JobState,
    total_bytes: u64,
    done_bytes: u64,
    /// Bytes actually moved over the network.
    sent_bytes: u64,
    total_chunks: u32,
    done_chunks: u32,
    skipped_chunks: u32,
    error: Option<(ErrorClass, String)>,
    started_at: Instant,
    finished_at: Option<Instant>,
}

impl SyncJob {
    /// Creates a pending job.
    pub fn new(
        id: impl Into<String>,
        file_id: impl Into<String>,
        kind: JobKind,
        cancel: CancellationToken,
    ) -> Self {
        let meter = RateMeter::default();
        meter.record(0);
        Self {
            inner: RwLock::new(JobInner {
                id: id.into(),
                file_id: file_id.into(),
                kind,
                state: JobState::Pending,
                total_bytes: 0,
                done_bytes: 0,
                sent_bytes: 0,
                total_chunks: 0,
                done_chunks: 0,
                skipped_chunks: 0,
                error: None,
                started_at: Instant::now(),
                finished_at: None,
            }),
            cancel,
            meter,
        }
    }

    pub fn id(&self) -> String {
        self.inner.read().unwrap().id.clone()
    }

    pub fn file_id(&self) -> String {
        self.inner.read().unwrap().file_id.clone()
    }

    pub fn kind(&self) -> JobKind {
        self.inner.read().unwrap().kind
    }

    pub fn state(&self) -> JobState {
        self.inner.read().unwrap().state
    }

    /// Moves to `next` if the state machine allows it.
    ///
    /// Returns `false` (and changes nothing) for an illegal transition.
    pub fn transition(&self, next: JobState) -> bool {
        let mut s = self.inner.write().unwrap();
        if !s.state.can_transition(s.kind, next) {
            debug!(job_id = %s.id, from = ?s.state, to = ?next, "rejected state transition");
            return false;
        }
        debug!(job_id = %s.id, from = ?s.state, to = ?next, "job state");
        s.state = next;
        if next.is_terminal() {
            s.finished_at = Some(Instant::now());
        }
        true
    }

    /// Marks the job failed with a classified reason.
    pub fn fail(&self, class: ErrorClass, reason: &str) -> bool {
        {
            let mut s = self.inner.write().unwrap();
            s.error = Some((class, reason.to_string()));
        }
        self.transition(JobState::Failed)
    }

    /// Sets byte and chunk totals.
    pub fn set_totals(&self, bytes: u64, chunks: u32) {
        let mut s = self.inner.write().unwrap();
        s.total_bytes = bytes;
        s.total_chunks = chunks;
    }

    /// Records a chunk moved over the network.
    pub fn record_chunk(&self, bytes: u64) {
        let sent = {
            let mut s = self.inner.write().unwrap();
            s.done_bytes += bytes;
            s.sent_bytes += bytes;
            s.done_chunks += 1;
            s.sent_bytes
        };
        self.meter.record(sent);
    }

    /// Records a chunk that needed no transfer (dedup hit or already
    /// committed).
    pub fn record_skipped(&self, bytes: u64) {
        let mut s = self.inner.write().unwrap();
        s.done_bytes += bytes;
        s.done_chunks += 1;
        s.skipped_chunks += 1;
    }

    pub fn error(&self) -> Option<(ErrorClass, String)> {
        self.inner.read().unwrap().error.clone()
    }

    /// Requests cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns `true` until the job reaches a terminal state.
    pub fn is_active(&self) -> bool {
        !self.state().is_terminal()
    }

    /// Time since creation, or total run time once finished.
    pub fn elapsed(&self) -> std::time::Duration {
        let s = self.inner.read().unwrap();
        s.finished_at
            .unwrap_or_else(Instant::now)
            .duration_since(s.started_at)
    }

    /// Snapshot for presentation.
    pub fn progress(&self) -> JobProgress {
        let s = self.inner.read().unwrap();
        let eta = if s.state.is_terminal() {
            None
        } else {
            self.meter.eta(s.total_bytes.saturating_sub(s.done_bytes))
        };
        JobProgress {
            job_id: s.id.clone(),
            file_id: s.file_id.clone(),
            kind: s.kind,
            state: s.state,
            total_bytes: s.total_bytes,
            done_bytes: s.done_bytes,
            total_chunks: s.total_chunks,
            done_chunks: s.done_chunks,
            skipped_chunks: s.skipped_chunks,
            bytes_per_second: self.meter.bytes_per_second(),
            eta_secs: eta.map(|d| d.as_secs_f64().ceil() as u64),
            error: s.error.as_ref().map(|(_, reason)| reason.clone()),
        }
    }
}
