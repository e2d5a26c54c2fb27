//! Upload and restore pipelines for the vault.
//!
//! [`SyncCoordinator`] is the entry point: it turns a local file into a
//! sealed manifest of deduplicated chunks on the remote, restores manifests
//! back to disk with full verification, and deletes files whose chunks no
//! other file references. Chunk transfers from every job share one bounded
//! worker pool, and transient transport failures are retried with backoff.

pub mod config;
pub mod coordinator;
mod download;
pub mod error;
mod inflight;
pub mod job;
pub mod progress;
mod restore_path;
pub mod retry;
mod upload;

pub use config::{DEFAULT_CONCURRENCY, SyncConfig};
pub use coordinator::{DeleteReport, JobReport, SyncCoordinator, SyncEvent};
pub use error::SyncError;
pub use job::SyncJob;
pub use progress::RateMeter;
pub use retry::{RetryDecision, RetryPolicy};
