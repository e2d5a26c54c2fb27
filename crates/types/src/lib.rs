//! Shared data model for the TeleVault sync engine.
//!
//! Everything that crosses a crate boundary lives here: content digests,
//! chunk references, remote locators, file manifests, and the job state
//! machine types reported to the presentation layer.

pub mod category;
pub mod digest;
pub mod job;
pub mod manifest;

// Re-export primary types for convenience.
pub use category::FileCategory;
pub use digest::{DIGEST_LEN, Digest, DigestParseError};
pub use job::{ErrorClass, JobKind, JobOutcome, JobProgress, JobState};
pub use manifest::{ChunkRef, FileManifest, RemoteLocator, expected_chunk_count};
