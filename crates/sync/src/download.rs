//! Restore pipeline.
//!
//! Chunks are fetched through the worker pool with at most `concurrency`
//! requests outstanding; `buffered` hands them back in ordinal order, so the
//! reorder window never exceeds the concurrency limit. Output goes to a
//! hidden `.part` file that is renamed into place only after the whole-file
//! digest checks out.

use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use futures_util::stream;
use televault_chunker::{StreamDigest, digest_bytes};
use televault_types::{ChunkRef, Digest, FileManifest, JobState, RemoteLocator};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::coordinator::Engine;
use crate::error::SyncError;
use crate::job::SyncJob;
use crate::restore_path::{place_unique, validate_restore_name};
use crate::retry::with_retry;

/// Restores `file_id` into `dest_dir`. Returns the path written.
///
/// The job must already be in `Fetching`.
pub(crate) async fn run_restore(
    engine: &Engine,
    job: &SyncJob,
    file_id: &str,
    dest_dir: &Path,
) -> Result<PathBuf, SyncError> {
    let manifest = engine.index.read_manifest(file_id)?;
    let expected = match manifest.file_digest {
        Some(digest) if manifest.is_complete() => digest,
        _ => {
            return Err(SyncError::Incomplete {
                file_id: file_id.to_string(),
                missing: manifest.missing_ordinals().len(),
            });
        }
    };
    validate_restore_name(&manifest.name)?;
    let chunks = engine.index.chunk_locators(file_id)?;
    job.set_totals(manifest.size, manifest.chunk_count);

    tokio::fs::create_dir_all(dest_dir).await?;
    let part = dest_dir.join(format!(".{}.{}.part", manifest.name, job.id()));

    engine.set_state(job, JobState::Reassembling);
    let result = match reassemble(engine, job, &manifest, chunks, &part).await {
        Ok(actual) => {
            engine.set_state(job, JobState::Verifying);
            verify(&manifest, expected, actual, dest_dir, &part).await
        }
        Err(e) => Err(e),
    };

    if result.is_err()
        && let Err(e) = tokio::fs::remove_file(&part).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        warn!(path = ?part, error = %e, "could not remove partial restore");
    }
    result
}

/// Fetches every chunk in order into `part` and returns the digest of what
/// was written.
async fn reassemble(
    engine: &Engine,
    job: &SyncJob,
    manifest: &FileManifest,
    chunks: Vec<(ChunkRef, RemoteLocator)>,
    part: &Path,
) -> Result<Digest, SyncError> {
    let cancel = job.cancel_token();
    let mut out = tokio::fs::File::create(part).await?;
    let mut whole = StreamDigest::new();

    let file_id: &str = &manifest.id;
    let cancel_ref = &cancel;
    let mut fetches = stream::iter(chunks)
        .map(move |(chunk, locator)| fetch_chunk(engine, file_id, chunk, locator, cancel_ref))
        .buffered(engine.config.concurrency);

    while let Some(res) = fetches.next().await {
        let (chunk, data) = res?;
        out.write_all(&data).await?;
        whole.update(&data);
        job.record_chunk(chunk.length);
        engine.emit_progress(job);
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
    }
    out.flush().await?;
    out.sync_all().await?;

    if whole.len() != manifest.size {
        return Err(SyncError::Integrity {
            file_id: manifest.id.clone(),
            detail: format!("wrote {} bytes, expected {}", whole.len(), manifest.size),
        });
    }
    Ok(whole.finalize())
}

/// Checks the whole-file digest and moves the output into place.
async fn verify(
    manifest: &FileManifest,
    expected: Digest,
    actual: Digest,
    dest_dir: &Path,
    part: &Path,
) -> Result<PathBuf, SyncError> {
    if actual != expected {
        return Err(SyncError::Integrity {
            file_id: manifest.id.clone(),
            detail: format!(
                "file digest {} does not match manifest {}",
                actual.short(),
                expected.short()
            ),
        });
    }
    let dest = place_unique(part, dest_dir, &manifest.name).await?;
    debug!(file_id = %manifest.id, path = ?dest, "restored file");
    Ok(dest)
}

async fn fetch_chunk(
    engine: &Engine,
    file_id: &str,
    chunk: ChunkRef,
    locator: RemoteLocator,
    cancel: &CancellationToken,
) -> Result<(ChunkRef, Vec<u8>), SyncError> {
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    let _permit = engine
        .pool
        .acquire()
        .await
        .map_err(|_| SyncError::Task("worker pool closed".into()))?;

    let data = with_retry(
        &engine.config.retry,
        engine.transport.as_ref(),
        cancel,
        "get",
        || engine.transport.get(&locator),
    )
    .await?;

    if data.len() as u64 != chunk.length || digest_bytes(&data) != chunk.digest {
        return Err(SyncError::Integrity {
            file_id: file_id.to_string(),
            detail: format!("chunk {} does not match its digest", chunk.ordinal),
        });
    }
    debug!(file_id, ordinal = chunk.ordinal, bytes = data.len(), "chunk fetched");
    Ok((chunk, data))
}
