//! Upload pipeline.
//!
//! A blocking reader task chunks the source into a bounded channel; the
//! consumer resolves each chunk against the index and hands misses to the
//! shared worker pool. Commits land in whatever order uploads finish.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use televault_chunker::{Chunk, ChunkError, Chunker};
use televault_types::{Digest, FileManifest, RemoteLocator};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::coordinator::Engine;
use crate::error::SyncError;
use crate::job::SyncJob;
use crate::retry::with_retry;

/// Messages from the reader task.
enum Produced {
    Chunk(Chunk),
    /// End of stream, with the whole-file digest.
    Done(Digest),
    Failed(ChunkError),
}

/// Outcome of one stored chunk: its length and whether this job issued the
/// `put`.
type Stored = (u64, bool);

/// Uploads every missing ordinal of `manifest` from `source`, then seals it.
///
/// The job must already be in `Chunking`.
pub(crate) async fn run_upload(
    engine: &Engine,
    job: &Arc<SyncJob>,
    manifest: FileManifest,
    source: PathBuf,
) -> Result<FileManifest, SyncError> {
    let file_id = manifest.id.clone();
    job.set_totals(manifest.size, manifest.chunk_count);

    let size = tokio::fs::metadata(&source).await?.len();
    if size != manifest.size {
        return Err(SyncError::SourceChanged {
            file_id,
            reason: format!("size is {size}, manifest records {}", manifest.size),
        });
    }

    // Resumes keep the chunk size the file was started with.
    let chunk_size = usize::try_from(manifest.chunk_size)
        .ok()
        .filter(|&c| c <= engine.transport.max_payload_size())
        .ok_or_else(|| {
            SyncError::InvalidConfig(format!(
                "chunk size {} of {file_id} exceeds transport payload limit",
                manifest.chunk_size
            ))
        })?;

    let (tx, mut rx) = mpsc::channel(engine.config.queue_depth());
    let producer = tokio::task::spawn_blocking(move || produce(source, chunk_size, tx));
    engine.set_state(job, televault_types::JobState::Uploading);

    let cancel = job.cancel_token();
    let mut tasks: JoinSet<Result<Stored, SyncError>> = JoinSet::new();
    let mut failure: Option<SyncError> = None;
    let mut file_digest = None;

    loop {
        while let Some(res) = tasks.try_join_next() {
            settle(engine, job, res, &mut failure);
        }
        if failure.is_some() || cancel.is_cancelled() {
            break;
        }

        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            msg = rx.recv() => msg,
        };
        let chunk = match msg {
            Some(Produced::Chunk(chunk)) => chunk,
            Some(Produced::Done(digest)) => {
                file_digest = Some(digest);
                break;
            }
            Some(Produced::Failed(e)) => {
                failure = Some(e.into());
                break;
            }
            None => {
                failure = Some(SyncError::Task("chunk reader stopped early".into()));
                break;
            }
        };

        if let Err(e) = check_chunk(&manifest, &chunk) {
            failure = Some(e);
            break;
        }

        // Committed by an earlier attempt.
        if manifest.chunk(chunk.ordinal).is_some() {
            job.record_skipped(chunk.len() as u64);
            engine.emit_progress(job);
            continue;
        }

        match engine.index.lookup_digest(&chunk.digest) {
            Ok(Some(locator)) => {
                if let Err(e) = engine.index.commit_chunk(&file_id, chunk.chunk_ref(), locator) {
                    failure = Some(e.into());
                    break;
                }
                debug!(file_id = %file_id, ordinal = chunk.ordinal, digest = %chunk.digest.short(), "dedup hit");
                job.record_skipped(chunk.len() as u64);
                engine.emit_progress(job);
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                failure = Some(e.into());
                break;
            }
        }

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            permit = Arc::clone(&engine.pool).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    failure = Some(SyncError::Task("worker pool closed".into()));
                    break;
                }
            },
        };

        let engine = engine.clone();
        let file_id = file_id.clone();
        let cancel = cancel.clone();
        tasks.spawn(async move {
            let _permit = permit;
            store_chunk(&engine, &file_id, chunk, &cancel).await
        });
    }

    // Stop the reader and let in-flight uploads finish and commit.
    drop(rx);
    while let Some(res) = tasks.join_next().await {
        settle(engine, job, res, &mut failure);
    }
    if let Err(e) = producer.await
        && failure.is_none()
    {
        failure = Some(e.into());
    }

    if let Some(e) = failure {
        return Err(e);
    }
    if cancel.is_cancelled() {
        return Err(SyncError::Cancelled);
    }
    let digest =
        file_digest.ok_or_else(|| SyncError::Task("chunk reader ended without digest".into()))?;

    engine.set_state(job, televault_types::JobState::Committing);
    let sealed = engine.index.complete_file(&file_id, digest)?;
    Ok(sealed)
}

/// Reader task body: chunks `source` until EOF, error, or the consumer
/// hangs up.
fn produce(source: PathBuf, chunk_size: usize, tx: mpsc::Sender<Produced>) {
    let mut chunker = match Chunker::open(&source, chunk_size) {
        Ok(chunker) => chunker,
        Err(e) => {
            let _ = tx.blocking_send(Produced::Failed(e));
            return;
        }
    };
    loop {
        let msg = match chunker.next_chunk() {
            Ok(Some(chunk)) => Produced::Chunk(chunk),
            Ok(None) => match chunker.file_digest() {
                Some(digest) => Produced::Done(digest),
                None => return,
            },
            Err(e) => Produced::Failed(e),
        };
        let last = !matches!(msg, Produced::Chunk(_));
        if tx.blocking_send(msg).is_err() || last {
            return;
        }
    }
}

/// Rejects chunks that disagree with the manifest: the source changed
/// since the file was registered.
fn check_chunk(manifest: &FileManifest, chunk: &Chunk) -> Result<(), SyncError> {
    let changed = |reason: String| SyncError::SourceChanged {
        file_id: manifest.id.clone(),
        reason,
    };
    if chunk.ordinal >= manifest.chunk_count {
        return Err(changed(format!(
            "read chunk {} but manifest has {}",
            chunk.ordinal, manifest.chunk_count
        )));
    }
    let expected = if chunk.ordinal + 1 < manifest.chunk_count {
        manifest.chunk_size
    } else {
        manifest.size - u64::from(chunk.ordinal) * manifest.chunk_size
    };
    if chunk.len() as u64 != expected {
        return Err(changed(format!(
            "chunk {} is {} bytes, expected {expected}",
            chunk.ordinal,
            chunk.len()
        )));
    }
    if let Some(existing) = manifest.chunk(chunk.ordinal)
        && existing.digest != chunk.digest
    {
        return Err(changed(format!(
            "chunk {} no longer matches committed content",
            chunk.ordinal
        )));
    }
    Ok(())
}

/// Stores one chunk (or joins an identical upload already running) and
/// commits it to the file.
async fn store_chunk(
    engine: &Engine,
    file_id: &str,
    chunk: Chunk,
    cancel: &CancellationToken,
) -> Result<Stored, SyncError> {
    let chunk_ref = chunk.chunk_ref();
    let issued = AtomicBool::new(false);

    let locator = {
        let chunk = &chunk;
        let issued = &issued;
        engine
            .inflight
            .get_or_put(chunk.digest, move || async move {
                // Another job may have committed this digest since the
                // consumer looked.
                if let Some(locator) = engine.index.lookup_digest(&chunk.digest)? {
                    return Ok(locator);
                }
                issued.store(true, Ordering::SeqCst);
                let locator: RemoteLocator = with_retry(
                    &engine.config.retry,
                    engine.transport.as_ref(),
                    cancel,
                    "put",
                    || engine.transport.put(&chunk.digest, &chunk.data),
                )
                .await?;
                // Commit before leaving the in-flight table so later
                // lookups find the locator.
                engine
                    .index
                    .commit_chunk(file_id, chunk_ref, locator.clone())?;
                Ok::<RemoteLocator, SyncError>(locator)
            })
            .await?
    };

    engine.index.commit_chunk(file_id, chunk_ref, locator)?;
    let issued = issued.load(Ordering::SeqCst);
    debug!(
        file_id,
        ordinal = chunk_ref.ordinal,
        digest = %chunk_ref.digest.short(),
        uploaded = issued,
        "chunk committed"
    );
    Ok((chunk_ref.length, issued))
}

fn settle(
    engine: &Engine,
    job: &SyncJob,
    res: Result<Result<Stored, SyncError>, JoinError>,
    failure: &mut Option<SyncError>,
) {
    match res {
        Ok(Ok((bytes, true))) => job.record_chunk(bytes),
        Ok(Ok((bytes, false))) => job.record_skipped(bytes),
        Ok(Err(e)) => {
            warn!(job_id = %job.id(), error = %e, "chunk upload failed");
            failure.get_or_insert(e);
        }
        Err(e) => {
            failure.get_or_insert(e.into());
        }
    }
    engine.emit_progress(job);
}
