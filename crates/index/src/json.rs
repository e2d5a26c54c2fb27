//! JSON-file backed index.
//!
//! The whole index lives in memory and is rewritten on every mutation: the
//! new state is built on a copy, written to `<path>.tmp` and flushed to
//! disk, renamed over the old file, and only then swapped in. A failed write
//! leaves both the file and the in-memory state as they were.
//!
//! Each commit costs one compact rewrite of the full document, so write
//! volume grows with the number of files and chunks indexed. That suits
//! vaults of thousands of files; a much larger index wants an append log.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use televault_types::{ChunkRef, Digest, FileManifest, RemoteLocator, expected_chunk_count};
use tracing::debug;

use crate::{IndexError, IndexStore};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Default)]
struct IndexState {
    files: BTreeMap<String, FileManifest>,
    cache: HashMap<Digest, RemoteLocator>,
}

/// On-disk layout.
#[derive(Serialize, Deserialize)]
struct IndexDocument {
    version: u32,
    files: Vec<FileManifest>,
    locators: Vec<RemoteLocator>,
}

/// Index persisted as a single JSON document.
pub struct JsonIndexStore {
    path: Option<PathBuf>,
    state: RwLock<IndexState>,
    /// Serializes mutations so clone-modify-persist-swap never interleaves.
    write_lock: Mutex<()>,
}

impl JsonIndexStore {
    /// Opens the index at `path`, loading it if the file exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, IndexError> {
        let path = path.into();
        let state = load_state(&path)?;
        Ok(Self {
            path: Some(path),
            state: RwLock::new(state),
            write_lock: Mutex::new(()),
        })
    }

    /// An index that is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(IndexState::default()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Applies `f` to a copy of the state, persists it, then publishes it.
    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut IndexState) -> Result<T, IndexError>,
    ) -> Result<T, IndexError> {
        let _guard = self.write_lock.lock().unwrap();
        let mut next = self.state.read().unwrap().clone();
        let out = f(&mut next)?;
        self.persist(&next)?;
        *self.state.write().unwrap() = next;
        Ok(out)
    }

    fn persist(&self, state: &IndexState) -> Result<(), IndexError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let doc = IndexDocument {
            version: FORMAT_VERSION,
            files: state.files.values().cloned().collect(),
            locators: state.cache.values().cloned().collect(),
        };
        let json = serde_json::to_vec(&doc)?;
        write_durable(path, &json)?;
        debug!(
            files = doc.files.len(),
            locators = doc.locators.len(),
            "persisted index to {:?}",
            path
        );
        Ok(())
    }
}

/// Replaces `path` with `data` so that a crash leaves either the old or the
/// new contents on disk, never a truncated file.
fn write_durable(path: &Path, data: &[u8]) -> Result<(), IndexError> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path(path);
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;

    // Make the rename itself durable.
    #[cfg(unix)]
    {
        let dir = parent.unwrap_or_else(|| Path::new("."));
        std::fs::File::open(dir)?.sync_all()?;
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn load_state(path: &Path) -> Result<IndexState, IndexError> {
    if !path.exists() {
        return Ok(IndexState::default());
    }
    let data = std::fs::read_to_string(path)?;
    let doc: IndexDocument = serde_json::from_str(&data)?;
    debug!(
        files = doc.files.len(),
        locators = doc.locators.len(),
        "loaded index from {:?}",
        path
    );
    Ok(IndexState {
        files: doc.files.into_iter().map(|m| (m.id.clone(), m)).collect(),
        cache: doc.locators.into_iter().map(|l| (l.digest, l)).collect(),
    })
}

/// Length the chunk at `ordinal` must have.
fn expected_length(manifest: &FileManifest, ordinal: u32) -> u64 {
    if ordinal + 1 < manifest.chunk_count {
        manifest.chunk_size
    } else {
        manifest.size - u64::from(ordinal) * manifest.chunk_size
    }
}

fn invalid_manifest(manifest: &FileManifest, reason: impl Into<String>) -> IndexError {
    IndexError::InvalidManifest {
        file_id: manifest.id.clone(),
        reason: reason.into(),
    }
}

impl IndexStore for JsonIndexStore {
    fn begin_file(&self, manifest: FileManifest) -> Result<(), IndexError> {
        if manifest.id.is_empty() {
            return Err(invalid_manifest(&manifest, "empty id"));
        }
        if expected_chunk_count(manifest.size, manifest.chunk_size) != Some(manifest.chunk_count) {
            return Err(invalid_manifest(&manifest, "chunk count does not match size"));
        }
        if !manifest.chunks.is_empty() || manifest.completed_at.is_some() {
            return Err(invalid_manifest(&manifest, "not a skeleton"));
        }

        self.mutate(|state| {
            if state.files.contains_key(&manifest.id) {
                return Err(IndexError::DuplicateFile(manifest.id.clone()));
            }
            debug!(file_id = %manifest.id, chunks = manifest.chunk_count, "registered file");
            state.files.insert(manifest.id.clone(), manifest);
            Ok(())
        })
    }

    fn lookup_digest(&self, digest: &Digest) -> Result<Option<RemoteLocator>, IndexError> {
        Ok(self.state.read().unwrap().cache.get(digest).cloned())
    }

    fn commit_chunk(
        &self,
        file_id: &str,
        chunk: ChunkRef,
        locator: RemoteLocator,
    ) -> Result<(), IndexError> {
        let invalid = |reason: String| IndexError::InvalidChunk {
            file_id: file_id.to_string(),
            ordinal: chunk.ordinal,
            reason,
        };
        if locator.digest != chunk.digest {
            return Err(invalid(format!(
                "locator digest {} does not match chunk digest {}",
                locator.digest.short(),
                chunk.digest.short()
            )));
        }

        // Idempotent re-commit needs no write.
        {
            let state = self.state.read().unwrap();
            let manifest = state
                .files
                .get(file_id)
                .ok_or_else(|| IndexError::UnknownFile(file_id.to_string()))?;
            if let Some(existing) = manifest.chunk(chunk.ordinal)
                && existing.digest == chunk.digest
                && state.cache.contains_key(&chunk.digest)
            {
                return Ok(());
            }
        }

        self.mutate(|state| {
            let manifest = state
                .files
                .get_mut(file_id)
                .ok_or_else(|| IndexError::UnknownFile(file_id.to_string()))?;
            if manifest.is_complete() {
                return Err(IndexError::Sealed(file_id.to_string()));
            }
            if chunk.ordinal >= manifest.chunk_count {
                return Err(invalid(format!(
                    "ordinal out of range (chunk count {})",
                    manifest.chunk_count
                )));
            }
            let expected = expected_length(manifest, chunk.ordinal);
            if chunk.length != expected {
                return Err(invalid(format!(
                    "length {} does not match expected {expected}",
                    chunk.length
                )));
            }

            match manifest
                .chunks
                .binary_search_by_key(&chunk.ordinal, |c| c.ordinal)
            {
                Ok(i) if manifest.chunks[i].digest != chunk.digest => {
                    return Err(IndexError::ChunkConflict {
                        file_id: file_id.to_string(),
                        ordinal: chunk.ordinal,
                        existing: manifest.chunks[i].digest,
                    });
                }
                Ok(_) => {}
                Err(i) => manifest.chunks.insert(i, chunk),
            }

            // The first confirmed locator for a digest wins.
            state.cache.entry(chunk.digest).or_insert(locator);
            Ok(())
        })
    }

    fn complete_file(
        &self,
        file_id: &str,
        file_digest: Digest,
    ) -> Result<FileManifest, IndexError> {
        self.mutate(|state| {
            let manifest = state
                .files
                .get_mut(file_id)
                .ok_or_else(|| IndexError::UnknownFile(file_id.to_string()))?;

            if manifest.is_complete() {
                if manifest.file_digest == Some(file_digest) {
                    return Ok(manifest.clone());
                }
                return Err(IndexError::Sealed(file_id.to_string()));
            }

            let missing = manifest.missing_ordinals();
            if !missing.is_empty() {
                return Err(IndexError::IncompleteManifest {
                    file_id: file_id.to_string(),
                    missing,
                });
            }
            if manifest.committed_bytes() != manifest.size {
                return Err(invalid_manifest(manifest, "chunk lengths do not sum to size"));
            }

            manifest.file_digest = Some(file_digest);
            manifest.completed_at = Some(Utc::now());
            debug!(file_id, digest = %file_digest.short(), "sealed manifest");
            Ok(manifest.clone())
        })
    }

    fn read_manifest(&self, file_id: &str) -> Result<FileManifest, IndexError> {
        self.state
            .read()
            .unwrap()
            .files
            .get(file_id)
            .cloned()
            .ok_or_else(|| IndexError::UnknownFile(file_id.to_string()))
    }

    fn chunk_locators(
        &self,
        file_id: &str,
    ) -> Result<Vec<(ChunkRef, RemoteLocator)>, IndexError> {
        let state = self.state.read().unwrap();
        let manifest = state
            .files
            .get(file_id)
            .ok_or_else(|| IndexError::UnknownFile(file_id.to_string()))?;
        manifest
            .chunks
            .iter()
            .map(|c| {
                state
                    .cache
                    .get(&c.digest)
                    .map(|l| (*c, l.clone()))
                    .ok_or_else(|| IndexError::InvalidChunk {
                        file_id: file_id.to_string(),
                        ordinal: c.ordinal,
                        reason: "no cached locator".into(),
                    })
            })
            .collect()
    }

    fn list_files(&self) -> Result<Vec<FileManifest>, IndexError> {
        let mut files: Vec<FileManifest> =
            self.state.read().unwrap().files.values().cloned().collect();
        files.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(files)
    }

    fn remove_file(&self, file_id: &str) -> Result<Vec<RemoteLocator>, IndexError> {
        self.mutate(|state| {
            let removed = state
                .files
                .remove(file_id)
                .ok_or_else(|| IndexError::UnknownFile(file_id.to_string()))?;

            let still_used: HashSet<Digest> = state
                .files
                .values()
                .flat_map(|m| m.chunks.iter().map(|c| c.digest))
                .collect();

            let mut orphans = Vec::new();
            let mut seen = HashSet::new();
            for chunk in &removed.chunks {
                if still_used.contains(&chunk.digest) || !seen.insert(chunk.digest) {
                    continue;
                }
                if let Some(locator) = state.cache.remove(&chunk.digest) {
                    orphans.push(locator);
                }
            }
            debug!(file_id, orphans = orphans.len(), "removed file");
            Ok(orphans)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const CHUNK: u64 = 4;

    fn digest(b: u8) -> Digest {
        Digest::from_bytes([b; 32])
    }

    fn skeleton(id: &str, size: u64) -> FileManifest {
        FileManifest::skeleton(id, format!("{id}.bin"), size, CHUNK, None).unwrap()
    }

    fn chunk(ordinal: u32, length: u64, d: u8) -> (ChunkRef, RemoteLocator) {
        (
            ChunkRef {
                ordinal,
                length,
                digest: digest(d),
            },
            RemoteLocator::new(digest(d), format!("loc-{d}")),
        )
    }

    fn commit(store: &JsonIndexStore, id: &str, ordinal: u32, length: u64, d: u8) {
        let (c, l) = chunk(ordinal, length, d);
        store.commit_chunk(id, c, l).unwrap();
    }

    fn test_store() -> (tempfile::TempDir, JsonIndexStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = JsonIndexStore::open(tmp.path().join("index.json")).unwrap();
        (tmp, store)
    }

    #[test]
    fn new_store_empty() {
        let (_tmp, store) = test_store();
        assert!(store.list_files().unwrap().is_empty());
        assert!(store.lookup_digest(&digest(1)).unwrap().is_none());
    }

    #[test]
    fn begin_rejects_duplicates_and_bad_skeletons() {
        let store = JsonIndexStore::in_memory();
        store.begin_file(skeleton("a", 10)).unwrap();
        assert!(matches!(
            store.begin_file(skeleton("a", 10)),
            Err(IndexError::DuplicateFile(_))
        ));

        let mut bad = skeleton("b", 10);
        bad.chunk_count = 7;
        assert!(matches!(
            store.begin_file(bad),
            Err(IndexError::InvalidManifest { .. })
        ));
    }

    #[test]
    fn commit_updates_chunks_and_cache() {
        let store = JsonIndexStore::in_memory();
        store.begin_file(skeleton("a", 10)).unwrap();
        commit(&store, "a", 1, 4, 2);
        commit(&store, "a", 0, 4, 1);

        let m = store.read_manifest("a").unwrap();
        assert_eq!(
            m.chunks.iter().map(|c| c.ordinal).collect::<Vec<_>>(),
            vec![0, 1]
        );
        assert_eq!(m.missing_ordinals(), vec![2]);
        assert_eq!(
            store.lookup_digest(&digest(2)).unwrap().unwrap().address,
            "loc-2"
        );
    }

    #[test]
    fn commit_validates_length_and_range() {
        let store = JsonIndexStore::in_memory();
        store.begin_file(skeleton("a", 10)).unwrap();

        let (c, l) = chunk(0, 3, 1);
        assert!(matches!(
            store.commit_chunk("a", c, l),
            Err(IndexError::InvalidChunk { .. })
        ));
        // The last chunk carries the remainder.
        let (c, l) = chunk(2, 4, 1);
        assert!(store.commit_chunk("a", c, l).is_err());
        let (c, l) = chunk(3, 4, 1);
        assert!(store.commit_chunk("a", c, l).is_err());
        commit(&store, "a", 2, 2, 1);

        // Nothing from the rejected commits leaked into the cache.
        assert_eq!(store.read_manifest("a").unwrap().chunks.len(), 1);
    }

    #[test]
    fn commit_is_idempotent_but_detects_conflicts() {
        let store = JsonIndexStore::in_memory();
        store.begin_file(skeleton("a", 8)).unwrap();
        commit(&store, "a", 0, 4, 1);
        commit(&store, "a", 0, 4, 1);
        assert_eq!(store.read_manifest("a").unwrap().chunks.len(), 1);

        let (c, l) = chunk(0, 4, 9);
        assert!(matches!(
            store.commit_chunk("a", c, l),
            Err(IndexError::ChunkConflict { ordinal: 0, .. })
        ));
        assert!(store.lookup_digest(&digest(9)).unwrap().is_none());
    }

    #[test]
    fn commit_rejects_mismatched_locator() {
        let store = JsonIndexStore::in_memory();
        store.begin_file(skeleton("a", 4)).unwrap();
        let (c, _) = chunk(0, 4, 1);
        let wrong = RemoteLocator::new(digest(2), "loc-2");
        assert!(store.commit_chunk("a", c, wrong).is_err());
    }

    #[test]
    fn first_locator_wins() {
        let store = JsonIndexStore::in_memory();
        store.begin_file(skeleton("a", 4)).unwrap();
        store.begin_file(skeleton("b", 4)).unwrap();
        commit(&store, "a", 0, 4, 1);
        let (c, _) = chunk(0, 4, 1);
        store
            .commit_chunk("b", c, RemoteLocator::new(digest(1), "loc-other"))
            .unwrap();
        assert_eq!(
            store.lookup_digest(&digest(1)).unwrap().unwrap().address,
            "loc-1"
        );
    }

    #[test]
    fn complete_requires_every_ordinal() {
        let store = JsonIndexStore::in_memory();
        store.begin_file(skeleton("a", 10)).unwrap();
        commit(&store, "a", 0, 4, 1);
        commit(&store, "a", 2, 2, 3);

        match store.complete_file("a", digest(7)) {
            Err(IndexError::IncompleteManifest { missing, .. }) => assert_eq!(missing, vec![1]),
            other => panic!("expected IncompleteManifest, got {other:?}"),
        }

        commit(&store, "a", 1, 4, 2);
        let m = store.complete_file("a", digest(7)).unwrap();
        assert!(m.is_complete());
        assert_eq!(m.file_digest, Some(digest(7)));

        // Same digest again is fine, a different one is not.
        assert!(store.complete_file("a", digest(7)).is_ok());
        assert!(matches!(
            store.complete_file("a", digest(8)),
            Err(IndexError::Sealed(_))
        ));
        assert!(store.incomplete_files().unwrap().is_empty());
    }

    #[test]
    fn empty_file_completes_without_chunks() {
        let store = JsonIndexStore::in_memory();
        store.begin_file(skeleton("empty", 0)).unwrap();
        assert!(store.complete_file("empty", digest(0)).unwrap().is_complete());
    }

    #[test]
    fn sealed_manifest_rejects_new_chunks() {
        let store = JsonIndexStore::in_memory();
        store.begin_file(skeleton("a", 4)).unwrap();
        commit(&store, "a", 0, 4, 1);
        store.complete_file("a", digest(7)).unwrap();
        // Re-committing what is already there stays a no-op.
        commit(&store, "a", 0, 4, 1);
        let (c, l) = chunk(0, 4, 2);
        assert!(store.commit_chunk("a", c, l).is_err());
    }

    #[test]
    fn incomplete_files_lists_unsealed() {
        let store = JsonIndexStore::in_memory();
        store.begin_file(skeleton("a", 4)).unwrap();
        store.begin_file(skeleton("b", 4)).unwrap();
        commit(&store, "b", 0, 4, 1);
        store.complete_file("b", digest(1)).unwrap();

        let ids: Vec<String> = store
            .incomplete_files()
            .unwrap()
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[test]
    fn chunk_locators_in_order() {
        let store = JsonIndexStore::in_memory();
        store.begin_file(skeleton("a", 8)).unwrap();
        commit(&store, "a", 1, 4, 2);
        commit(&store, "a", 0, 4, 1);
        let pairs = store.chunk_locators("a").unwrap();
        assert_eq!(pairs[0].1.address, "loc-1");
        assert_eq!(pairs[1].1.address, "loc-2");
    }

    #[test]
    fn remove_returns_only_orphans() {
        let store = JsonIndexStore::in_memory();
        store.begin_file(skeleton("a", 8)).unwrap();
        store.begin_file(skeleton("b", 4)).unwrap();
        commit(&store, "a", 0, 4, 1);
        commit(&store, "a", 1, 4, 2);
        commit(&store, "b", 0, 4, 2);

        let orphans = store.remove_file("a").unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].digest, digest(1));
        assert!(store.lookup_digest(&digest(1)).unwrap().is_none());
        assert!(store.lookup_digest(&digest(2)).unwrap().is_some());
        assert!(matches!(
            store.read_manifest("a"),
            Err(IndexError::UnknownFile(_))
        ));
        assert!(matches!(
            store.remove_file("a"),
            Err(IndexError::UnknownFile(_))
        ));
    }

    #[test]
    fn remove_dedups_repeated_digest() {
        let store = JsonIndexStore::in_memory();
        store.begin_file(skeleton("a", 8)).unwrap();
        commit(&store, "a", 0, 4, 1);
        commit(&store, "a", 1, 4, 1);
        assert_eq!(store.remove_file("a").unwrap().len(), 1);
    }

    #[test]
    fn persist_and_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("index.json");

        {
            let store = JsonIndexStore::open(&path).unwrap();
            store.begin_file(skeleton("a", 6)).unwrap();
            commit(&store, "a", 0, 4, 1);
            commit(&store, "a", 1, 2, 2);
            store.complete_file("a", digest(9)).unwrap();
            store.begin_file(skeleton("b", 4)).unwrap();
        }

        let store = JsonIndexStore::open(&path).unwrap();
        let a = store.read_manifest("a").unwrap();
        assert!(a.is_complete());
        assert_eq!(a.chunks.len(), 2);
        assert_eq!(
            store.lookup_digest(&digest(2)).unwrap().unwrap().address,
            "loc-2"
        );
        assert_eq!(store.incomplete_files().unwrap().len(), 1);
        assert!(!tmp_path(&path).exists());
    }

    #[test]
    fn every_commit_is_on_disk_before_returning() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index.json");
        let store = JsonIndexStore::open(&path).unwrap();
        store.begin_file(skeleton("a", 12)).unwrap();

        for ordinal in 0..3u32 {
            commit(&store, "a", ordinal, 4, ordinal as u8 + 1);

            // A fresh open sees exactly what the live store has.
            let reopened = JsonIndexStore::open(&path).unwrap();
            assert_eq!(
                reopened.chunk_locators("a").unwrap(),
                store.chunk_locators("a").unwrap()
            );
            assert_eq!(
                reopened.read_manifest("a").unwrap().chunks.len(),
                ordinal as usize + 1
            );
        }
        assert!(!tmp_path(&path).exists());

        // Compact encoding, no pretty-printing.
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(!raw.contains('\n'));
    }

    #[test]
    fn stale_tmp_file_is_ignored_and_replaced() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index.json");
        {
            let store = JsonIndexStore::open(&path).unwrap();
            store.begin_file(skeleton("a", 4)).unwrap();
        }
        // Leftover from a write interrupted before its rename.
        std::fs::write(tmp_path(&path), b"{\"version\":1,\"fil").unwrap();

        let store = JsonIndexStore::open(&path).unwrap();
        assert_eq!(store.list_files().unwrap().len(), 1);
        commit(&store, "a", 0, 4, 7);
        assert!(!tmp_path(&path).exists());
        let reopened = JsonIndexStore::open(&path).unwrap();
        assert!(reopened.lookup_digest(&digest(7)).unwrap().is_some());
    }

    #[test]
    fn failed_persist_leaves_state_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = tmp.path().join("index.json");
        let store = JsonIndexStore::open(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        assert!(store.begin_file(skeleton("a", 4)).is_err());
        assert!(store.list_files().unwrap().is_empty());
    }

    #[test]
    fn concurrent_commits_on_different_files() {
        let store = Arc::new(JsonIndexStore::in_memory());
        for f in 0..4u8 {
            store.begin_file(skeleton(&format!("f{f}"), 40)).unwrap();
        }

        let handles: Vec<_> = (0..4u8)
            .map(|f| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for o in 0..10u32 {
                        let d = f * 16 + o as u8;
                        let (c, l) = chunk(o, 4, d);
                        store.commit_chunk(&format!("f{f}"), c, l).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for f in 0..4u8 {
            assert!(
                store
                    .read_manifest(&format!("f{f}"))
                    .unwrap()
                    .missing_ordinals()
                    .is_empty()
            );
        }
    }
}
