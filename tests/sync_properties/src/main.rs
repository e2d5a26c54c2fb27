fn main() {
    println!("Run `cargo test -p sync-properties` to execute the end-to-end sync tests.");
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};
    use std::sync::Arc;
    use std::time::Duration;

    use proptest::prelude::*;
    use televault_chunker::digest_bytes;
    use televault_index::{IndexStore, JsonIndexStore};
    use televault_sync::{RetryPolicy, SyncConfig, SyncCoordinator};
    use televault_transport::{MemoryTransport, RemoteTransport, TransportError};
    use televault_types::{ErrorClass, JobOutcome};

    const CHUNK: usize = 64;

    fn config() -> SyncConfig {
        SyncConfig {
            chunk_size: CHUNK,
            concurrency: 4,
            queue_depth: None,
            retry: RetryPolicy {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter: false,
                ..RetryPolicy::default()
            },
        }
    }

    fn coordinator(
        index: Arc<dyn IndexStore>,
        transport: &Arc<MemoryTransport>,
    ) -> SyncCoordinator {
        SyncCoordinator::new(
            index,
            Arc::clone(transport) as Arc<dyn RemoteTransport>,
            config(),
        )
        .unwrap()
    }

    /// `n` chunks of distinct content, tagged so different tags never share
    /// a chunk.
    fn chunks(n: usize, tag: u8) -> Vec<u8> {
        let mut out = Vec::with_capacity(n * CHUNK);
        for i in 0..n {
            let mut block = vec![tag; CHUNK];
            block[..8].copy_from_slice(&(i as u64).to_le_bytes());
            out.extend(block);
        }
        out
    }

    fn write(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    async fn roundtrip(data: &[u8]) -> Vec<u8> {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let coord = coordinator(Arc::new(JsonIndexStore::in_memory()), &transport);

        let path = write(src.path(), "input.bin", data);
        let up = coord.upload(&path).await.unwrap();
        assert!(up.is_complete(), "{:?}", up.outcome);
        let down = coord.restore(&up.file_id, dst.path()).await.unwrap();
        assert!(down.is_complete(), "{:?}", down.outcome);
        std::fs::read(down.restored_to.unwrap()).unwrap()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(24))]

        #[test]
        fn restore_reproduces_upload(data in proptest::collection::vec(any::<u8>(), 0..1000)) {
            let rt = tokio::runtime::Runtime::new().unwrap();
            let restored = rt.block_on(roundtrip(&data));
            prop_assert_eq!(digest_bytes(&restored), digest_bytes(&data));
            prop_assert_eq!(restored, data);
        }
    }

    #[tokio::test]
    async fn roundtrip_on_chunk_boundaries() {
        for len in [0, 1, CHUNK - 1, CHUNK, CHUNK + 1, CHUNK * 7] {
            let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
            assert_eq!(roundtrip(&data).await, data, "length {len}");
        }
    }

    #[tokio::test]
    async fn shared_chunks_are_stored_once() {
        let src = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let coord = coordinator(Arc::new(JsonIndexStore::in_memory()), &transport);

        let base = chunks(5, 1);
        let first = write(src.path(), "first.bin", &base);
        coord.upload(&first).await.unwrap();
        assert_eq!(transport.put_calls(), 5);

        // Same bytes under a new name.
        transport.reset_counters();
        let copy = write(src.path(), "copy.bin", &base);
        coord.upload(&copy).await.unwrap();
        assert_eq!(transport.put_calls(), 0);

        // Two known chunks plus three new ones.
        transport.reset_counters();
        let mut mixed = base[..2 * CHUNK].to_vec();
        mixed.extend(chunks(3, 2));
        let mixed = write(src.path(), "mixed.bin", &mixed);
        let report = coord.upload(&mixed).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(transport.put_calls(), 3);
        assert_eq!(report.progress.skipped_chunks, 2);
    }

    #[tokio::test]
    async fn resume_after_interruption_sends_only_the_rest() {
        const TOTAL: usize = 10;
        const BEFORE_FAILURE: usize = 4;

        let src = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let index = Arc::new(JsonIndexStore::in_memory());
        let coord = coordinator(index.clone(), &transport);

        transport.fail_puts_after(BEFORE_FAILURE, TransportError::Unauthorized("revoked".into()));
        let path = write(src.path(), "big.bin", &chunks(TOTAL, 3));
        let failed = coord.upload(&path).await.unwrap();
        assert!(matches!(
            failed.outcome,
            JobOutcome::Failed {
                class: ErrorClass::Configuration,
                ..
            }
        ));

        let committed = index.read_manifest(&failed.file_id).unwrap().chunks.len();
        assert_eq!(committed, BEFORE_FAILURE);

        transport.clear_put_budget();
        transport.reset_counters();
        let resumed = coord.resume(&failed.file_id).await.unwrap();
        assert!(resumed.is_complete(), "{:?}", resumed.outcome);
        assert_eq!(transport.put_calls(), TOTAL - committed);
    }

    #[tokio::test]
    async fn resume_survives_restart() {
        let src = tempfile::tempdir().unwrap();
        let state = tempfile::tempdir().unwrap();
        let index_path = state.path().join("index.json");
        let transport = Arc::new(MemoryTransport::new());
        let path = write(src.path(), "big.bin", &chunks(6, 4));

        let file_id = {
            let index = Arc::new(JsonIndexStore::open(&index_path).unwrap());
            let coord = coordinator(index, &transport);
            transport.fail_puts_after(2, TransportError::Unauthorized("revoked".into()));
            coord.upload(&path).await.unwrap().file_id
        };

        // Fresh process: everything comes back from the index file.
        transport.clear_put_budget();
        transport.reset_counters();
        let index = Arc::new(JsonIndexStore::open(&index_path).unwrap());
        let coord = coordinator(index, &transport);
        let pending = coord.pending_uploads().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, file_id);

        let report = coord.resume(&file_id).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(transport.put_calls(), 4);

        let dst = tempfile::tempdir().unwrap();
        let restored = coord.restore(&file_id, dst.path()).await.unwrap();
        assert_eq!(
            std::fs::read(restored.restored_to.unwrap()).unwrap(),
            chunks(6, 4)
        );
    }

    #[tokio::test]
    async fn corrupted_payload_fails_restore_cleanly() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        let transport = Arc::new(MemoryTransport::new());
        let index = Arc::new(JsonIndexStore::in_memory());
        let coord = coordinator(index.clone(), &transport);

        let path = write(src.path(), "doc.pdf", &chunks(4, 5));
        let up = coord.upload(&path).await.unwrap();
        let (_, last) = index.chunk_locators(&up.file_id).unwrap().pop().unwrap();
        assert!(transport.corrupt(&last));

        let report = coord.restore(&up.file_id, dst.path()).await.unwrap();
        match report.outcome {
            JobOutcome::Failed { class, .. } => assert_eq!(class, ErrorClass::Integrity),
            other => panic!("expected integrity failure, got {other:?}"),
        }
        assert!(report.restored_to.is_none());
        assert_eq!(std::fs::read_dir(dst.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn concurrent_uploads_share_one_put() {
        let src = tempfile::tempdir().unwrap();
        let transport =
            Arc::new(MemoryTransport::new().with_latency(Duration::from_millis(30)));
        let index = Arc::new(JsonIndexStore::in_memory());
        let coord = coordinator(index.clone(), &transport);

        let shared = chunks(1, 6);
        let mut a = shared.clone();
        a.extend(chunks(1, 7));
        let mut b = shared.clone();
        b.extend(chunks(1, 8));
        let a = write(src.path(), "a.bin", &a);
        let b = write(src.path(), "b.bin", &b);

        let (ra, rb) = tokio::join!(coord.upload(&a), coord.upload(&b));
        let (ra, rb) = (ra.unwrap(), rb.unwrap());
        assert!(ra.is_complete() && rb.is_complete());

        // One put per distinct digest.
        assert_eq!(transport.put_calls(), 3);
        assert_eq!(transport.blob_count(), 3);

        let la = index.chunk_locators(&ra.file_id).unwrap();
        let lb = index.chunk_locators(&rb.file_id).unwrap();
        assert_eq!(la[0].0.digest, digest_bytes(&shared));
        assert_eq!(la[0].1, lb[0].1);
        assert_ne!(la[1].1, lb[1].1);
    }
}
