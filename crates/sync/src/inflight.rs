//! Coordinator-wide table of uploads in progress, keyed by digest.
//!
//! Jobs that need the same chunk at the same time share a single `put`:
//! the first caller runs the upload, later callers wait on its result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use televault_types::{Digest, RemoteLocator};
use tokio::sync::OnceCell;

use crate::error::SyncError;

#[derive(Default)]
pub(crate) struct InFlightPuts {
    cells: Mutex<HashMap<Digest, Arc<OnceCell<RemoteLocator>>>>,
}

impl InFlightPuts {
    /// Returns the locator for `digest`, running `init` only if no other
    /// caller is already storing it.
    ///
    /// A failed `init` is not cached; the next waiter runs its own.
    pub(crate) async fn get_or_put<F, Fut>(
        &self,
        digest: Digest,
        init: F,
    ) -> Result<RemoteLocator, SyncError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<RemoteLocator, SyncError>>,
    {
        let cell = {
            let mut cells = self.cells.lock().unwrap();
            Arc::clone(cells.entry(digest).or_default())
        };

        let result = cell.get_or_try_init(init).await.cloned();

        // Callers holding the cell keep their result; new callers go
        // through the index, which has the locator by now.
        let mut cells = self.cells.lock().unwrap();
        if cells.get(&digest).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
            cells.remove(&digest);
        }
        result
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.cells.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn locator() -> RemoteLocator {
        RemoteLocator::new(Digest::from_bytes([1; 32]), "mem-1")
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_init() {
        let table = InFlightPuts::default();
        let runs = AtomicUsize::new(0);
        let digest = Digest::from_bytes([1; 32]);

        let runs = &runs;
        let init = move || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(locator())
        };
        let (a, b) = tokio::join!(
            table.get_or_put(digest, init),
            table.get_or_put(digest, init)
        );

        assert_eq!(a.unwrap(), locator());
        assert_eq!(b.unwrap(), locator());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(table.len(), 0);
    }

    #[tokio::test]
    async fn failure_is_not_cached() {
        let table = InFlightPuts::default();
        let digest = Digest::from_bytes([1; 32]);

        let err = table
            .get_or_put(digest, || async { Err(SyncError::Cancelled) })
            .await;
        assert!(err.is_err());
        assert_eq!(table.len(), 0);

        let ok = table.get_or_put(digest, || async { Ok(locator()) }).await;
        assert_eq!(ok.unwrap(), locator());
    }
}
