//! The reader's two-tier index cache (spec.md §4.4/§9).
//!
//! The *pyramid* tier is a single decompressed buffer, read-only after
//! init and safe for unsynchronized concurrent reads (spec.md §5), kept
//! directly on `ArchiveReader`. The *fragment* tier below is an LRU of
//! size 28 keyed by `fragmentRange.startOffset`, with at most one fetch
//! in flight per key. A hand-rolled double-checked-locking slot type
//! could coalesce concurrent fetches the same way; here that guarantee
//! comes straight from `moka`'s `try_get_with`, so there's no such slot
//! type to keep in sync.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use moka::future::Cache;

use crate::error::{ComtError, ComtResult};

/// Number of fragments kept resident at once (spec.md §4.4).
pub const FRAGMENT_CACHE_SIZE: u64 = 28;

/// Deduplicated, evicting cache of fragment index bytes.
///
/// Two `get_or_fetch` calls for the same `start_offset` made concurrently
/// share a single invocation of `fetch` (spec.md §8 property 5); a fetch
/// that errors leaves no trace for the next caller to retry (spec.md §7,
/// §8 property 6).
pub struct FragmentCache {
    entries: Cache<u64, Bytes>,
}

impl Default for FragmentCache {
    fn default() -> Self {
        Self::new(FRAGMENT_CACHE_SIZE)
    }
}

impl FragmentCache {
    /// Creates a cache holding at most `capacity` fragments.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: Cache::new(capacity),
        }
    }

    /// Returns the cached fragment at `start_offset`, fetching and
    /// inserting it if absent. Concurrent callers for the same
    /// `start_offset` share the `fetch` future's result; only one of them
    /// actually drives it.
    ///
    /// # Errors
    /// Propagates whatever `fetch` returns.
    pub async fn get_or_fetch<F>(&self, start_offset: u64, fetch: F) -> ComtResult<Bytes>
    where
        F: Future<Output = ComtResult<Bytes>>,
    {
        self.entries
            .try_get_with(start_offset, async { fetch.await.map_err(Arc::new) })
            .await
            .map_err(|e| match Arc::try_unwrap(e) {
                Ok(err) => err,
                Err(shared) => ComtError::Internal(shared.to_string()),
            })
    }

    /// Number of fragments currently resident. Exposed for tests only.
    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> u64 {
        self.entries.entry_count()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[tokio::test]
    async fn concurrent_fetches_for_same_offset_coalesce() {
        let cache = FragmentCache::new(8);
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch = |calls: Arc<AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            Ok::<_, ComtError>(Bytes::from_static(b"fragment-bytes"))
        };

        let (a, b) = tokio::join!(
            cache.get_or_fetch(1000, fetch(calls.clone())),
            cache.get_or_fetch(1000, fetch(calls.clone())),
        );
        assert_eq!(a.unwrap(), Bytes::from_static(b"fragment-bytes"));
        assert_eq!(b.unwrap(), Bytes::from_static(b"fragment-bytes"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn distinct_offsets_both_fetch() {
        let cache = FragmentCache::new(8);
        let calls = Arc::new(AtomicUsize::new(0));
        let fetch = |calls: Arc<AtomicUsize>| async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ComtError>(Bytes::from_static(b"x"))
        };

        cache
            .get_or_fetch(1000, fetch(calls.clone()))
            .await
            .unwrap();
        cache
            .get_or_fetch(2000, fetch(calls.clone()))
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let cache = FragmentCache::new(8);
        let calls = Arc::new(AtomicUsize::new(0));

        let first = cache
            .get_or_fetch(1000, async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<Bytes, _>(ComtError::RangeRequestsUnsupported)
            })
            .await;
        assert!(first.is_err());

        let second = cache
            .get_or_fetch(1000, async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ComtError>(Bytes::from_static(b"ok"))
            })
            .await;
        assert!(second.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
