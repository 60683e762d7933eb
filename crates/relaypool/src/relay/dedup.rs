use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use hashbrown::hash_map::Entry;
use hashbrown::HashMap;
use tokio::sync::oneshot;
use tracing::trace;

use crate::{Error, Result};

type Waiters<T> = Vec<oneshot::Sender<Result<T>>>;

/// Collapses concurrent identical queries. While a key is outstanding every
/// new caller joins the running query instead of starting another one; the
/// key is released as soon as the shared result is ready.
pub struct QueryDeduplicator<T> {
    pending: Arc<Mutex<HashMap<String, Waiters<T>>>>,
}

impl<T> Default for QueryDeduplicator<T> {
    fn default() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> Clone for QueryDeduplicator<T> {
    fn clone(&self) -> Self {
        Self {
            pending: self.pending.clone(),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owns a pending key for the lifetime of its execution. If the query
/// panics or its task is torn down, dropping the guard releases the key and
/// its waiters see [`Error::Abandoned`].
struct PendingKey<T> {
    table: Arc<Mutex<HashMap<String, Waiters<T>>>>,
    key: Option<String>,
}

impl<T> PendingKey<T> {
    fn release(mut self) -> Waiters<T> {
        match self.key.take() {
            Some(key) => lock(&self.table).remove(&key).unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

impl<T> Drop for PendingKey<T> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            lock(&self.table).remove(&key);
        }
    }
}

impl<T> QueryDeduplicator<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `query` under `key`, or join the one already running. `query` is
    /// only invoked when this call starts a fresh execution.
    pub fn dedupe<F, Fut>(
        &self,
        key: impl Into<String>,
        query: F,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let key = key.into();
        let (tx, rx) = oneshot::channel();

        let mut pending = lock(&self.pending);
        let fresh = match pending.entry(key) {
            Entry::Occupied(mut waiting) => {
                trace!("joining in-flight query {}", waiting.key());
                waiting.get_mut().push(tx);
                None
            }
            Entry::Vacant(slot) => {
                let key = slot.key().clone();
                slot.insert(vec![tx]);
                Some(key)
            }
        };
        drop(pending);

        if let Some(key) = fresh {
            let guard = PendingKey {
                table: self.pending.clone(),
                key: Some(key),
            };
            let fut = query();
            tokio::spawn(async move {
                let result = fut.await;
                // release the key before anyone sees the result, so a
                // follow-up call starts fresh
                let waiters = guard.release();
                for waiter in waiters {
                    let _ = waiter.send(result.clone());
                }
            });
        }

        async move { rx.await.map_err(|_| Error::Abandoned)? }
    }

    pub fn is_pending(&self, key: &str) -> bool {
        lock(&self.pending).contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_execution() {
        let dedup: QueryDeduplicator<u32> = QueryDeduplicator::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let mut joined = Vec::new();
        for _ in 0..8 {
            let calls = calls.clone();
            joined.push(dedup.dedupe("wss://a|{\"kinds\":[1]}", move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, Error>(42)
                }
            }));
        }
        assert!(dedup.is_pending("wss://a|{\"kinds\":[1]}"));

        for fut in joined {
            assert_eq!(fut.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(dedup.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn key_is_released_after_failure() {
        let dedup: QueryDeduplicator<u32> = QueryDeduplicator::new();

        let first = dedup.dedupe("k", || async { Err::<u32, _>(Error::Generic("nope".into())) });
        assert!(matches!(first.await, Err(Error::Generic(_))));
        assert!(!dedup.is_pending("k"));

        let second = dedup.dedupe("k", || async { Ok::<_, Error>(1) });
        assert_eq!(second.await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_query_releases_its_key() {
        let dedup: QueryDeduplicator<u32> = QueryDeduplicator::new();

        let first = dedup.dedupe("k", || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if true {
                panic!("query blew up");
            }
            Ok::<u32, Error>(0)
        });
        let joined = dedup.dedupe("k", || async { Ok::<_, Error>(7) });
        assert_eq!(first.await, Err(Error::Abandoned));
        assert_eq!(joined.await, Err(Error::Abandoned));
        assert!(!dedup.is_pending("k"));

        let retry = dedup.dedupe("k", || async { Ok::<_, Error>(2) });
        assert_eq!(retry.await.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_run_independently() {
        let dedup: QueryDeduplicator<&'static str> = QueryDeduplicator::new();
        let a = dedup.dedupe("a", || async { Ok::<_, Error>("a") });
        let b = dedup.dedupe("b", || async { Ok::<_, Error>("b") });
        assert_eq!(dedup.pending_count(), 2);
        assert_eq!(a.await.unwrap(), "a");
        assert_eq!(b.await.unwrap(), "b");
    }
}
