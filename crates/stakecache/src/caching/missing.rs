use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::store::CacheStore;
use super::{CacheValue, ReadyTracker, StageClosed};

/// Keys the upstream did not know about when they were last looked up.
///
/// The set is only mutated by the missing worker. Everyone else reads.
#[derive(Debug)]
pub struct MissingSet<K> {
    keys: RwLock<HashSet<K>>,
}

impl<K> Default for MissingSet<K> {
    fn default() -> Self {
        Self {
            keys: RwLock::new(HashSet::new()),
        }
    }
}

impl<K: Clone + Eq + Hash> MissingSet<K> {
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    pub fn list(&self) -> Vec<K> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.keys.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, key: K) -> bool {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key)
    }

    fn remove(&self, key: &K) -> bool {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }
}

enum MissingMessage<K> {
    Observed(K),
    Resolved(K),
    Forget(K),
    Barrier(oneshot::Sender<()>),
}

/// Reports lookup outcomes to the missing worker.
pub struct MissingReporter<K> {
    tx: mpsc::Sender<MissingMessage<K>>,
}

impl<K> Clone for MissingReporter<K> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<K> fmt::Debug for MissingReporter<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MissingReporter").finish_non_exhaustive()
    }
}

impl<K: Send + 'static> MissingReporter<K> {
    async fn send(&self, message: MissingMessage<K>) -> Result<(), StageClosed> {
        self.tx.send(message).await.map_err(|_| StageClosed)
    }

    /// The upstream does not know `key`.
    pub async fn observed(&self, key: K) -> Result<(), StageClosed> {
        self.send(MissingMessage::Observed(key)).await
    }

    /// The upstream knows `key` (again).
    pub async fn resolved(&self, key: K) -> Result<(), StageClosed> {
        self.send(MissingMessage::Resolved(key)).await
    }

    /// `key` was deleted from the cache and should not be tracked anymore.
    pub async fn forget(&self, key: K) -> Result<(), StageClosed> {
        self.send(MissingMessage::Forget(key)).await
    }

    /// Waits until every report sent through this reporter so far has been applied.
    pub async fn sync(&self) -> Result<(), StageClosed> {
        let (done, applied) = oneshot::channel();
        self.send(MissingMessage::Barrier(done)).await?;
        applied.await.map_err(|_| StageClosed)
    }
}

/// The task owning all mutations of a [`MissingSet`].
#[derive(Debug)]
pub(crate) struct MissingWorker {
    task: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl MissingWorker {
    pub(crate) fn spawn<V: CacheValue>(
        name: &'static str,
        queue_size: usize,
        set: Arc<MissingSet<V::Key>>,
        store: Arc<CacheStore<V>>,
        tracker: Arc<ReadyTracker>,
    ) -> (MissingReporter<V::Key>, Self) {
        let (tx, rx) = mpsc::channel(queue_size);
        let shutdown = CancellationToken::new();
        let state = MissingState {
            name,
            set,
            store,
            tracker,
        };
        let task = tokio::spawn(state.run(rx, shutdown.clone()));
        (MissingReporter { tx }, Self { task, shutdown })
    }

    pub(crate) async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "missing worker failed");
        }
    }
}

struct MissingState<V: CacheValue> {
    name: &'static str,
    set: Arc<MissingSet<V::Key>>,
    store: Arc<CacheStore<V>>,
    tracker: Arc<ReadyTracker>,
}

impl<V: CacheValue> MissingState<V> {
    async fn run(
        self,
        mut rx: mpsc::Receiver<MissingMessage<V::Key>>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => self.apply(message),
                    None => break,
                },
            }
        }

        rx.close();
        while let Some(message) = rx.recv().await {
            self.apply(message);
        }
    }

    fn apply(&self, message: MissingMessage<V::Key>) {
        match message {
            MissingMessage::Observed(key) => {
                // an entry filled in through other means stays, whatever the lookup says
                if self.store.contains(&key) {
                    return;
                }
                self.tracker.update(|counters| {
                    // only keys still requested are tracked, a deleted key stays forgotten
                    if self.store.settle(&key) {
                        // the request is given up until the key resolves
                        counters.requested -= 1;
                        self.set.insert(key.clone());
                        metric!(counter("caches.missing.observed") += 1, "cache" => self.name);
                        tracing::debug!(cache = self.name, %key, "key is missing upstream");
                    }
                });
            }
            MissingMessage::Resolved(key) => {
                self.tracker.update(|counters| {
                    if self.set.remove(&key) && !self.store.contains(&key) {
                        self.store.reopen(&key);
                        counters.requested += 1;
                        metric!(counter("caches.missing.resolved") += 1, "cache" => self.name);
                        tracing::debug!(cache = self.name, %key, "missing key resolved");
                    }
                });
            }
            MissingMessage::Forget(key) => {
                self.set.remove(&key);
            }
            MissingMessage::Barrier(done) => {
                done.send(()).ok();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Ticker(String);

    impl CacheValue for Ticker {
        type Key = String;

        fn key(&self) -> &String {
            &self.0
        }
    }

    #[tokio::test]
    async fn test_observed_then_resolved() {
        let set = Arc::new(MissingSet::default());
        let store = Arc::new(CacheStore::<Ticker>::new());
        let tracker = Arc::new(ReadyTracker::new());
        let (reporter, worker) = MissingWorker::spawn(
            "test",
            1,
            Arc::clone(&set),
            Arc::clone(&store),
            Arc::clone(&tracker),
        );

        let key = "ABCD".to_owned();
        assert!(store.begin_request(&key));
        tracker.update(|c| c.requested += 1);

        reporter.observed(key.clone()).await.unwrap();
        reporter.observed(key.clone()).await.unwrap();
        reporter.sync().await.unwrap();
        assert!(set.contains("ABCD"));
        assert_eq!(tracker.counters().requested, 0);

        reporter.resolved(key.clone()).await.unwrap();
        reporter.resolved(key.clone()).await.unwrap();
        reporter.sync().await.unwrap();
        assert!(set.is_empty());
        assert_eq!(tracker.counters().requested, 1);

        worker.shutdown().await;
        assert!(reporter.sync().await.is_err());
    }

    #[tokio::test]
    async fn test_forget() {
        let set = Arc::new(MissingSet::default());
        let store = Arc::new(CacheStore::<Ticker>::new());
        let tracker = Arc::new(ReadyTracker::new());
        let (reporter, worker) = MissingWorker::spawn(
            "test",
            1,
            Arc::clone(&set),
            Arc::clone(&store),
            Arc::clone(&tracker),
        );

        let key = "GONE".to_owned();
        store.begin_request(&key);
        tracker.update(|c| c.requested += 1);

        reporter.observed(key.clone()).await.unwrap();
        reporter.sync().await.unwrap();
        assert!(set.contains("GONE"));

        reporter.forget(key).await.unwrap();
        reporter.sync().await.unwrap();
        assert!(!set.contains("GONE"));
        assert_eq!(set.list(), Vec::<String>::new());
        assert_eq!(tracker.counters().requested, 0);

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_unrequested_keys_are_ignored() {
        let set = Arc::new(MissingSet::default());
        let store = Arc::new(CacheStore::<Ticker>::new());
        let tracker = Arc::new(ReadyTracker::new());
        let (reporter, worker) =
            MissingWorker::spawn("test", 1, Arc::clone(&set), store, Arc::clone(&tracker));

        // e.g. deleted while the lookup was in flight
        reporter.observed("DELETED".to_owned()).await.unwrap();
        reporter.sync().await.unwrap();

        assert!(set.is_empty());
        assert_eq!(tracker.counters().requested, 0);

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_cached_keys_are_never_missing() {
        let set = Arc::new(MissingSet::default());
        let store = Arc::new(CacheStore::<Ticker>::new());
        let tracker = Arc::new(ReadyTracker::new());
        let (reporter, worker) = MissingWorker::spawn(
            "test",
            1,
            Arc::clone(&set),
            Arc::clone(&store),
            Arc::clone(&tracker),
        );

        store.upsert(Ticker("ABCD".into()));
        tracker.update(|c| {
            c.requested += 1;
            c.materialized += 1;
        });

        reporter.observed("ABCD".to_owned()).await.unwrap();
        reporter.resolved("ABCD".to_owned()).await.unwrap();
        reporter.sync().await.unwrap();

        assert!(set.is_empty());
        assert!(tracker.counters().is_ready());
        assert!(store.outstanding().is_empty());

        worker.shutdown().await;
    }
}
