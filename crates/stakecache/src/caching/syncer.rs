use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use futures::future;
use rustc_hash::FxHasher;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::store::CacheStore;
use super::{CacheValue, ReadyTracker, StageClosed};

/// Picks the worker responsible for `key` out of `workers`.
///
/// The assignment is stable, so all messages for one key are handled by one worker in order.
pub(crate) fn partition<K: Hash + ?Sized>(key: &K, workers: usize) -> usize {
    let mut hasher = FxHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() % workers.max(1) as u64) as usize
}

pub(crate) enum SyncMessage<V: CacheValue> {
    Upsert {
        value: V,
        done: Option<oneshot::Sender<()>>,
    },
    Remove {
        key: V::Key,
    },
}

/// Sends upserts and removals to the syncer owning the key.
pub struct SyncerHandle<V: CacheValue> {
    queues: Arc<[mpsc::Sender<SyncMessage<V>>]>,
}

impl<V: CacheValue> Clone for SyncerHandle<V> {
    fn clone(&self) -> Self {
        Self {
            queues: Arc::clone(&self.queues),
        }
    }
}

impl<V: CacheValue> fmt::Debug for SyncerHandle<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncerHandle")
            .field("syncers", &self.queues.len())
            .finish()
    }
}

impl<V: CacheValue> SyncerHandle<V> {
    fn queue(&self, key: &V::Key) -> &mpsc::Sender<SyncMessage<V>> {
        &self.queues[partition(key, self.queues.len())]
    }

    /// Queues `value` to replace the current entry for its key.
    pub async fn upsert(&self, value: V) -> Result<(), StageClosed> {
        let queue = self.queue(value.key());
        queue
            .send(SyncMessage::Upsert { value, done: None })
            .await
            .map_err(|_| StageClosed)
    }

    /// Queues `value` and waits until it is visible in the store.
    pub async fn upsert_and_wait(&self, value: V) -> Result<(), StageClosed> {
        let (done, applied) = oneshot::channel();
        let queue = self.queue(value.key());
        queue
            .send(SyncMessage::Upsert {
                value,
                done: Some(done),
            })
            .await
            .map_err(|_| StageClosed)?;
        applied.await.map_err(|_| StageClosed)
    }

    /// Queues the removal of the entry with the primary key `key`.
    pub async fn remove(&self, key: V::Key) -> Result<(), StageClosed> {
        self.queue(&key)
            .send(SyncMessage::Remove { key })
            .await
            .map_err(|_| StageClosed)
    }
}

/// The running syncer tasks of a cache.
#[derive(Debug)]
pub(crate) struct SyncerPool {
    tasks: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl SyncerPool {
    /// Spawns `count` syncers which apply messages to `store` and keep `tracker` up to date.
    pub(crate) fn spawn<V: CacheValue>(
        name: &'static str,
        count: usize,
        queue_size: usize,
        store: Arc<CacheStore<V>>,
        tracker: Arc<ReadyTracker>,
    ) -> (SyncerHandle<V>, Self) {
        let shutdown = CancellationToken::new();
        let mut queues = Vec::with_capacity(count);
        let mut tasks = Vec::with_capacity(count);

        for id in 0..count {
            let (tx, rx) = mpsc::channel(queue_size);
            let syncer = Syncer {
                name,
                id,
                store: Arc::clone(&store),
                tracker: Arc::clone(&tracker),
            };
            tasks.push(tokio::spawn(syncer.run(rx, shutdown.clone())));
            queues.push(tx);
        }

        let handle = SyncerHandle {
            queues: queues.into(),
        };
        (handle, Self { tasks, shutdown })
    }

    /// Stops the syncers after every message queued so far has been applied.
    pub(crate) async fn shutdown(self) {
        self.shutdown.cancel();
        for result in future::join_all(self.tasks).await {
            if let Err(err) = result {
                tracing::error!(error = %err, "syncer task failed");
            }
        }
    }
}

struct Syncer<V: CacheValue> {
    name: &'static str,
    id: usize,
    store: Arc<CacheStore<V>>,
    tracker: Arc<ReadyTracker>,
}

impl<V: CacheValue> Syncer<V> {
    async fn run(self, mut rx: mpsc::Receiver<SyncMessage<V>>, shutdown: CancellationToken) {
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

        // drain whatever producers managed to queue before the stop
        rx.close();
        while let Some(message) = rx.recv().await {
            self.apply(message);
        }
        tracing::trace!(cache = self.name, syncer = self.id, "syncer stopped");
    }

    fn apply(&self, message: SyncMessage<V>) {
        match message {
            SyncMessage::Upsert { value, done } => {
                let key = value.key().clone();
                // deleted while in flight, only explicit single key refreshes bring it back
                if done.is_none() && !self.store.contains(&key) && !self.store.is_outstanding(&key)
                {
                    metric!(counter("caches.syncer.discard") += 1, "cache" => self.name);
                    tracing::trace!(cache = self.name, %key, "discarded entry of a deleted key");
                    return;
                }
                if self.store.upsert(value) {
                    self.tracker.update(|counters| {
                        // a key nobody counted is counted now
                        if !self.store.settle(&key) {
                            counters.requested += 1;
                        }
                        counters.materialized += 1;
                    });
                    metric!(counter("caches.syncer.upsert") += 1, "cache" => self.name, "new" => "true");
                } else {
                    metric!(counter("caches.syncer.upsert") += 1, "cache" => self.name, "new" => "false");
                }
                tracing::trace!(cache = self.name, %key, "upserted entry");
                if let Some(done) = done {
                    done.send(()).ok();
                }
            }
            SyncMessage::Remove { key } => {
                if self.store.remove(&key).is_some() {
                    self.tracker.update(|counters| {
                        counters.materialized -= 1;
                        counters.requested -= 1;
                    });
                    metric!(counter("caches.syncer.remove") += 1, "cache" => self.name);
                    tracing::trace!(cache = self.name, %key, "removed entry");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::caching::Counters;

    #[derive(Clone, Debug, Serialize, Deserialize)]
    struct Version {
        key: String,
        version: u32,
    }

    impl CacheValue for Version {
        type Key = String;

        fn key(&self) -> &String {
            &self.key
        }
    }

    /// Interleaves upserts and removals of a few keys and returns what the store ends up with.
    async fn apply_sequence(syncers: usize) -> Vec<(String, Option<u32>)> {
        let store = Arc::new(CacheStore::<Version>::new());
        let tracker = Arc::new(ReadyTracker::new());
        let (handle, pool) =
            SyncerPool::spawn("test", syncers, 1, Arc::clone(&store), Arc::clone(&tracker));

        let keys = ["alpha", "beta", "gamma"];
        let mut live = HashSet::new();
        for version in 0..60 {
            let key = keys[version as usize % keys.len()].to_owned();
            if version % 7 == 0 {
                live.remove(&key);
                handle.remove(key).await.unwrap();
            } else if live.insert(key.clone()) {
                // a key that is not cached is only stored when asked for explicitly
                handle.upsert_and_wait(Version { key, version }).await.unwrap();
            } else {
                handle.upsert(Version { key, version }).await.unwrap();
            }
        }
        pool.shutdown().await;

        let counters = tracker.counters();
        assert_eq!(counters.materialized, store.len() as i64);
        assert!(counters.is_ready());

        keys.iter()
            .map(|key| (key.to_string(), store.get(*key).map(|v| v.version)))
            .collect()
    }

    #[tokio::test]
    async fn test_last_mutation_wins() {
        let expected = vec![
            ("alpha".to_owned(), Some(57)),
            ("beta".to_owned(), Some(58)),
            ("gamma".to_owned(), Some(59)),
        ];
        assert_eq!(apply_sequence(1).await, expected);
        // routing by key keeps the order per key with any number of syncers
        assert_eq!(apply_sequence(4).await, expected);
    }

    #[tokio::test]
    async fn test_remove_last() {
        let store = Arc::new(CacheStore::<Version>::new());
        let tracker = Arc::new(ReadyTracker::new());
        let (handle, pool) =
            SyncerPool::spawn("test", 3, 1, Arc::clone(&store), Arc::clone(&tracker));

        let first = Version {
            key: "alpha".into(),
            version: 0,
        };
        handle.upsert_and_wait(first).await.unwrap();
        for version in 1..10 {
            let key = "alpha".to_owned();
            handle.upsert(Version { key, version }).await.unwrap();
        }
        handle.remove("alpha".to_owned()).await.unwrap();
        handle.remove("alpha".to_owned()).await.unwrap();
        pool.shutdown().await;

        assert!(store.is_empty());
        assert_eq!(tracker.counters(), Default::default());
    }

    #[tokio::test]
    async fn test_upsert_and_wait() {
        let store = Arc::new(CacheStore::<Version>::new());
        let tracker = Arc::new(ReadyTracker::new());
        let (handle, pool) =
            SyncerPool::spawn("test", 2, 1, Arc::clone(&store), Arc::clone(&tracker));

        let value = Version {
            key: "alpha".into(),
            version: 1,
        };
        handle.upsert_and_wait(value).await.unwrap();
        assert_eq!(store.get("alpha").unwrap().version, 1);

        pool.shutdown().await;
        assert!(handle.upsert_and_wait(Version {
            key: "beta".into(),
            version: 1,
        })
        .await
        .is_err());
    }

    #[tokio::test]
    async fn test_unrequested_upsert_is_discarded() {
        let store = Arc::new(CacheStore::<Version>::new());
        let tracker = Arc::new(ReadyTracker::new());
        let (handle, pool) =
            SyncerPool::spawn("test", 1, 1, Arc::clone(&store), Arc::clone(&tracker));

        let requested = "alpha".to_owned();
        assert!(store.begin_request(&requested));
        tracker.update(|c| c.requested += 1);

        handle
            .upsert(Version {
                key: requested,
                version: 1,
            })
            .await
            .unwrap();
        handle
            .upsert(Version {
                key: "beta".into(),
                version: 1,
            })
            .await
            .unwrap();
        pool.shutdown().await;

        assert!(store.get("alpha").is_some());
        assert!(store.get("beta").is_none());
        assert_eq!(
            tracker.counters(),
            Counters {
                requested: 1,
                materialized: 1
            }
        );
    }

    #[test]
    fn test_partition_is_stable() {
        let first = partition("stake1u9example", 5);
        for _ in 0..10 {
            assert_eq!(partition("stake1u9example", 5), first);
        }
        assert!(first < 5);
        assert_eq!(partition("anything", 1), 0);
        assert_eq!(partition("anything", 0), 0);
    }
}
