use std::borrow::Borrow;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::lifecycle::{Lifecycle, Transition};
use super::missing::MissingWorker;
use super::syncer::SyncerPool;
use super::{
    CacheOptions, CacheStore, CacheValue, Counters, LifecycleError, MissingReporter, MissingSet,
    Pipeline, PipelineContext, ReadyTracker, Stages, State, SyncerHandle, snapshot,
};

type KeyOf<P> = <<P as Pipeline>::Value as CacheValue>::Key;

/// The channels into the workers of a running cache.
pub(crate) struct Handles<P: Pipeline> {
    pub stages: P::Stages,
    pub syncer: SyncerHandle<P::Value>,
    pub missing: Option<MissingReporter<KeyOf<P>>>,
}

struct Running<P: Pipeline> {
    handles: Arc<Handles<P>>,
    refresher: Refresher,
    missing: Option<MissingWorker>,
    syncers: SyncerPool,
}

struct CacheInner<P: Pipeline> {
    pipeline: P,
    options: CacheOptions,
    store: Arc<CacheStore<P::Value>>,
    tracker: Arc<ReadyTracker>,
    missing: Arc<MissingSet<KeyOf<P>>>,
    lifecycle: Lifecycle,
    running: Mutex<Option<Running<P>>>,
}

/// A batched asynchronous refresh cache.
///
/// Reads never block and never touch the upstream. Keys are registered with [`add`](Self::add)
/// and resolved in the background by the [`Pipeline`] `P`.
///
/// The cache is cheap to clone, all clones share the same state.
pub struct RefreshCache<P: Pipeline> {
    inner: Arc<CacheInner<P>>,
}

impl<P: Pipeline> Clone for RefreshCache<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: Pipeline> fmt::Debug for RefreshCache<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshCache")
            .field("name", &P::NAME)
            .field("state", &self.inner.lifecycle.state())
            .field("len", &self.len())
            .field("counters", &self.counters())
            .finish()
    }
}

impl<P: Pipeline> RefreshCache<P> {
    /// Creates a stopped cache, restoring its contents from a snapshot if one is configured.
    pub fn new(pipeline: P, options: CacheOptions) -> Self {
        let options = options.normalized();
        let store = Arc::new(CacheStore::new());
        let tracker = Arc::new(ReadyTracker::new());
        if let Some(dir) = &options.snapshot_dir {
            snapshot::restore(dir, P::NAME, &store, &tracker);
        }

        Self {
            inner: Arc::new(CacheInner {
                pipeline,
                options,
                store,
                tracker,
                missing: Arc::new(MissingSet::default()),
                lifecycle: Lifecycle::new(),
                running: Mutex::new(None),
            }),
        }
    }

    /// Creates a new cache sharing this cache's entries and counters, but resolving keys through
    /// `pipeline` with different options.
    ///
    /// Only possible while the cache is not running.
    pub fn with_options(&self, pipeline: P, options: CacheOptions) -> Result<Self, LifecycleError> {
        match self.inner.lifecycle.state() {
            State::NotRunning => {}
            State::Running => return Err(LifecycleError::AlreadyRunning),
            State::Starting | State::Stopping => return Err(LifecycleError::Transitioning),
        }

        Ok(Self {
            inner: Arc::new(CacheInner {
                pipeline,
                options: options.normalized(),
                store: Arc::clone(&self.inner.store),
                tracker: Arc::clone(&self.inner.tracker),
                missing: Arc::clone(&self.inner.missing),
                lifecycle: Lifecycle::new(),
                running: Mutex::new(None),
            }),
        })
    }

    pub fn name(&self) -> &'static str {
        P::NAME
    }

    pub fn options(&self) -> &CacheOptions {
        &self.inner.options
    }

    pub fn pipeline(&self) -> &P {
        &self.inner.pipeline
    }

    pub(crate) fn store(&self) -> &CacheStore<P::Value> {
        &self.inner.store
    }

    pub(crate) fn missing_set(&self) -> &MissingSet<KeyOf<P>> {
        &self.inner.missing
    }

    pub(crate) fn handles(&self) -> Option<Arc<Handles<P>>> {
        let running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        running.as_ref().map(|running| Arc::clone(&running.handles))
    }

    /// Spawns the workers of this cache.
    ///
    /// Starting a running cache does nothing. Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<(), LifecycleError> {
        if self.inner.lifecycle.begin_start()? == Transition::Done {
            return Ok(());
        }

        let inner = &self.inner;
        let options = &inner.options;
        let (syncer, syncers) = SyncerPool::spawn(
            P::NAME,
            options.syncers,
            options.queue_size,
            Arc::clone(&inner.store),
            Arc::clone(&inner.tracker),
        );

        let (missing, missing_worker) = if P::TRACKS_MISSING {
            let (reporter, worker) = MissingWorker::spawn(
                P::NAME,
                options.queue_size,
                Arc::clone(&inner.missing),
                Arc::clone(&inner.store),
                Arc::clone(&inner.tracker),
            );
            (Some(reporter), Some(worker))
        } else {
            (None, None)
        };

        let stages = inner.pipeline.spawn(PipelineContext {
            name: P::NAME,
            options: options.clone(),
            store: Arc::clone(&inner.store),
            syncer: syncer.clone(),
            missing: missing.clone(),
        });

        let handles = Arc::new(Handles {
            stages,
            syncer,
            missing,
        });
        let refresher = Refresher::spawn(self.clone_weak(), options.refresh_interval);

        *inner.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(Running {
            handles,
            refresher,
            missing: missing_worker,
            syncers,
        });
        inner.lifecycle.finish(State::Running);

        tracing::info!(
            cache = P::NAME,
            batchers = options.batchers,
            syncers = options.syncers,
            "cache started"
        );
        Ok(())
    }

    /// Stops all workers and writes the snapshot.
    ///
    /// Keys still waiting in a batcher are dropped, everything already handed to the syncers is
    /// applied before the snapshot is written. Stopping a stopped cache does nothing.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        if self.inner.lifecycle.begin_stop()? == Transition::Done {
            return Ok(());
        }

        let running = self
            .inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(running) = running {
            // every worker is stopped before the ones it sends to
            running.refresher.shutdown().await;
            running.handles.stages.shutdown().await;
            if let Some(missing) = running.missing {
                missing.shutdown().await;
            }
            running.syncers.shutdown().await;
        }

        if let Some(dir) = self.inner.options.snapshot_dir.clone() {
            if !self.inner.store.is_empty() {
                let store = Arc::clone(&self.inner.store);
                let persisted =
                    tokio::task::spawn_blocking(move || snapshot::persist(&dir, P::NAME, &store))
                        .await;
                if let Err(err) = persisted {
                    tracing::error!(error = %err, cache = P::NAME, "snapshot task failed");
                }
            }
        }

        self.inner.lifecycle.finish(State::NotRunning);
        tracing::info!(cache = P::NAME, "cache stopped");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.lifecycle.state() == State::Running
    }

    /// Returns the entry for `key`, which may be its primary key or one of its aliases.
    pub fn get<Q>(&self, key: &Q) -> Option<Arc<P::Value>>
    where
        KeyOf<P>: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.store.get(key)
    }

    /// Counts `key` as requested unless it is cached, outstanding or known to be missing.
    pub(crate) fn count_request(&self, key: &KeyOf<P>) {
        let inner = &self.inner;
        inner.tracker.update(|counters| {
            if !inner.missing.contains(key) && inner.store.begin_request(key) {
                counters.requested += 1;
            }
        });
    }

    pub async fn add(&self, key: KeyOf<P>) {
        self.add_many([key]).await
    }

    /// Registers `keys` with the cache and submits them for resolution.
    ///
    /// Waits while the batchers are busy. Does nothing if the cache is not running.
    pub async fn add_many<I>(&self, keys: I)
    where
        I: IntoIterator<Item = KeyOf<P>>,
    {
        let Some(handles) = self.handles() else {
            tracing::debug!(cache = P::NAME, "ignoring keys added to a stopped cache");
            return;
        };

        for key in keys {
            self.count_request(&key);
            if handles.stages.request(key).await.is_err() {
                tracing::debug!(cache = P::NAME, "cache stopped while adding keys");
                return;
            }
        }
    }

    pub async fn del(&self, key: KeyOf<P>) {
        self.del_many([key]).await
    }

    /// Removes the entries for `keys`. Aliases are resolved to the entry they refer to.
    pub async fn del_many<I>(&self, keys: I)
    where
        I: IntoIterator<Item = KeyOf<P>>,
    {
        let Some(handles) = self.handles() else {
            tracing::debug!(cache = P::NAME, "ignoring keys deleted from a stopped cache");
            return;
        };

        let inner = &self.inner;
        for key in keys {
            let key = inner.store.primary_key(&key).unwrap_or(key);
            // a key still being resolved is given up right away, its result is discarded
            inner.tracker.update(|counters| {
                if inner.store.settle(&key) {
                    counters.requested -= 1;
                }
            });
            if let Some(missing) = &handles.missing {
                if inner.missing.contains(&key) && missing.forget(key.clone()).await.is_err() {
                    return;
                }
            }
            if handles.syncer.remove(key).await.is_err() {
                tracing::debug!(cache = P::NAME, "cache stopped while deleting keys");
                return;
            }
        }
    }

    /// Re-submits every cached entry and every key still waiting to be resolved.
    pub async fn refresh(&self) {
        let Some(handles) = self.handles() else {
            return;
        };
        refresh_all(&self.inner, &handles).await;
    }

    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// A consistent snapshot of both counters.
    pub fn counters(&self) -> Counters {
        self.inner.tracker.counters()
    }

    pub fn requested(&self) -> i64 {
        self.counters().requested
    }

    pub fn materialized(&self) -> i64 {
        self.counters().materialized
    }

    pub fn pending(&self) -> u64 {
        self.counters().pending()
    }

    pub fn ready(&self) -> bool {
        self.counters().is_ready()
    }

    /// Waits up to `timeout` for every requested key to be materialized.
    ///
    /// Returns `false` right away if the cache is not running, as nothing could make progress.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        if !self.is_running() {
            return false;
        }
        self.inner.tracker.wait_ready(timeout).await
    }

    /// Whether the upstream did not know `key` when it was last looked up.
    pub fn is_missing<Q>(&self, key: &Q) -> bool
    where
        KeyOf<P>: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.missing.contains(key)
    }

    /// All keys the upstream did not know when they were last looked up.
    pub fn missing(&self) -> Vec<KeyOf<P>> {
        self.inner.missing.list()
    }

    fn clone_weak(&self) -> WeakCache<P> {
        WeakCache {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

async fn refresh_all<P: Pipeline>(inner: &CacheInner<P>, handles: &Handles<P>) {
    let values = inner.store.values();
    let outstanding = inner.store.outstanding();
    tracing::debug!(
        cache = P::NAME,
        entries = values.len(),
        outstanding = outstanding.len(),
        "refreshing cache"
    );

    for value in values {
        if handles.stages.refresh(value).await.is_err() {
            return;
        }
    }
    for key in outstanding {
        if handles.stages.request(key).await.is_err() {
            return;
        }
    }
}

/// A handle to a cache that does not keep it alive.
struct WeakCache<P: Pipeline> {
    inner: std::sync::Weak<CacheInner<P>>,
}

/// Periodically re-submits all keys of a cache.
struct Refresher {
    task: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl Refresher {
    fn spawn<P: Pipeline>(cache: WeakCache<P>, interval: Duration) -> Self {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_refresher(cache, interval, shutdown.clone()));
        Self { task, shutdown }
    }

    async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "refresher task failed");
        }
    }
}

async fn run_refresher<P: Pipeline>(
    cache: WeakCache<P>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let start = tokio::time::Instant::now() + interval;
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = cache.inner.upgrade() else {
            break;
        };
        let Some(handles) = inner
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|running| Arc::clone(&running.handles))
        else {
            break;
        };

        let counters = inner.tracker.counters();
        metric!(gauge("caches.pending") = counters.pending(), "cache" => P::NAME);
        tracing::debug!(
            cache = P::NAME,
            requested = counters.requested,
            materialized = counters.materialized,
            "periodic refresh"
        );

        tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            _ = refresh_all(&inner, &handles) => {}
        }
    }
}
