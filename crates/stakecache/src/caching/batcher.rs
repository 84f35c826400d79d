//! Convergence batching of upstream lookups.
//!
//! A batcher collects keys into a working set and only talks to the upstream once the set
//! stopped changing between two ticks, or once it reached the configured maximum size. Bursts of
//! requests thus end up in a few large upstream calls rather than many small ones.

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::StageClosed;
use super::syncer::partition;
use crate::upstream::UpstreamClient;

/// An item that can be collected by a batcher.
///
/// Items with the same [`batch_id`](BatchItem::batch_id) are collapsed within one round, and the
/// id decides which batcher of a stage handles the item.
pub trait BatchItem: Send + 'static {
    type Id: Clone + Eq + Hash + Send;

    fn batch_id(&self) -> Self::Id;
}

impl BatchItem for String {
    type Id = String;

    fn batch_id(&self) -> String {
        self.clone()
    }
}

/// Processes a flushed batch, typically by resolving it upstream and forwarding the results.
#[async_trait]
pub trait BatchHandler<I>: Send + Sync + 'static {
    async fn handle(&self, batch: Vec<I>);
}

/// Why a batch was flushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FlushTrigger {
    /// The working set reached the maximum batch size.
    Size,
    /// The working set did not change since the previous tick.
    Stable,
}

impl FlushTrigger {
    fn as_str(self) -> &'static str {
        match self {
            FlushTrigger::Size => "size",
            FlushTrigger::Stable => "stable",
        }
    }
}

/// The working set of one batcher.
#[derive(Debug)]
pub(crate) struct BatchWindow<I: BatchItem> {
    items: HashMap<I::Id, I>,
    previous_len: usize,
    max_batch_size: usize,
}

impl<I: BatchItem> BatchWindow<I> {
    pub(crate) fn new(max_batch_size: usize) -> Self {
        Self {
            items: HashMap::new(),
            previous_len: 0,
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Adds `item`, returning `true` once the window is full and has to be flushed.
    pub(crate) fn insert(&mut self, item: I) -> bool {
        self.items.insert(item.batch_id(), item);
        self.items.len() >= self.max_batch_size
    }

    /// Decides on a tick whether the window has converged.
    pub(crate) fn on_tick(&mut self) -> Option<FlushTrigger> {
        let len = self.items.len();
        if len >= self.max_batch_size {
            Some(FlushTrigger::Size)
        } else if len == self.previous_len {
            (len > 0).then_some(FlushTrigger::Stable)
        } else {
            self.previous_len = len;
            None
        }
    }

    pub(crate) fn take(&mut self) -> Vec<I> {
        self.previous_len = 0;
        self.items.drain().map(|(_, item)| item).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }
}

/// Sends items to the batcher of a stage responsible for them.
pub struct BatcherHandle<I: BatchItem> {
    queues: Arc<[mpsc::Sender<I>]>,
}

impl<I: BatchItem> Clone for BatcherHandle<I> {
    fn clone(&self) -> Self {
        Self {
            queues: Arc::clone(&self.queues),
        }
    }
}

impl<I: BatchItem> fmt::Debug for BatcherHandle<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatcherHandle")
            .field("batchers", &self.queues.len())
            .finish()
    }
}

impl<I: BatchItem> BatcherHandle<I> {
    /// Queues `item`, waiting while the responsible batcher is busy.
    pub async fn submit(&self, item: I) -> Result<(), StageClosed> {
        let index = partition(&item.batch_id(), self.queues.len());
        self.queues[index]
            .send(item)
            .await
            .map_err(|_| StageClosed)
    }
}

/// The configuration of one batching stage.
#[derive(Clone, Copy, Debug)]
pub(crate) struct StageConfig {
    pub cache: &'static str,
    pub stage: &'static str,
    pub batchers: usize,
    pub queue_size: usize,
    pub max_batch_size: usize,
    pub interval: Duration,
}

/// The running batchers of one stage.
#[derive(Debug)]
pub struct BatcherPool {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl BatcherPool {
    pub(crate) fn spawn<I, H>(config: StageConfig, handler: H) -> (BatcherHandle<I>, Self)
    where
        I: BatchItem,
        H: BatchHandler<I>,
    {
        let handler = Arc::new(handler);
        let shutdown = CancellationToken::new();
        let mut queues = Vec::with_capacity(config.batchers);
        let mut tasks = Vec::with_capacity(config.batchers);

        for id in 0..config.batchers {
            let (tx, rx) = mpsc::channel(config.queue_size);
            let batcher = Batcher {
                id,
                config,
                handler: Arc::clone(&handler),
            };
            tasks.push(tokio::spawn(batcher.run(rx, shutdown.clone())));
            queues.push(tx);
        }

        let handle = BatcherHandle {
            queues: queues.into(),
        };
        let pool = Self {
            tasks: Mutex::new(tasks),
            shutdown,
        };
        (handle, pool)
    }

    /// Stops all batchers of this stage, dropping keys which were not flushed yet.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for result in future::join_all(tasks).await {
            if let Err(err) = result {
                tracing::error!(error = %err, "batcher task failed");
            }
        }
    }
}

struct Batcher<H> {
    id: usize,
    config: StageConfig,
    handler: Arc<H>,
}

impl<H> Batcher<H> {
    async fn run<I>(self, mut rx: mpsc::Receiver<I>, shutdown: CancellationToken)
    where
        I: BatchItem,
        H: BatchHandler<I>,
    {
        let mut window = BatchWindow::new(self.config.max_batch_size);
        let start = tokio::time::Instant::now() + self.config.interval;
        let mut ticker = tokio::time::interval_at(start, self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let trigger = tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => window.on_tick(),
                item = rx.recv() => match item {
                    Some(item) => window.insert(item).then_some(FlushTrigger::Size),
                    None => break,
                },
            };

            let Some(trigger) = trigger else {
                continue;
            };
            let batch = window.take();
            metric!(
                counter("caches.batch.flush") += 1,
                "cache" => self.config.cache,
                "stage" => self.config.stage,
                "trigger" => trigger.as_str(),
            );
            metric!(
                histogram("caches.batch.size") = batch.len() as u64,
                "cache" => self.config.cache,
                "stage" => self.config.stage,
            );
            tracing::debug!(
                cache = self.config.cache,
                stage = self.config.stage,
                batcher = self.id,
                size = batch.len(),
                trigger = trigger.as_str(),
                "flushing batch"
            );

            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,
                _ = self.handler.handle(batch) => {}
            }
        }

        if window.len() > 0 {
            tracing::debug!(
                cache = self.config.cache,
                stage = self.config.stage,
                batcher = self.id,
                dropped = window.len(),
                "batcher stopped with unflushed keys"
            );
        }
    }
}

/// Resolves one batch against `client`, recording timing and failures.
///
/// Failed rounds are logged and yield `None`. The keys of a failed round are not retried.
pub(crate) async fn fetch_round<K, V, C>(
    cache: &'static str,
    stage: &'static str,
    client: &C,
    keys: &[K],
) -> Option<HashMap<K, V>>
where
    K: Send + Sync,
    C: UpstreamClient<K, V> + ?Sized,
{
    let start = Instant::now();
    let result = client.resolve_many(keys).await;
    metric!(
        timer("caches.upstream.duration") = start.elapsed(),
        "cache" => cache,
        "stage" => stage,
    );

    match result {
        Ok(resolved) => {
            metric!(
                counter("caches.upstream.request") += 1,
                "cache" => cache,
                "stage" => stage,
                "status" => "ok",
            );
            tracing::debug!(
                cache,
                stage,
                requested = keys.len(),
                resolved = resolved.len(),
                "upstream round finished"
            );
            Some(resolved)
        }
        Err(err) => {
            metric!(
                counter("caches.upstream.request") += 1,
                "cache" => cache,
                "stage" => stage,
                "status" => err.metric_tag(),
            );
            let stderr: &dyn std::error::Error = &err;
            tracing::error!(stderr, cache, stage, keys = keys.len(), "upstream round failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::Mutex as AsyncMutex;

    use super::*;

    #[test]
    fn test_window_converges() {
        let mut window = BatchWindow::<String>::new(10);
        assert_eq!(window.on_tick(), None);

        window.insert("a".into());
        window.insert("b".into());
        // grew since the last tick
        assert_eq!(window.on_tick(), None);
        // unchanged since the last tick
        assert_eq!(window.on_tick(), Some(FlushTrigger::Stable));

        let mut batch = window.take();
        batch.sort();
        assert_eq!(batch, ["a", "b"]);
        assert_eq!(window.on_tick(), None);
    }

    #[test]
    fn test_window_collapses_duplicates() {
        let mut window = BatchWindow::<String>::new(2);
        assert!(!window.insert("a".into()));
        assert!(!window.insert("a".into()));
        assert!(window.insert("b".into()));
        assert_eq!(window.take().len(), 2);
    }

    #[test]
    fn test_window_full_on_tick() {
        let mut window = BatchWindow::<String>::new(1);
        window.insert("a".into());
        assert_eq!(window.on_tick(), Some(FlushTrigger::Size));
    }

    #[derive(Default)]
    struct Recorder {
        batches: AsyncMutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl BatchHandler<String> for Arc<Recorder> {
        async fn handle(&self, batch: Vec<String>) {
            self.batches.lock().await.push(batch);
        }
    }

    fn stage(max_batch_size: usize) -> StageConfig {
        StageConfig {
            cache: "test",
            stage: "lookup",
            batchers: 1,
            queue_size: 1,
            max_batch_size,
            interval: Duration::from_secs(1),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_after_quiet_ticks() {
        let recorder = Arc::new(Recorder::default());
        let (handle, pool) = BatcherPool::spawn(stage(100), Arc::clone(&recorder));

        for key in ["a", "b", "c"] {
            handle.submit(key.to_owned()).await.unwrap();
        }
        // the first tick records the size, the second one sees it unchanged
        tokio::time::sleep(Duration::from_millis(2500)).await;

        let batches = recorder.batches.lock().await.clone();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);

        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_when_full() {
        let recorder = Arc::new(Recorder::default());
        let (handle, pool) = BatcherPool::spawn(stage(10), Arc::clone(&recorder));

        for i in 0..35 {
            handle.submit(format!("key{i}")).await.unwrap();
        }
        tokio::task::yield_now().await;
        {
            let batches = recorder.batches.lock().await;
            assert_eq!(batches.len(), 3);
            assert!(batches.iter().all(|batch| batch.len() == 10));
        }

        tokio::time::sleep(Duration::from_millis(2500)).await;
        let batches = recorder.batches.lock().await;
        assert_eq!(batches.len(), 4);
        assert_eq!(batches[3].len(), 5);
        drop(batches);

        pool.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drops_window() {
        let recorder = Arc::new(Recorder::default());
        let (handle, pool) = BatcherPool::spawn(stage(10), Arc::clone(&recorder));

        handle.submit("a".to_owned()).await.unwrap();
        pool.shutdown().await;

        assert!(recorder.batches.lock().await.is_empty());
        assert!(handle.submit("b".to_owned()).await.is_err());
    }
}
