use std::sync::Arc;

use async_trait::async_trait;

use super::{
    CacheOptions, CacheStore, CacheValue, MissingReporter, StageClosed, StageConfig, SyncerHandle,
};

/// Everything a [`Pipeline`] needs to wire up its stages.
#[derive(Debug)]
pub struct PipelineContext<V: CacheValue> {
    pub(crate) name: &'static str,
    pub(crate) options: CacheOptions,
    pub(crate) store: Arc<CacheStore<V>>,
    pub(crate) syncer: SyncerHandle<V>,
    pub(crate) missing: Option<MissingReporter<V::Key>>,
}

impl<V: CacheValue> PipelineContext<V> {
    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn store(&self) -> &Arc<CacheStore<V>> {
        &self.store
    }

    /// Where resolved values are sent to be stored.
    pub fn syncer(&self) -> &SyncerHandle<V> {
        &self.syncer
    }

    /// Present if the pipeline tracks keys missing upstream.
    pub fn missing(&self) -> Option<&MissingReporter<V::Key>> {
        self.missing.as_ref()
    }

    pub(crate) fn stage(&self, stage: &'static str) -> StageConfig {
        StageConfig {
            cache: self.name,
            stage,
            batchers: self.options.batchers,
            queue_size: self.options.queue_size,
            max_batch_size: self.options.max_batch_size,
            interval: self.options.batch_interval,
        }
    }
}

/// Describes how the keys of a cache are resolved upstream.
pub trait Pipeline: Send + Sync + 'static {
    type Value: CacheValue;
    type Stages: Stages<Self::Value>;

    /// Name of the cache, used for logs, metrics and the snapshot file.
    const NAME: &'static str;

    /// Whether the cache maintains a set of keys the upstream does not know.
    const TRACKS_MISSING: bool = false;

    /// Spawns the batching stages of a starting cache.
    fn spawn(&self, context: PipelineContext<Self::Value>) -> Self::Stages;
}

/// The running batching stages of a cache.
#[async_trait]
pub trait Stages<V: CacheValue>: Send + Sync + 'static {
    /// Submits a key which was added to the cache.
    async fn request(&self, key: V::Key) -> Result<(), StageClosed>;

    /// Re-submits an entry which is already cached.
    async fn refresh(&self, value: Arc<V>) -> Result<(), StageClosed>;

    /// Stops all stages, the earliest stage first.
    async fn shutdown(&self);
}
