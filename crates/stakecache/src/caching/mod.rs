//! # Refresh cache infrastructure
//!
//! Reading account and pool facts from the ledger index is slow, paginated and rate limited. The
//! caches in this crate sit in front of it: callers register the keys they are interested in and
//! read whatever is currently known, without ever blocking on the upstream.
//!
//! ## Architecture
//!
//! A [`RefreshCache`] is a small pipeline of worker tasks connected by bounded queues:
//!
//! - One or more batching stages. Each stage runs a number of batchers which collect keys into a
//!   working set, and resolve the whole set upstream once it stopped growing between two ticks or
//!   reached the maximum batch size. Keys are assigned to batchers by a stable hash.
//! - A pool of syncers, the only writers of the [`CacheStore`]. Messages for one key always go to
//!   the same syncer, so upserts and removals of a key are applied in the order they were queued.
//! - For caches whose keys need a resolution step that can fail permanently, a missing worker
//!   maintains the [`MissingSet`] of keys the upstream does not know about.
//! - A periodic refresher which re-submits every known key.
//!
//! What stages exist and how they talk to the upstream is decided by the [`Pipeline`] of the cache.
//!
//! Every queue is bounded, by default with a capacity of one. A slow upstream thus stalls its
//! batcher, which in turn makes [`RefreshCache::add`] wait. This is intentional backpressure.
//!
//! ## Readiness
//!
//! Every cache counts how many keys it has been asked for and how many it holds. The cache is
//! *ready* once both counters are equal:
//!
//! - Adding a key which is neither cached, outstanding nor known to be missing counts it as
//!   requested.
//! - The first upsert of a key counts it as materialized.
//! - Removing a key uncounts it from both counters.
//! - A key found missing upstream is uncounted from the requested counter until it resolves.
//!
//! The requested counter is never behind the materialized counter, so the number of pending keys
//! never goes negative. [`RefreshCache::wait_ready`] lets any number of callers wait for the cache
//! to catch up.
//!
//! ### Metrics
//!
//! Every metric is tagged with the `cache` it belongs to:
//!
//! - `caches.upstream.request`: Upstream rounds, tagged with `stage` and `status`.
//! - `caches.upstream.duration`: Time spent in upstream rounds.
//! - `caches.batch.flush`: Flushed batches, tagged with the `trigger` (`size` or `stable`).
//! - `caches.batch.size`: A histogram of flushed batch sizes.
//! - `caches.syncer.upsert` / `caches.syncer.remove`: Applied store mutations.
//! - `caches.syncer.discard`: Resolved values dropped because their key was deleted meanwhile.
//! - `caches.missing.observed` / `caches.missing.resolved`: Changes of the missing set.
//! - `caches.pending`: A gauge of pending keys, emitted on every periodic refresh.
//! - `caches.snapshot.save` / `caches.snapshot.load`: Snapshot operations, tagged with `status`.
//!
//! ### Persistence
//!
//! If [`CacheOptions::snapshot_dir`] is set, a cache restores its contents from the directory when
//! it is created, and writes them back when it is stopped. See the [`snapshot`] module for details.

use std::fmt;
use std::hash::Hash;

use serde::Serialize;
use serde::de::DeserializeOwned;

mod batcher;
mod cache;
mod lifecycle;
mod missing;
mod pipeline;
mod ready;
pub mod snapshot;
mod store;
mod syncer;


pub use batcher::{BatchHandler, BatchItem, BatcherHandle, BatcherPool};
pub(crate) use batcher::{StageConfig, fetch_round};
pub use cache::RefreshCache;
pub use lifecycle::{LifecycleError, State};
pub use missing::{MissingReporter, MissingSet};
pub use pipeline::{Pipeline, PipelineContext, Stages};
pub use ready::{Counters, ReadyTracker};
pub use snapshot::SnapshotError;
pub use store::CacheStore;
pub use syncer::SyncerHandle;

pub use crate::config::CacheOptions;

/// A value held by a [`RefreshCache`].
pub trait CacheValue:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    type Key: Clone + Eq + Hash + fmt::Debug + fmt::Display + Send + Sync + 'static;

    /// The primary key of this value.
    fn key(&self) -> &Self::Key;

    /// Additional keys this value can be looked up by.
    fn aliases(&self) -> Vec<Self::Key> {
        Vec::new()
    }

    /// Carries over fields from the value this one replaces.
    ///
    /// Called by the syncer before an existing entry is replaced.
    fn merge_previous(&mut self, _previous: &Self) {}
}

/// A worker queue was closed because the cache is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("the cache is not running")]
pub struct StageClosed;
