//! Batched asynchronous refresh caches for stake account and stake pool facts.
//!
//! See the [`caching`] module for how the caches work, and [`accounts`] and [`pools`] for the two
//! concrete caches.

#[macro_use]
pub mod metrics;

pub mod accounts;
pub mod caching;
pub mod config;
pub mod hints;
pub mod logging;
pub mod pools;
pub mod upstream;


pub use accounts::{AccountCache, AccountInfo, AccountPipeline, RefreshError};
pub use caching::{CacheOptions, LifecycleError, RefreshCache};
pub use pools::{PoolCache, PoolIds, PoolInfo, PoolPipeline};
pub use upstream::{KoiosClient, UpstreamClient, UpstreamError};
