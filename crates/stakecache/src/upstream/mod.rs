//! Access to the ledger index the caches are filled from.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

pub mod koios;

pub use koios::KoiosClient;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream request failed")]
    Http(#[from] reqwest::Error),
    #[error("upstream responded with status {0}")]
    Status(reqwest::StatusCode),
    #[error("malformed upstream response: {0}")]
    Malformed(String),
    #[error("{0}")]
    Other(String),
}

impl UpstreamError {
    /// A short name of the error kind, used to tag metrics.
    pub fn metric_tag(&self) -> &'static str {
        match self {
            UpstreamError::Timeout(_) => "timeout",
            UpstreamError::Http(_) => "http",
            UpstreamError::Status(_) => "status",
            UpstreamError::Malformed(_) => "malformed",
            UpstreamError::Other(_) => "other",
        }
    }
}

/// Resolves batches of keys against the upstream.
///
/// The returned map may hold fewer entries than `keys`. A key absent from the result is not an
/// error, it is up to the cache what that means.
#[async_trait]
pub trait UpstreamClient<K, V>: Send + Sync + 'static {
    async fn resolve_many(&self, keys: &[K]) -> Result<HashMap<K, V>, UpstreamError>;
}

#[async_trait]
impl<K, V, T> UpstreamClient<K, V> for Arc<T>
where
    K: Sync + 'static,
    V: 'static,
    T: UpstreamClient<K, V> + ?Sized,
{
    async fn resolve_many(&self, keys: &[K]) -> Result<HashMap<K, V>, UpstreamError> {
        (**self).resolve_many(keys).await
    }
}
