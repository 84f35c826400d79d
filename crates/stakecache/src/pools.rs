//! The cache of stake pool facts, keyed by pool ticker.
//!
//! Pools are resolved in two stages. The first stage looks up the pool ids of a ticker in the
//! registry listing, the second one fetches the details of a pool by its bech32 id. Tickers the
//! registry listing does not know end up in the missing set, from where they can be resolved with
//! ids obtained elsewhere, see [`PoolCache::fill_missing_pool_infos`].
//!
//! Entries can be looked up by ticker, bech32 id or hex id.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::caching::{
    BatchHandler, BatchItem, BatcherHandle, BatcherPool, CacheValue, MissingReporter, Pipeline,
    PipelineContext, RefreshCache, Stages, StageClosed, SyncerHandle, fetch_round,
};
use crate::upstream::UpstreamClient;

/// The identifiers of a pool, as found in the registry listing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolIds {
    pub ticker: String,
    pub id_bech32: String,
    pub id_hex: String,
}

impl PoolIds {
    /// Ids for a pool known by its ticker and bech32 id, deriving the hex id from the latter.
    pub fn from_bech32(ticker: String, id_bech32: String) -> Self {
        let id_hex = bech32_to_hex(&id_bech32).unwrap_or_else(|| {
            tracing::debug!(%ticker, id = %id_bech32, "pool id is not valid bech32");
            String::new()
        });
        Self {
            ticker,
            id_bech32,
            id_hex,
        }
    }
}

/// Decodes a bech32 pool id into the hex encoding of its key hash.
pub fn bech32_to_hex(id: &str) -> Option<String> {
    let (_hrp, data) = bech32::decode(id).ok()?;
    Some(hex::encode(data))
}

// tickers sharing a pool id are fetched together but stored one by one
impl BatchItem for PoolIds {
    type Id = String;

    fn batch_id(&self) -> String {
        self.ticker.clone()
    }
}

/// The details of a pool, as returned by the pool info endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolDetails {
    pub id_bech32: String,
    pub id_hex: String,
    pub vrf_key_hash: String,
    /// Active stake in whole ADA.
    pub active_stake: u64,
    /// Live stake in whole ADA.
    pub live_stake: u64,
    pub live_delegators: u32,
    /// Ticker from the pool metadata, if it has any.
    pub ticker: Option<String>,
}

/// What the ledger knows about a stake pool.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PoolInfo {
    pub ticker: String,
    pub id_bech32: String,
    pub id_hex: String,
    pub vrf_key_hash: String,
    /// Active stake in whole ADA.
    pub active_stake: u64,
    /// Live stake in whole ADA.
    pub live_stake: u64,
    pub live_delegators: u32,
    /// Last block height the pool was seen minting, maintained by the caller.
    #[serde(skip)]
    block_height: AtomicU32,
}

impl Clone for PoolInfo {
    fn clone(&self) -> Self {
        Self {
            ticker: self.ticker.clone(),
            id_bech32: self.id_bech32.clone(),
            id_hex: self.id_hex.clone(),
            vrf_key_hash: self.vrf_key_hash.clone(),
            active_stake: self.active_stake,
            live_stake: self.live_stake,
            live_delegators: self.live_delegators,
            block_height: AtomicU32::new(self.block_height()),
        }
    }
}

impl PoolInfo {
    /// An entry carrying nothing but the identifiers of a pool.
    pub fn from_ids(ids: PoolIds) -> Self {
        Self {
            ticker: ids.ticker,
            id_bech32: ids.id_bech32,
            id_hex: ids.id_hex,
            ..Default::default()
        }
    }

    /// A complete entry for the pool with `ids`.
    ///
    /// The requested ticker is kept even if the pool metadata names a different one.
    pub fn from_details(ids: PoolIds, details: PoolDetails) -> Self {
        if let Some(ticker) = details.ticker.as_deref().filter(|t| *t != ids.ticker) {
            tracing::debug!(requested = %ids.ticker, metadata = ticker, "pool metadata ticker differs");
        }
        Self {
            ticker: ids.ticker,
            id_hex: if details.id_hex.is_empty() {
                ids.id_hex
            } else {
                details.id_hex
            },
            id_bech32: ids.id_bech32,
            vrf_key_hash: details.vrf_key_hash,
            active_stake: details.active_stake,
            live_stake: details.live_stake,
            live_delegators: details.live_delegators,
            block_height: AtomicU32::new(0),
        }
    }

    pub fn block_height(&self) -> u32 {
        self.block_height.load(Ordering::Relaxed)
    }

    /// Records the last block height of this pool.
    ///
    /// This is the only field of a cached entry that may change in place.
    pub fn set_block_height(&self, height: u32) {
        self.block_height.store(height, Ordering::Relaxed);
    }

    fn ids(&self) -> PoolIds {
        PoolIds {
            ticker: self.ticker.clone(),
            id_bech32: self.id_bech32.clone(),
            id_hex: self.id_hex.clone(),
        }
    }
}

impl CacheValue for PoolInfo {
    type Key = String;

    fn key(&self) -> &String {
        &self.ticker
    }

    fn aliases(&self) -> Vec<String> {
        [&self.id_bech32, &self.id_hex]
            .into_iter()
            .filter(|id| !id.is_empty())
            .cloned()
            .collect()
    }

    fn merge_previous(&mut self, previous: &Self) {
        fn keep<T: Default + PartialEq + Clone>(current: &mut T, previous: &T) {
            if *current == T::default() {
                *current = previous.clone();
            }
        }
        keep(&mut self.id_bech32, &previous.id_bech32);
        keep(&mut self.id_hex, &previous.id_hex);
        keep(&mut self.vrf_key_hash, &previous.vrf_key_hash);
        keep(&mut self.active_stake, &previous.active_stake);
        keep(&mut self.live_stake, &previous.live_stake);
        keep(&mut self.live_delegators, &previous.live_delegators);
        if self.block_height() == 0 {
            self.set_block_height(previous.block_height());
        }
    }
}

type RegistryUpstream = Arc<dyn UpstreamClient<String, PoolIds>>;
type DetailsUpstream = Arc<dyn UpstreamClient<String, PoolDetails>>;

/// Resolves tickers to pool ids, and pool ids to pool details.
#[derive(Clone)]
pub struct PoolPipeline {
    registry: RegistryUpstream,
    details: DetailsUpstream,
}

impl std::fmt::Debug for PoolPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolPipeline").finish_non_exhaustive()
    }
}

impl PoolPipeline {
    pub fn new(
        registry: impl UpstreamClient<String, PoolIds>,
        details: impl UpstreamClient<String, PoolDetails>,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            details: Arc::new(details),
        }
    }

    /// Uses `client` for both stages.
    pub fn from_client<C>(client: Arc<C>) -> Self
    where
        C: UpstreamClient<String, PoolIds> + UpstreamClient<String, PoolDetails>,
    {
        Self {
            registry: client.clone(),
            details: client,
        }
    }
}

pub type PoolCache = RefreshCache<PoolPipeline>;

impl Pipeline for PoolPipeline {
    type Value = PoolInfo;
    type Stages = PoolStages;

    const NAME: &'static str = "poolcache";
    const TRACKS_MISSING: bool = true;

    fn spawn(&self, context: PipelineContext<PoolInfo>) -> PoolStages {
        // the second stage has to exist before the first one can forward to it
        let fetch = FetchPoolDetails {
            upstream: Arc::clone(&self.details),
            syncer: context.syncer().clone(),
            missing: context.missing().cloned(),
        };
        let (details, details_pool) = BatcherPool::spawn(context.stage("details"), fetch);

        let lookup = LookupTickers {
            upstream: Arc::clone(&self.registry),
            syncer: context.syncer().clone(),
            missing: context.missing().cloned(),
            details: details.clone(),
        };
        let (tickers, tickers_pool) = BatcherPool::spawn(context.stage("tickers"), lookup);

        PoolStages {
            tickers,
            details,
            tickers_pool,
            details_pool,
        }
    }
}

#[derive(Debug)]
pub struct PoolStages {
    tickers: BatcherHandle<String>,
    details: BatcherHandle<PoolIds>,
    tickers_pool: BatcherPool,
    details_pool: BatcherPool,
}

#[async_trait]
impl Stages<PoolInfo> for PoolStages {
    async fn request(&self, ticker: String) -> Result<(), StageClosed> {
        self.tickers.submit(ticker).await
    }

    async fn refresh(&self, pool: Arc<PoolInfo>) -> Result<(), StageClosed> {
        if pool.id_bech32.is_empty() {
            self.tickers.submit(pool.ticker.clone()).await
        } else {
            self.details.submit(pool.ids()).await
        }
    }

    async fn shutdown(&self) {
        self.tickers_pool.shutdown().await;
        self.details_pool.shutdown().await;
    }
}

/// Reports `tickers` as resolved and waits until the missing set reflects that.
async fn mark_resolved(
    missing: Option<&MissingReporter<String>>,
    tickers: impl IntoIterator<Item = String>,
) -> Result<(), StageClosed> {
    let Some(missing) = missing else {
        return Ok(());
    };
    for ticker in tickers {
        missing.resolved(ticker).await?;
    }
    missing.sync().await
}

/// Resolves tickers to pool ids.
struct LookupTickers {
    upstream: RegistryUpstream,
    syncer: SyncerHandle<PoolInfo>,
    missing: Option<MissingReporter<String>>,
    details: BatcherHandle<PoolIds>,
}

impl LookupTickers {
    async fn forward(&self, batch: Vec<String>) -> Result<(), StageClosed> {
        let Some(mut resolved) =
            fetch_round(PoolPipeline::NAME, "tickers", &*self.upstream, &batch).await
        else {
            return Ok(());
        };

        let mut found = Vec::with_capacity(resolved.len());
        for ticker in batch {
            match resolved.remove(&ticker) {
                Some(ids) => found.push(PoolIds { ticker, ..ids }),
                None => {
                    if let Some(missing) = &self.missing {
                        missing.observed(ticker).await?;
                    }
                }
            }
        }

        mark_resolved(
            self.missing.as_ref(),
            found.iter().map(|ids| ids.ticker.clone()).collect::<Vec<_>>(),
        )
        .await?;
        for ids in found {
            self.syncer.upsert(PoolInfo::from_ids(ids.clone())).await?;
            self.details.submit(ids).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BatchHandler<String> for LookupTickers {
    async fn handle(&self, batch: Vec<String>) {
        if self.forward(batch).await.is_err() {
            tracing::debug!(cache = PoolPipeline::NAME, "pool cache stopped during ticker lookup");
        }
    }
}

/// Fetches pool details by bech32 id.
struct FetchPoolDetails {
    upstream: DetailsUpstream,
    syncer: SyncerHandle<PoolInfo>,
    missing: Option<MissingReporter<String>>,
}

impl FetchPoolDetails {
    async fn store(&self, batch: Vec<PoolIds>) -> Result<(), StageClosed> {
        let ids: Vec<String> = batch
            .iter()
            .map(|ids| ids.id_bech32.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let Some(details) =
            fetch_round(PoolPipeline::NAME, "details", &*self.upstream, &ids).await
        else {
            return Ok(());
        };

        mark_resolved(
            self.missing.as_ref(),
            batch.iter().map(|ids| ids.ticker.clone()).collect::<Vec<_>>(),
        )
        .await?;
        for ids in batch {
            // pools without details are still stored with their identifiers
            let pool = match details.get(&ids.id_bech32) {
                Some(details) => PoolInfo::from_details(ids, details.clone()),
                None => PoolInfo::from_ids(ids),
            };
            self.syncer.upsert(pool).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl BatchHandler<PoolIds> for FetchPoolDetails {
    async fn handle(&self, batch: Vec<PoolIds>) {
        if self.store(batch).await.is_err() {
            tracing::debug!(cache = PoolPipeline::NAME, "pool cache stopped during detail fetch");
        }
    }
}

impl PoolCache {
    /// Adds pools whose ids are already known, skipping the registry lookup.
    pub async fn add_many_with_ids<I>(&self, pools: I)
    where
        I: IntoIterator<Item = PoolIds>,
    {
        let Some(handles) = self.handles() else {
            tracing::debug!(cache = PoolPipeline::NAME, "ignoring pools added to a stopped cache");
            return;
        };

        for mut ids in pools {
            if ids.id_hex.is_empty() && !ids.id_bech32.is_empty() {
                ids.id_hex = bech32_to_hex(&ids.id_bech32).unwrap_or_default();
            }
            self.count_request(&ids.ticker);
            let submitted = if ids.id_bech32.is_empty() {
                handles.stages.tickers.submit(ids.ticker).await
            } else {
                handles.stages.details.submit(ids).await
            };
            if submitted.is_err() {
                return;
            }
        }
    }

    /// Resolves missing tickers with pool ids obtained elsewhere.
    ///
    /// `pools` maps bech32 pool ids to tickers. Tickers in the missing set are moved out of it,
    /// tickers that are neither missing nor cached are counted as new requests.
    pub async fn fill_missing_pool_infos(&self, pools: HashMap<String, String>) {
        let Some(handles) = self.handles() else {
            tracing::debug!(cache = PoolPipeline::NAME, "ignoring pool ids for a stopped cache");
            return;
        };

        let mut resolved = Vec::new();
        let mut submit = Vec::with_capacity(pools.len());
        for (id_bech32, ticker) in pools {
            if self.is_missing(&ticker) {
                resolved.push(ticker.clone());
            } else {
                self.count_request(&ticker);
            }
            submit.push(PoolIds::from_bech32(ticker, id_bech32));
        }

        if mark_resolved(handles.missing.as_ref(), resolved).await.is_err() {
            return;
        }
        for ids in submit {
            if handles.stages.details.submit(ids).await.is_err() {
                return;
            }
        }
    }

    /// Tickers the registry listing does not know about.
    pub fn get_missing_pool_infos(&self) -> Vec<String> {
        self.missing()
    }

    /// Tickers of all cached pools.
    pub fn tickers(&self) -> HashSet<String> {
        self.store()
            .values()
            .iter()
            .map(|pool| pool.ticker.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(ticker: &str, bech32: &str, active_stake: u64) -> PoolInfo {
        PoolInfo {
            ticker: ticker.into(),
            id_bech32: bech32.into(),
            id_hex: format!("{bech32}-hex"),
            active_stake,
            ..Default::default()
        }
    }

    #[test]
    fn test_aliases() {
        let info = pool("ABCD", "pool1abcd", 5);
        assert_eq!(info.aliases(), ["pool1abcd", "pool1abcd-hex"]);

        let info = PoolInfo::from_ids(PoolIds {
            ticker: "ABCD".into(),
            ..Default::default()
        });
        assert!(info.aliases().is_empty());
    }

    #[test]
    fn test_merge_keeps_known_fields() {
        let previous = pool("ABCD", "pool1abcd", 5_000);
        previous.set_block_height(1234);

        let mut update = PoolInfo::from_ids(PoolIds {
            ticker: "ABCD".into(),
            id_bech32: "pool1abcd".into(),
            id_hex: String::new(),
        });
        update.merge_previous(&previous);

        assert_eq!(update.active_stake, 5_000);
        assert_eq!(update.id_hex, "pool1abcd-hex");
        assert_eq!(update.block_height(), 1234);

        let mut fresh = pool("ABCD", "pool1abcd", 7_000);
        fresh.merge_previous(&previous);
        assert_eq!(fresh.active_stake, 7_000);
    }

    #[test]
    fn test_from_details_keeps_requested_ticker() {
        let ids = PoolIds {
            ticker: "ABCD".into(),
            id_bech32: "pool1abcd".into(),
            id_hex: "00ab".into(),
        };
        let details = PoolDetails {
            id_bech32: "pool1abcd".into(),
            vrf_key_hash: "vrf".into(),
            live_delegators: 12,
            ticker: Some("ABCD2".into()),
            ..Default::default()
        };
        let info = PoolInfo::from_details(ids, details);
        assert_eq!(info.ticker, "ABCD");
        assert_eq!(info.id_hex, "00ab");
        assert_eq!(info.live_delegators, 12);
    }

    #[test]
    fn test_bech32_to_hex() {
        assert_eq!(
            bech32_to_hex("pool1zqg3yyc5z5tpwxqergd3c8g7ruszzg3rysjjvfeg9y4zk22hqtf").as_deref(),
            Some("101112131415161718191a1b1c1d1e1f202122232425262728292a2b")
        );
        assert_eq!(bech32_to_hex("pool1abcd"), None);

        let ids = PoolIds::from_bech32("ABCD".into(), "pool1abcd".into());
        assert!(ids.id_hex.is_empty());
    }

    #[test]
    fn test_block_height_is_not_serialized() {
        let info = pool("ABCD", "pool1abcd", 5);
        info.set_block_height(99);

        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("block_height"));

        let restored: PoolInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(restored.block_height(), 0);
        assert_eq!(info.clone().block_height(), 99);
    }
}
