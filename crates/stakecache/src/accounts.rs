//! The cache of stake account facts, keyed by stake address.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::caching::{
    BatchHandler, BatcherHandle, BatcherPool, CacheValue, Pipeline, PipelineContext,
    RefreshCache, Stages, StageClosed, SyncerHandle, fetch_round,
};
use crate::upstream::{UpstreamClient, UpstreamError};

/// What the ledger knows about a stake account.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub stake_address: String,
    /// Bech32 id of the pool the account delegates to, empty if it does not delegate.
    pub delegated_pool: String,
    /// Total balance in whole ADA.
    pub ada_amount: u64,
    /// Registration status, e.g. `registered`.
    pub status: String,
}

impl CacheValue for AccountInfo {
    type Key = String;

    fn key(&self) -> &String {
        &self.stake_address
    }
}

type AccountUpstream = Arc<dyn UpstreamClient<String, AccountInfo>>;

/// Resolves stake addresses in a single batching stage.
#[derive(Clone)]
pub struct AccountPipeline {
    upstream: AccountUpstream,
}

impl std::fmt::Debug for AccountPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountPipeline").finish_non_exhaustive()
    }
}

impl AccountPipeline {
    pub fn new(upstream: impl UpstreamClient<String, AccountInfo>) -> Self {
        Self {
            upstream: Arc::new(upstream),
        }
    }
}

pub type AccountCache = RefreshCache<AccountPipeline>;

impl Pipeline for AccountPipeline {
    type Value = AccountInfo;
    type Stages = AccountStages;

    const NAME: &'static str = "accountcache";

    fn spawn(&self, context: PipelineContext<AccountInfo>) -> AccountStages {
        let handler = FetchAccounts {
            upstream: Arc::clone(&self.upstream),
            syncer: context.syncer().clone(),
        };
        let (accounts, pool) = BatcherPool::spawn(context.stage("accounts"), handler);
        AccountStages { accounts, pool }
    }
}

#[derive(Debug)]
pub struct AccountStages {
    accounts: BatcherHandle<String>,
    pool: BatcherPool,
}

#[async_trait]
impl Stages<AccountInfo> for AccountStages {
    async fn request(&self, key: String) -> Result<(), StageClosed> {
        self.accounts.submit(key).await
    }

    async fn refresh(&self, value: Arc<AccountInfo>) -> Result<(), StageClosed> {
        self.accounts.submit(value.stake_address.clone()).await
    }

    async fn shutdown(&self) {
        self.pool.shutdown().await;
    }
}

struct FetchAccounts {
    upstream: AccountUpstream,
    syncer: SyncerHandle<AccountInfo>,
}

#[async_trait]
impl BatchHandler<String> for FetchAccounts {
    async fn handle(&self, batch: Vec<String>) {
        let Some(accounts) =
            fetch_round(AccountPipeline::NAME, "accounts", &*self.upstream, &batch).await
        else {
            return;
        };

        for (_, account) in accounts {
            if self.syncer.upsert(account).await.is_err() {
                return;
            }
        }
    }
}

/// Why a single entry could not be refreshed.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    #[error("the cache is not running")]
    NotRunning,
    #[error("`{0}` is not known upstream")]
    NotFound(String),
    #[error(transparent)]
    Upstream(#[from] UpstreamError),
}

impl From<StageClosed> for RefreshError {
    fn from(_: StageClosed) -> Self {
        RefreshError::NotRunning
    }
}

impl AccountCache {
    /// Fetches `stake_address` right away, bypassing the batchers, and stores the result.
    pub async fn refresh_member(&self, stake_address: &str) -> Result<Arc<AccountInfo>, RefreshError> {
        let handles = self.handles().ok_or(RefreshError::NotRunning)?;
        let key = stake_address.to_owned();
        let mut accounts = self
            .pipeline()
            .upstream
            .resolve_many(std::slice::from_ref(&key))
            .await?;
        let account = accounts
            .remove(&key)
            .ok_or_else(|| RefreshError::NotFound(key.clone()))?;

        handles.syncer.upsert_and_wait(account).await?;
        self.get(stake_address)
            .ok_or(RefreshError::NotFound(key))
    }
}
