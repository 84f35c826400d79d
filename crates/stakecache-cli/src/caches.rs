use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use stakecache::config::Config;
use stakecache::hints::PoolHints;
use stakecache::{AccountCache, AccountPipeline, KoiosClient, PoolCache, PoolPipeline};

use crate::keys::Keys;

/// The account and pool caches, both backed by the same Koios client.
#[derive(Debug)]
pub struct Caches {
    pub accounts: AccountCache,
    pub pools: PoolCache,
    hints: PoolHints,
}

impl Caches {
    pub fn create(config: &Config) -> Result<Self> {
        let client =
            Arc::new(KoiosClient::new(&config.koios).context("failed to create Koios client")?);
        let hints = config
            .hints_path
            .as_deref()
            .map(PoolHints::load)
            .unwrap_or_default();

        Ok(Self {
            accounts: AccountCache::new(
                AccountPipeline::new(client.clone()),
                config.account_options(),
            ),
            pools: PoolCache::new(PoolPipeline::from_client(client), config.pool_options()),
            hints,
        })
    }

    pub fn start(&self) -> Result<()> {
        self.accounts
            .start()
            .context("failed to start the account cache")?;
        self.pools.start().context("failed to start the pool cache")?;
        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        self.accounts
            .stop()
            .await
            .context("failed to stop the account cache")?;
        self.pools
            .stop()
            .await
            .context("failed to stop the pool cache")?;
        Ok(())
    }

    /// Registers `keys` with the caches. Tickers hinted as retired are skipped.
    pub async fn add(&self, keys: &Keys) {
        self.accounts.add_many(keys.accounts.iter().cloned()).await;

        let (retired, pools): (Vec<_>, Vec<_>) = keys
            .pools
            .iter()
            .cloned()
            .partition(|ticker| self.hints.is_retired(ticker));
        if !retired.is_empty() {
            tracing::info!(?retired, "skipping retired pools");
        }
        self.pools.add_many(pools).await;
    }

    /// Resolves missing pools with the ids from the hints file.
    ///
    /// Returns the number of pools that were resolved this way.
    pub async fn apply_hints(&self) -> usize {
        let missing = self.pools.get_missing_pool_infos();
        let pools = self.hints.pool_ids_for(missing.iter().map(String::as_str));
        let count = pools.len();
        if count > 0 {
            tracing::info!(count, "resolving missing pools from hints");
            self.pools.fill_missing_pool_infos(pools).await;
        }
        count
    }

    /// Waits for both caches to catch up, returning whether they did within `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let (accounts, pools) = tokio::join!(
            self.accounts.wait_ready(timeout),
            self.pools.wait_ready(timeout)
        );
        accounts && pools
    }

    pub fn log_status(&self) {
        let accounts = self.accounts.counters();
        let pools = self.pools.counters();
        tracing::info!(
            accounts = self.accounts.len(),
            accounts_pending = accounts.pending(),
            pools = self.pools.len(),
            pools_pending = pools.pending(),
            pools_missing = self.pools.get_missing_pool_infos().len(),
            "cache status"
        );
    }
}
