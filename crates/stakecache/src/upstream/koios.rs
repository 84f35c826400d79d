//! A client for the [Koios](https://koios.rest) REST API.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RANGE;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use super::{UpstreamClient, UpstreamError};
use crate::accounts::AccountInfo;
use crate::config::KoiosConfig;
use crate::pools::{PoolDetails, PoolIds};

/// The public mainnet instance.
pub const DEFAULT_KOIOS_URL: &str = "https://api.koios.rest/api/v1";

const LOVELACE_PER_ADA: u64 = 1_000_000;

/// Converts a lovelace amount as returned by Koios into whole ADA.
fn lovelace_to_ada(lovelace: Option<&str>) -> Result<u64, UpstreamError> {
    match lovelace {
        None | Some("") => Ok(0),
        Some(amount) => amount
            .parse::<u64>()
            .map(|lovelace| lovelace / LOVELACE_PER_ADA)
            .map_err(|_| UpstreamError::Malformed(format!("invalid lovelace amount `{amount}`"))),
    }
}

#[derive(Debug, Serialize)]
struct AccountInfoRequest<'a> {
    #[serde(rename = "_stake_addresses")]
    stake_addresses: &'a [String],
}

#[derive(Debug, Deserialize)]
struct AccountInfoRow {
    stake_address: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    delegated_pool: Option<String>,
    #[serde(default)]
    total_balance: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PoolListRow {
    #[serde(default)]
    pool_id_bech32: Option<String>,
    #[serde(default)]
    pool_id_hex: Option<String>,
    #[serde(default)]
    ticker: Option<String>,
    #[serde(default)]
    pool_status: Option<String>,
}

#[derive(Debug, Serialize)]
struct PoolInfoRequest<'a> {
    #[serde(rename = "_pool_bech32_ids")]
    pool_bech32_ids: &'a [String],
}

#[derive(Debug, Default, Deserialize)]
struct PoolMetadata {
    #[serde(default)]
    ticker: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PoolInfoRow {
    pool_id_bech32: String,
    #[serde(default)]
    pool_id_hex: Option<String>,
    #[serde(default)]
    vrf_key_hash: Option<String>,
    #[serde(default)]
    active_stake: Option<String>,
    #[serde(default)]
    live_stake: Option<String>,
    #[serde(default)]
    live_delegators: Option<u32>,
    #[serde(default)]
    meta_json: Option<PoolMetadata>,
}

/// Resolves accounts and pools against a Koios instance.
#[derive(Clone, Debug)]
pub struct KoiosClient {
    client: reqwest::Client,
    base: Url,
    timeout: Duration,
    page_size: usize,
}

impl KoiosClient {
    pub fn new(config: &KoiosConfig) -> Result<Self, UpstreamError> {
        let base = match &config.url {
            Some(url) => url.clone(),
            None => Url::parse(DEFAULT_KOIOS_URL)
                .map_err(|err| UpstreamError::Other(format!("invalid Koios URL: {err}")))?,
        };
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("stakecache/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            base,
            timeout: config.timeout,
            page_size: config.page_size.max(1),
        })
    }

    fn endpoint(&self, name: &str) -> Result<Url, UpstreamError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| UpstreamError::Other(format!("`{}` is not a valid base URL", self.base)))?
            .pop_if_empty()
            .push(name);
        Ok(url)
    }

    async fn fetch<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, UpstreamError> {
        let response = request.send().await.map_err(|err| self.classify(err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(UpstreamError::Status(status));
        }
        response.json().await.map_err(|err| {
            if err.is_decode() {
                UpstreamError::Malformed(err.to_string())
            } else {
                self.classify(err)
            }
        })
    }

    fn classify(&self, err: reqwest::Error) -> UpstreamError {
        if err.is_timeout() {
            UpstreamError::Timeout(self.timeout)
        } else {
            UpstreamError::Http(err)
        }
    }

    /// Looks up the pool ids of `tickers` in the registry listing.
    ///
    /// The listing is paged through until every ticker was found or the last page was read.
    /// Retired pools are skipped, and the first pool listed for a ticker wins.
    pub async fn pool_ids(&self, tickers: &[String]) -> Result<HashMap<String, PoolIds>, UpstreamError> {
        let mut wanted: HashSet<&str> = tickers.iter().map(String::as_str).collect();
        let mut found = HashMap::new();
        let url = self.endpoint("pool_list")?;
        let mut offset = 0;

        while !wanted.is_empty() {
            let range = format!("{}-{}", offset, offset + self.page_size - 1);
            let request = self
                .client
                .get(url.clone())
                .query(&[("select", "pool_id_bech32,pool_id_hex,ticker,pool_status")])
                .header(RANGE, range);
            let page: Vec<PoolListRow> = self.fetch(request).await?;
            let rows = page.len();

            for row in page {
                if row.pool_status.as_deref() == Some("retired") {
                    continue;
                }
                let (Some(ticker), Some(id_bech32)) = (row.ticker, row.pool_id_bech32) else {
                    continue;
                };
                if ticker.is_empty() || id_bech32.is_empty() || !wanted.remove(ticker.as_str()) {
                    continue;
                }
                let ids = PoolIds {
                    ticker: ticker.clone(),
                    id_bech32,
                    id_hex: row.pool_id_hex.unwrap_or_default(),
                };
                found.insert(ticker, ids);
            }

            if rows < self.page_size {
                break;
            }
            offset += rows;
        }

        tracing::trace!(requested = tickers.len(), found = found.len(), "listed pool ids");
        Ok(found)
    }

    /// Fetches the details of the pools with the given bech32 ids.
    pub async fn pool_details(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, PoolDetails>, UpstreamError> {
        let url = self.endpoint("pool_info")?;
        let mut details = HashMap::with_capacity(ids.len());

        for chunk in ids.chunks(self.page_size) {
            let request = self
                .client
                .post(url.clone())
                .query(&[(
                    "select",
                    "pool_id_bech32,pool_id_hex,vrf_key_hash,active_stake,live_stake,live_delegators,meta_json",
                )])
                .json(&PoolInfoRequest {
                    pool_bech32_ids: chunk,
                });
            let rows: Vec<PoolInfoRow> = self.fetch(request).await?;

            for row in rows {
                if row.pool_id_bech32.is_empty() {
                    continue;
                }
                let pool = PoolDetails {
                    id_bech32: row.pool_id_bech32.clone(),
                    id_hex: row.pool_id_hex.unwrap_or_default(),
                    vrf_key_hash: row.vrf_key_hash.unwrap_or_default(),
                    active_stake: lovelace_to_ada(row.active_stake.as_deref())?,
                    live_stake: lovelace_to_ada(row.live_stake.as_deref())?,
                    live_delegators: row.live_delegators.unwrap_or_default(),
                    ticker: row
                        .meta_json
                        .and_then(|meta| meta.ticker)
                        .filter(|ticker| !ticker.is_empty()),
                };
                details.insert(row.pool_id_bech32, pool);
            }
        }

        Ok(details)
    }

    /// Fetches the balance and delegation of the given stake addresses.
    pub async fn account_infos(
        &self,
        stake_addresses: &[String],
    ) -> Result<HashMap<String, AccountInfo>, UpstreamError> {
        let url = self.endpoint("account_info")?;
        let mut accounts = HashMap::with_capacity(stake_addresses.len());

        for chunk in stake_addresses.chunks(self.page_size) {
            let request = self
                .client
                .post(url.clone())
                .query(&[("select", "stake_address,status,delegated_pool,total_balance")])
                .json(&AccountInfoRequest {
                    stake_addresses: chunk,
                });
            let rows: Vec<AccountInfoRow> = self.fetch(request).await?;

            for row in rows {
                let account = AccountInfo {
                    stake_address: row.stake_address.clone(),
                    delegated_pool: row.delegated_pool.unwrap_or_default(),
                    ada_amount: lovelace_to_ada(row.total_balance.as_deref())?,
                    status: row.status.unwrap_or_default(),
                };
                accounts.insert(row.stake_address, account);
            }
        }

        Ok(accounts)
    }
}

#[async_trait]
impl UpstreamClient<String, AccountInfo> for KoiosClient {
    async fn resolve_many(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, AccountInfo>, UpstreamError> {
        self.account_infos(keys).await
    }
}

#[async_trait]
impl UpstreamClient<String, PoolIds> for KoiosClient {
    async fn resolve_many(&self, keys: &[String]) -> Result<HashMap<String, PoolIds>, UpstreamError> {
        self.pool_ids(keys).await
    }
}

#[async_trait]
impl UpstreamClient<String, PoolDetails> for KoiosClient {
    async fn resolve_many(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, PoolDetails>, UpstreamError> {
        self.pool_details(keys).await
    }
}
