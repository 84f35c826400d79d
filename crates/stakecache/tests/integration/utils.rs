use std::time::Duration;

use serde_json::{Value, json};
use stakecache::KoiosClient;
use stakecache::config::{CacheOptions, KoiosConfig};
use stakecache_test::{KoiosFixtures, KoiosServer};

pub use stakecache_test::{setup, tempdir};

/// A row of the `pool_list` and `pool_info` endpoints.
pub fn pool_row(ticker: &str, id_bech32: &str, status: &str, active_lovelace: &str) -> Value {
    json!({
        "pool_id_bech32": id_bech32,
        "pool_id_hex": format!("{id_bech32}-hex"),
        "ticker": ticker,
        "pool_status": status,
        "vrf_key_hash": format!("{id_bech32}-vrf"),
        "active_stake": active_lovelace,
        "live_stake": active_lovelace,
        "live_delegators": 21,
        "meta_json": { "ticker": ticker, "name": format!("{ticker} pool") },
    })
}

/// A row of the `account_info` endpoint.
pub fn account_row(stake_address: &str, pool: &str, total_lovelace: &str) -> Value {
    json!({
        "stake_address": stake_address,
        "status": "registered",
        "delegated_pool": pool,
        "total_balance": total_lovelace,
        "utxo": total_lovelace,
    })
}

pub fn fixtures() -> KoiosFixtures {
    KoiosFixtures {
        pools: vec![
            pool_row("ABCD", "pool1abcd", "registered", "1000000000"),
            pool_row("OLD", "pool1old", "retired", "0"),
            pool_row("DUPE", "pool1dupe1", "registered", "2000000000"),
            pool_row("DUPE", "pool1dupe2", "registered", "3000000000"),
            pool_row("LAST", "pool1last", "registered", "4500000"),
        ],
        accounts: vec![
            account_row("stake1alice", "pool1abcd", "64123456789"),
            account_row("stake1bob", "", "999999"),
        ],
        fail_with: None,
    }
}

/// Starts a fake Koios and a client talking to it, paging `page_size` rows at a time.
pub fn koios(fixtures: KoiosFixtures, page_size: usize) -> (KoiosServer, KoiosClient) {
    let server = KoiosServer::new(fixtures);
    let config = KoiosConfig {
        url: Some(server.base_url()),
        timeout: Duration::from_secs(5),
        page_size,
    };
    let client = KoiosClient::new(&config).unwrap();
    (server, client)
}

/// Options for caches running in real time against a local server.
pub fn fast_options() -> CacheOptions {
    CacheOptions {
        batchers: 2,
        syncers: 2,
        max_batch_size: 10,
        batch_interval: Duration::from_millis(20),
        refresh_interval: Duration::from_secs(3600),
        queue_size: 1,
        snapshot_dir: None,
    }
}
