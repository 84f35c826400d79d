use std::sync::Arc;
use std::time::Duration;

use stakecache::hints::PoolHints;
use stakecache::{AccountCache, AccountPipeline, CacheOptions, PoolCache, PoolPipeline};

use crate::{fast_options, fixtures, koios, setup, tempdir};

const READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Waits until the pool `key` has details, as those arrive after the pool is first stored.
async fn wait_for_details(cache: &PoolCache, key: &str) -> bool {
    let poll = async {
        while cache.get(key).is_none_or(|pool| pool.vrf_key_hash.is_empty()) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    tokio::time::timeout(READY_TIMEOUT, poll).await.is_ok()
}

#[tokio::test]
async fn test_account_cache() {
    setup();
    let (server, client) = koios(fixtures(), 100);
    let cache = AccountCache::new(AccountPipeline::new(client), fast_options());
    cache.start().unwrap();

    cache
        .add_many(["stake1alice", "stake1bob"].map(String::from))
        .await;
    assert!(cache.wait_ready(READY_TIMEOUT).await);

    let alice = cache.get("stake1alice").unwrap();
    assert_eq!(alice.ada_amount, 64_123);
    assert_eq!(alice.delegated_pool, "pool1abcd");
    assert!(server.hits("account_info") >= 1);

    cache.stop().await.unwrap();
}

#[tokio::test]
async fn test_pool_cache_with_hints() {
    setup();
    let (_server, client) = koios(fixtures(), 2);
    let cache = PoolCache::new(PoolPipeline::from_client(Arc::new(client)), fast_options());
    cache.start().unwrap();

    cache
        .add_many(["ABCD", "LAST", "OLD", "GHOST"].map(String::from))
        .await;
    assert!(cache.wait_ready(READY_TIMEOUT).await);
    assert!(wait_for_details(&cache, "ABCD").await);

    let abcd = cache.get("pool1abcd-hex").unwrap();
    assert_eq!(abcd.ticker, "ABCD");
    assert_eq!(abcd.active_stake, 1_000);

    let mut missing = cache.get_missing_pool_infos();
    missing.sort();
    assert_eq!(missing, ["GHOST", "OLD"]);

    let hints = PoolHints::parse("ticker,pool_id\nGHOST,pool1dupe2\nOLD,retired\n");
    let pools = hints.pool_ids_for(missing.iter().map(String::as_str));
    cache.fill_missing_pool_infos(pools).await;
    assert!(cache.wait_ready(READY_TIMEOUT).await);
    assert!(wait_for_details(&cache, "GHOST").await);

    let ghost = cache.get("pool1dupe2").unwrap();
    assert_eq!(ghost.ticker, "GHOST");
    assert_eq!(ghost.active_stake, 3_000);
    assert_eq!(cache.get_missing_pool_infos(), ["OLD"]);
    assert_eq!(cache.requested(), 3);

    cache.stop().await.unwrap();
}

#[tokio::test]
async fn test_pool_snapshot_keeps_aliases() {
    setup();
    let snapshot_dir = tempdir();
    let options = CacheOptions {
        snapshot_dir: Some(snapshot_dir.path().join("snapshots")),
        ..fast_options()
    };

    let (_server, client) = koios(fixtures(), 100);
    let client = Arc::new(client);
    let cache = PoolCache::new(PoolPipeline::from_client(client.clone()), options.clone());
    cache.start().unwrap();
    cache.add("ABCD".to_owned()).await;
    assert!(cache.wait_ready(READY_TIMEOUT).await);
    assert!(wait_for_details(&cache, "ABCD").await);
    cache.stop().await.unwrap();

    let restored = PoolCache::new(PoolPipeline::from_client(client), options);
    assert!(restored.ready());
    assert_eq!(restored.len(), 1);
    let pool = restored.get("pool1abcd").unwrap();
    assert_eq!(pool.ticker, "ABCD");
    assert_eq!(pool.active_stake, 1_000);
    assert!(restored.get("pool1abcd-hex").is_some());
}
