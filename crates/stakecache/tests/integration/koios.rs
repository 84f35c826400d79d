use reqwest::StatusCode;
use stakecache::upstream::{UpstreamClient, UpstreamError};
use stakecache::{AccountInfo, KoiosClient, PoolIds};
use stakecache_test::KoiosFixtures;

use crate::{fixtures, koios, pool_row, setup};

fn keys(keys: &[&str]) -> Vec<String> {
    keys.iter().map(|key| key.to_string()).collect()
}

#[tokio::test]
async fn test_pool_ids_paginated() {
    setup();
    let (server, client) = koios(fixtures(), 2);

    let pools = client
        .pool_ids(&keys(&["ABCD", "DUPE", "OLD", "LAST"]))
        .await
        .unwrap();

    assert_eq!(pools.len(), 3);
    assert_eq!(
        pools["ABCD"],
        PoolIds {
            ticker: "ABCD".into(),
            id_bech32: "pool1abcd".into(),
            id_hex: "pool1abcd-hex".into(),
        }
    );
    // the first listed pool wins, retired pools are never matched
    assert_eq!(pools["DUPE"].id_bech32, "pool1dupe1");
    assert!(!pools.contains_key("OLD"));
    assert_eq!(pools["LAST"].id_bech32, "pool1last");

    // three pages, the last of which is short
    assert_eq!(server.hits("pool_list"), 3);
}

#[tokio::test]
async fn test_pool_ids_stop_when_all_found() {
    setup();
    let (server, client) = koios(fixtures(), 2);

    let pools = client.pool_ids(&keys(&["ABCD"])).await.unwrap();
    assert_eq!(pools.len(), 1);
    assert_eq!(server.hits("pool_list"), 1);
}

#[tokio::test]
async fn test_pool_details() {
    setup();
    let (server, client) = koios(fixtures(), 2);

    let details = client
        .pool_details(&keys(&["pool1abcd", "pool1last", "pool1nope"]))
        .await
        .unwrap();

    assert_eq!(details.len(), 2);
    let abcd = &details["pool1abcd"];
    assert_eq!(abcd.id_hex, "pool1abcd-hex");
    assert_eq!(abcd.vrf_key_hash, "pool1abcd-vrf");
    assert_eq!(abcd.active_stake, 1_000);
    assert_eq!(abcd.live_delegators, 21);
    assert_eq!(abcd.ticker.as_deref(), Some("ABCD"));
    assert_eq!(details["pool1last"].live_stake, 4);

    // ids are sent in chunks of the page size
    assert_eq!(server.hits("pool_info"), 2);
    assert_eq!(server.accesses(), 2);
}

#[tokio::test]
async fn test_account_infos() {
    setup();
    let (_server, client) = koios(fixtures(), 100);

    let accounts = <KoiosClient as UpstreamClient<String, AccountInfo>>::resolve_many(
        &client,
        &keys(&["stake1alice", "stake1bob", "stake1nobody"]),
    )
    .await
    .unwrap();

    assert_eq!(accounts.len(), 2);
    assert_eq!(
        accounts["stake1alice"],
        AccountInfo {
            stake_address: "stake1alice".into(),
            delegated_pool: "pool1abcd".into(),
            ada_amount: 64_123,
            status: "registered".into(),
        }
    );
    assert_eq!(accounts["stake1bob"].ada_amount, 0);
    assert_eq!(accounts["stake1bob"].delegated_pool, "");
}

#[tokio::test]
async fn test_error_status() {
    setup();
    let fixtures = KoiosFixtures {
        fail_with: Some(StatusCode::SERVICE_UNAVAILABLE),
        ..fixtures()
    };
    let (_server, client) = koios(fixtures, 100);

    let err = client.pool_ids(&keys(&["ABCD"])).await.unwrap_err();
    assert!(matches!(err, UpstreamError::Status(StatusCode::SERVICE_UNAVAILABLE)));
    assert_eq!(err.metric_tag(), "status");
}

#[tokio::test]
async fn test_malformed_amount() {
    setup();
    let fixtures = KoiosFixtures {
        pools: vec![pool_row("BAD", "pool1bad", "registered", "lots")],
        ..Default::default()
    };
    let (_server, client) = koios(fixtures, 100);

    let err = client.pool_details(&keys(&["pool1bad"])).await.unwrap_err();
    assert!(matches!(err, UpstreamError::Malformed(_)));
}
