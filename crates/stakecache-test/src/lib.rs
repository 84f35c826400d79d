//! Helpers for testing the caches and the Koios client.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - When using [`tempdir`], make sure that the handle to the temp directory is held for the
//!    entire lifetime of the test, e.g. `let snapshot_dir = test::tempdir();`.
//!
//!  - When using [`KoiosServer`], make sure that the server is held until all requests to it have
//!    been made. If the server is dropped, all connections to it will fail.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{self, Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::routing::{get, post};
use axum::{Json, Router};
use reqwest::Url;
use serde_json::Value;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

pub use tempfile::TempDir;

/// Setup the test environment.
///
/// Initializes logs: The logger only captures logs from the `stakecache` crate and mutes all
/// other logs (such as hyper or reqwest).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("stakecache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates a temporary directory.
///
/// The directory is deleted when the [`TempDir`] instance is dropped. Use it as a guard to
/// automatically clean up after tests.
pub fn tempdir() -> TempDir {
    TempDir::new().unwrap()
}

/// A test server that binds to a random port and serves a web app.
///
/// This server requires a `tokio` runtime and is supposed to be run in a `tokio::test`. It
/// automatically stops serving when dropped.
#[derive(Debug)]
pub struct Server {
    pub handle: tokio::task::JoinHandle<()>,
    pub socket: SocketAddr,
}

impl Server {
    pub fn with_router(router: Router) -> Self {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();
        let listener = tokio::net::TcpListener::from_std(listener).unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self { handle, socket }
    }

    /// Returns the port that this server listens on.
    pub fn port(&self) -> u16 {
        self.socket.port()
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> Url {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.port(), path)
            .parse()
            .unwrap()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// The rows a [`KoiosServer`] answers with.
///
/// Rows are raw JSON objects shaped like the Koios responses. `pools` backs both `pool_list`
/// (in order, honoring the `Range` header) and `pool_info` (filtered by `pool_id_bech32`).
#[derive(Clone, Debug, Default)]
pub struct KoiosFixtures {
    pub pools: Vec<Value>,
    pub accounts: Vec<Value>,
    /// When set, every endpoint responds with this status and no body.
    pub fail_with: Option<StatusCode>,
}

struct KoiosState {
    fixtures: KoiosFixtures,
}

/// A fake Koios instance serving [`KoiosFixtures`] under `/api/v1`.
///
/// Counts the requests made per endpoint.
pub struct KoiosServer {
    server: Server,
    hits: Arc<Mutex<BTreeMap<String, usize>>>,
}

impl KoiosServer {
    pub fn new(fixtures: KoiosFixtures) -> Self {
        let hits = Arc::new(Mutex::new(BTreeMap::new()));

        let hitcounter = {
            let hits = hits.clone();
            move |extract::OriginalUri(uri), req: Request, next: Next| {
                let hits = hits.clone();
                async move {
                    {
                        let mut hits = hits.lock().unwrap();
                        let hits = hits.entry(uri.path().to_owned()).or_default();
                        *hits += 1;
                    }

                    next.run(req).await
                }
            }
        };

        let state = Arc::new(KoiosState { fixtures });
        let router = Router::new()
            .route("/api/v1/pool_list", get(pool_list))
            .route("/api/v1/pool_info", post(pool_info))
            .route("/api/v1/account_info", post(account_info))
            .with_state(state)
            .layer(middleware::from_fn(hitcounter));

        let server = Server::with_router(router);

        Self { server, hits }
    }

    /// The base URL to configure the Koios client with.
    pub fn base_url(&self) -> Url {
        self.server.url("api/v1")
    }

    /// Number of requests made to the endpoint `name`, e.g. `pool_list`.
    pub fn hits(&self, name: &str) -> usize {
        let hits = self.hits.lock().unwrap();
        hits.get(&format!("/api/v1/{name}"))
            .copied()
            .unwrap_or_default()
    }

    /// Number of requests made to any endpoint.
    pub fn accesses(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }
}

/// Parses a `Range: <start>-<end>` header into an inclusive range.
fn parse_range(headers: &HeaderMap) -> Option<(usize, usize)> {
    let range = headers.get(header::RANGE)?.to_str().ok()?;
    let (start, end) = range.split_once('-')?;
    Some((start.trim().parse().ok()?, end.trim().parse().ok()?))
}

/// Keeps the rows whose `field` is one of the strings listed under `filter` in `body`.
fn select_rows(rows: &[Value], field: &str, body: &Value, filter: &str) -> Vec<Value> {
    let wanted: Vec<&str> = body[filter]
        .as_array()
        .map(|keys| keys.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    rows.iter()
        .filter(|row| row[field].as_str().is_some_and(|key| wanted.contains(&key)))
        .cloned()
        .collect()
}

async fn pool_list(
    State(state): State<Arc<KoiosState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Value>>, StatusCode> {
    if let Some(status) = state.fixtures.fail_with {
        return Err(status);
    }

    let pools = &state.fixtures.pools;
    let (start, end) = parse_range(&headers).unwrap_or((0, pools.len().saturating_sub(1)));
    let page = pools
        .iter()
        .skip(start)
        .take((end + 1).saturating_sub(start))
        .cloned()
        .collect();
    Ok(Json(page))
}

async fn pool_info(
    State(state): State<Arc<KoiosState>>,
    Json(body): Json<Value>,
) -> Result<Json<Vec<Value>>, StatusCode> {
    if let Some(status) = state.fixtures.fail_with {
        return Err(status);
    }
    let rows = select_rows(
        &state.fixtures.pools,
        "pool_id_bech32",
        &body,
        "_pool_bech32_ids",
    );
    Ok(Json(rows))
}

async fn account_info(
    State(state): State<Arc<KoiosState>>,
    Json(body): Json<Value>,
) -> Result<Json<Vec<Value>>, StatusCode> {
    if let Some(status) = state.fixtures.fail_with {
        return Err(status);
    }
    let rows = select_rows(
        &state.fixtures.accounts,
        "stake_address",
        &body,
        "_stake_addresses",
    );
    Ok(Json(rows))
}
