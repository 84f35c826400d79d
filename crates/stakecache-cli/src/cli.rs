//! Exposes the command line application.
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use stakecache::config::Config;
use stakecache::{AccountInfo, PoolInfo, logging, metrics};
use tokio::signal;

use crate::caches::Caches;
use crate::keys::Keys;

/// Stakecache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve a set of accounts and pools once and print them as JSON.
    Lookup {
        /// Stake address of an account to look up.
        #[arg(long = "account", value_name = "ADDRESS")]
        accounts: Vec<String>,

        /// Ticker of a pool to look up.
        #[arg(long = "pool", value_name = "TICKER")]
        pools: Vec<String>,

        /// How long to wait for the upstream.
        #[arg(long, default_value = "2m", value_parser = humantime::parse_duration)]
        timeout: Duration,
    },

    /// Keep the keys listed in a file fresh until interrupted.
    Run {
        /// File with one `account <address>` or `pool <ticker>` entry per line.
        #[arg(long, value_name = "FILE")]
        keys: PathBuf,

        /// How often to report the state of the caches.
        #[arg(long, default_value = "1m", value_parser = humantime::parse_duration)]
        status_interval: Duration,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(name = "stakecache", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: No threads have been spawned yet, the runtime is created below.
    unsafe { logging::init_logging(&config.logging, console::user_attended()) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)
            .context("failed to configure statsd")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("stakecache")
        .enable_all()
        .build()
        .context("failed to create the runtime")?;

    match cli.command {
        Command::Lookup {
            accounts,
            pools,
            timeout,
        } => {
            let keys = Keys { accounts, pools };
            runtime.block_on(lookup(&config, keys, timeout))
        }
        Command::Run {
            keys,
            status_interval,
        } => {
            // fail early on a broken keys file
            Keys::load(&keys)?;
            runtime.block_on(run(&config, &keys, status_interval))
        }
    }
}

/// One line of the `lookup` output.
#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum LookupLine<'a> {
    Account {
        key: &'a str,
        account: Option<Arc<AccountInfo>>,
    },
    Pool {
        key: &'a str,
        missing: bool,
        pool: Option<Arc<PoolInfo>>,
    },
}

fn print_line(line: &LookupLine<'_>) -> Result<()> {
    let json = serde_json::to_string(line).context("failed to serialize lookup result")?;
    println!("{json}");
    Ok(())
}

async fn lookup(config: &Config, keys: Keys, timeout: Duration) -> Result<()> {
    let caches = Caches::create(config)?;
    caches.start()?;
    caches.add(&keys).await;

    let mut ready = caches.wait_ready(timeout).await;
    if caches.apply_hints().await > 0 {
        ready = caches.wait_ready(timeout).await;
    }
    if !ready {
        tracing::warn!(?timeout, "timed out waiting for the upstream, results are incomplete");
    }

    for key in &keys.accounts {
        print_line(&LookupLine::Account {
            key,
            account: caches.accounts.get(key),
        })?;
    }
    for key in &keys.pools {
        print_line(&LookupLine::Pool {
            key,
            missing: caches.pools.is_missing(key),
            pool: caches.pools.get(key),
        })?;
    }

    caches.stop().await
}

async fn run(config: &Config, path: &Path, status_interval: Duration) -> Result<()> {
    let caches = Caches::create(config)?;
    caches.start()?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut status = tokio::time::interval(status_interval);
    let mut known = Keys::default();
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = status.tick() => {}
        }

        // the keys file may change while running, only new keys are added
        match Keys::load(path) {
            Ok(keys) => {
                let added = keys.difference(&known);
                if !added.is_empty() {
                    tracing::info!(
                        accounts = added.accounts.len(),
                        pools = added.pools.len(),
                        "adding keys"
                    );
                    caches.add(&added).await;
                }
                known = keys;
            }
            Err(err) => logging::ensure_log_error(&err),
        }

        caches.apply_hints().await;
        caches.log_status();
    }

    tracing::info!("shutting down");
    caches.log_status();
    caches.stop().await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::error!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install signal handler");
                std::future::pending::<()>().await
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
