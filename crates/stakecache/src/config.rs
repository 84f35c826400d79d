use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;
use url::Url;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for the cache daemon.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "stakecache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Where and how the Koios ledger index is queried.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KoiosConfig {
    /// Base URL of the Koios REST API.
    ///
    /// Defaults to the public mainnet instance.
    pub url: Option<Url>,
    /// Timeout for a single upstream request, including all pages of a listing.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Number of rows requested per page from paginated listings.
    pub page_size: usize,
}

impl Default for KoiosConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout: Duration::from_secs(30),
            page_size: 1000,
        }
    }
}

/// Tuning knobs of a single refresh cache.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CacheOptions {
    /// Number of parallel batchers per stage.
    pub batchers: usize,
    /// Number of parallel syncers applying upserts and removals.
    pub syncers: usize,
    /// Upper bound of keys sent upstream in one request.
    pub max_batch_size: usize,
    /// How often a batcher checks whether its working set stopped growing.
    #[serde(with = "humantime_serde")]
    pub batch_interval: Duration,
    /// How often every cached entry is re-fetched.
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// Capacity of every internal queue.
    ///
    /// The default of `1` makes producers wait for the consumer almost immediately.
    pub queue_size: usize,
    /// Directory holding the snapshot file. No snapshot is read or written if unset.
    #[serde(skip)]
    pub snapshot_dir: Option<PathBuf>,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            batchers: 10,
            syncers: 5,
            max_batch_size: 50,
            batch_interval: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(30 * 60),
            queue_size: 1,
            snapshot_dir: None,
        }
    }
}

impl CacheOptions {
    /// Returns a copy with every count clamped to at least one.
    pub(crate) fn normalized(&self) -> Self {
        Self {
            batchers: self.batchers.max(1),
            syncers: self.syncers.max(1),
            max_batch_size: self.max_batch_size.max(1),
            queue_size: self.queue_size.max(1),
            ..self.clone()
        }
    }
}

/// Per cache options.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct CachesConfig {
    pub accounts: CacheOptions,
    pub pools: CacheOptions,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory for the cache snapshots.
    ///
    /// Caches start cold and are not persisted if this is not set.
    pub cache_dir: Option<PathBuf>,

    /// CSV file mapping pool tickers to pool ids, used to resolve tickers the registry
    /// listing does not know about.
    pub hints_path: Option<PathBuf>,

    /// Logging configuration.
    pub logging: Logging,

    /// Metrics configuration.
    pub metrics: Metrics,

    /// DSN to report internal errors to.
    pub sentry_dsn: Option<Dsn>,

    /// Upstream API configuration.
    pub koios: KoiosConfig,

    /// Settings of the account and pool caches.
    pub caches: CachesConfig,
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }

    /// Options of the account cache, including the snapshot directory.
    pub fn account_options(&self) -> CacheOptions {
        CacheOptions {
            snapshot_dir: self.cache_dir.clone(),
            ..self.caches.accounts.clone()
        }
    }

    /// Options of the pool cache, including the snapshot directory.
    pub fn pool_options(&self) -> CacheOptions {
        CacheOptions {
            snapshot_dir: self.cache_dir.clone(),
            ..self.caches.pools.clone()
        }
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}
