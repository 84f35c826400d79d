//! Manually maintained ticker to pool id mappings.
//!
//! Some pools are not part of the registry listing, typically because their metadata is broken.
//! A hints file maps their tickers to pool ids, one `ticker,pool_id` CSV record per line. A pool
//! id of `retired` marks a ticker which should not be looked up at all.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// What a hints file says about a ticker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PoolHint {
    /// The bech32 id of the pool.
    PoolId(String),
    /// The pool is retired and should be ignored.
    Retired,
}

#[derive(Clone, Debug, Default)]
pub struct PoolHints {
    hints: HashMap<String, PoolHint>,
}

impl PoolHints {
    /// Reads the hints file at `path`.
    ///
    /// A file that cannot be read yields no hints.
    pub fn load(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let hints = Self::parse(&contents);
                tracing::debug!(path = %path.display(), hints = hints.len(), "loaded pool hints");
                hints
            }
            Err(err) => {
                let stderr: &dyn std::error::Error = &err;
                tracing::warn!(stderr, path = %path.display(), "failed to read pool hints");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Self {
        let mut hints = HashMap::new();
        let records = contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty());

        for (index, record) in records.enumerate() {
            let fields = split_record(record);
            let mut fields = fields.iter().map(String::as_str);
            let (Some(ticker), Some(pool_id)) = (fields.next(), fields.next()) else {
                tracing::debug!(record, "skipping incomplete pool hint");
                continue;
            };
            if index == 0 && ticker == "ticker" {
                continue;
            }
            if ticker.is_empty() || pool_id.is_empty() {
                continue;
            }

            let hint = if pool_id == "retired" {
                PoolHint::Retired
            } else {
                PoolHint::PoolId(pool_id.to_owned())
            };
            hints.insert(ticker.to_owned(), hint);
        }

        Self { hints }
    }

    pub fn get(&self, ticker: &str) -> Option<&PoolHint> {
        self.hints.get(ticker)
    }

    pub fn is_retired(&self, ticker: &str) -> bool {
        self.get(ticker) == Some(&PoolHint::Retired)
    }

    /// Maps the pool ids hinted for `tickers` to their tickers.
    ///
    /// The result can be passed to [`PoolCache::fill_missing_pool_infos`](crate::pools::PoolCache::fill_missing_pool_infos).
    pub fn pool_ids_for<'a>(&self, tickers: impl IntoIterator<Item = &'a str>) -> HashMap<String, String> {
        tickers
            .into_iter()
            .filter_map(|ticker| match self.get(ticker)? {
                PoolHint::PoolId(pool_id) => Some((pool_id.clone(), ticker.to_owned())),
                PoolHint::Retired => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.hints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hints.is_empty()
    }
}

/// Splits a CSV record into its trimmed fields.
///
/// Fields may be enclosed in double quotes, in which case they can contain commas, and a doubled
/// quote stands for a literal one.
fn split_record(record: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = record.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '"' if quoted && chars.peek() == Some(&'"') => {
                chars.next();
                field.push('"');
            }
            '"' if quoted => quoted = false,
            '"' if field.trim().is_empty() => {
                field.clear();
                quoted = true;
            }
            ',' if !quoted => fields.push(std::mem::take(&mut field).trim().to_owned()),
            c => field.push(c),
        }
    }
    fields.push(field.trim().to_owned());
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse() {
        let hints = PoolHints::parse(
            "ticker,pool_id\n\
             ABCD,pool1abcd\n\
             \n\
             OLD,retired\n\
             BROKEN\n\
             \"QUOT\", pool1quot\n",
        );

        assert_eq!(hints.len(), 3);
        assert_eq!(
            hints.get("ABCD"),
            Some(&PoolHint::PoolId("pool1abcd".into()))
        );
        assert!(hints.is_retired("OLD"));
        assert_eq!(
            hints.get("QUOT"),
            Some(&PoolHint::PoolId("pool1quot".into()))
        );
        assert_eq!(hints.get("ticker"), None);
    }

    #[test]
    fn test_quoted_fields() {
        assert_eq!(split_record(r#"ABCD, pool1abcd"#), ["ABCD", "pool1abcd"]);
        assert_eq!(
            split_record(r#""Pool, Inc","pool1inc",extra"#),
            ["Pool, Inc", "pool1inc", "extra"]
        );
        assert_eq!(split_record(r#""SAY ""HI""",pool1hi"#), [r#"SAY "HI""#, "pool1hi"]);
        assert_eq!(split_record("ONLY"), ["ONLY"]);

        let hints = PoolHints::parse("\"Pool, Inc\",pool1inc\n");
        assert_eq!(
            hints.get("Pool, Inc"),
            Some(&PoolHint::PoolId("pool1inc".into()))
        );
    }

    #[test]
    fn test_header_only_skipped_on_first_line() {
        let hints = PoolHints::parse("ABCD,pool1abcd\nticker,pool1ticker\n");
        assert_eq!(
            hints.get("ticker"),
            Some(&PoolHint::PoolId("pool1ticker".into()))
        );
    }

    #[test]
    fn test_pool_ids_for() {
        let hints = PoolHints::parse("ABCD,pool1abcd\nOLD,retired\n");
        let ids = hints.pool_ids_for(["ABCD", "OLD", "NONE"]);
        assert_eq!(ids.len(), 1);
        assert_eq!(ids.get("pool1abcd").map(String::as_str), Some("ABCD"));
    }

    #[test]
    fn test_missing_file() {
        let dir = stakecache_test::tempdir();
        let hints = PoolHints::load(&dir.path().join("does-not-exist.csv"));
        assert!(hints.is_empty());
    }
}
