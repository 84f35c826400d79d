//! Lists of keys to keep in the caches.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};

/// Stake addresses and pool tickers to resolve.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Keys {
    pub accounts: Vec<String>,
    pub pools: Vec<String>,
}

impl Keys {
    /// Reads a keys file.
    ///
    /// Every line holds one key, prefixed by its kind: `account stake1...` or `pool TICKER`.
    /// Empty lines and lines starting with `#` are ignored.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read keys file {}", path.display()))?;
        Self::parse(&contents).with_context(|| format!("invalid keys file {}", path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        let mut keys = Self::default();

        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((kind, key)) = line.split_once(char::is_whitespace) else {
                bail!("line {}: expected `<kind> <key>`", index + 1);
            };
            let key = key.trim().to_owned();
            match kind {
                "account" => keys.accounts.push(key),
                "pool" => keys.pools.push(key),
                other => bail!("line {}: unknown key kind `{other}`", index + 1),
            }
        }

        Ok(keys)
    }

    /// The keys in `self` which are not in `other`.
    pub fn difference(&self, other: &Keys) -> Keys {
        fn new_keys(keys: &[String], known: &[String]) -> Vec<String> {
            let known: HashSet<&String> = known.iter().collect();
            keys.iter()
                .filter(|key| !known.contains(key))
                .cloned()
                .collect()
        }

        Keys {
            accounts: new_keys(&self.accounts, &other.accounts),
            pools: new_keys(&self.pools, &other.pools),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty() && self.pools.is_empty()
    }
}
