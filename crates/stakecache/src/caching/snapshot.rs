//! Persistence of cache contents across restarts.
//!
//! A snapshot is a JSON lines file named `<cache>.snapshot`. The first line is a header naming
//! the format, its version and the cache it belongs to. Every following line is one entry.
//! Snapshots are written to a temporary file in the same directory first and then renamed over
//! the previous one, so readers never see a partially written snapshot.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::store::CacheStore;
use super::{CacheValue, ReadyTracker};

const SNAPSHOT_FORMAT: &str = "stakecache-snapshot";
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("failed to access snapshot")]
    Io(#[from] io::Error),
    #[error("failed to encode snapshot")]
    Json(#[from] serde_json::Error),
    #[error("unexpected snapshot header: {0}")]
    Header(String),
    #[error("refusing to use {}: insufficient owner permissions", .0.display())]
    Permissions(PathBuf),
}

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize)]
struct SnapshotHeader {
    format: String,
    version: u32,
    cache: String,
}

impl SnapshotHeader {
    fn new(cache: &str) -> Self {
        Self {
            format: SNAPSHOT_FORMAT.into(),
            version: SNAPSHOT_VERSION,
            cache: cache.into(),
        }
    }
}

pub fn snapshot_path(dir: &Path, cache: &str) -> PathBuf {
    dir.join(format!("{cache}.snapshot"))
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn check_owner_permissions(path: &Path, required: u32) -> Result<(), SnapshotError> {
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(path)?.permissions().mode();
    if mode & required != required {
        return Err(SnapshotError::Permissions(path.to_owned()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn check_owner_permissions(path: &Path, _required: u32) -> Result<(), SnapshotError> {
    fs::metadata(path)?;
    Ok(())
}

/// Writes all `values` to the snapshot of `cache` in `dir`.
pub fn save<V: CacheValue>(dir: &Path, cache: &str, values: &[Arc<V>]) -> Result<(), SnapshotError> {
    create_private_dir(dir)?;

    // temp files are created with mode 0600
    let mut temp_file = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut writer = BufWriter::new(temp_file.as_file_mut());
        serde_json::to_writer(&mut writer, &SnapshotHeader::new(cache))?;
        writer.write_all(b"\n")?;
        for value in values {
            serde_json::to_writer(&mut writer, value.as_ref())?;
            writer.write_all(b"\n")?;
        }
        writer.flush()?;
    }
    temp_file.as_file().sync_all()?;
    temp_file
        .persist(snapshot_path(dir, cache))
        .map_err(|err| err.error)?;
    Ok(())
}

/// Reads the snapshot of `cache` from `dir`.
///
/// A record that cannot be decoded ends the load. Everything read up to that point is kept.
pub fn load<V: CacheValue>(dir: &Path, cache: &str) -> Result<Vec<V>, SnapshotError> {
    let path = snapshot_path(dir, cache);
    check_owner_permissions(dir, 0o700)?;
    check_owner_permissions(&path, 0o600)?;

    let mut lines = BufReader::new(File::open(&path)?).lines();
    let header = match lines.next() {
        Some(line) => serde_json::from_str::<SnapshotHeader>(&line?)
            .map_err(|err| SnapshotError::Header(err.to_string()))?,
        None => return Err(SnapshotError::Header("empty snapshot".into())),
    };
    if header != SnapshotHeader::new(cache) {
        return Err(SnapshotError::Header(format!(
            "{} v{} for {}",
            header.format, header.version, header.cache
        )));
    }

    let mut values = Vec::new();
    for (index, line) in lines.enumerate() {
        let value = line
            .map_err(SnapshotError::from)
            .and_then(|line| Ok(serde_json::from_str::<V>(&line)?));
        match value {
            Ok(value) => values.push(value),
            Err(err) => {
                let stderr: &dyn std::error::Error = &err;
                tracing::warn!(stderr, cache, record = index + 1, "stopped reading corrupt snapshot");
                break;
            }
        }
    }
    Ok(values)
}

/// Fills an empty `store` from the snapshot in `dir`, if there is one.
///
/// Failures are logged, the cache then simply starts cold.
pub(crate) fn restore<V: CacheValue>(
    dir: &Path,
    cache: &'static str,
    store: &CacheStore<V>,
    tracker: &ReadyTracker,
) {
    if !store.is_empty() {
        return;
    }

    match load::<V>(dir, cache) {
        Ok(values) => {
            let restored = store.restore(values);
            tracker.reset(restored as i64);
            metric!(counter("caches.snapshot.load") += 1, "cache" => cache, "status" => "ok");
            tracing::info!(cache, entries = restored, "restored cache snapshot");
        }
        Err(SnapshotError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
            tracing::debug!(cache, "no cache snapshot found");
        }
        Err(err) => {
            metric!(counter("caches.snapshot.load") += 1, "cache" => cache, "status" => "error");
            let stderr: &dyn std::error::Error = &err;
            tracing::warn!(stderr, cache, "failed to restore cache snapshot");
        }
    }
}

/// Writes the current contents of `store` to `dir`, logging failures.
pub(crate) fn persist<V: CacheValue>(dir: &Path, cache: &'static str, store: &CacheStore<V>) {
    let values = store.values();
    match save(dir, cache, &values) {
        Ok(()) => {
            metric!(counter("caches.snapshot.save") += 1, "cache" => cache, "status" => "ok");
            tracing::info!(cache, entries = values.len(), "saved cache snapshot");
        }
        Err(err) => {
            metric!(counter("caches.snapshot.save") += 1, "cache" => cache, "status" => "error");
            let stderr: &dyn std::error::Error = &err;
            tracing::error!(stderr, cache, "failed to save cache snapshot");
        }
    }
}
