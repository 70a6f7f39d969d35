//! Persistent cache of fully transformed decode results.
//!
//! One file per cache key, named by a stable hash of the key and holding the
//! encoded transformed raster with no extra metadata. Writes go to a `.tmp`
//! file in the same directory and are committed by rename, so readers never
//! observe a partial entry. Stray `.tmp` files left by a crash are removed
//! when the cache is opened.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::DiskCacheConfig;
use crate::error::CacheError;
use crate::lock::KeyLocks;
use crate::options::CacheKey;

const ENTRY_EXTENSION: &str = "png";
const TMP_SUFFIX: &str = ".tmp";

/// Counters describing disk cache behaviour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiskCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub write_failures: u64,
    pub corrupt_entries: u64,
    pub size_bytes: u64,
}

/// FNV-1a, stable across runs and platforms.
fn hash_u64(input: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in input.as_bytes() {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

struct EntryFile {
    path: PathBuf,
    len: u64,
    modified: SystemTime,
}

/// Directory-backed cache of encoded transformed rasters.
pub struct DiskTransformCache {
    directory: PathBuf,
    max_bytes: u64,
    locks: KeyLocks,
    stats: Mutex<DiskCacheStats>,
}

impl DiskTransformCache {
    /// Open (creating if needed) the cache directory.
    ///
    /// Removes leftover temporary files and enforces the byte budget.
    pub fn open(config: &DiskCacheConfig) -> Result<Self, CacheError> {
        fs::create_dir_all(&config.directory)?;
        let cache = Self {
            directory: config.directory.clone(),
            max_bytes: config.max_bytes,
            locks: KeyLocks::new(),
            stats: Mutex::new(DiskCacheStats::default()),
        };

        let swept = cache.sweep_tmp_files()?;
        if swept > 0 {
            tracing::warn!(count = swept, dir = %cache.directory.display(), "Removed stale disk cache temp files");
        }
        cache.enforce_budget()?;
        tracing::info!(
            dir = %cache.directory.display(),
            max_bytes = cache.max_bytes,
            "Opened transformed-result disk cache"
        );
        Ok(cache)
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.directory
            .join(format!("{:016x}.{ENTRY_EXTENSION}", hash_u64(key.as_str())))
    }

    pub fn exists(&self, key: &CacheKey) -> bool {
        self.entry_path(key).is_file()
    }

    /// Read the committed bytes of `key`, or `None` on a miss.
    ///
    /// A hit refreshes the entry's modification time so budget enforcement
    /// evicts it last.
    pub fn open_read(&self, key: &CacheKey) -> Result<Option<Vec<u8>>, CacheError> {
        let path = self.entry_path(key);
        let _guard = self.locks.lock(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.stats.lock().misses += 1;
                tracing::trace!(%key, "Disk cache miss");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };

        if let Err(err) = touch(&path) {
            tracing::debug!(%key, error = %err, "Failed to refresh disk cache entry time");
        }
        self.stats.lock().hits += 1;
        tracing::debug!(%key, bytes = bytes.len(), "Disk cache hit");
        Ok(Some(bytes))
    }

    /// Replace the entry of `key` with the bytes produced by `encode`.
    ///
    /// Any stale entry is deleted first. The new entry becomes visible only
    /// once `encode` has succeeded and the temp file has been renamed into
    /// place; on failure nothing is left behind. Returns the committed size.
    pub fn write<F>(&self, key: &CacheKey, encode: F) -> Result<u64, CacheError>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()>,
    {
        let path = self.entry_path(key);
        let result = {
            let _guard = self.locks.lock(key);
            self.commit(&path, encode)
        };

        match result {
            Ok(len) => {
                self.stats.lock().writes += 1;
                tracing::debug!(%key, bytes = len, "Disk cache entry committed");
                if let Err(err) = self.enforce_budget() {
                    tracing::warn!(error = %err, "Disk cache budget enforcement failed");
                }
                Ok(len)
            }
            Err(err) => {
                self.stats.lock().write_failures += 1;
                tracing::warn!(%key, error = %err, "Disk cache write aborted");
                Err(err.into())
            }
        }
    }

    fn commit<F>(&self, path: &Path, encode: F) -> io::Result<u64>
    where
        F: FnOnce(&mut dyn Write) -> io::Result<()>,
    {
        remove_if_exists(path)?;

        // Dropping the temp file on any error path deletes it.
        let mut tmp = tempfile::Builder::new()
            .prefix("entry-")
            .suffix(TMP_SUFFIX)
            .tempfile_in(&self.directory)?;
        {
            let mut writer = BufWriter::new(tmp.as_file_mut());
            encode(&mut writer)?;
            writer.flush()?;
        }
        tmp.as_file().sync_all()?;
        let file = tmp.persist(path).map_err(|err| err.error)?;
        Ok(file.metadata()?.len())
    }

    /// Delete an unreadable entry and describe it as a cache error.
    pub fn discard_corrupt(&self, key: &CacheKey, reason: impl Into<String>) -> CacheError {
        let reason = reason.into();
        {
            let _guard = self.locks.lock(key);
            if let Err(err) = remove_if_exists(&self.entry_path(key)) {
                tracing::warn!(%key, error = %err, "Failed to delete corrupt disk cache entry");
            }
        }
        self.stats.lock().corrupt_entries += 1;
        tracing::warn!(%key, %reason, "Deleted corrupt disk cache entry");
        CacheError::DiskCacheCorrupt {
            key: key.to_string(),
            reason,
        }
    }

    /// Delete the entry of `key`. Returns whether one existed.
    pub fn remove(&self, key: &CacheKey) -> Result<bool, CacheError> {
        let _guard = self.locks.lock(key);
        let path = self.entry_path(key);
        let existed = path.is_file();
        remove_if_exists(&path)?;
        Ok(existed)
    }

    /// Delete every committed entry.
    pub fn clear(&self) -> Result<(), CacheError> {
        let entries = self.entries()?;
        for entry in &entries {
            remove_if_exists(&entry.path)?;
        }
        tracing::debug!(count = entries.len(), "Disk cache cleared");
        Ok(())
    }

    /// Total size of committed entries.
    pub fn size_bytes(&self) -> u64 {
        match self.entries() {
            Ok(entries) => entries.iter().map(|e| e.len).sum(),
            Err(err) => {
                tracing::warn!(error = %err, "Failed to scan disk cache");
                0
            }
        }
    }

    pub fn max_bytes(&self) -> u64 {
        self.max_bytes
    }

    pub fn stats(&self) -> DiskCacheStats {
        DiskCacheStats {
            size_bytes: self.size_bytes(),
            ..*self.stats.lock()
        }
    }

    fn entries(&self) -> io::Result<Vec<EntryFile>> {
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&self.directory)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXTENSION) {
                continue;
            }
            // Entries can vanish under a concurrent remove.
            let Ok(meta) = dir_entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            entries.push(EntryFile {
                path,
                len: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(entries)
    }

    /// Delete least recently modified entries until the budget is met.
    fn enforce_budget(&self) -> io::Result<()> {
        let mut entries = self.entries()?;
        let mut total: u64 = entries.iter().map(|e| e.len).sum();
        if total <= self.max_bytes {
            return Ok(());
        }

        entries.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
        let mut evicted = 0usize;
        for entry in entries {
            if total <= self.max_bytes {
                break;
            }
            remove_if_exists(&entry.path)?;
            total -= entry.len;
            evicted += 1;
        }
        tracing::debug!(evicted, size_bytes = total, "Disk cache trimmed to budget");
        Ok(())
    }

    fn sweep_tmp_files(&self) -> io::Result<usize> {
        let mut swept = 0;
        for dir_entry in fs::read_dir(&self.directory)? {
            let path = dir_entry?.path();
            let is_tmp = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(TMP_SUFFIX));
            if is_tmp && path.is_file() {
                remove_if_exists(&path)?;
                swept += 1;
            }
        }
        Ok(swept)
    }
}

impl std::fmt::Debug for DiskTransformCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskTransformCache")
            .field("directory", &self.directory)
            .field("max_bytes", &self.max_bytes)
            .finish()
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

fn touch(path: &Path) -> io::Result<()> {
    fs::OpenOptions::new()
        .append(true)
        .open(path)?
        .set_modified(SystemTime::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn open(dir: &Path, max_bytes: u64) -> DiskTransformCache {
        DiskTransformCache::open(&DiskCacheConfig {
            directory: dir.to_path_buf(),
            max_bytes,
        })
        .unwrap()
    }

    fn bytes(len: usize, fill: u8) -> impl FnOnce(&mut dyn Write) -> io::Result<()> {
        move |sink| sink.write_all(&vec![fill; len])
    }

    fn file_names(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn test_hash_is_stable() {
        assert_eq!(hash_u64(""), 0xcbf29ce484222325);
        assert_eq!(hash_u64("a"), 0xaf63dc4c8601ec8c);
    }

    #[test]
    fn test_write_then_read_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1 << 20);
        let key = CacheKey::from("img1#resize(10x10,exactly,center)").transformed();

        assert!(!cache.exists(&key));
        assert_eq!(cache.write(&key, bytes(100, 7)).unwrap(), 100);
        assert!(cache.exists(&key));

        let first = cache.open_read(&key).unwrap().unwrap();
        let second = cache.open_read(&key).unwrap().unwrap();
        assert_eq!(first, second);
        assert_eq!(first, vec![7u8; 100]);
        assert_eq!(cache.stats().hits, 2);
    }

    #[test]
    fn test_miss_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1 << 20);
        assert!(cache.open_read(&CacheKey::from("nope")).unwrap().is_none());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_failed_encode_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1 << 20);
        let key = CacheKey::from("k");
        cache.write(&key, bytes(10, 1)).unwrap();

        let result = cache.write(&key, |sink| {
            sink.write_all(b"partial")?;
            Err(io::Error::other("encoder failed"))
        });
        assert!(matches!(result, Err(CacheError::DiskIoFailure(_))));
        // The stale entry was deleted before the failed attempt, and no temp file remains.
        assert!(!cache.exists(&key));
        assert!(file_names(dir.path()).is_empty());
        assert_eq!(cache.stats().write_failures, 1);
    }

    #[test]
    fn test_rewrite_replaces_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1 << 20);
        let key = CacheKey::from("k");
        cache.write(&key, bytes(10, 1)).unwrap();
        cache.write(&key, bytes(20, 2)).unwrap();
        assert_eq!(cache.open_read(&key).unwrap().unwrap(), vec![2u8; 20]);
        assert_eq!(file_names(dir.path()).len(), 1);
    }

    #[test]
    fn test_stale_tmp_files_swept_on_open() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("entry-abc.tmp"), b"half").unwrap();
        fs::write(dir.path().join("keep.png"), b"whole").unwrap();

        let cache = open(dir.path(), 1 << 20);
        assert_eq!(file_names(dir.path()), vec!["keep.png".to_string()]);
        assert_eq!(cache.size_bytes(), 5);
    }

    #[test]
    fn test_budget_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 250);
        let old = CacheKey::from("old");
        let mid = CacheKey::from("mid");
        cache.write(&old, bytes(100, 1)).unwrap();
        cache.write(&mid, bytes(100, 2)).unwrap();

        // Make the ordering deterministic regardless of timestamp resolution.
        let now = SystemTime::now();
        fs::OpenOptions::new()
            .append(true)
            .open(cache.entry_path(&old))
            .unwrap()
            .set_modified(now - Duration::from_secs(60))
            .unwrap();
        fs::OpenOptions::new()
            .append(true)
            .open(cache.entry_path(&mid))
            .unwrap()
            .set_modified(now - Duration::from_secs(30))
            .unwrap();

        let new = CacheKey::from("new");
        cache.write(&new, bytes(100, 3)).unwrap();
        assert!(!cache.exists(&old));
        assert!(cache.exists(&mid));
        assert!(cache.exists(&new));
        assert!(cache.size_bytes() <= 250);
    }

    #[test]
    fn test_discard_corrupt_deletes_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1 << 20);
        let key = CacheKey::from("k");
        cache.write(&key, bytes(10, 0)).unwrap();

        let err = cache.discard_corrupt(&key, "not a png");
        assert!(matches!(err, CacheError::DiskCacheCorrupt { .. }));
        assert!(!cache.exists(&key));
        assert_eq!(cache.stats().corrupt_entries, 1);
    }

    #[test]
    fn test_remove_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let cache = open(dir.path(), 1 << 20);
        cache.write(&CacheKey::from("a"), bytes(10, 0)).unwrap();
        cache.write(&CacheKey::from("b"), bytes(10, 0)).unwrap();

        assert!(cache.remove(&CacheKey::from("a")).unwrap());
        assert!(!cache.remove(&CacheKey::from("a")).unwrap());
        assert_eq!(cache.size_bytes(), 10);

        cache.clear().unwrap();
        assert_eq!(cache.size_bytes(), 0);
    }
}
