//! File checksum cache shared across validation runs.
//!
//! An entry is only trusted while the file's size and modification time
//! are exactly what they were when the hash was computed; anything else is
//! a miss and the file is re-hashed.

use std::{
  collections::HashMap,
  fs,
  path::Path,
  sync::atomic::{AtomicU64, Ordering},
  time::SystemTime,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub checksum: String,
  pub size:     u64,
  pub modified: SystemTime,
}

#[derive(Debug, Default)]
pub struct ValidationCache {
  entries: RwLock<HashMap<String, CacheEntry>>,
  hits:    AtomicU64,
  misses:  AtomicU64,
}

impl ValidationCache {
  pub fn new() -> Self { Self::default() }

  /// Load a cache saved by [`ValidationCache::save`]. A missing file yields
  /// an empty cache.
  pub fn load(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    if !path.exists() {
      return Ok(Self::new());
    }
    let entries: HashMap<String, CacheEntry> = serde_json::from_slice(&fs::read(path)?)?;
    tracing::debug!(path = %path.display(), entries = entries.len(), "loaded validation cache");
    Ok(Self {
      entries: RwLock::new(entries),
      ..Self::default()
    })
  }

  pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
    let body = serde_json::to_vec_pretty(&*self.entries.read())?;
    fs::write(path, body)?;
    Ok(())
  }

  /// Hex SHA-256 and size of `path`, from the cache when the file is
  /// provably unchanged.
  pub fn checksum(&self, path: &Path) -> Result<(String, u64)> {
    let meta = fs::metadata(path)?;
    let modified = meta.modified()?;
    let key = path.to_string_lossy().into_owned();

    if let Some(entry) = self.entries.read().get(&key)
      && entry.size == meta.len()
      && entry.modified == modified
    {
      self.hits.fetch_add(1, Ordering::Relaxed);
      return Ok((entry.checksum.clone(), entry.size));
    }

    self.misses.fetch_add(1, Ordering::Relaxed);
    let (checksum, size) = callvault_store::sha256_file(path)?;
    self.entries.write().insert(key, CacheEntry {
      checksum: checksum.clone(),
      size,
      modified,
    });
    Ok((checksum, size))
  }

  pub fn clear(&self) {
    self.entries.write().clear();
    tracing::debug!("cleared validation cache");
  }

  pub fn len(&self) -> usize { self.entries.read().len() }

  pub fn is_empty(&self) -> bool { self.len() == 0 }

  pub fn hits(&self) -> u64 { self.hits.load(Ordering::Relaxed) }

  pub fn misses(&self) -> u64 { self.misses.load(Ordering::Relaxed) }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn unchanged_file_is_a_hit() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("f.txt");
    fs::write(&file, b"contents").unwrap();

    let cache = ValidationCache::new();
    let first = cache.checksum(&file).unwrap();
    let second = cache.checksum(&file).unwrap();
    assert_eq!(first, second);
    assert_eq!((cache.hits(), cache.misses()), (1, 1));
  }

  #[test]
  fn resized_file_is_rehashed() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("f.txt");
    fs::write(&file, b"short").unwrap();

    let cache = ValidationCache::new();
    let (before, _) = cache.checksum(&file).unwrap();
    fs::write(&file, b"a good deal longer").unwrap();
    let (after, size) = cache.checksum(&file).unwrap();
    assert_ne!(before, after);
    assert_eq!(size, 18);
    assert_eq!(cache.misses(), 2);
  }

  #[test]
  fn save_load_and_clear() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("f.txt");
    fs::write(&file, b"contents").unwrap();
    let saved = dir.path().join("cache.json");

    let cache = ValidationCache::new();
    cache.checksum(&file).unwrap();
    cache.save(&saved).unwrap();

    let loaded = ValidationCache::load(&saved).unwrap();
    assert_eq!(loaded.len(), 1);
    loaded.checksum(&file).unwrap();
    assert_eq!(loaded.hits(), 1);

    loaded.clear();
    assert!(loaded.is_empty());
    assert!(ValidationCache::load(dir.path().join("absent.json")).unwrap().is_empty());
  }
}
