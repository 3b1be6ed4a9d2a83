//! Content-addressed attachment storage.
//!
//! A blob with SHA-256 `h` lives at `h[0..2]/h/<original name>` under the
//! attachment root, next to a `metadata.toml` sidecar. Identical content
//! always lands in the same directory, so storing it again is a no-op.
//! Orphan detection is not done here; the validator cross-references
//! message records against [`AttachmentStore::list`].

use std::{
  fs,
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use callvault_security::PathValidator;

use crate::{
  Error, Result,
  layout::{METADATA_FILE, attachment_store_path, is_valid_hash},
};

/// Hex SHA-256 of `data`.
pub fn hash_bytes(data: &[u8]) -> String { hex::encode(Sha256::digest(data)) }

/// Sidecar describing a stored blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMetadata {
  pub hash:          String,
  pub original_name: String,
  pub mime_type:     String,
  pub size:          u64,
}

/// One hash directory found by [`AttachmentStore::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAttachment {
  /// Name of the first-level directory (normally `hash[0..2]`).
  pub prefix: String,
  /// Name of the hash directory.
  pub hash:   String,
  /// File name of the blob, if the directory holds one.
  pub blob:   Option<String>,
  pub size:   u64,
}

pub struct AttachmentStore {
  root:  PathBuf,
  paths: PathValidator,
}

impl AttachmentStore {
  /// Open the store rooted at `root` (normally `<repo>/attachments`), which
  /// must already exist.
  pub fn open(root: impl AsRef<Path>) -> Result<Self> {
    let paths = PathValidator::new(root)?;
    Ok(Self {
      root: paths.base().to_path_buf(),
      paths,
    })
  }

  pub fn root(&self) -> &Path { &self.root }

  /// Store `data` under `hash`, returning the blob's file name.
  ///
  /// If the hash directory already holds a blob nothing is written and that
  /// blob's name is returned, even when `metadata.original_name` differs.
  pub fn store(
    &self,
    hash: &str,
    data: &[u8],
    metadata: &AttachmentMetadata,
  ) -> Result<String> {
    check_hash(hash)?;
    if metadata.hash != hash {
      return Err(Error::HashMismatch {
        expected: hash.to_string(),
        actual:   metadata.hash.clone(),
      });
    }
    let name = &metadata.original_name;
    self.check_name(name)?;
    let blob_rel = self.paths.validate(&attachment_store_path(hash, name))?;

    if let Some(existing) = self.blob_name(hash)? {
      tracing::debug!(hash, name = %existing, "attachment already stored");
      return Ok(existing);
    }

    if data.is_empty() {
      return Err(Error::EmptyAttachment);
    }
    let actual = hash_bytes(data);
    if actual != hash {
      return Err(Error::HashMismatch {
        expected: hash.to_string(),
        actual,
      });
    }

    let blob_path = self.root.join(&blob_rel);
    let dir = blob_path
      .parent()
      .ok_or_else(|| Error::InvalidName(name.clone()))?;
    fs::create_dir_all(dir)?;
    fs::write(&blob_path, data)?;

    let sidecar = AttachmentMetadata {
      size: data.len() as u64,
      ..metadata.clone()
    };
    fs::write(dir.join(METADATA_FILE), toml::to_string(&sidecar)?)?;

    tracing::debug!(hash, name = %name, size = data.len(), "stored attachment");
    Ok(name.clone())
  }

  /// Reject names that are not a single plain path component.
  pub fn check_name(&self, name: &str) -> Result<()> {
    if name == METADATA_FILE || name.contains('/') || name.starts_with('.') {
      return Err(Error::InvalidName(name.to_string()));
    }
    self.paths.validate(name)?;
    Ok(())
  }

  pub fn exists(&self, hash: &str) -> Result<bool> {
    check_hash(hash)?;
    Ok(self.blob_name(hash)?.is_some())
  }

  pub fn get(&self, hash: &str) -> Result<Vec<u8>> {
    check_hash(hash)?;
    let name = self
      .blob_name(hash)?
      .ok_or_else(|| Error::NotFound(hash.to_string()))?;
    let rel = self.paths.validate(&attachment_store_path(hash, &name))?;
    Ok(fs::read(self.root.join(rel))?)
  }

  pub fn metadata(&self, hash: &str) -> Result<AttachmentMetadata> {
    check_hash(hash)?;
    let path = self.hash_dir(hash).join(METADATA_FILE);
    if !path.is_file() {
      return Err(Error::NotFound(hash.to_string()));
    }
    Ok(toml::from_str(&fs::read_to_string(path)?)?)
  }

  /// Every hash directory under the root, sorted by prefix then hash.
  /// Directory names are reported as found; the validator decides whether
  /// they are well formed.
  pub fn list(&self) -> Result<Vec<StoredAttachment>> {
    let mut out = Vec::new();
    for prefix in sorted_dirs(&self.root)? {
      let prefix_dir = self.root.join(&prefix);
      for hash in sorted_dirs(&prefix_dir)? {
        let dir = prefix_dir.join(&hash);
        let blob = find_blob(&dir)?;
        let size = match &blob {
          Some(name) => fs::metadata(dir.join(name))?.len(),
          None => 0,
        };
        out.push(StoredAttachment {
          prefix: prefix.clone(),
          hash,
          blob,
          size,
        });
      }
    }
    Ok(out)
  }

  fn hash_dir(&self, hash: &str) -> PathBuf { self.root.join(&hash[..2]).join(hash) }

  /// Name of the blob in `hash`'s directory. Prefers the name recorded in
  /// the sidecar, falling back to the first regular file.
  fn blob_name(&self, hash: &str) -> Result<Option<String>> {
    let dir = self.hash_dir(hash);
    if !dir.is_dir() {
      return Ok(None);
    }
    if let Ok(raw) = fs::read_to_string(dir.join(METADATA_FILE))
      && let Ok(meta) = toml::from_str::<AttachmentMetadata>(&raw)
      && dir.join(&meta.original_name).is_file()
      && self.check_name(&meta.original_name).is_ok()
    {
      return Ok(Some(meta.original_name));
    }
    find_blob(&dir)
  }
}

fn check_hash(hash: &str) -> Result<()> {
  if is_valid_hash(hash) {
    Ok(())
  } else {
    Err(Error::InvalidHash(hash.to_string()))
  }
}

fn sorted_dirs(dir: &Path) -> Result<Vec<String>> {
  if !dir.is_dir() {
    return Ok(Vec::new());
  }
  let mut names = Vec::new();
  for entry in fs::read_dir(dir)? {
    let entry = entry?;
    if entry.file_type()?.is_dir() {
      names.push(entry.file_name().to_string_lossy().into_owned());
    }
  }
  names.sort();
  Ok(names)
}

fn find_blob(dir: &Path) -> Result<Option<String>> {
  let mut names = Vec::new();
  for entry in fs::read_dir(dir)? {
    let entry = entry?;
    let name = entry.file_name().to_string_lossy().into_owned();
    if entry.file_type()?.is_file() && name != METADATA_FILE {
      names.push(name);
    }
  }
  names.sort();
  Ok(names.into_iter().next())
}
