//! Directory-traversal defence for user-supplied paths.
//!
//! Every path component that originates outside the process (attachment
//! names, manifest entries, command-line arguments) goes through
//! [`PathValidator::validate`] before it touches the filesystem.

use std::{
  fs,
  path::{Component, Path, PathBuf},
};

use crate::{Error, Result};

/// Longest accepted user path, in bytes.
pub const MAX_PATH_LEN: usize = 4096;

/// Lower-cased fragments of percent-encoded `..` sequences, including the
/// double-encoded and mixed forms.
const ENCODED_TRAVERSAL: &[&str] = &[
  "%2e%2e", "%2e.", ".%2e", "%252e", "..%2f", "..%5c", "%c0%ae",
];

/// Confines paths to a base directory.
#[derive(Debug, Clone)]
pub struct PathValidator {
  base: PathBuf,
}

impl PathValidator {
  /// The base directory must exist; it is canonicalised once here so that
  /// symlinked bases (e.g. `/tmp` on macOS) compare correctly.
  pub fn new(base: impl AsRef<Path>) -> Result<Self> {
    let base = base.as_ref();
    let base = fs::canonicalize(base).map_err(|source| Error::InvalidBase {
      path: base.to_path_buf(),
      source,
    })?;
    Ok(Self { base })
  }

  pub fn base(&self) -> &Path { &self.base }

  /// Check `user_path` and return it relative to the base directory.
  ///
  /// The path need not exist yet. When it (or an ancestor) does exist,
  /// symlinks are resolved before the containment check.
  pub fn validate(&self, user_path: &str) -> Result<PathBuf> {
    check_syntax(user_path)?;

    let mut cleaned = PathBuf::new();
    for component in Path::new(user_path).components() {
      match component {
        Component::Normal(part) => cleaned.push(part),
        Component::CurDir => {}
        Component::ParentDir => {
          return Err(Error::ParentReference(user_path.to_string()));
        }
        Component::RootDir | Component::Prefix(_) => {
          return Err(Error::AbsolutePath(user_path.to_string()));
        }
      }
    }

    let resolved = resolve(&self.base.join(&cleaned))
      .ok_or_else(|| Error::EscapesBase(user_path.to_string()))?;

    match resolved.strip_prefix(&self.base) {
      Ok(rel) if rel.as_os_str().is_empty() => Ok(PathBuf::from(".")),
      Ok(rel) => Ok(rel.to_path_buf()),
      Err(_) => {
        tracing::warn!(path = user_path, base = %self.base.display(), "path escapes base directory");
        Err(Error::EscapesBase(user_path.to_string()))
      }
    }
  }

  /// [`PathValidator::validate`], returning the absolute path instead.
  pub fn resolve(&self, user_path: &str) -> Result<PathBuf> {
    Ok(self.base.join(self.validate(user_path)?))
  }
}

fn check_syntax(user_path: &str) -> Result<()> {
  if user_path.is_empty() {
    return Err(Error::EmptyPath);
  }
  if user_path.len() > MAX_PATH_LEN {
    return Err(Error::PathTooLong { max: MAX_PATH_LEN });
  }
  if user_path.contains('\0') {
    return Err(Error::NullByte);
  }
  if user_path.contains('\\') {
    return Err(Error::Backslash(user_path.to_string()));
  }
  let lower = user_path.to_ascii_lowercase();
  if ENCODED_TRAVERSAL.iter().any(|seq| lower.contains(seq)) {
    return Err(Error::EncodedTraversal(user_path.to_string()));
  }
  if user_path.contains("..") {
    return Err(Error::ParentReference(user_path.to_string()));
  }
  if user_path.starts_with('/') {
    return Err(Error::AbsolutePath(user_path.to_string()));
  }
  Ok(())
}

/// Canonicalise `path` if it exists; otherwise canonicalise its deepest
/// existing ancestor and re-append the missing tail.
///
/// Returns `None` for a dangling symlink, whose eventual target cannot be
/// checked.
fn resolve(path: &Path) -> Option<PathBuf> {
  if let Ok(real) = fs::canonicalize(path) {
    return Some(real);
  }
  if fs::symlink_metadata(path).is_ok() {
    return None;
  }

  let mut tail = Vec::new();
  let mut current = path;
  loop {
    let name = current.file_name()?;
    tail.push(name.to_os_string());
    current = current.parent()?;
    if let Ok(real) = fs::canonicalize(current) {
      let mut out = real;
      for part in tail.iter().rev() {
        out.push(part);
      }
      return Some(out);
    }
    if fs::symlink_metadata(current).is_ok() {
      return None;
    }
  }
}
