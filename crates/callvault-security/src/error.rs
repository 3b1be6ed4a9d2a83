//! Error types for `callvault-security`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("path is empty")]
  EmptyPath,

  #[error("path exceeds {max} bytes")]
  PathTooLong { max: usize },

  #[error("path contains a null byte")]
  NullByte,

  #[error("path contains a backslash: {0:?}")]
  Backslash(String),

  #[error("path contains an encoded traversal sequence: {0:?}")]
  EncodedTraversal(String),

  #[error("path contains a parent-directory reference: {0:?}")]
  ParentReference(String),

  #[error("path must be relative: {0:?}")]
  AbsolutePath(String),

  #[error("path escapes base directory: {0:?}")]
  EscapesBase(String),

  #[error("base directory {path:?} is unusable: {source}")]
  InvalidBase {
    path:   PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("xml syntax error: {0}")]
  Syntax(String),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
