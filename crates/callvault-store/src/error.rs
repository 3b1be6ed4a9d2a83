//! Error type for `callvault-store`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] callvault_core::Error),

  #[error("input rejected: {0}")]
  Security(#[from] callvault_security::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("toml parse error: {0}")]
  TomlDe(#[from] toml::de::Error),

  #[error("toml serialization error: {0}")]
  TomlSer(#[from] toml::ser::Error),

  #[error("directory walk error: {0}")]
  Walk(#[from] walkdir::Error),

  #[error("xml write error: {0}")]
  XmlWrite(String),

  #[error("invalid content hash {0:?}: expected 64 lowercase hex characters")]
  InvalidHash(String),

  #[error("content hash mismatch: expected {expected}, computed {actual}")]
  HashMismatch { expected: String, actual: String },

  #[error("invalid attachment name {0:?}")]
  InvalidName(String),

  #[error("refusing to store an empty attachment")]
  EmptyAttachment,

  #[error("attachment not found: {0}")]
  NotFound(String),

  #[error("not a callvault repository: {0:?}")]
  NotARepository(PathBuf),

  #[error("repository already exists at {0:?}")]
  AlreadyInitialized(PathBuf),

  #[error("expected a <{expected}> document, found <{found}>")]
  UnexpectedRoot { expected: String, found: String },

  #[error("{file} holds {rejected} unreadable records; repair it before importing")]
  DamagedPartition { file: String, rejected: usize },

  #[error("malformed document: {0}")]
  Malformed(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
