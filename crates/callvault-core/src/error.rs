//! Error types for `callvault-core`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("operation cancelled")]
  Cancelled,

  #[error("unknown entity kind: {0:?}")]
  UnknownEntityKind(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
