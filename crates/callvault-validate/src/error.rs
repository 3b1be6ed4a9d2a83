//! Error types for `callvault-validate`.
//!
//! These are operational failures: validation could not be completed. A
//! repository that is known to be bad is not an error; it is a [`Report`]
//! with [`Status::Invalid`](crate::Status::Invalid).

use std::fmt;

use thiserror::Error;

use crate::{Report, Violation};

/// Why a run was cut short by [`Error::Cancelled`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
  /// The caller's [`CancelToken`](callvault_core::CancelToken) fired.
  Requested,
  /// The configured timeout elapsed.
  Timeout,
}

impl fmt::Display for CancelReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Requested => f.write_str("cancellation requested"),
      Self::Timeout => f.write_str("timeout elapsed"),
    }
  }
}

#[derive(Debug, Error)]
pub enum Error {
  #[error("unsupported repository format version {found:?} (supported: {supported:?})")]
  UnsupportedVersion {
    found:     String,
    supported: Vec<String>,
  },

  #[error("validation cancelled: {reason}")]
  Cancelled {
    reason:  CancelReason,
    partial: Box<Report>,
  },

  #[error("validation stopped early on critical violation: {trigger}")]
  EarlyTermination {
    trigger: Box<Violation>,
    partial: Box<Report>,
  },

  #[error("store error: {0}")]
  Store(#[from] callvault_store::Error),

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("cache serialization error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("validation worker failed: {0}")]
  Worker(String),

  #[error("content derivation failed: {0}")]
  Facts(String),

  /// A phase noticed the stop signal and abandoned its work. Only seen
  /// between phases and the orchestrator.
  #[error("validation interrupted")]
  Interrupted,
}

impl Error {
  /// Violations collected before a run was cut short, if any were kept.
  pub fn partial_report(&self) -> Option<&Report> {
    match self {
      Self::Cancelled { partial, .. } | Self::EarlyTermination { partial, .. } => {
        Some(partial)
      }
      _ => None,
    }
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
