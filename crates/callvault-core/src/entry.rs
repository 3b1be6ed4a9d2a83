//! The capability set shared by every record that can be coalesced.

use std::{fmt, str::FromStr};

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use crate::Error;

/// A record eligible for coalescing.
///
/// Two entries with equal [`Entry::content_hash`] are the same logical
/// record, whatever their other fields hold. The hash must exclude fields
/// that vary between otherwise identical captures (human-readable dates,
/// contact display names).
pub trait Entry: Clone + Send + Sync {
  /// Hex-encoded content fingerprint.
  fn content_hash(&self) -> String;

  /// When the call or message happened.
  fn timestamp(&self) -> DateTime<Utc>;

  /// UTC calendar year of [`Entry::timestamp`]; selects the partition file.
  fn year(&self) -> i32 { self.timestamp().year() }
}

/// The two entity types the repository partitions by year.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
  Calls,
  Sms,
}

impl EntityKind {
  pub const ALL: [EntityKind; 2] = [EntityKind::Calls, EntityKind::Sms];

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Calls => "calls",
      Self::Sms => "sms",
    }
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for EntityKind {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "calls" | "call" => Ok(Self::Calls),
      "sms" | "messages" | "smses" => Ok(Self::Sms),
      other => Err(Error::UnknownEntityKind(other.to_string())),
    }
  }
}
