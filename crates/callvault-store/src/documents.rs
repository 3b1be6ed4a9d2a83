//! TOML side documents stored next to the partitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::layout::MANIFEST_FILE;

// ─── Marker ──────────────────────────────────────────────────────────────────

/// Contents of `.callvault.toml`; identifies a directory as a repository and
/// pins its format version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Marker {
  pub repository_structure_version: String,
  pub created_at:                   DateTime<Utc>,
  pub created_by:                   String,
}

impl Marker {
  pub const REQUIRED_KEYS: [&'static str; 3] =
    ["repository_structure_version", "created_at", "created_by"];
}

// ─── Manifest ────────────────────────────────────────────────────────────────

/// `files.toml`: every repository file except the manifest itself and its
/// checksum, with size and SHA-256 as of the last write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
  pub version:   String,
  pub generated: DateTime<Utc>,
  pub generator: String,
  #[serde(default)]
  pub files:     Vec<ManifestEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
  /// Repository-relative, `/`-separated.
  pub name:     String,
  pub size:     u64,
  /// Hex SHA-256 of the file contents.
  pub checksum: String,
}

impl Manifest {
  /// Body of `files.toml.sha256` for a manifest whose bytes hash to `hash`.
  pub fn checksum_line(hash: &str) -> String { format!("{hash}  {MANIFEST_FILE}\n") }

  /// The hash recorded in a `files.toml.sha256` body.
  pub fn parse_checksum_line(body: &str) -> Option<&str> {
    body.split_whitespace().next()
  }
}

// ─── Summary ─────────────────────────────────────────────────────────────────

/// `summary.toml`: cached aggregates, written by the importer and only ever
/// cross-checked (never trusted) by the validator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoSummary {
  pub last_updated: DateTime<Utc>,
  pub counts:       SummaryCounts,
  pub sizes:        SummarySizes,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryCounts {
  pub calls:       u64,
  pub sms:         u64,
  pub attachments: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarySizes {
  pub attachments_bytes: u64,
}

// ─── Contacts ────────────────────────────────────────────────────────────────

/// `contacts.toml`: display names seen in backups, keyed by number.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contacts {
  #[serde(default)]
  pub contacts: Vec<Contact>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
  pub name:    String,
  pub numbers: Vec<String>,
}
