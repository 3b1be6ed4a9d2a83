//! Repository directory layout.
//!
//! ```text
//! <root>/
//!   .callvault.toml                 marker
//!   calls/calls-YYYY.xml            one partition per year
//!   sms/sms-YYYY.xml
//!   attachments/ab/<hash>/<name>    content-addressed blobs
//!   attachments/ab/<hash>/metadata.toml
//!   contacts.toml
//!   summary.toml
//!   files.toml                      manifest of every other file
//!   files.toml.sha256
//! ```

use std::path::Path;

use callvault_core::EntityKind;

pub const MARKER_FILE: &str = ".callvault.toml";
pub const CALLS_DIR: &str = "calls";
pub const SMS_DIR: &str = "sms";
pub const ATTACHMENTS_DIR: &str = "attachments";
pub const CONTACTS_FILE: &str = "contacts.toml";
pub const SUMMARY_FILE: &str = "summary.toml";
pub const MANIFEST_FILE: &str = "files.toml";
pub const MANIFEST_CHECKSUM_FILE: &str = "files.toml.sha256";

/// Per-attachment sidecar; reserved as an attachment name.
pub const METADATA_FILE: &str = "metadata.toml";

/// Format version written by this release.
pub const FORMAT_VERSION: &str = "1";
/// Format versions this release can read and validate.
pub const SUPPORTED_VERSIONS: &[&str] = &["1"];

pub const REQUIRED_DIRS: [&str; 3] = [CALLS_DIR, SMS_DIR, ATTACHMENTS_DIR];
pub const REQUIRED_FILES: [&str; 5] = [
  MARKER_FILE,
  CONTACTS_FILE,
  SUMMARY_FILE,
  MANIFEST_FILE,
  MANIFEST_CHECKSUM_FILE,
];

/// Length of a hex-encoded SHA-256 digest.
pub const HASH_LEN: usize = 64;

pub fn is_valid_hash(s: &str) -> bool {
  s.len() == HASH_LEN && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

// ─── Partitions ──────────────────────────────────────────────────────────────

pub fn partition_dir(kind: EntityKind) -> &'static str {
  match kind {
    EntityKind::Calls => CALLS_DIR,
    EntityKind::Sms => SMS_DIR,
  }
}

/// Root element of a partition or backup document.
pub fn root_element(kind: EntityKind) -> &'static str {
  match kind {
    EntityKind::Calls => "calls",
    EntityKind::Sms => "smses",
  }
}

pub fn partition_file_name(kind: EntityKind, year: i32) -> String {
  format!("{}-{year:04}.xml", kind.as_str())
}

/// `calls/calls-2015.xml`
pub fn partition_rel_path(kind: EntityKind, year: i32) -> String {
  format!("{}/{}", partition_dir(kind), partition_file_name(kind, year))
}

/// The year encoded in a partition file name, if the name is well formed.
pub fn parse_partition_file_name(kind: EntityKind, name: &str) -> Option<i32> {
  let digits = name
    .strip_prefix(kind.as_str())?
    .strip_prefix('-')?
    .strip_suffix(".xml")?;
  if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
    return None;
  }
  digits.parse().ok()
}

// ─── Attachments ─────────────────────────────────────────────────────────────

/// `ab/<hash>/<name>`, relative to the attachment root.
pub fn attachment_store_path(hash: &str, name: &str) -> String {
  format!("{}/{hash}/{name}", &hash[..2])
}

/// `attachments/ab/<hash>/<name>`, relative to the repository root.
pub fn attachment_rel_path(hash: &str, name: &str) -> String {
  format!("{ATTACHMENTS_DIR}/{}", attachment_store_path(hash, name))
}

/// Split a repository-relative attachment path into `(hash, name)`.
///
/// Only the shape is checked here; callers must still pass the path through
/// a [`PathValidator`](callvault_security::PathValidator) before opening it.
pub fn parse_attachment_rel_path(path: &str) -> Option<(&str, &str)> {
  let mut parts = path.split('/');
  let (root, prefix, hash, name) =
    (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
  if parts.next().is_some() || root != ATTACHMENTS_DIR || name.is_empty() {
    return None;
  }
  (is_valid_hash(hash) && prefix == &hash[..2]).then_some((hash, name))
}

/// Render a relative path with `/` separators regardless of platform.
pub fn to_slash(rel: &Path) -> String {
  rel
    .components()
    .map(|c| c.as_os_str().to_string_lossy())
    .collect::<Vec<_>>()
    .join("/")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn partition_names_round_trip() {
    assert_eq!(partition_rel_path(EntityKind::Sms, 2015), "sms/sms-2015.xml");
    assert_eq!(
      parse_partition_file_name(EntityKind::Calls, "calls-2015.xml"),
      Some(2015)
    );
    assert_eq!(parse_partition_file_name(EntityKind::Calls, "sms-2015.xml"), None);
    assert_eq!(parse_partition_file_name(EntityKind::Calls, "calls-15.xml"), None);
    assert_eq!(parse_partition_file_name(EntityKind::Calls, "calls-2015.txt"), None);
  }

  #[test]
  fn attachment_paths_are_two_level() {
    let hash = "0a".repeat(32);
    let rel = attachment_rel_path(&hash, "cat.jpg");
    assert_eq!(rel, format!("attachments/0a/{hash}/cat.jpg"));
    assert_eq!(parse_attachment_rel_path(&rel), Some((hash.as_str(), "cat.jpg")));
  }

  #[test]
  fn malformed_attachment_paths_are_rejected() {
    let hash = "0a".repeat(32);
    for bad in [
      format!("attachments/0b/{hash}/cat.jpg"),
      format!("attachments/0a/{hash}"),
      format!("attachments/0a/{hash}/sub/cat.jpg"),
      format!("elsewhere/0a/{hash}/cat.jpg"),
      "attachments/0a/NOTAHASH/cat.jpg".to_string(),
    ] {
      assert_eq!(parse_attachment_rel_path(&bad), None, "{bad}");
    }
  }

  #[test]
  fn hash_validation_requires_lowercase_hex() {
    assert!(is_valid_hash(&"f".repeat(64)));
    assert!(!is_valid_hash(&"F".repeat(64)));
    assert!(!is_valid_hash(&"f".repeat(63)));
    assert!(!is_valid_hash(&"g".repeat(64)));
  }
}
