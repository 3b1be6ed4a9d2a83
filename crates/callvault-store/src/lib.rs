//! On-disk repository for callvault.
//!
//! Owns the directory layout, the TOML side documents (marker, manifest,
//! summary, contacts), the per-year partition XML codec, the
//! content-addressed [`AttachmentStore`] and the [`import`] pipeline that
//! feeds backups through the coalescer into partitions.

mod attachment;
mod documents;
mod repository;

pub mod error;
pub mod import;
pub mod layout;
pub mod partition;

pub use attachment::{AttachmentMetadata, AttachmentStore, StoredAttachment, hash_bytes};
pub use documents::{
  Contact, Contacts, Manifest, ManifestEntry, Marker, RepoSummary, SummaryCounts,
  SummarySizes,
};
pub use error::{Error, Result};
pub use import::{ImportOptions, ImportReport, import_paths};
pub use repository::{PartitionFile, Repository, sha256_file};
