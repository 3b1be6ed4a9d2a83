//! [`Repository`]: typed access to a repository directory.

use std::{
  collections::BTreeMap,
  fs::{self, File},
  io::{BufWriter, Write},
  path::{Path, PathBuf},
};

use chrono::Utc;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use callvault_core::{
  EntityKind, Entry,
  record::{CallRecord, Message},
};
use callvault_security::{PathValidator, SafeDecoder};

use crate::{
  AttachmentStore, Error, Result,
  documents::{Contacts, Manifest, ManifestEntry, Marker, RepoSummary},
  layout::{
    ATTACHMENTS_DIR, CONTACTS_FILE, FORMAT_VERSION, MANIFEST_CHECKSUM_FILE,
    MANIFEST_FILE, MARKER_FILE, REQUIRED_DIRS, SUMMARY_FILE, parse_partition_file_name,
    partition_dir, partition_rel_path, to_slash,
  },
  partition::{self, Document},
};

/// Hex SHA-256 and byte length of the file at `path`, streamed.
pub fn sha256_file(path: impl AsRef<Path>) -> Result<(String, u64)> {
  let mut file = File::open(path)?;
  let mut hasher = Sha256::new();
  let size = std::io::copy(&mut file, &mut hasher)?;
  Ok((hex::encode(hasher.finalize()), size))
}

/// A file found in a partition directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionFile {
  /// `None` when the name does not follow `<kind>-YYYY.xml`.
  pub year:     Option<i32>,
  /// Repository-relative, `/`-separated.
  pub rel_path: String,
  pub path:     PathBuf,
}

/// A repository rooted at a directory.
///
/// Paths built from the fixed layout are joined directly; anything derived
/// from file contents goes through [`Repository::resolve`].
#[derive(Debug, Clone)]
pub struct Repository {
  root:  PathBuf,
  paths: PathValidator,
}

impl Repository {
  /// Scaffold an empty repository at `root`, creating the directory if
  /// needed. Fails if a marker file is already present.
  pub fn init(root: impl AsRef<Path>, created_by: &str) -> Result<Self> {
    let root = root.as_ref();
    fs::create_dir_all(root)?;
    if root.join(MARKER_FILE).exists() {
      return Err(Error::AlreadyInitialized(root.to_path_buf()));
    }
    let repo = Self::at(root)?;

    for dir in REQUIRED_DIRS {
      fs::create_dir_all(repo.path(dir))?;
    }
    let marker = Marker {
      repository_structure_version: FORMAT_VERSION.to_string(),
      created_at:                   Utc::now(),
      created_by:                   created_by.to_string(),
    };
    fs::write(repo.path(MARKER_FILE), toml::to_string(&marker)?)?;
    repo.write_contacts(&Contacts::default())?;
    repo.write_summary(&RepoSummary {
      last_updated: Utc::now(),
      counts:       Default::default(),
      sizes:        Default::default(),
    })?;
    repo.write_manifest()?;

    tracing::info!(root = %repo.root.display(), "initialised repository");
    Ok(repo)
  }

  /// Open an existing repository; the marker file must be present.
  pub fn open(root: impl AsRef<Path>) -> Result<Self> {
    let root = root.as_ref();
    if !root.join(MARKER_FILE).is_file() {
      return Err(Error::NotARepository(root.to_path_buf()));
    }
    Self::at(root)
  }

  /// Open `root` without requiring a marker, for tools that report on
  /// broken repositories.
  pub fn at(root: impl AsRef<Path>) -> Result<Self> {
    let paths = PathValidator::new(root)?;
    Ok(Self {
      root: paths.base().to_path_buf(),
      paths,
    })
  }

  pub fn root(&self) -> &Path { &self.root }

  pub fn paths(&self) -> &PathValidator { &self.paths }

  /// Join a trusted, layout-derived relative path onto the root.
  pub fn path(&self, rel: &str) -> PathBuf { self.root.join(rel) }

  /// Validate an untrusted relative path and return it absolute.
  pub fn resolve(&self, untrusted: &str) -> Result<PathBuf> {
    Ok(self.paths.resolve(untrusted)?)
  }

  pub fn attachments(&self) -> Result<AttachmentStore> {
    AttachmentStore::open(self.path(ATTACHMENTS_DIR))
  }

  // ── Side documents ─────────────────────────────────────────────────────

  pub fn read_marker(&self) -> Result<Marker> { read_toml(&self.path(MARKER_FILE)) }

  pub fn read_manifest(&self) -> Result<Manifest> {
    read_toml(&self.path(MANIFEST_FILE))
  }

  pub fn read_summary(&self) -> Result<RepoSummary> {
    read_toml(&self.path(SUMMARY_FILE))
  }

  pub fn write_summary(&self, summary: &RepoSummary) -> Result<()> {
    fs::write(self.path(SUMMARY_FILE), toml::to_string(summary)?)?;
    Ok(())
  }

  pub fn read_contacts(&self) -> Result<Contacts> {
    read_toml(&self.path(CONTACTS_FILE))
  }

  pub fn write_contacts(&self, contacts: &Contacts) -> Result<()> {
    fs::write(self.path(CONTACTS_FILE), toml::to_string(contacts)?)?;
    Ok(())
  }

  // ── Manifest ───────────────────────────────────────────────────────────

  /// Every regular file under the root except the manifest and its
  /// checksum, as sorted `/`-separated relative paths.
  pub fn list_files(&self) -> Result<Vec<String>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(&self.root).min_depth(1) {
      let entry = entry?;
      if !entry.file_type().is_file() {
        continue;
      }
      let rel = entry
        .path()
        .strip_prefix(&self.root)
        .map(to_slash)
        .unwrap_or_default();
      if rel != MANIFEST_FILE && rel != MANIFEST_CHECKSUM_FILE && !rel.is_empty() {
        files.push(rel);
      }
    }
    files.sort();
    Ok(files)
  }

  /// Hash every listed file into a fresh manifest.
  pub fn build_manifest(&self) -> Result<Manifest> {
    let mut entries = Vec::new();
    for name in self.list_files()? {
      let (checksum, size) = sha256_file(self.path(&name))?;
      entries.push(ManifestEntry {
        name,
        size,
        checksum,
      });
    }
    Ok(Manifest {
      version:   FORMAT_VERSION.to_string(),
      generated: Utc::now(),
      generator: format!("callvault {}", env!("CARGO_PKG_VERSION")),
      files:     entries,
    })
  }

  /// Regenerate `files.toml` and `files.toml.sha256` from disk.
  pub fn write_manifest(&self) -> Result<Manifest> {
    let manifest = self.build_manifest()?;
    self.write_manifest_document(&manifest)?;
    Ok(manifest)
  }

  /// Write `manifest` as-is, plus a checksum file matching its bytes.
  pub fn write_manifest_document(&self, manifest: &Manifest) -> Result<()> {
    let body = toml::to_string(manifest)?;
    let hash = hex::encode(Sha256::digest(body.as_bytes()));
    fs::write(self.path(MANIFEST_FILE), body)?;
    fs::write(
      self.path(MANIFEST_CHECKSUM_FILE),
      Manifest::checksum_line(&hash),
    )?;
    tracing::debug!(files = manifest.files.len(), "wrote manifest");
    Ok(())
  }

  // ── Partitions ─────────────────────────────────────────────────────────

  /// Every regular file in `kind`'s partition directory, sorted by name.
  pub fn partition_files(&self, kind: EntityKind) -> Result<Vec<PartitionFile>> {
    let dir_name = partition_dir(kind);
    let dir = self.path(dir_name);
    if !dir.is_dir() {
      return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in fs::read_dir(&dir)? {
      let entry = entry?;
      if !entry.file_type()?.is_file() {
        continue;
      }
      let name = entry.file_name().to_string_lossy().into_owned();
      out.push(PartitionFile {
        year:     parse_partition_file_name(kind, &name),
        rel_path: format!("{dir_name}/{name}"),
        path:     entry.path(),
      });
    }
    out.sort_by(|a, b| a.rel_path.cmp(&b.rel_path));
    Ok(out)
  }

  pub fn read_call_partition(&self, file: &PartitionFile) -> Result<Document<CallRecord>> {
    partition::read_calls(&mut SafeDecoder::open(&file.path)?)
  }

  pub fn read_message_partition(&self, file: &PartitionFile) -> Result<Document<Message>> {
    partition::read_messages(&mut SafeDecoder::open(&file.path)?)
  }

  /// All call records currently stored, in partition order.
  ///
  /// Fails with [`Error::DamagedPartition`] if any record cannot be read,
  /// since rewriting that partition would drop it.
  pub fn load_calls(&self) -> Result<Vec<CallRecord>> {
    let mut records = Vec::new();
    for file in self.partition_files(EntityKind::Calls)? {
      let doc = self.read_call_partition(&file)?;
      ensure_intact(&file, doc.rejected.len())?;
      records.extend(doc.records);
    }
    Ok(records)
  }

  /// All messages currently stored, in partition order.
  pub fn load_messages(&self) -> Result<Vec<Message>> {
    let mut records = Vec::new();
    for file in self.partition_files(EntityKind::Sms)? {
      let doc = self.read_message_partition(&file)?;
      ensure_intact(&file, doc.rejected.len())?;
      records.extend(doc.records);
    }
    Ok(records)
  }

  /// Rewrite one partition file per year from already-sorted `records`.
  /// Returns the record count written per year.
  pub fn write_call_partitions(&self, records: Vec<CallRecord>) -> Result<BTreeMap<i32, usize>> {
    self.write_partitions(EntityKind::Calls, records, |w, recs| {
      partition::write_calls(w, recs)
    })
  }

  pub fn write_message_partitions(&self, records: Vec<Message>) -> Result<BTreeMap<i32, usize>> {
    self.write_partitions(EntityKind::Sms, records, |w, recs| {
      partition::write_messages(w, recs)
    })
  }

  fn write_partitions<E, F>(
    &self,
    kind: EntityKind,
    records: Vec<E>,
    write: F,
  ) -> Result<BTreeMap<i32, usize>>
  where
    E: Entry,
    F: Fn(&mut BufWriter<File>, &[E]) -> Result<()>,
  {
    let mut by_year: BTreeMap<i32, Vec<E>> = BTreeMap::new();
    for record in records {
      by_year.entry(record.year()).or_default().push(record);
    }

    fs::create_dir_all(self.path(partition_dir(kind)))?;
    let mut counts = BTreeMap::new();
    for (year, recs) in by_year {
      let path = self.path(&partition_rel_path(kind, year));
      let mut out = BufWriter::new(File::create(&path)?);
      write(&mut out, &recs)?;
      out.flush()?;
      tracing::debug!(%kind, year, records = recs.len(), "wrote partition");
      counts.insert(year, recs.len());
    }
    Ok(counts)
  }
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
  Ok(toml::from_str(&fs::read_to_string(path)?)?)
}

fn ensure_intact(file: &PartitionFile, rejected: usize) -> Result<()> {
  if rejected > 0 {
    tracing::warn!(file = %file.rel_path, rejected, "partition holds unreadable records");
    return Err(Error::DamagedPartition {
      file: file.rel_path.clone(),
      rejected,
    });
  }
  Ok(())
}
