//! Import pipeline: backups → coalescers → partitions.
//!
//! One run seeds a [`Coalescer`] per entity type with the repository's
//! current records, streams every input backup through it, moves inline MMS
//! payloads into the [`AttachmentStore`], and finally rewrites each per-year
//! partition from a single sorted dump. Nothing under the repository root
//! changes on a dry run.

use std::{
  collections::{BTreeMap, BTreeSet, HashSet},
  path::{Path, PathBuf},
};

use chrono::Utc;
use serde::Serialize;
use walkdir::WalkDir;

use callvault_core::{
  CancelToken, Coalescer, EntityKind, Entry, Summary,
  record::{CallRecord, Message, MmsRecord, PartPayload},
};
use callvault_security::{PathValidator, SafeDecoder};

use crate::{
  AttachmentMetadata, AttachmentStore, Contact, Contacts, Error, RepoSummary, Repository,
  Result, SummaryCounts, SummarySizes,
  layout::attachment_rel_path,
  partition::{self, Document},
};

/// Used when a part has no usable file name of its own.
pub const FALLBACK_ATTACHMENT_NAME: &str = "attachment.bin";

const UNKNOWN_CONTACT: &str = "(Unknown)";

#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
  /// Parse, deduplicate and count, but write nothing.
  pub dry_run: bool,
  /// Only import files of this kind; others are skipped.
  pub filter:  Option<EntityKind>,
}

impl ImportOptions {
  fn includes(&self, kind: EntityKind) -> bool { self.filter.is_none_or(|f| f == kind) }
}

// ─── Report ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct YearStats {
  pub added:      usize,
  pub duplicates: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EntityReport {
  pub summary: Summary,
  pub years:   BTreeMap<i32, YearStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AttachmentStats {
  /// Blobs newly written (or that would be, on a dry run).
  pub stored:       usize,
  /// Parts whose content was already in the store.
  pub deduplicated: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileOutcome {
  pub path:     PathBuf,
  /// `None` when the root element was not recognised.
  pub kind:     Option<EntityKind>,
  pub records:  usize,
  pub rejected: usize,
  pub skipped:  bool,
  pub error:    Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportReport {
  pub dry_run:     bool,
  pub calls:       EntityReport,
  pub sms:         EntityReport,
  pub attachments: AttachmentStats,
  pub files:       Vec<FileOutcome>,
}

impl ImportReport {
  pub fn entity(&self, kind: EntityKind) -> &EntityReport {
    match kind {
      EntityKind::Calls => &self.calls,
      EntityKind::Sms => &self.sms,
    }
  }
}

// ─── Entry point ─────────────────────────────────────────────────────────────

/// Import every backup found under `inputs` into `repo`.
///
/// Unreadable or unrecognised backups are recorded in the report and do not
/// stop the run; I/O failures against the repository and cancellation do.
pub fn import_paths(
  repo: &Repository,
  inputs: &[PathBuf],
  options: &ImportOptions,
  cancel: &CancelToken,
) -> Result<ImportReport> {
  let mut importer = Importer::new(repo, options, cancel)?;
  importer.load_existing()?;

  let files = expand_inputs(repo, inputs, &mut importer.files)?;
  tracing::info!(files = files.len(), dry_run = options.dry_run, "importing backups");
  for file in files {
    cancel.check()?;
    importer.import_file(&file)?;
  }
  importer.finish()
}

/// Backups named by `inputs`, in order. Directories are walked for `*.xml`.
///
/// Every candidate is resolved through a [`PathValidator`] rooted at the
/// directory it was found in (a named file's parent), so symlinks leading
/// elsewhere are refused. Files inside the repository are skipped.
fn expand_inputs(
  repo: &Repository,
  inputs: &[PathBuf],
  outcomes: &mut Vec<FileOutcome>,
) -> Result<Vec<PathBuf>> {
  let mut files = Vec::new();
  for input in inputs {
    if input.is_file() {
      let parent = match input.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
      };
      let validator = PathValidator::new(parent)?;
      let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
      if let Some(path) = admit(repo, &validator, &name, input, outcomes) {
        files.push(path);
      }
      continue;
    }
    if !input.is_dir() {
      return Err(Error::NotFound(input.display().to_string()));
    }

    let validator = PathValidator::new(input)?;
    let walker = WalkDir::new(validator.base())
      .min_depth(1)
      .sort_by_file_name();
    for entry in walker {
      let entry = entry?;
      let is_xml = entry
        .path()
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("xml"));
      if !entry.file_type().is_file() || !is_xml {
        continue;
      }
      let rel = entry
        .path()
        .strip_prefix(validator.base())
        .map(crate::layout::to_slash)
        .unwrap_or_default();
      if let Some(path) = admit(repo, &validator, &rel, entry.path(), outcomes) {
        files.push(path);
      }
    }
  }
  Ok(files)
}

/// Resolve `rel` under `validator`; `None` (with a skipped outcome) when it
/// escapes its base or lies inside the repository.
fn admit(
  repo: &Repository,
  validator: &PathValidator,
  rel: &str,
  shown: &Path,
  outcomes: &mut Vec<FileOutcome>,
) -> Option<PathBuf> {
  let error = match validator.resolve(rel) {
    Ok(path) if path.starts_with(repo.root()) => {
      tracing::debug!(path = %path.display(), "skipping file inside the repository");
      "file lies inside the repository".to_string()
    }
    Ok(path) => return Some(path),
    Err(e) => {
      tracing::warn!(path = %shown.display(), error = %e, "skipping input");
      e.to_string()
    }
  };
  outcomes.push(FileOutcome {
    path:     shown.to_path_buf(),
    kind:     None,
    records:  0,
    rejected: 0,
    skipped:  true,
    error:    Some(error),
  });
  None
}

// ─── Importer ────────────────────────────────────────────────────────────────

struct Tally {
  rejected: usize,
  errors:   usize,
  years:    BTreeMap<i32, YearStats>,
}

impl Tally {
  fn new() -> Self {
    Self {
      rejected: 0,
      errors:   0,
      years:    BTreeMap::new(),
    }
  }

  fn record(&mut self, year: i32, added: bool) {
    let stats = self.years.entry(year).or_default();
    if added {
      stats.added += 1;
    } else {
      stats.duplicates += 1;
    }
  }

  fn report(self, summary: Summary) -> EntityReport {
    EntityReport {
      summary: Summary {
        rejected: self.rejected,
        errors: self.errors,
        ..summary
      },
      years:   self.years,
    }
  }
}

struct Importer<'a> {
  repo:        &'a Repository,
  options:     &'a ImportOptions,
  cancel:      &'a CancelToken,
  store:       AttachmentStore,
  calls:       Coalescer<CallRecord>,
  messages:    Coalescer<Message>,
  call_tally:  Tally,
  sms_tally:   Tally,
  attachments: AttachmentStats,
  /// Hashes handled this run, so dry runs count duplicates correctly.
  seen_blobs:  HashSet<String>,
  contacts:    BTreeMap<String, BTreeSet<String>>,
  files:       Vec<FileOutcome>,
}

impl<'a> Importer<'a> {
  fn new(
    repo: &'a Repository,
    options: &'a ImportOptions,
    cancel: &'a CancelToken,
  ) -> Result<Self> {
    let mut contacts: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for contact in repo.read_contacts()?.contacts {
      contacts.entry(contact.name).or_default().extend(contact.numbers);
    }
    Ok(Self {
      repo,
      options,
      cancel,
      store: repo.attachments()?,
      calls: Coalescer::new(),
      messages: Coalescer::new(),
      call_tally: Tally::new(),
      sms_tally: Tally::new(),
      attachments: AttachmentStats::default(),
      seen_blobs: HashSet::new(),
      contacts,
      files: Vec::new(),
    })
  }

  fn load_existing(&mut self) -> Result<()> {
    let calls = self
      .calls
      .load_existing_with_cancel(self.repo.load_calls()?, self.cancel)?;
    let messages = self
      .messages
      .load_existing_with_cancel(self.repo.load_messages()?, self.cancel)?;
    tracing::info!(calls, messages, "loaded existing records");
    Ok(())
  }

  fn import_file(&mut self, path: &Path) -> Result<()> {
    let mut outcome = FileOutcome {
      path:     path.to_path_buf(),
      kind:     None,
      records:  0,
      rejected: 0,
      skipped:  false,
      error:    None,
    };

    let kind = match SafeDecoder::open(path)
      .map_err(Error::from)
      .and_then(|mut d| partition::sniff(&mut d))
    {
      Ok(Some(kind)) => kind,
      Ok(None) => {
        tracing::warn!(path = %path.display(), "not a call or message backup, skipping");
        outcome.skipped = true;
        outcome.error = Some("unrecognised root element".into());
        self.files.push(outcome);
        return Ok(());
      }
      Err(e) => {
        tracing::warn!(path = %path.display(), error = %e, "unreadable backup");
        outcome.error = Some(e.to_string());
        self.files.push(outcome);
        return Ok(());
      }
    };
    outcome.kind = Some(kind);

    if !self.options.includes(kind) {
      tracing::debug!(path = %path.display(), %kind, "filtered out");
      outcome.skipped = true;
      self.files.push(outcome);
      return Ok(());
    }

    let result = match kind {
      EntityKind::Calls => self.import_calls(path),
      EntityKind::Sms => self.import_messages(path),
    };
    match result {
      Ok((records, rejected)) => {
        tracing::info!(path = %path.display(), %kind, records, rejected, "imported backup");
        outcome.records = records;
        outcome.rejected = rejected;
      }
      // Decoding problems are confined to the file; anything else is fatal.
      Err(e @ (Error::Security(_) | Error::UnexpectedRoot { .. } | Error::Malformed(_))) => {
        tracing::warn!(path = %path.display(), error = %e, "failed to decode backup");
        self.tally(kind).errors += 1;
        outcome.error = Some(e.to_string());
      }
      Err(e) => return Err(e),
    }
    self.files.push(outcome);
    Ok(())
  }

  fn tally(&mut self, kind: EntityKind) -> &mut Tally {
    match kind {
      EntityKind::Calls => &mut self.call_tally,
      EntityKind::Sms => &mut self.sms_tally,
    }
  }

  fn import_calls(&mut self, path: &Path) -> Result<(usize, usize)> {
    let doc = partition::read_calls(&mut SafeDecoder::open(path)?)?;
    let rejected = self.note_rejected(EntityKind::Calls, path, &doc);
    let records = doc.records.len();
    for call in doc.records {
      self.note_contact(call.contact_name.as_deref(), &call.number);
      let year = call.year();
      let added = self.calls.add_with_cancel(call, self.cancel)?;
      self.call_tally.record(year, added);
    }
    Ok((records, rejected))
  }

  fn import_messages(&mut self, path: &Path) -> Result<(usize, usize)> {
    let doc = partition::read_messages(&mut SafeDecoder::open(path)?)?;
    let mut rejected = self.note_rejected(EntityKind::Sms, path, &doc);
    let mut records = 0;
    for mut message in doc.records {
      self.cancel.check()?;
      match &mut message {
        Message::Sms(sms) => self.note_contact(sms.contact_name.as_deref(), &sms.address),
        Message::Mms(mms) => {
          self.note_contact(mms.contact_name.as_deref(), &mms.address);
          if let Err(reason) = self.extract_parts(mms)? {
            tracing::warn!(path = %path.display(), %reason, "rejecting mms");
            self.sms_tally.rejected += 1;
            rejected += 1;
            continue;
          }
        }
      }
      records += 1;
      let year = message.year();
      let added = self.messages.add_with_cancel(message, self.cancel)?;
      self.sms_tally.record(year, added);
    }
    Ok((records, rejected))
  }

  fn note_rejected<T>(&mut self, kind: EntityKind, path: &Path, doc: &Document<T>) -> usize {
    for r in &doc.rejected {
      tracing::debug!(path = %path.display(), element = %r.element, reason = %r.reason, "rejected record");
    }
    let n = doc.rejected.len();
    self.tally(kind).rejected += n;
    n
  }

  fn note_contact(&mut self, name: Option<&str>, number: &str) {
    if let Some(name) = name.map(str::trim)
      && !name.is_empty()
      && name != UNKNOWN_CONTACT
      && !number.is_empty()
    {
      self
        .contacts
        .entry(name.to_string())
        .or_default()
        .insert(number.to_string());
    }
  }

  /// Move every inline payload of `mms` into the attachment store, replacing
  /// it with a stored path. The inner `Err` rejects the message before any
  /// part is stored; the outer one is an operational failure.
  fn extract_parts(&mut self, mms: &mut MmsRecord) -> Result<Result<(), String>> {
    for part in &mms.parts {
      if let Some(PartPayload::Inline { data, .. }) = &part.payload
        && data.is_empty()
      {
        return Ok(Err(format!("part {} has an empty payload", part.seq)));
      }
    }

    for part in &mut mms.parts {
      let Some(PartPayload::Inline { hash, data }) = &part.payload else {
        continue;
      };
      let hash = hash.clone();

      let mut name = part
        .name
        .clone()
        .filter(|n| !n.is_empty() && n != "null")
        .unwrap_or_else(|| FALLBACK_ATTACHMENT_NAME.to_string());
      if let Err(e) = self.store.check_name(&name) {
        tracing::warn!(%name, error = %e, "unusable attachment name, using fallback");
        name = FALLBACK_ATTACHMENT_NAME.to_string();
      }

      let known = self.seen_blobs.contains(&hash) || self.store.exists(&hash)?;
      if known {
        self.attachments.deduplicated += 1;
      } else {
        self.attachments.stored += 1;
      }
      self.seen_blobs.insert(hash.clone());

      if !self.options.dry_run {
        let meta = AttachmentMetadata {
          hash:          hash.clone(),
          original_name: name.clone(),
          mime_type:     part.content_type.clone(),
          size:          data.len() as u64,
        };
        name = self.store.store(&hash, data, &meta)?;
      }
      part.payload = Some(PartPayload::Stored {
        path: attachment_rel_path(&hash, &name),
        hash,
      });
    }
    Ok(Ok(()))
  }

  fn finish(self) -> Result<ImportReport> {
    let calls = self.calls.all_with_cancel(self.cancel)?;
    let messages = self.messages.all_with_cancel(self.cancel)?;
    let call_summary = self.calls.summary();
    let sms_summary = self.messages.summary();

    if !self.options.dry_run {
      let (n_calls, n_messages) = (calls.len() as u64, messages.len() as u64);
      if self.options.includes(EntityKind::Calls) {
        self.repo.write_call_partitions(calls)?;
      }
      if self.options.includes(EntityKind::Sms) {
        self.repo.write_message_partitions(messages)?;
      }

      self.repo.write_contacts(&Contacts {
        contacts: self
          .contacts
          .into_iter()
          .map(|(name, numbers)| Contact {
            name,
            numbers: numbers.into_iter().collect(),
          })
          .collect(),
      })?;

      let stored = self.store.list()?;
      self.repo.write_summary(&RepoSummary {
        last_updated: Utc::now(),
        counts:       SummaryCounts {
          calls:       n_calls,
          sms:         n_messages,
          attachments: stored.iter().filter(|a| a.blob.is_some()).count() as u64,
        },
        sizes:        SummarySizes {
          attachments_bytes: stored.iter().map(|a| a.size).sum(),
        },
      })?;
      self.repo.write_manifest()?;
    }

    let report = ImportReport {
      dry_run:     self.options.dry_run,
      calls:       self.call_tally.report(call_summary),
      sms:         self.sms_tally.report(sms_summary),
      attachments: self.attachments,
      files:       self.files,
    };
    tracing::info!(
      calls_added = report.calls.summary.added,
      calls_duplicates = report.calls.summary.duplicates,
      sms_added = report.sms.summary.added,
      sms_duplicates = report.sms.summary.duplicates,
      attachments_stored = report.attachments.stored,
      "import finished"
    );
    Ok(report)
  }
}
