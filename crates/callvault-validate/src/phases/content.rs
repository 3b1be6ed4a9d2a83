//! Phase 4: re-derive record counts and attachment references from the
//! partitions themselves, and re-hash every stored blob.

use std::collections::{HashMap, HashSet};

use callvault_core::{
  EntityKind, Entry,
  record::{Message, PartPayload},
};
use callvault_store::{
  StoredAttachment,
  layout::{ATTACHMENTS_DIR, METADATA_FILE, is_valid_hash},
};

use super::{Context, manifest};
use crate::{Result, Violation, ViolationType as T};

// ─── Facts ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub(crate) struct PartitionFacts {
  pub kind:       EntityKind,
  pub rel_path:   String,
  pub declared:   Option<usize>,
  pub records:    usize,
  pub rejected:   usize,
  pub wrong_year: usize,
  /// MMS parts still carrying base64 data.
  pub inline:     usize,
  /// Set when the partition could not be decoded at all.
  pub error:      Option<String>,
}

/// A stored-attachment path found in a message partition.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct Reference {
  pub partition: String,
  pub hash:      String,
  pub path:      String,
}

/// Everything phases 4 and 5 need to know about the data itself.
#[derive(Debug, Clone, Default)]
pub(crate) struct ContentFacts {
  pub partitions: Vec<PartitionFacts>,
  pub calls:      u64,
  pub sms:        u64,
  pub references: Vec<Reference>,
  pub stored:     Vec<StoredAttachment>,
}

impl ContentFacts {
  pub fn derive(ctx: &Context) -> Result<Self> {
    let mut facts = Self::default();

    for kind in EntityKind::ALL {
      for file in ctx.repo.partition_files(kind)? {
        ctx.check()?;
        // Misnamed files are a structure-phase finding.
        let Some(year) = file.year else { continue };
        let mut p = PartitionFacts {
          kind,
          rel_path: file.rel_path.clone(),
          declared: None,
          records: 0,
          rejected: 0,
          wrong_year: 0,
          inline: 0,
          error: None,
        };

        match kind {
          EntityKind::Calls => match ctx.repo.read_call_partition(&file) {
            Ok(doc) => {
              p.declared = doc.declared_count;
              p.records = doc.records.len();
              p.rejected = doc.rejected.len();
              p.wrong_year = doc.records.iter().filter(|r| r.year() != year).count();
              facts.calls += p.records as u64;
            }
            Err(e) if is_decode_error(&e) => p.error = Some(e.to_string()),
            Err(e) => return Err(e.into()),
          },
          EntityKind::Sms => match ctx.repo.read_message_partition(&file) {
            Ok(doc) => {
              p.declared = doc.declared_count;
              p.records = doc.records.len();
              p.rejected = doc.rejected.len();
              p.wrong_year = doc.records.iter().filter(|r| r.year() != year).count();
              facts.sms += p.records as u64;
              for message in &doc.records {
                let Message::Mms(mms) = message else { continue };
                for part in &mms.parts {
                  match &part.payload {
                    Some(PartPayload::Stored { hash, path }) => facts.references.push(Reference {
                      partition: file.rel_path.clone(),
                      hash:      hash.clone(),
                      path:      path.clone(),
                    }),
                    Some(PartPayload::Inline { .. }) => p.inline += 1,
                    None => {}
                  }
                }
              }
            }
            Err(e) if is_decode_error(&e) => p.error = Some(e.to_string()),
            Err(e) => return Err(e.into()),
          },
        }
        facts.partitions.push(p);
      }
    }

    if ctx.repo.path(ATTACHMENTS_DIR).is_dir() {
      facts.stored = ctx.repo.attachments()?.list()?;
    }
    tracing::debug!(
      calls = facts.calls,
      sms = facts.sms,
      references = facts.references.len(),
      stored = facts.stored.len(),
      "derived content facts"
    );
    Ok(facts)
  }

  pub fn referenced_hashes(&self) -> HashSet<&str> {
    self.references.iter().map(|r| r.hash.as_str()).collect()
  }

  /// Stored attachments whose directories are well formed; the rest are
  /// structure-phase findings.
  pub fn well_formed_stored(&self) -> impl Iterator<Item = &StoredAttachment> {
    self
      .stored
      .iter()
      .filter(|a| is_valid_hash(&a.hash) && a.hash.starts_with(&a.prefix))
  }
}

fn is_decode_error(e: &callvault_store::Error) -> bool {
  use callvault_store::Error as E;
  matches!(e, E::Security(_) | E::UnexpectedRoot { .. } | E::Malformed(_))
}

pub(crate) fn stored_dir(a: &StoredAttachment) -> String {
  format!("{ATTACHMENTS_DIR}/{}/{}", a.prefix, a.hash)
}

// ─── Phase ───────────────────────────────────────────────────────────────────

pub(super) fn run(ctx: &Context) -> Result<Vec<Violation>> {
  let facts = ctx.facts()?;
  let mut out = Vec::new();

  for p in &facts.partitions {
    let file = p.rel_path.as_str();
    if let Some(err) = &p.error {
      out.push(Violation::error(
        T::InvalidFormat,
        file,
        format!("partition could not be decoded: {err}"),
      ));
      continue;
    }
    match p.declared {
      Some(declared) if declared != p.records + p.rejected => out.push(
        Violation::error(T::CountMismatch, file, "count attribute disagrees with records present")
          .expected_actual(declared, p.records + p.rejected),
      ),
      Some(_) => {}
      None => out.push(Violation::error(
        T::InvalidFormat,
        file,
        "root element has no numeric count attribute",
      )),
    }
    if p.rejected > 0 {
      out.push(Violation::error(
        T::InvalidFormat,
        file,
        format!("{} {} records could not be read", p.rejected, p.kind),
      ));
    }
    if p.wrong_year > 0 {
      out.push(Violation::error(
        T::StructureViolation,
        file,
        format!("{} records belong to a different year's partition", p.wrong_year),
      ));
    }
    if p.inline > 0 {
      out.push(Violation::error(
        T::InvalidFormat,
        file,
        format!("{} parts carry inline data instead of a stored attachment path", p.inline),
      ));
    }
  }

  // Blobs the manifest records under their own hash are re-hashed by the
  // checksum phase; only the rest are re-hashed here.
  let manifest = manifest::read(ctx, &mut Vec::new())?;
  let recorded: HashMap<&str, &str> = manifest
    .iter()
    .flat_map(|m| &m.files)
    .map(|e| (e.name.as_str(), e.checksum.as_str()))
    .collect();

  for a in facts.well_formed_stored() {
    ctx.check()?;
    let dir = stored_dir(a);
    let Some(name) = &a.blob else {
      out.push(Violation::error(T::MissingFile, dir, "attachment directory holds no blob"));
      continue;
    };
    let blob_rel = format!("{dir}/{name}");
    let path = match ctx.repo.resolve(&blob_rel) {
      Ok(path) => path,
      Err(e) => {
        out.push(Violation::error(
          T::StructureViolation,
          blob_rel,
          format!("unsafe attachment path: {e}"),
        ));
        continue;
      }
    };
    if recorded.get(blob_rel.as_str()) != Some(&a.hash.as_str()) {
      let (actual, _) = ctx.checksum(&path)?;
      if actual != a.hash {
        tracing::warn!(file = %blob_rel, "attachment content does not match its hash");
        out.push(
          Violation::error(
            T::ChecksumMismatch,
            blob_rel,
            "attachment content does not match its hash",
          )
          .expected_actual(&a.hash, actual),
        );
      }
    }
    if !ctx.repo.path(&dir).join(METADATA_FILE).is_file() {
      out.push(Violation::warning(
        T::MissingFile,
        format!("{dir}/{METADATA_FILE}"),
        "attachment has no metadata sidecar",
      ));
    }
  }
  Ok(out)
}
