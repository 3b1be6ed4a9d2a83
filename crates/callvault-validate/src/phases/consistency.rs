//! Phase 5: cross-check derived facts against `summary.toml` and the
//! attachment store.

use std::collections::BTreeSet;

use callvault_store::layout::SUMMARY_FILE;

use super::{Context, content::stored_dir};
use crate::{Result, Violation, ViolationType as T};

pub(super) fn run(ctx: &Context) -> Result<Vec<Violation>> {
  let facts = ctx.facts()?;
  let mut out = Vec::new();

  check_summary(ctx, &mut out)?;

  // One finding per partition and path, however many messages share it.
  let mut seen = BTreeSet::new();
  for r in &facts.references {
    ctx.check()?;
    if !seen.insert((r.partition.as_str(), r.path.as_str())) {
      continue;
    }
    match ctx.repo.resolve(&r.path) {
      Ok(path) if path.is_file() => {}
      Ok(_) => out.push(Violation::error(
        T::MissingAttachment,
        r.partition.as_str(),
        format!("references missing attachment {}", r.path),
      )),
      Err(e) => out.push(Violation::error(
        T::StructureViolation,
        r.partition.as_str(),
        format!("unsafe attachment reference {:?}: {e}", r.path),
      )),
    }
  }

  let referenced = facts.referenced_hashes();
  for a in facts.well_formed_stored() {
    if !referenced.contains(a.hash.as_str()) {
      out.push(Violation::warning(
        T::OrphanedAttachment,
        stored_dir(a),
        "no message references this attachment",
      ));
    }
  }
  Ok(out)
}

fn check_summary(ctx: &Context, out: &mut Vec<Violation>) -> Result<()> {
  if !ctx.repo.path(SUMMARY_FILE).is_file() {
    return Ok(());
  }
  let summary = match ctx.repo.read_summary() {
    Ok(summary) => summary,
    Err(callvault_store::Error::TomlDe(e)) => {
      out.push(Violation::error(
        T::InvalidFormat,
        SUMMARY_FILE,
        format!("summary is not valid: {e}"),
      ));
      return Ok(());
    }
    Err(e) => return Err(e.into()),
  };
  let facts = ctx.facts()?;

  let counts = [
    ("calls", summary.counts.calls, facts.calls),
    ("sms", summary.counts.sms, facts.sms),
    (
      "attachments",
      summary.counts.attachments,
      facts.stored.iter().filter(|a| a.blob.is_some()).count() as u64,
    ),
  ];
  for (what, recorded, derived) in counts {
    if recorded != derived {
      out.push(
        Violation::error(
          T::CountMismatch,
          SUMMARY_FILE,
          format!("recorded {what} count disagrees with repository contents"),
        )
        .expected_actual(derived, recorded),
      );
    }
  }

  let bytes: u64 = facts.stored.iter().map(|a| a.size).sum();
  if summary.sizes.attachments_bytes != bytes {
    out.push(
      Violation::error(
        T::SizeMismatch,
        SUMMARY_FILE,
        "recorded attachment bytes disagree with the attachment store",
      )
      .expected_actual(bytes, summary.sizes.attachments_bytes),
    );
  }
  Ok(())
}
