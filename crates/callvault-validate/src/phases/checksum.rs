//! Phase 3: recompute every recorded hash. Mismatches are reported and
//! never corrected.

use std::{collections::HashSet, fs};

use callvault_store::{
  Manifest,
  layout::{MANIFEST_CHECKSUM_FILE, MANIFEST_FILE, is_valid_hash},
};

use super::{Context, manifest};
use crate::{Result, Violation, ViolationType as T};

pub(super) fn run(ctx: &Context) -> Result<Vec<Violation>> {
  let mut out = Vec::new();
  check_manifest_hash(ctx, &mut out)?;

  // Parse problems were already reported by the manifest phase.
  let Some(manifest) = manifest::read(ctx, &mut Vec::new())? else {
    return Ok(out);
  };

  let mut seen = HashSet::new();
  for entry in &manifest.files {
    ctx.check()?;
    let name = entry.name.as_str();
    if !seen.insert(name)
      || !is_valid_hash(&entry.checksum)
      || name == MANIFEST_FILE
      || name == MANIFEST_CHECKSUM_FILE
    {
      continue;
    }
    // Unsafe and missing paths are manifest-phase findings.
    let Ok(path) = ctx.repo.resolve(name) else {
      continue;
    };
    if !path.is_file() {
      continue;
    }

    let (actual, size) = ctx.checksum(&path)?;
    if actual != entry.checksum {
      tracing::warn!(file = name, "checksum mismatch");
      out.push(
        Violation::error(T::ChecksumMismatch, name, "content does not match recorded checksum")
          .expected_actual(&entry.checksum, actual),
      );
    } else if size != entry.size {
      out.push(
        Violation::error(T::SizeMismatch, name, "size does not match recorded size")
          .expected_actual(entry.size, size),
      );
    }
  }
  Ok(out)
}

fn check_manifest_hash(ctx: &Context, out: &mut Vec<Violation>) -> Result<()> {
  let manifest_path = ctx.repo.path(MANIFEST_FILE);
  let checksum_path = ctx.repo.path(MANIFEST_CHECKSUM_FILE);
  if !manifest_path.is_file() || !checksum_path.is_file() {
    return Ok(());
  }

  let body = fs::read_to_string(&checksum_path)?;
  let Some(expected) = Manifest::parse_checksum_line(&body).filter(|h| is_valid_hash(h)) else {
    out.push(Violation::error(
      T::InvalidFormat,
      MANIFEST_CHECKSUM_FILE,
      "expected \"<sha256>  files.toml\"",
    ));
    return Ok(());
  };

  let (actual, _) = ctx.checksum(&manifest_path)?;
  if actual != expected {
    tracing::warn!(file = MANIFEST_FILE, "manifest checksum mismatch");
    out.push(
      Violation::error(
        T::ChecksumMismatch,
        MANIFEST_FILE,
        "manifest does not match its recorded checksum",
      )
      .expected_actual(expected, actual),
    );
  }
  Ok(())
}
