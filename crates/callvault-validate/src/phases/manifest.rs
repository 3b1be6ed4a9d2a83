//! Phase 2: the manifest lists every repository file exactly once.

use std::collections::BTreeSet;

use callvault_store::{
  Manifest,
  layout::{MANIFEST_CHECKSUM_FILE, MANIFEST_FILE, SUPPORTED_VERSIONS, is_valid_hash, to_slash},
};

use super::Context;
use crate::{Result, Violation, ViolationType as T};

pub(super) fn run(ctx: &Context) -> Result<Vec<Violation>> {
  let mut out = Vec::new();
  let Some(manifest) = read(ctx, &mut out)? else {
    return Ok(out);
  };

  if !SUPPORTED_VERSIONS.contains(&manifest.version.as_str()) {
    out.push(
      Violation::error(T::InvalidFormat, MANIFEST_FILE, "unsupported manifest version")
        .expected_actual(SUPPORTED_VERSIONS.join(", "), &manifest.version),
    );
  }

  let on_disk: BTreeSet<String> = ctx.repo.list_files()?.into_iter().collect();
  let mut listed = BTreeSet::new();

  for entry in &manifest.files {
    ctx.check()?;
    let name = entry.name.as_str();
    if !listed.insert(name) {
      out.push(Violation::error(T::InvalidFormat, name, "listed more than once in the manifest"));
      continue;
    }
    if name == MANIFEST_FILE || name == MANIFEST_CHECKSUM_FILE {
      out.push(Violation::error(T::InvalidFormat, name, "the manifest must not list itself"));
      continue;
    }
    match ctx.repo.paths().validate(name) {
      Ok(clean) if to_slash(&clean) == name => {}
      Ok(clean) => {
        out.push(
          Violation::error(T::StructureViolation, name, "manifest path is not normalised")
            .expected_actual(to_slash(&clean), name),
        );
        continue;
      }
      Err(e) => {
        out.push(Violation::error(
          T::StructureViolation,
          name,
          format!("unsafe manifest path: {e}"),
        ));
        continue;
      }
    }

    if !is_valid_hash(&entry.checksum) {
      out.push(Violation::error(
        T::InvalidFormat,
        name,
        format!("recorded checksum {:?} is not 64 lowercase hex characters", entry.checksum),
      ));
    }
    if entry.size == 0 {
      out.push(Violation::error(T::InvalidFormat, name, "recorded size must be positive"));
    }
    if !on_disk.contains(name) {
      out.push(Violation::error(
        T::MissingFile,
        name,
        "listed in the manifest but not present on disk",
      ));
    }
  }

  for name in &on_disk {
    if !listed.contains(name.as_str()) {
      out.push(Violation::error(T::ExtraFile, name.as_str(), "not listed in the manifest"));
    }
  }
  Ok(out)
}

/// The parsed manifest, or `None` when it is absent (a phase 1 finding) or
/// unparseable (reported here).
pub(super) fn read(ctx: &Context, out: &mut Vec<Violation>) -> Result<Option<Manifest>> {
  if !ctx.repo.path(MANIFEST_FILE).is_file() {
    return Ok(None);
  }
  match ctx.repo.read_manifest() {
    Ok(manifest) => Ok(Some(manifest)),
    Err(callvault_store::Error::TomlDe(e)) => {
      out.push(Violation::error(
        T::InvalidFormat,
        MANIFEST_FILE,
        format!("manifest is not valid: {e}"),
      ));
      Ok(None)
    }
    Err(e) => Err(e.into()),
  }
}
