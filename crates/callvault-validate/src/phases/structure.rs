//! Phase 1: required layout, marker keys and the format-version gate.

use std::{fs, path::Path};

use callvault_core::EntityKind;
use callvault_store::{
  Marker,
  layout::{
    ATTACHMENTS_DIR, MARKER_FILE, REQUIRED_DIRS, REQUIRED_FILES, SUPPORTED_VERSIONS,
    is_valid_hash, parse_partition_file_name, partition_dir,
  },
};

use super::Context;
use crate::{Error, Result, Violation, ViolationType as T};

pub(super) fn run(ctx: &Context) -> Result<Vec<Violation>> {
  let repo = &ctx.repo;
  let mut out = Vec::new();

  for dir in REQUIRED_DIRS {
    if !repo.path(dir).is_dir() {
      out.push(Violation::error(T::MissingDirectory, dir, "required directory is missing"));
    }
  }
  for file in REQUIRED_FILES {
    if !repo.path(file).is_file() {
      out.push(Violation::error(T::MissingFile, file, "required file is missing"));
    }
  }

  check_marker(ctx, &mut out)?;

  for kind in EntityKind::ALL {
    ctx.check()?;
    check_partition_dir(ctx, kind, &mut out)?;
  }
  check_attachment_layout(ctx, &mut out)?;
  Ok(out)
}

/// Fails with [`Error::UnsupportedVersion`], which aborts the whole run.
fn check_marker(ctx: &Context, out: &mut Vec<Violation>) -> Result<()> {
  let path = ctx.repo.path(MARKER_FILE);
  if !path.is_file() {
    return Ok(());
  }
  let table = match fs::read_to_string(&path)?.parse::<toml::Table>() {
    Ok(table) => table,
    Err(e) => {
      out.push(Violation::error(
        T::InvalidFormat,
        MARKER_FILE,
        format!("marker is not valid TOML: {e}"),
      ));
      return Ok(());
    }
  };

  for key in Marker::REQUIRED_KEYS {
    if !table.contains_key(key) {
      out.push(Violation::error(
        T::StructureViolation,
        MARKER_FILE,
        format!("marker is missing required key {key:?}"),
      ));
    }
  }

  match table.get("repository_structure_version") {
    Some(toml::Value::String(found)) if !SUPPORTED_VERSIONS.contains(&found.as_str()) => {
      tracing::warn!(%found, "unsupported repository version");
      return Err(Error::UnsupportedVersion {
        found:     found.clone(),
        supported: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
      });
    }
    Some(toml::Value::String(_)) | None => {}
    Some(other) => out.push(
      Violation::error(
        T::InvalidFormat,
        MARKER_FILE,
        "repository_structure_version must be a string",
      )
      .expected_actual("string", other.type_str()),
    ),
  }
  Ok(())
}

fn check_partition_dir(ctx: &Context, kind: EntityKind, out: &mut Vec<Violation>) -> Result<()> {
  let dir_name = partition_dir(kind);
  for (name, is_dir) in entries(&ctx.repo.path(dir_name))? {
    let rel = format!("{dir_name}/{name}");
    if is_dir {
      out.push(Violation::error(
        T::StructureViolation,
        rel,
        "unexpected directory in partition directory",
      ));
    } else if parse_partition_file_name(kind, &name).is_none() {
      out.push(Violation::error(
        T::StructureViolation,
        rel,
        format!("file name does not follow {kind}-YYYY.xml"),
      ));
    }
  }
  Ok(())
}

/// `attachments/<2 hex>/<64 hex>/<files>` and nothing else.
fn check_attachment_layout(ctx: &Context, out: &mut Vec<Violation>) -> Result<()> {
  let root = ctx.repo.path(ATTACHMENTS_DIR);
  for (prefix, is_dir) in entries(&root)? {
    let rel = format!("{ATTACHMENTS_DIR}/{prefix}");
    let prefix_ok =
      prefix.len() == 2 && prefix.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'));
    if !is_dir || !prefix_ok {
      out.push(Violation::error(
        T::StructureViolation,
        rel,
        "attachment root may only hold two-character hex prefix directories",
      ));
      continue;
    }

    ctx.check()?;
    for (hash, is_dir) in entries(&root.join(&prefix))? {
      let rel = format!("{rel}/{hash}");
      if !is_dir || !is_valid_hash(&hash) || !hash.starts_with(&prefix) {
        out.push(Violation::error(
          T::StructureViolation,
          rel,
          format!("expected a content-hash directory starting with {prefix:?}"),
        ));
        continue;
      }
      for (name, is_dir) in entries(&root.join(&prefix).join(&hash))? {
        if is_dir {
          out.push(Violation::error(
            T::StructureViolation,
            format!("{rel}/{name}"),
            "unexpected directory inside an attachment",
          ));
        }
      }
    }
  }
  Ok(())
}

/// `(name, is_dir)` for each entry of `dir`, sorted; empty if `dir` is not
/// a directory.
fn entries(dir: &Path) -> Result<Vec<(String, bool)>> {
  if !dir.is_dir() {
    return Ok(Vec::new());
  }
  let mut out = Vec::new();
  for entry in fs::read_dir(dir)? {
    let entry = entry?;
    out.push((
      entry.file_name().to_string_lossy().into_owned(),
      entry.file_type()?.is_dir(),
    ));
  }
  out.sort();
  Ok(out)
}
