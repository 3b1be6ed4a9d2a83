//! Typed findings and the report that carries them.

use std::{
  fmt,
  path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Violation ───────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationType {
  MissingFile,
  ExtraFile,
  MissingDirectory,
  ChecksumMismatch,
  SizeMismatch,
  CountMismatch,
  StructureViolation,
  InvalidFormat,
  MissingAttachment,
  OrphanedAttachment,
}

impl ViolationType {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::MissingFile => "missing-file",
      Self::ExtraFile => "extra-file",
      Self::MissingDirectory => "missing-directory",
      Self::ChecksumMismatch => "checksum-mismatch",
      Self::SizeMismatch => "size-mismatch",
      Self::CountMismatch => "count-mismatch",
      Self::StructureViolation => "structure-violation",
      Self::InvalidFormat => "invalid-format",
      Self::MissingAttachment => "missing-attachment",
      Self::OrphanedAttachment => "orphaned-attachment",
    }
  }
}

impl fmt::Display for ViolationType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
  Error,
  Warning,
}

impl fmt::Display for Severity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Error => "error",
      Self::Warning => "warning",
    })
  }
}

/// One finding. `file` is repository-relative.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Violation {
  #[serde(rename = "type")]
  pub kind:     ViolationType,
  pub severity: Severity,
  pub file:     String,
  pub message:  String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub line:     Option<u32>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub expected: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub actual:   Option<String>,
}

impl Violation {
  pub fn error(
    kind: ViolationType,
    file: impl Into<String>,
    message: impl Into<String>,
  ) -> Self {
    Self::new(kind, Severity::Error, file.into(), message.into())
  }

  pub fn warning(
    kind: ViolationType,
    file: impl Into<String>,
    message: impl Into<String>,
  ) -> Self {
    Self::new(kind, Severity::Warning, file.into(), message.into())
  }

  fn new(kind: ViolationType, severity: Severity, file: String, message: String) -> Self {
    Self {
      kind,
      severity,
      file,
      message,
      line: None,
      expected: None,
      actual: None,
    }
  }

  pub fn expected_actual(mut self, expected: impl ToString, actual: impl ToString) -> Self {
    self.expected = Some(expected.to_string());
    self.actual = Some(actual.to_string());
    self
  }

  pub fn is_error(&self) -> bool { self.severity == Severity::Error }
}

impl fmt::Display for Violation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{}] {}: {}", self.kind, self.file, self.message)?;
    if let Some(line) = self.line {
      write!(f, " (line {line})")?;
    }
    if let (Some(expected), Some(actual)) = (&self.expected, &self.actual) {
      write!(f, " (expected {expected}, actual {actual})")?;
    }
    Ok(())
  }
}

// ─── Report ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
  Valid,
  Invalid,
}

impl fmt::Display for Status {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      Self::Valid => "valid",
      Self::Invalid => "invalid",
    })
  }
}

/// The outcome of one validation run. Built once; never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
  pub timestamp:       DateTime<Utc>,
  pub repository_path: PathBuf,
  pub status:          Status,
  pub violations:      Vec<Violation>,
}

impl Report {
  /// Status is `Invalid` iff any violation has error severity.
  pub fn new(repository_path: &Path, violations: Vec<Violation>) -> Self {
    let status = if violations.iter().any(Violation::is_error) {
      Status::Invalid
    } else {
      Status::Valid
    };
    Self {
      timestamp: Utc::now(),
      repository_path: repository_path.to_path_buf(),
      status,
      violations,
    }
  }

  pub fn is_valid(&self) -> bool { self.status == Status::Valid }

  pub fn errors(&self) -> impl Iterator<Item = &Violation> {
    self.violations.iter().filter(|v| v.is_error())
  }

  pub fn warnings(&self) -> impl Iterator<Item = &Violation> {
    self.violations.iter().filter(|v| !v.is_error())
  }

  /// Violations of one type, in report order.
  pub fn of_type(&self, kind: ViolationType) -> impl Iterator<Item = &Violation> {
    self.violations.iter().filter(move |v| v.kind == kind)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn warnings_alone_keep_a_report_valid() {
    let report = Report::new(Path::new("/r"), vec![Violation::warning(
      ViolationType::OrphanedAttachment,
      "attachments/ab/x",
      "unreferenced",
    )]);
    assert_eq!(report.status, Status::Valid);

    let report = Report::new(Path::new("/r"), vec![
      Violation::warning(ViolationType::OrphanedAttachment, "a", "unreferenced"),
      Violation::error(ViolationType::MissingFile, "b", "gone"),
    ]);
    assert_eq!(report.status, Status::Invalid);
    assert_eq!(report.errors().count(), 1);
    assert_eq!(report.warnings().count(), 1);
  }

  #[test]
  fn serializes_with_kebab_case_types() {
    let v = Violation::error(ViolationType::ChecksumMismatch, "calls/calls-2015.xml", "bad")
      .expected_actual("aa", "bb");
    let json = serde_json::to_value(&v).unwrap();
    assert_eq!(json["type"], "checksum-mismatch");
    assert_eq!(json["severity"], "error");
    assert_eq!(json["expected"], "aa");
    assert!(json.get("line").is_none());
    assert_eq!(
      v.to_string(),
      "[checksum-mismatch] calls/calls-2015.xml: bad (expected aa, actual bb)"
    );
  }
}
