use std::{collections::BTreeSet, fmt, sync::Arc, time::Duration};

use callvault_core::CancelToken;

use crate::{Violation, ViolationType};

/// Called with `(phase name, fraction complete)` after each phase finishes.
/// Runs on the blocking pool; the next phase's report waits for it to return.
pub type ProgressFn = Arc<dyn Fn(&str, f64) + Send + Sync>;

pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

#[derive(Clone)]
pub struct ValidateOptions {
  /// Run phases 2 to 5 on a bounded worker pool instead of in order.
  pub parallel:          bool,
  /// Stop at the first phase that reports a critical violation.
  pub early_termination: bool,
  pub max_concurrency:   usize,
  /// Applies to the whole run; expiry behaves like cancellation.
  pub timeout:           Option<Duration>,
  pub progress:          Option<ProgressFn>,
  pub cancel:            CancelToken,
}

impl Default for ValidateOptions {
  fn default() -> Self {
    Self {
      parallel:          false,
      early_termination: false,
      max_concurrency:   DEFAULT_MAX_CONCURRENCY,
      timeout:           None,
      progress:          None,
      cancel:            CancelToken::new(),
    }
  }
}

impl fmt::Debug for ValidateOptions {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ValidateOptions")
      .field("parallel", &self.parallel)
      .field("early_termination", &self.early_termination)
      .field("max_concurrency", &self.max_concurrency)
      .field("timeout", &self.timeout)
      .field("progress", &self.progress.is_some())
      .finish_non_exhaustive()
  }
}

/// Which violation types end a run when early termination is on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CriticalPolicy {
  types: BTreeSet<ViolationType>,
}

impl Default for CriticalPolicy {
  fn default() -> Self {
    Self::new([ViolationType::ChecksumMismatch, ViolationType::StructureViolation])
  }
}

impl CriticalPolicy {
  pub fn new(types: impl IntoIterator<Item = ViolationType>) -> Self {
    Self {
      types: types.into_iter().collect(),
    }
  }

  pub fn types(&self) -> impl Iterator<Item = ViolationType> + '_ {
    self.types.iter().copied()
  }

  /// Warnings are never critical.
  pub fn is_critical(&self, violation: &Violation) -> bool {
    violation.is_error() && self.types.contains(&violation.kind)
  }

  pub fn first_critical<'a>(&self, violations: &'a [Violation]) -> Option<&'a Violation> {
    violations.iter().find(|v| self.is_critical(v))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_policy_covers_tampering_and_layout() {
    let policy = CriticalPolicy::default();
    let tamper = Violation::error(ViolationType::ChecksumMismatch, "f", "m");
    let count = Violation::error(ViolationType::CountMismatch, "f", "m");
    let orphan = Violation::warning(ViolationType::OrphanedAttachment, "f", "m");
    assert!(policy.is_critical(&tamper));
    assert!(!policy.is_critical(&count));
    assert!(!policy.is_critical(&orphan));

    let custom = CriticalPolicy::new([ViolationType::CountMismatch]);
    assert_eq!(custom.first_critical(&[tamper, count.clone()]), Some(&count));
  }
}
