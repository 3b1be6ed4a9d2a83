//! The five validation phases.
//!
//! Each phase is a blocking function over a shared [`Context`]: it reads the
//! materialised repository and returns its own violations. Phases never
//! write to the repository. Long loops call [`Context::check`] so a stop
//! signal is honoured between sub-checks.

mod checksum;
mod consistency;
mod content;
mod manifest;
mod structure;

use std::{
  fmt,
  path::Path,
  sync::{Arc, OnceLock},
  time::Instant,
};

use serde::Serialize;

use callvault_core::CancelToken;
use callvault_store::Repository;

use self::content::ContentFacts;
use crate::{Error, Result, ValidationCache, Violation};

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
  Structure,
  Manifest,
  Checksum,
  Content,
  Consistency,
}

impl Phase {
  pub const ALL: [Phase; 5] = [
    Phase::Structure,
    Phase::Manifest,
    Phase::Checksum,
    Phase::Content,
    Phase::Consistency,
  ];

  /// Phases that may run concurrently once the structure phase has passed
  /// the version gate.
  pub const AFTER_GATE: [Phase; 4] =
    [Phase::Manifest, Phase::Checksum, Phase::Content, Phase::Consistency];

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Structure => "structure",
      Self::Manifest => "manifest",
      Self::Checksum => "checksum",
      Self::Content => "content",
      Self::Consistency => "consistency",
    }
  }

  pub(crate) fn run(self, ctx: &Context) -> Result<Vec<Violation>> {
    ctx.check()?;
    let started = Instant::now();
    let violations = match self {
      Self::Structure => structure::run(ctx),
      Self::Manifest => manifest::run(ctx),
      Self::Checksum => checksum::run(ctx),
      Self::Content => content::run(ctx),
      Self::Consistency => consistency::run(ctx),
    }?;
    tracing::debug!(
      phase = %self,
      violations = violations.len(),
      elapsed_ms = started.elapsed().as_millis() as u64,
      "phase finished"
    );
    Ok(violations)
  }
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

// ─── Context ─────────────────────────────────────────────────────────────────

/// Why [`ContentFacts`] could not be derived; stored in the `OnceLock` in
/// place of an [`Error`].
enum FactsError {
  Interrupted,
  Failed(String),
}

/// State shared by every phase of one run.
pub(crate) struct Context {
  pub repo:     Repository,
  cache:        Option<Arc<ValidationCache>>,
  facts:        OnceLock<Result<ContentFacts, FactsError>>,
  cancel:       CancelToken,
  /// Fired by the orchestrator on early termination, timeout or failure.
  pub stop:     CancelToken,
  deadline:     Option<Instant>,
}

impl Context {
  pub fn new(
    repo: Repository,
    cache: Option<Arc<ValidationCache>>,
    cancel: CancelToken,
    deadline: Option<Instant>,
  ) -> Self {
    Self {
      repo,
      cache,
      facts: OnceLock::new(),
      cancel,
      stop: CancelToken::new(),
      deadline,
    }
  }

  pub fn cancel_requested(&self) -> bool { self.cancel.is_cancelled() }

  pub fn timed_out(&self) -> bool { self.deadline.is_some_and(|d| Instant::now() >= d) }

  /// `Err(Interrupted)` once the run should stop starting new work.
  pub fn check(&self) -> Result<()> {
    if self.cancel_requested() || self.stop.is_cancelled() || self.timed_out() {
      Err(Error::Interrupted)
    } else {
      Ok(())
    }
  }

  /// Hex SHA-256 and size of `path`, through the cache when one is set.
  pub fn checksum(&self, path: &Path) -> Result<(String, u64)> {
    match &self.cache {
      Some(cache) => cache.checksum(path),
      None => Ok(callvault_store::sha256_file(path)?),
    }
  }

  /// Facts re-derived from the partitions and attachment store, computed
  /// at most once per run.
  pub fn facts(&self) -> Result<&ContentFacts> {
    let facts = self.facts.get_or_init(|| {
      ContentFacts::derive(self).map_err(|e| match e {
        Error::Interrupted => FactsError::Interrupted,
        other => FactsError::Failed(other.to_string()),
      })
    });
    match facts {
      Ok(facts) => Ok(facts),
      Err(FactsError::Interrupted) => Err(Error::Interrupted),
      Err(FactsError::Failed(msg)) => Err(Error::Facts(msg.clone())),
    }
  }
}
