//! [`Validator`]: runs the phases sequentially or on a bounded pool.

use std::{
  sync::Arc,
  time::{Duration, Instant},
};

use parking_lot::Mutex;
use tokio::sync::{Semaphore, mpsc};

use callvault_store::Repository;

use crate::{
  CancelReason, CriticalPolicy, Error, Phase, Report, Result, ValidateOptions,
  ValidationCache, ValidationMetrics, Violation, phases::Context,
};

type PhaseOutcome = Result<(Vec<Violation>, Duration)>;

/// Validates one repository. Reusable: every [`Validator::validate`] call
/// builds fresh per-run state and overwrites [`Validator::metrics`].
pub struct Validator {
  repo:    Repository,
  options: ValidateOptions,
  policy:  CriticalPolicy,
  cache:   Option<Arc<ValidationCache>>,
  metrics: Mutex<ValidationMetrics>,
}

impl Validator {
  pub fn new(repo: Repository) -> Self {
    Self {
      repo,
      options: ValidateOptions::default(),
      policy: CriticalPolicy::default(),
      cache: None,
      metrics: Mutex::new(ValidationMetrics::default()),
    }
  }

  pub fn with_options(mut self, options: ValidateOptions) -> Self {
    self.options = options;
    self
  }

  pub fn with_policy(mut self, policy: CriticalPolicy) -> Self {
    self.policy = policy;
    self
  }

  pub fn with_cache(mut self, cache: Arc<ValidationCache>) -> Self {
    self.cache = Some(cache);
    self
  }

  pub fn options(&self) -> &ValidateOptions { &self.options }

  pub fn metrics(&self) -> ValidationMetrics { self.metrics.lock().clone() }

  /// Run every phase and build a report.
  ///
  /// A repository with problems is an `Ok` report with
  /// [`Status::Invalid`](crate::Status::Invalid). `Err` means validation
  /// could not finish: unsupported version, cancellation or timeout, early
  /// termination, or an I/O failure. Cancellation and early termination
  /// carry the violations collected so far.
  pub async fn validate(&self) -> Result<Report> {
    let started = Instant::now();
    let deadline = self.options.timeout.map(|t| started + t);
    let ctx = Arc::new(Context::new(
      self.repo.clone(),
      self.cache.clone(),
      self.options.cancel.clone(),
      deadline,
    ));
    let collected = Mutex::new(Vec::new());
    let (hits, misses) = self.cache_counters();
    *self.metrics.lock() = ValidationMetrics::default();

    tracing::info!(
      root = %self.repo.root().display(),
      parallel = self.options.parallel,
      early_termination = self.options.early_termination,
      "validating repository"
    );

    let timer = async {
      match deadline {
        Some(d) => tokio::time::sleep_until(tokio::time::Instant::from_std(d)).await,
        None => std::future::pending().await,
      }
    };
    let outcome = tokio::select! {
      biased;
      _ = self.options.cancel.cancelled() => Err(Error::Interrupted),
      _ = timer => Err(Error::Interrupted),
      outcome = self.run(&ctx, &collected) => outcome,
    };
    // Stragglers on the blocking pool stop at their next check.
    ctx.stop.cancel();

    {
      let (hits_now, misses_now) = self.cache_counters();
      let mut metrics = self.metrics.lock();
      metrics.total = started.elapsed();
      metrics.cache_hits = hits_now - hits;
      metrics.cache_misses = misses_now - misses;
    }

    let report = Report::new(self.repo.root(), std::mem::take(&mut *collected.lock()));
    match outcome {
      Ok(None) => {
        tracing::info!(
          status = ?report.status,
          violations = report.violations.len(),
          elapsed_ms = started.elapsed().as_millis() as u64,
          "validation finished"
        );
        Ok(report)
      }
      Ok(Some(trigger)) => Err(Error::EarlyTermination {
        trigger: Box::new(trigger),
        partial: Box::new(report),
      }),
      Err(Error::Interrupted) => {
        let reason = if ctx.cancel_requested() {
          CancelReason::Requested
        } else {
          CancelReason::Timeout
        };
        tracing::warn!(%reason, "validation cancelled");
        Err(Error::Cancelled {
          reason,
          partial: Box::new(report),
        })
      }
      Err(e) => Err(e),
    }
  }

  fn cache_counters(&self) -> (u64, u64) {
    self
      .cache
      .as_ref()
      .map_or((0, 0), |c| (c.hits(), c.misses()))
  }

  /// `Ok(Some(v))` when `v` triggered early termination.
  async fn run(
    &self,
    ctx: &Arc<Context>,
    collected: &Mutex<Vec<Violation>>,
  ) -> Result<Option<Violation>> {
    // The structure phase holds the version gate, so it always runs alone
    // and first.
    let (violations, elapsed) = run_phase(Phase::Structure, Arc::clone(ctx)).await?;
    let trigger = self.absorb(Phase::Structure, violations, elapsed, collected);
    self.report_progress(Phase::Structure, 1).await;
    if trigger.is_some() {
      return Ok(trigger);
    }

    if self.options.parallel {
      self.run_parallel(ctx, collected).await
    } else {
      self.run_sequential(ctx, collected).await
    }
  }

  async fn run_sequential(
    &self,
    ctx: &Arc<Context>,
    collected: &Mutex<Vec<Violation>>,
  ) -> Result<Option<Violation>> {
    for (i, phase) in Phase::AFTER_GATE.into_iter().enumerate() {
      ctx.check()?;
      let (violations, elapsed) = run_phase(phase, Arc::clone(ctx)).await?;
      let trigger = self.absorb(phase, violations, elapsed, collected);
      self.report_progress(phase, i + 2).await;
      if trigger.is_some() {
        return Ok(trigger);
      }
    }
    Ok(None)
  }

  async fn run_parallel(
    &self,
    ctx: &Arc<Context>,
    collected: &Mutex<Vec<Violation>>,
  ) -> Result<Option<Violation>> {
    let semaphore = Arc::new(Semaphore::new(self.options.max_concurrency.max(1)));
    let (tx, mut rx) = mpsc::unbounded_channel::<(Phase, PhaseOutcome)>();

    for phase in Phase::AFTER_GATE {
      let semaphore = Arc::clone(&semaphore);
      let ctx = Arc::clone(ctx);
      let tx = tx.clone();
      tokio::spawn(async move {
        let outcome = match semaphore.acquire_owned().await {
          Ok(_permit) => run_phase(phase, ctx).await,
          Err(e) => Err(Error::Worker(e.to_string())),
        };
        // The receiver only goes away when the whole run was abandoned.
        let _ = tx.send((phase, outcome));
      });
    }
    drop(tx);

    let mut completed = 1;
    let mut trigger = None;
    let mut failure = None;
    let mut interrupted = false;
    while let Some((phase, outcome)) = rx.recv().await {
      match outcome {
        Ok((violations, elapsed)) => {
          completed += 1;
          if let Some(t) = self.absorb(phase, violations, elapsed, collected)
            && trigger.is_none()
          {
            ctx.stop.cancel();
            trigger = Some(t);
          }
          self.report_progress(phase, completed).await;
        }
        Err(Error::Interrupted) => {
          tracing::debug!(%phase, "phase interrupted");
          interrupted = true;
        }
        Err(e) => {
          tracing::warn!(%phase, error = %e, "phase failed");
          ctx.stop.cancel();
          failure.get_or_insert(e);
        }
      }
    }

    if let Some(e) = failure {
      return Err(e);
    }
    if trigger.is_some() {
      return Ok(trigger);
    }
    if interrupted {
      return Err(Error::Interrupted);
    }
    Ok(None)
  }

  /// Record a finished phase. Returns the critical violation that should end
  /// the run, if early termination is on and one was found.
  fn absorb(
    &self,
    phase: Phase,
    violations: Vec<Violation>,
    elapsed: Duration,
    collected: &Mutex<Vec<Violation>>,
  ) -> Option<Violation> {
    self.metrics.lock().phase_durations.insert(phase, elapsed);
    let trigger = self
      .options
      .early_termination
      .then(|| self.policy.first_critical(&violations).cloned())
      .flatten();
    collected.lock().extend(violations);

    if let Some(t) = &trigger {
      tracing::warn!(%phase, trigger = %t, "critical violation, stopping early");
    }
    trigger
  }

  /// Invoke the progress callback on the blocking pool, waiting for it so
  /// calls arrive in completion order.
  async fn report_progress(&self, phase: Phase, completed: usize) {
    let Some(progress) = self.options.progress.clone() else {
      return;
    };
    let fraction = completed as f64 / Phase::ALL.len() as f64;
    if let Err(e) = tokio::task::spawn_blocking(move || progress(phase.as_str(), fraction)).await {
      tracing::warn!(%phase, error = %e, "progress callback failed");
    }
  }
}

/// Run one phase on the blocking pool.
async fn run_phase(phase: Phase, ctx: Arc<Context>) -> PhaseOutcome {
  let started = Instant::now();
  let violations = tokio::task::spawn_blocking(move || phase.run(&ctx))
    .await
    .map_err(|e| Error::Worker(e.to_string()))??;
  Ok((violations, started.elapsed()))
}
