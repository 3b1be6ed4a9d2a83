//! `callvault`: keep call and message backups in a verifiable repository.
//!
//! # Usage
//!
//! ```
//! callvault init ~/vault
//! callvault import --repo ~/vault ~/Downloads/backups
//! callvault validate --repo ~/vault --parallel --cache ~/.cache/callvault.json
//! ```
//!
//! `validate` exits 1 when the repository is invalid and 2 when it could
//! not be validated at all.

mod config;

use std::{
  fs,
  path::{Path, PathBuf},
  process::ExitCode,
  sync::Arc,
  time::Duration,
};

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use callvault_core::{CancelToken, EntityKind};
use callvault_store::{ImportOptions, ImportReport, Repository, import_paths};
use callvault_validate::{
  Error as ValidateError, Report, ValidateOptions, ValidationCache, Validator,
};

use crate::config::CliConfig;

// ─── CLI args ─────────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "callvault", version, about = "Call and message backup repository")]
struct Cli {
  /// Path to a TOML config file (default: ./callvault.toml if present).
  #[arg(short, long, value_name = "FILE", global = true)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Create an empty repository.
  Init {
    dir: PathBuf,
  },

  /// Merge backup files into the repository.
  Import {
    #[arg(long, value_name = "DIR")]
    repo: Option<PathBuf>,

    /// Report what would change without writing anything.
    #[arg(long)]
    dry_run: bool,

    /// Only import backups of this kind (calls or sms).
    #[arg(long, value_name = "KIND")]
    filter: Option<EntityKind>,

    /// Backup files, or directories searched for `*.xml`.
    #[arg(required = true)]
    paths: Vec<PathBuf>,
  },

  /// Check repository integrity.
  Validate {
    #[arg(long, value_name = "DIR")]
    repo: Option<PathBuf>,

    #[arg(long)]
    parallel: bool,

    /// Stop at the first critical violation.
    #[arg(long)]
    early_termination: bool,

    #[arg(long, value_name = "N")]
    max_concurrency: Option<usize>,

    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    /// Print the report as JSON.
    #[arg(long)]
    json: bool,

    /// Checksum cache file; must live outside the repository.
    #[arg(long, value_name = "FILE")]
    cache: Option<PathBuf>,
  },
}

// ─── Entry point ──────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
  tracing_subscriber::fmt()
    .with_writer(std::io::stderr)
    .with_env_filter(
      EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy(),
    )
    .init();

  let cli = Cli::parse();
  match run(cli).await {
    Ok(code) => code,
    Err(e) => {
      eprintln!("error: {e:#}");
      ExitCode::from(2)
    }
  }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
  let cfg = CliConfig::load(cli.config.as_deref())?;
  let cancel = CancelToken::new();
  cancel_on_ctrl_c(cancel.clone());

  match cli.command {
    Command::Init { dir } => {
      let repo = Repository::init(&dir, &format!("callvault {}", env!("CARGO_PKG_VERSION")))
        .with_context(|| format!("failed to initialise repository at {}", dir.display()))?;
      println!("initialised repository at {}", repo.root().display());
      Ok(ExitCode::SUCCESS)
    }
    Command::Import {
      repo,
      dry_run,
      filter,
      paths,
    } => {
      let root = repo_root(repo, &cfg);
      let repo = Repository::open(&root)
        .with_context(|| format!("failed to open repository at {}", root.display()))?;
      let options = ImportOptions { dry_run, filter };
      let report =
        tokio::task::spawn_blocking(move || import_paths(&repo, &paths, &options, &cancel))
          .await
          .context("import task failed")?
          .context("import failed")?;
      print_import(&report);
      Ok(ExitCode::SUCCESS)
    }
    Command::Validate {
      repo,
      parallel,
      early_termination,
      max_concurrency,
      timeout,
      json,
      cache,
    } => {
      let root = repo_root(repo, &cfg);
      let repo = Repository::at(&root)
        .with_context(|| format!("failed to open repository at {}", root.display()))?;
      let options = ValidateOptions {
        parallel: parallel || cfg.validate.parallel,
        early_termination: early_termination || cfg.validate.early_termination,
        max_concurrency: max_concurrency.unwrap_or(cfg.validate.max_concurrency),
        timeout: timeout.or(cfg.validate.timeout_secs).map(Duration::from_secs),
        cancel,
        ..Default::default()
      };
      validate(repo, options, cache.as_deref(), json).await
    }
  }
}

fn repo_root(flag: Option<PathBuf>, cfg: &CliConfig) -> PathBuf {
  flag
    .or_else(|| cfg.repo_root.clone())
    .unwrap_or_else(|| PathBuf::from("."))
}

fn cancel_on_ctrl_c(cancel: CancelToken) {
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      tracing::warn!("interrupt received, stopping");
      cancel.cancel();
    }
  });
}

// ─── Validate ─────────────────────────────────────────────────────────────────

async fn validate(
  repo: Repository,
  options: ValidateOptions,
  cache_path: Option<&Path>,
  json: bool,
) -> anyhow::Result<ExitCode> {
  let cache = match cache_path {
    Some(path) => {
      ensure_outside(repo.root(), path)?;
      let cache = ValidationCache::load(path)
        .with_context(|| format!("failed to load cache {}", path.display()))?;
      Some(Arc::new(cache))
    }
    None => None,
  };

  let mut validator = Validator::new(repo).with_options(options);
  if let Some(cache) = &cache {
    validator = validator.with_cache(Arc::clone(cache));
  }
  let outcome = validator.validate().await;

  let metrics = validator.metrics();
  tracing::debug!(
    total_ms = metrics.total.as_millis() as u64,
    cache_hits = metrics.cache_hits,
    cache_misses = metrics.cache_misses,
    "validation metrics"
  );
  if let (Some(cache), Some(path)) = (&cache, cache_path) {
    cache
      .save(path)
      .with_context(|| format!("failed to save cache {}", path.display()))?;
  }

  match outcome {
    Ok(report) => {
      print_report(&report, json)?;
      Ok(if report.is_valid() { ExitCode::SUCCESS } else { ExitCode::from(1) })
    }
    Err(ValidateError::EarlyTermination { trigger, partial }) => {
      print_report(&partial, json)?;
      eprintln!("stopped early on {trigger}");
      Ok(ExitCode::from(1))
    }
    Err(ValidateError::Cancelled { reason, partial }) => {
      print_report(&partial, json)?;
      bail!("validation cancelled ({reason})")
    }
    Err(e) => Err(e).context("validation failed"),
  }
}

/// Refuse a cache file inside the repository: it would show up as an extra
/// file and change on every run.
fn ensure_outside(root: &Path, file: &Path) -> anyhow::Result<()> {
  let root = fs::canonicalize(root)?;
  let parent = match file.parent() {
    Some(p) if !p.as_os_str().is_empty() => p,
    _ => Path::new("."),
  };
  let dir = fs::canonicalize(parent)
    .with_context(|| format!("cache directory {} does not exist", parent.display()))?;
  if dir.starts_with(&root) {
    bail!("cache file {} must be outside the repository", file.display());
  }
  Ok(())
}

fn print_report(report: &Report, json: bool) -> anyhow::Result<()> {
  if json {
    println!("{}", serde_json::to_string_pretty(report)?);
    return Ok(());
  }
  for v in &report.violations {
    println!("{:<7} {v}", v.severity.to_string());
  }
  println!(
    "{}: {} errors, {} warnings",
    report.status,
    report.errors().count(),
    report.warnings().count()
  );
  Ok(())
}

// ─── Import ───────────────────────────────────────────────────────────────────

fn print_import(report: &ImportReport) {
  if report.dry_run {
    println!("dry run: nothing was written");
  }
  for kind in EntityKind::ALL {
    let entity = report.entity(kind);
    let s = &entity.summary;
    println!(
      "{kind}: {} added, {} duplicates, {} rejected, {} errors ({} -> {})",
      s.added, s.duplicates, s.rejected, s.errors, s.initial, s.final_count
    );
    for (year, y) in &entity.years {
      println!("  {year}: {} added, {} duplicates", y.added, y.duplicates);
    }
  }
  println!(
    "attachments: {} stored, {} deduplicated",
    report.attachments.stored, report.attachments.deduplicated
  );
  for file in &report.files {
    if let Some(err) = &file.error {
      eprintln!("{}: {err}", file.path.display());
    } else if file.skipped {
      eprintln!("{}: skipped", file.path.display());
    }
  }
}

#[cfg(test)]
mod tests {
  use clap::CommandFactory;

  use super::*;

  #[test]
  fn cli_definition_is_consistent() { Cli::command().debug_assert(); }

  #[test]
  fn import_filter_parses_entity_kind() {
    let cli = Cli::parse_from(["callvault", "import", "--filter", "sms", "a.xml"]);
    match cli.command {
      Command::Import { filter, paths, .. } => {
        assert_eq!(filter, Some(EntityKind::Sms));
        assert_eq!(paths, vec![PathBuf::from("a.xml")]);
      }
      other => panic!("unexpected command {other:?}"),
    }
  }

  #[test]
  fn cache_inside_repository_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path().join("repo");
    fs::create_dir_all(&repo).unwrap();
    assert!(ensure_outside(&repo, &repo.join("cache.json")).is_err());
    assert!(ensure_outside(&repo, &dir.path().join("cache.json")).is_ok());
  }
}
