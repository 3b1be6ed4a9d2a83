//! Layered settings: `callvault.toml`, then `CALLVAULT_*` environment
//! variables. Command-line flags are applied on top by the caller.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use callvault_validate::DEFAULT_MAX_CONCURRENCY;
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "callvault.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CliConfig {
  pub repo_root: Option<PathBuf>,
  pub validate:  ValidateConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ValidateConfig {
  pub parallel:          bool,
  pub early_termination: bool,
  pub max_concurrency:   usize,
  pub timeout_secs:      Option<u64>,
}

impl Default for ValidateConfig {
  fn default() -> Self {
    Self {
      parallel:          false,
      early_termination: false,
      max_concurrency:   DEFAULT_MAX_CONCURRENCY,
      timeout_secs:      None,
    }
  }
}

impl CliConfig {
  /// Load `path`, or `callvault.toml` in the working directory when none is
  /// given. Only an explicitly named file is required to exist.
  ///
  /// Nested keys use a double underscore in the environment, e.g.
  /// `CALLVAULT_VALIDATE__MAX_CONCURRENCY=8`.
  pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
    let file = match path {
      Some(p) => config::File::from(p).required(true),
      None => config::File::from(Path::new(DEFAULT_CONFIG_FILE)).required(false),
    };
    config::Config::builder()
      .add_source(file)
      .add_source(
        config::Environment::with_prefix("CALLVAULT")
          .prefix_separator("_")
          .separator("__")
          .try_parsing(true),
      )
      .build()
      .context("failed to read config")?
      .try_deserialize()
      .context("failed to deserialise CliConfig")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn file_values_override_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("callvault.toml");
    std::fs::write(
      &path,
      "repo_root = \"/srv/vault\"\n[validate]\nparallel = true\nmax_concurrency = 2\n",
    )
    .unwrap();

    let cfg = CliConfig::load(Some(&path)).unwrap();
    assert_eq!(cfg.repo_root.as_deref(), Some(Path::new("/srv/vault")));
    assert!(cfg.validate.parallel);
    assert!(!cfg.validate.early_termination);
    assert_eq!(cfg.validate.max_concurrency, 2);
    assert_eq!(cfg.validate.timeout_secs, None);
  }

  #[test]
  fn named_config_must_exist() {
    let dir = tempfile::tempdir().unwrap();
    assert!(CliConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
  }
}
