//! Engine configuration.
//!
//! Defaults can be overridden from the environment:
//! - `MINICONS_JOBS`: maximum number of builders running at once
//! - `MINICONS_FINGERPRINT`: `content` (default) or `metadata`
//! - `MINICONS_SIGNATURES`: signature file path, relative paths are under the build root

use std::env;
use std::path::PathBuf;

use crate::env::Environment;
use crate::error::ConfigError;
use crate::signature::FingerprintMode;

pub const JOBS_ENV: &str = "MINICONS_JOBS";
pub const FINGERPRINT_ENV: &str = "MINICONS_FINGERPRINT";
pub const SIGNATURES_ENV: &str = "MINICONS_SIGNATURES";

/// Configuration for one build invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
  /// Maximum number of builders to execute in parallel.
  pub parallelism: usize,

  pub fingerprint: FingerprintMode,

  /// Signature store location. If None, `<build_root>/.minicons-signatures.json`.
  pub signature_file: Option<PathBuf>,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      parallelism: num_cpus(),
      fingerprint: FingerprintMode::default(),
      signature_file: None,
    }
  }
}

impl EngineConfig {
  /// Defaults, overridden by any `MINICONS_*` variables that are set.
  pub fn from_env() -> Result<Self, ConfigError> {
    let mut config = Self::default();

    if let Some(jobs) = var(JOBS_ENV) {
      config.parallelism = match jobs.trim().parse::<usize>() {
        Ok(n) if n > 0 => n,
        _ => return Err(invalid(JOBS_ENV, jobs)),
      };
    }

    if let Some(mode) = var(FINGERPRINT_ENV) {
      config.fingerprint = mode.parse().map_err(|_| invalid(FINGERPRINT_ENV, mode))?;
    }

    if let Some(path) = var(SIGNATURES_ENV) {
      config.signature_file = Some(PathBuf::from(path));
    }

    Ok(config)
  }

  pub fn with_parallelism(mut self, parallelism: usize) -> Self {
    self.parallelism = parallelism.max(1);
    self
  }

  pub fn with_fingerprint(mut self, mode: FingerprintMode) -> Self {
    self.fingerprint = mode;
    self
  }

  pub fn with_signature_file(mut self, path: impl Into<PathBuf>) -> Self {
    self.signature_file = Some(path.into());
    self
  }

  /// Where the signature store of `env` lives under this configuration.
  pub fn signature_path(&self, env: &Environment) -> PathBuf {
    match &self.signature_file {
      Some(path) if path.is_absolute() => path.clone(),
      Some(path) => env.build_root().join(path),
      None => env.signature_path(),
    }
  }
}

/// Non-empty value of an environment variable.
fn var(name: &str) -> Option<String> {
  env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn invalid(name: &str, value: String) -> ConfigError {
  ConfigError::InvalidSetting {
    name: name.to_string(),
    value,
  }
}

/// Get the number of CPUs for default parallelism.
fn num_cpus() -> usize {
  std::thread::available_parallelism().map(|p| p.get()).unwrap_or(4)
}
