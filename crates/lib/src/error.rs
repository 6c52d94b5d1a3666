//! Error types shared by the assembly, resolution and execution phases.
//!
//! Configuration and resolution errors describe an invalid graph and are always raised
//! before any builder executes. Builder failures are not part of this module: they are
//! localized to the failing builder and reported through
//! [`BuildReport`](crate::execute::BuildReport).

use std::path::PathBuf;

use thiserror::Error;

use crate::builder::BuilderId;
use crate::entry::EntryError;
use crate::signature::StoreError;
use crate::util::hash::HashError;

/// The declared graph is invalid.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
  CyclicDependency { cycle: Vec<String> },

  #[error("unknown source type: {0}")]
  UnknownSource(String),

  #[error("abstract entry {entry} consumed by {consumer} is not produced by any builder in the graph")]
  UnreachableEntry { entry: String, consumer: String },

  #[error("expected a single file but the source resolved to {count} entries")]
  ExpectedSingleFile { count: usize },

  #[error("build root {build_root:?} must not be the source root {source_root:?} or one of its ancestors")]
  InvalidRoots { source_root: PathBuf, build_root: PathBuf },

  #[error("unknown builder: {0}")]
  UnknownBuilder(BuilderId),

  #[error("unknown alias: {0}")]
  UnknownAlias(String),

  #[error("{entry} is not the target of any builder")]
  NotATarget { entry: String },

  #[error("invalid value {value:?} for {name}")]
  InvalidSetting { name: String, value: String },

  #[error(transparent)]
  Entry(#[from] EntryError),
}

/// Abstract entries could not be given a single, unambiguous location.
#[derive(Debug, Error)]
pub enum ResolveError {
  #[error("ambiguous placement for {entry}: proposed by {}", .builders.join(", "))]
  AmbiguousPlacement { entry: String, builders: Vec<String> },

  #[error("{path} is claimed by both {first} and {second}")]
  ConflictingClaim { path: String, first: String, second: String },

  #[error(transparent)]
  Entry(#[from] EntryError),
}

/// Errors that abort a whole build invocation.
#[derive(Debug, Error)]
pub enum EngineError {
  #[error("configuration error: {0}")]
  Config(#[from] ConfigError),

  #[error("resolution error: {0}")]
  Resolve(#[from] ResolveError),

  #[error("signature store error: {0}")]
  Store(#[from] StoreError),

  #[error("fingerprint error: {0}")]
  Fingerprint(#[from] HashError),
}

impl EngineError {
  /// True for errors that describe an invalid graph rather than an I/O problem.
  pub fn is_configuration(&self) -> bool {
    matches!(self, EngineError::Config(_))
  }
}

impl From<EntryError> for EngineError {
  fn from(err: EntryError) -> Self {
    EngineError::Config(ConfigError::Entry(err))
  }
}
