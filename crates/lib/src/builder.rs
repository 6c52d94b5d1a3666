//! The builder contract.
//!
//! A builder is a unit of work. The engine only ever talks to it through [`Builder`]:
//! declare what you output, then produce it once every path is known.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::entry::{Entry, EntryError, EntryId};
use crate::env::Environment;
use crate::error::ConfigError;
use crate::util::hash::HashError;

/// Key of a builder in the environment registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BuilderId(pub(crate) usize);

impl fmt::Display for BuilderId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "builder#{}", self.0)
  }
}

/// What a builder declares it outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Targets {
  File(EntryId),
  Files(Vec<EntryId>),
  /// A directory the builder populates with files it cannot name in advance.
  Dir(EntryId),
  /// A primary output plus incidental side outputs.
  ///
  /// Consumers that depend on the builder only see `primary`; side outputs are still
  /// placed, cleaned and fingerprinted, and can be consumed explicitly through
  /// [`Environment::side_targets`].
  WithSide { primary: EntryId, side: Vec<EntryId> },
}

impl Targets {
  /// The entries a consumer receives when it uses the builder as a source.
  pub fn primary(&self) -> Vec<EntryId> {
    match self {
      Targets::File(id) | Targets::Dir(id) | Targets::WithSide { primary: id, .. } => vec![*id],
      Targets::Files(ids) => ids.clone(),
    }
  }

  pub fn side(&self) -> &[EntryId] {
    match self {
      Targets::WithSide { side, .. } => side,
      _ => &[],
    }
  }

  /// Every declared entry, primary first.
  pub fn all(&self) -> Vec<EntryId> {
    let mut all = self.primary();
    all.extend_from_slice(self.side());
    all
  }
}

/// Errors a builder reports from [`Builder::execute`].
#[derive(Debug, Error)]
pub enum BuildError {
  /// The build step itself failed (compile error, bad input, ...).
  #[error("{0}")]
  Failed(String),

  #[error("command failed with exit code {code:?}: {cmd}")]
  CmdFailed { cmd: String, code: Option<i32> },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error(transparent)]
  Entry(#[from] EntryError),

  /// The builder returned successfully but a declared target is not on disk.
  #[error("declared target {0:?} was not created")]
  MissingTarget(PathBuf),

  #[error("failed to fingerprint output: {0}")]
  Fingerprint(#[from] HashError),

  #[error("builder panicked: {0}")]
  Panicked(String),
}

/// A unit of work.
///
/// Implementations receive their inputs as [`EntryId`]s through
/// [`Declare::depends_files`](crate::env::Declare::depends_files) at construction and must
/// never read the filesystem for inputs on their own.
pub trait Builder: Send + Sync + 'static {
  /// Human readable identity, used in logs, errors and signature keys.
  fn name(&self) -> &str;

  /// Declare the outputs. Must not touch the filesystem.
  ///
  /// Called at most once per builder; the result is memoized by the environment.
  fn declare_targets(&self, env: &mut Environment) -> Result<Targets, ConfigError>;

  /// Produce the declared targets. Every path in `ctx` is concrete by now.
  fn execute(&self, ctx: &BuildContext) -> Result<(), BuildError>;

  /// Where `entry`, one of this builder's abstract sources, should be materialized.
  ///
  /// Placement builders (install/copy-to-final-location steps) return the final path so
  /// the producer writes there directly instead of under the build root.
  fn placement(&self, entry: &Entry) -> Option<PathBuf> {
    let _ = entry;
    None
  }
}

/// Read-only snapshot of the entry registry taken after path resolution.
#[derive(Debug, Clone, Default)]
pub struct PathTable {
  entries: Vec<Entry>,
}

impl PathTable {
  pub(crate) fn new(entries: Vec<Entry>) -> Self {
    Self { entries }
  }

  pub fn entry(&self, id: EntryId) -> Result<&Entry, EntryError> {
    self.entries.get(id.0).ok_or(EntryError::Unknown(id))
  }

  pub fn path(&self, id: EntryId) -> Result<&Path, EntryError> {
    self.entry(id)?.resolved_path()
  }
}

/// Everything a builder can see while executing.
#[derive(Debug, Clone)]
pub struct BuildContext {
  builder: BuilderId,
  paths: Arc<PathTable>,
  sources: Vec<EntryId>,
  targets: Vec<EntryId>,
}

impl BuildContext {
  pub(crate) fn new(builder: BuilderId, paths: Arc<PathTable>, sources: Vec<EntryId>, targets: Vec<EntryId>) -> Self {
    Self {
      builder,
      paths,
      sources,
      targets,
    }
  }

  pub fn builder(&self) -> BuilderId {
    self.builder
  }

  /// Resolved path of any entry.
  pub fn path(&self, entry: EntryId) -> Result<&Path, EntryError> {
    self.paths.path(entry)
  }

  /// Every source recorded for this builder, in declaration order.
  pub fn sources(&self) -> &[EntryId] {
    &self.sources
  }

  /// Every declared target, primary first.
  pub fn targets(&self) -> &[EntryId] {
    &self.targets
  }

  pub fn source_paths(&self) -> Result<Vec<&Path>, EntryError> {
    self.sources.iter().map(|id| self.path(*id)).collect()
  }

  pub fn target_paths(&self) -> Result<Vec<&Path>, EntryError> {
    self.targets.iter().map(|id| self.path(*id)).collect()
  }

  /// Path of the first declared target.
  pub fn target(&self) -> Result<&Path, BuildError> {
    let first = self
      .targets
      .first()
      .ok_or_else(|| BuildError::Failed(format!("{} declared no targets", self.builder)))?;
    Ok(self.path(*first)?)
  }
}
