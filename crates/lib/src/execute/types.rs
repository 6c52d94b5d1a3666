//! Types for build execution.

use std::collections::HashMap;

use crate::builder::{BuildError, BuilderId};
use crate::entry::EntryId;

/// What the caller asks to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Root {
  Builder(BuilderId),
  /// Builds the producer of the entry.
  Entry(EntryId),
  Alias(String),
}

impl From<BuilderId> for Root {
  fn from(id: BuilderId) -> Self {
    Root::Builder(id)
  }
}

impl From<EntryId> for Root {
  fn from(id: EntryId) -> Self {
    Root::Entry(id)
  }
}

impl From<&str> for Root {
  fn from(name: &str) -> Self {
    Root::Alias(name.to_string())
  }
}

impl From<String> for Root {
  fn from(name: String) -> Self {
    Root::Alias(name)
  }
}

/// Lifecycle of a builder within one invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BuilderState {
  #[default]
  Unknown,
  UpToDate,
  Stale,
  Running,
  Succeeded,
  Failed,
}

/// A builder whose `execute` returned an error.
#[derive(Debug)]
pub struct BuildFailure {
  pub builder: BuilderId,
  pub name: String,
  pub error: BuildError,
}

/// A builder that was not executed because a dependency failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedBuilder {
  pub builder: BuilderId,
  pub name: String,
  /// The builder whose failure caused the skip.
  pub root_cause: BuilderId,
  pub root_cause_name: String,
}

/// Result of one build invocation.
///
/// Builder failures never abort the invocation; they are reported here together with every
/// dependent that was skipped because of them.
#[derive(Debug, Default)]
pub struct BuildReport {
  /// Builders that ran and succeeded, in completion order.
  pub executed: Vec<BuilderId>,

  pub up_to_date: Vec<BuilderId>,

  pub failed: Vec<BuildFailure>,

  pub skipped: Vec<SkippedBuilder>,

  /// Builders never dispatched because the build was cancelled.
  pub cancelled: Vec<BuilderId>,

  pub states: HashMap<BuilderId, BuilderState>,
}

impl BuildReport {
  /// Returns true if every builder is up to date or ran successfully.
  pub fn is_success(&self) -> bool {
    self.failed.is_empty() && self.skipped.is_empty() && self.cancelled.is_empty()
  }

  pub fn state(&self, id: BuilderId) -> BuilderState {
    self.states.get(&id).copied().unwrap_or_default()
  }

  pub fn failure(&self, id: BuilderId) -> Option<&BuildFailure> {
    self.failed.iter().find(|f| f.builder == id)
  }

  pub fn skipped(&self, id: BuilderId) -> Option<&SkippedBuilder> {
    self.skipped.iter().find(|s| s.builder == id)
  }

  /// Returns the total number of builders in the graph.
  pub fn total(&self) -> usize {
    self.executed.len() + self.up_to_date.len() + self.failed.len() + self.skipped.len() + self.cancelled.len()
  }
}
