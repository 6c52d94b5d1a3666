//! Test utilities for minicons-lib.
//!
//! Scratch project trees and a small configurable builder for unit tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tempfile::TempDir;
use walkdir::WalkDir;

use crate::builder::{BuildContext, BuildError, Builder, Targets};
use crate::env::Environment;
use crate::error::ConfigError;

/// A temporary project: `<tmp>/project` is the source root, `<tmp>/project/build` the build
/// root.
pub struct TestTree {
  _temp: TempDir,
  source_root: PathBuf,
}

impl TestTree {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    let source_root = temp.path().join("project");
    fs::create_dir_all(&source_root).unwrap();
    let source_root = dunce::canonicalize(&source_root).unwrap();
    Self {
      _temp: temp,
      source_root,
    }
  }

  pub fn source_root(&self) -> PathBuf {
    self.source_root.clone()
  }

  pub fn env(&self) -> Environment {
    Environment::new(&self.source_root, "build").unwrap()
  }

  /// Write a file relative to the source root.
  pub fn write(&self, relative_path: &str, content: &str) {
    let path = self.source_root.join(relative_path);
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
  }
}

enum Output {
  Abstract { relative: PathBuf, category: String },
  Concrete(PathBuf),
}

enum Behavior {
  Write,
  Fail,
  Panic,
  NoOutput,
}

/// Concatenates its sources into its target.
pub struct Concat {
  name: String,
  output: Output,
  side: Option<PathBuf>,
  runs: Option<Arc<AtomicUsize>>,
  behavior: Behavior,
}

impl Concat {
  /// Output to a new abstract entry.
  pub fn new(name: impl Into<String>, relative: impl Into<PathBuf>, category: impl Into<String>) -> Self {
    Self::with_output(
      name,
      Output::Abstract {
        relative: relative.into(),
        category: category.into(),
      },
    )
  }

  /// Output to a fixed path.
  pub fn at(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
    Self::with_output(name, Output::Concrete(path.into()))
  }

  fn with_output(name: impl Into<String>, output: Output) -> Self {
    Self {
      name: name.into(),
      output,
      side: None,
      runs: None,
      behavior: Behavior::Write,
    }
  }

  pub fn counted(mut self, runs: &Arc<AtomicUsize>) -> Self {
    self.runs = Some(Arc::clone(runs));
    self
  }

  pub fn with_side(mut self, relative: impl Into<PathBuf>) -> Self {
    self.side = Some(relative.into());
    self
  }

  pub fn failing(mut self) -> Self {
    self.behavior = Behavior::Fail;
    self
  }

  pub fn panicking(mut self) -> Self {
    self.behavior = Behavior::Panic;
    self
  }

  /// Succeeds without writing anything.
  pub fn without_output(mut self) -> Self {
    self.behavior = Behavior::NoOutput;
    self
  }
}

impl Builder for Concat {
  fn name(&self) -> &str {
    &self.name
  }

  fn declare_targets(&self, env: &mut Environment) -> Result<Targets, ConfigError> {
    let (primary, category) = match &self.output {
      Output::Abstract { relative, category } => (env.new_abstract(relative.clone(), category.clone()), category.clone()),
      Output::Concrete(path) => (env.intern_path(path)?, String::new()),
    };

    Ok(match &self.side {
      Some(side) => Targets::WithSide {
        primary,
        side: vec![env.new_abstract(side.clone(), category)],
      },
      None => Targets::File(primary),
    })
  }

  fn execute(&self, ctx: &BuildContext) -> Result<(), BuildError> {
    if let Some(runs) = &self.runs {
      runs.fetch_add(1, Ordering::SeqCst);
    }

    match self.behavior {
      Behavior::Write => {}
      Behavior::Fail => return Err(BuildError::Failed(format!("{} failed", self.name))),
      Behavior::Panic => panic!("{} panicked", self.name),
      Behavior::NoOutput => return Ok(()),
    }

    let mut content = String::new();
    for path in ctx.source_paths()? {
      content.push_str(&read_all(path)?);
    }

    let targets = ctx.target_paths()?;
    if let Some((primary, side)) = targets.split_first() {
      fs::write(primary, &content)?;
      for path in side {
        fs::write(path, format!("side output of {}", self.name))?;
      }
    }
    Ok(())
  }
}

/// File content, or the content of every file beneath a directory in name order.
fn read_all(path: &Path) -> Result<String, BuildError> {
  if !path.is_dir() {
    return Ok(fs::read_to_string(path)?);
  }

  let mut content = String::new();
  for entry in WalkDir::new(path).sort_by_file_name() {
    let entry = entry.map_err(|e| BuildError::Failed(e.to_string()))?;
    if entry.file_type().is_file() {
      content.push_str(&fs::read_to_string(entry.path())?);
    }
  }
  Ok(content)
}

/// Declares no targets and does nothing.
pub struct Noop {
  name: String,
  runs: Option<Arc<AtomicUsize>>,
}

impl Noop {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      runs: None,
    }
  }

  pub fn counted(mut self, runs: &Arc<AtomicUsize>) -> Self {
    self.runs = Some(Arc::clone(runs));
    self
  }
}

impl Builder for Noop {
  fn name(&self) -> &str {
    &self.name
  }

  fn declare_targets(&self, _env: &mut Environment) -> Result<Targets, ConfigError> {
    Ok(Targets::Files(Vec::new()))
  }

  fn execute(&self, _ctx: &BuildContext) -> Result<(), BuildError> {
    if let Some(runs) = &self.runs {
      runs.fetch_add(1, Ordering::SeqCst);
    }
    Ok(())
  }
}
