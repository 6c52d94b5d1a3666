//! Copy build outputs into a destination directory.
//!
//! When a source is still abstract, `Install` places it: the producing builder writes
//! straight into the destination and installing is a no-op. Concrete sources are copied.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};
use walkdir::WalkDir;

use crate::builder::{BuildContext, BuildError, Builder, BuilderId, Targets};
use crate::entry::{Entry, EntryError, EntryId, EntryKind};
use crate::env::Environment;
use crate::error::ConfigError;
use crate::source::Source;

#[derive(Debug)]
pub struct Install {
  name: String,
  dest: PathBuf,
  sources: Vec<EntryId>,
}

impl Install {
  /// Register an install of `sources` into the directory `dest`.
  ///
  /// A relative `dest` is anchored at the source root.
  pub fn new(env: &mut Environment, dest: impl AsRef<Path>, sources: impl Into<Source>) -> Result<BuilderId, ConfigError> {
    let dest = env.absolute_path(dest.as_ref())?;
    let sources = sources.into();
    env.add_builder(|decl| {
      let sources = decl.depends_files(sources)?;
      Ok(Install {
        name: format!("install {}", dest.display()),
        dest,
        sources,
      })
    })
  }

  pub fn dest(&self) -> &Path {
    &self.dest
  }

  fn destination_of(&self, path: &Path) -> Result<PathBuf, EntryError> {
    let name = path.file_name().ok_or_else(|| EntryError::InvalidPath {
      path: path.to_path_buf(),
      reason: "has no file name to install under".to_string(),
    })?;
    Ok(self.dest.join(name))
  }
}

impl Builder for Install {
  fn name(&self) -> &str {
    &self.name
  }

  fn declare_targets(&self, env: &mut Environment) -> Result<Targets, ConfigError> {
    let mut targets = Vec::with_capacity(self.sources.len());

    for &source in &self.sources {
      let entry = env.entry(source)?;
      if entry.is_abstract() {
        // Adopted: placed at the destination, so the source is its own target.
        targets.push(source);
        continue;
      }

      let kind = entry.kind();
      let dest = self.destination_of(entry.resolved_path()?)?;
      let target = match kind {
        EntryKind::File => env.intern_path(&dest)?,
        EntryKind::Directory => env.intern_dir(&dest)?,
      };
      targets.push(target);
    }

    Ok(match targets.as_slice() {
      [one] => Targets::File(*one),
      _ => Targets::Files(targets),
    })
  }

  fn execute(&self, ctx: &BuildContext) -> Result<(), BuildError> {
    for (&source, &target) in ctx.sources().iter().zip(ctx.targets()) {
      let from = ctx.path(source)?;
      let to = ctx.path(target)?;

      if from == to {
        trace!(path = ?to, "already in place");
        continue;
      }

      debug!(from = ?from, to = ?to, "installing");
      if from.is_dir() {
        copy_dir(from, to)?;
      } else {
        if let Some(parent) = to.parent() {
          fs::create_dir_all(parent)?;
        }
        fs::copy(from, to)?;
      }
    }
    Ok(())
  }

  fn placement(&self, entry: &Entry) -> Option<PathBuf> {
    if !self.sources.contains(&entry.id()) {
      return None;
    }
    let relative = entry.relative_path()?;
    Some(match relative.file_name() {
      Some(name) => self.dest.join(name),
      None => self.dest.clone(),
    })
  }
}

fn copy_dir(from: &Path, to: &Path) -> Result<(), BuildError> {
  for entry in WalkDir::new(from).sort_by_file_name() {
    let entry = entry.map_err(|e| BuildError::Failed(format!("failed to walk {}: {e}", from.display())))?;
    let relative = entry.path().strip_prefix(from).unwrap_or(entry.path());
    let dest = to.join(relative);

    if entry.file_type().is_dir() {
      fs::create_dir_all(&dest)?;
    } else {
      fs::copy(entry.path(), &dest)?;
    }
  }
  Ok(())
}
