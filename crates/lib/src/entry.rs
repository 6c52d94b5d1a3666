//! Files and directories consumed and produced by builders.
//!
//! An entry is either *abstract* (a relative path plus an output category, waiting for a
//! location) or *concrete* (backed by a filesystem path that may or may not exist yet).
//! Entries live in the [`Environment`](crate::env::Environment) registry and are addressed
//! by [`EntryId`]. The only mutation an entry ever sees is the single abstract -> concrete
//! transition performed by path resolution.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

use crate::builder::BuilderId;

/// Key of an entry in the environment registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub(crate) usize);

impl fmt::Display for EntryId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "entry#{}", self.0)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
  File,
  Directory,
}

/// Where an entry lives, or will live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
  /// Not placed yet. Materializes under `<build root>/<category>/<relative_path>`
  /// unless a placement builder claims it.
  Abstract { relative_path: PathBuf, category: String },
  /// Backed by a filesystem path (absolute, normalized).
  Concrete(PathBuf),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EntryError {
  #[error("invalid path {path:?}: {reason}")]
  InvalidPath { path: PathBuf, reason: String },

  #[error("{entry} ({relative_path:?} in {category:?}) has no concrete path yet")]
  Unresolved {
    entry: EntryId,
    relative_path: PathBuf,
    category: String,
  },

  #[error("{entry} is already concrete at {current:?}, cannot move it to {requested:?}")]
  AlreadyConcrete {
    entry: EntryId,
    current: PathBuf,
    requested: PathBuf,
  },

  #[error("{path:?} is registered as a {existing:?}, not a {requested:?}")]
  KindMismatch {
    path: PathBuf,
    existing: EntryKind,
    requested: EntryKind,
  },

  #[error("unknown entry: {0}")]
  Unknown(EntryId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
  id: EntryId,
  kind: EntryKind,
  location: Location,
  producer: Option<BuilderId>,
  /// Relative path the entry had while abstract.
  origin: Option<PathBuf>,
}

impl Entry {
  pub(crate) fn new_abstract(id: EntryId, kind: EntryKind, relative_path: PathBuf, category: String) -> Self {
    Self {
      id,
      kind,
      location: Location::Abstract { relative_path, category },
      producer: None,
      origin: None,
    }
  }

  /// `path` must already be absolute and normalized (see [`normalize`]).
  pub(crate) fn new_concrete(id: EntryId, kind: EntryKind, path: PathBuf) -> Self {
    Self {
      id,
      kind,
      location: Location::Concrete(path),
      producer: None,
      origin: None,
    }
  }

  pub fn id(&self) -> EntryId {
    self.id
  }

  pub fn kind(&self) -> EntryKind {
    self.kind
  }

  pub fn location(&self) -> &Location {
    &self.location
  }

  /// The builder that emits this entry, if any.
  pub fn producer(&self) -> Option<BuilderId> {
    self.producer
  }

  pub fn is_abstract(&self) -> bool {
    matches!(self.location, Location::Abstract { .. })
  }

  /// Relative path of an abstract entry. `None` once concrete.
  pub fn relative_path(&self) -> Option<&Path> {
    match &self.location {
      Location::Abstract { relative_path, .. } => Some(relative_path),
      Location::Concrete(_) => None,
    }
  }

  /// Output category of an abstract entry. `None` once concrete.
  pub fn category(&self) -> Option<&str> {
    match &self.location {
      Location::Abstract { category, .. } => Some(category),
      Location::Concrete(_) => None,
    }
  }

  /// The concrete path of this entry.
  ///
  /// Fails with [`EntryError::Unresolved`] while the entry is abstract, which is what keeps
  /// builders from reading a location before path resolution has run.
  pub fn resolved_path(&self) -> Result<&Path, EntryError> {
    match &self.location {
      Location::Concrete(path) => Ok(path),
      Location::Abstract { relative_path, category } => Err(EntryError::Unresolved {
        entry: self.id,
        relative_path: relative_path.clone(),
        category: category.clone(),
      }),
    }
  }

  pub(crate) fn set_producer(&mut self, producer: BuilderId) {
    self.producer = Some(producer);
  }

  /// Abstract -> concrete. Resolving to the path the entry already has is a no-op.
  pub(crate) fn resolve(&mut self, path: PathBuf) -> Result<(), EntryError> {
    match &self.location {
      Location::Concrete(current) if *current == path => Ok(()),
      Location::Concrete(current) => Err(EntryError::AlreadyConcrete {
        entry: self.id,
        current: current.clone(),
        requested: path,
      }),
      Location::Abstract { relative_path, .. } => {
        self.origin = Some(relative_path.clone());
        self.location = Location::Concrete(path);
        Ok(())
      }
    }
  }
}

impl fmt::Display for Entry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &self.location {
      Location::Concrete(path) => write!(f, "{}", path.display()),
      Location::Abstract { relative_path, category } if category.is_empty() => {
        write!(f, "<abstract>/{}", relative_path.display())
      }
      Location::Abstract { relative_path, category } => {
        write!(f, "<abstract>/{}/{}", category, relative_path.display())
      }
    }
  }
}

/// Lexically normalize a path, removing `.` and resolving `..`.
///
/// Fails on empty input and on paths whose `..` components climb above the filesystem root
/// (or above the start of a relative path).
pub fn normalize(path: &Path) -> Result<PathBuf, EntryError> {
  if path.as_os_str().is_empty() {
    return Err(EntryError::InvalidPath {
      path: path.to_path_buf(),
      reason: "path is empty".to_string(),
    });
  }

  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        let at_root = matches!(
          out.components().next_back(),
          None | Some(Component::RootDir) | Some(Component::Prefix(_))
        );
        if at_root || !out.pop() {
          return Err(EntryError::InvalidPath {
            path: path.to_path_buf(),
            reason: "path escapes the filesystem root".to_string(),
          });
        }
      }
      other => out.push(other),
    }
  }

  Ok(out)
}

/// Compute the relative path of an entry derived from `entry`.
///
/// Abstract entries, and entries resolved from an abstract one, keep their relative path.
/// Other concrete entries are re-rooted: under the build root the leading category directory
/// is dropped, otherwise the path is taken relative to the source root. The build root is
/// checked first since it may be nested in the source root.
pub(crate) fn derived_relative_path(
  entry: &Entry,
  source_root: &Path,
  build_root: &Path,
  new_extension: Option<&str>,
) -> Result<PathBuf, EntryError> {
  let mut relative = match (&entry.location, &entry.origin) {
    (Location::Abstract { relative_path, .. }, _) | (Location::Concrete(_), Some(relative_path)) => {
      relative_path.clone()
    }
    (Location::Concrete(path), None) => {
      if let Ok(rest) = path.strip_prefix(build_root) {
        let mut components = rest.components();
        components.next();
        let without_category = components.as_path();
        if without_category.as_os_str().is_empty() {
          rest.to_path_buf()
        } else {
          without_category.to_path_buf()
        }
      } else if let Ok(rest) = path.strip_prefix(source_root) {
        rest.to_path_buf()
      } else {
        return Err(EntryError::InvalidPath {
          path: path.clone(),
          reason: format!("not under the source root {}", source_root.display()),
        });
      }
    }
  };

  if relative.file_name().is_none() {
    return Err(EntryError::InvalidPath {
      path: relative,
      reason: "cannot derive from an entry without a file name".to_string(),
    });
  }

  if let Some(ext) = new_extension {
    relative.set_extension(ext.trim_start_matches('.'));
  }

  Ok(relative)
}
