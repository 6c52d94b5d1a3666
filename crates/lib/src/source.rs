//! Source specifications accepted by [`Environment::resolve_source_spec`].
//!
//! [`Environment::resolve_source_spec`]: crate::env::Environment::resolve_source_spec

use std::path::{Path, PathBuf};

use crate::builder::BuilderId;
use crate::entry::EntryId;

/// A heterogeneous source specification.
///
/// Every shape a builder may be handed as input, normalized into a flat list of entries by
/// the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Source {
  /// A file path, relative paths are anchored at the source root.
  Path(PathBuf),
  /// A directory; its content is tracked as a whole.
  Dir(PathBuf),
  /// An entry already known to the environment.
  Entry(EntryId),
  /// Another builder, standing for its primary targets.
  Builder(BuilderId),
  /// Nested sequence, flattened in order.
  Many(Vec<Source>),
}

impl Source {
  pub fn dir(path: impl Into<PathBuf>) -> Self {
    Source::Dir(path.into())
  }
}

impl From<&str> for Source {
  fn from(path: &str) -> Self {
    Source::Path(PathBuf::from(path))
  }
}

impl From<String> for Source {
  fn from(path: String) -> Self {
    Source::Path(PathBuf::from(path))
  }
}

impl From<&Path> for Source {
  fn from(path: &Path) -> Self {
    Source::Path(path.to_path_buf())
  }
}

impl From<PathBuf> for Source {
  fn from(path: PathBuf) -> Self {
    Source::Path(path)
  }
}

impl From<EntryId> for Source {
  fn from(entry: EntryId) -> Self {
    Source::Entry(entry)
  }
}

impl From<BuilderId> for Source {
  fn from(builder: BuilderId) -> Self {
    Source::Builder(builder)
  }
}

impl<T: Into<Source>> From<Vec<T>> for Source {
  fn from(items: Vec<T>) -> Self {
    Source::Many(items.into_iter().map(Into::into).collect())
  }
}
