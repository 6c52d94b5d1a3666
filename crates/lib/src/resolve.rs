//! Path resolution.
//!
//! Gives every abstract entry in an assembled graph a concrete path before anything runs.
//! Consumers are asked first: a placement builder (e.g. [`Install`](crate::builders::Install))
//! can have its source materialized directly at the final location. Every registered consumer
//! is asked, in the graph or not, so an entry lands at the same path whichever roots are
//! built. Entries nobody places land at `<build_root>/<category>/<relative_path>`.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::{debug, trace};

use crate::builder::BuilderId;
use crate::entry::{Entry, EntryId};
use crate::env::Environment;
use crate::error::{ConfigError, EngineError, ResolveError};
use crate::graph::BuildGraph;

/// Resolve every abstract entry produced or consumed within `graph`.
///
/// Running it again on an already resolved graph is a no-op.
///
/// # Errors
///
/// - `ConflictingClaim` if two builders claim the same entry or path
/// - `AmbiguousPlacement` if consumers propose different locations for one entry
/// - `UnreachableEntry` if a builder consumes an abstract entry no builder in the graph emits
pub fn resolve_paths(env: &mut Environment, graph: &BuildGraph) -> Result<(), EngineError> {
  check_claims(env, graph)?;

  let consumers = consumers(env)?;

  // Consumers before producers
  for &id in graph.topological_order().iter().rev() {
    let targets = env.targets_of(id)?.all();
    for target in targets {
      let entry = env.entry(target)?.clone();
      if !entry.is_abstract() {
        continue;
      }

      let claimants = consumers.get(&target).map(Vec::as_slice).unwrap_or_default();
      match propose(env, claimants, &entry)? {
        Some(path) => {
          debug!(entry = %entry, path = ?path, "placed target");
          env.resolve_entry(target, &path)?;
        }
        None => {
          let path = default_path(env, &entry);
          trace!(entry = %entry, path = ?path, "resolved target to default location");
          env.resolve_entry(target, &path)?;
        }
      }
    }
  }

  for &id in graph.topological_order() {
    for &source in env.sources_of(id)? {
      let entry = env.entry(source)?;
      if entry.is_abstract() {
        return Err(
          ConfigError::UnreachableEntry {
            entry: entry.to_string(),
            consumer: env.builder_name(id),
          }
          .into(),
        );
      }
    }
  }

  Ok(())
}

/// Every registered builder consuming each entry.
fn consumers(env: &Environment) -> Result<HashMap<EntryId, Vec<BuilderId>>, ConfigError> {
  let mut consumers: HashMap<EntryId, Vec<BuilderId>> = HashMap::new();
  for index in 0..env.builder_count() {
    let id = BuilderId(index);
    for &source in env.sources_of(id)? {
      consumers.entry(source).or_default().push(id);
    }
  }
  Ok(consumers)
}

/// Each declared target must belong to its builder, unless the builder adopts one of its
/// own sources.
fn check_claims(env: &mut Environment, graph: &BuildGraph) -> Result<(), EngineError> {
  for &id in graph.topological_order() {
    let targets = env.targets_of(id)?.all();
    let sources = env.sources_of(id)?;
    for target in targets {
      if env.producer_of(target) != Some(id) && !sources.contains(&target) {
        return Err(
          ResolveError::ConflictingClaim {
            path: env.entry(target)?.to_string(),
            first: env.claimant(target),
            second: env.builder_name(id),
          }
          .into(),
        );
      }
    }
  }
  Ok(())
}

/// The location consumers agree on, if any of them proposes one.
fn propose(env: &Environment, consumers: &[BuilderId], entry: &Entry) -> Result<Option<PathBuf>, EngineError> {
  let mut proposals: Vec<(PathBuf, Vec<String>)> = Vec::new();

  for &consumer in consumers {
    let slot = env.slot(consumer)?;
    let Some(path) = slot.builder.placement(entry) else {
      continue;
    };
    let path = if path.is_relative() {
      env.build_root().join(path)
    } else {
      path
    };

    match proposals.iter_mut().find(|(existing, _)| *existing == path) {
      Some((_, names)) => names.push(slot.builder.name().to_string()),
      None => proposals.push((path, vec![slot.builder.name().to_string()])),
    }
  }

  match proposals.len() {
    0 => Ok(None),
    1 => Ok(proposals.pop().map(|(path, _)| path)),
    _ => Err(
      ResolveError::AmbiguousPlacement {
        entry: entry.to_string(),
        builders: proposals.into_iter().flat_map(|(_, names)| names).collect(),
      }
      .into(),
    ),
  }
}

fn default_path(env: &Environment, entry: &Entry) -> PathBuf {
  let mut path = env.build_root().to_path_buf();
  if let Some(category) = entry.category()
    && !category.is_empty()
  {
    path.push(category);
  }
  if let Some(relative) = entry.relative_path() {
    path.push(relative);
  }
  path
}
