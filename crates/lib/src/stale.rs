//! Staleness detection.
//!
//! A builder is up to date when its recorded signature still matches the filesystem: same
//! set of source paths, same source fingerprints, every target present with its recorded
//! fingerprint, and no dependency stale. Anything else schedules it for execution.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use tracing::{debug, trace};

use crate::builder::{BuilderId, PathTable};
use crate::entry::EntryId;
use crate::env::Environment;
use crate::error::EngineError;
use crate::graph::BuildGraph;
use crate::signature::{BuilderSignature, Fingerprinter, SignatureRecord, SignatureStore};
use crate::util::hash::{ContentHash, HashError};

/// Outcome of checking one builder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
  UpToDate,
  Stale(StaleReason),
}

impl Freshness {
  pub fn is_stale(&self) -> bool {
    matches!(self, Freshness::Stale(_))
  }
}

/// Why a builder must run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
  NeverBuilt,
  /// Sources were added or removed since the last build.
  SourcesChanged,
  SourceChanged(PathBuf),
  TargetMissing(PathBuf),
  TargetChanged(PathBuf),
  DependencyStale(BuilderId),
}

impl fmt::Display for StaleReason {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      StaleReason::NeverBuilt => write!(f, "never built"),
      StaleReason::SourcesChanged => write!(f, "set of sources changed"),
      StaleReason::SourceChanged(path) => write!(f, "source {} changed", path.display()),
      StaleReason::TargetMissing(path) => write!(f, "target {} is missing", path.display()),
      StaleReason::TargetChanged(path) => write!(f, "target {} was modified", path.display()),
      StaleReason::DependencyStale(id) => write!(f, "dependency {id} is stale"),
    }
  }
}

/// Stable key of a builder in the signature store: its name, qualified with the path of its
/// first target, or with its id when it declares no targets.
pub fn signature_key(env: &Environment, id: BuilderId) -> String {
  let name = env.builder_name(id);
  let first_target = env
    .declared_targets(id)
    .and_then(|targets| targets.all().first().copied())
    .and_then(|entry| env.resolved_path(entry).ok());

  match first_target {
    Some(path) => format!("{name}@{}", path.display()),
    None => format!("{name}@{id}"),
  }
}

/// Fingerprints keyed by path, computed at most once per check.
#[derive(Debug)]
struct Fingerprints<'a> {
  fingerprinter: &'a Fingerprinter,
  cache: HashMap<PathBuf, Option<ContentHash>>,
}

impl Fingerprints<'_> {
  fn get(&mut self, path: &Path) -> Result<Option<ContentHash>, HashError> {
    if let Some(hash) = self.cache.get(path) {
      return Ok(hash.clone());
    }
    let hash = self.fingerprinter.fingerprint(path)?;
    self.cache.insert(path.to_path_buf(), hash.clone());
    Ok(hash)
  }
}

/// Check every builder of `graph`, in topological order.
pub fn plan(
  env: &Environment,
  graph: &BuildGraph,
  store: &SignatureStore,
  fingerprinter: &Fingerprinter,
) -> Result<HashMap<BuilderId, Freshness>, EngineError> {
  let mut fingerprints = Fingerprints {
    fingerprinter,
    cache: HashMap::new(),
  };
  let mut states: HashMap<BuilderId, Freshness> = HashMap::new();

  for &id in graph.topological_order() {
    let stale_dependency = graph
      .dependencies(id)
      .into_iter()
      .find(|dep| states.get(dep).is_some_and(Freshness::is_stale));

    let freshness = match stale_dependency {
      Some(dep) => Freshness::Stale(StaleReason::DependencyStale(dep)),
      None => check(env, id, store, &mut fingerprints)?,
    };

    match &freshness {
      Freshness::UpToDate => trace!(builder = %env.builder_name(id), "up to date"),
      Freshness::Stale(reason) => debug!(builder = %env.builder_name(id), reason = %reason, "stale"),
    }
    states.insert(id, freshness);
  }

  Ok(states)
}

fn check(
  env: &Environment,
  id: BuilderId,
  store: &SignatureStore,
  fingerprints: &mut Fingerprints<'_>,
) -> Result<Freshness, EngineError> {
  let Some(signature) = store.get(&signature_key(env, id)) else {
    return Ok(Freshness::Stale(StaleReason::NeverBuilt));
  };

  let mut sources = Vec::new();
  for &source in env.sources_of(id)? {
    sources.push(env.resolved_path(source)?.to_path_buf());
  }

  let current: HashSet<String> = sources.iter().map(|p| p.display().to_string()).collect();
  let recorded: HashSet<String> = signature.sources.iter().map(|r| r.path.clone()).collect();
  if current != recorded {
    return Ok(Freshness::Stale(StaleReason::SourcesChanged));
  }

  for path in sources {
    let recorded = signature.source(&path.display().to_string());
    let current = fingerprints.get(&path)?;
    if current.is_none() || recorded.map(|r| &r.fingerprint) != current.as_ref() {
      return Ok(Freshness::Stale(StaleReason::SourceChanged(path)));
    }
  }

  let targets = env.declared_targets(id).map(|t| t.all()).unwrap_or_default();
  for target in targets {
    let path = env.resolved_path(target)?.to_path_buf();
    let Some(current) = fingerprints.get(&path)? else {
      return Ok(Freshness::Stale(StaleReason::TargetMissing(path)));
    };
    let recorded = signature.target(&path.display().to_string());
    if recorded.map(|r| &r.fingerprint) != Some(&current) {
      return Ok(Freshness::Stale(StaleReason::TargetChanged(path)));
    }
  }

  Ok(Freshness::UpToDate)
}

/// Fingerprint the sources and targets of a builder that just ran.
///
/// Paths that do not exist are left out.
pub(crate) fn observe(
  paths: &PathTable,
  sources: &[EntryId],
  targets: &[EntryId],
  fingerprinter: &Fingerprinter,
) -> Result<BuilderSignature, crate::builder::BuildError> {
  let mut signature = BuilderSignature::default();

  for (ids, records) in [(sources, &mut signature.sources), (targets, &mut signature.targets)] {
    for &id in ids {
      let path = paths.path(id)?;
      if let Some(hash) = fingerprinter.fingerprint(path)? {
        records.push(SignatureRecord::new(path, hash));
      }
    }
  }

  Ok(signature)
}
