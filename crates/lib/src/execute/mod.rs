//! Build execution.
//!
//! This module provides the main entry points for building. It handles:
//! - Root selection (builders, entries, aliases, defaults)
//! - Graph assembly and path resolution
//! - Staleness detection against the signature store
//! - Wave-based parallel execution with failure propagation and cancellation

pub mod types;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::builder::{BuildContext, BuildError, Builder, BuilderId, PathTable};
use crate::config::EngineConfig;
use crate::entry::{EntryId, EntryKind};
use crate::env::Environment;
use crate::error::{ConfigError, EngineError};
use crate::graph::BuildGraph;
use crate::resolve::resolve_paths;
use crate::signature::{BuilderSignature, Fingerprinter, SignatureStore};
use crate::stale::{self, Freshness, observe, signature_key};

pub use types::{BuildFailure, BuildReport, BuilderState, Root, SkippedBuilder};

/// Build `roots` and everything they depend on.
///
/// This is the main entry point for building. It:
/// 1. Assembles the graph reachable from the roots (rejecting cycles)
/// 2. Resolves every abstract entry to a path
/// 3. Compares the graph against the signature store
/// 4. Executes stale builders wave by wave, with parallelism within each wave
///
/// # Errors
///
/// Only configuration, resolution and signature store problems are errors. Builder failures
/// are reported in the returned [`BuildReport`].
pub async fn build(env: &mut Environment, roots: &[Root], config: &EngineConfig) -> Result<BuildReport, EngineError> {
  build_with_cancel(env, roots, config, CancellationToken::new()).await
}

/// Build the default aliases, or every registered builder when none are set.
pub async fn build_default(env: &mut Environment, config: &EngineConfig) -> Result<BuildReport, EngineError> {
  let roots: Vec<Root> = if env.defaults().is_empty() {
    (0..env.builder_count()).map(|i| Root::Builder(BuilderId(i))).collect()
  } else {
    env.defaults().iter().cloned().map(Root::Alias).collect()
  };
  build(env, &roots, config).await
}

/// Like [`build`], stopping dispatch once `cancel` fires.
///
/// Builders already running finish and are recorded normally. Builders that never started
/// are listed in [`BuildReport::cancelled`].
pub async fn build_with_cancel(
  env: &mut Environment,
  roots: &[Root],
  config: &EngineConfig,
  cancel: CancellationToken,
) -> Result<BuildReport, EngineError> {
  let roots = select_roots(env, roots)?;
  info!(root_count = roots.len(), "starting build");

  let graph = BuildGraph::assemble(env, &roots)?;
  resolve_paths(env, &graph)?;
  let waves = graph.waves()?;

  info!(builder_count = graph.len(), wave_count = waves.len(), "computed execution waves");

  // Outputs and the signature file never count towards a source directory
  let signature_path = config.signature_path(env);
  let fingerprinter = Fingerprinter::new(config.fingerprint)
    .excluding(env.build_root())
    .excluding(&signature_path);

  let mut store = SignatureStore::load(&signature_path)?;
  let freshness = stale::plan(env, &graph, &store, &fingerprinter)?;
  let mut jobs = plan_jobs(env, &graph, &store)?;
  let paths = Arc::new(env.path_table());

  let mut report = BuildReport::default();
  for (&id, state) in &freshness {
    let state = match state {
      Freshness::UpToDate => BuilderState::UpToDate,
      Freshness::Stale(_) => BuilderState::Stale,
    };
    report.states.insert(id, state);
  }

  // Failed or skipped builder -> the builder that actually failed
  let mut failed: HashMap<BuilderId, BuilderId> = HashMap::new();
  let mut cancelled: HashSet<BuilderId> = HashSet::new();

  // Create semaphore for parallelism control
  let semaphore = Arc::new(Semaphore::new(config.parallelism.max(1)));

  for (wave_idx, wave) in waves.iter().enumerate() {
    let mut ready = Vec::new();

    for &id in wave {
      let deps = graph.dependencies(id);

      if let Some(cause) = deps.iter().find_map(|dep| failed.get(dep)).copied() {
        let name = env.builder_name(id);
        let root_cause_name = env.builder_name(cause);
        warn!(builder = %name, failed_dep = %root_cause_name, "skipping builder due to failed dependency");
        failed.insert(id, cause);
        report.states.insert(id, BuilderState::Failed);
        report.skipped.push(SkippedBuilder {
          builder: id,
          name,
          root_cause: cause,
          root_cause_name,
        });
        continue;
      }

      if deps.iter().any(|dep| cancelled.contains(dep)) || (cancel.is_cancelled() && freshness[&id].is_stale()) {
        cancelled.insert(id);
        report.cancelled.push(id);
        continue;
      }

      if !freshness[&id].is_stale() {
        report.up_to_date.push(id);
        continue;
      }

      if let Some(job) = jobs.remove(&id) {
        // A builder is never fresh while it runs
        if store.remove(&job.key).is_some() {
          store.save()?;
        }
        report.states.insert(id, BuilderState::Running);
        ready.push(job);
      }
    }

    if ready.is_empty() {
      continue;
    }

    debug!(wave = wave_idx, builders = ready.len(), "executing wave");
    let results = execute_wave(ready, &paths, &fingerprinter, &semaphore, &cancel).await;

    for (id, outcome) in results {
      let name = env.builder_name(id);
      match outcome {
        Ok(Outcome::Built(signature)) => {
          info!(builder = %name, "builder succeeded");
          store.upsert(&signature_key(env, id), signature)?;
          report.states.insert(id, BuilderState::Succeeded);
          report.executed.push(id);
        }
        Ok(Outcome::Cancelled) => {
          debug!(builder = %name, "builder cancelled before start");
          report.states.insert(id, BuilderState::Stale);
          cancelled.insert(id);
          report.cancelled.push(id);
        }
        Err(e) => {
          error!(builder = %name, error = %e, "builder failed");
          failed.insert(id, id);
          report.states.insert(id, BuilderState::Failed);
          report.failed.push(BuildFailure {
            builder: id,
            name,
            error: e,
          });
        }
      }
    }
  }

  let live: HashSet<String> = graph.topological_order().iter().map(|&id| signature_key(env, id)).collect();
  store.prune(&live);
  store.save()?;

  info!(
    executed = report.executed.len(),
    up_to_date = report.up_to_date.len(),
    failed = report.failed.len(),
    skipped = report.skipped.len(),
    cancelled = report.cancelled.len(),
    "build complete"
  );

  Ok(report)
}

/// Turn the requested roots into builders.
fn select_roots(env: &mut Environment, roots: &[Root]) -> Result<Vec<BuilderId>, ConfigError> {
  // Entry roots need every producer known
  for index in 0..env.builder_count() {
    env.targets_of(BuilderId(index))?;
  }

  let mut selected = Vec::new();
  for root in roots {
    match root {
      Root::Builder(id) => {
        env.slot(*id)?;
        selected.push(*id);
      }
      Root::Entry(id) => {
        let entry = env.entry(*id)?;
        let producer = entry.producer().ok_or_else(|| ConfigError::NotATarget {
          entry: entry.to_string(),
        })?;
        selected.push(producer);
      }
      Root::Alias(name) => selected.extend_from_slice(env.alias_builders(name)?),
    }
  }
  Ok(selected)
}

/// Everything a blocking task needs to run one builder.
struct Job {
  id: BuilderId,
  name: String,
  key: String,
  builder: Arc<dyn Builder>,
  sources: Vec<EntryId>,
  targets: Vec<EntryId>,
  /// Paths removed before the builder runs.
  cleanup: Vec<PathBuf>,
}

enum Outcome {
  Built(BuilderSignature),
  Cancelled,
}

fn plan_jobs(env: &Environment, graph: &BuildGraph, store: &SignatureStore) -> Result<HashMap<BuilderId, Job>, EngineError> {
  // Paths that must survive any cleanup other than their owner's
  let mut owners: HashMap<PathBuf, BuilderId> = HashMap::new();
  for &id in graph.topological_order() {
    for target in env.declared_targets(id).map(|t| t.all()).unwrap_or_default() {
      if env.producer_of(target) == Some(id) {
        owners.insert(env.resolved_path(target)?.to_path_buf(), id);
      }
    }
  }

  let mut jobs = HashMap::new();
  for &id in graph.topological_order() {
    let key = signature_key(env, id);
    let sources = env.sources_of(id)?.to_vec();
    let targets = env.declared_targets(id).map(|t| t.all()).unwrap_or_default();

    let mut protected: HashSet<PathBuf> = HashSet::new();
    for &source in &sources {
      protected.insert(env.resolved_path(source)?.to_path_buf());
    }

    let mut cleanup: Vec<PathBuf> = Vec::new();
    let recorded = store
      .get(&key)
      .map(|signature| signature.targets.iter().map(|r| PathBuf::from(&r.path)).collect::<Vec<_>>())
      .unwrap_or_default();
    let owned = targets
      .iter()
      .filter(|&&target| env.producer_of(target) == Some(id))
      .map(|&target| env.resolved_path(target).map(Path::to_path_buf))
      .collect::<Result<Vec<_>, _>>()?;

    for path in recorded.into_iter().chain(owned) {
      let foreign = owners.get(&path).is_some_and(|owner| *owner != id);
      if !foreign && !protected.contains(&path) && !cleanup.contains(&path) {
        cleanup.push(path);
      }
    }

    let builder = Arc::clone(&env.slot(id)?.builder);
    jobs.insert(
      id,
      Job {
        id,
        name: env.builder_name(id),
        key,
        builder,
        sources,
        targets,
        cleanup,
      },
    );
  }

  Ok(jobs)
}

/// Execute a wave of builders in parallel.
async fn execute_wave(
  jobs: Vec<Job>,
  paths: &Arc<PathTable>,
  fingerprinter: &Fingerprinter,
  semaphore: &Arc<Semaphore>,
  cancel: &CancellationToken,
) -> Vec<(BuilderId, Result<Outcome, BuildError>)> {
  let mut join_set = JoinSet::new();
  let dispatched: Vec<BuilderId> = jobs.iter().map(|job| job.id).collect();

  for job in jobs {
    let paths = Arc::clone(paths);
    let fingerprinter = fingerprinter.clone();
    let semaphore = Arc::clone(semaphore);
    let cancel = cancel.clone();

    join_set.spawn(async move {
      let id = job.id;
      let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return (id, Ok(Outcome::Cancelled)),
        permit = semaphore.acquire_owned() => permit,
      };
      let Ok(permit) = permit else {
        return (id, Err(BuildError::Failed("scheduler is shutting down".to_string())));
      };
      if cancel.is_cancelled() {
        return (id, Ok(Outcome::Cancelled));
      }

      let result = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        run_job(&job, &paths, &fingerprinter)
      })
      .await;

      match result {
        Ok(result) => (id, result.map(Outcome::Built)),
        Err(e) => (id, Err(BuildError::Panicked(e.to_string()))),
      }
    });
  }

  let mut results = Vec::new();
  while let Some(joined) = join_set.join_next().await {
    match joined {
      Ok(result) => results.push(result),
      Err(e) => error!(error = %e, "builder task panicked"),
    }
  }

  settle(&dispatched, results)
}

/// Give every dispatched builder a result. A builder whose task died before reporting fails.
fn settle(
  dispatched: &[BuilderId],
  mut results: Vec<(BuilderId, Result<Outcome, BuildError>)>,
) -> Vec<(BuilderId, Result<Outcome, BuildError>)> {
  for &id in dispatched {
    if !results.iter().any(|(done, _)| *done == id) {
      results.push((
        id,
        Err(BuildError::Panicked("builder task ended without reporting a result".to_string())),
      ));
    }
  }
  results
}

/// Clean, prepare, execute and verify one builder. Runs on the blocking pool.
fn run_job(job: &Job, paths: &Arc<PathTable>, fingerprinter: &Fingerprinter) -> Result<BuilderSignature, BuildError> {
  debug!(builder = %job.name, "running builder");

  for path in &job.cleanup {
    remove_path(path)?;
  }

  for &target in &job.targets {
    let entry = paths.entry(target)?;
    let path = entry.resolved_path()?;
    match entry.kind() {
      EntryKind::Directory => fs::create_dir_all(path)?,
      EntryKind::File => {
        if let Some(parent) = path.parent() {
          fs::create_dir_all(parent)?;
        }
      }
    }
  }

  let ctx = BuildContext::new(job.id, Arc::clone(paths), job.sources.clone(), job.targets.clone());
  job.builder.execute(&ctx)?;

  for &target in &job.targets {
    let path = paths.path(target)?;
    if !path.exists() {
      return Err(BuildError::MissingTarget(path.to_path_buf()));
    }
  }

  observe(paths, &job.sources, &job.targets, fingerprinter)
}

/// Remove a file or directory tree. Missing paths are fine.
fn remove_path(path: &Path) -> io::Result<()> {
  let metadata = match fs::symlink_metadata(path) {
    Ok(metadata) => metadata,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
    Err(e) => return Err(e),
  };

  debug!(path = ?path, "removing previous output");
  if metadata.is_dir() {
    fs::remove_dir_all(path)
  } else {
    fs::remove_file(path)
  }
}
