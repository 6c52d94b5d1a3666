//! The build environment.
//!
//! An [`Environment`] is constructed once per build invocation and owns:
//! - the source root (relative inputs are anchored here)
//! - the build root (unplaced abstract entries materialize here)
//! - the entry registry, interning one [`Entry`] per physical path
//! - the builder registry, with each builder's recorded sources and dependencies
//! - aliases and default targets
//!
//! It is mutated while builders are declared and while paths are resolved, and only read
//! afterwards.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::builder::{Builder, BuilderId, PathTable, Targets};
use crate::entry::{Entry, EntryError, EntryId, EntryKind, derived_relative_path, normalize};
use crate::error::{ConfigError, ResolveError};
use crate::signature::SIGNATURE_FILENAME;
use crate::source::Source;

pub(crate) struct BuilderSlot {
  pub(crate) builder: Arc<dyn Builder>,
  pub(crate) sources: Vec<EntryId>,
  pub(crate) dependencies: Vec<BuilderId>,
  pub(crate) targets: Option<Targets>,
}

/// Entries and dependencies gathered while normalizing source specifications.
#[derive(Debug, Default)]
struct Collected {
  entries: Vec<EntryId>,
  dependencies: Vec<BuilderId>,
}

impl Collected {
  fn push_entry(&mut self, id: EntryId) {
    if !self.entries.contains(&id) {
      self.entries.push(id);
    }
  }

  fn push_dependency(&mut self, id: BuilderId) {
    if !self.dependencies.contains(&id) {
      self.dependencies.push(id);
    }
  }

  fn merge(&mut self, other: &Collected) {
    for id in &other.entries {
      self.push_entry(*id);
    }
    for id in &other.dependencies {
      self.push_dependency(*id);
    }
  }
}

pub struct Environment {
  source_root: PathBuf,
  build_root: PathBuf,
  entries: Vec<Entry>,
  interned: HashMap<PathBuf, EntryId>,
  builders: Vec<BuilderSlot>,
  aliases: BTreeMap<String, Vec<BuilderId>>,
  defaults: Vec<String>,
}

impl fmt::Debug for Environment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Environment")
      .field("source_root", &self.source_root)
      .field("build_root", &self.build_root)
      .field("entries", &self.entries.len())
      .field("builders", &self.builders.len())
      .finish()
  }
}

impl Environment {
  /// Create an environment.
  ///
  /// A relative `build_root` is taken relative to `source_root`. The build root may be
  /// nested in the source root or live elsewhere, but must not be the source root itself or
  /// one of its ancestors.
  pub fn new(source_root: impl AsRef<Path>, build_root: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let source_root = canonical_root(source_root.as_ref())?;
    let build_root = build_root.as_ref();
    let build_root = if build_root.is_relative() {
      canonical_root(&source_root.join(build_root))?
    } else {
      canonical_root(build_root)?
    };

    if source_root.starts_with(&build_root) {
      return Err(ConfigError::InvalidRoots {
        source_root,
        build_root,
      });
    }

    debug!(source_root = ?source_root, build_root = ?build_root, "created environment");

    Ok(Self {
      source_root,
      build_root,
      entries: Vec::new(),
      interned: HashMap::new(),
      builders: Vec::new(),
      aliases: BTreeMap::new(),
      defaults: Vec::new(),
    })
  }

  pub fn source_root(&self) -> &Path {
    &self.source_root
  }

  pub fn build_root(&self) -> &Path {
    &self.build_root
  }

  /// Default location of the signature store.
  pub fn signature_path(&self) -> PathBuf {
    self.build_root.join(SIGNATURE_FILENAME)
  }

  /// Anchor `path` at the source root if relative, then normalize it.
  pub fn absolute_path(&self, path: &Path) -> Result<PathBuf, EntryError> {
    if path.as_os_str().is_empty() {
      return normalize(path);
    }
    if path.is_absolute() {
      normalize(path)
    } else {
      normalize(&self.source_root.join(path))
    }
  }

  // === Entries ===

  pub fn entry(&self, id: EntryId) -> Result<&Entry, EntryError> {
    self.entries.get(id.0).ok_or(EntryError::Unknown(id))
  }

  pub fn entry_count(&self) -> usize {
    self.entries.len()
  }

  /// A new abstract file. Never touches the filesystem.
  pub fn new_abstract(&mut self, relative_path: impl Into<PathBuf>, category: impl Into<String>) -> EntryId {
    self.push_abstract(EntryKind::File, relative_path.into(), category.into())
  }

  /// A new abstract directory.
  pub fn new_abstract_dir(&mut self, relative_path: impl Into<PathBuf>, category: impl Into<String>) -> EntryId {
    self.push_abstract(EntryKind::Directory, relative_path.into(), category.into())
  }

  /// The concrete file entry for `path`. The path need not exist.
  pub fn new_concrete(&mut self, path: impl AsRef<Path>) -> Result<EntryId, EntryError> {
    self.intern_path(path)
  }

  /// The single canonical file entry for `path`, created on first use.
  pub fn intern_path(&mut self, path: impl AsRef<Path>) -> Result<EntryId, EntryError> {
    self.intern(path.as_ref(), EntryKind::File)
  }

  /// The single canonical directory entry for `path`, created on first use.
  pub fn intern_dir(&mut self, path: impl AsRef<Path>) -> Result<EntryId, EntryError> {
    self.intern(path.as_ref(), EntryKind::Directory)
  }

  pub fn resolved_path(&self, id: EntryId) -> Result<&Path, EntryError> {
    self.entry(id)?.resolved_path()
  }

  /// A new abstract entry named after `id`.
  ///
  /// The relative path is carried over from an abstract entry, or re-rooted from a concrete
  /// one, with the extension replaced when `new_extension` is given. The kind is inherited.
  pub fn derive(
    &mut self,
    id: EntryId,
    new_extension: Option<&str>,
    category: impl Into<String>,
  ) -> Result<EntryId, EntryError> {
    let entry = self.entry(id)?;
    let kind = entry.kind();
    let relative = derived_relative_path(entry, &self.source_root, &self.build_root, new_extension)?;
    Ok(self.push_abstract(kind, relative, category.into()))
  }

  /// The builder that emits `id`, if any.
  pub fn producer_of(&self, id: EntryId) -> Option<BuilderId> {
    self.entries.get(id.0).and_then(Entry::producer)
  }

  fn push_abstract(&mut self, kind: EntryKind, relative_path: PathBuf, category: String) -> EntryId {
    let id = EntryId(self.entries.len());
    self.entries.push(Entry::new_abstract(id, kind, relative_path, category));
    id
  }

  fn intern(&mut self, path: &Path, kind: EntryKind) -> Result<EntryId, EntryError> {
    let path = self.absolute_path(path)?;

    if let Some(&id) = self.interned.get(&path) {
      let existing = self.entries[id.0].kind();
      if existing != kind {
        return Err(EntryError::KindMismatch {
          path,
          existing,
          requested: kind,
        });
      }
      return Ok(id);
    }

    let id = EntryId(self.entries.len());
    self.entries.push(Entry::new_concrete(id, kind, path.clone()));
    self.interned.insert(path, id);
    Ok(id)
  }

  // === Source specifications ===

  /// Normalize a source specification into a flat, order-preserving list of entries.
  ///
  /// Builder operands are resolved through their (memoized) target declaration and stand
  /// for their primary targets. Repeated entries keep their first position.
  pub fn resolve_source_spec(&mut self, spec: impl Into<Source>) -> Result<Vec<EntryId>, ConfigError> {
    let mut collected = Collected::default();
    self.collect(spec.into(), &mut collected)?;
    Ok(collected.entries)
  }

  fn collect(&mut self, spec: Source, out: &mut Collected) -> Result<(), ConfigError> {
    match spec {
      Source::Path(path) => {
        let id = self.intern(&path, EntryKind::File)?;
        self.note_entry(id, out);
      }
      Source::Dir(path) => {
        let id = self.intern(&path, EntryKind::Directory)?;
        self.note_entry(id, out);
      }
      Source::Entry(id) => {
        if id.0 >= self.entries.len() {
          return Err(ConfigError::UnknownSource(format!(
            "{id} is not registered in this environment"
          )));
        }
        self.note_entry(id, out);
      }
      Source::Builder(id) => {
        if id.0 >= self.builders.len() {
          return Err(ConfigError::UnknownSource(format!(
            "{id} is not registered in this environment"
          )));
        }
        let targets = self.targets_of(id)?;
        out.push_dependency(id);
        for entry in targets.primary() {
          self.note_entry(entry, out);
        }
      }
      Source::Many(items) => {
        for item in items {
          self.collect(item, out)?;
        }
      }
    }
    Ok(())
  }

  fn note_entry(&self, id: EntryId, out: &mut Collected) {
    out.push_entry(id);
    if let Some(producer) = self.entries[id.0].producer() {
      out.push_dependency(producer);
    }
  }

  // === Builders ===

  /// Register a builder constructed by `build`.
  ///
  /// Every source the closure resolves through [`Declare::depends_files`] or
  /// [`Declare::depends_file`] becomes a source of the new builder, and the producers of
  /// those sources become its dependencies.
  ///
  /// # Example
  ///
  /// ```ignore
  /// let object = env.add_builder(|decl| {
  ///   let source = decl.depends_file("src/module.c")?;
  ///   Ok(Compile { source })
  /// })?;
  /// ```
  pub fn add_builder<B, F>(&mut self, build: F) -> Result<BuilderId, ConfigError>
  where
    B: Builder,
    F: FnOnce(&mut Declare<'_>) -> Result<B, ConfigError>,
  {
    let mut declare = Declare {
      env: self,
      collected: Collected::default(),
    };
    let builder = build(&mut declare)?;
    let collected = declare.collected;
    Ok(self.push_builder(Arc::new(builder), collected))
  }

  /// Register a builder that declares no sources at construction.
  pub fn register(&mut self, builder: impl Builder) -> BuilderId {
    self.push_builder(Arc::new(builder), Collected::default())
  }

  /// Record additional sources for an already registered builder.
  pub fn depends_files(&mut self, builder: BuilderId, spec: impl Into<Source>) -> Result<Vec<EntryId>, ConfigError> {
    self.slot(builder)?;

    let mut collected = Collected::default();
    self.collect(spec.into(), &mut collected)?;

    let slot = &mut self.builders[builder.0];
    for entry in &collected.entries {
      if !slot.sources.contains(entry) {
        slot.sources.push(*entry);
      }
    }
    for dependency in &collected.dependencies {
      if !slot.dependencies.contains(dependency) {
        slot.dependencies.push(*dependency);
      }
    }

    Ok(collected.entries)
  }

  /// Like [`depends_files`](Self::depends_files), but `spec` must resolve to exactly one entry.
  pub fn depends_file(&mut self, builder: BuilderId, spec: impl Into<Source>) -> Result<EntryId, ConfigError> {
    single(self.depends_files(builder, spec)?)
  }

  /// The declared targets of `id`, declaring them on first use.
  pub fn targets_of(&mut self, id: BuilderId) -> Result<Targets, ConfigError> {
    let slot = self.slot(id)?;
    if let Some(targets) = &slot.targets {
      return Ok(targets.clone());
    }

    let builder = Arc::clone(&slot.builder);
    let targets = builder.declare_targets(self)?;

    // First claimant becomes the producer; competing claims are reported by resolution.
    for entry in targets.all() {
      let entry = self.entries.get_mut(entry.0).ok_or(EntryError::Unknown(entry))?;
      if entry.producer().is_none() {
        entry.set_producer(id);
      }
    }

    debug!(builder = %builder.name(), targets = ?targets, "declared targets");
    self.builders[id.0].targets = Some(targets.clone());
    Ok(targets)
  }

  /// Targets of `id` if they have been declared already.
  pub fn declared_targets(&self, id: BuilderId) -> Option<&Targets> {
    self.builders.get(id.0).and_then(|slot| slot.targets.as_ref())
  }

  /// Side outputs of `id` (see [`Targets::WithSide`]).
  pub fn side_targets(&mut self, id: BuilderId) -> Result<Vec<EntryId>, ConfigError> {
    Ok(self.targets_of(id)?.side().to_vec())
  }

  pub fn builder_name(&self, id: BuilderId) -> String {
    self
      .builders
      .get(id.0)
      .map(|slot| slot.builder.name().to_string())
      .unwrap_or_else(|| id.to_string())
  }

  pub fn builder_count(&self) -> usize {
    self.builders.len()
  }

  /// Recorded sources of `id`, in declaration order.
  pub fn sources_of(&self, id: BuilderId) -> Result<&[EntryId], ConfigError> {
    Ok(&self.slot(id)?.sources)
  }

  /// Recorded dependencies of `id`.
  pub fn dependencies_of(&self, id: BuilderId) -> Result<&[BuilderId], ConfigError> {
    Ok(&self.slot(id)?.dependencies)
  }

  pub(crate) fn slot(&self, id: BuilderId) -> Result<&BuilderSlot, ConfigError> {
    self.builders.get(id.0).ok_or(ConfigError::UnknownBuilder(id))
  }

  fn push_builder(&mut self, builder: Arc<dyn Builder>, collected: Collected) -> BuilderId {
    let id = BuilderId(self.builders.len());
    debug!(
      builder = %builder.name(),
      id = %id,
      sources = collected.entries.len(),
      dependencies = collected.dependencies.len(),
      "registered builder"
    );
    self.builders.push(BuilderSlot {
      builder,
      sources: collected.entries,
      dependencies: collected.dependencies,
      targets: None,
    });
    id
  }

  // === Aliases ===

  /// Name a group of builders so it can be requested as a root.
  pub fn alias(&mut self, name: impl Into<String>, builders: impl IntoIterator<Item = BuilderId>) {
    let group = self.aliases.entry(name.into()).or_default();
    for id in builders {
      if !group.contains(&id) {
        group.push(id);
      }
    }
  }

  pub fn alias_builders(&self, name: &str) -> Result<&[BuilderId], ConfigError> {
    self
      .aliases
      .get(name)
      .map(Vec::as_slice)
      .ok_or_else(|| ConfigError::UnknownAlias(name.to_string()))
  }

  /// Aliases built when the caller names no roots.
  pub fn set_default<I, S>(&mut self, names: I)
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.defaults = names.into_iter().map(Into::into).collect();
  }

  pub fn defaults(&self) -> &[String] {
    &self.defaults
  }

  // === Resolution support ===

  /// Snapshot of every entry, for use while builders execute.
  pub fn path_table(&self) -> PathTable {
    PathTable::new(self.entries.clone())
  }

  /// Fix the location of an abstract entry, interning the resulting path.
  pub(crate) fn resolve_entry(&mut self, id: EntryId, path: &Path) -> Result<(), ResolveError> {
    let path = normalize(path)?;

    if let Some(&owner) = self.interned.get(&path)
      && owner != id
    {
      return Err(ResolveError::ConflictingClaim {
        path: path.display().to_string(),
        first: self.claimant(owner),
        second: self.claimant(id),
      });
    }

    let entry = self.entries.get_mut(id.0).ok_or(EntryError::Unknown(id))?;
    entry.resolve(path.clone())?;
    self.interned.insert(path, id);
    Ok(())
  }

  /// Who owns an entry, for error messages.
  pub(crate) fn claimant(&self, id: EntryId) -> String {
    match self.producer_of(id) {
      Some(builder) => self.builder_name(builder),
      None => match self.entry(id) {
        Ok(entry) => format!("source {entry}"),
        Err(_) => id.to_string(),
      },
    }
  }
}

/// Handed to the closure passed to [`Environment::add_builder`].
///
/// Dereferences to the environment so builders can create abstract entries or derive
/// names while they are being constructed.
pub struct Declare<'a> {
  env: &'a mut Environment,
  collected: Collected,
}

impl Declare<'_> {
  /// Resolve `spec` and record the entries as sources of the builder being declared.
  pub fn depends_files(&mut self, spec: impl Into<Source>) -> Result<Vec<EntryId>, ConfigError> {
    let mut collected = Collected::default();
    self.env.collect(spec.into(), &mut collected)?;
    self.collected.merge(&collected);
    Ok(collected.entries)
  }

  /// Like [`depends_files`](Self::depends_files), but `spec` must resolve to exactly one entry.
  pub fn depends_file(&mut self, spec: impl Into<Source>) -> Result<EntryId, ConfigError> {
    single(self.depends_files(spec)?)
  }
}

impl Deref for Declare<'_> {
  type Target = Environment;

  fn deref(&self) -> &Environment {
    self.env
  }
}

impl DerefMut for Declare<'_> {
  fn deref_mut(&mut self) -> &mut Environment {
    self.env
  }
}

fn single(entries: Vec<EntryId>) -> Result<EntryId, ConfigError> {
  match entries.as_slice() {
    [one] => Ok(*one),
    _ => Err(ConfigError::ExpectedSingleFile { count: entries.len() }),
  }
}

/// Absolute, normalized form of a root directory.
///
/// The longest existing prefix is canonicalized so that roots compare equal to the paths
/// the platform hands back (e.g. temp directories behind symlinks).
fn canonical_root(path: &Path) -> Result<PathBuf, EntryError> {
  let absolute = if path.is_absolute() {
    normalize(path)?
  } else {
    let cwd = std::env::current_dir().map_err(|e| EntryError::InvalidPath {
      path: path.to_path_buf(),
      reason: format!("cannot read current directory: {e}"),
    })?;
    normalize(&cwd.join(path))?
  };

  let mut existing = absolute.as_path();
  let mut missing = Vec::new();
  loop {
    if let Ok(mut canonical) = dunce::canonicalize(existing) {
      for name in missing.iter().rev() {
        canonical.push(name);
      }
      return Ok(canonical);
    }
    match (existing.parent(), existing.file_name()) {
      (Some(parent), Some(name)) => {
        missing.push(name.to_os_string());
        existing = parent;
      }
      _ => return Ok(absolute),
    }
  }
}
