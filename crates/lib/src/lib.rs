//! minicons-lib: a minimal incremental build engine
//!
//! This crate provides:
//! - `Entry`: a file or directory a builder reads or writes, abstract until placed
//! - `Environment`: the registry of entries and builders for one build invocation
//! - `Builder`: the contract every unit of work implements
//! - `BuildGraph`: the dependency DAG reachable from the requested roots
//! - `build()`: resolve paths, detect stale builders and execute them in parallel waves
//!
//! # Example
//!
//! ```ignore
//! let mut env = Environment::new("/project", "build")?;
//! let object = env.add_builder(|decl| {
//!   let source = decl.depends_file("src/module.c")?;
//!   Ok(Compile::new(source))
//! })?;
//! let installed = Install::new(&mut env, "dist", object)?;
//!
//! let report = build(&mut env, &[Root::Builder(installed)], &EngineConfig::from_env()?).await?;
//! assert!(report.is_success());
//! ```

pub mod builder;
pub mod builders;
pub mod config;
pub mod entry;
pub mod env;
pub mod error;
pub mod execute;
pub mod graph;
pub mod resolve;
pub mod signature;
pub mod source;
pub mod stale;
pub mod util;

pub use builder::{BuildContext, BuildError, Builder, BuilderId, PathTable, Targets};
pub use builders::Install;
pub use config::EngineConfig;
pub use entry::{Entry, EntryError, EntryId, EntryKind, Location};
pub use env::{Declare, Environment};
pub use error::{ConfigError, EngineError, ResolveError};
pub use execute::{BuildFailure, BuildReport, BuilderState, Root, SkippedBuilder, build, build_default, build_with_cancel};
pub use graph::BuildGraph;
pub use signature::{FingerprintMode, Fingerprinter, SignatureStore, StoreError};
pub use source::Source;
