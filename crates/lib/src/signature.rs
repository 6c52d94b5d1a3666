//! Persisted build signatures.
//!
//! After a builder succeeds, the fingerprints of its sources and targets are recorded so the
//! next invocation can tell whether anything changed. The store is a single JSON file,
//! by default `<build_root>/.minicons-signatures.json`.
//!
//! # Signature File Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "builders": {
//!     "compile@/project/build/objs/a.o": {
//!       "sources": [
//!         { "path": "/project/a.c", "fingerprint": "9f86d0...", "lastObservedAt": 1733667300 }
//!       ],
//!       "targets": [
//!         { "path": "/project/build/objs/a.o", "fingerprint": "60303a...", "lastObservedAt": 1733667301 }
//!       ]
//!     }
//!   }
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, trace};

use crate::util::hash::{ContentHash, HashError, hash_directory, hash_file, hash_metadata};

/// Current signature file format version.
pub const SIGNATURE_VERSION: u32 = 1;

/// Signature file name, relative to the build root.
pub const SIGNATURE_FILENAME: &str = ".minicons-signatures.json";

/// How file fingerprints are computed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FingerprintMode {
  /// SHA-256 of the file bytes.
  #[default]
  Content,
  /// Size and modification time only.
  Metadata,
}

impl FromStr for FingerprintMode {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.trim().to_ascii_lowercase().as_str() {
      "content" => Ok(FingerprintMode::Content),
      "metadata" => Ok(FingerprintMode::Metadata),
      other => Err(format!("unknown fingerprint mode '{other}', expected 'content' or 'metadata'")),
    }
  }
}

/// Fingerprint settings for one invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Fingerprinter {
  mode: FingerprintMode,
  exclude: Vec<PathBuf>,
}

impl Fingerprinter {
  pub fn new(mode: FingerprintMode) -> Self {
    Self {
      mode,
      exclude: Vec::new(),
    }
  }

  /// Skip `path` (and everything below it) whenever it lies beneath a fingerprinted
  /// directory. A directory that is itself excluded is still fingerprinted as a whole.
  pub fn excluding(mut self, path: impl Into<PathBuf>) -> Self {
    self.exclude.push(path.into());
    self
  }

  pub fn mode(&self) -> FingerprintMode {
    self.mode
  }

  /// Fingerprint whatever is at `path`, or `None` if nothing is.
  ///
  /// Directories are fingerprinted over every file beneath them.
  pub fn fingerprint(&self, path: &Path) -> Result<Option<ContentHash>, HashError> {
    let metadata = match fs::metadata(path) {
      Ok(metadata) => metadata,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(e) => {
        return Err(HashError::ReadFile {
          path: path.display().to_string(),
          message: e.to_string(),
        });
      }
    };

    let leaf = match self.mode {
      FingerprintMode::Content => hash_file,
      FingerprintMode::Metadata => hash_metadata,
    };

    let hash = if metadata.is_dir() {
      hash_directory(path, leaf, &self.exclude)?
    } else {
      leaf(path)?
    };
    Ok(Some(hash))
  }
}

/// Seconds since the Unix epoch.
pub(crate) fn now() -> u64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or_default()
}

/// A single fingerprinted path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureRecord {
  pub path: String,
  pub fingerprint: ContentHash,
  /// Unix timestamp of when the fingerprint was taken.
  pub last_observed_at: u64,
}

impl SignatureRecord {
  pub fn new(path: &Path, fingerprint: ContentHash) -> Self {
    Self {
      path: path.display().to_string(),
      fingerprint,
      last_observed_at: now(),
    }
  }
}

/// Fingerprints recorded after the last successful run of one builder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderSignature {
  pub sources: Vec<SignatureRecord>,
  pub targets: Vec<SignatureRecord>,
}

impl BuilderSignature {
  pub fn source(&self, path: &str) -> Option<&SignatureRecord> {
    self.sources.iter().find(|r| r.path == path)
  }

  pub fn target(&self, path: &str) -> Option<&SignatureRecord> {
    self.targets.iter().find(|r| r.path == path)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct SignatureFile {
  version: u32,
  builders: BTreeMap<String, BuilderSignature>,
}

impl Default for SignatureFile {
  fn default() -> Self {
    Self {
      version: SIGNATURE_VERSION,
      builders: BTreeMap::new(),
    }
  }
}

/// Errors that can occur when working with the signature store.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("failed to read signature file {path:?}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to write signature file {path:?}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse signature file: {0}")]
  Parse(#[source] serde_json::Error),

  #[error("failed to serialize signature file: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("unsupported signature file version {0}, expected {expected}", expected = SIGNATURE_VERSION)]
  UnsupportedVersion(u32),
}

/// The signature store of one build root.
///
/// Loaded once per invocation. Mutations stay in memory until [`save`](Self::save);
/// [`upsert`](Self::upsert) saves immediately.
#[derive(Debug)]
pub struct SignatureStore {
  path: PathBuf,
  file: SignatureFile,
}

impl SignatureStore {
  /// Load the store at `path`. A missing file is an empty store.
  pub fn load(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
    let path = path.into();

    let content = match fs::read_to_string(&path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        debug!(path = ?path, "no signature file, starting empty");
        return Ok(Self {
          path,
          file: SignatureFile::default(),
        });
      }
      Err(source) => return Err(StoreError::Read { path, source }),
    };

    let file: SignatureFile = serde_json::from_str(&content).map_err(StoreError::Parse)?;
    if file.version != SIGNATURE_VERSION {
      return Err(StoreError::UnsupportedVersion(file.version));
    }

    debug!(path = ?path, builders = file.builders.len(), "loaded signatures");
    Ok(Self { path, file })
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn get(&self, key: &str) -> Option<&BuilderSignature> {
    self.file.builders.get(key)
  }

  pub fn keys(&self) -> impl Iterator<Item = &str> {
    self.file.builders.keys().map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.file.builders.len()
  }

  pub fn is_empty(&self) -> bool {
    self.file.builders.is_empty()
  }

  /// Record `signature` for `key` and write the store to disk.
  pub fn upsert(&mut self, key: &str, signature: BuilderSignature) -> Result<(), StoreError> {
    self.file.builders.insert(key.to_string(), signature);
    self.save()
  }

  /// Forget the signature of `key`, returning it.
  pub fn remove(&mut self, key: &str) -> Option<BuilderSignature> {
    self.file.builders.remove(key)
  }

  /// Drop every record whose key is not in `live`. Returns how many were dropped.
  pub fn prune(&mut self, live: &HashSet<String>) -> usize {
    let before = self.file.builders.len();
    self.file.builders.retain(|key, _| live.contains(key));
    let pruned = before - self.file.builders.len();
    if pruned > 0 {
      debug!(pruned, "pruned stale signatures");
    }
    pruned
  }

  /// Write the store atomically: a temp file in the same directory is renamed over it.
  pub fn save(&self) -> Result<(), StoreError> {
    let write_error = |source: io::Error| StoreError::Write {
      path: self.path.clone(),
      source,
    };

    let content = serde_json::to_string_pretty(&self.file).map_err(StoreError::Serialize)?;
    let dir = match self.path.parent() {
      Some(parent) if !parent.as_os_str().is_empty() => parent,
      _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(write_error)?;

    let mut temp = NamedTempFile::new_in(dir).map_err(write_error)?;
    temp.write_all(content.as_bytes()).map_err(write_error)?;
    temp.flush().map_err(write_error)?;
    temp.persist(&self.path).map_err(|e| write_error(e.error))?;

    trace!(path = ?self.path, builders = self.file.builders.len(), "saved signatures");
    Ok(())
  }
}
