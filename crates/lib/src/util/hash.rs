//! Hashing utilities for entry fingerprints.
//!
//! This module provides:
//! - `ContentHash`: a 64-character SHA-256 hex digest
//! - `hash_file()`: content hash of a single file
//! - `hash_metadata()`: cheap hash of a file's size and modification time
//! - `hash_directory()`: deterministic hash over the files beneath a directory
//! - `hash_bytes()`: arbitrary byte hashing

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// A full 64-character SHA256 hash.
///
/// # Format
///
/// The hash is a lowercase hexadecimal string (64 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Error during hashing.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HashError {
  #[error("failed to walk directory: {message}")]
  WalkDir { message: String },

  #[error("failed to read file {path}: {message}")]
  ReadFile { path: String, message: String },

  #[error("failed to read symlink {path}: {message}")]
  ReadSymlink { path: String, message: String },
}

/// Compute a deterministic hash of a directory's contents.
///
/// Every file and symlink beneath `path` contributes a `(relative path, fingerprint)` pair,
/// where files are fingerprinted with `leaf` and symlinks by their target. Pairs are sorted
/// by relative path and hashed in order, so the result changes when a file is added, removed,
/// renamed or modified. Directories themselves do not contribute.
///
/// # Arguments
///
/// * `path` - The directory to hash
/// * `leaf` - Fingerprint of a single file
/// * `exclude` - Absolute paths beneath `path` to skip, with everything below them
///
/// # Example
///
/// ```ignore
/// let hash = hash_directory(&source_dir, hash_file, &[build_root])?;
/// ```
pub fn hash_directory<F>(path: &Path, leaf: F, exclude: &[PathBuf]) -> Result<ContentHash, HashError>
where
  F: Fn(&Path) -> Result<ContentHash, HashError>,
{
  let mut entries: Vec<(String, ContentHash)> = Vec::new();

  let walker = WalkDir::new(path)
    .sort_by_file_name()
    .into_iter()
    .filter_entry(|e| e.depth() == 0 || !exclude.iter().any(|excluded| excluded == e.path()));

  for entry in walker {
    let entry = entry.map_err(|e| HashError::WalkDir { message: e.to_string() })?;
    let entry_path = entry.path();

    let rel_path = entry_path
      .strip_prefix(path)
      .unwrap_or(entry_path)
      .to_string_lossy()
      .to_string();

    let file_type = entry.file_type();
    let fingerprint = if file_type.is_file() {
      leaf(entry_path)?
    } else if file_type.is_symlink() {
      let target = fs::read_link(entry_path).map_err(|e| HashError::ReadSymlink {
        path: entry_path.display().to_string(),
        message: e.to_string(),
      })?;
      hash_bytes(target.to_string_lossy().as_bytes())
    } else {
      // Directories and special files (sockets, devices, etc.)
      continue;
    };

    entries.push((rel_path, fingerprint));
  }

  entries.sort_by(|a, b| a.0.cmp(&b.0));

  let mut hasher = Sha256::new();
  for (rel_path, fingerprint) in entries {
    hasher.update(rel_path.as_bytes());
    hasher.update(b"\0");
    hasher.update(fingerprint.0.as_bytes());
    hasher.update(b"\n");
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// Hash a file's contents.
pub fn hash_file(path: &Path) -> Result<ContentHash, HashError> {
  let read_error = |e: std::io::Error| HashError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  };

  let mut file = fs::File::open(path).map_err(read_error)?;
  let mut hasher = Sha256::new();
  let mut buffer = [0u8; 8192];

  loop {
    let bytes_read = file.read(&mut buffer).map_err(read_error)?;
    if bytes_read == 0 {
      break;
    }
    hasher.update(&buffer[..bytes_read]);
  }

  Ok(ContentHash(hex::encode(hasher.finalize())))
}

/// Hash a file's size and modification time.
///
/// Much cheaper than [`hash_file`] for large inputs, at the cost of missing edits that keep
/// both the size and the timestamp.
pub fn hash_metadata(path: &Path) -> Result<ContentHash, HashError> {
  let metadata = fs::metadata(path).map_err(|e| HashError::ReadFile {
    path: path.display().to_string(),
    message: e.to_string(),
  })?;

  let modified = metadata
    .modified()
    .ok()
    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
    .map(|d| d.as_nanos())
    .unwrap_or_default();

  Ok(hash_bytes(format!("{}:{}", metadata.len(), modified).as_bytes()))
}

/// Hash arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Sha256::new();
  hasher.update(data);
  ContentHash(hex::encode(hasher.finalize()))
}
