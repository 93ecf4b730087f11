//! Content-addressed store for engine and plugin binaries.
//!
//! Every distinct file content lands once at `<root>/<sha256>/<file_name>`.
//! Population is serialized per key inside the process and published with an
//! atomic rename, so a concurrent reader either sees no file or the complete
//! one. Entries are never removed by the harness.

use crate::{ensure_dir, scratch_path, sha256_file};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cannot hash {path}: {source}")]
    Hash {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("source has no file name: {0}")]
    NoFileName(PathBuf),
    #[error("failed to copy {from} into cache at {to}: {source}")]
    Copy {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug)]
pub struct ArtifactCache {
    root: PathBuf,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    copies: AtomicUsize,
}

impl ArtifactCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            key_locks: Mutex::new(HashMap::new()),
            copies: AtomicUsize::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of physical copies this instance has performed.
    pub fn copies(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }

    /// Returns the canonical cached path for `source`, copying it in on the
    /// first request for its content hash.
    pub fn ensure(&self, source: &Path) -> Result<PathBuf, CacheError> {
        let (hash, target) = self.locate(source)?;
        if target.is_file() {
            debug!(path = %target.display(), "artifact already cached");
            return Ok(target);
        }

        let lock = self.key_lock(&hash);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        if target.is_file() {
            return Ok(target);
        }

        let copy_err = |e: io::Error| CacheError::Copy {
            from: source.to_path_buf(),
            to: target.clone(),
            source: e,
        };
        if let Some(dir) = target.parent() {
            ensure_dir(dir).map_err(copy_err)?;
        }
        let tmp = scratch_path(&target);
        if let Err(e) = fs::copy(source, &tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(copy_err(e));
        }
        if let Err(e) = fs::rename(&tmp, &target) {
            let _ = fs::remove_file(&tmp);
            return Err(copy_err(e));
        }
        self.copies.fetch_add(1, Ordering::SeqCst);
        info!(
            source = %source.display(),
            target = %target.display(),
            "copied artifact into cache"
        );
        Ok(target)
    }

    /// Resolves the cache path for `source` without touching the cache.
    /// Used when the operator asked to skip the freshness check.
    pub fn ensure_unchecked(&self, source: &Path) -> Result<PathBuf, CacheError> {
        self.locate(source).map(|(_, target)| target)
    }

    fn locate(&self, source: &Path) -> Result<(String, PathBuf), CacheError> {
        let hash = sha256_file(source).map_err(|e| CacheError::Hash {
            path: source.to_path_buf(),
            source: e,
        })?;
        let name = source
            .file_name()
            .ok_or_else(|| CacheError::NoFileName(source.to_path_buf()))?;
        let target = self.root.join(&hash).join(name);
        Ok((hash, target))
    }

    fn key_lock(&self, hash: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(hash.to_string()).or_default())
    }
}
