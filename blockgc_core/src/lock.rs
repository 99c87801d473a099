//! Repository-wide GC lock.
//!
//! A single read/write lock guards the whole repository. Every mutating
//! operation (block put/remove, pin add/remove, MFS root updates) holds the
//! shared side for its duration; a GC run holds the exclusive side from
//! before the mark phase until the last delete of the sweep has finished.
//!
//! Two layers make up the lock. An in-process `RwLock` orders tasks sharing
//! one handle, and an optional lock file (`flock` through `fs4`) orders
//! handles opened separately on the same repository, including handles in
//! other processes. The in-process side is always taken first.
//!
//! The guards release on drop, so every exit path of a run (completion,
//! error, or the consumer abandoning the result stream) releases the lock.
//! There is exactly one lock per repository and nothing acquires it while
//! already holding it.

use crate::error::Result;
use fs4::fs_std::FileExt;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

/// Shared guard held by repository mutators.
#[derive(Debug)]
pub struct GcReadGuard {
    _file: Option<File>,
    _guard: OwnedRwLockReadGuard<()>,
}

/// Exclusive guard held by a GC run.
#[derive(Debug)]
pub struct GcWriteGuard {
    _file: Option<File>,
    _guard: OwnedRwLockWriteGuard<()>,
}

/// Coordinates GC runs against repository mutators.
///
/// Clones share the same lock.
#[derive(Debug, Clone, Default)]
pub struct GcLock {
    inner: Arc<RwLock<()>>,
    file: Option<Arc<PathBuf>>,
}

impl GcLock {
    /// Create a new, unlocked GC lock local to this process.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a GC lock that also locks `path`, so handles opened
    /// separately on the same repository exclude each other.
    ///
    /// The file is created on first use.
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::default(),
            file: Some(Arc::new(path.into())),
        }
    }

    /// Path of the lock file, if this lock has one.
    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref().map(PathBuf::as_path)
    }

    /// Acquire the exclusive side, waiting for in-flight mutators and any
    /// running GC to finish.
    pub async fn write_lock(&self) -> Result<GcWriteGuard> {
        let guard = Arc::clone(&self.inner).write_owned().await;
        let file = self.lock_file(true).await?;
        Ok(GcWriteGuard {
            _file: file,
            _guard: guard,
        })
    }

    /// Acquire the shared side, waiting for a running GC to finish.
    pub async fn read_lock(&self) -> Result<GcReadGuard> {
        let guard = Arc::clone(&self.inner).read_owned().await;
        let file = self.lock_file(false).await?;
        Ok(GcReadGuard {
            _file: file,
            _guard: guard,
        })
    }

    /// Returns true if a GC run through this handle holds, or is queued
    /// for, the lock.
    pub fn is_gc_running(&self) -> bool {
        Arc::clone(&self.inner).try_read_owned().is_err()
    }

    async fn lock_file(&self, exclusive: bool) -> Result<Option<File>> {
        let Some(path) = self.file.clone() else {
            return Ok(None);
        };
        // flock blocks the calling thread
        let file = tokio::task::spawn_blocking(move || open_locked(&path, exclusive)).await??;
        Ok(Some(file))
    }
}

fn open_locked(path: &Path, exclusive: bool) -> io::Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(path)?;
    if exclusive {
        file.lock_exclusive()?;
    } else {
        file.lock_shared()?;
    }
    Ok(file)
}
