//! Root key/value store for repository metadata.
//!
//! Holds small values that are not blocks themselves, such as the MFS root
//! CID and the pointer to the current pin set.

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Key under which the MFS root CID (binary form) is stored.
pub const MFS_ROOT_KEY: &str = "/local/filesroot";

/// Key under which the current pin-set node CID (binary form) is stored.
pub const PIN_ROOT_KEY: &str = "/local/pins";

/// Key/value store for repository metadata.
#[async_trait]
pub trait RootStore: Send + Sync + 'static {
    /// Read a value.
    ///
    /// Returns `Error::NotFound` if the key has no value.
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Write a value, replacing any previous one.
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove a value. Removing an absent key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Validate a datastore key and return its segments.
///
/// Keys look like `/local/filesroot`: a leading slash followed by one or
/// more non-empty segments of `[A-Za-z0-9_-]`.
fn key_segments(key: &str) -> Result<Vec<&str>> {
    let Some(rest) = key.strip_prefix('/') else {
        return Err(Error::invalid_key(format!("{key} (must start with /)")));
    };

    let segments: Vec<&str> = rest.split('/').collect();
    for segment in &segments {
        if segment.is_empty() {
            return Err(Error::invalid_key(format!("{key} (empty segment)")));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::invalid_key(format!(
                "{key} (segments may only contain letters, digits, _ and -)"
            )));
        }
    }

    Ok(segments)
}

/// File-backed datastore: one file per key under a directory.
#[derive(Debug, Clone)]
pub struct Datastore {
    dir: Arc<PathBuf>,
}

impl Datastore {
    /// Open (creating if needed) a datastore in `dir`.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir: Arc::new(dir) })
    }

    /// Get the path to a key's file.
    fn key_path(&self, key: &str) -> Result<PathBuf> {
        let segments = key_segments(key)?;
        Ok(self.dir.join(segments.join(".")))
    }
}

#[async_trait]
impl RootStore for Datastore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.key_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(value) => Ok(value),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::not_found(key)),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        let path = self.key_path(key)?;
        let dir = Arc::clone(&self.dir);
        let value = value.to_vec();

        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut temp_file = tempfile::NamedTempFile::new_in(dir.as_path())?;
            temp_file.write_all(&value)?;
            temp_file.flush()?;
            temp_file.persist(&path)?;
            Ok(())
        })
        .await?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory datastore.
///
/// Thread-safe via `RwLock`. Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatastore {
    values: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryDatastore {
    /// Creates a new empty memory datastore.
    pub fn new() -> Self {
        Self::default()
    }

    fn poisoned() -> Error {
        Error::task("datastore lock poisoned")
    }
}

#[async_trait]
impl RootStore for MemoryDatastore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        key_segments(key)?;
        let values = self.values.read().map_err(|_| Self::poisoned())?;
        values.get(key).cloned().ok_or_else(|| Error::not_found(key))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        key_segments(key)?;
        let mut values = self.values.write().map_err(|_| Self::poisoned())?;
        values.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        key_segments(key)?;
        let mut values = self.values.write().map_err(|_| Self::poisoned())?;
        values.remove(key);
        Ok(())
    }
}
