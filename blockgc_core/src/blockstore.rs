//! Block storage.
//!
//! The [`Blockstore`] trait is the contract the GC sweeps against: a keys-only
//! enumeration plus get/put/has/delete by CID. Keys are always stored in
//! normalized form (see [`crate::key::normalize`]), but callers may pass any
//! CID version.

use crate::error::{Error, Result};
use crate::key::normalize;
use async_trait::async_trait;
use cid::Cid;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashMap;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Capacity of the channel feeding keys out of the directory walker.
const KEY_QUERY_BUFFER: usize = 256;

/// Prefix of in-progress block writes, skipped by key enumeration.
const TEMP_PREFIX: &str = ".tmp";

/// Content-addressed block storage.
#[async_trait]
pub trait Blockstore: Send + Sync + 'static {
    /// Enumerate every stored key, in no particular order.
    ///
    /// Yields raw key strings; decoding them into CIDs is the caller's job
    /// so that a corrupt key can be reported without aborting enumeration.
    fn query_keys(&self) -> BoxStream<'static, Result<String>>;

    /// Read a block.
    ///
    /// Returns `Error::BlockNotFound` if the block is absent.
    async fn get(&self, cid: &Cid) -> Result<Vec<u8>>;

    /// Store a block. Writing an existing block is a no-op.
    async fn put(&self, cid: &Cid, data: &[u8]) -> Result<()>;

    /// Returns true if the block is present.
    async fn has(&self, cid: &Cid) -> Result<bool>;

    /// Delete a block.
    ///
    /// Returns `Error::BlockNotFound` if the block is absent.
    async fn delete(&self, cid: &Cid) -> Result<()>;
}

/// Blockstore backed by a sharded directory of block files.
///
/// Layout: `{root}/{shard}/{key}` where `shard` is the two characters
/// preceding the last character of the normalized key.
#[derive(Debug, Clone)]
pub struct FsBlockstore {
    root: Arc<PathBuf>,
}

impl FsBlockstore {
    /// Open (creating if needed) a blockstore rooted at `root`.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root: Arc::new(root),
        })
    }

    /// Get the root directory of the blockstore.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the path to a block file given its CID.
    pub fn block_path(&self, cid: &Cid) -> PathBuf {
        let key = normalize(cid);
        self.root.join(shard_of(&key)).join(key)
    }

    /// Walk shard directories, sending each block key until the receiver
    /// goes away.
    fn walk_keys(root: &Path, tx: &mpsc::Sender<Result<String>>) -> Result<()> {
        if !root.exists() {
            return Ok(());
        }

        for shard_entry in fs::read_dir(root)? {
            let shard_path = shard_entry?.path();
            if !shard_path.is_dir() {
                continue;
            }

            for block_entry in fs::read_dir(&shard_path)? {
                let block_entry = block_entry?;
                if !block_entry.file_type()?.is_file() {
                    continue;
                }

                let name = block_entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(TEMP_PREFIX) {
                    continue;
                }

                if tx.blocking_send(Ok(name)).is_err() {
                    return Ok(());
                }
            }
        }

        Ok(())
    }

    /// Write a block atomically using tempfile.
    fn write_block_atomic(path: &Path, data: &[u8]) -> Result<()> {
        let Some(parent) = path.parent() else {
            return Err(Error::invalid_key(format!(
                "block path has no parent: {}",
                path.display()
            )));
        };
        fs::create_dir_all(parent)?;

        let mut temp_file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(parent)?;
        temp_file.write_all(data)?;
        temp_file.flush()?;
        temp_file.persist(path)?;

        Ok(())
    }
}

/// Shard directory for a normalized key ("next-to-last/2").
fn shard_of(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() < 3 {
        return "__".to_string();
    }
    chars[chars.len() - 3..chars.len() - 1].iter().collect()
}

#[async_trait]
impl Blockstore for FsBlockstore {
    fn query_keys(&self) -> BoxStream<'static, Result<String>> {
        let (tx, rx) = mpsc::channel(KEY_QUERY_BUFFER);
        let root = Arc::clone(&self.root);

        tokio::task::spawn_blocking(move || {
            if let Err(e) = Self::walk_keys(&root, &tx) {
                let _ = tx.blocking_send(Err(e));
            }
        });

        ReceiverStream::new(rx).boxed()
    }

    async fn get(&self, cid: &Cid) -> Result<Vec<u8>> {
        match tokio::fs::read(self.block_path(cid)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::block_not_found(cid.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn put(&self, cid: &Cid, data: &[u8]) -> Result<()> {
        let path = self.block_path(cid);
        if tokio::fs::try_exists(&path).await? {
            return Ok(());
        }

        let data = data.to_vec();
        tokio::task::spawn_blocking(move || Self::write_block_atomic(&path, &data)).await?
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.block_path(cid)).await?)
    }

    async fn delete(&self, cid: &Cid) -> Result<()> {
        match tokio::fs::remove_file(self.block_path(cid)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::block_not_found(cid.to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory blockstore.
///
/// Thread-safe via `RwLock`. Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockstore {
    blocks: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryBlockstore {
    /// Creates a new empty memory blockstore.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored blocks.
    pub fn len(&self) -> usize {
        self.blocks.read().map(|b| b.len()).unwrap_or(0)
    }

    /// Returns true if no blocks are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store a payload under an arbitrary key, bypassing CID normalization.
    #[cfg(test)]
    pub(crate) fn insert_raw(&self, key: &str, data: &[u8]) {
        if let Ok(mut blocks) = self.blocks.write() {
            blocks.insert(key.to_string(), data.to_vec());
        }
    }

    fn poisoned() -> Error {
        Error::task("blockstore lock poisoned")
    }
}

#[async_trait]
impl Blockstore for MemoryBlockstore {
    fn query_keys(&self) -> BoxStream<'static, Result<String>> {
        let keys: Result<Vec<String>> = self
            .blocks
            .read()
            .map(|b| b.keys().cloned().collect())
            .map_err(|_| Self::poisoned());

        match keys {
            Ok(keys) => stream::iter(keys.into_iter().map(Ok)).boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        }
    }

    async fn get(&self, cid: &Cid) -> Result<Vec<u8>> {
        let blocks = self.blocks.read().map_err(|_| Self::poisoned())?;
        blocks
            .get(&normalize(cid))
            .cloned()
            .ok_or_else(|| Error::block_not_found(cid.to_string()))
    }

    async fn put(&self, cid: &Cid, data: &[u8]) -> Result<()> {
        let mut blocks = self.blocks.write().map_err(|_| Self::poisoned())?;
        blocks
            .entry(normalize(cid))
            .or_insert_with(|| data.to_vec());
        Ok(())
    }

    async fn has(&self, cid: &Cid) -> Result<bool> {
        let blocks = self.blocks.read().map_err(|_| Self::poisoned())?;
        Ok(blocks.contains_key(&normalize(cid)))
    }

    async fn delete(&self, cid: &Cid) -> Result<()> {
        let mut blocks = self.blocks.write().map_err(|_| Self::poisoned())?;
        blocks
            .remove(&normalize(cid))
            .map(|_| ())
            .ok_or_else(|| Error::block_not_found(cid.to_string()))
    }
}
