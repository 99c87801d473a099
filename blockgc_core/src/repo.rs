//! Repository: blocks, pins and the MFS root behind one GC lock.

use crate::blockstore::{Blockstore, FsBlockstore};
use crate::config::{GcConfig, RepoConfig};
use crate::dag::{DagWalker, Node, Refs};
use crate::datastore::{Datastore, MFS_ROOT_KEY, RootStore};
use crate::error::{Error, Result};
use crate::gc::{GarbageCollector, GcReport, GcStream, mfs_root};
use crate::hash::{Codec, block_cid};
use crate::lock::GcLock;
use crate::pins::{Pin, PinFilter, PinManager, PinMode, PinType};
use cid::Cid;
use futures::stream::BoxStream;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const CONFIG_FILE: &str = "config";
const BLOCKS_DIR: &str = "blocks";
const DATASTORE_DIR: &str = "datastore";
const LOCK_FILE: &str = "repo.lock";

/// An opened repository.
///
/// Every mutating operation holds the shared side of the repository's
/// [`GcLock`] for its duration, so none of them can interleave with a GC
/// run. The lock is backed by `<root>/repo.lock`, which also orders handles
/// opened separately on the same directory. Reads do not take the lock.
pub struct Repo {
    root: PathBuf,
    config: RepoConfig,
    blocks: Arc<FsBlockstore>,
    roots: Arc<Datastore>,
    walker: Arc<Refs>,
    pins: Arc<PinManager>,
    lock: GcLock,
}

impl Repo {
    /// Initialize a new repository at the given path.
    ///
    /// Creates the directory structure and writes the config file.
    pub fn init<P: AsRef<Path>>(root: P, config: RepoConfig) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let config_path = root.join(CONFIG_FILE);
        if config_path.exists() {
            return Err(Error::invalid_repo(&root, "repository already initialized"));
        }

        fs::create_dir_all(root.join(BLOCKS_DIR))?;
        fs::create_dir_all(root.join(DATASTORE_DIR))?;
        fs::write(&config_path, config.render())?;

        Self::assemble(root, config)
    }

    /// Open an existing repository.
    ///
    /// Validates the layout and reads the configuration.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        if !root.exists() {
            return Err(Error::invalid_repo(&root, "directory does not exist"));
        }

        let config_path = root.join(CONFIG_FILE);
        if !config_path.exists() {
            return Err(Error::invalid_repo(&root, "config file not found"));
        }
        let config = RepoConfig::parse(&fs::read_to_string(&config_path)?)?;

        if !root.join(BLOCKS_DIR).is_dir() {
            return Err(Error::invalid_repo(&root, "blocks directory missing"));
        }
        if !root.join(DATASTORE_DIR).is_dir() {
            return Err(Error::invalid_repo(&root, "datastore directory missing"));
        }

        Self::assemble(root, config)
    }

    fn assemble(root: PathBuf, config: RepoConfig) -> Result<Self> {
        let blocks = Arc::new(FsBlockstore::open(root.join(BLOCKS_DIR))?);
        let roots = Arc::new(Datastore::open(root.join(DATASTORE_DIR))?);
        let walker = Arc::new(Refs::new(blocks.clone()));
        let pins = Arc::new(PinManager::new(
            blocks.clone(),
            roots.clone(),
            walker.clone(),
            config.algorithm,
        ));

        Ok(Self {
            lock: GcLock::with_file(root.join(LOCK_FILE)),
            root,
            config,
            blocks,
            roots,
            walker,
            pins,
        })
    }

    /// Repository root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// The lock coordinating GC against mutators.
    pub fn lock(&self) -> &GcLock {
        &self.lock
    }

    /// Store a block and return its CID.
    pub async fn put_block(&self, codec: Codec, data: &[u8]) -> Result<Cid> {
        let cid = block_cid(self.config.algorithm, codec, data)?;
        if codec == Codec::DagJson {
            // reject nodes the walker could not follow
            Node::decode(&cid, data)?;
        }

        let _guard = self.lock.read_lock().await?;
        self.blocks.put(&cid, data).await?;
        debug!(cid = %cid, size = data.len(), "stored block");
        Ok(cid)
    }

    /// Encode and store a `dag-json` node.
    pub async fn put_node(&self, node: &Node) -> Result<Cid> {
        self.put_block(Codec::DagJson, &node.encode()?).await
    }

    pub async fn get_block(&self, cid: &Cid) -> Result<Vec<u8>> {
        self.blocks.get(cid).await
    }

    pub async fn has_block(&self, cid: &Cid) -> Result<bool> {
        self.blocks.has(cid).await
    }

    /// Delete a block that is not pinned.
    ///
    /// Returns `Error::Pinned` for directly, recursively or indirectly
    /// pinned blocks.
    pub async fn remove_block(&self, cid: &Cid) -> Result<()> {
        let _guard = self.lock.read_lock().await?;
        if let Some(pin_type) = self.pins.is_pinned(cid).await? {
            return Err(Error::pinned(format!("{cid} ({pin_type})")));
        }
        self.blocks.delete(cid).await
    }

    pub async fn pin_add(&self, cid: &Cid, mode: PinMode) -> Result<()> {
        let _guard = self.lock.read_lock().await?;
        self.pins.add(cid, mode).await
    }

    pub async fn pin_rm(&self, cid: &Cid) -> Result<()> {
        let _guard = self.lock.read_lock().await?;
        self.pins.rm(cid).await
    }

    pub async fn is_pinned(&self, cid: &Cid) -> Result<Option<PinType>> {
        self.pins.is_pinned(cid).await
    }

    /// List pins matching `filter`.
    pub fn pins(&self, filter: PinFilter) -> BoxStream<'static, Result<Pin>> {
        self.pins.ls_pins(filter)
    }

    /// Point the MFS root at an existing block.
    pub async fn set_files_root(&self, cid: &Cid) -> Result<()> {
        let _guard = self.lock.read_lock().await?;
        if !self.blocks.has(cid).await? {
            return Err(Error::block_not_found(cid.to_string()));
        }
        self.roots.put(MFS_ROOT_KEY, &cid.to_bytes()).await?;
        debug!(cid = %cid, "set MFS root");
        Ok(())
    }

    /// Current MFS root, if one has been set.
    pub async fn files_root(&self) -> Result<Option<Cid>> {
        mfs_root(self.roots.as_ref()).await
    }

    /// CIDs linked from `cid`; every reachable CID when `recursive`.
    pub fn refs(&self, cid: Cid, recursive: bool) -> BoxStream<'static, Result<Cid>> {
        self.walker.refs(cid, recursive)
    }

    /// Start a GC run with the repository's configured settings and any
    /// environment overrides.
    pub async fn gc(&self) -> Result<GcStream> {
        self.gc_with(self.config.gc.with_env_overrides()).await
    }

    /// Start a GC run with explicit settings.
    pub async fn gc_with(&self, config: GcConfig) -> Result<GcStream> {
        self.collector(config).run().await
    }

    /// Run GC to completion and collect every result.
    pub async fn gc_collect(&self, config: GcConfig) -> Result<GcReport> {
        self.collector(config).run_to_end().await
    }

    fn collector(&self, config: GcConfig) -> GarbageCollector {
        GarbageCollector::new(
            self.blocks.clone(),
            self.pins.clone(),
            self.roots.clone(),
            self.walker.clone(),
            self.lock.clone(),
        )
        .with_config(config)
    }
}
