//! # blockgc core
//!
//! Mark-and-sweep garbage collection for a content-addressed block
//! repository.
//!
//! A repository stores immutable blocks keyed by CID. Blocks stay alive when
//! they are pinned, reachable from a recursive pin, used by the pinning
//! subsystem itself, or reachable from the MFS root. Everything else is
//! garbage. A GC run holds the repository's [`GcLock`] exclusively while it
//! marks the live set and sweeps the rest, so no mutator can add a block or
//! move a root underneath it.
//!
//! ## Example
//!
//! ```no_run
//! use blockgc_core::{Codec, GcConfig, PinMode, Repo, RepoConfig};
//!
//! # async fn demo() -> blockgc_core::Result<()> {
//! let repo = Repo::init("./my-repo", RepoConfig::default())?;
//!
//! let keep = repo.put_block(Codec::Raw, b"keep me").await?;
//! repo.put_block(Codec::Raw, b"garbage").await?;
//! repo.pin_add(&keep, PinMode::Recursive).await?;
//!
//! let report = repo.gc_collect(GcConfig::default()).await?;
//! println!("deleted {} blocks", report.stats.deleted);
//! # Ok(())
//! # }
//! ```

mod blockstore;
mod config;
mod dag;
mod datastore;
mod error;
mod gc;
mod hash;
mod key;
mod lock;
mod pins;
mod repo;

#[cfg(test)]
mod testing;

pub use blockstore::{Blockstore, FsBlockstore, MemoryBlockstore};
pub use config::{
    DEFAULT_GC_CONCURRENCY, DEFAULT_GC_RESULT_BUFFER, GC_CONCURRENCY_ENV, GC_RESULT_BUFFER_ENV,
    GcConfig, RepoConfig,
};
pub use dag::{DagWalker, Link, Node, Refs, links_of};
pub use datastore::{Datastore, MFS_ROOT_KEY, MemoryDatastore, PIN_ROOT_KEY, RootStore};
pub use error::{Error, Result};
pub use gc::{DeletionResult, GarbageCollector, GcReport, GcStats, GcStream};
pub use hash::{Algorithm, BLAKE3_256, Codec, HASH_SIZE, Multihash, SHA2_256, block_cid};
pub use key::{MarkedSet, cid_from_bytes, normalize, parse_key};
pub use lock::{GcLock, GcReadGuard, GcWriteGuard};
pub use pins::{Pin, PinFilter, PinManager, PinMode, PinSource, PinType};
pub use repo::Repo;

pub use cid::Cid;
