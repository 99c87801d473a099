//! Mark phase: compute the set of live block keys.
//!
//! Three sources are drained concurrently into one set:
//!
//! 1. every pinned CID (recursive roots, their descendants, direct pins),
//! 2. the pinning subsystem's internal blocks,
//! 3. the MFS root and everything reachable from it.
//!
//! Each source runs as its own future pushing normalized keys into a shared
//! channel; a collector drains the channel into the set. The first source to
//! fail aborts the others, and the whole phase fails.

use crate::dag::DagWalker;
use crate::datastore::{MFS_ROOT_KEY, RootStore};
use crate::error::{Error, Result};
use crate::key::{MarkedSet, cid_from_bytes, normalize};
use crate::pins::PinSource;
use cid::Cid;
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::HashSet;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Capacity of the fan-in channel between sources and the collector.
const MARK_CHANNEL_CAPACITY: usize = 1024;

/// Look up the MFS root.
///
/// A missing key means the repository has no MFS yet and is not an error.
pub(crate) async fn mfs_root(roots: &dyn RootStore) -> Result<Option<Cid>> {
    match roots.get(MFS_ROOT_KEY).await {
        Ok(bytes) => Ok(Some(cid_from_bytes(&bytes)?)),
        Err(e) if e.is_not_found() => {
            debug!("no MFS root; nothing reachable from MFS");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Push every CID of `source` into the fan-in channel.
///
/// Returns the number of CIDs seen.
async fn drain(
    phase: &'static str,
    mut source: BoxStream<'static, Result<Cid>>,
    tx: mpsc::Sender<String>,
) -> Result<u64> {
    let mut count = 0u64;
    while let Some(item) = source.next().await {
        let cid = item.map_err(|e| Error::mark_phase(phase, e))?;
        count += 1;
        if tx.send(normalize(&cid)).await.is_err() {
            // collector gone: the phase is already being torn down
            return Err(Error::task("mark set collector stopped"));
        }
    }
    debug!(phase, count, "source drained");
    Ok(count)
}

/// Build the marked set from all liveness sources.
pub(crate) async fn build_marked_set(
    pins: &dyn PinSource,
    roots: &dyn RootStore,
    walker: &dyn DagWalker,
) -> Result<MarkedSet> {
    let started = Instant::now();
    let (tx, mut rx) = mpsc::channel::<String>(MARK_CHANNEL_CAPACITY);

    let pinned = drain("pins", pins.ls(), tx.clone());

    let internal_tx = tx.clone();
    let internal = async move {
        let blocks = pins
            .internal_blocks()
            .await
            .map_err(|e| Error::mark_phase("internal pin blocks", e))?;
        drain(
            "internal pin blocks",
            stream::iter(blocks.into_iter().map(Ok)).boxed(),
            internal_tx,
        )
        .await
    };

    let mfs_tx = tx;
    let mfs = async move {
        let Some(root) = mfs_root(roots)
            .await
            .map_err(|e| Error::mark_phase("mfs root", e))?
        else {
            return Ok(0);
        };
        let reachable = stream::once(async move { Ok(root) })
            .chain(walker.refs(root, true))
            .boxed();
        drain("mfs", reachable, mfs_tx).await
    };

    let collect = async move {
        let mut keys = HashSet::new();
        while let Some(key) = rx.recv().await {
            keys.insert(key);
        }
        Ok::<_, Error>(keys)
    };

    let (pinned, internal, mfs, keys) = tokio::try_join!(pinned, internal, mfs, collect)?;

    info!(
        pinned,
        internal,
        mfs,
        marked = keys.len(),
        duration_ms = started.elapsed().as_millis() as u64,
        "mark phase complete"
    );

    Ok(MarkedSet::new(keys))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::{Blockstore, MemoryBlockstore};
    use crate::dag::{Link, Node, Refs};
    use crate::datastore::MemoryDatastore;
    use crate::hash::{Algorithm, Codec, block_cid};
    use crate::pins::{PinManager, PinMode};
    use crate::testing::{FailingPins, FailingRootStore, StaticPins};
    use std::sync::Arc;

    struct Fixture {
        blocks: MemoryBlockstore,
        roots: MemoryDatastore,
        walker: Refs,
        pins: PinManager,
    }

    fn fixture() -> Fixture {
        let blocks = MemoryBlockstore::new();
        let roots = MemoryDatastore::new();
        let store: Arc<dyn Blockstore> = Arc::new(blocks.clone());
        let walker = Refs::new(Arc::clone(&store));
        let pins = PinManager::new(
            store,
            Arc::new(roots.clone()),
            Arc::new(walker.clone()),
            Algorithm::Blake3,
        );
        Fixture {
            blocks,
            roots,
            walker,
            pins,
        }
    }

    async fn put_raw(blocks: &MemoryBlockstore, data: &[u8]) -> Cid {
        let cid = block_cid(Algorithm::Blake3, Codec::Raw, data).unwrap();
        blocks.put(&cid, data).await.unwrap();
        cid
    }

    async fn put_node(blocks: &MemoryBlockstore, links: Vec<Link>) -> Cid {
        let bytes = Node::with_links(links).encode().unwrap();
        let cid = block_cid(Algorithm::Blake3, Codec::DagJson, &bytes).unwrap();
        blocks.put(&cid, &bytes).await.unwrap();
        cid
    }

    #[tokio::test]
    async fn test_empty_repo_marks_nothing() {
        let f = fixture();
        let marked = build_marked_set(&f.pins, &f.roots, &f.walker).await.unwrap();
        assert!(marked.is_empty());
    }

    #[tokio::test]
    async fn test_marks_pins_internal_and_mfs() {
        let f = fixture();
        let pinned_leaf = put_raw(&f.blocks, b"pinned leaf").await;
        let pinned_root = put_node(&f.blocks, vec![Link::new("l", pinned_leaf)]).await;
        let mfs_leaf = put_raw(&f.blocks, b"mfs leaf").await;
        let mfs_root = put_node(&f.blocks, vec![Link::new("f", mfs_leaf)]).await;
        let garbage = put_raw(&f.blocks, b"garbage").await;

        f.pins.add(&pinned_root, PinMode::Recursive).await.unwrap();
        f.roots.put(MFS_ROOT_KEY, &mfs_root.to_bytes()).await.unwrap();

        let marked = build_marked_set(&f.pins, &f.roots, &f.walker).await.unwrap();

        assert!(marked.contains(&pinned_root));
        assert!(marked.contains(&pinned_leaf));
        assert!(marked.contains(&mfs_root));
        assert!(marked.contains(&mfs_leaf));
        for internal in f.pins.internal_blocks().await.unwrap() {
            assert!(marked.contains(&internal));
        }
        assert!(!marked.contains(&garbage));
        assert_eq!(marked.len(), 5);
    }

    #[tokio::test]
    async fn test_shared_blocks_counted_once() {
        let f = fixture();
        let shared = put_raw(&f.blocks, b"shared").await;
        let root = put_node(&f.blocks, vec![Link::new("s", shared)]).await;

        f.pins.add(&shared, PinMode::Direct).await.unwrap();
        f.roots.put(MFS_ROOT_KEY, &root.to_bytes()).await.unwrap();

        let marked = build_marked_set(&f.pins, &f.roots, &f.walker).await.unwrap();
        // root, shared, pin-set node
        assert_eq!(marked.len(), 3);
    }

    #[tokio::test]
    async fn test_pin_failure_is_fatal() {
        let f = fixture();
        let err = build_marked_set(&FailingPins, &f.roots, &f.walker)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MarkPhase { phase: "pins", .. }));
    }

    #[tokio::test]
    async fn test_mfs_lookup_failure_is_fatal() {
        let f = fixture();
        let pins = StaticPins::default();
        let err = build_marked_set(&pins, &FailingRootStore, &f.walker)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MarkPhase { phase: "mfs root", .. }));
    }

    #[tokio::test]
    async fn test_missing_mfs_descendant_is_fatal() {
        let f = fixture();
        let missing = block_cid(Algorithm::Blake3, Codec::DagJson, b"gone").unwrap();
        let root = put_node(&f.blocks, vec![Link::new("gone", missing)]).await;
        f.roots.put(MFS_ROOT_KEY, &root.to_bytes()).await.unwrap();

        let err = build_marked_set(&f.pins, &f.roots, &f.walker)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MarkPhase { phase: "mfs", .. }));
    }

    #[tokio::test]
    async fn test_static_sources_normalized() {
        let f = fixture();
        let digest = [5u8; 32];
        let v0 = Cid::new_v0(
            crate::hash::Multihash::wrap(crate::hash::SHA2_256, &digest).unwrap(),
        )
        .unwrap();
        let pins = StaticPins {
            pinned: vec![v0],
            internal: Vec::new(),
        };

        let marked = build_marked_set(&pins, &f.roots, &f.walker).await.unwrap();
        let v1 = Cid::new_v1(Codec::DAG_PB, *v0.hash());
        assert!(marked.contains_key(&v1.to_string()));
    }
}
