//! Pin management.
//!
//! Pins are GC roots. A recursive pin keeps a block and everything it links
//! to; a direct pin keeps only the block itself. The pin set is persisted as
//! a `dag-json` node in the blockstore (one link per pin, named after its
//! mode), and the datastore's [`PIN_ROOT_KEY`] points at the current node.
//! That node is the pinning subsystem's internal block: it must survive GC
//! even though no pin references it.

use crate::blockstore::Blockstore;
use crate::dag::{DagWalker, Link, Node};
use crate::datastore::{PIN_ROOT_KEY, RootStore};
use crate::error::{Error, Result};
use crate::hash::{Algorithm, Codec, block_cid};
use crate::key::{cid_from_bytes, normalize};
use async_trait::async_trait;
use cid::Cid;
use futures::future;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Payload marking a node as a pin set.
const PIN_SET_DATA: &str = "pinset/v1";

/// How a CID is pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    /// Pin the block and everything reachable from it.
    Recursive,
    /// Pin only the block itself.
    Direct,
}

impl PinMode {
    fn link_name(&self) -> &'static str {
        match self {
            PinMode::Recursive => "recursive",
            PinMode::Direct => "direct",
        }
    }
}

/// Why a listed CID is pinned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinType {
    /// Root of a recursive pin.
    Recursive,
    /// Direct pin.
    Direct,
    /// Reachable from a recursive pin.
    Indirect,
}

impl PinType {
    /// Returns the type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PinType::Recursive => "recursive",
            PinType::Direct => "direct",
            PinType::Indirect => "indirect",
        }
    }
}

impl fmt::Display for PinType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which pins to list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PinFilter {
    /// Every pinned block, including indirect ones.
    #[default]
    All,
    /// Recursive roots only.
    Recursive,
    /// Direct pins only.
    Direct,
    /// Blocks pinned only through a recursive pin.
    Indirect,
}

impl PinFilter {
    /// Parse a filter name.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "all" => Ok(PinFilter::All),
            "recursive" => Ok(PinFilter::Recursive),
            "direct" => Ok(PinFilter::Direct),
            "indirect" => Ok(PinFilter::Indirect),
            _ => Err(Error::invalid_config(format!("unknown pin type: {s}"))),
        }
    }
}

/// A listed pin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pin {
    /// Pinned block.
    pub cid: Cid,
    /// Why it is pinned.
    pub pin_type: PinType,
}

impl Pin {
    fn new(cid: Cid, pin_type: PinType) -> Self {
        Self { cid, pin_type }
    }
}

/// Source of pinned CIDs for the mark phase.
#[async_trait]
pub trait PinSource: Send + Sync + 'static {
    /// Every pinned CID: recursive roots, their descendants, and direct pins.
    fn ls(&self) -> BoxStream<'static, Result<Cid>>;

    /// Blocks the pinning subsystem stores its own state in.
    async fn internal_blocks(&self) -> Result<Vec<Cid>>;
}

/// The persisted pin set, keyed by normalized CID.
#[derive(Debug, Default)]
struct PinSet {
    recursive: BTreeMap<String, Cid>,
    direct: BTreeMap<String, Cid>,
}

impl PinSet {
    async fn load(blocks: &dyn Blockstore, roots: &dyn RootStore) -> Result<Self> {
        let Some(root) = Self::root(roots).await? else {
            return Ok(Self::default());
        };

        let data = blocks.get(&root).await?;
        let node = Node::decode(&root, &data)?;
        if node.data.as_deref() != Some(PIN_SET_DATA) {
            return Err(Error::invalid_node(root.to_string(), "not a pin set"));
        }

        let mut set = Self::default();
        for link in node.links {
            let key = normalize(&link.cid);
            match link.name.as_str() {
                "recursive" => set.recursive.insert(key, link.cid),
                "direct" => set.direct.insert(key, link.cid),
                other => {
                    return Err(Error::invalid_node(
                        root.to_string(),
                        format!("unknown pin mode: {other}"),
                    ));
                }
            };
        }

        Ok(set)
    }

    async fn root(roots: &dyn RootStore) -> Result<Option<Cid>> {
        match roots.get(PIN_ROOT_KEY).await {
            Ok(bytes) => Ok(Some(cid_from_bytes(&bytes)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn to_node(&self) -> Node {
        let links = self
            .recursive
            .values()
            .map(|cid| Link::new(PinMode::Recursive.link_name(), *cid))
            .chain(
                self.direct
                    .values()
                    .map(|cid| Link::new(PinMode::Direct.link_name(), *cid)),
            )
            .collect();

        Node {
            data: Some(PIN_SET_DATA.to_string()),
            links,
        }
    }

    fn insert(&mut self, cid: &Cid, mode: PinMode) {
        let key = normalize(cid);
        match mode {
            PinMode::Recursive => {
                self.direct.remove(&key);
                self.recursive.insert(key, *cid);
            }
            PinMode::Direct => {
                self.recursive.remove(&key);
                self.direct.insert(key, *cid);
            }
        }
    }

    fn remove(&mut self, cid: &Cid) -> bool {
        let key = normalize(cid);
        self.recursive.remove(&key).is_some() | self.direct.remove(&key).is_some()
    }
}

/// Manages the repository's pins.
pub struct PinManager {
    blocks: Arc<dyn Blockstore>,
    roots: Arc<dyn RootStore>,
    walker: Arc<dyn DagWalker>,
    algorithm: Algorithm,
    /// Serializes read-modify-write updates of the pin set.
    update: Mutex<()>,
}

impl PinManager {
    /// Create a pin manager over the given stores.
    pub fn new(
        blocks: Arc<dyn Blockstore>,
        roots: Arc<dyn RootStore>,
        walker: Arc<dyn DagWalker>,
        algorithm: Algorithm,
    ) -> Self {
        Self {
            blocks,
            roots,
            walker,
            algorithm,
            update: Mutex::new(()),
        }
    }

    /// Pin a block.
    ///
    /// The block must be present; for recursive pins, every block reachable
    /// from it must be present too. Re-pinning with a different mode
    /// replaces the previous mode.
    pub async fn add(&self, cid: &Cid, mode: PinMode) -> Result<()> {
        if !self.blocks.has(cid).await? {
            return Err(Error::block_not_found(cid.to_string()));
        }

        if mode == PinMode::Recursive {
            self.walker
                .refs(*cid, true)
                .try_for_each(|_| future::ready(Ok(())))
                .await?;
        }

        let _update = self.update.lock().await;
        let mut set = PinSet::load(self.blocks.as_ref(), self.roots.as_ref()).await?;
        set.insert(cid, mode);
        self.save(&set).await?;

        debug!(cid = %cid, mode = mode.link_name(), "pinned");
        Ok(())
    }

    /// Remove a pin of either mode.
    ///
    /// Returns `Error::NotPinned` if the CID is not a recursive or direct pin.
    pub async fn rm(&self, cid: &Cid) -> Result<()> {
        let _update = self.update.lock().await;
        let mut set = PinSet::load(self.blocks.as_ref(), self.roots.as_ref()).await?;
        if !set.remove(cid) {
            return Err(Error::not_pinned(cid.to_string()));
        }
        self.save(&set).await?;

        debug!(cid = %cid, "unpinned");
        Ok(())
    }

    /// Returns why a CID is pinned, if it is.
    pub async fn is_pinned(&self, cid: &Cid) -> Result<Option<PinType>> {
        let key = normalize(cid);
        let set = PinSet::load(self.blocks.as_ref(), self.roots.as_ref()).await?;

        if set.recursive.contains_key(&key) {
            return Ok(Some(PinType::Recursive));
        }
        if set.direct.contains_key(&key) {
            return Ok(Some(PinType::Direct));
        }

        for root in set.recursive.values() {
            let mut refs = self.walker.refs(*root, true);
            while let Some(child) = refs.try_next().await? {
                if normalize(&child) == key {
                    return Ok(Some(PinType::Indirect));
                }
            }
        }

        Ok(None)
    }

    /// List pins matching `filter`. Each CID is listed once.
    pub fn ls_pins(&self, filter: PinFilter) -> BoxStream<'static, Result<Pin>> {
        let blocks = Arc::clone(&self.blocks);
        let roots = Arc::clone(&self.roots);
        let walker = Arc::clone(&self.walker);

        stream::once(async move { PinSet::load(blocks.as_ref(), roots.as_ref()).await })
            .map_ok(move |set| pin_stream(set, Arc::clone(&walker), filter))
            .try_flatten()
            .boxed()
    }

    async fn save(&self, set: &PinSet) -> Result<()> {
        let bytes = set.to_node().encode()?;
        let root = block_cid(self.algorithm, Codec::DagJson, &bytes)?;
        self.blocks.put(&root, &bytes).await?;
        self.roots.put(PIN_ROOT_KEY, &root.to_bytes()).await
    }
}

/// Build the listing for a loaded pin set.
///
/// Recursive roots come first so that a root reachable from another
/// recursive pin is reported as recursive rather than indirect.
fn pin_stream(
    set: PinSet,
    walker: Arc<dyn DagWalker>,
    filter: PinFilter,
) -> BoxStream<'static, Result<Pin>> {
    let PinSet { recursive, direct } = set;
    let mut seen: HashSet<String> = HashSet::new();
    let mut parts: Vec<BoxStream<'static, Result<Pin>>> = Vec::new();

    let roots: Vec<Cid> = recursive.values().copied().collect();

    if matches!(filter, PinFilter::All | PinFilter::Recursive) {
        parts.push(
            stream::iter(
                roots
                    .clone()
                    .into_iter()
                    .map(|cid| Ok(Pin::new(cid, PinType::Recursive))),
            )
            .boxed(),
        );
    }

    if matches!(filter, PinFilter::All | PinFilter::Indirect) {
        if filter == PinFilter::Indirect {
            seen.extend(recursive.keys().cloned());
        }
        parts.push(
            stream::iter(roots)
                .map(move |root| walker.refs(root, true))
                .flatten()
                .map_ok(|cid| Pin::new(cid, PinType::Indirect))
                .boxed(),
        );
    }

    if matches!(filter, PinFilter::All | PinFilter::Direct) {
        parts.push(
            stream::iter(
                direct
                    .into_values()
                    .map(|cid| Ok(Pin::new(cid, PinType::Direct))),
            )
            .boxed(),
        );
    }

    stream::iter(parts)
        .flatten()
        .try_filter(move |pin| future::ready(seen.insert(normalize(&pin.cid))))
        .boxed()
}

#[async_trait]
impl PinSource for PinManager {
    fn ls(&self) -> BoxStream<'static, Result<Cid>> {
        self.ls_pins(PinFilter::All).map_ok(|pin| pin.cid).boxed()
    }

    async fn internal_blocks(&self) -> Result<Vec<Cid>> {
        Ok(PinSet::root(self.roots.as_ref()).await?.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::MemoryBlockstore;
    use crate::dag::Refs;
    use crate::datastore::MemoryDatastore;

    struct Fixture {
        blocks: MemoryBlockstore,
        pins: PinManager,
    }

    fn fixture() -> Fixture {
        let blocks = MemoryBlockstore::new();
        let store: Arc<dyn Blockstore> = Arc::new(blocks.clone());
        let pins = PinManager::new(
            Arc::clone(&store),
            Arc::new(MemoryDatastore::new()),
            Arc::new(Refs::new(store)),
            Algorithm::Blake3,
        );
        Fixture { blocks, pins }
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

    async fn listed(pins: &PinManager, filter: PinFilter) -> Vec<(String, PinType)> {
        let mut out: Vec<(String, PinType)> = pins
            .ls_pins(filter)
            .map_ok(|pin| (normalize(&pin.cid), pin.pin_type))
            .try_collect()
            .await
            .unwrap();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    #[tokio::test]
    async fn test_empty_pin_set() {
        let f = fixture();
        assert!(listed(&f.pins, PinFilter::All).await.is_empty());
        assert!(f.pins.internal_blocks().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_recursive_lists_indirect() {
        let f = fixture();
        let leaf = put_raw(&f.blocks, b"leaf").await;
        let root = put_node(&f.blocks, vec![Link::new("leaf", leaf)]).await;

        f.pins.add(&root, PinMode::Recursive).await.unwrap();

        let all = listed(&f.pins, PinFilter::All).await;
        assert_eq!(all.len(), 2);
        assert!(all.contains(&(normalize(&root), PinType::Recursive)));
        assert!(all.contains(&(normalize(&leaf), PinType::Indirect)));

        let indirect = listed(&f.pins, PinFilter::Indirect).await;
        assert_eq!(indirect, vec![(normalize(&leaf), PinType::Indirect)]);

        let cids: Vec<Cid> = f.pins.ls().try_collect().await.unwrap();
        assert_eq!(cids.len(), 2);
    }

    #[tokio::test]
    async fn test_direct_pin_does_not_cover_children() {
        let f = fixture();
        let leaf = put_raw(&f.blocks, b"leaf").await;
        let root = put_node(&f.blocks, vec![Link::new("leaf", leaf)]).await;

        f.pins.add(&root, PinMode::Direct).await.unwrap();

        let all = listed(&f.pins, PinFilter::All).await;
        assert_eq!(all, vec![(normalize(&root), PinType::Direct)]);
        assert_eq!(f.pins.is_pinned(&leaf).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_mode_switch_replaces() {
        let f = fixture();
        let cid = put_raw(&f.blocks, b"x").await;

        f.pins.add(&cid, PinMode::Direct).await.unwrap();
        f.pins.add(&cid, PinMode::Recursive).await.unwrap();

        assert!(listed(&f.pins, PinFilter::Direct).await.is_empty());
        assert_eq!(
            f.pins.is_pinned(&cid).await.unwrap(),
            Some(PinType::Recursive)
        );
    }

    #[tokio::test]
    async fn test_rm() {
        let f = fixture();
        let cid = put_raw(&f.blocks, b"x").await;

        f.pins.add(&cid, PinMode::Recursive).await.unwrap();
        f.pins.rm(&cid).await.unwrap();
        assert!(listed(&f.pins, PinFilter::All).await.is_empty());

        assert!(matches!(
            f.pins.rm(&cid).await,
            Err(Error::NotPinned { .. })
        ));
    }

    #[tokio::test]
    async fn test_add_missing_block_fails() {
        let f = fixture();
        let cid = block_cid(Algorithm::Blake3, Codec::Raw, b"absent").unwrap();
        assert!(matches!(
            f.pins.add(&cid, PinMode::Direct).await,
            Err(Error::BlockNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_add_recursive_with_missing_descendant_fails() {
        let f = fixture();
        let missing = block_cid(Algorithm::Blake3, Codec::DagJson, b"gone").unwrap();
        let root = put_node(&f.blocks, vec![Link::new("gone", missing)]).await;

        assert!(f.pins.add(&root, PinMode::Recursive).await.is_err());
        assert!(listed(&f.pins, PinFilter::All).await.is_empty());
    }

    #[tokio::test]
    async fn test_internal_blocks_tracks_current_pin_set() {
        let f = fixture();
        let a = put_raw(&f.blocks, b"a").await;
        let b = put_raw(&f.blocks, b"b").await;

        f.pins.add(&a, PinMode::Direct).await.unwrap();
        let first = f.pins.internal_blocks().await.unwrap();
        assert_eq!(first.len(), 1);
        assert!(f.blocks.has(&first[0]).await.unwrap());

        f.pins.add(&b, PinMode::Direct).await.unwrap();
        let second = f.pins.internal_blocks().await.unwrap();
        assert_eq!(second.len(), 1);
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn test_recursive_root_under_other_root_listed_once() {
        let f = fixture();
        let inner = put_raw(&f.blocks, b"inner").await;
        let outer = put_node(&f.blocks, vec![Link::new("inner", inner)]).await;

        f.pins.add(&outer, PinMode::Recursive).await.unwrap();
        f.pins.add(&inner, PinMode::Recursive).await.unwrap();

        let all = listed(&f.pins, PinFilter::All).await;
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|(_, t)| *t == PinType::Recursive));
        assert!(listed(&f.pins, PinFilter::Indirect).await.is_empty());
    }

    #[test]
    fn test_pin_filter_parse() {
        assert_eq!(PinFilter::parse("all").unwrap(), PinFilter::All);
        assert_eq!(PinFilter::parse("indirect").unwrap(), PinFilter::Indirect);
        assert!(PinFilter::parse("sometimes").is_err());
    }
}
