//! DAG nodes and link traversal.
//!
//! Blocks are either `raw` (leaves, no links) or `dag-json` nodes:
//!
//! ```json
//! {"data": "optional payload", "links": [{"name": "child", "cid": "bafy..."}]}
//! ```

use crate::blockstore::Blockstore;
use crate::error::{Error, Result};
use crate::hash::Codec;
use crate::key::{normalize, parse_key};
use cid::Cid;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

/// A named link to another block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Link name (may be empty).
    #[serde(default)]
    pub name: String,
    /// Target block.
    #[serde(with = "cid_string")]
    pub cid: Cid,
}

impl Link {
    /// Create a new link.
    pub fn new(name: impl Into<String>, cid: Cid) -> Self {
        Self {
            name: name.into(),
            cid,
        }
    }
}

/// A `dag-json` node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Optional inline payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    /// Outgoing links, in insertion order.
    #[serde(default)]
    pub links: Vec<Link>,
}

impl Node {
    /// Create a node with the given links and no payload.
    pub fn with_links(links: Vec<Link>) -> Self {
        Self { data: None, links }
    }

    /// Encode to canonical bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a node stored under `cid`.
    pub fn decode(cid: &Cid, data: &[u8]) -> Result<Self> {
        serde_json::from_slice(data).map_err(|e| Error::invalid_node(cid.to_string(), e.to_string()))
    }
}

/// Extract the outgoing links of a block according to its codec.
pub fn links_of(cid: &Cid, data: &[u8]) -> Result<Vec<Cid>> {
    match Codec::from_code(cid.codec())? {
        Codec::Raw => Ok(Vec::new()),
        Codec::DagJson => Ok(Node::decode(cid, data)?
            .links
            .into_iter()
            .map(|link| link.cid)
            .collect()),
    }
}

/// Enumerates the blocks reachable from a root.
pub trait DagWalker: Send + Sync + 'static {
    /// Stream the CIDs linked from `root`: direct children only, or every
    /// descendant when `recursive` is set. The root itself is not yielded,
    /// and each block is yielded once per walk.
    ///
    /// A block that cannot be loaded ends the stream with an error.
    fn refs(&self, root: Cid, recursive: bool) -> BoxStream<'static, Result<Cid>>;
}

/// Breadth-first link walker over a blockstore.
#[derive(Clone)]
pub struct Refs {
    store: Arc<dyn Blockstore>,
}

impl Refs {
    /// Create a walker reading from `store`.
    pub fn new(store: Arc<dyn Blockstore>) -> Self {
        Self { store }
    }
}

struct WalkState {
    store: Arc<dyn Blockstore>,
    recursive: bool,
    /// Blocks whose links have not been read yet.
    expand: VecDeque<Cid>,
    /// Discovered blocks not yet yielded.
    ready: VecDeque<Cid>,
    seen: HashSet<String>,
}

impl DagWalker for Refs {
    fn refs(&self, root: Cid, recursive: bool) -> BoxStream<'static, Result<Cid>> {
        let mut seen = HashSet::new();
        seen.insert(normalize(&root));

        let state = WalkState {
            store: Arc::clone(&self.store),
            recursive,
            expand: VecDeque::from([root]),
            ready: VecDeque::new(),
            seen,
        };

        stream::try_unfold(state, |mut state| async move {
            loop {
                if let Some(cid) = state.ready.pop_front() {
                    return Ok::<_, Error>(Some((cid, state)));
                }

                let Some(parent) = state.expand.pop_front() else {
                    return Ok(None);
                };

                let data = state.store.get(&parent).await?;
                for child in links_of(&parent, &data)? {
                    if !state.seen.insert(normalize(&child)) {
                        continue;
                    }
                    // raw blocks carry no links
                    if state.recursive && child.codec() != Codec::RAW {
                        state.expand.push_back(child);
                    }
                    state.ready.push_back(child);
                }
            }
        })
        .boxed()
    }
}

/// Serialize CIDs as their string form.
mod cid_string {
    use super::parse_key;
    use cid::Cid;
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(cid: &Cid, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&cid.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Cid, D::Error> {
        let s = String::deserialize(deserializer)?;
        parse_key(&s).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockstore::MemoryBlockstore;
    use crate::hash::{Algorithm, block_cid};
    use futures::TryStreamExt;

    async fn put_raw(store: &MemoryBlockstore, data: &[u8]) -> Cid {
        let cid = block_cid(Algorithm::Blake3, Codec::Raw, data).unwrap();
        store.put(&cid, data).await.unwrap();
        cid
    }

    async fn put_node(store: &MemoryBlockstore, node: &Node) -> Cid {
        let bytes = node.encode().unwrap();
        let cid = block_cid(Algorithm::Blake3, Codec::DagJson, &bytes).unwrap();
        store.put(&cid, &bytes).await.unwrap();
        cid
    }

    fn sorted_keys(cids: &[Cid]) -> Vec<String> {
        let mut keys: Vec<String> = cids.iter().map(normalize).collect();
        keys.sort();
        keys
    }

    #[test]
    fn test_node_encode_decode() {
        let child = block_cid(Algorithm::Blake3, Codec::Raw, b"leaf").unwrap();
        let node = Node {
            data: Some("dir".to_string()),
            links: vec![Link::new("leaf", child)],
        };
        let bytes = node.encode().unwrap();
        let cid = block_cid(Algorithm::Blake3, Codec::DagJson, &bytes).unwrap();
        assert_eq!(Node::decode(&cid, &bytes).unwrap(), node);
    }

    #[test]
    fn test_node_decode_rejects_bad_link() {
        let cid = block_cid(Algorithm::Blake3, Codec::DagJson, b"x").unwrap();
        let bytes = br#"{"links":[{"name":"a","cid":"not-a-cid"}]}"#;
        assert!(matches!(
            Node::decode(&cid, bytes),
            Err(Error::InvalidNode { .. })
        ));
    }

    #[test]
    fn test_links_of_raw_is_empty() {
        let cid = block_cid(Algorithm::Blake3, Codec::Raw, b"{}").unwrap();
        assert!(links_of(&cid, b"{}").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_refs_direct_and_recursive() {
        let store = MemoryBlockstore::new();
        let leaf1 = put_raw(&store, b"leaf1").await;
        let leaf2 = put_raw(&store, b"leaf2").await;
        let inner = put_node(&store, &Node::with_links(vec![Link::new("l2", leaf2)])).await;
        let root = put_node(
            &store,
            &Node::with_links(vec![Link::new("l1", leaf1), Link::new("inner", inner)]),
        )
        .await;

        let refs = Refs::new(Arc::new(store));

        let direct: Vec<Cid> = refs.refs(root, false).try_collect().await.unwrap();
        assert_eq!(sorted_keys(&direct), sorted_keys(&[leaf1, inner]));

        let all: Vec<Cid> = refs.refs(root, true).try_collect().await.unwrap();
        assert_eq!(sorted_keys(&all), sorted_keys(&[leaf1, inner, leaf2]));
    }

    #[tokio::test]
    async fn test_refs_yields_shared_children_once() {
        let store = MemoryBlockstore::new();
        let shared = put_raw(&store, b"shared").await;
        let a = put_node(&store, &Node::with_links(vec![Link::new("s", shared)])).await;
        let b = put_node(
            &store,
            &Node {
                data: Some("b".into()),
                links: vec![Link::new("s", shared)],
            },
        )
        .await;
        let root = put_node(
            &store,
            &Node::with_links(vec![Link::new("a", a), Link::new("b", b)]),
        )
        .await;

        let refs = Refs::new(Arc::new(store));
        let all: Vec<Cid> = refs.refs(root, true).try_collect().await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_refs_missing_child_errors() {
        let store = MemoryBlockstore::new();
        let missing = block_cid(Algorithm::Blake3, Codec::DagJson, b"gone").unwrap();
        let root = put_node(&store, &Node::with_links(vec![Link::new("m", missing)])).await;

        let refs = Refs::new(Arc::new(store));
        let result: Result<Vec<Cid>> = refs.refs(root, true).try_collect().await;
        assert!(matches!(result, Err(Error::BlockNotFound { .. })));
    }

    #[tokio::test]
    async fn test_refs_of_raw_root_is_empty() {
        let store = MemoryBlockstore::new();
        let leaf = put_raw(&store, b"alone").await;
        let refs = Refs::new(Arc::new(store));
        let all: Vec<Cid> = refs.refs(leaf, true).try_collect().await.unwrap();
        assert!(all.is_empty());
    }
}
