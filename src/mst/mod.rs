/**
 * This is an implementation of a Merkle Search Tree (MST)
 * The data structure is described here: https://hal.inria.fr/hal-02303490/document
 * The MST is an ordered, insert-order-independent, deterministic tree.
 * Keys are laid out in alphabetic order.
 * The key insight of an MST is that each key is hashed and starting 0s are counted
 * to determine which layer it falls on (5 zeros for ~32 fanout).
 * This is a merkle tree, so each subtree is referred to by its hash (CID).
 * When a leaf is changed, every tree on the path to that leaf is changed as well,
 * thereby updating the root hash.
 *
 * For this implementation, we use SHA-256 as the key hashing algorithm, and ~4 fanout
 * (2-bits of zero per layer).
 */
use crate::block_map::BlockMap;
use crate::cid_set::CidSet;
use crate::error::DataStoreError;
use crate::parse;
use crate::storage::types::RepoStorage;
use crate::storage::ObjAndBytes;
use crate::types::CidAndBytes;
use crate::vendored::iroh_car::CarWriter;
use anyhow::{anyhow, Result};
use async_recursion::async_recursion;
use async_stream::stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use lexicon_cid::Cid;
use serde_cbor::Value as CborValue;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use std::{fmt, mem};
use tokio::io::DuplexStream;
use tokio::sync::RwLock;

#[derive(Debug)]
pub struct NodeIter {
    entries: Vec<NodeEntry>, // Contains the remaining children of a node,
    // The iterator of the parent node, if present
    // It must be wrapped in a Box because a struct in Rust can't contain itself
    // without indirection
    parent: Option<Box<NodeIter>>,
    this: Option<NodeEntry>,
}

impl Default for NodeIter {
    fn default() -> Self {
        NodeIter {
            entries: vec![],
            parent: None,
            this: None,
        }
    }
}

/// We want to traverse (i.e. iterate over) this kind of tree depth-first. This means that
/// when a node has multiple children, we first traverse the first child and all its descendants
/// before moving on to the second child.
impl NodeIter {
    pub fn into_stream(self) -> impl Stream<Item = NodeEntry> {
        stream! {
            let mut current = self;
            loop {
                let next_item = current.next().await;
                match next_item {
                    Some(item) => yield item,
                    None => break,
                }
            }
        }
    }

    #[async_recursion(Sync)]
    async fn next(&mut self) -> Option<NodeEntry> {
        match self.entries.first() {
            None => {
                if let Some(this) = self.this.take() {
                    Some(this)
                } else if let Some(parent) = self.parent.take() {
                    *self = *parent;
                    self.next().await
                } else {
                    None
                }
            }
            Some(NodeEntry::Leaf(_)) => {
                let leaf = self.entries.remove(0);
                Some(leaf)
            }
            Some(NodeEntry::MST(_)) => {
                let mut mst_entry = self.entries.remove(0);
                let entries = match &mut mst_entry {
                    NodeEntry::MST(subtree) => subtree.get_entries().await.unwrap_or_default(),
                    _ => vec![],
                };

                let parent = mem::replace(
                    self,
                    NodeIter {
                        entries,
                        parent: Some(Box::new(NodeIter {
                            entries: vec![],
                            parent: None,
                            this: None,
                        })),
                        this: Some(mst_entry),
                    },
                );

                self.parent = Some(Box::new(parent));

                self.next().await
            }
        }
    }
}

/// Alternative implementation of iterator that bails on missing blocks instead of panicking.
#[derive(Debug)]
pub struct NodeIterReachable {
    entries: Vec<NodeEntry>,
    parent: Option<Box<NodeIterReachable>>,
    this: Option<NodeEntry>,
}

impl Default for NodeIterReachable {
    fn default() -> Self {
        NodeIterReachable {
            entries: vec![],
            parent: None,
            this: None,
        }
    }
}

impl NodeIterReachable {
    pub fn into_stream(self) -> impl Stream<Item = Result<NodeEntry>> {
        stream! {
            let mut current = self;
            loop {
                let next_item = current.next().await;
                match next_item {
                    Some(item) => yield item,
                    None => break,
                }
            }
        }
    }

    #[async_recursion(Sync)]
    async fn next(&mut self) -> Option<Result<NodeEntry>> {
        match self.entries.first() {
            None => {
                if let Some(this) = self.this.take() {
                    Some(Ok(this))
                } else if let Some(parent) = self.parent.take() {
                    *self = *parent;
                    self.next().await
                } else {
                    None
                }
            }
            Some(NodeEntry::Leaf(_)) => {
                let leaf = self.entries.remove(0);
                Some(Ok(leaf))
            }
            Some(NodeEntry::MST(_)) => {
                let mut mst_entry = self.entries.remove(0);
                let entries = match &mut mst_entry {
                    NodeEntry::MST(subtree) => subtree.get_entries().await,
                    _ => Err(anyhow::Error::new(DataStoreError::MissingBlock(
                        "Missing Blocks".to_string(),
                    ))),
                };

                match entries {
                    Err(e) => match e.downcast_ref() {
                        Some(DataStoreError::MissingBlock(_)) => self.next().await,
                        _ => return Some(Err(e)),
                    },
                    _ => {
                        *self = NodeIterReachable {
                            entries: entries.unwrap().to_vec(),
                            parent: Some(Box::new(mem::take(self))),
                            this: Some(mst_entry),
                        };
                        self.next().await
                    }
                }
            }
        }
    }
}

/**
 * A couple notes on CBOR encoding:
 *
 * There are never two neighboring subtrees.
 * Therefore, we can represent a node as an array of
 * leaves & pointers to their right neighbor (possibly null),
 * along with a pointer to the left-most subtree (also possibly null).
 *
 * Most keys in a subtree will have overlap.
 * We do compression on prefixes by describing keys as:
 * - the length of the prefix that it shares in common with the preceding key
 * - the rest of the string
 *
 * For example:
 * If the first leaf in a tree is `bsky/posts/abcdefg` and the second is `bsky/posts/abcdehi`
 * Then the first will be described as `prefix: 0, key: 'bsky/posts/abcdefg'`,
 * and the second will be described as `prefix: 16, key: 'hi'.`
 */
/// treeEntry are elements of nodeData's Entries.
#[derive(PartialEq, Clone, Deserialize, Serialize)]
pub struct TreeEntry {
    pub p: u8, // count of characters shared with previous path/key in tree
    #[serde(with = "serde_bytes")]
    pub k: Vec<u8>, // remaining part of path/key (appended to "previous key")
    pub v: Cid, // CID pointer at this path/key
    pub t: Option<Cid>, // [optional] pointer to lower-level subtree to the "right" of this path/key entry
}

impl Debug for TreeEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let t_string = self.t.as_ref().map(|cid| cid.to_string());
        f.debug_struct("TreeEntry")
            .field("p", &self.p)
            .field("k", &self.k)
            .field("v", &self.v.to_string())
            .field("t", &t_string)
            .finish()
    }
}

/// MST tree node as gets serialized to CBOR. Note that the CBOR fields are all
/// single-character.
#[derive(PartialEq, Clone, Deserialize, Serialize)]
pub struct NodeData {
    pub l: Option<Cid>, // [optional] pointer to lower-level subtree to the "left" of this path/key
    pub e: Vec<TreeEntry>, // ordered list of entries at this node
}

impl Debug for NodeData {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let cid = self.l.as_ref().map(|cid| cid.to_string());
        f.debug_struct("NodeData")
            .field("l", &cid)
            .field("e", &self.e)
            .finish()
    }
}

#[derive(Deserialize, Serialize, Clone)]
pub struct Leaf {
    pub key: String, // record key
    pub value: Cid,
}

impl Debug for Leaf {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("TreeEntry")
            .field("key", &self.key)
            .field("value", &self.value.to_string())
            .finish()
    }
}

impl PartialEq for Leaf {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.value == other.value
    }
}

impl PartialEq<MST> for Leaf {
    fn eq(&self, _other: &MST) -> bool {
        false
    }
}

impl PartialEq<NodeEntry> for Leaf {
    fn eq(&self, other: &NodeEntry) -> bool {
        match other {
            NodeEntry::Leaf(other) => self.key == other.key && self.value == other.value,
            NodeEntry::MST(_) => false,
        }
    }
}

/// nodeEntry is a node in the MST: either a leaf (record pointer), or a subtree
/// that might also sit as the "left" pointer on a NodeData.
#[derive(Clone, Debug)]
pub enum NodeEntry {
    MST(MST),
    Leaf(Leaf),
}

impl NodeEntry {
    pub fn is_tree(&self) -> bool {
        matches!(self, NodeEntry::MST(_))
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeEntry::Leaf(_))
    }

    fn iter(self) -> NodeIter {
        NodeIter {
            entries: vec![self],
            parent: None,
            this: None,
        }
    }

    fn iter_reachable(&self) -> NodeIterReachable {
        NodeIterReachable {
            entries: vec![self.clone()],
            parent: None,
            this: None,
        }
    }
}

#[async_trait]
pub trait AsyncPartialEq<Rhs: ?Sized = Self> {
    async fn async_eq(&self, other: &Rhs) -> bool;
}

#[async_trait]
impl AsyncPartialEq for NodeEntry {
    async fn async_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (NodeEntry::Leaf(this), NodeEntry::Leaf(other)) => {
                this.key == other.key && this.value == other.value
            }
            (NodeEntry::Leaf(_), NodeEntry::MST(_)) => false,
            (NodeEntry::MST(_), NodeEntry::Leaf(_)) => false,
            (NodeEntry::MST(this), NodeEntry::MST(other)) => {
                let this_pointer = this
                    .get_pointer()
                    .await
                    .expect("Failed to get pointer for `this`");
                let other_pointer = other
                    .get_pointer()
                    .await
                    .expect("Failed to get pointer for `other`");
                this_pointer == other_pointer
            }
        }
    }
}

#[async_trait]
impl AsyncPartialEq<MST> for NodeEntry {
    async fn async_eq(&self, other: &MST) -> bool {
        match self {
            NodeEntry::Leaf(_) => false,
            NodeEntry::MST(this) => {
                let this_pointer = this
                    .get_pointer()
                    .await
                    .expect("Failed to get pointer for `this`");
                let other_pointer = other
                    .get_pointer()
                    .await
                    .expect("Failed to get pointer for `other`");
                this_pointer == other_pointer
            }
        }
    }
}

#[async_trait]
impl AsyncPartialEq<Leaf> for NodeEntry {
    async fn async_eq(&self, other: &Leaf) -> bool {
        match self {
            NodeEntry::Leaf(this) => this.key == other.key && this.value == other.value,
            NodeEntry::MST(_) => false,
        }
    }
}

#[async_trait]
impl<T> AsyncPartialEq for Vec<T>
where
    T: AsyncPartialEq + Sync, // Sync is needed because async_trait requires it.
{
    async fn async_eq(&self, other: &Self) -> bool {
        if self.len() != other.len() {
            return false;
        }
        for (a, b) in self.iter().zip(other.iter()) {
            if !a.async_eq(b).await {
                return false;
            }
        }
        true
    }
}

#[derive(Debug)]
pub struct UnstoredBlocks {
    root: Cid,
    blocks: BlockMap,
}

/// MST represents a MerkleSearchTree tree node (NodeData type). It can be in
/// several levels of hydration: fully hydrated (entries and "pointer" (CID)
/// computed); dirty (entries correct, but pointer (CID) not valid); virtual
/// (pointer is defined, no entries have been pulled from block store)
///
/// MerkleSearchTree values are immutable. Methods return copies with changes.
#[derive(Clone)]
pub struct MST {
    pub entries: Arc<RwLock<Option<Vec<NodeEntry>>>>,
    pub layer: Option<u32>,
    pub pointer: Arc<RwLock<Cid>>,
    pub outdated_pointer: Arc<RwLock<bool>>,
    pub storage: Arc<RwLock<dyn RepoStorage>>,
}

impl Debug for MST {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MST")
            .field("entries", &self.entries.try_read().unwrap())
            .field("layer", &self.layer)
            .field("pointer", &self.pointer.try_read().unwrap().to_string())
            .field(
                "outdated_pointer",
                &self.outdated_pointer.try_read().unwrap(),
            )
            .finish()
    }
}

impl Display for MST {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        fn pointer_str(mst: &MST) -> String {
            let cid_guard = mst.pointer.try_read().unwrap();
            format!("*({})", util::short_cid(&*cid_guard))
        }

        fn fmt_mst(mst: &MST, f: &mut Formatter<'_>, prefix: &str, is_last: bool) -> fmt::Result {
            writeln!(
                f,
                "{}{}── {}",
                prefix,
                if is_last { "└" } else { "├" },
                pointer_str(mst),
            )?;

            let child_prefix = format!("{}{}", prefix, if is_last { "   " } else { "│  " });

            let entries_guard = mst.entries.try_read().unwrap();
            let entries = match &*entries_guard {
                Some(e) => e,
                None => {
                    writeln!(f, "{}(virtual node)", child_prefix)?;
                    return Ok(());
                }
            };

            for (i, entry) in entries.iter().enumerate() {
                let last_child = i == entries.len() - 1;
                match entry {
                    NodeEntry::Leaf(leaf) => {
                        writeln!(
                            f,
                            "{}{}── {} -> {}",
                            child_prefix,
                            if last_child { "└" } else { "├" },
                            leaf.key,
                            util::short_cid(&leaf.value)
                        )?;
                    }
                    NodeEntry::MST(child_mst) => {
                        fmt_mst(child_mst, f, &child_prefix, last_child)?;
                    }
                }
            }
            Ok(())
        }

        fmt_mst(self, f, "", true)
    }
}

impl MST {
    pub fn new(
        storage: Arc<RwLock<dyn RepoStorage>>,
        pointer: Cid,
        entries: Option<Vec<NodeEntry>>,
        layer: Option<u32>,
    ) -> Self {
        Self {
            storage,
            entries: Arc::new(RwLock::new(entries)),
            layer,
            pointer: Arc::new(RwLock::new(pointer)),
            outdated_pointer: Arc::new(RwLock::new(false)),
        }
    }

    pub async fn create(
        storage: Arc<RwLock<dyn RepoStorage>>,
        entries: Option<Vec<NodeEntry>>,
        layer: Option<u32>,
    ) -> Result<Self> {
        let entries = entries.unwrap_or_default();
        let pointer = util::cid_for_entries(entries.as_slice()).await?;
        Ok(MST::new(storage, pointer, Some(entries), layer))
    }

    pub fn from_data(
        storage: Arc<RwLock<dyn RepoStorage>>,
        data: &NodeData,
        layer: Option<u32>,
    ) -> Result<Self> {
        let entries = util::deserialize_node_data(storage.clone(), data, layer)?;
        let pointer = rsky_common::ipld::cid_for_cbor(&data)?;
        Ok(MST::new(storage, pointer, Some(entries), layer))
    }

    /// This is poorly named: it is really a *lazy* load, it doesn't touch storage.
    pub fn load(
        storage: Arc<RwLock<dyn RepoStorage>>,
        cid: Cid,
        layer: Option<u32>,
    ) -> Result<Self> {
        Ok(MST::new(storage, cid, None, layer))
    }

    // Immutability
    // -------------------

    /// We never mutate an MST, we just return a new MST with updated values
    pub async fn new_tree(&mut self, entries: Vec<NodeEntry>) -> Result<Self> {
        let mut mst = MST::new(
            self.storage.clone(),
            *self.pointer.read().await,
            Some(entries),
            self.layer,
        );
        mst.outdated_pointer = Arc::new(RwLock::new(true));
        Ok(mst)
    }

    // === Getters (lazy load) ===

    /// We don't want to load entries of every subtree, just the ones we need
    pub async fn get_entries(&self) -> Result<Vec<NodeEntry>> {
        {
            let mut entries = self.entries.write().await;
            if entries.is_none() {
                let storage_guard = self.storage.read().await;
                let pointer = self.pointer.read().await;
                let data: CborValue = storage_guard
                    .read_obj(
                        &pointer,
                        Box::new(|obj: CborValue| {
                            serde_cbor::value::from_value::<NodeData>(obj).is_ok()
                        }),
                    )
                    .await?;
                let data: NodeData = serde_cbor::value::from_value(data)?;

                let first_leaf = data.e.first();
                let layer = match first_leaf {
                    Some(first_leaf) => Some(util::leading_zeros_on_hash(&first_leaf.k)?),
                    None => None,
                };

                *entries = Some(util::deserialize_node_data(
                    self.storage.clone(),
                    &data,
                    layer,
                )?);
            }
        }

        let guard = self.entries.read().await;

        guard
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("No entries present"))
            .map(|v| v.clone())
    }

    // We don't hash the node on every mutation for performance reasons.
    // Instead we track whether the pointer is outdated and only (recursively) recalculate
    // when needed.
    #[async_recursion(Sync)]
    pub async fn get_pointer(&self) -> Result<Cid> {
        let mut outdated = self.outdated_pointer.write().await;
        if !*outdated {
            return Ok(*self.pointer.read().await);
        }

        let serialized = self.serialize().await?;
        *self.pointer.write().await = serialized.cid;
        *outdated = false;

        Ok(serialized.cid)
    }

    pub async fn serialize(&self) -> Result<CidAndBytes> {
        let mut entries = self.get_entries().await?;
        let mut outdated: Vec<Self> = Vec::new();
        for entry in &entries {
            if let NodeEntry::MST(ref mst) = entry {
                let is_outdated = *mst.outdated_pointer.read().await;
                if is_outdated {
                    outdated.push(mst.clone());
                }
            }
        }

        if !outdated.is_empty() {
            for outdated_entry in &outdated {
                let _ = outdated_entry.get_pointer().await?;
            }
            entries = self.get_entries().await?
        }
        let data = util::serialize_node_data(entries.as_slice()).await?;
        Ok(CidAndBytes {
            cid: rsky_common::ipld::cid_for_cbor(&data)?,
            bytes: rsky_common::struct_to_cbor(data)?,
        })
    }

    /// In most cases, we get the layer of a node from a hint on creation.
    /// For the topmost node in the tree, we look for a key in the node and determine the layer.
    /// If we still can't find one, then we have an empty tree and the node is layer 0.
    pub async fn get_layer(&mut self) -> Result<u32> {
        self.layer = self.attempt_get_layer().await?;
        if self.layer.is_none() {
            self.layer = Some(0);
        }
        Ok(self.layer.unwrap_or(0))
    }

    #[async_recursion(Sync)]
    pub async fn attempt_get_layer(&mut self) -> Result<Option<u32>> {
        if self.layer.is_some() {
            return Ok(self.layer);
        };
        let mut entries = self.get_entries().await?;
        let mut layer = util::layer_for_entries(entries.as_slice())?;
        if layer.is_none() {
            for entry in entries.iter_mut() {
                if let NodeEntry::MST(ref mut tree) = entry {
                    let child_layer = tree.attempt_get_layer().await?;
                    if let Some(c) = child_layer {
                        layer = Some(c + 1);
                        break;
                    }
                }
            }
        } else {
            self.layer = layer;
        }
        Ok(layer)
    }

    // Core functionality
    // -------------------

    /// Return the necessary blocks to persist the MST to repo storage
    #[async_recursion(Sync)]
    pub async fn get_unstored_blocks(&self) -> Result<UnstoredBlocks> {
        let mut blocks = BlockMap::new();
        let pointer = self.get_pointer().await?;
        let already_has = {
            let storage_guard = self.storage.read().await;
            storage_guard.has(pointer).await?
        };
        if already_has {
            return Ok(UnstoredBlocks {
                root: pointer,
                blocks,
            });
        }
        let entries = self.get_entries().await?;
        let data: NodeData = util::serialize_node_data(entries.as_slice()).await?;
        let _ = blocks.add(data)?;
        for entry in entries.iter() {
            if let NodeEntry::MST(e) = entry {
                let subtree = e.get_unstored_blocks().await?;
                blocks.add_map(subtree.blocks)?;
            }
        }
        Ok(UnstoredBlocks {
            root: pointer,
            blocks,
        })
    }

    /// Adds a new leaf for the given key/value pair.
    /// Errors if a leaf with that key already exists.
    #[async_recursion(Sync)]
    pub async fn add(&mut self, key: &str, value: Cid, known_zeros: Option<u32>) -> Result<Self> {
        util::ensure_valid_mst_key(key)?;
        let key_zeros = match known_zeros {
            Some(z) => z,
            None => util::leading_zeros_on_hash(key.as_bytes())?,
        };
        let layer = self.get_layer().await?;

        let new_leaf = Leaf {
            key: key.to_string(),
            value,
        };

        if key_zeros == layer {
            // it belongs in this layer
            let index = self.find_gt_or_equal_leaf_index(key).await?;

            let found = self.at_index(index).await?;
            if let Some(NodeEntry::Leaf(l)) = found {
                if l.key == *key {
                    return Err(anyhow!("There is already a value at key: {}", key));
                }
            }
            let prev_node = self.at_index(index - 1).await?;
            if let Some(p) = prev_node {
                match p {
                    // if entry before is a leaf we can just splice in
                    NodeEntry::Leaf(_) => self.splice_in(NodeEntry::Leaf(new_leaf), index).await,
                    // else we try to split the subtree around the key
                    NodeEntry::MST(mut m) => {
                        let split_sub_tree = m.split_around(key).await?;
                        self.replace_with_split(
                            index - 1,
                            split_sub_tree.0,
                            new_leaf,
                            split_sub_tree.1,
                        )
                        .await
                    }
                }
            } else {
                // If we're on far left we can just splice in
                self.splice_in(NodeEntry::Leaf(new_leaf), index).await
            }
        } else if key_zeros < layer {
            // it belongs on a lower layer
            let index = self.find_gt_or_equal_leaf_index(key).await?;
            let prev_node = self.at_index(index - 1).await?;
            if let Some(NodeEntry::MST(mut p)) = prev_node {
                // if entry before is a tree, we add it to that tree
                let new_subtree = p.add(key, value, Some(key_zeros)).await?;
                self.update_entry(index - 1, NodeEntry::MST(new_subtree))
                    .await
            } else {
                let mut sub_tree = self.create_child().await?;
                let new_subtree = sub_tree.add(key, value, Some(key_zeros)).await?;
                self.splice_in(NodeEntry::MST(new_subtree), index).await
            }
        } else {
            let layer = self.get_layer().await?;
            let extra_layers_to_add = key_zeros - layer;

            // it belongs on a higher layer & we must push the rest of the tree down.
            let split = self.split_around(key).await?;
            // if the newly added key has >=2 more leading zeros than the current highest layer
            // then we need to add in structural nodes in between as well
            let mut left: Option<Self> = split.0;
            let mut right: Option<Self> = split.1;
            // intentionally starting at 1, since first layer is taken care of by split
            for _ in 1..extra_layers_to_add {
                if let Some(l) = left.clone() {
                    left = Some(l.create_parent().await?);
                }
                if let Some(r) = right.clone() {
                    right = Some(r.create_parent().await?);
                }
            }
            let mut updated: Vec<NodeEntry> = Vec::new();
            if let Some(l) = left {
                updated.push(NodeEntry::MST(l));
            }
            updated.push(NodeEntry::Leaf(Leaf {
                key: key.to_string(),
                value,
            }));
            if let Some(r) = right {
                updated.push(NodeEntry::MST(r));
            }
            let mut new_root =
                MST::create(self.storage.clone(), Some(updated), Some(key_zeros)).await?;
            new_root.outdated_pointer = Arc::new(RwLock::new(true));
            Ok(new_root)
        }
    }

    /// Gets the value at the given key
    #[async_recursion(Sync)]
    pub async fn get(&mut self, key: &String) -> Result<Option<Cid>> {
        let index = self.find_gt_or_equal_leaf_index(key).await?;
        let found = self.at_index(index).await?;
        if let Some(NodeEntry::Leaf(f)) = found {
            if f.key == *key {
                return Ok(Some(f.value));
            }
        }
        let prev = self.at_index(index - 1).await?;
        if let Some(NodeEntry::MST(mut p)) = prev {
            return p.get(key).await;
        }
        Ok(None)
    }

    /// Edits the value at the given key.
    /// Errors if the given key does not exist.
    #[async_recursion(Sync)]
    pub async fn update(&mut self, key: &str, value: Cid) -> Result<Self> {
        util::ensure_valid_mst_key(key)?;
        let index = self.find_gt_or_equal_leaf_index(key).await?;
        let found = self.at_index(index).await?;
        if let Some(NodeEntry::Leaf(f)) = found {
            if f.key == *key {
                return self
                    .update_entry(
                        index,
                        NodeEntry::Leaf(Leaf {
                            key: key.to_string(),
                            value,
                        }),
                    )
                    .await;
            }
        }
        let prev = self.at_index(index - 1).await?;
        if let Some(NodeEntry::MST(mut p)) = prev {
            let updated_tree = p.update(key, value).await?;
            return self
                .update_entry(index - 1, NodeEntry::MST(updated_tree))
                .await;
        }
        Err(anyhow!("Could not find a record with key: {}", key))
    }

    /// Deletes the value at the given key
    pub async fn delete(&mut self, key: &String) -> Result<Self> {
        let altered = self.delete_recurse(key).await?;
        altered.trim_top().await
    }

    #[async_recursion(Sync)]
    pub async fn delete_recurse(&mut self, key: &String) -> Result<Self> {
        let index = self.find_gt_or_equal_leaf_index(key).await?;
        let found = self.at_index(index).await?;
        // if found, remove it on this level
        if let Some(NodeEntry::Leaf(f)) = found {
            if f.key == *key {
                let prev = self.at_index(index - 1).await?;
                let next = self.at_index(index + 1).await?;
                return match (prev, next) {
                    (Some(NodeEntry::MST(mut p)), Some(NodeEntry::MST(n))) => {
                        let merged = p.append_merge(n).await?;
                        let mut new_tree_entries: Vec<NodeEntry> = Vec::new();
                        new_tree_entries
                            .append(&mut self.slice(Some(0), Some(index - 1)).await?.to_vec());
                        new_tree_entries.push(NodeEntry::MST(merged));
                        new_tree_entries
                            .append(&mut self.slice(Some(index + 2), None).await?.to_vec());
                        self.new_tree(new_tree_entries).await
                    }
                    (_, _) => self.remove_entry(index).await,
                };
            }
        }
        // else recurse down to find it
        let prev = self.at_index(index - 1).await?;
        if let Some(NodeEntry::MST(mut p)) = prev {
            let subtree = &mut p.delete_recurse(key).await?;
            let subtree_entries = subtree.get_entries().await?;
            if subtree_entries.is_empty() {
                self.remove_entry(index - 1).await
            } else {
                self.update_entry(index - 1, NodeEntry::MST(subtree.clone()))
                    .await
            }
        } else {
            Err(anyhow!("Could not find a record with key: {}", key))
        }
    }

    // Simple Operations
    // -------------------

    /// update entry in place
    pub async fn update_entry(&mut self, index: isize, entry: NodeEntry) -> Result<Self> {
        let mut update = Vec::new();
        for e in self.slice(Some(0), Some(index)).await?.to_vec() {
            update.push(e);
        }
        update.push(entry);
        for e in self.slice(Some(index + 1), None).await?.to_vec() {
            update.push(e);
        }
        self.new_tree(update).await
    }

    /// remove entry at index
    pub async fn remove_entry(&mut self, index: isize) -> Result<Self> {
        let mut updated = Vec::new();
        updated.append(&mut self.slice(Some(0), Some(index)).await?.to_vec());
        updated.append(&mut self.slice(Some(index + 1), None).await?.to_vec());

        self.new_tree(updated).await
    }

    /// append entry to end of the node
    pub async fn append(&mut self, entry: NodeEntry) -> Result<Self> {
        let mut entries = self.get_entries().await?.to_vec();
        entries.push(entry);
        self.new_tree(entries).await
    }

    /// prepend entry to beginning of the node
    pub async fn prepend(&mut self, entry: NodeEntry) -> Result<Self> {
        let mut entries = self.get_entries().await?.to_vec();
        entries.splice(0..0, vec![entry]);
        self.new_tree(entries).await
    }

    /// returns entry at index
    pub async fn at_index(&mut self, index: isize) -> Result<Option<NodeEntry>> {
        let entries = self.get_entries().await?;
        if index >= 0 {
            Ok(entries.into_iter().nth(index as usize))
        } else {
            Ok(None)
        }
    }

    /// returns a slice of the node
    pub async fn slice(&self, start: Option<isize>, end: Option<isize>) -> Result<Vec<NodeEntry>> {
        let entries = self.get_entries().await?;
        let entry_len = entries.len() as isize;
        match (start, end) {
            (Some(start), Some(end)) => {
                // Adapted from Javascript Array.prototype.slice()
                // https://developer.mozilla.org/en-US/docs/Web/JavaScript/Reference/Global_Objects/Array/slice
                let start: usize = if start < 0 && start >= -entry_len {
                    (start + entry_len) as usize
                } else if start < -entry_len {
                    0
                } else if start >= entry_len {
                    return Ok(vec![]);
                } else {
                    start as usize
                };

                let end: usize = if end < 0 && end >= -entry_len {
                    (end + entry_len) as usize
                } else if end < -entry_len {
                    0
                } else if end >= entry_len {
                    entries.len()
                } else if end <= start as isize {
                    return Ok(vec![]);
                } else {
                    end as usize
                };

                Ok(entries[start..end].to_vec())
            }
            (Some(start), None) => {
                let start: usize = if start < 0 && start >= -entry_len {
                    (start + entry_len) as usize
                } else if start < -entry_len {
                    0
                } else if start >= entry_len {
                    return Ok(vec![]);
                } else {
                    start as usize
                };
                Ok(entries[start..].to_vec())
            }
            (None, Some(end)) => {
                let end: usize = if end < 0 && end >= -entry_len {
                    (end + entry_len) as usize
                } else if end < -entry_len {
                    0
                } else if end >= entry_len {
                    entries.len()
                } else if end <= 0 {
                    return Ok(vec![]);
                } else {
                    end as usize
                };
                Ok(entries[..end].to_vec())
            }
            (None, None) => Ok(entries),
        }
    }

    /// inserts entry at index
    pub async fn splice_in(&mut self, entry: NodeEntry, index: isize) -> Result<Self> {
        let mut update = Vec::new();
        for e in self.slice(Some(0), Some(index)).await?.to_vec() {
            update.push(e);
        }
        update.push(entry);
        for e in self.slice(Some(index), None).await?.to_vec() {
            update.push(e);
        }
        self.new_tree(update).await
    }

    /// replaces an entry with [ Some(tree), Leaf, Some(tree) ]
    pub async fn replace_with_split(
        &mut self,
        index: isize,
        left: Option<Self>,
        leaf: Leaf,
        right: Option<Self>,
    ) -> Result<Self> {
        let update = self.slice(Some(0), Some(index)).await?;
        let mut update = update.to_vec();
        if let Some(l) = left {
            update.push(NodeEntry::MST(l));
        }
        update.push(NodeEntry::Leaf(leaf));
        if let Some(r) = right {
            update.push(NodeEntry::MST(r));
        }
        let remainder = self.slice(Some(index + 1), None).await?;
        let remainder = &mut remainder.to_vec();
        update.append(remainder);
        self.new_tree(update).await
    }

    /// if the topmost node in the tree only points to another tree, trim the top and return the subtree
    #[async_recursion(Sync)]
    pub async fn trim_top(self) -> Result<Self> {
        let entries = self.get_entries().await?;
        if entries.len() == 1 {
            match entries.into_iter().next() {
                Some(NodeEntry::MST(n)) => n.trim_top().await,
                _ => Ok(self),
            }
        } else {
            Ok(self)
        }
    }

    // Subtree & Splits
    // -------------------

    /// Recursively splits a subtree around a given key
    #[async_recursion(Sync)]
    pub async fn split_around(&mut self, key: &str) -> Result<(Option<Self>, Option<Self>)> {
        let index = self.find_gt_or_equal_leaf_index(key).await?;
        // split tree around key
        let left_data = {
            let tmp = self.slice(Some(0), Some(index)).await?;
            tmp.to_vec()
        };
        let right_data = {
            let tmp = self.slice(Some(index), None).await?;
            tmp.to_vec()
        };
        let mut left = self.new_tree(left_data.clone()).await?;
        let mut right = self.new_tree(right_data).await?;

        // if the far right of the left side is a subtree,
        // we need to split it on the key as well
        let left_len = left_data.len();
        let last_in_left: Option<NodeEntry> = if let [.., last] = left_data.as_slice() {
            Some(last.clone())
        } else {
            None
        };
        if let Some(NodeEntry::MST(mut last)) = last_in_left {
            left = left.remove_entry(left_len as isize - 1).await?;
            let split = last.split_around(key).await?;
            if let Some(s0) = split.0 {
                left = left.append(NodeEntry::MST(s0)).await?;
            }
            if let Some(s1) = split.1 {
                right = right.prepend(NodeEntry::MST(s1)).await?;
            }
        }

        let left_output = match left.get_entries().await?.len() {
            0 => None,
            _ => Some(left),
        };
        let right_output = match right.get_entries().await?.len() {
            0 => None,
            _ => Some(right),
        };
        Ok((left_output, right_output))
    }

    /// The simple merge case where every key in the right tree is greater than every key in
    /// the left tree (used primarily for deletes)
    #[async_recursion(Sync)]
    pub async fn append_merge(&mut self, mut to_merge: Self) -> Result<Self> {
        if self.get_layer().await? != to_merge.get_layer().await? {
            return Err(anyhow!(
                "Trying to merge two nodes from different layers of the MST"
            ));
        }
        let mut self_entries = self.get_entries().await?.to_vec();
        let mut to_merge_entries = to_merge.get_entries().await?.to_vec();
        let last_in_left = self_entries.last();
        let first_in_right = to_merge_entries.first();
        let mut new_tree_entries: Vec<NodeEntry> = Vec::new();
        match (last_in_left, first_in_right) {
            (Some(NodeEntry::MST(l)), Some(NodeEntry::MST(r))) => {
                let mut new_l = l.clone();
                let merged = new_l.append_merge(r.clone()).await?;
                self_entries.pop();
                new_tree_entries.append(&mut self_entries);
                new_tree_entries.push(NodeEntry::MST(merged));
                to_merge_entries.remove(0);
                new_tree_entries.append(&mut to_merge_entries);
            }
            (_, _) => {
                new_tree_entries.append(&mut self_entries);
                new_tree_entries.append(&mut to_merge_entries);
            }
        };
        self.new_tree(new_tree_entries).await
    }

    // Create relatives
    // -------------------

    pub async fn create_child(&mut self) -> Result<Self> {
        let layer = self.get_layer().await?;
        MST::create(self.storage.clone(), Some(Vec::new()), Some(layer - 1)).await
    }

    pub async fn create_parent(mut self) -> Result<Self> {
        let layer = self.get_layer().await?;
        let mut parent = MST::create(
            self.storage.clone(),
            Some(vec![NodeEntry::MST(self)]),
            Some(layer + 1),
        )
        .await?;
        parent.outdated_pointer = Arc::new(RwLock::new(true));
        Ok(parent)
    }

    // Finding insertion points
    // -------------------

    /// finds index of first leaf node that is greater than or equal to the value
    pub async fn find_gt_or_equal_leaf_index(&mut self, key: &str) -> Result<isize> {
        let entries = self.get_entries().await?;
        let maybe_index = entries.iter().position(|entry| match entry {
            NodeEntry::MST(_) => false,
            NodeEntry::Leaf(entry) => entry.key.as_str() >= key,
        });
        // if we can't find, we're on the end
        match maybe_index {
            Some(i) => Ok(i as isize),
            None => Ok(entries.len() as isize),
        }
    }

    // List operations (partial tree traversal)
    // -------------------

    /// Walk tree starting at key
    #[async_recursion(Sync)]
    pub async fn walk_leaves_from(&mut self, key: &String) -> impl Iterator<Item = Leaf> {
        let mut iter: Vec<Leaf> = Vec::new();
        let index = self.find_gt_or_equal_leaf_index(key).await.unwrap() as usize;
        let entries = self.get_entries().await.unwrap();
        if let Some(prev_index) = index.checked_sub(1) {
            let prev = entries.get(prev_index);
            if let Some(NodeEntry::MST(p)) = prev {
                let mut p = p.clone();
                for leaf in p.walk_leaves_from(key).await {
                    iter.push(leaf);
                }
            }
        }
        for entry in entries.iter().skip(index) {
            match entry.clone() {
                NodeEntry::Leaf(e) => iter.push(e),
                NodeEntry::MST(mut e) => {
                    for leaf in e.walk_leaves_from(key).await {
                        iter.push(leaf);
                    }
                }
            }
        }
        iter.into_iter()
    }

    pub async fn list(
        &mut self,
        count: Option<usize>,
        after: Option<String>,
        before: Option<String>,
    ) -> Result<Vec<Leaf>> {
        let mut vals: Vec<Leaf> = Vec::new();
        let after = after.unwrap_or_default();
        for leaf in self.walk_leaves_from(&after).await {
            if leaf.key == after {
                continue;
            }
            if vals.len() >= count.unwrap_or(usize::MAX) {
                break;
            }
            if let Some(b) = &before {
                if leaf.key >= *b {
                    break;
                }
            }
            vals.push(leaf);
        }
        Ok(vals)
    }

    pub async fn list_with_prefix(&mut self, prefix: &String, count: usize) -> Result<Vec<Leaf>> {
        let mut vals: Vec<Leaf> = Vec::new();
        for leaf in self.walk_leaves_from(prefix).await {
            if vals.len() >= count || !leaf.key.starts_with(prefix.as_str()) {
                break;
            }
            vals.push(leaf);
        }
        Ok(vals)
    }

    // Full tree traversal
    // -------------------

    /// Walk full tree & emit nodes
    pub fn walk(self) -> impl Stream<Item = NodeEntry> {
        NodeEntry::MST(self).iter().into_stream()
    }

    /// Walk full tree & collect every leaf/subtree path from the root
    #[async_recursion(Sync)]
    pub async fn paths(self) -> Result<Vec<Vec<NodeEntry>>> {
        let mut paths: Vec<Vec<NodeEntry>> = Vec::new();
        let mut stream = Box::pin(self.walk());
        while let Some(entry) = stream.next().await {
            match entry {
                NodeEntry::Leaf(_) => paths.push(vec![entry]),
                NodeEntry::MST(ref m) => {
                    let sub_paths = m.clone().paths().await?;
                    sub_paths
                        .clone()
                        .into_iter()
                        .map(|mut p| {
                            let mut path: Vec<NodeEntry> = vec![entry.clone()];
                            path.append(&mut p);
                            paths.push(path)
                        })
                        .for_each(drop);
                }
            }
        }
        Ok(paths)
    }

    /// Walks tree & returns all nodes
    pub async fn all_nodes(self) -> Result<Vec<NodeEntry>> {
        let mut nodes: Vec<NodeEntry> = Vec::new();
        let mut stream = Box::pin(self.walk());
        while let Some(entry) = stream.next().await {
            nodes.push(entry);
        }
        Ok(nodes)
    }

    /// Walks tree & returns all cids
    #[async_recursion(Sync)]
    pub async fn all_cids(self) -> Result<CidSet> {
        let mut cids = CidSet::new(None);
        let mut stream = Box::pin(self.clone().walk());
        while let Some(entry) = stream.next().await {
            match entry {
                NodeEntry::Leaf(leaf) => cids.add(leaf.value),
                NodeEntry::MST(m) => {
                    let subtree_cids = m.all_cids().await?;
                    cids.add_set(subtree_cids);
                }
            }
        }
        cids.add(self.get_pointer().await?);
        Ok(cids)
    }

    /// Walks tree & returns all leaves
    pub async fn leaves(self) -> Result<Vec<Leaf>> {
        let mut leaves: Vec<Leaf> = Vec::new();
        let mut stream = Box::pin(self.walk());
        while let Some(entry) = stream.next().await {
            if let NodeEntry::Leaf(leaf) = entry {
                leaves.push(leaf);
            }
        }
        Ok(leaves)
    }

    /// Returns total leaf count
    pub async fn leaf_count(self) -> Result<usize> {
        let leaves = self.leaves().await?;
        Ok(leaves.len())
    }

    // Reachable tree traversal
    // -------------------

    /// Walk reachable branches of tree & emit nodes, tolerating missing blocks
    pub fn walk_reachable(self) -> impl Stream<Item = Result<NodeEntry>> {
        NodeEntry::MST(self).iter_reachable().into_stream()
    }

    pub async fn reachable_leaves(self) -> Result<Vec<Leaf>> {
        let mut leaves: Vec<Leaf> = Vec::new();
        let mut stream = Box::pin(self.walk_reachable());
        while let Some(entry) = stream.next().await {
            if let Ok(NodeEntry::Leaf(leaf)) = entry {
                leaves.push(leaf);
            }
        }
        Ok(leaves)
    }

    /// Writes the tree, breadth-first, as a proof CAR body: every MST node block
    /// followed by every leaf block it points to.
    pub async fn write_to_car_stream(
        &mut self,
        mut car: CarWriter<DuplexStream>,
    ) -> Result<CarWriter<DuplexStream>> {
        let mut leaves = CidSet::new(None);
        let mut to_fetch = CidSet::new(None);
        to_fetch.add(self.get_pointer().await?);
        while to_fetch.size() > 0 {
            let mut next_layer = CidSet::new(None);
            let fetched = {
                let storage_guard = self.storage.read().await;
                storage_guard.get_blocks(to_fetch.to_list()).await?
            };
            if !fetched.missing.is_empty() {
                return Err(anyhow::Error::new(DataStoreError::MissingBlocks(
                    "mst node".to_owned(),
                    fetched.missing,
                )));
            }
            for cid in to_fetch.to_list() {
                let found: ObjAndBytes =
                    parse::get_and_parse_by_kind(&fetched.blocks, cid, |obj: CborValue| {
                        serde_cbor::value::from_value::<NodeData>(obj).is_ok()
                    })?;
                car.write(cid, found.bytes).await?;
                let node_data: NodeData = serde_cbor::value::from_value(found.obj)?;
                let entries = util::deserialize_node_data(self.storage.clone(), &node_data, None)?;

                for entry in entries {
                    match entry {
                        NodeEntry::Leaf(l) => leaves.add(l.value),
                        NodeEntry::MST(m) => next_layer.add(m.get_pointer().await?),
                    }
                }
            }
            to_fetch = next_layer;
        }
        let leaf_data = {
            let storage_guard = self.storage.read().await;
            storage_guard.get_blocks(leaves.to_list()).await?
        };
        if !leaf_data.missing.is_empty() {
            return Err(anyhow::Error::new(DataStoreError::MissingBlocks(
                "mst leaf".to_owned(),
                leaf_data.missing,
            )));
        }
        for leaf in leaf_data.blocks.entries()? {
            car.write(leaf.cid, leaf.bytes).await?;
        }
        Ok(car)
    }

    #[async_recursion(Sync)]
    pub async fn cids_for_path(&mut self, key: String) -> Result<Vec<Cid>> {
        let mut cids: Vec<Cid> = vec![self.get_pointer().await?];
        let index = self.find_gt_or_equal_leaf_index(&key).await?;
        let found = self.at_index(index).await?;
        if let Some(NodeEntry::Leaf(l)) = found {
            if l.key == *key {
                cids.push(l.value);
                return Ok(cids);
            }
        }
        let prev = self.at_index(index - 1).await?;
        if let Some(NodeEntry::MST(mut p)) = prev {
            cids.append(&mut p.cids_for_path(key).await?);
            return Ok(cids);
        }
        Ok(cids)
    }

    #[async_recursion(Sync)]
    pub async fn add_blocks_for_path(&mut self, key: String, blocks: &mut BlockMap) -> Result<()> {
        let serialized = self.serialize().await?;
        blocks.set(serialized.cid, serialized.bytes);
        let index = self.find_gt_or_equal_leaf_index(&key).await?;
        let found = self.at_index(index).await?;
        if let Some(NodeEntry::Leaf(found)) = found {
            if found.key == key {
                return Ok(());
            }
        }
        match self.at_index(index - 1).await? {
            Some(NodeEntry::MST(mut prev)) => prev.add_blocks_for_path(key, blocks).await,
            _ => Ok(()),
        }
    }

    pub async fn save_mst(&self) -> Result<Cid> {
        let diff = self.get_unstored_blocks().await?;
        let storage = self.storage.read().await;
        storage
            .put_many(diff.blocks, rsky_common::tid::Ticker::new().next(None).to_string())
            .await?;
        Ok(diff.root)
    }
}

#[async_trait]
impl AsyncPartialEq for MST {
    async fn async_eq(&self, other: &Self) -> bool {
        let this_pointer = self
            .get_pointer()
            .await
            .expect("Failed to get pointer for `this`");
        let other_pointer = other
            .get_pointer()
            .await
            .expect("Failed to get pointer for `other`");
        this_pointer == other_pointer
    }
}

#[async_trait]
impl AsyncPartialEq<Leaf> for MST {
    async fn async_eq(&self, _other: &Leaf) -> bool {
        false
    }
}

#[async_trait]
impl AsyncPartialEq<NodeEntry> for MST {
    async fn async_eq(&self, other: &NodeEntry) -> bool {
        match other {
            NodeEntry::Leaf(_) => false,
            NodeEntry::MST(other) => {
                let this_pointer = self
                    .get_pointer()
                    .await
                    .expect("Failed to get pointer for `this`");
                let other_pointer = other
                    .get_pointer()
                    .await
                    .expect("Failed to get pointer for `other`");
                this_pointer == other_pointer
            }
        }
    }
}

pub mod diff;
pub mod util;
pub mod walker;
