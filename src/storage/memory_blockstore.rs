use crate::block_map::{BlockMap, BlocksAndMissing};
use crate::storage::readable_blockstore::ReadableBlockstore;
use crate::storage::types::RepoStorage;
use crate::types::CommitData;
use anyhow::Result;
use lexicon_cid::Cid;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory block store, primarily useful for tests and for staging
/// writes before they're flushed to a durable backend.
#[derive(Debug)]
pub struct MemoryBlockstore {
    blocks: Arc<RwLock<BlockMap>>,
    root: Arc<RwLock<Option<Cid>>>,
    rev: Arc<RwLock<Option<String>>>,
}

impl Default for MemoryBlockstore {
    fn default() -> Self {
        Self {
            blocks: Arc::new(RwLock::new(BlockMap::new())),
            root: Arc::new(RwLock::new(None)),
            rev: Arc::new(RwLock::new(None)),
        }
    }
}

impl MemoryBlockstore {
    pub async fn new(blocks: Option<BlockMap>) -> Result<Self> {
        Ok(Self {
            blocks: Arc::new(RwLock::new(blocks.unwrap_or_else(BlockMap::new))),
            root: Arc::new(RwLock::new(None)),
            rev: Arc::new(RwLock::new(None)),
        })
    }
}

impl ReadableBlockstore for MemoryBlockstore {
    fn get_bytes<'a>(
        &'a self,
        cid: &'a Cid,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Vec<u8>>>> + Send + Sync + 'a>> {
        Box::pin(async move {
            let blocks = self.blocks.read().await;
            Ok(blocks.get(*cid))
        })
    }

    fn has<'a>(
        &'a self,
        cid: Cid,
    ) -> Pin<Box<dyn Future<Output = Result<bool>> + Send + Sync + 'a>> {
        Box::pin(async move {
            let blocks = self.blocks.read().await;
            Ok(blocks.has(cid))
        })
    }

    fn get_blocks<'a>(
        &'a self,
        cids: Vec<Cid>,
    ) -> Pin<Box<dyn Future<Output = Result<BlocksAndMissing>> + Send + Sync + 'a>> {
        Box::pin(async move {
            let blocks = self.blocks.read().await;
            Ok(blocks.get_many(cids)?)
        })
    }
}

impl RepoStorage for MemoryBlockstore {
    fn get_root<'a>(&'a self) -> Pin<Box<dyn Future<Output = Option<Cid>> + Send + Sync + 'a>> {
        Box::pin(async move {
            let root = self.root.read().await;
            *root
        })
    }

    fn put_block<'a>(
        &'a self,
        cid: Cid,
        bytes: Vec<u8>,
        _rev: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + Sync + 'a>> {
        Box::pin(async move {
            let mut blocks = self.blocks.write().await;
            blocks.set(cid, bytes);
            Ok(())
        })
    }

    fn put_many<'a>(
        &'a self,
        to_put: BlockMap,
        _rev: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + Sync + 'a>> {
        Box::pin(async move {
            let mut blocks = self.blocks.write().await;
            blocks.add_map(to_put)?;
            Ok(())
        })
    }

    fn update_root<'a>(
        &'a self,
        cid: Cid,
        rev: String,
        _is_create: Option<bool>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + Sync + 'a>> {
        Box::pin(async move {
            let mut root = self.root.write().await;
            *root = Some(cid);
            let mut rev_guard = self.rev.write().await;
            *rev_guard = Some(rev);
            Ok(())
        })
    }

    fn apply_commit<'a>(
        &'a self,
        commit: CommitData,
        _is_create: Option<bool>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + Sync + 'a>> {
        Box::pin(async move {
            let mut root_guard = self.root.write().await;
            *root_guard = Some(commit.cid);
            let mut rev_guard = self.rev.write().await;
            *rev_guard = Some(commit.rev);
            let rm_cids = commit.removed_cids.to_list();
            let mut block_guard = self.blocks.write().await;
            for cid in rm_cids {
                block_guard.delete(cid)?;
            }
            for (cid, bytes) in commit.new_blocks.map.iter() {
                block_guard.set(Cid::from_str(cid)?, bytes.clone());
            }
            Ok(())
        })
    }
}
