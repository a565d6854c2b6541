use crate::block_map::BlockMap;
use crate::car::{blocks_to_car_file, write_car_stream};
use crate::cid_set::CidSet;
use crate::error::DataStoreError;
use crate::mst::MST;
use crate::storage::types::RepoStorage;
use crate::types::{Commit, RecordPath};
use crate::util;
use anyhow::Result;
use lexicon_cid::Cid;
use serde_cbor::Value as CborValue;
use std::sync::Arc;
use tokio::sync::RwLock;

pub async fn get_records(
    storage: Arc<RwLock<dyn RepoStorage>>,
    commit_cid: Cid,
    paths: Vec<RecordPath>,
) -> Result<Vec<u8>> {
    let mut car = BlockMap::new();
    let storage_guard = storage.read().await;
    let commit = storage_guard
        .read_obj_and_bytes(
            &commit_cid,
            Box::new(|obj: CborValue| {
                serde_cbor::value::from_value::<Commit>(obj.clone()).is_ok()
            }),
        )
        .await?;
    let data: Commit = serde_cbor::value::from_value(commit.obj)?;
    car.set(commit_cid, commit.bytes);
    let mut mst = MST::load(storage.clone(), data.data, None)?;
    let mut all_cids = CidSet::new(None);
    for path in paths {
        let key = util::format_data_key(path.collection, path.rkey);
        let cids = mst.cids_for_path(key).await?;
        all_cids.add_set(CidSet::new(Some(cids)));
    }
    let found = storage_guard.get_blocks(all_cids.to_list()).await?;
    if !found.missing.is_empty() {
        return Err(anyhow::Error::new(DataStoreError::MissingBlocks(
            "writeRecordsToCarStream".to_owned(),
            found.missing,
        )));
    }
    for block in found.blocks.entries()? {
        car.set(block.cid, block.bytes)
    }
    blocks_to_car_file(Some(&commit_cid), car).await
}

/// Streams a full repo export: the signed commit block followed by every MST node
/// and record leaf reachable from it, as a single-root CAR.
pub async fn get_full_repo(storage: Arc<RwLock<dyn RepoStorage>>, head: Cid) -> Result<Vec<u8>> {
    let storage_guard = storage.read().await;
    let commit = storage_guard
        .read_obj_and_bytes(
            &head,
            Box::new(|obj: CborValue| {
                serde_cbor::value::from_value::<Commit>(obj.clone()).is_ok()
            }),
        )
        .await?;
    let data: Commit = serde_cbor::value::from_value(commit.obj.clone())?;
    drop(storage_guard);

    let mut mst = MST::load(storage.clone(), data.data, None)?;
    let commit_bytes = commit.bytes;

    let car_stream = write_car_stream(Some(&head), move |mut writer| async move {
        writer.write(head, commit_bytes).await?;
        let writer = mst.write_to_car_stream(writer).await?;
        Ok(writer)
    });
    util::stream_to_buffer(Box::pin(car_stream)).await
}
