//! The write-path contract of §4.3: validates and applies a batch of record writes to
//! a [`Repo`], persists the resulting commit, and emits the firehose event for it.
//!
//! [`Repo`] itself (§4.1 mirror + commit signing) stays a pure, storage-agnostic
//! engine; [`RepoManager`] is the layer that knows about repo lifecycle, the external
//! record validator, and the event log, the same split the MST/diff layer draws
//! between "what a commit is" and "what happens when one lands".

use crate::block_map::BlockMap;
use crate::car::blocks_to_car_file;
use crate::error::{DataStoreError, RepoError};
use crate::event::{
    AccountEvt, AccountEvtStatus, CommitEvt, CommitEvtOp, CommitEvtOpAction, EventBody,
    IdentityEvt, TombstoneEvt,
};
use crate::registry::RepoRegistry;
use crate::repo::Repo;
use crate::sequencer::EventLog;
use crate::types::{
    AtpRepo, RecordCreateOrUpdateOp, RecordDeleteOp, RecordWriteEnum, RecordWriteOp, RepoRecord,
    RepoStatus,
};
use crate::util::format_data_key;
use crate::validator::RecordValidator;
use anyhow::{anyhow, bail, Result};
use lexicon_cid::Cid;
use rsky_common::tid::Ticker;
use secp256k1::Keypair;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Above this many ops, or this many bytes of blocks, a commit event is marked
/// `tooBig` and ships only its commit block; subscribers must re-sync via CAR export
/// instead of hydrating from the firehose. Matches the "subtle correctness property"
/// called out in §4.3 for the ordinary (non-`tooBig`) path.
const MAX_OPS_PER_EVT: usize = 200;
const MAX_EVT_BYTES: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAction {
    Create,
    Update,
    Delete,
}

/// A single write request from a caller, before rkey defaulting and conflict
/// detection. `rkey` is `None` for a `create` that wants a freshly minted TID.
#[derive(Debug, Clone)]
pub struct WriteOp {
    pub action: WriteAction,
    pub collection: String,
    pub rkey: Option<String>,
    pub record: Option<RepoRecord>,
}

impl WriteOp {
    pub fn create(collection: impl Into<String>, record: RepoRecord) -> Self {
        Self {
            action: WriteAction::Create,
            collection: collection.into(),
            rkey: None,
            record: Some(record),
        }
    }

    pub fn update(collection: impl Into<String>, rkey: impl Into<String>, record: RepoRecord) -> Self {
        Self {
            action: WriteAction::Update,
            collection: collection.into(),
            rkey: Some(rkey.into()),
            record: Some(record),
        }
    }

    pub fn delete(collection: impl Into<String>, rkey: impl Into<String>) -> Self {
        Self {
            action: WriteAction::Delete,
            collection: collection.into(),
            rkey: Some(rkey.into()),
            record: None,
        }
    }
}

/// Everything [`RepoManager::apply_writes`] produced: the new commit plus the seq it
/// was recorded under on the event log.
#[derive(Debug, Clone)]
pub struct AppliedCommit {
    pub seq: i64,
    pub rev: String,
}

pub struct RepoManager {
    pub registry: Arc<dyn RepoRegistry>,
    pub event_log: Arc<dyn EventLog>,
    pub validator: Arc<dyn RecordValidator>,
    /// Which commit (by the seq it was sequenced under) introduced each block, so
    /// `export_car(since)` can answer "every block new since seq N" without the
    /// blockstore itself needing to track sequence numbers (§4.4, §9). Keyed by seq
    /// first and `did` second rather than per-repo maps, since the event log itself
    /// allocates one global seq space across every repo a `RepoManager` coordinates;
    /// `export_car` filters this down to the caller's `did` before resolving CIDs.
    block_seq: RwLock<BTreeMap<i64, (String, Vec<Cid>)>>,
}

impl RepoManager {
    pub fn new(
        registry: Arc<dyn RepoRegistry>,
        event_log: Arc<dyn EventLog>,
        validator: Arc<dyn RecordValidator>,
    ) -> Self {
        Self {
            registry,
            event_log,
            validator,
            block_seq: RwLock::new(BTreeMap::new()),
        }
    }

    /// Applies `ops` to `repo` as one commit (§4.3 steps 1-8): rejects writes against
    /// an inactive repo, mints rkeys for bare creates, rejects a batch that touches
    /// the same key twice, validates every record, signs and persists the commit, and
    /// finally sequences the firehose event for it.
    #[tracing::instrument(skip_all, fields(did = %repo.did()))]
    pub async fn apply_writes(
        &self,
        repo: &mut Repo,
        ops: Vec<WriteOp>,
        keypair: Keypair,
    ) -> Result<AppliedCommit> {
        let did = repo.did();
        let meta = self.registry.load_repo(&did, false).await?;
        if meta.status != RepoStatus::Active {
            warn!(%did, status = ?meta.status, "rejected writes against an inactive repo");
            bail!(RepoError::InactiveRepo(did));
        }

        let record_ops = self.resolve_ops(ops).await?;
        let commit_data = repo
            .format_commit(RecordWriteEnum::List(record_ops.clone()), keypair)
            .await?;
        let rev = commit_data.rev.clone();
        let commit_cid = commit_data.cid;

        *repo = repo.apply_commit(commit_data.clone()).await?;
        self.registry.update_head(&did, commit_cid, rev.clone()).await?;

        let commit_evt = Self::build_commit_evt(&did, &record_ops, &commit_data).await?;
        let seq_evt = self
            .event_log
            .append(did.clone(), EventBody::Commit(commit_evt))
            .await?;

        let new_cids = commit_data.new_blocks.cids()?;
        self.block_seq
            .write()
            .await
            .insert(seq_evt.seq, (did.clone(), new_cids));

        debug!(%did, seq = seq_evt.seq, rev = %rev, "applied writes and sequenced commit event");
        Ok(AppliedCommit {
            seq: seq_evt.seq,
            rev,
        })
    }

    /// Exports `repo`'s state as a CAR rooted at its current commit. `since` is the
    /// "every block whose introducing commit sequenced at or after this point" reading
    /// of §4.4 settled on for the Open Question in §9 -- not necessarily the minimal
    /// set a smarter diff could produce, but sufficient for a subscriber to catch up.
    /// `None` exports the full repo. `block_seq` is shared across every repo this
    /// manager coordinates, so entries are filtered down to `repo.did()` before any
    /// CID is resolved -- otherwise a second repo's commits landing in between would
    /// pull in blocks this repo's own storage never held.
    #[tracing::instrument(skip_all, fields(did = %repo.did(), since = ?since))]
    pub async fn export_car(&self, repo: &Repo, since: Option<i64>) -> Result<Vec<u8>> {
        let since = match since {
            None => return crate::sync::provider::get_full_repo(repo.storage.clone(), repo.cid).await,
            Some(since) => since,
        };
        let did = repo.did();

        let mut cids: Vec<Cid> = {
            let index = self.block_seq.read().await;
            index
                .range(since..)
                .filter(|(_, (repo_did, _))| *repo_did == did)
                .flat_map(|(_, (_, cids))| cids.iter().cloned())
                .collect()
        };
        cids.push(repo.cid);

        let storage = repo.storage.read().await;
        let found = storage.get_blocks(cids).await?;
        drop(storage);
        if !found.missing.is_empty() {
            warn!(%did, since, missing = found.missing.len(), "export_car found blocks missing from storage");
            bail!(DataStoreError::MissingBlocks(
                "exportCar".to_owned(),
                found.missing
            ));
        }

        debug!(%did, since, "exported incremental CAR");
        blocks_to_car_file(Some(&repo.cid), found.blocks).await
    }

    /// Marks a repo deactivated and emits the corresponding `account` event (§4.3,
    /// §6). Deactivated repos stay readable; only new writes are rejected.
    #[tracing::instrument(skip_all, fields(did))]
    pub async fn deactivate_repo(&self, did: &str) -> Result<i64> {
        self.registry.deactivate_repo(did).await?;
        let evt = AccountEvt {
            did: did.to_string(),
            active: false,
            status: Some(AccountEvtStatus::Deactivated),
        };
        let seq_evt = self.event_log.append(did.to_string(), EventBody::Account(evt)).await?;
        debug!(%did, seq = seq_evt.seq, "deactivated repo");
        Ok(seq_evt.seq)
    }

    /// Reactivates a previously deactivated repo. Rejects repos that have been
    /// tombstoned, per the registry's own invariant.
    #[tracing::instrument(skip_all, fields(did))]
    pub async fn activate_repo(&self, did: &str) -> Result<i64> {
        self.registry.activate_repo(did).await?;
        let evt = AccountEvt {
            did: did.to_string(),
            active: true,
            status: None,
        };
        let seq_evt = self.event_log.append(did.to_string(), EventBody::Account(evt)).await?;
        debug!(%did, seq = seq_evt.seq, "activated repo");
        Ok(seq_evt.seq)
    }

    /// Permanently tombstones a repo and emits both the legacy `tombstone` event and
    /// the modern `account` event carrying the same status, matching what subscribers
    /// built against either generation of the firehose expect to see (§6).
    #[tracing::instrument(skip_all, fields(did))]
    pub async fn tombstone_repo(&self, did: &str) -> Result<i64> {
        self.registry.tombstone_repo(did).await?;
        let account_evt = AccountEvt {
            did: did.to_string(),
            active: false,
            status: Some(AccountEvtStatus::Deleted),
        };
        self.event_log
            .append(did.to_string(), EventBody::Account(account_evt))
            .await?;
        let tombstone_evt = TombstoneEvt { did: did.to_string() };
        let seq_evt = self
            .event_log
            .append(did.to_string(), EventBody::Tombstone(tombstone_evt))
            .await?;
        warn!(%did, seq = seq_evt.seq, "tombstoned repo");
        Ok(seq_evt.seq)
    }

    /// Announces a handle change (or any other identity update) without touching the
    /// repo's commit chain; the MST/commit layer has no notion of a handle.
    #[tracing::instrument(skip_all, fields(did))]
    pub async fn update_identity(&self, did: &str, handle: Option<String>) -> Result<i64> {
        let evt = IdentityEvt {
            did: did.to_string(),
            handle,
        };
        let seq_evt = self.event_log.append(did.to_string(), EventBody::Identity(evt)).await?;
        debug!(%did, seq = seq_evt.seq, "updated identity");
        Ok(seq_evt.seq)
    }

    /// Defaults missing rkeys to a fresh TID, rejects ill-formed ops (a delete with no
    /// rkey, a create/update with no record), validates every record, and rejects a
    /// batch with two ops for the same `collection/rkey`.
    async fn resolve_ops(&self, ops: Vec<WriteOp>) -> Result<Vec<RecordWriteOp>> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut resolved = Vec::with_capacity(ops.len());

        for op in ops {
            let rkey = match (&op.action, op.rkey) {
                (WriteAction::Create, None) => Ticker::new().next(None).to_string(),
                (_, Some(rkey)) => rkey,
                (WriteAction::Update, None) => bail!("update op missing rkey"),
                (WriteAction::Delete, None) => bail!("delete op missing rkey"),
            };

            let key = format_data_key(op.collection.clone(), rkey.clone());
            if !seen.insert(key.clone()) {
                warn!(key = %key, "rejected a batch with conflicting writes for the same key");
                bail!(RepoError::ConflictingWrites(key));
            }

            match op.action {
                WriteAction::Delete => {
                    resolved.push(RecordWriteOp::Delete(RecordDeleteOp {
                        action: crate::types::WriteOpAction::Delete,
                        collection: op.collection,
                        rkey,
                    }));
                }
                WriteAction::Create | WriteAction::Update => {
                    let record = op
                        .record
                        .ok_or_else(|| anyhow!("create/update op missing record"))?;
                    self.validator
                        .validate(&op.collection, &record)
                        .await
                        .map_err(|e| RepoError::ValidationError(e.to_string()))?;
                    let action = if op.action == WriteAction::Create {
                        crate::types::WriteOpAction::Create
                    } else {
                        crate::types::WriteOpAction::Update
                    };
                    let write = RecordCreateOrUpdateOp {
                        action: action.clone(),
                        collection: op.collection,
                        rkey,
                        record,
                    };
                    resolved.push(if action == crate::types::WriteOpAction::Create {
                        RecordWriteOp::Create(write)
                    } else {
                        RecordWriteOp::Update(write)
                    });
                }
            }
        }

        Ok(resolved)
    }

    /// Builds the `commit` firehose payload for a just-applied commit: every new MST
    /// node and every created/updated record block (never deleted ones), as a CAR
    /// keyed on the commit CID, per §4.3.
    async fn build_commit_evt(
        did: &str,
        ops: &[RecordWriteOp],
        commit_data: &crate::types::CommitData,
    ) -> Result<CommitEvt> {
        let mut blocks_to_send = BlockMap::new();
        blocks_to_send.add_map(commit_data.new_blocks.clone())?;
        blocks_to_send.add_map(commit_data.relevant_blocks.clone())?;

        let too_big = ops.len() > MAX_OPS_PER_EVT || blocks_to_send.byte_size()? > MAX_EVT_BYTES;
        if too_big {
            warn!(repo = %did, ops = ops.len(), "commit event exceeded tooBig threshold, shipping root block only");
        }

        let (car_bytes, evt_ops) = if too_big {
            let mut just_root = BlockMap::new();
            if let Some(bytes) = blocks_to_send.get(commit_data.cid) {
                just_root.set(commit_data.cid, bytes);
            }
            let car = blocks_to_car_file(Some(&commit_data.cid), just_root).await?;
            (car, Vec::new())
        } else {
            let mut evt_ops = Vec::with_capacity(ops.len());
            for op in ops {
                // `create`/`update` always report the new record's CID, even if that
                // exact block already existed in storage: subscribers must be able to
                // hydrate the record straight from this event, per §4.3.
                let (action, cid) = match op {
                    RecordWriteOp::Create(write) => (
                        CommitEvtOpAction::Create,
                        Some(rsky_common::ipld::cid_for_cbor(&write.record)?),
                    ),
                    RecordWriteOp::Update(write) => (
                        CommitEvtOpAction::Update,
                        Some(rsky_common::ipld::cid_for_cbor(&write.record)?),
                    ),
                    RecordWriteOp::Delete(_) => (CommitEvtOpAction::Delete, None),
                };
                evt_ops.push(CommitEvtOp {
                    action,
                    path: format_data_key(op.collection(), op.rkey()),
                    cid,
                });
            }
            let car = blocks_to_car_file(Some(&commit_data.cid), blocks_to_send).await?;
            (car, evt_ops)
        };

        Ok(CommitEvt {
            rebase: false,
            too_big,
            repo: did.to_string(),
            commit: commit_data.cid,
            prev: commit_data.prev,
            rev: commit_data.rev.clone(),
            since: commit_data.since.clone(),
            blocks: car_bytes,
            ops: evt_ops,
            blobs: Vec::new(),
        })
    }

    #[tracing::instrument(skip_all, fields(did = %did))]
    pub async fn create_repo_metadata(
        &self,
        did: String,
        head: lexicon_cid::Cid,
        rev: String,
        signing_key: String,
        rotation_key: Option<String>,
        handle: Option<String>,
    ) -> Result<()> {
        self.registry
            .create_repo(AtpRepo {
                did: did.clone(),
                head,
                rev,
                signing_key,
                rotation_key,
                handle,
                status: RepoStatus::Active,
                created_at: rsky_common::now(),
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRepoRegistry;
    use crate::sequencer::InMemoryEventLog;
    use crate::storage::memory_blockstore::MemoryBlockstore;
    use crate::validator::NoopValidator;
    use rand::thread_rng;
    use rsky_crypto::utils::encode_did_key;
    use secp256k1::Secp256k1;
    use serde_json::json;

    fn sample_record(name: &str) -> RepoRecord {
        serde_json::from_value(json!({ "name": name })).unwrap()
    }

    async fn fixture() -> (RepoManager, Repo, Keypair, String) {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut thread_rng());
        let did = encode_did_key(&keypair.public_key());

        let storage = Arc::new(RwLock::new(MemoryBlockstore::default()));
        let repo = Repo::create(storage, did.clone(), keypair, None).await.unwrap();

        let registry = Arc::new(InMemoryRepoRegistry::new());
        registry
            .create_repo(AtpRepo {
                did: did.clone(),
                head: repo.cid,
                rev: repo.commit.rev.clone(),
                signing_key: encode_did_key(&keypair.public_key()),
                rotation_key: None,
                handle: None,
                status: RepoStatus::Active,
                created_at: rsky_common::now(),
            })
            .await
            .unwrap();

        let manager = RepoManager::new(registry, Arc::new(InMemoryEventLog::new(None)), Arc::new(NoopValidator));
        (manager, repo, keypair, did)
    }

    #[tokio::test]
    async fn applies_a_create_and_sequences_a_commit_event() {
        let (manager, mut repo, keypair, _did) = fixture().await;

        let applied = manager
            .apply_writes(
                &mut repo,
                vec![WriteOp::create("com.example.posts", sample_record("hello"))],
                keypair,
            )
            .await
            .unwrap();

        assert_eq!(applied.seq, 1);
        assert_eq!(manager.event_log.last_seq(), 1);
    }

    #[tokio::test]
    async fn rejects_writes_against_an_inactive_repo() {
        let (manager, mut repo, keypair, did) = fixture().await;
        manager.registry.deactivate_repo(&did).await.unwrap();

        let err = manager
            .apply_writes(
                &mut repo,
                vec![WriteOp::create("com.example.posts", sample_record("hello"))],
                keypair,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("inactive"));
    }

    #[tokio::test]
    async fn rejects_a_batch_with_two_ops_on_the_same_key() {
        let (manager, mut repo, keypair, _did) = fixture().await;
        let err = manager
            .apply_writes(
                &mut repo,
                vec![
                    WriteOp::update("com.example.posts", "aaaaaaaaaaaaa", sample_record("a")),
                    WriteOp::delete("com.example.posts", "aaaaaaaaaaaaa"),
                ],
                keypair,
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("conflicting"));
    }

    #[tokio::test]
    async fn export_car_since_a_seq_includes_only_later_blocks() {
        let (manager, mut repo, keypair, _did) = fixture().await;

        manager
            .apply_writes(
                &mut repo,
                vec![WriteOp::create("com.example.posts", sample_record("one"))],
                keypair,
            )
            .await
            .unwrap();
        let second = manager
            .apply_writes(
                &mut repo,
                vec![WriteOp::create("com.example.posts", sample_record("two"))],
                keypair,
            )
            .await
            .unwrap();

        let full = manager.export_car(&repo, None).await.unwrap();
        let partial = manager.export_car(&repo, Some(second.seq)).await.unwrap();
        assert!(partial.len() < full.len());
    }

    #[tokio::test]
    async fn lifecycle_transitions_emit_account_and_tombstone_events() {
        let (manager, _repo, _keypair, did) = fixture().await;

        manager.deactivate_repo(&did).await.unwrap();
        manager.activate_repo(&did).await.unwrap();
        manager.tombstone_repo(&did).await.unwrap();

        assert!(manager.registry.load_repo(&did, true).await.unwrap().status == RepoStatus::Tombstoned);
        assert_eq!(manager.event_log.last_seq(), 4);
    }
}
