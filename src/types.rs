use crate::block_map::BlockMap;
use crate::cid_set::CidSet;
use crate::storage::Ipld;
use lexicon_cid::Cid;
use std::collections::BTreeMap;

// Repo nodes
// ---------------

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct UnsignedCommit {
    pub did: String,
    pub version: u8, // Should be 3
    pub data: Cid,
    pub rev: String,
    // `prev` kept for backwards compatibility with v2, no requirement of keeping around history
    pub prev: Option<Cid>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Commit {
    pub did: String,
    pub version: u8, // Should be 3
    pub data: Cid,
    pub rev: String,
    pub prev: Option<Cid>,
    pub sig: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LegacyV2Commit {
    pub did: String,
    pub version: u8, // Should be 2
    pub data: Cid,
    pub rev: Option<String>,
    pub prev: Option<Cid>,
    pub sig: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum VersionedCommit {
    Commit(Commit),
    LegacyV2Commit(LegacyV2Commit),
}

impl VersionedCommit {
    pub fn data(&self) -> Cid {
        match self {
            VersionedCommit::Commit(c) => c.data,
            VersionedCommit::LegacyV2Commit(c) => c.data,
        }
    }

    pub fn did(&self) -> &String {
        match self {
            VersionedCommit::Commit(c) => &c.did,
            VersionedCommit::LegacyV2Commit(c) => &c.did,
        }
    }

    pub fn version(&self) -> u8 {
        match self {
            VersionedCommit::Commit(c) => c.version,
            VersionedCommit::LegacyV2Commit(c) => c.version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum Lex {
    Ipld(Ipld),
    List(Vec<Lex>),
    Map(BTreeMap<String, Lex>),
}

// Repo Operations
// ---------------

pub type RepoRecord = BTreeMap<String, Lex>;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum WriteOpAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RecordCreateOrUpdateOp {
    pub action: WriteOpAction,
    pub collection: String,
    pub rkey: String,
    pub record: RepoRecord,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RecordDeleteOp {
    pub action: WriteOpAction,
    pub collection: String,
    pub rkey: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum RecordWriteOp {
    Create(RecordCreateOrUpdateOp),
    Update(RecordCreateOrUpdateOp),
    Delete(RecordDeleteOp),
}

impl RecordWriteOp {
    pub fn collection(&self) -> String {
        match self {
            RecordWriteOp::Create(op) => op.collection.clone(),
            RecordWriteOp::Update(op) => op.collection.clone(),
            RecordWriteOp::Delete(op) => op.collection.clone(),
        }
    }

    pub fn rkey(&self) -> String {
        match self {
            RecordWriteOp::Create(op) => op.rkey.clone(),
            RecordWriteOp::Update(op) => op.rkey.clone(),
            RecordWriteOp::Delete(op) => op.rkey.clone(),
        }
    }

    pub fn action(&self) -> WriteOpAction {
        match self {
            RecordWriteOp::Create(op) => op.action.clone(),
            RecordWriteOp::Update(op) => op.action.clone(),
            RecordWriteOp::Delete(op) => op.action.clone(),
        }
    }
}

/// A batch of writes to apply in one commit. `Single` is a convenience for the common
/// one-record case; both forms go through the same validation and diff path.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum RecordWriteEnum {
    List(Vec<RecordWriteOp>),
    Single(RecordWriteOp),
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RecordCreateOrDeleteDescript {
    pub action: WriteOpAction,
    pub collection: String,
    pub rkey: String,
    pub cid: Cid,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RecordUpdateDescript {
    pub action: WriteOpAction,
    pub collection: String,
    pub rkey: String,
    pub prev: Cid,
    pub cid: Cid,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum RecordWriteDescript {
    Create(RecordCreateOrDeleteDescript),
    Update(RecordUpdateDescript),
    Delete(RecordCreateOrDeleteDescript),
}

pub type WriteLog = Vec<Vec<RecordWriteDescript>>;

// Updates/Commits
// ---------------

/// Everything needed to persist a commit: the new head, the blocks it introduces, and
/// the blocks it makes unreachable. `relevant_blocks` is the subset of `new_blocks`
/// (plus any unchanged blocks on the write paths) that a proof consumer needs in order
/// to verify the ops that produced this commit; it's usually smaller than `new_blocks`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CommitData {
    pub cid: Cid,
    pub rev: String,
    pub since: Option<String>,
    pub prev: Option<Cid>,
    pub new_blocks: BlockMap,
    pub relevant_blocks: BlockMap,
    pub removed_cids: CidSet,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RepoUpdate {
    pub cid: Cid,
    pub rev: String,
    pub since: Option<String>,
    pub prev: Option<Cid>,
    pub new_blocks: BlockMap,
    pub removed_cids: CidSet,
    pub ops: Vec<RecordWriteOp>,
}

pub type CollectionContents = BTreeMap<String, RepoRecord>;
pub type RepoContents = BTreeMap<String, CollectionContents>;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RepoRecordWithCid {
    pub cid: Cid,
    pub value: RepoRecord,
}
pub type CollectionContentsWithCids = BTreeMap<String, RepoRecordWithCid>;
pub type RepoContentsWithCids = BTreeMap<String, CollectionContentsWithCids>;

pub type DatastoreContents = BTreeMap<String, Cid>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
pub struct RecordPath {
    pub collection: String,
    pub rkey: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RecordClaim {
    pub collection: String,
    pub rkey: String,
    pub record: Option<RepoRecord>,
}

/// A claim of what CID (or absence) a caller expects to find at a record path; used to
/// verify inclusion/exclusion proofs against a CAR of relevant blocks.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RecordCidClaim {
    pub collection: String,
    pub rkey: String,
    pub cid: Option<Cid>,
}

// Sync
// ---------------

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VerifiedDiff {
    pub writes: Vec<RecordWriteDescript>,
    pub commit: CommitData,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct VerifiedRepo {
    pub creates: Vec<RecordCreateOrDeleteDescript>,
    pub commit: CommitData,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CidAndBytes {
    pub cid: Cid,
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
}

pub type CarBlock = CidAndBytes;

// Repo lifecycle
// ---------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoStatus {
    Active,
    Deactivated,
    Tombstoned,
}

/// The account-level wrapper around a repository's identity and signing material.
/// The MST + commit chain itself is mirrored by [`crate::repo::Repo`]; this is the
/// bookkeeping a storage back-end needs to answer `load_repo`/`create_repo` calls.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AtpRepo {
    pub did: String,
    pub head: Cid,
    pub rev: String,
    pub signing_key: String,
    pub rotation_key: Option<String>,
    pub handle: Option<String>,
    pub status: RepoStatus,
    pub created_at: String,
}
