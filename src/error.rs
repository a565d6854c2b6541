use lexicon_cid::Cid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataStoreError {
    #[error("missing block `{0}`")]
    MissingBlock(String),
    #[error("missing `{0}` blocks: `{1:?}`")]
    MissingBlocks(String, Vec<Cid>),
    #[error("unexpected object at `{0}`")]
    UnexpectedObject(Cid),
    #[error("unknown data store error")]
    Unknown,
}

#[derive(Error, Debug)]
pub enum RepoError {
    #[error("Commit was at`{0}`")]
    BadCommitSwapError(Cid),
    #[error("Record was at`{0:?}`")]
    BadRecordSwapError(Option<Cid>),
    #[error("Invalid record error")]
    InvalidRecordError,
    #[error("invalid key: `{0}`")]
    InvalidKey(String),
    #[error("key not found: `{0}`")]
    KeyNotFound(String),
    #[error("key already exists: `{0}`")]
    KeyExists(String),
    #[error("repo not found: `{0}`")]
    RepoNotFound(String),
    #[error("repo is inactive: `{0}`")]
    InactiveRepo(String),
    #[error("batch contains conflicting writes for key: `{0}`")]
    ConflictingWrites(String),
    #[error("record failed validation: `{0}`")]
    ValidationError(String),
    #[error("block not found: `{0}`")]
    BlockNotFound(Cid),
}

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("Blob not found")]
    BlobNotFoundError,
}

#[derive(Error, Debug)]
pub enum SeqError {
    #[error("cursor `{0}` is ahead of the last known sequence `{1}`")]
    FutureCursor(i64, i64),
    #[error("cursor `{0}` falls outside the retained rollback window (earliest available: `{1}`)")]
    OutdatedCursor(i64, i64),
}
