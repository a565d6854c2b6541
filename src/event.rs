//! Wire payloads for the `subscribeRepos` firehose (§6) and the persisted event
//! envelope each one travels in (§3 "Event").
//!
//! These types describe what goes *out*; [`crate::sequencer`] decides *when*.

use lexicon_cid::Cid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CommitEvtOpAction {
    Create,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CommitEvtOp {
    pub action: CommitEvtOpAction,
    pub path: String,
    pub cid: Option<Cid>,
}

/// Payload of a `commit` firehose frame. `blocks` is a CAR archive containing exactly
/// the blocks needed to apply this commit: new MST nodes reachable from the new root,
/// and every record block created or updated (never deleted ones, see
/// [`crate::manager::RepoManager`]).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CommitEvt {
    pub rebase: bool,
    #[serde(rename = "tooBig")]
    pub too_big: bool,
    pub repo: String,
    pub commit: Cid,
    pub prev: Option<Cid>,
    pub rev: String,
    pub since: Option<String>,
    #[serde(with = "serde_bytes")]
    pub blocks: Vec<u8>,
    pub ops: Vec<CommitEvtOp>,
    pub blobs: Vec<Cid>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct IdentityEvt {
    pub did: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountEvtStatus {
    Deactivated,
    Suspended,
    Takendown,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AccountEvt {
    pub did: String,
    pub active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<AccountEvtStatus>,
}

/// Legacy-compatibility event: superseded by `account` but still emitted for repos
/// that cross into the `tombstoned` status, per §6.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TombstoneEvt {
    pub did: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub enum EventBody {
    Commit(CommitEvt),
    Identity(IdentityEvt),
    Account(AccountEvt),
    Tombstone(TombstoneEvt),
}

impl EventBody {
    pub fn kind(&self) -> &'static str {
        match self {
            EventBody::Commit(_) => "commit",
            EventBody::Identity(_) => "identity",
            EventBody::Account(_) => "account",
            EventBody::Tombstone(_) => "tombstone",
        }
    }
}

/// The persisted entry a [`crate::sequencer::EventLog`] hands back to readers: a
/// process-wide monotone `seq`, the repo it's about, and the typed body above.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SeqEvent {
    pub seq: i64,
    pub repo_did: String,
    pub time: String,
    pub body: EventBody,
}
