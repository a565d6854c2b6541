//! Durable, cross-process back-ends for [`crate::sequencer::EventLog`] and
//! [`crate::registry::RepoRegistry`], built on an embedded `surrealdb` store the same
//! way the sibling car-store crate in this workspace keeps its shard metadata: one
//! `Surreal<Db>` handle, `SCHEMALESS` tables defined up front, plain `query`/`bind`
//! calls instead of an ORM.
//!
//! There is deliberately no durable [`crate::storage::types::RepoStorage`] here --
//! §4.2 only specifies the block store's abstract contract, and the in-memory
//! implementation already serves as that contract's reference and test oracle. What
//! genuinely needs to survive a restart is repo metadata and the event log, so that's
//! what this module covers.

use crate::error::{RepoError, SeqError};
use crate::event::{EventBody, SeqEvent};
use crate::registry::RepoRegistry;
use crate::sequencer::EventLog;
use crate::types::{AtpRepo, RepoStatus};
use anyhow::Result;
use async_trait::async_trait;
use lexicon_cid::Cid;
use rsky_common::env::env_str;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use surrealdb::engine::local::{Db, RocksDb};
use surrealdb::Surreal;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Opens (and migrates, if needed) the on-disk store both [`SurrealEventLog`] and
/// [`SurrealRepoRegistry`] read from. Typically called once per process and shared.
#[tracing::instrument(skip_all)]
pub async fn open(db_path: Option<&str>) -> Result<Surreal<Db>> {
    let path = db_path
        .map(str::to_owned)
        .or_else(|| env_str("ATPROTO_REPO_DB_PATH"))
        .unwrap_or_else(|| "data/atproto-repo".to_string());
    debug!(path = %path, "opening durable store");
    let db = Surreal::new::<RocksDb>(path).await?;
    db.use_ns("atproto_repo").use_db("core").await?;
    db.query(
        "
        DEFINE TABLE event SCHEMALESS;
        DEFINE INDEX idx_event_seq ON event FIELDS seq UNIQUE;
        DEFINE TABLE repo SCHEMALESS;
        DEFINE INDEX idx_repo_did ON repo FIELDS did UNIQUE;
        DEFINE INDEX idx_repo_handle ON repo FIELDS handle;
    ",
    )
    .await?;
    Ok(db)
}

/// Durable event log. Sequence numbers are allocated in memory (an `AtomicI64`, same
/// as [`crate::sequencer::InMemoryEventLog`]) and seeded from the store's highest
/// persisted `seq` at startup, so a restart never reuses a sequence number.
pub struct SurrealEventLog {
    db: Surreal<Db>,
    next_seq: AtomicI64,
    rollback_window: Option<usize>,
    notify: Arc<Notify>,
}

impl SurrealEventLog {
    #[tracing::instrument(skip_all)]
    pub async fn new(db: Surreal<Db>, rollback_window: Option<usize>) -> Result<Self> {
        let mut response = db
            .query("SELECT * FROM event ORDER BY seq DESC LIMIT 1")
            .await?;
        let latest: Option<SeqEvent> = response.take(0)?;
        Ok(Self {
            db,
            next_seq: AtomicI64::new(latest.map(|evt| evt.seq).unwrap_or(0)),
            rollback_window,
            notify: Arc::new(Notify::new()),
        })
    }

    async fn trim_to_window(&self) -> Result<()> {
        let Some(window) = self.rollback_window else {
            return Ok(());
        };
        let cutoff = self.next_seq.load(Ordering::SeqCst) - window as i64;
        if cutoff > 0 {
            self.db
                .query("DELETE event WHERE seq <= $cutoff")
                .bind(("cutoff", cutoff))
                .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventLog for SurrealEventLog {
    fn allocate_seq(&self) -> i64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn last_seq(&self) -> i64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    #[tracing::instrument(skip_all, fields(repo_did = %repo_did))]
    async fn append(&self, repo_did: String, body: EventBody) -> Result<SeqEvent> {
        let seq = self.allocate_seq();
        let evt = SeqEvent {
            seq,
            repo_did,
            time: rsky_common::now(),
            body,
        };
        let _: Option<SeqEvent> = self
            .db
            .create(("event", seq))
            .content(evt.clone())
            .await?;
        self.trim_to_window().await?;
        self.notify.notify_waiters();
        debug!(seq, "appended event to durable log");
        Ok(evt)
    }

    #[tracing::instrument(skip_all, fields(cursor, repo_did = ?repo_did, limit))]
    async fn read_since(
        &self,
        cursor: i64,
        repo_did: Option<&str>,
        limit: usize,
    ) -> Vec<SeqEvent> {
        let query = match repo_did {
            Some(_) => {
                "SELECT * FROM event WHERE seq > $cursor AND repo_did = $repo_did ORDER BY seq ASC LIMIT $limit"
            }
            None => "SELECT * FROM event WHERE seq > $cursor ORDER BY seq ASC LIMIT $limit",
        };
        let mut builder = self.db.query(query).bind(("cursor", cursor)).bind(("limit", limit as i64));
        if let Some(did) = repo_did {
            builder = builder.bind(("repo_did", did.to_string()));
        }
        match builder.await {
            Ok(mut response) => response.take::<Vec<SeqEvent>>(0).unwrap_or_default(),
            Err(err) => {
                warn!(cursor, error = %err, "read_since query failed, returning no events");
                Vec::new()
            }
        }
    }

    #[tracing::instrument(skip_all)]
    async fn earliest_retained_seq(&self) -> Option<i64> {
        let mut response = self
            .db
            .query("SELECT * FROM event ORDER BY seq ASC LIMIT 1")
            .await
            .ok()?;
        let earliest: Option<SeqEvent> = response.take(0).ok()?;
        earliest.map(|evt| evt.seq)
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

/// Durable repo registry, keyed by `did` with a unique secondary index on `handle`.
pub struct SurrealRepoRegistry {
    db: Surreal<Db>,
}

#[derive(Debug, Deserialize)]
struct HeadRow {
    did: String,
}

impl SurrealRepoRegistry {
    pub fn new(db: Surreal<Db>) -> Self {
        Self { db }
    }

    async fn resolve_did(&self, did_or_handle: &str) -> Result<String, RepoError> {
        let found: Option<AtpRepo> = self
            .db
            .select(("repo", did_or_handle))
            .await
            .map_err(|_| RepoError::RepoNotFound(did_or_handle.to_string()))?;
        if found.is_some() {
            return Ok(did_or_handle.to_string());
        }
        let mut response = self
            .db
            .query("SELECT did FROM repo WHERE handle = $handle LIMIT 1")
            .bind(("handle", did_or_handle.to_string()))
            .await
            .map_err(|_| RepoError::RepoNotFound(did_or_handle.to_string()))?;
        let row: Option<HeadRow> = response
            .take(0)
            .map_err(|_| RepoError::RepoNotFound(did_or_handle.to_string()))?;
        row.map(|r| r.did)
            .ok_or_else(|| RepoError::RepoNotFound(did_or_handle.to_string()))
    }
}

#[async_trait]
impl RepoRegistry for SurrealRepoRegistry {
    #[tracing::instrument(skip_all, fields(did = %repo.did))]
    async fn create_repo(&self, repo: AtpRepo) -> Result<()> {
        let did = repo.did.clone();
        let _: Option<AtpRepo> = self.db.create(("repo", did)).content(repo).await?;
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(did_or_handle = %did_or_handle, allow_inactive))]
    async fn load_repo(&self, did_or_handle: &str, allow_inactive: bool) -> Result<AtpRepo> {
        let did = self.resolve_did(did_or_handle).await?;
        let repo: Option<AtpRepo> = self.db.select(("repo", &did)).await?;
        let repo = repo.ok_or_else(|| RepoError::RepoNotFound(did_or_handle.to_string()))?;
        if repo.status == RepoStatus::Tombstoned && !allow_inactive {
            return Err(RepoError::InactiveRepo(did).into());
        }
        Ok(repo)
    }

    #[tracing::instrument(skip_all, fields(did = %did, rev = %rev))]
    async fn update_head(&self, did: &str, head: Cid, rev: String) -> Result<()> {
        let mut repo: AtpRepo = self
            .db
            .select(("repo", did))
            .await?
            .ok_or_else(|| RepoError::RepoNotFound(did.to_string()))?;
        repo.head = head;
        repo.rev = rev;
        let _: Option<AtpRepo> = self.db.update(("repo", did)).content(repo).await?;
        debug!(%did, "updated repo head");
        Ok(())
    }

    #[tracing::instrument(skip_all, fields(did = %did))]
    async fn deactivate_repo(&self, did: &str) -> Result<()> {
        self.set_status(did, RepoStatus::Deactivated).await
    }

    #[tracing::instrument(skip_all, fields(did = %did))]
    async fn activate_repo(&self, did: &str) -> Result<()> {
        let repo: Option<AtpRepo> = self.db.select(("repo", did)).await?;
        let repo = repo.ok_or_else(|| RepoError::RepoNotFound(did.to_string()))?;
        if repo.status == RepoStatus::Tombstoned {
            warn!(%did, "refused to activate a tombstoned repo");
            return Err(RepoError::InactiveRepo(did.to_string()).into());
        }
        self.set_status(did, RepoStatus::Active).await
    }

    #[tracing::instrument(skip_all, fields(did = %did))]
    async fn tombstone_repo(&self, did: &str) -> Result<()> {
        self.set_status(did, RepoStatus::Tombstoned).await
    }
}

impl SurrealRepoRegistry {
    async fn set_status(&self, did: &str, status: RepoStatus) -> Result<()> {
        let mut repo: AtpRepo = self
            .db
            .select(("repo", did))
            .await?
            .ok_or_else(|| RepoError::RepoNotFound(did.to_string()))?;
        repo.status = status;
        let _: Option<AtpRepo> = self.db.update(("repo", did)).content(repo).await?;
        debug!(%did, status = ?status, "updated repo status");
        Ok(())
    }
}

/// Surfaced for callers that want to translate a cursor error without matching on
/// [`anyhow::Error`] internals; durable and in-memory logs raise the same variants.
pub fn is_cursor_error(err: &anyhow::Error) -> bool {
    err.downcast_ref::<SeqError>().is_some()
}
