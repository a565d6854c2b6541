//! The event log (§4.5): monotone sequence allocation, durable-enough persistence of
//! every commit/identity/account/tombstone event, and the rollback window that bounds
//! how far back a reconnecting subscriber may resume from.
//!
//! [`InMemoryEventLog`] is the reference implementation used by tests and by embedders
//! that don't need cross-process durability; a durable back-end implements the same
//! [`EventLog`] trait over its own storage (e.g. the `surrealdb`-backed store a server
//! process would run) and the firehose pump in [`crate::firehose`] is none the wiser.

use crate::error::SeqError;
use crate::event::{EventBody, SeqEvent};
use anyhow::Result;
use async_trait::async_trait;
use rsky_common;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};

#[async_trait]
pub trait EventLog: Send + Sync {
    /// Allocates and returns the next sequence number without persisting anything.
    /// Exposed separately from [`EventLog::append`] for back-ends that need to reserve
    /// a seq before they've finished building the event payload.
    fn allocate_seq(&self) -> i64;

    /// The most recently allocated sequence number, or `0` if none has been allocated.
    fn last_seq(&self) -> i64;

    /// Persists `body` under a freshly allocated sequence number and wakes any pump
    /// blocked on [`EventLog::notifier`].
    async fn append(&self, repo_did: String, body: EventBody) -> Result<SeqEvent>;

    /// Every event with `seq` strictly greater than `cursor`, oldest first, optionally
    /// filtered to one repo, capped at `limit`.
    async fn read_since(&self, cursor: i64, repo_did: Option<&str>, limit: usize)
        -> Vec<SeqEvent>;

    /// The oldest sequence number still retained, or `None` if the log is empty (in
    /// which case every cursor up to `last_seq` is considered in-window).
    async fn earliest_retained_seq(&self) -> Option<i64>;

    /// Validates a subscriber-supplied cursor against `last_seq`/the rollback window.
    async fn check_cursor(&self, cursor: i64) -> Result<(), SeqError> {
        let last = self.last_seq();
        if cursor > last {
            return Err(SeqError::FutureCursor(cursor, last));
        }
        if let Some(earliest) = self.earliest_retained_seq().await {
            // a cursor one behind the earliest retained event is still resumable
            // (it asks to start strictly after the oldest thing we kept).
            if cursor < earliest - 1 {
                return Err(SeqError::OutdatedCursor(cursor, earliest));
            }
        }
        Ok(())
    }

    /// Shared wakeup signalled on every successful `append`; the firehose pump awaits
    /// it while idle instead of busy-polling.
    fn notifier(&self) -> Arc<Notify>;
}

/// In-memory reference implementation and test oracle. Holds the whole retained
/// window in a `VecDeque`, trimming the oldest entry whenever the window is exceeded.
#[derive(Debug)]
pub struct InMemoryEventLog {
    events: RwLock<VecDeque<SeqEvent>>,
    next_seq: AtomicI64,
    rollback_window: Option<usize>,
    notify: Arc<Notify>,
}

impl InMemoryEventLog {
    /// `rollback_window` is the maximum number of events retained for replay; `None`
    /// means unlimited, matching the spec's default.
    pub fn new(rollback_window: Option<usize>) -> Self {
        Self {
            events: RwLock::new(VecDeque::new()),
            next_seq: AtomicI64::new(0),
            rollback_window,
            notify: Arc::new(Notify::new()),
        }
    }
}

impl Default for InMemoryEventLog {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    fn allocate_seq(&self) -> i64 {
        self.next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn last_seq(&self) -> i64 {
        self.next_seq.load(Ordering::SeqCst)
    }

    async fn append(&self, repo_did: String, body: EventBody) -> Result<SeqEvent> {
        let seq = self.allocate_seq();
        let evt = SeqEvent {
            seq,
            repo_did,
            time: rsky_common::now(),
            body,
        };
        {
            let mut events = self.events.write().await;
            events.push_back(evt.clone());
            if let Some(window) = self.rollback_window {
                while events.len() > window {
                    events.pop_front();
                }
            }
        }
        self.notify.notify_waiters();
        Ok(evt)
    }

    async fn read_since(
        &self,
        cursor: i64,
        repo_did: Option<&str>,
        limit: usize,
    ) -> Vec<SeqEvent> {
        let events = self.events.read().await;
        events
            .iter()
            .filter(|evt| evt.seq > cursor)
            .filter(|evt| repo_did.map_or(true, |did| evt.repo_did == did))
            .take(limit)
            .cloned()
            .collect()
    }

    async fn earliest_retained_seq(&self) -> Option<i64> {
        let events = self.events.read().await;
        events.front().map(|evt| evt.seq)
    }

    fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TombstoneEvt;

    fn tombstone(did: &str) -> EventBody {
        EventBody::Tombstone(TombstoneEvt { did: did.to_string() })
    }

    #[tokio::test]
    async fn allocates_gap_free_monotone_sequence() {
        let log = InMemoryEventLog::new(None);
        let a = log.append("did:plc:a".to_string(), tombstone("did:plc:a")).await.unwrap();
        let b = log.append("did:plc:b".to_string(), tombstone("did:plc:b")).await.unwrap();
        assert_eq!(a.seq, 1);
        assert_eq!(b.seq, 2);
        assert_eq!(log.last_seq(), 2);
    }

    #[tokio::test]
    async fn read_since_filters_by_repo_and_cursor() {
        let log = InMemoryEventLog::new(None);
        log.append("did:plc:a".to_string(), tombstone("did:plc:a")).await.unwrap();
        log.append("did:plc:b".to_string(), tombstone("did:plc:b")).await.unwrap();
        log.append("did:plc:a".to_string(), tombstone("did:plc:a")).await.unwrap();

        let all = log.read_since(0, None, 10).await;
        assert_eq!(all.len(), 3);

        let only_a = log.read_since(0, Some("did:plc:a"), 10).await;
        assert_eq!(only_a.len(), 2);

        let after_first = log.read_since(1, None, 10).await;
        assert_eq!(after_first.len(), 2);
    }

    #[tokio::test]
    async fn rollback_window_trims_and_flags_outdated_cursors() {
        let log = InMemoryEventLog::new(Some(2));
        for i in 0..5 {
            log.append(format!("did:plc:{i}"), tombstone("did:plc:x")).await.unwrap();
        }
        // only the last two events (seq 4, 5) are retained
        assert_eq!(log.earliest_retained_seq().await, Some(4));
        assert!(log.check_cursor(3).await.is_err());
        assert!(log.check_cursor(5).await.is_ok());
        assert!(matches!(log.check_cursor(100).await, Err(SeqError::FutureCursor(100, 5))));
    }
}
