//! The `subscribeRepos` pump (§4.5): drains an [`EventLog`] in strict sequence order
//! for one subscriber, reconciling sequence gaps and enforcing the rollback window.
//!
//! One [`FirehosePump::run`] call is one subscriber's lifetime: it loops until the
//! subscriber disconnects (its [`Subscriber::send`] returns `Err`) or a cursor error
//! rejects the connection outright. Running many subscribers concurrently is just
//! calling `run` once per connection against the same shared `Arc<dyn EventLog>` --
//! nothing here is exclusive to one caller.

use crate::error::SeqError;
use crate::event::SeqEvent;
use crate::sequencer::EventLog;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// How long the pump waits for a missing sequence number to show up before giving up
/// on it and emitting a synthetic [`GapEvent`]. Not configurable (§5, §6).
pub const GAP_TIMEOUT: Duration = Duration::from_secs(60);

/// A synthetic marker the pump emits in place of events it gave up waiting for.
/// `from`/`to` are inclusive and always refer to sequence numbers that were, and
/// remain, missing from the log (crash recovery is the only legitimate source of
/// gaps; see §8 invariant 11).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GapEvent {
    pub from: i64,
    pub to: i64,
}

#[derive(Debug, Clone)]
pub enum Frame {
    Event(SeqEvent),
    Gap(GapEvent),
}

/// The write side of a connected subscriber. `send` returning `Err` is taken as
/// "disconnected" and ends the pump for that subscriber; it is never retried.
#[async_trait]
pub trait Subscriber: Send {
    async fn send(&mut self, frame: Frame) -> Result<()>;
}

pub struct FirehosePump {
    log: Arc<dyn EventLog>,
    /// Minimum delay between empty-batch polls of the log; only matters for back-ends
    /// with no local producer to notify us (§6 `subscribe_batch_delay`).
    poll_delay: Duration,
}

impl FirehosePump {
    pub fn new(log: Arc<dyn EventLog>, poll_delay: Duration) -> Self {
        Self { log, poll_delay }
    }

    /// Runs the pump for one subscriber. `cursor` is the last sequence the subscriber
    /// already has (`None` means "start tailing live from `last_seq`"), `repo_filter`
    /// restricts delivery to one repo's events.
    pub async fn run(
        &self,
        cursor: Option<i64>,
        repo_filter: Option<String>,
        sub: &mut dyn Subscriber,
    ) -> Result<(), SeqError> {
        let mut cursor = match cursor {
            Some(requested) => {
                self.log.check_cursor(requested).await?;
                requested
            }
            None => self.log.last_seq(),
        };

        let notify = self.log.notifier();
        'pump: loop {
            let batch = self.log.read_since(cursor, repo_filter.as_deref(), 500).await;
            if batch.is_empty() {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(self.poll_delay.max(Duration::from_millis(1))) => {}
                }
                continue 'pump;
            }

            for evt in batch {
                // gap: the sequencer skipped ahead of what we've seen. A concurrent
                // writer may still be mid-commit, so wait before declaring it lost.
                while evt.seq > cursor + 1 {
                    match tokio::time::timeout(GAP_TIMEOUT, notify.notified()).await {
                        Ok(()) => {
                            // something landed; re-read from the log in case the gap
                            // was filled rather than widened.
                            continue 'pump;
                        }
                        Err(_) => {
                            let gap = GapEvent { from: cursor + 1, to: evt.seq - 1 };
                            warn!(repo = %evt.repo_did, from = gap.from, to = gap.to, "firehose gap timed out, advancing past it");
                            if sub.send(Frame::Gap(gap)).await.is_err() {
                                return Ok(());
                            }
                            cursor = evt.seq - 1;
                            break;
                        }
                    }
                }

                if sub.send(Frame::Event(evt.clone())).await.is_err() {
                    return Ok(());
                }
                cursor = evt.seq;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBody, TombstoneEvt};
    use crate::sequencer::InMemoryEventLog;
    use tokio::sync::mpsc;

    struct ChannelSubscriber(mpsc::UnboundedSender<Frame>);

    #[async_trait]
    impl Subscriber for ChannelSubscriber {
        async fn send(&mut self, frame: Frame) -> Result<()> {
            self.0.send(frame).map_err(|_| anyhow::anyhow!("disconnected"))
        }
    }

    fn tombstone(did: &str) -> EventBody {
        EventBody::Tombstone(TombstoneEvt { did: did.to_string() })
    }

    #[tokio::test]
    async fn streams_events_in_order_from_a_cursor() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new(None));
        log.append("did:plc:a".to_string(), tombstone("did:plc:a")).await.unwrap();
        log.append("did:plc:a".to_string(), tombstone("did:plc:a")).await.unwrap();

        let pump = FirehosePump::new(log.clone(), Duration::from_millis(5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sub = ChannelSubscriber(tx);
        let handle = tokio::spawn(async move { pump.run(Some(0), None, &mut sub).await });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        match (first, second) {
            (Frame::Event(a), Frame::Event(b)) => {
                assert_eq!(a.seq, 1);
                assert_eq!(b.seq, 2);
            }
            other => panic!("expected two ordered events, got {other:?}"),
        }
        handle.abort();
    }

    #[tokio::test]
    async fn future_cursor_is_rejected_before_streaming() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new(None));
        log.append("did:plc:a".to_string(), tombstone("did:plc:a")).await.unwrap();

        let pump = FirehosePump::new(log, Duration::from_millis(5));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut sub = ChannelSubscriber(tx);
        let err = pump.run(Some(50), None, &mut sub).await.unwrap_err();
        assert!(matches!(err, SeqError::FutureCursor(50, 1)));
    }

    #[tokio::test]
    async fn outdated_cursor_is_rejected_outside_rollback_window() {
        let log: Arc<dyn EventLog> = Arc::new(InMemoryEventLog::new(Some(2)));
        for i in 0..5 {
            log.append(format!("did:plc:{i}"), tombstone("did:plc:x")).await.unwrap();
        }
        let pump = FirehosePump::new(log, Duration::from_millis(5));
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut sub = ChannelSubscriber(tx);
        let err = pump.run(Some(0), None, &mut sub).await.unwrap_err();
        assert!(matches!(err, SeqError::OutdatedCursor(0, 4)));
    }
}
