#![forbid(unsafe_code)]
#![deny(missing_docs, rustdoc::broken_intra_doc_links, rustdoc::bare_urls)]
#![allow(clippy::module_name_repetitions)]

//! Event bus shared by the seedfleet services.
//!
//! Services publish typed events by name with a structured payload; the
//! notifier and webhook subsystems consume them out-of-band. The bus is a
//! bounded `tokio::broadcast` channel paired with an in-memory replay ring so
//! reconnecting consumers can catch up from the last identifier they saw.
//! When the channel overflows, the oldest events are dropped.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::sync::broadcast::{Receiver, Sender};
use tracing::error;

/// Identifier assigned to each event emitted by the platform.
pub type EventId = u64;

/// Default buffer size for the in-memory replay ring.
const DEFAULT_REPLAY_CAPACITY: usize = 1_024;

/// Typed domain events surfaced across the system.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A single RSS entry was added to a downloader.
    RssDownload {
        /// Feed the entry came from.
        feed: String,
        /// Entry title as published by the tracker.
        title: String,
        /// Display name of the downloader that received the torrent.
        downloader: String,
    },
    /// An RSS run added several torrents at once.
    RssBatch {
        /// Feed the entries came from.
        feed: String,
        /// Number of torrents added during the run.
        count: usize,
    },
    /// A delete rule removed a single torrent.
    Delete {
        /// Name of the rule that fired.
        rule: String,
        /// Name of the removed torrent.
        torrent: String,
        /// Share ratio at removal time.
        ratio: f64,
        /// Seeding time in seconds at removal time.
        seeding_secs: i64,
    },
    /// A delete rule removed several torrents in one run.
    DeleteBatch {
        /// Name of the rule that fired.
        rule: String,
        /// Number of torrents removed.
        count: usize,
        /// Sum of uploaded bytes across the removed torrents.
        total_uploaded: u64,
    },
    /// The limiter applied or changed an upload cap on a torrent.
    SpeedLimit {
        /// Tracker domain the torrent announces to.
        tracker: String,
        /// Name of the limited torrent.
        torrent: String,
        /// Applied limit in bytes per second (0 = released).
        limit_bps: u64,
        /// Controller phase label at the time the cap was applied.
        phase: String,
    },
    /// A background task failed in a way worth surfacing to the operator.
    Error {
        /// Subsystem that produced the failure.
        scope: String,
        /// Human-readable failure description.
        message: String,
    },
    /// A downloader stopped answering within its timeout budget.
    DownloaderOffline {
        /// Display name of the unreachable downloader.
        downloader: String,
    },
    /// A downloader's free space fell under its configured warning level.
    LowDiskSpace {
        /// Display name of the affected downloader.
        downloader: String,
        /// Remaining free space in bytes.
        free_bytes: u64,
        /// Warning threshold in bytes.
        threshold_bytes: u64,
    },
}

impl Event {
    /// Machine-friendly discriminator used by notifier and webhook consumers.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RssDownload { .. } => "rss_download",
            Self::RssBatch { .. } => "rss_batch",
            Self::Delete { .. } => "delete",
            Self::DeleteBatch { .. } => "delete_batch",
            Self::SpeedLimit { .. } => "speed_limit",
            Self::Error { .. } => "error",
            Self::DownloaderOffline { .. } => "downloader_offline",
            Self::LowDiskSpace { .. } => "low_disk_space",
        }
    }
}

/// Metadata wrapper around events. Each envelope tracks the event id and
/// emission timestamp.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct EventEnvelope {
    /// Monotonic identifier assigned to the wrapped event.
    pub id: EventId,
    /// Timestamp recording when the envelope was produced.
    pub timestamp: DateTime<Utc>,
    /// Wrapped event payload.
    pub event: Event,
}

/// Shared event bus built on top of `tokio::broadcast`.
#[derive(Clone)]
pub struct EventBus {
    sender: Sender<EventEnvelope>,
    buffer: Arc<Mutex<VecDeque<EventEnvelope>>>,
    next_id: Arc<std::sync::atomic::AtomicU64>,
    replay_capacity: usize,
}

impl EventBus {
    /// Construct a new bus with the provided broadcast capacity.
    ///
    /// The broadcast channel uses the same capacity as the in-memory replay
    /// buffer, ensuring dropped events impact both structures consistently.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "event bus capacity must be positive");
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            buffer: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            next_id: Arc::new(std::sync::atomic::AtomicU64::new(1)),
            replay_capacity: capacity,
        }
    }

    /// Construct a bus with the default in-memory buffer size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }

    /// Publish a new event to the bus, assigning it a sequential identifier.
    pub fn publish(&self, event: Event) -> EventId {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let envelope = EventEnvelope {
            id,
            timestamp: Utc::now(),
            event,
        };

        {
            let mut buffer = self.lock_buffer();
            if buffer.len() == self.replay_capacity {
                buffer.pop_front();
            }
            buffer.push_back(envelope.clone());
        }

        let _ = self.sender.send(envelope);
        id
    }

    /// Subscribe to the bus, replaying any buffered events newer than `since_id`.
    #[must_use]
    pub fn subscribe(&self, since_id: Option<EventId>) -> EventStream {
        let mut backlog = VecDeque::new();
        if let Some(since) = since_id {
            let buffer = self.lock_buffer();
            for item in buffer.iter() {
                if item.id > since {
                    backlog.push_back(item.clone());
                }
            }
        }

        let receiver = self.sender.subscribe();
        EventStream { backlog, receiver }
    }

    /// Return a snapshot of buffered events newer than the supplied identifier.
    ///
    /// Useful for endpoints that need incremental views without establishing a
    /// long-lived subscription.
    #[must_use]
    pub fn backlog_since(&self, since_id: EventId) -> Vec<EventEnvelope> {
        let buffer = self.lock_buffer();
        buffer
            .iter()
            .filter(|item| item.id > since_id)
            .cloned()
            .collect()
    }

    /// Returns the last assigned identifier, if any events have been published.
    #[must_use]
    pub fn last_event_id(&self) -> Option<EventId> {
        let buffer = self.lock_buffer();
        buffer.back().map(|event| event.id)
    }

    fn lock_buffer(&self) -> MutexGuard<'_, VecDeque<EventEnvelope>> {
        match self.buffer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                error!("event buffer mutex poisoned; continuing with recovered guard");
                poisoned.into_inner()
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Stream wrapper that yields events either from the replay backlog or from
/// the live broadcast channel.
pub struct EventStream {
    backlog: VecDeque<EventEnvelope>,
    receiver: Receiver<EventEnvelope>,
}

impl EventStream {
    /// Receive the next event, respecting the replay backlog first.
    pub async fn next(&mut self) -> Option<EventEnvelope> {
        if let Some(event) = self.backlog.pop_front() {
            return Some(event);
        }

        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => self.receiver.recv().await.ok(),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const RECV_TIMEOUT: Duration = Duration::from_secs(1);

    #[test]
    fn event_kinds_match_protocol_names() {
        let events = [
            (
                Event::RssDownload {
                    feed: "demo".into(),
                    title: "Some.Release".into(),
                    downloader: "qb-main".into(),
                },
                "rss_download",
            ),
            (
                Event::RssBatch {
                    feed: "demo".into(),
                    count: 4,
                },
                "rss_batch",
            ),
            (
                Event::Delete {
                    rule: "ratio>3".into(),
                    torrent: "Some.Release".into(),
                    ratio: 3.2,
                    seeding_secs: 90_000,
                },
                "delete",
            ),
            (
                Event::DeleteBatch {
                    rule: "ratio>3".into(),
                    count: 3,
                    total_uploaded: 7,
                },
                "delete_batch",
            ),
            (
                Event::SpeedLimit {
                    tracker: "tracker.example.org".into(),
                    torrent: "Some.Release".into(),
                    limit_bps: 8 << 20,
                    phase: "steady".into(),
                },
                "speed_limit",
            ),
            (
                Event::Error {
                    scope: "rss".into(),
                    message: "boom".into(),
                },
                "error",
            ),
            (
                Event::DownloaderOffline {
                    downloader: "qb-main".into(),
                },
                "downloader_offline",
            ),
            (
                Event::LowDiskSpace {
                    downloader: "qb-main".into(),
                    free_bytes: 1,
                    threshold_bytes: 2,
                },
                "low_disk_space",
            ),
        ];

        for (event, expected) in events {
            assert_eq!(event.kind(), expected);
        }
    }

    #[test]
    fn events_serialize_with_snake_case_tag() {
        let event = Event::DownloaderOffline {
            downloader: "qb-main".into(),
        };
        let value = serde_json::to_value(&event).expect("serialize");
        assert_eq!(value["type"], "downloader_offline");
        assert_eq!(value["downloader"], "qb-main");
    }

    fn sample_event(index: usize) -> Event {
        Event::RssBatch {
            feed: format!("feed-{index}"),
            count: index,
        }
    }

    #[tokio::test]
    async fn sequential_ids_and_replay() {
        let bus = EventBus::with_capacity(16);

        let mut last_id = 0;
        for i in 0..5 {
            last_id = bus.publish(sample_event(i));
        }
        assert_eq!(last_id, 5);

        let mut stream = bus.subscribe(Some(2));
        let mut received = Vec::new();
        for _ in 0..3 {
            if let Some(event) = stream.next().await {
                received.push(event);
            }
        }

        assert_eq!(received.len(), 3);
        assert_eq!(received.first().unwrap().id, 3);
        assert_eq!(received.last().unwrap().id, 5);
    }

    #[tokio::test]
    async fn ring_drops_oldest_when_full() {
        let bus = EventBus::with_capacity(2);
        for i in 0..4 {
            let _ = bus.publish(sample_event(i));
        }
        let backlog = bus.backlog_since(0);
        assert_eq!(backlog.len(), 2);
        assert_eq!(backlog[0].id, 3);
        assert_eq!(bus.last_event_id(), Some(4));
    }

    #[tokio::test]
    async fn live_events_reach_subscriber() {
        let bus = EventBus::with_capacity(8);
        let mut stream = bus.subscribe(None);
        let published = bus.publish(sample_event(1));
        let envelope = timeout(RECV_TIMEOUT, stream.next())
            .await
            .expect("stream stalled")
            .expect("stream closed");
        assert_eq!(envelope.id, published);
    }

    #[tokio::test]
    async fn stream_returns_none_after_sender_dropped() {
        let mut stream = {
            let bus = EventBus::with_capacity(1);
            let stream = bus.subscribe(None);
            drop(bus);
            stream
        };
        assert!(
            stream.next().await.is_none(),
            "closing the sender should end the stream"
        );
    }
}
