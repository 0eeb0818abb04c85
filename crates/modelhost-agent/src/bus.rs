//! In-process event bus
//!
//! One broadcast channel fans every published [`Event`] out to all current
//! subscribers. Each subscriber has a bounded buffer; a subscriber that falls
//! behind loses its oldest events and the publisher never waits.
//!
//! Publishing and subscribing share a short lock so that a new subscription's
//! snapshot replay and its live stream meet exactly: every event is either in
//! the replay or delivered live, never both and never neither.

use crate::snapshot::SnapshotStore;

use modelhost_core::{Event, EventCategory, EventPayload};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Bus health figures served by `GET /events/stats`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusStats {
    pub subscribers: usize,
    pub published: u64,
    /// Events lost by lagging subscribers
    pub dropped: u64,
    pub snapshot_categories: Vec<EventCategory>,
}

struct Inner {
    sender: broadcast::Sender<Event>,
    snapshots: SnapshotStore,
    /// Guards the sequence counter and orders publish against subscribe
    publish_lock: Mutex<u64>,
    dropped: AtomicU64,
}

/// Cheap to clone handle on the shared bus
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    /// `buffer` is the per-subscriber backlog before the oldest events drop
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self {
            inner: Arc::new(Inner {
                sender,
                snapshots: SnapshotStore::new(),
                publish_lock: Mutex::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Record `payload` as its category's snapshot and fan it out
    pub fn publish(&self, payload: EventPayload) -> Event {
        let mut seq = self
            .inner
            .publish_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *seq += 1;

        let event = Event::new(*seq, payload);
        self.inner.snapshots.store(event.clone());
        // No receivers is not an error for a fire-and-forget bus
        let _ = self.inner.sender.send(event.clone());
        event
    }

    /// Subscribe, starting with a replay of every current snapshot
    pub fn subscribe(&self) -> Subscription {
        let _guard = self
            .inner
            .publish_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let receiver = self.inner.sender.subscribe();
        let replay: VecDeque<Event> = self.inner.snapshots.all().into();
        debug!(
            "New subscriber ({} total), replaying {} snapshots",
            self.inner.sender.receiver_count(),
            replay.len()
        );

        Subscription {
            replay,
            receiver,
            inner: self.inner.clone(),
        }
    }

    /// Latest event of `category`
    pub fn snapshot(&self, category: EventCategory) -> Option<Event> {
        self.inner.snapshots.get(category)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }

    pub fn stats(&self) -> BusStats {
        let published = *self
            .inner
            .publish_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        BusStats {
            subscribers: self.subscriber_count(),
            published,
            dropped: self.inner.dropped.load(Ordering::Relaxed),
            snapshot_categories: self.inner.snapshots.categories(),
        }
    }
}

/// A live channel of events for one consumer
///
/// Dropping it unsubscribes; nothing else on the bus is affected.
pub struct Subscription {
    replay: VecDeque<Event>,
    receiver: broadcast::Receiver<Event>,
    inner: Arc<Inner>,
}

impl Subscription {
    /// Next event: replayed snapshots first, then live events
    ///
    /// Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        if let Some(event) = self.replay.pop_front() {
            return Some(event);
        }

        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(skipped)) => {
                    self.inner.dropped.fetch_add(skipped, Ordering::Relaxed);
                    warn!("Subscriber lagged, dropped {} oldest events", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Events still waiting in the replay queue
    pub fn pending_replay(&self) -> usize {
        self.replay.len()
    }

    pub fn unsubscribe(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelhost_core::{LogLine, LogStream, StatusSnapshot};
    use std::time::Duration;

    fn log(line: &str) -> EventPayload {
        EventPayload::Log(LogLine {
            pid: 1,
            stream: LogStream::Stdout,
            line: line.to_string(),
        })
    }

    async fn next(sub: &mut Subscription) -> Event {
        tokio::time::timeout(Duration::from_secs(1), sub.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let bus = EventBus::new(16);
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.publish(log("one"));

        assert_eq!(next(&mut a).await.seq, 1);
        assert_eq!(next(&mut b).await.seq, 1);
    }

    #[tokio::test]
    async fn test_replay_then_live_without_gaps() {
        let bus = EventBus::new(16);
        bus.publish(EventPayload::Status(StatusSnapshot::default()));
        bus.publish(EventPayload::Gpu(vec![]));
        bus.publish(log("old"));
        bus.publish(log("latest"));

        let mut sub = bus.subscribe();
        assert_eq!(sub.pending_replay(), 3);

        let replayed: Vec<EventCategory> = vec![
            next(&mut sub).await.category(),
            next(&mut sub).await.category(),
        ];
        assert_eq!(replayed, vec![EventCategory::Status, EventCategory::Gpu]);
        let last = next(&mut sub).await;
        assert_eq!(last.payload, log("latest"));
        assert_eq!(last.seq, 4);

        bus.publish(log("live"));
        assert_eq!(next(&mut sub).await.seq, 5);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest() {
        let bus = EventBus::new(4);
        let mut slow = bus.subscribe();
        let mut fast = bus.subscribe();

        for i in 0..10 {
            bus.publish(log(&i.to_string()));
            assert_eq!(next(&mut fast).await.seq, i + 1);
        }

        // Only the newest four survive
        let first = next(&mut slow).await;
        assert_eq!(first.seq, 7);
        assert_eq!(bus.stats().dropped, 6);
        assert_eq!(bus.stats().published, 10);
    }

    #[tokio::test]
    async fn test_unsubscribe_releases_receiver() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe();
        let other = bus.subscribe();
        assert_eq!(bus.stats().subscribers, 2);

        sub.unsubscribe();
        drop(other);
        assert_eq!(bus.stats().subscribers, 0);

        // Publishing with nobody listening still updates snapshots
        bus.publish(log("alone"));
        assert!(bus.snapshot(EventCategory::Log).is_some());
        assert_eq!(bus.stats().snapshot_categories, vec![EventCategory::Log]);
    }

    #[tokio::test]
    async fn test_concurrent_publish_subscribe_is_exact() {
        let bus = EventBus::new(1024);
        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    bus.publish(log(&i.to_string()));
                    tokio::task::yield_now().await;
                }
            })
        };

        tokio::time::sleep(Duration::from_millis(1)).await;
        let mut sub = bus.subscribe();
        publisher.await.unwrap();

        // Replay holds one log event; live events continue from its seq
        let replayed = next(&mut sub).await;
        let mut expected = replayed.seq + 1;
        while expected <= 200 {
            assert_eq!(next(&mut sub).await.seq, expected);
            expected += 1;
        }
    }
}
