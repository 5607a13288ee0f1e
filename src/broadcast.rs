//! Ranking frame fan-out (spec §4.7). Built on a hand-rolled bounded,
//! drop-oldest multi-subscriber bus rather than `tokio::sync::broadcast`,
//! because that primitive drops a lagging subscriber's whole backlog
//! (`RecvError::Lagged`) instead of capping its queue at a fixed depth and
//! trimming from the front, which is what the bus needs.

use crate::models::RankingFrame;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

const SUBSCRIBER_CAPACITY: usize = 2;

struct SubscriberQueue {
    frames: Mutex<VecDeque<Arc<RankingFrame>>>,
    notify: Notify,
}

impl SubscriberQueue {
    fn push(&self, frame: Arc<RankingFrame>) {
        let mut frames = self.frames.lock();
        if frames.len() >= SUBSCRIBER_CAPACITY {
            frames.pop_front();
        }
        frames.push_back(frame);
        drop(frames);
        self.notify.notify_one();
    }
}

/// Handle returned by `Broadcast::subscribe`. Dropping it unregisters the
/// subscriber on the next publish.
pub struct Subscription {
    queue: Arc<SubscriberQueue>,
}

impl Subscription {
    /// Yields frames in publish order; some may have been dropped under
    /// backpressure. Waits for the next frame if the queue is empty.
    pub async fn recv(&self) -> Arc<RankingFrame> {
        loop {
            if let Some(frame) = self.queue.frames.lock().pop_front() {
                return frame;
            }
            self.queue.notify.notified().await;
        }
    }
}

/// Process-wide ranking broadcast. One instance lives in `AppState`.
#[derive(Default)]
pub struct Broadcast {
    last_frame: Mutex<Option<Arc<RankingFrame>>>,
    subscribers: Mutex<Vec<Weak<SubscriberQueue>>>,
}

impl Broadcast {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `frame` to every live subscriber. Never blocks: a full
    /// subscriber queue has its oldest frame dropped before the new one is
    /// pushed. Dead subscribers are swept on the way through.
    pub fn publish(&self, frame: RankingFrame) {
        let frame = Arc::new(frame);
        *self.last_frame.lock() = Some(frame.clone());

        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|weak| {
            if let Some(queue) = weak.upgrade() {
                queue.push(frame.clone());
                true
            } else {
                false
            }
        });
    }

    /// Register a new subscriber. Immediately yields the last published
    /// frame (if any) before any subsequent ones.
    pub fn subscribe(&self) -> Subscription {
        let queue = Arc::new(SubscriberQueue {
            frames: Mutex::new(VecDeque::with_capacity(SUBSCRIBER_CAPACITY)),
            notify: Notify::new(),
        });
        if let Some(frame) = self.last_frame.lock().clone() {
            queue.push(frame);
        }
        self.subscribers.lock().push(Arc::downgrade(&queue));
        Subscription { queue }
    }

    pub fn last_frame(&self) -> Option<Arc<RankingFrame>> {
        self.last_frame.lock().clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().iter().filter(|w| w.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VolatilityBucket;
    use chrono::Utc;

    fn frame(market_gauge: f64) -> RankingFrame {
        RankingFrame {
            ts: Utc::now(),
            profile: "scalp".into(),
            market_gauge,
            volatility_bucket: VolatilityBucket::Medium,
            items: Vec::new(),
        }
    }

    #[tokio::test]
    async fn subscriber_gets_last_frame_immediately() {
        let bus = Broadcast::new();
        bus.publish(frame(1.0));
        let sub = bus.subscribe();
        let received = sub.recv().await;
        assert_eq!(received.market_gauge, 1.0);
    }

    #[tokio::test]
    async fn publish_never_blocks_and_drops_oldest_when_full() {
        let bus = Broadcast::new();
        let sub = bus.subscribe();
        for i in 0..10 {
            bus.publish(frame(i as f64));
        }
        let first = sub.recv().await;
        let second = sub.recv().await;
        // Capacity 2: only the last two published frames should remain.
        assert_eq!(first.market_gauge, 8.0);
        assert_eq!(second.market_gauge, 9.0);
    }

    #[tokio::test]
    async fn dropped_subscriber_is_evicted_on_next_publish() {
        let bus = Broadcast::new();
        {
            let _sub = bus.subscribe();
            assert_eq!(bus.subscriber_count(), 1);
        }
        bus.publish(frame(1.0));
        assert_eq!(bus.subscriber_count(), 0);
    }
}
