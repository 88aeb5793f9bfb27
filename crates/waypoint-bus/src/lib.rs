pub mod locks;

pub use locks::{KeyedLockGuard, KeyedLocks};

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, RwLock};
use waypoint_schema::BusMessage;

#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum Topic {
    ItineraryPatched,
    TaskSubmitted,
    TaskCompleted,
    TaskFailed,
    TaskCancelled,
    PlaceResolved,
}

impl Topic {
    pub fn from_message(msg: &BusMessage) -> Self {
        match msg {
            BusMessage::ItineraryPatched { .. } => Topic::ItineraryPatched,
            BusMessage::TaskSubmitted { .. } => Topic::TaskSubmitted,
            BusMessage::TaskCompleted { .. } => Topic::TaskCompleted,
            BusMessage::TaskFailed { .. } => Topic::TaskFailed,
            BusMessage::TaskCancelled { .. } => Topic::TaskCancelled,
            BusMessage::PlaceResolved { .. } => Topic::PlaceResolved,
        }
    }
}

type Subscriber = mpsc::Sender<BusMessage>;

pub struct EventBus {
    subscribers: Arc<RwLock<HashMap<Topic, Vec<Subscriber>>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    pub async fn subscribe(&self, topic: Topic) -> mpsc::Receiver<BusMessage> {
        let (tx, rx) = mpsc::channel(self.capacity);
        let mut subs = self.subscribers.write().await;
        subs.entry(topic).or_default().push(tx);
        rx
    }

    /// Delivery is best effort: full subscribers miss the message, closed ones are pruned.
    pub async fn publish(&self, msg: BusMessage) -> Result<()> {
        publish_to(&self.subscribers, msg).await
    }

    pub fn publisher(&self) -> BusPublisher {
        BusPublisher {
            subscribers: self.subscribers.clone(),
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[derive(Clone)]
pub struct BusPublisher {
    subscribers: Arc<RwLock<HashMap<Topic, Vec<Subscriber>>>>,
}

impl BusPublisher {
    pub async fn publish(&self, msg: BusMessage) -> Result<()> {
        publish_to(&self.subscribers, msg).await
    }
}

async fn publish_to(
    subscribers: &RwLock<HashMap<Topic, Vec<Subscriber>>>,
    msg: BusMessage,
) -> Result<()> {
    let topic = Topic::from_message(&msg);
    let mut closed = false;
    {
        let subs = subscribers.read().await;
        if let Some(list) = subs.get(&topic) {
            for tx in list {
                match tx.try_send(msg.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(?topic, "bus subscriber full, dropping message");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed = true,
                }
            }
        }
    }
    if closed {
        let mut subs = subscribers.write().await;
        if let Some(list) = subs.get_mut(&topic) {
            list.retain(|tx| !tx.is_closed());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tokio::time::{timeout, Duration};
    use uuid::Uuid;
    use waypoint_schema::{Actor, ItineraryDiff, PatchEvent};

    fn patch_message() -> BusMessage {
        BusMessage::ItineraryPatched {
            event: PatchEvent {
                itinerary_id: "trip-1".to_string(),
                from_version: 1,
                to_version: 2,
                diff: ItineraryDiff::default(),
                summary: "edit".to_string(),
                updated_by: Actor::user("u1"),
                at: Utc::now(),
            },
        }
    }

    #[tokio::test]
    async fn publish_to_no_subscribers_succeeds() {
        let bus = EventBus::new(8);
        let msg = BusMessage::TaskCancelled {
            task_id: Uuid::new_v4(),
            reason: "user".into(),
        };

        let result = bus.publish(msg).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe(Topic::ItineraryPatched).await;

        bus.publish(patch_message()).await.unwrap();

        let received = timeout(Duration::from_millis(100), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(received, BusMessage::ItineraryPatched { .. }));
    }

    #[tokio::test]
    async fn multiple_subscribers_same_topic() {
        let bus = EventBus::new(8);
        let mut rx1 = bus.subscribe(Topic::ItineraryPatched).await;
        let mut rx2 = bus.subscribe(Topic::ItineraryPatched).await;

        bus.publish(patch_message()).await.unwrap();

        let got1 = timeout(Duration::from_millis(100), rx1.recv())
            .await
            .unwrap()
            .unwrap();
        let got2 = timeout(Duration::from_millis(100), rx2.recv())
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(got1, BusMessage::ItineraryPatched { .. }));
        assert!(matches!(got2, BusMessage::ItineraryPatched { .. }));
    }

    #[tokio::test]
    async fn different_topics_no_crosstalk() {
        let bus = EventBus::new(8);
        let mut patch_rx = bus.subscribe(Topic::ItineraryPatched).await;

        bus.publish(BusMessage::TaskFailed {
            task_id: Uuid::new_v4(),
            error: "boom".into(),
            terminal: false,
            next_attempt_at: None,
        })
        .await
        .unwrap();

        let received = timeout(Duration::from_millis(100), patch_rx.recv()).await;
        assert!(received.is_err());
    }

    #[tokio::test]
    async fn bus_publisher_clone_works() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe(Topic::ItineraryPatched).await;
        let publisher = bus.publisher().clone();

        publisher.publish(patch_message()).await.unwrap();

        let received = timeout(Duration::from_millis(100), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(received, BusMessage::ItineraryPatched { .. }));
    }

    #[tokio::test]
    async fn channel_backpressure_drops_when_full() {
        let bus = EventBus::new(1);
        let mut rx = bus.subscribe(Topic::ItineraryPatched).await;

        bus.publish(patch_message()).await.unwrap();
        bus.publish(patch_message()).await.unwrap();

        let first = timeout(Duration::from_millis(100), rx.recv()).await;
        assert!(first.is_ok());

        let second = timeout(Duration::from_millis(50), rx.recv()).await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new(4);
        let rx = bus.subscribe(Topic::ItineraryPatched).await;
        drop(rx);

        bus.publish(patch_message()).await.unwrap();

        let subs = bus.subscribers.read().await;
        assert!(subs
            .get(&Topic::ItineraryPatched)
            .map(|list| list.is_empty())
            .unwrap_or(true));
    }
}
