use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::warn;

use crate::{Bus, BusMessage, BusResult, Subscription};

const DEFAULT_TOPIC_DEPTH: usize = 256;

type Topics = Arc<parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage>>>>;

/// In-memory bus for single-process deployments and tests.
///
/// A subscriber that falls more than `depth` messages behind loses the
/// overflow; the gap is logged. A topic is dropped as soon as its last
/// subscriber goes away.
#[derive(Debug)]
pub struct LocalBus {
    depth: usize,
    topics: Topics,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_depth(DEFAULT_TOPIC_DEPTH)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_depth(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            topics: Arc::new(parking_lot::RwLock::new(HashMap::new())),
        }
    }

    /// Number of topics currently holding a sender.
    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    /// Live subscribers on `topic`.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.depth).0)
            .clone()
    }

}

fn prune_if_unused(topics: &Topics, topic: &str) {
    let mut guard = topics.write();
    if guard
        .get(topic)
        .is_some_and(|sender| sender.receiver_count() == 0)
    {
        guard.remove(topic);
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn subscribe(&self, topic: &str) -> BusResult<Subscription> {
        // Subscribe under the write lock so a concurrent prune cannot orphan us.
        let receiver = self
            .topics
            .write()
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.depth).0)
            .subscribe();
        let label = topic.to_string();
        let stream = BroadcastStream::new(receiver).filter_map(move |item| {
            let label = label.clone();
            async move {
                match item {
                    Ok(message) => Some(message),
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(topic = %label, skipped, "local bus subscriber lagged");
                        None
                    }
                }
            }
        });
        let topics = Arc::clone(&self.topics);
        let topic = topic.to_string();
        Ok(Subscription::new(stream.boxed()).on_release(move || prune_if_unused(&topics, &topic)))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let sender = self.sender_for(topic);
        let message = BusMessage {
            topic: topic.to_string(),
            payload,
        };
        if sender.send(message).is_err() {
            // Nobody listening; drop the idle topic rather than accumulate them.
            prune_if_unused(&self.topics, topic);
        }
        Ok(())
    }
}
