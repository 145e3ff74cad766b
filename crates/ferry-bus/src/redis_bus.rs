use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tracing::debug;

use crate::{Bus, BusMessage, BusResult, Subscription};

/// Redis-backed bus. Publishes share one reconnecting connection; every
/// subscription holds its own pub/sub connection so closing it only affects
/// that subscriber.
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    publisher: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(redis_url: &str) -> BusResult<Self> {
        let client = Client::open(redis_url)?;
        let publisher = ConnectionManager::new(client.clone()).await?;
        Ok(Self { client, publisher })
    }
}

#[async_trait]
impl Bus for RedisBus {
    async fn subscribe(&self, topic: &str) -> BusResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(topic).await?;
        debug!(topic_len = topic.len(), "redis subscription opened");
        let stream = pubsub.into_on_message().map(|msg| BusMessage {
            topic: msg.get_channel_name().to_string(),
            payload: Bytes::copy_from_slice(msg.get_payload_bytes()),
        });
        Ok(Subscription::new(stream.boxed()))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()> {
        let mut conn = self.publisher.clone();
        let _receivers: i64 = conn.publish(topic, &payload[..]).await?;
        Ok(())
    }
}
