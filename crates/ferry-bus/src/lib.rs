//! Topic-based publish/subscribe used to fan relay traffic out across
//! processes. [`LocalBus`] keeps everything in memory; [`RedisBus`] rides on
//! Redis `PUBLISH`/`SUBSCRIBE` so independent relay processes can serve the
//! two ends of one session.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use thiserror::Error;

mod local;
mod redis_bus;

pub use local::LocalBus;
pub use redis_bus::RedisBus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus transport error: {0}")]
    Transport(String),
}

impl From<redis::RedisError> for BusError {
    fn from(err: redis::RedisError) -> Self {
        BusError::Transport(err.to_string())
    }
}

pub type BusResult<T> = Result<T, BusError>;

/// Messages delivered to one subscriber, in publish order.
///
/// Dropping the subscription releases it on the underlying broker.
pub struct Subscription {
    inner: BoxStream<'static, BusMessage>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(inner: BoxStream<'static, BusMessage>) -> Self {
        Self {
            inner,
            release: None,
        }
    }

    /// Runs `release` on drop, after the underlying stream has been dropped.
    pub fn on_release(mut self, release: impl FnOnce() + Send + 'static) -> Self {
        self.release = Some(Box::new(release));
        self
    }

    /// Next message, or `None` once the broker side has gone away.
    pub async fn recv(&mut self) -> Option<BusMessage> {
        self.inner.next().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            self.inner = stream::empty().boxed();
            release();
        }
    }
}

/// Delivery contract: a subscriber sees every message published on its topic
/// after `subscribe` returns, in the order a single publisher sent them.
/// Publishing to a topic nobody listens on succeeds and delivers nothing.
#[async_trait]
pub trait Bus: Send + Sync {
    async fn subscribe(&self, topic: &str) -> BusResult<Subscription>;
    async fn publish(&self, topic: &str, payload: Bytes) -> BusResult<()>;
}
