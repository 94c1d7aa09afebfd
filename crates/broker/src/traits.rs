use std::time::Duration;

use async_trait::async_trait;
use courier_core::CourierError;

use crate::subscription::Subscription;

/// Ordered list primitives backing the work queue.
///
/// `pop` is atomic: an item returned to one caller is removed from the list
/// and can never be handed to another consumer.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Append an item at the tail. Returns the list length after the push.
    async fn push(&self, queue: &str, item: Vec<u8>) -> Result<u64, CourierError>;

    /// Remove and return the head item, waiting up to `wait` for one to appear.
    async fn pop(&self, queue: &str, wait: Duration) -> Result<Option<Vec<u8>>, CourierError>;

    /// Current number of items in the list.
    async fn len(&self, queue: &str) -> Result<u64, CourierError>;
}

/// Key-value primitives backing the durable result slot.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Store `value` under `key`, expiring after `ttl` when given.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CourierError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CourierError>;

    /// Remove `key`. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool, CourierError>;
}

/// Fire-and-forget publish/subscribe channels.
///
/// Messages published while nobody is subscribed are lost; there is no replay.
#[async_trait]
pub trait PubSub: Send + Sync {
    /// Publish a message. Returns the number of subscribers that received it.
    async fn publish(&self, channel: &str, message: Vec<u8>) -> Result<u64, CourierError>;

    /// Subscribe to a channel. The subscription is active once this returns.
    async fn subscribe(&self, channel: &str) -> Result<Subscription, CourierError>;
}

/// Newest-first capped lists used for the activity log.
#[async_trait]
pub trait CappedList: Send + Sync {
    /// Prepend `entry` and trim the list to at most `max_len` entries.
    async fn prepend_capped(&self, list: &str, entry: Vec<u8>, max_len: usize) -> Result<(), CourierError>;

    /// The first `count` entries (newest first).
    async fn head(&self, list: &str, count: usize) -> Result<Vec<Vec<u8>>, CourierError>;
}

/// The shared broker: the only coordination point between gateways and the worker.
#[async_trait]
pub trait Broker: WorkQueue + KeyValueStore + PubSub + CappedList {
    /// Round-trip check against the broker.
    async fn ping(&self) -> Result<(), CourierError>;

    /// Short backend name used in logs and health output.
    fn name(&self) -> &str;
}
