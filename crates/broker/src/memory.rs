//! In-process broker with the same semantics as the Redis backend.
//!
//! Used by tests and by single-process deployments. Lists, values and
//! channels live behind separate mutexes; no lock is held across an await
//! point other than the lock acquisition itself.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use courier_core::CourierError;
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::subscription::Subscription;
use crate::traits::{Broker, CappedList, KeyValueStore, PubSub, WorkQueue};

/// Per-channel buffer; a subscriber that falls this far behind skips messages.
const CHANNEL_CAPACITY: usize = 64;

struct StoredValue {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

pub struct MemoryBroker {
    lists: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    pushed: Notify,
    values: Mutex<HashMap<String, StoredValue>>,
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
    connected: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            lists: Mutex::new(HashMap::new()),
            pushed: Notify::new(),
            values: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
        }
    }

    /// Simulate losing the broker: every later call fails with a transport
    /// error and open subscriptions end.
    pub async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.channels.lock().await.clear();
        self.pushed.notify_waiters();
    }

    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Number of channels that currently have at least one subscriber.
    pub async fn active_channels(&self) -> usize {
        self.channels
            .lock()
            .await
            .values()
            .filter(|tx| tx.receiver_count() > 0)
            .count()
    }

    fn ensure_connected(&self) -> Result<(), CourierError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CourierError::Transport("memory broker disconnected".into()))
        }
    }

    async fn try_pop(&self, queue: &str) -> Option<Vec<u8>> {
        let mut lists = self.lists.lock().await;
        let list = lists.get_mut(queue)?;
        let item = list.pop_front();
        if list.is_empty() {
            lists.remove(queue);
        }
        item
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkQueue for MemoryBroker {
    async fn push(&self, queue: &str, item: Vec<u8>) -> Result<u64, CourierError> {
        self.ensure_connected()?;
        let len = {
            let mut lists = self.lists.lock().await;
            let list = lists.entry(queue.to_string()).or_default();
            list.push_back(item);
            list.len() as u64
        };
        self.pushed.notify_waiters();
        Ok(len)
    }

    async fn pop(&self, queue: &str, wait: Duration) -> Result<Option<Vec<u8>>, CourierError> {
        let deadline = Instant::now() + wait;
        loop {
            self.ensure_connected()?;

            // Register for wakeups before looking, so a push between the
            // check and the wait is not missed.
            let notified = self.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.try_pop(queue).await {
                return Ok(Some(item));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn len(&self, queue: &str) -> Result<u64, CourierError> {
        self.ensure_connected()?;
        let lists = self.lists.lock().await;
        Ok(lists.get(queue).map_or(0, |list| list.len() as u64))
    }
}

#[async_trait]
impl KeyValueStore for MemoryBroker {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<(), CourierError> {
        self.ensure_connected()?;
        let now = Instant::now();
        let stored = StoredValue {
            value,
            expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
        };
        let mut values = self.values.lock().await;
        // Slots nobody reads again are only reclaimed here.
        values.retain(|_, stored| stored.is_live(now));
        values.insert(key.to_string(), stored);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CourierError> {
        self.ensure_connected()?;
        let mut values = self.values.lock().await;
        match values.get(key) {
            Some(stored) if stored.is_live(Instant::now()) => Ok(Some(stored.value.clone())),
            Some(_) => {
                values.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, CourierError> {
        self.ensure_connected()?;
        let removed = self.values.lock().await.remove(key);
        Ok(removed.is_some_and(|stored| stored.is_live(Instant::now())))
    }
}

#[async_trait]
impl PubSub for MemoryBroker {
    async fn publish(&self, channel: &str, message: Vec<u8>) -> Result<u64, CourierError> {
        self.ensure_connected()?;
        let mut channels = self.channels.lock().await;
        let Some(tx) = channels.get(channel) else {
            return Ok(0);
        };
        match tx.send(message) {
            Ok(receivers) => Ok(receivers as u64),
            Err(_) => {
                // Every subscriber is gone; forget the channel.
                channels.remove(channel);
                Ok(0)
            }
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<Subscription, CourierError> {
        self.ensure_connected()?;
        let rx = {
            let mut channels = self.channels.lock().await;
            channels.retain(|_, tx| tx.receiver_count() > 0);
            channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe()
        };
        debug!(channel = %channel, "subscribed");

        let name = channel.to_string();
        let messages = futures::stream::unfold(rx, move |mut rx| {
            let name = name.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok(message) => return Some((message, rx)),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(channel = %name, skipped, "subscriber lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        });
        Ok(Subscription::new(channel, messages.boxed()))
    }
}

#[async_trait]
impl CappedList for MemoryBroker {
    async fn prepend_capped(&self, list: &str, entry: Vec<u8>, max_len: usize) -> Result<(), CourierError> {
        self.ensure_connected()?;
        let mut lists = self.lists.lock().await;
        let list = lists.entry(list.to_string()).or_default();
        list.push_front(entry);
        list.truncate(max_len);
        Ok(())
    }

    async fn head(&self, list: &str, count: usize) -> Result<Vec<Vec<u8>>, CourierError> {
        self.ensure_connected()?;
        let lists = self.lists.lock().await;
        Ok(lists
            .get(list)
            .map(|list| list.iter().take(count).cloned().collect())
            .unwrap_or_default())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn ping(&self) -> Result<(), CourierError> {
        self.ensure_connected()
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn push_pop_is_fifo() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.push("q", b"one".to_vec()).await.unwrap(), 1);
        assert_eq!(broker.push("q", b"two".to_vec()).await.unwrap(), 2);

        let wait = Duration::from_millis(10);
        assert_eq!(broker.pop("q", wait).await.unwrap().unwrap(), b"one");
        assert_eq!(broker.pop("q", wait).await.unwrap().unwrap(), b"two");
        assert_eq!(broker.len("q").await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn pop_on_empty_queue_waits_then_gives_up() {
        let broker = MemoryBroker::new();
        let started = Instant::now();
        let item = broker.pop("q", Duration::from_secs(1)).await.unwrap();
        assert!(item.is_none());
        assert_eq!(started.elapsed(), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn pop_wakes_up_on_push() {
        let broker = Arc::new(MemoryBroker::new());
        let consumer = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.pop("q", Duration::from_secs(10)).await })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        broker.push("q", b"late".to_vec()).await.unwrap();

        let item = consumer.await.unwrap().unwrap();
        assert_eq!(item.as_deref(), Some(&b"late"[..]));
    }

    #[tokio::test]
    async fn concurrent_pops_never_share_an_item() {
        let broker = Arc::new(MemoryBroker::new());
        for i in 0..50u32 {
            broker.push("q", i.to_be_bytes().to_vec()).await.unwrap();
        }

        let mut consumers = Vec::new();
        for _ in 0..4 {
            let broker = broker.clone();
            consumers.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(item) = broker.pop("q", Duration::from_millis(20)).await.unwrap() {
                    seen.push(item);
                }
                seen
            }));
        }

        let mut all = Vec::new();
        for consumer in consumers {
            all.extend(consumer.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 50);
    }

    #[tokio::test(start_paused = true)]
    async fn values_expire_after_ttl() {
        let broker = MemoryBroker::new();
        broker
            .set("k", b"v".to_vec(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(broker.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(broker.get("k").await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_values_are_reclaimed_without_reads() {
        let broker = MemoryBroker::new();
        for i in 0..100 {
            broker
                .set(&format!("orphan-{i}"), b"v".to_vec(), Some(Duration::from_secs(1)))
                .await
                .unwrap();
        }
        broker.set("kept", b"v".to_vec(), None).await.unwrap();
        assert_eq!(broker.values.lock().await.len(), 101);

        tokio::time::advance(Duration::from_secs(3600)).await;
        broker.set("fresh", b"v".to_vec(), Some(Duration::from_secs(1))).await.unwrap();

        let values = broker.values.lock().await;
        assert_eq!(values.len(), 2);
        assert!(values.contains_key("kept"));
        assert!(values.contains_key("fresh"));
    }

    #[tokio::test]
    async fn huge_ttl_never_expires() {
        let broker = MemoryBroker::new();
        broker
            .set("k", b"v".to_vec(), Some(Duration::from_secs(u64::MAX)))
            .await
            .unwrap();
        assert_eq!(broker.get("k").await.unwrap().as_deref(), Some(&b"v"[..]));
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let broker = MemoryBroker::new();
        broker.set("k", b"v".to_vec(), None).await.unwrap();
        assert!(broker.delete("k").await.unwrap());
        assert!(!broker.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn publish_without_subscriber_is_lost() {
        let broker = MemoryBroker::new();
        assert_eq!(broker.publish("ch", b"nobody".to_vec()).await.unwrap(), 0);

        let mut sub = broker.subscribe("ch").await.unwrap();
        assert_eq!(broker.publish("ch", b"hello".to_vec()).await.unwrap(), 1);
        assert_eq!(sub.recv().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn dropped_subscription_is_released() {
        let broker = MemoryBroker::new();
        let sub = broker.subscribe("ch").await.unwrap();
        assert_eq!(broker.active_channels().await, 1);

        drop(sub);
        assert_eq!(broker.active_channels().await, 0);
        assert_eq!(broker.publish("ch", b"late".to_vec()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn capped_list_keeps_newest_entries() {
        let broker = MemoryBroker::new();
        for i in 0..5u8 {
            broker.prepend_capped("logs", vec![i], 3).await.unwrap();
        }
        let head = broker.head("logs", 10).await.unwrap();
        assert_eq!(head, vec![vec![4], vec![3], vec![2]]);
    }

    #[tokio::test]
    async fn disconnect_fails_calls_and_ends_subscriptions() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("ch").await.unwrap();

        broker.disconnect().await;
        assert!(sub.recv().await.is_none());
        assert!(matches!(
            broker.push("q", vec![1]).await,
            Err(CourierError::Transport(_))
        ));
        assert!(broker.ping().await.is_err());

        broker.reconnect();
        assert!(broker.ping().await.is_ok());
    }
}
