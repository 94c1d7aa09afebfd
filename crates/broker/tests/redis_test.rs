//! Integration tests for the Redis broker.
//!
//! These need a live server and are ignored by default:
//!
//! ```text
//! REDIS_URL=redis://127.0.0.1:6379/15 cargo test -p courier-broker -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use courier_broker::{Broker, CappedList, KeyValueStore, PubSub, RedisBroker, WorkQueue};
use tokio::time::timeout;
use uuid::Uuid;

const TIMEOUT: Duration = Duration::from_secs(5);

async fn connect() -> RedisBroker {
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/15".into());
    RedisBroker::open(&url).await.expect("redis reachable")
}

/// Per-test key so parallel runs never collide.
fn unique(prefix: &str) -> String {
    format!("courier_test:{prefix}:{}", Uuid::new_v4())
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn ping() {
    let broker = connect().await;
    broker.ping().await.unwrap();
    assert_eq!(broker.name(), "redis");
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn queue_is_fifo_and_pop_times_out() {
    let broker = connect().await;
    let queue = unique("queue");

    assert_eq!(broker.push(&queue, b"one".to_vec()).await.unwrap(), 1);
    assert_eq!(broker.push(&queue, b"two".to_vec()).await.unwrap(), 2);
    assert_eq!(broker.len(&queue).await.unwrap(), 2);

    let wait = Duration::from_millis(200);
    assert_eq!(broker.pop(&queue, wait).await.unwrap(), Some(b"one".to_vec()));
    assert_eq!(broker.pop(&queue, wait).await.unwrap(), Some(b"two".to_vec()));
    assert_eq!(broker.pop(&queue, wait).await.unwrap(), None);
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn blocking_pop_does_not_stall_other_commands() {
    let broker = Arc::new(connect().await);
    let queue = unique("queue");
    let key = unique("key");

    let popper = {
        let broker = broker.clone();
        let queue = queue.clone();
        tokio::spawn(async move { broker.pop(&queue, Duration::from_secs(3)).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Runs while the BLPOP is parked.
    timeout(Duration::from_secs(1), broker.set(&key, b"v".to_vec(), None))
        .await
        .expect("set not blocked by BLPOP")
        .unwrap();
    broker.push(&queue, b"item".to_vec()).await.unwrap();

    let popped = timeout(TIMEOUT, popper).await.unwrap().unwrap().unwrap();
    assert_eq!(popped, Some(b"item".to_vec()));
    assert!(broker.delete(&key).await.unwrap());
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn values_with_ttl_expire() {
    let broker = connect().await;
    let key = unique("ttl");

    broker
        .set(&key, b"short".to_vec(), Some(Duration::from_millis(100)))
        .await
        .unwrap();
    assert_eq!(broker.get(&key).await.unwrap(), Some(b"short".to_vec()));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(broker.get(&key).await.unwrap(), None);
    assert!(!broker.delete(&key).await.unwrap());
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn publish_reaches_subscriber() {
    let broker = connect().await;
    let channel = unique("channel");

    assert_eq!(broker.publish(&channel, b"early".to_vec()).await.unwrap(), 0);

    let mut sub = broker.subscribe(&channel).await.unwrap();
    assert_eq!(broker.publish(&channel, b"hello".to_vec()).await.unwrap(), 1);

    let message = timeout(TIMEOUT, sub.recv()).await.unwrap();
    assert_eq!(message, Some(b"hello".to_vec()));
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn capped_list_trims() {
    let broker = connect().await;
    let list = unique("logs");

    for i in 0..5u8 {
        broker.prepend_capped(&list, vec![i], 3).await.unwrap();
    }
    let head = broker.head(&list, 10).await.unwrap();
    assert_eq!(head, vec![vec![4], vec![3], vec![2]]);
    assert!(broker.head(&list, 0).await.unwrap().is_empty());

    broker.delete(&list).await.unwrap();
}
