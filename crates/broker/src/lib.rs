pub mod activity;
pub mod memory;
pub mod redis;
pub mod subscription;
pub mod traits;

pub use activity::{ActivityEntry, ActivityLog};
pub use memory::MemoryBroker;
pub use self::redis::RedisBroker;
pub use subscription::Subscription;
pub use traits::{Broker, CappedList, KeyValueStore, PubSub, WorkQueue};
