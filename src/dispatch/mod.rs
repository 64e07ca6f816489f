//! The dispatch access point: the seam between listeners and the backing store.
//!
//! Listeners only ever talk to a store through [`AccessPoint`]. The store calls
//! back into a listener through [`RecordHandler`] (broadcast) or
//! [`EntryHandler`] (queue), passing itself along so the listener can read the
//! interceptor chain and acknowledge without holding a reference of its own.
//!
//! [`MemoryBroker`] is the bundled in-process implementation.

pub mod engine;
pub mod group;

pub use engine::{BrokerStats, MemoryBroker, MemoryBrokerBuilder, ReclaimReport};
pub use group::PendingEntry;

use std::sync::Arc;

use crate::interceptor::InterceptorChain;
use crate::persistence::EntryId;
use crate::utils::error::AccessError;

pub type SubscriptionId = u64;

/// A log entry as handed to one member of a consumer group.
#[derive(Debug, Clone)]
pub struct GroupEntry {
    pub id: EntryId,
    pub topic: String,
    pub group: String,
    pub consumer: String,
    pub payload: Arc<[u8]>,
    /// 1 on first delivery, incremented by every reclaim.
    pub delivery_count: u32,
}

/// Callback for records arriving on a broadcast channel.
pub trait RecordHandler: Send + Sync {
    fn on_record(&self, access: &dyn AccessPoint, channel: &str, payload: &[u8]);
}

/// Callback for entries delivered to a consumer-group member.
pub trait EntryHandler: Send + Sync {
    fn on_entry(&self, access: &dyn AccessPoint, entry: &GroupEntry);
}

/// Connection to the backing store as seen by listeners.
///
/// Every method must be safe to call concurrently from many dispatch tasks.
pub trait AccessPoint: Send + Sync {
    /// Retire `id` from `group`'s pending set. Returns how many entries were
    /// acknowledged; 0 means it was already gone, which is not an error.
    fn acknowledge(&self, topic: &str, group: &str, id: EntryId) -> Result<u64, AccessError>;

    /// Interceptors in registration order.
    fn interceptors(&self) -> &InterceptorChain;

    fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<SubscriptionId, AccessError>;

    /// Join `consumer` to `group` on `topic`, creating the group if needed.
    fn consume(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        handler: Arc<dyn EntryHandler>,
    ) -> Result<SubscriptionId, AccessError>;

    /// Detach a subscription or group member. Pending entries of a removed
    /// member stay pending until reclaimed.
    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), AccessError>;
}
