//! Broker engine
//!
//! This module contains the in-process access point responsible for:
//! - fanning broadcast records out to every current channel subscriber
//! - appending queue entries to the `sled` log and routing each one to exactly
//!   one member of every consumer group on the topic
//! - tracking pending entries per group until they are acknowledged
//! - reclaiming idle pending entries and redelivering them
//!
//! Concurrency and usage notes:
//! - All routing state sits behind a single mutex. Handlers are never called
//!   while it is held, so a handler may acknowledge from its dispatch task.
//! - Every subscription and every group member gets its own channel drained by
//!   a dedicated `spawn_blocking` task. A slow handler only delays records of
//!   its own subscription.
//! - Dispatch tasks hold a weak reference to the broker; dropping the last
//!   `MemoryBroker` handle closes every channel and lets the tasks finish.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{debug, error, info, warn};

use super::group::{Consumer, ConsumerGroup, PendingEntry};
use super::{AccessPoint, EntryHandler, GroupEntry, RecordHandler, SubscriptionId};
use crate::codec::Codec;
use crate::interceptor::{Interceptor, InterceptorChain};
use crate::message::{BroadcastMessage, QueueMessage};
use crate::persistence::{EntryId, LogStore};
use crate::utils::error::AccessError;

type GroupKey = (String, String);

#[derive(Debug)]
enum Subscription {
    Channel(String),
    Member(GroupKey),
}

#[derive(Debug, Default)]
struct BrokerState {
    channels: HashMap<String, HashMap<SubscriptionId, UnboundedSender<Arc<[u8]>>>>,
    groups: HashMap<GroupKey, ConsumerGroup>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
}

#[derive(Debug, Default)]
struct Counters {
    published: AtomicU64,
    appended: AtomicU64,
    delivered: AtomicU64,
    redelivered: AtomicU64,
    acknowledged: AtomicU64,
    dead: AtomicU64,
}

/// Snapshot of the broker's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: u64,
    pub appended: u64,
    pub delivered: u64,
    pub redelivered: u64,
    pub acknowledged: u64,
    pub dead: u64,
}

/// Result of one reclaim pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub redelivered: usize,
    /// Dropped after exceeding the delivery limit.
    pub dead: usize,
    /// Dropped because the log entry was trimmed.
    pub missing: usize,
}

#[derive(Debug)]
struct Inner {
    interceptors: InterceptorChain,
    store: LogStore,
    state: Mutex<BrokerState>,
    next_subscription: AtomicU64,
    counters: Counters,
}

/// In-process stand-in for a Redis-like store offering pub/sub channels and
/// consumer-group streams.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

/// Collects interceptors before the broker starts dispatching. The chain is
/// frozen by [`MemoryBrokerBuilder::build`].
#[derive(Default)]
pub struct MemoryBrokerBuilder {
    interceptors: InterceptorChain,
    store: Option<LogStore>,
}

impl MemoryBrokerBuilder {
    pub fn interceptor(mut self, interceptor: impl Interceptor + 'static) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn shared_interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn store(mut self, store: LogStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Without an explicit store a temporary one is opened.
    pub fn build(self) -> Result<MemoryBroker, AccessError> {
        let store = match self.store {
            Some(store) => store,
            None => LogStore::temporary(None, None)?,
        };
        Ok(MemoryBroker {
            inner: Arc::new(Inner {
                interceptors: self.interceptors,
                store,
                state: Mutex::new(BrokerState::default()),
                next_subscription: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        })
    }
}

impl MemoryBroker {
    /// Entries read from the log per routing step.
    const DISPATCH_BATCH: usize = 64;

    pub fn builder() -> MemoryBrokerBuilder {
        MemoryBrokerBuilder::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(&self) -> SubscriptionId {
        self.inner.next_subscription.fetch_add(1, Ordering::Relaxed)
    }

    fn weak(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    pub fn store(&self) -> &LogStore {
        &self.inner.store
    }

    /// Publish raw bytes to every current subscriber of `channel`. Returns the
    /// number of subscribers reached; zero subscribers is not an error.
    pub fn publish(&self, channel: &str, payload: &[u8]) -> usize {
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        let payload: Arc<[u8]> = Arc::from(payload);

        let mut state = self.state();
        let Some(subscribers) = state.channels.get_mut(channel) else {
            debug!(channel, "published to channel with no subscribers");
            return 0;
        };

        subscribers.retain(|id, sender| {
            let alive = sender.send(Arc::clone(&payload)).is_ok();
            if !alive {
                warn!(channel, subscription = id, "dropping closed subscriber");
            }
            alive
        });
        let reached = subscribers.len();
        if reached == 0 {
            state.channels.remove(channel);
        }
        reached
    }

    /// Encode `message` and publish it on its channel.
    pub fn publish_message<C: Codec, M: BroadcastMessage>(
        &self,
        codec: &C,
        message: &M,
    ) -> Result<usize, AccessError> {
        let channel = message.channel();
        let bytes = codec.encode(message).map_err(|source| AccessError::Encode {
            identifier: channel.clone(),
            source,
        })?;
        Ok(self.publish(&channel, &bytes))
    }

    /// Append raw bytes to `topic` and route the new entry to every group.
    pub fn append(&self, topic: &str, payload: &[u8]) -> Result<EntryId, AccessError> {
        // Appending under the routing lock keeps ids and routing in one order.
        let mut state = self.state();
        let id = self.inner.store.append(topic, payload)?;
        self.inner.counters.appended.fetch_add(1, Ordering::Relaxed);
        debug!(topic, entry_id = %id, "appended entry");

        let keys: Vec<GroupKey> = state
            .groups
            .keys()
            .filter(|(t, _)| t == topic)
            .cloned()
            .collect();
        for key in keys {
            self.route(&mut state, &key);
        }
        Ok(id)
    }

    /// Encode `message` and append it to its topic.
    pub fn append_message<C: Codec, M: QueueMessage>(
        &self,
        codec: &C,
        message: &M,
    ) -> Result<EntryId, AccessError> {
        let topic = message.topic();
        let bytes = codec.encode(message).map_err(|source| AccessError::Encode {
            identifier: topic.clone(),
            source,
        })?;
        self.append(&topic, &bytes)
    }

    /// Hand every not-yet-delivered entry of the group to its members.
    fn route(&self, state: &mut BrokerState, key: &GroupKey) {
        let Some(group) = state.groups.get_mut(key) else {
            return;
        };
        let (topic, group_name) = key;

        while group.has_consumers() {
            let batch = match self.inner.store.read_after(
                topic,
                group.last_delivered,
                Self::DISPATCH_BATCH,
            ) {
                Ok(batch) => batch,
                Err(e) => {
                    error!(topic, group = group_name, error = %e, "failed to read log");
                    return;
                }
            };
            if batch.is_empty() {
                return;
            }

            for entry in batch {
                let Some(consumer) = group.send(group_name, &entry, 1) else {
                    debug!(topic, group = group_name, "no live consumers; entries wait");
                    return;
                };
                group.mark_pending(entry.id, consumer, Utc::now().timestamp_millis(), 1);
                group.last_delivered = Some(entry.id);
                self.inner.counters.delivered.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Mark a buffered delivery as started. The idle clock restarts here.
    fn begin_delivery(&self, entry: &GroupEntry) -> bool {
        let mut state = self.state();
        let key = (entry.topic.clone(), entry.group.clone());
        state.groups.get_mut(&key).is_some_and(|group| {
            group.begin(entry.id, entry.delivery_count, Utc::now().timestamp_millis())
        })
    }

    /// Current pending set of a group, oldest first.
    pub fn pending(&self, topic: &str, group: &str) -> Vec<PendingEntry> {
        self.state()
            .groups
            .get(&(topic.to_string(), group.to_string()))
            .map(|g| g.pending.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Channels that currently have at least one subscriber.
    pub fn channels(&self) -> Vec<String> {
        self.state().channels.keys().cloned().collect()
    }

    /// Number of live subscribers on a broadcast channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.state().channels.get(channel).map_or(0, HashMap::len)
    }

    pub fn stats(&self) -> BrokerStats {
        let c = &self.inner.counters;
        BrokerStats {
            published: c.published.load(Ordering::Relaxed),
            appended: c.appended.load(Ordering::Relaxed),
            delivered: c.delivered.load(Ordering::Relaxed),
            redelivered: c.redelivered.load(Ordering::Relaxed),
            acknowledged: c.acknowledged.load(Ordering::Relaxed),
            dead: c.dead.load(Ordering::Relaxed),
        }
    }

    /// Redeliver pending entries idle for at least `min_idle`. Entries already
    /// delivered `max_deliveries` times are dropped instead.
    pub fn reclaim(&self, min_idle: Duration, max_deliveries: u32) -> ReclaimReport {
        let now = Utc::now().timestamp_millis();
        let min_idle_ms = i64::try_from(min_idle.as_millis()).unwrap_or(i64::MAX);
        let mut report = ReclaimReport::default();

        let mut state = self.state();
        for ((topic, group_name), group) in state.groups.iter_mut() {
            for stale in group.idle(now, min_idle_ms) {
                if stale.delivery_count >= max_deliveries {
                    group.pending.remove(&stale.id);
                    report.dead += 1;
                    self.inner.counters.dead.fetch_add(1, Ordering::Relaxed);
                    error!(
                        topic,
                        group = group_name,
                        entry_id = %stale.id,
                        deliveries = stale.delivery_count,
                        "entry dropped after exhausting deliveries"
                    );
                    continue;
                }

                let entry = match self.inner.store.get(topic, stale.id) {
                    Ok(Some(entry)) => entry,
                    Ok(None) => {
                        group.pending.remove(&stale.id);
                        report.missing += 1;
                        warn!(topic, group = group_name, entry_id = %stale.id, "pending entry no longer in log");
                        continue;
                    }
                    Err(e) => {
                        error!(topic, error = %e, "failed to load pending entry");
                        continue;
                    }
                };

                let count = stale.delivery_count + 1;
                let Some(consumer) = group.send(group_name, &entry, count) else {
                    debug!(topic, group = group_name, "no live consumers to reclaim to");
                    break;
                };
                info!(
                    topic,
                    group = group_name,
                    entry_id = %stale.id,
                    from = %stale.consumer,
                    to = %consumer.1,
                    delivery = count,
                    "redelivering idle entry"
                );
                group.mark_pending(stale.id, consumer, now, count);
                report.redelivered += 1;
                self.inner.counters.redelivered.fetch_add(1, Ordering::Relaxed);
            }
        }
        report
    }

    /// Periodically reclaim idle entries until every broker handle is dropped.
    pub async fn run_reclaim_loop(self, interval: Duration, min_idle: Duration, max_deliveries: u32) {
        let weak = self.weak();
        drop(self);

        loop {
            tokio::time::sleep(interval).await;

            let Some(inner) = weak.upgrade() else {
                debug!("broker dropped; reclaim loop exiting");
                return;
            };
            let broker = MemoryBroker { inner };
            let report = broker.reclaim(min_idle, max_deliveries);
            if report != ReclaimReport::default() {
                info!(?report, "reclaim pass finished");
            }
        }
    }

    /// Close every subscription and group membership.
    pub fn shutdown(&self) {
        let mut state = self.state();
        state.channels.clear();
        for group in state.groups.values_mut() {
            group.consumers.clear();
        }
        state.subscriptions.clear();
        info!("broker shut down");
    }
}

impl AccessPoint for MemoryBroker {
    fn acknowledge(&self, topic: &str, group: &str, id: EntryId) -> Result<u64, AccessError> {
        let mut state = self.state();
        let key = (topic.to_string(), group.to_string());
        let Some(consumer_group) = state.groups.get_mut(&key) else {
            return Err(AccessError::UnknownGroup {
                topic: key.0,
                group: key.1,
            });
        };
        let acked = consumer_group.ack(id);
        self.inner
            .counters
            .acknowledged
            .fetch_add(acked, Ordering::Relaxed);
        Ok(acked)
    }

    fn interceptors(&self) -> &InterceptorChain {
        &self.inner.interceptors
    }

    fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<SubscriptionId, AccessError> {
        let runtime = Handle::try_current().map_err(|_| AccessError::NoRuntime)?;
        let id = self.next_id();
        let (tx, mut rx) = mpsc::unbounded_channel::<Arc<[u8]>>();

        let weak = self.weak();
        let channel_name = channel.to_string();
        runtime.spawn_blocking(move || {
            while let Some(payload) = rx.blocking_recv() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let broker = MemoryBroker { inner };
                handler.on_record(&broker, &channel_name, &payload);
            }
            debug!(channel = %channel_name, subscription = id, "dispatch loop closed");
        });

        let mut state = self.state();
        state
            .channels
            .entry(channel.to_string())
            .or_default()
            .insert(id, tx);
        state
            .subscriptions
            .insert(id, Subscription::Channel(channel.to_string()));
        info!(channel, subscription = id, "subscribed");
        Ok(id)
    }

    fn consume(
        &self,
        topic: &str,
        group: &str,
        consumer: &str,
        handler: Arc<dyn EntryHandler>,
    ) -> Result<SubscriptionId, AccessError> {
        let runtime = Handle::try_current().map_err(|_| AccessError::NoRuntime)?;
        let id = self.next_id();
        let (tx, mut rx) = mpsc::unbounded_channel::<GroupEntry>();

        let weak = self.weak();
        runtime.spawn_blocking(move || {
            while let Some(entry) = rx.blocking_recv() {
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let broker = MemoryBroker { inner };
                if !broker.begin_delivery(&entry) {
                    debug!(
                        topic = %entry.topic,
                        group = %entry.group,
                        entry_id = %entry.id,
                        delivery = entry.delivery_count,
                        "skipping delivery that was acknowledged or superseded"
                    );
                    continue;
                }
                handler.on_entry(&broker, &entry);
            }
            debug!(subscription = id, "consumer loop closed");
        });

        let key = (topic.to_string(), group.to_string());
        let mut state = self.state();
        state.groups.entry(key.clone()).or_default().join(Consumer {
            id,
            name: consumer.to_string(),
            sender: tx,
        });
        state
            .subscriptions
            .insert(id, Subscription::Member(key.clone()));
        info!(topic, group, consumer, subscription = id, "joined consumer group");

        // Backlog appended before this member joined.
        self.route(&mut state, &key);
        Ok(id)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<(), AccessError> {
        let mut state = self.state();
        match state.subscriptions.remove(&id) {
            Some(Subscription::Channel(channel)) => {
                if let Some(subscribers) = state.channels.get_mut(&channel) {
                    subscribers.remove(&id);
                    if subscribers.is_empty() {
                        state.channels.remove(&channel);
                    }
                }
                info!(channel = %channel, subscription = id, "unsubscribed");
                Ok(())
            }
            Some(Subscription::Member(key)) => {
                if let Some(group) = state.groups.get_mut(&key) {
                    group.leave(id);
                }
                info!(topic = %key.0, group = %key.1, subscription = id, "left consumer group");
                Ok(())
            }
            None => Err(AccessError::UnknownSubscription(id)),
        }
    }
}
