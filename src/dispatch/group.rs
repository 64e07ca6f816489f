use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedSender;

use super::{GroupEntry, SubscriptionId};
use crate::persistence::{EntryId, StoredEntry};

/// Delivered but not yet acknowledged entry of a consumer group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: EntryId,
    pub consumer: String,
    /// Millis timestamp of the latest hand-off, refreshed when the member's
    /// dispatch task picks the entry up.
    pub delivered_at: i64,
    pub delivery_count: u32,
    /// Whether the member has started handling the latest delivery. Entries
    /// still buffered for a live member are never idle.
    pub started: bool,
    pub(crate) member: SubscriptionId,
}

#[derive(Debug)]
pub(crate) struct Consumer {
    pub id: SubscriptionId,
    pub name: String,
    pub sender: UnboundedSender<GroupEntry>,
}

/// Competing consumers on one topic plus the group's pending set.
#[derive(Debug, Default)]
pub(crate) struct ConsumerGroup {
    /// Highest entry handed to any member; `None` means start of the log.
    pub last_delivered: Option<EntryId>,
    pub consumers: Vec<Consumer>,
    pub pending: BTreeMap<EntryId, PendingEntry>,
    cursor: usize,
}

impl ConsumerGroup {
    pub fn join(&mut self, consumer: Consumer) {
        self.consumers.push(consumer);
    }

    pub fn leave(&mut self, id: SubscriptionId) -> bool {
        let before = self.consumers.len();
        self.consumers.retain(|c| c.id != id);
        before != self.consumers.len()
    }

    pub fn has_consumers(&self) -> bool {
        !self.consumers.is_empty()
    }

    /// Hand `entry` to the next live member, round robin. Members whose
    /// dispatch task is gone are dropped from the group. Returns the
    /// subscription id and name of the receiving consumer.
    pub fn send(
        &mut self,
        group: &str,
        entry: &StoredEntry,
        delivery_count: u32,
    ) -> Option<(SubscriptionId, String)> {
        let payload: Arc<[u8]> = Arc::from(entry.payload.as_slice());

        while !self.consumers.is_empty() {
            let index = self.cursor % self.consumers.len();
            self.cursor = self.cursor.wrapping_add(1);
            let consumer = &self.consumers[index];

            let delivery = GroupEntry {
                id: entry.id,
                topic: entry.topic.clone(),
                group: group.to_string(),
                consumer: consumer.name.clone(),
                payload: Arc::clone(&payload),
                delivery_count,
            };

            if consumer.sender.send(delivery).is_ok() {
                return Some((consumer.id, consumer.name.clone()));
            }
            self.consumers.remove(index);
        }
        None
    }

    pub fn mark_pending(
        &mut self,
        id: EntryId,
        (member, consumer): (SubscriptionId, String),
        now: i64,
        delivery_count: u32,
    ) {
        self.pending.insert(
            id,
            PendingEntry {
                id,
                consumer,
                delivered_at: now,
                delivery_count,
                started: false,
                member,
            },
        );
    }

    /// Called by a member's dispatch task right before handling. Returns
    /// `false` when the delivery was acknowledged or superseded by a reclaim
    /// while it sat in the member's buffer.
    pub fn begin(&mut self, id: EntryId, delivery_count: u32, now: i64) -> bool {
        match self.pending.get_mut(&id) {
            Some(p) if p.delivery_count == delivery_count => {
                p.started = true;
                p.delivered_at = now;
                true
            }
            _ => false,
        }
    }

    /// Retire one pending entry; 0 if it was not pending.
    pub fn ack(&mut self, id: EntryId) -> u64 {
        u64::from(self.pending.remove(&id).is_some())
    }

    /// Pending entries whose handling started at least `min_idle_ms` ago,
    /// plus entries stranded in the buffer of a member that left.
    pub fn idle(&self, now: i64, min_idle_ms: i64) -> Vec<PendingEntry> {
        self.pending
            .values()
            .filter(|p| {
                if p.started {
                    now - p.delivered_at >= min_idle_ms
                } else {
                    !self.consumers.iter().any(|c| c.id == p.member)
                }
            })
            .cloned()
            .collect()
    }
}
