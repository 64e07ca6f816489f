use std::sync::Arc;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::handler::{Delivery, QueueHandler, call_handler};
use crate::codec::{Codec, JsonCodec};
use crate::config::QueueSettings;
use crate::dispatch::{AccessPoint, EntryHandler, GroupEntry, SubscriptionId};
use crate::interceptor::MessageContext;
use crate::message::{DeliveryKind, PayloadType};
use crate::utils::error::{AccessError, ListenerError};

/// What happened to one queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueOutcome {
    /// Handler succeeded and the entry left the pending set.
    Acknowledged,
    /// Handler succeeded but the acknowledgment did not go through; the entry
    /// may be delivered again.
    AckFailed,
    /// Handler failed; the entry stays pending for reclaim.
    HandlerFailed,
    /// Payload did not decode and was acknowledged without handling.
    Poisoned { acknowledged: bool },
}

/// Consumes one (topic, group) pair of the persistent log.
pub struct QueueListener<H, C = JsonCodec> {
    name: &'static str,
    payload: PayloadType,
    group: String,
    consumer: String,
    handler: H,
    codec: C,
}

impl<H: QueueHandler> QueueListener<H> {
    pub fn new(handler: H, group: impl Into<String>) -> Result<Self, ListenerError> {
        Self::with_codec(handler, group, JsonCodec)
    }

    /// Group and consumer name taken from configuration.
    pub fn from_settings(handler: H, settings: &QueueSettings) -> Result<Self, ListenerError> {
        let listener = Self::new(handler, settings.group.clone())?;
        Ok(match &settings.consumer {
            Some(consumer) => listener.with_consumer(consumer.clone()),
            None => listener,
        })
    }
}

impl<H: QueueHandler, C: Codec> QueueListener<H, C> {
    pub fn with_codec(handler: H, group: impl Into<String>, codec: C) -> Result<Self, ListenerError> {
        let name = std::any::type_name::<H>();
        let group = group.into();
        if group.trim().is_empty() {
            return Err(ListenerError::MissingGroup { listener: name });
        }

        let payload = PayloadType::resolve_queue::<H::Message>(name)?;
        debug!(
            listener = name,
            topic = %payload.identifier,
            group = %group,
            payload_type = payload.type_name,
            "queue listener resolved"
        );
        Ok(Self {
            name,
            payload,
            group,
            consumer: format!("consumer-{}", Uuid::new_v4()),
            handler,
            codec,
        })
    }

    /// Override the generated consumer name.
    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn topic(&self) -> &str {
        &self.payload.identifier
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn payload_type(&self) -> &PayloadType {
        &self.payload
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Join this listener's consumer group.
    pub fn start(self: Arc<Self>, access: &dyn AccessPoint) -> Result<SubscriptionId, AccessError> {
        let topic = self.payload.identifier.clone();
        let group = self.group.clone();
        let consumer = self.consumer.clone();
        let id = access.consume(&topic, &group, &consumer, self)?;
        info!(topic = %topic, group = %group, consumer = %consumer, subscription = id, "queue listener started");
        Ok(id)
    }

    fn acknowledge(&self, access: &dyn AccessPoint, entry: &GroupEntry) -> bool {
        match access.acknowledge(&entry.topic, &entry.group, entry.id) {
            Ok(0) => {
                debug!(topic = %entry.topic, entry_id = %entry.id, "entry was already acknowledged");
                true
            }
            Ok(_) => true,
            Err(e) => {
                warn!(
                    topic = %entry.topic,
                    group = %entry.group,
                    entry_id = %entry.id,
                    error = %e,
                    "acknowledgment failed; entry may be redelivered"
                );
                false
            }
        }
    }

    /// Run one entry through decode, interceptors, the handler and
    /// acknowledgment. Never propagates a failure.
    pub fn process(&self, access: &dyn AccessPoint, entry: &GroupEntry) -> QueueOutcome {
        let Some(message) = self.codec.decode::<H::Message>(&entry.payload) else {
            // An entry that never decodes would otherwise stay pending forever.
            let acknowledged = self.acknowledge(access, entry);
            warn!(
                topic = %entry.topic,
                group = %entry.group,
                entry_id = %entry.id,
                payload_type = self.payload.type_name,
                acknowledged,
                "poison entry acknowledged without handling"
            );
            return QueueOutcome::Poisoned { acknowledged };
        };

        let delivery = Delivery {
            topic: &entry.topic,
            group: &entry.group,
            consumer: &entry.consumer,
            entry_id: entry.id,
            delivery_count: entry.delivery_count,
        };
        let ctx = MessageContext {
            kind: DeliveryKind::Queue,
            identifier: &entry.topic,
            payload_type: self.payload.type_name,
            entry_id: Some(&entry.id),
            group: Some(&entry.group),
            message: &message,
        };
        let interceptors = access.interceptors();

        interceptors.run_before(&ctx);
        let outcome = match call_handler(|| self.handler.on_message(&delivery, &message)) {
            Ok(()) => {
                if self.acknowledge(access, entry) {
                    QueueOutcome::Acknowledged
                } else {
                    QueueOutcome::AckFailed
                }
            }
            Err(failure) => {
                error!(
                    listener = self.name,
                    topic = %entry.topic,
                    group = %entry.group,
                    entry_id = %entry.id,
                    delivery = entry.delivery_count,
                    payload_type = self.payload.type_name,
                    "queue handler failed: {failure}"
                );
                QueueOutcome::HandlerFailed
            }
        };
        interceptors.run_after(&ctx);

        match outcome {
            QueueOutcome::Acknowledged => {
                debug!(topic = %entry.topic, entry_id = %entry.id, "entry acknowledged")
            }
            _ => info!(
                topic = %entry.topic,
                group = %entry.group,
                entry_id = %entry.id,
                ?outcome,
                "entry not acknowledged; left for reclaim"
            ),
        }
        outcome
    }
}

impl<H: QueueHandler, C: Codec> EntryHandler for QueueListener<H, C> {
    fn on_entry(&self, access: &dyn AccessPoint, entry: &GroupEntry) {
        self.process(access, entry);
    }
}

impl<H, C> std::fmt::Debug for QueueListener<H, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueListener")
            .field("name", &self.name)
            .field("topic", &self.payload.identifier)
            .field("group", &self.group)
            .field("consumer", &self.consumer)
            .finish()
    }
}
