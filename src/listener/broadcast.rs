use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::handler::{BroadcastHandler, call_handler};
use crate::codec::{Codec, JsonCodec};
use crate::dispatch::{AccessPoint, RecordHandler, SubscriptionId};
use crate::interceptor::MessageContext;
use crate::message::{DeliveryKind, PayloadType};
use crate::utils::error::{AccessError, ListenerError};

/// What happened to one broadcast record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    Handled,
    /// Handler returned an error or panicked. The record is gone.
    Failed,
    /// Payload did not decode; the handler was not called.
    Dropped,
}

/// Listens on one broadcast channel, derived from the handler's message type.
pub struct BroadcastListener<H, C = JsonCodec> {
    name: &'static str,
    payload: PayloadType,
    handler: H,
    codec: C,
}

impl<H: BroadcastHandler> BroadcastListener<H> {
    pub fn new(handler: H) -> Result<Self, ListenerError> {
        Self::with_codec(handler, JsonCodec)
    }
}

impl<H: BroadcastHandler, C: Codec> BroadcastListener<H, C> {
    /// Resolve the payload type now so a bad declaration never reaches dispatch.
    pub fn with_codec(handler: H, codec: C) -> Result<Self, ListenerError> {
        let name = std::any::type_name::<H>();
        let payload = PayloadType::resolve_broadcast::<H::Message>(name)?;
        debug!(
            listener = name,
            channel = %payload.identifier,
            payload_type = payload.type_name,
            "broadcast listener resolved"
        );
        Ok(Self {
            name,
            payload,
            handler,
            codec,
        })
    }

    pub fn channel(&self) -> &str {
        &self.payload.identifier
    }

    pub fn payload_type(&self) -> &PayloadType {
        &self.payload
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Subscribe this listener to its channel.
    pub fn start(self: Arc<Self>, access: &dyn AccessPoint) -> Result<SubscriptionId, AccessError> {
        let channel = self.payload.identifier.clone();
        let id = access.subscribe(&channel, self)?;
        info!(channel = %channel, subscription = id, "broadcast listener started");
        Ok(id)
    }

    /// Run one record through decode, interceptors and the handler. Never
    /// propagates a failure.
    pub fn process(&self, access: &dyn AccessPoint, channel: &str, raw: &[u8]) -> BroadcastOutcome {
        let Some(message) = self.codec.decode::<H::Message>(raw) else {
            warn!(
                channel,
                payload_type = self.payload.type_name,
                bytes = raw.len(),
                "dropping broadcast record that did not decode"
            );
            return BroadcastOutcome::Dropped;
        };

        let ctx = MessageContext {
            kind: DeliveryKind::Broadcast,
            identifier: channel,
            payload_type: self.payload.type_name,
            entry_id: None,
            group: None,
            message: &message,
        };
        let interceptors = access.interceptors();

        interceptors.run_before(&ctx);
        let result = call_handler(|| self.handler.on_message(channel, &message));
        interceptors.run_after(&ctx);

        match result {
            Ok(()) => BroadcastOutcome::Handled,
            Err(failure) => {
                // No retry: the record no longer exists anywhere.
                error!(
                    listener = self.name,
                    channel,
                    payload_type = self.payload.type_name,
                    "broadcast handler failed: {failure}"
                );
                BroadcastOutcome::Failed
            }
        }
    }
}

impl<H: BroadcastHandler, C: Codec> RecordHandler for BroadcastListener<H, C> {
    fn on_record(&self, access: &dyn AccessPoint, channel: &str, payload: &[u8]) {
        self.process(access, channel, payload);
    }
}

impl<H, C> std::fmt::Debug for BroadcastListener<H, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastListener")
            .field("name", &self.name)
            .field("channel", &self.payload.identifier)
            .field("payload_type", &self.payload.type_name)
            .finish()
    }
}
