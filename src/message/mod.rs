//! Message envelopes and the payload-type binding used by listeners.
//!
//! A payload picks its delivery primitive by implementing either
//! [`BroadcastMessage`] or [`QueueMessage`]; the channel or topic it travels on
//! is derived from the type unless the type overrides it.

pub mod envelope;
pub mod payload_type;

pub use envelope::{BroadcastMessage, Envelope, QueueMessage, simple_type_name};
pub use payload_type::{DeliveryKind, PayloadType};
