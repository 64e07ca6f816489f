//! Broadcast and queue listeners.
//!
//! A listener is built once at startup from a handler whose associated
//! `Message` type names the single payload it accepts. Construction resolves
//! the channel or topic eagerly and fails if it cannot. After that a listener
//! is immutable and may be driven from any number of dispatch tasks.
//!
//! Per record both kinds decode, run before-interceptors, call the handler and
//! run after-interceptors in reverse. Queue listeners additionally acknowledge
//! successful (or undecodable) entries before the after-interceptors run.

pub mod broadcast;
pub mod handler;
pub mod queue;

pub use broadcast::{BroadcastListener, BroadcastOutcome};
pub use handler::{
    BroadcastHandler, Delivery, FnBroadcastHandler, FnQueueHandler, QueueHandler, broadcast_fn,
    queue_fn,
};
pub use queue::{QueueListener, QueueOutcome};

#[cfg(test)]
mod tests;
