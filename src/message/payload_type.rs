//! Eager payload-type resolution for listeners.
//!
//! A listener binds to exactly one payload type through its handler's
//! associated `Message` type. [`PayloadType::resolve_broadcast`] and
//! [`PayloadType::resolve_queue`] instantiate that type once, read its
//! identifier and validate it, so a bad declaration fails when the listener is
//! built instead of when the first record arrives.

use std::any::TypeId;
use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, OnceLock, PoisonError};

use tracing::warn;

use crate::message::envelope::{BroadcastMessage, Envelope, QueueMessage};
use crate::utils::error::ListenerError;

/// Which delivery primitive a payload type is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeliveryKind {
    Broadcast,
    Queue,
}

impl std::fmt::Display for DeliveryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryKind::Broadcast => write!(f, "channel"),
            DeliveryKind::Queue => write!(f, "topic"),
        }
    }
}

/// Resolved payload binding of one listener. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadType {
    pub kind: DeliveryKind,
    pub type_id: TypeId,
    pub type_name: &'static str,
    pub identifier: String,
}

impl PayloadType {
    /// Resolve the channel of a broadcast payload type for `listener`.
    pub fn resolve_broadcast<M: BroadcastMessage>(
        listener: &'static str,
    ) -> Result<Self, ListenerError> {
        Self::resolve::<M>(listener, DeliveryKind::Broadcast, "BroadcastMessage", |m| {
            m.channel()
        })
    }

    /// Resolve the topic of a queue payload type for `listener`.
    pub fn resolve_queue<M: QueueMessage>(listener: &'static str) -> Result<Self, ListenerError> {
        Self::resolve::<M>(listener, DeliveryKind::Queue, "QueueMessage", |m| m.topic())
    }

    fn resolve<M: Envelope>(
        listener: &'static str,
        kind: DeliveryKind,
        expected: &'static str,
        read: impl Fn(&M) -> String,
    ) -> Result<Self, ListenerError> {
        let type_name = std::any::type_name::<M>();
        let failure = |reason: String| ListenerError::TypeResolution {
            listener,
            payload_type: type_name,
            expected,
            reason,
        };

        // Default impls and identifier overrides are user code.
        let identifier = catch_unwind(AssertUnwindSafe(|| read(&M::default())))
            .map_err(|panic| failure(format!("panicked: {}", panic_message(&*panic))))?;

        validate_identifier(&identifier).map_err(|reason| failure(reason.to_string()))?;

        let resolved = Self {
            kind,
            type_id: TypeId::of::<M>(),
            type_name,
            identifier,
        };
        resolved.register();
        Ok(resolved)
    }

    /// Record this binding, warning when another type already claimed the same
    /// identifier.
    fn register(&self) {
        let mut bindings = bindings().lock().unwrap_or_else(PoisonError::into_inner);

        let key = (self.kind, self.identifier.clone());
        match bindings.get(&key) {
            Some((type_id, first)) if *type_id != self.type_id => {
                warn!(
                    identifier = %self.identifier,
                    first = *first,
                    second = self.type_name,
                    "two payload types resolve to the same {}; messages of both will be routed together",
                    self.kind
                );
            }
            Some(_) => {}
            None => {
                bindings.insert(key, (self.type_id, self.type_name));
            }
        }
    }

    /// Name of the type that first claimed this identifier, if it is a
    /// different type than this one.
    pub fn collides_with(&self) -> Option<&'static str> {
        let bindings = bindings().lock().unwrap_or_else(PoisonError::into_inner);
        bindings
            .get(&(self.kind, self.identifier.clone()))
            .filter(|(type_id, _)| *type_id != self.type_id)
            .map(|(_, name)| *name)
    }
}

type Bindings = HashMap<(DeliveryKind, String), (TypeId, &'static str)>;

fn bindings() -> &'static Mutex<Bindings> {
    static BINDINGS: OnceLock<Mutex<Bindings>> = OnceLock::new();
    BINDINGS.get_or_init(Default::default)
}

fn validate_identifier(identifier: &str) -> Result<(), &'static str> {
    if identifier.trim().is_empty() {
        return Err("identifier is blank");
    }
    if identifier.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err("identifier contains whitespace or control characters");
    }
    Ok(())
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
