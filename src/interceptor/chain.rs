use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tracing::warn;

use crate::message::DeliveryKind;
use crate::message::payload_type::panic_message;
use crate::persistence::EntryId;

/// What an interceptor sees of the message being processed.
pub struct MessageContext<'a> {
    pub kind: DeliveryKind,
    /// Channel or topic.
    pub identifier: &'a str,
    pub payload_type: &'static str,
    /// Set for queue deliveries only.
    pub entry_id: Option<&'a EntryId>,
    /// Set for queue deliveries only.
    pub group: Option<&'a str>,
    pub message: &'a (dyn Any + Send + Sync),
}

impl MessageContext<'_> {
    /// Borrow the decoded message as its concrete type.
    pub fn downcast<T: Any>(&self) -> Option<&T> {
        self.message.downcast_ref::<T>()
    }
}

/// Cross-cutting hook run around every message handled by a listener.
///
/// Errors and panics from either hook are logged and swallowed by the chain.
pub trait Interceptor: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn before_handle(&self, _ctx: &MessageContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }

    fn after_handle(&self, _ctx: &MessageContext<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum Hook {
    Before,
    After,
}

impl Hook {
    fn as_str(self) -> &'static str {
        match self {
            Hook::Before => "before_handle",
            Hook::After => "after_handle",
        }
    }
}

/// Ordered set of interceptors. Built at startup and only read afterwards.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Vec<Arc<dyn Interceptor>>,
}

impl InterceptorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.interceptors.iter().map(|i| i.name().to_string()).collect()
    }

    /// Run every `before_handle` in registration order. Returns how many failed.
    pub fn run_before(&self, ctx: &MessageContext<'_>) -> usize {
        self.interceptors
            .iter()
            .filter(|i| !invoke(i.as_ref(), Hook::Before, ctx))
            .count()
    }

    /// Run every `after_handle` in reverse registration order. Returns how many
    /// failed.
    pub fn run_after(&self, ctx: &MessageContext<'_>) -> usize {
        self.interceptors
            .iter()
            .rev()
            .filter(|i| !invoke(i.as_ref(), Hook::After, ctx))
            .count()
    }
}

impl std::fmt::Debug for InterceptorChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl FromIterator<Arc<dyn Interceptor>> for InterceptorChain {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Interceptor>>>(iter: I) -> Self {
        Self {
            interceptors: iter.into_iter().collect(),
        }
    }
}

// One error boundary per call so a failing interceptor cannot skip the rest.
fn invoke(interceptor: &dyn Interceptor, hook: Hook, ctx: &MessageContext<'_>) -> bool {
    let outcome = catch_unwind(AssertUnwindSafe(|| match hook {
        Hook::Before => interceptor.before_handle(ctx),
        Hook::After => interceptor.after_handle(ctx),
    }));

    match outcome {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(
                interceptor = interceptor.name(),
                hook = hook.as_str(),
                identifier = ctx.identifier,
                error = ?e,
                "interceptor failed; continuing"
            );
            false
        }
        Err(panic) => {
            warn!(
                interceptor = interceptor.name(),
                hook = hook.as_str(),
                identifier = ctx.identifier,
                panic = %panic_message(&*panic),
                "interceptor panicked; continuing"
            );
            false
        }
    }
}
