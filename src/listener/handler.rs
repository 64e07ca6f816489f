use std::backtrace::{Backtrace, BacktraceStatus};
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe, catch_unwind};
use std::sync::Once;

use crate::message::payload_type::panic_message;
use crate::message::{BroadcastMessage, QueueMessage};
use crate::persistence::EntryId;

/// Business logic behind a [`BroadcastListener`](super::BroadcastListener).
///
/// `Message` is the one payload type the listener handles. Broadcast delivery
/// is best effort: a handler must not assume it sees every publish.
pub trait BroadcastHandler: Send + Sync + 'static {
    type Message: BroadcastMessage;

    fn on_message(&self, channel: &str, message: &Self::Message) -> anyhow::Result<()>;
}

/// Business logic behind a [`QueueListener`](super::QueueListener).
///
/// Delivery is at least once. The same entry can arrive again after a handler
/// error, a crash before acknowledgment, or a lost acknowledgment, so
/// implementations must be idempotent, typically keyed on
/// [`Delivery::dedup_key`].
pub trait QueueHandler: Send + Sync + 'static {
    type Message: QueueMessage;

    fn on_message(&self, delivery: &Delivery<'_>, message: &Self::Message) -> anyhow::Result<()>;
}

/// Where a queue entry came from.
#[derive(Debug, Clone, Copy)]
pub struct Delivery<'a> {
    pub topic: &'a str,
    pub group: &'a str,
    pub consumer: &'a str,
    pub entry_id: EntryId,
    /// 1 on first delivery.
    pub delivery_count: u32,
}

impl Delivery<'_> {
    /// Stable key identifying the logical entry across redeliveries.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.topic, self.entry_id)
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

/// Closure-backed [`BroadcastHandler`]; see [`broadcast_fn`].
pub struct FnBroadcastHandler<M, F> {
    f: F,
    _message: PhantomData<fn() -> M>,
}

impl<M, F> BroadcastHandler for FnBroadcastHandler<M, F>
where
    M: BroadcastMessage,
    F: Fn(&str, &M) -> anyhow::Result<()> + Send + Sync + 'static,
{
    type Message = M;

    fn on_message(&self, channel: &str, message: &M) -> anyhow::Result<()> {
        (self.f)(channel, message)
    }
}

pub fn broadcast_fn<M, F>(f: F) -> FnBroadcastHandler<M, F>
where
    M: BroadcastMessage,
    F: Fn(&str, &M) -> anyhow::Result<()> + Send + Sync + 'static,
{
    FnBroadcastHandler {
        f,
        _message: PhantomData,
    }
}

/// Closure-backed [`QueueHandler`]; see [`queue_fn`].
pub struct FnQueueHandler<M, F> {
    f: F,
    _message: PhantomData<fn() -> M>,
}

impl<M, F> QueueHandler for FnQueueHandler<M, F>
where
    M: QueueMessage,
    F: Fn(&Delivery<'_>, &M) -> anyhow::Result<()> + Send + Sync + 'static,
{
    type Message = M;

    fn on_message(&self, delivery: &Delivery<'_>, message: &M) -> anyhow::Result<()> {
        (self.f)(delivery, message)
    }
}

pub fn queue_fn<M, F>(f: F) -> FnQueueHandler<M, F>
where
    M: QueueMessage,
    F: Fn(&Delivery<'_>, &M) -> anyhow::Result<()> + Send + Sync + 'static,
{
    FnQueueHandler {
        f,
        _message: PhantomData,
    }
}

/// Why a handler call did not complete.
#[derive(Debug)]
pub(crate) enum HandlerFailure {
    Error(anyhow::Error),
    Panic {
        message: String,
        location: Option<String>,
        backtrace: Option<Backtrace>,
    },
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // {:?} on anyhow prints the cause chain and, when captured, the backtrace.
            HandlerFailure::Error(e) => write!(f, "{e:?}"),
            HandlerFailure::Panic {
                message,
                location,
                backtrace,
            } => {
                write!(f, "handler panicked")?;
                if let Some(location) = location {
                    write!(f, " at {location}")?;
                }
                write!(f, ": {message}")?;
                match backtrace {
                    Some(bt) if bt.status() == BacktraceStatus::Captured => {
                        write!(f, "\nstack backtrace:\n{bt}")
                    }
                    _ => Ok(()),
                }
            }
        }
    }
}

struct PanicSite {
    location: Option<String>,
    backtrace: Backtrace,
}

thread_local! {
    static LAST_PANIC: RefCell<Option<PanicSite>> = const { RefCell::new(None) };
}

/// Chain a hook in front of the existing one that remembers where the latest
/// panic on this thread happened. `RUST_BACKTRACE` controls the capture.
fn install_panic_hook() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let site = PanicSite {
                location: info.location().map(ToString::to_string),
                backtrace: Backtrace::capture(),
            };
            LAST_PANIC.with(|slot| *slot.borrow_mut() = Some(site));
            previous(info);
        }));
    });
}

pub(crate) fn call_handler(f: impl FnOnce() -> anyhow::Result<()>) -> Result<(), HandlerFailure> {
    install_panic_hook();
    LAST_PANIC.with(|slot| slot.borrow_mut().take());

    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(HandlerFailure::Error(e)),
        Err(panic) => {
            let site = LAST_PANIC.with(|slot| slot.borrow_mut().take());
            Err(HandlerFailure::Panic {
                message: panic_message(&*panic),
                location: site.as_ref().and_then(|s| s.location.clone()),
                backtrace: site.map(|s| s.backtrace),
            })
        }
    }
}
