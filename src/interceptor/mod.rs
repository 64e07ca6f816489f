//! Cross-cutting hooks shared by broadcast and queue listeners.
//!
//! `before_handle` runs in registration order and `after_handle` in reverse,
//! so the interceptor that wrapped first unwraps last. Each call has its own
//! error boundary.

pub mod chain;
pub mod logging;

pub use chain::{Interceptor, InterceptorChain, MessageContext};
pub use logging::LoggingInterceptor;
