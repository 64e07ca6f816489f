use tracing::debug;

use super::chain::{Interceptor, MessageContext};

/// Traces every message entering and leaving a listener at `debug` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingInterceptor;

impl Interceptor for LoggingInterceptor {
    fn name(&self) -> &str {
        "logging"
    }

    fn before_handle(&self, ctx: &MessageContext<'_>) -> anyhow::Result<()> {
        debug!(
            kind = %ctx.kind,
            identifier = ctx.identifier,
            payload_type = ctx.payload_type,
            entry_id = ctx.entry_id.map(tracing::field::display),
            group = ctx.group,
            "handling message"
        );
        Ok(())
    }

    fn after_handle(&self, ctx: &MessageContext<'_>) -> anyhow::Result<()> {
        debug!(
            kind = %ctx.kind,
            identifier = ctx.identifier,
            entry_id = ctx.entry_id.map(tracing::field::display),
            "message handled"
        );
        Ok(())
    }
}
