//! The `error` module defines the error types used within `courier`.
//!
//! Only construction and access-point failures surface as `Err` values. Failures
//! that happen while a record is being dispatched (decode, handler, interceptor,
//! acknowledgment) end in a log statement inside the listener and never reach the
//! caller.

use thiserror::Error;

/// Raised while building a listener. A listener that fails here never starts.
#[derive(Error, Debug)]
pub enum ListenerError {
    /// The declared payload type could not be turned into a channel/topic.
    #[error(
        "listener `{listener}` could not resolve its payload type `{payload_type}`: {reason}; \
         expected `type Message = T` where T implements {expected} with a non-blank identifier"
    )]
    TypeResolution {
        listener: &'static str,
        payload_type: &'static str,
        expected: &'static str,
        reason: String,
    },

    /// Queue listeners need a consumer group from configuration.
    #[error("listener `{listener}` has no consumer group configured")]
    MissingGroup { listener: &'static str },
}

/// Errors surfaced by a dispatch access point.
#[derive(Error, Debug)]
pub enum AccessError {
    #[error("consumer group `{group}` does not exist on topic `{topic}`")]
    UnknownGroup { topic: String, group: String },

    #[error("no subscription registered with id {0}")]
    UnknownSubscription(u64),

    #[error("dispatch requires a running tokio runtime")]
    NoRuntime,

    #[error("failed to encode message for `{identifier}`: {source}")]
    Encode {
        identifier: String,
        #[source]
        source: CodecError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the persistent append log.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("corrupt log record in topic `{topic}`")]
    Corrupt { topic: String },
}

/// Raised by a [`Codec`](crate::codec::Codec) when a payload cannot be encoded.
#[derive(Error, Debug)]
#[error("codec error: {0}")]
pub struct CodecError(#[from] pub Box<dyn std::error::Error + Send + Sync>);
