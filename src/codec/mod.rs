//! Payload ⇄ bytes boundary.
//!
//! Listeners never see a decode error: a [`Codec`] answers `None` for anything
//! it cannot turn into the requested type, which lets both listener kinds apply
//! their poison-message policy uniformly.

mod json;

pub use json::JsonCodec;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::utils::error::CodecError;

pub trait Codec: Send + Sync + 'static {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode `bytes`, returning `None` when they do not hold a `T`.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Option<T>;
}
