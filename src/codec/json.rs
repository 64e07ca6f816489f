use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::Codec;
use crate::utils::error::CodecError;

/// JSON codec backed by `serde_json`.
///
/// Empty input decodes to `None`, as does anything that does not match the
/// target type. A bare `null` is left to `serde_json`: it fails for structs and
/// decodes unit structs.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(|e| CodecError(Box::new(e)))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Option<T> {
        let trimmed = bytes.trim_ascii();
        if trimmed.is_empty() {
            return None;
        }
        match serde_json::from_slice(trimmed) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(
                    error = %e,
                    target_type = std::any::type_name::<T>(),
                    "payload did not decode"
                );
                None
            }
        }
    }
}
