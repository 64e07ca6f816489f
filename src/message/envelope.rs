use serde::Serialize;
use serde::de::DeserializeOwned;

/// Base contract shared by every payload that travels through `courier`.
///
/// The identifier a payload is routed by is *not* a field: it is computed from
/// the type through [`BroadcastMessage::channel`] or [`QueueMessage::topic`],
/// so a serializer only ever sees business data.
///
/// `Default` is required because listeners instantiate the payload once at
/// construction to read its identifier.
pub trait Envelope: Serialize + DeserializeOwned + Default + Send + Sync + 'static {}

impl<T> Envelope for T where T: Serialize + DeserializeOwned + Default + Send + Sync + 'static {}

/// A payload delivered over the ephemeral fan-out primitive.
///
/// ```ignore
/// #[derive(Default, Serialize, Deserialize)]
/// struct CacheEvicted { key: String }
///
/// impl BroadcastMessage for CacheEvicted {}
/// // channel() == "CacheEvicted"
/// ```
pub trait BroadcastMessage: Envelope {
    /// Channel this payload is published on. Defaults to the simple type name.
    fn channel(&self) -> String {
        simple_type_name::<Self>().to_string()
    }
}

/// A payload appended to the persistent, consumer-group-routed log.
pub trait QueueMessage: Envelope {
    /// Topic this payload is appended to. Defaults to the simple type name.
    fn topic(&self) -> String {
        simple_type_name::<Self>().to_string()
    }
}

/// Returns the last path segment of `T`'s type name with generic arguments
/// removed, e.g. `app::events::Wrapper<u8>` becomes `Wrapper`.
pub fn simple_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
