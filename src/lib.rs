//! # Courier
//!
//! `courier` is the message delivery core of a service: typed listeners that
//! receive payloads from a shared store over two delivery models.
//!
//! - **Broadcast** channels fan every published record out to all current
//!   subscribers. Delivery is best effort; nothing is acknowledged or retried.
//! - **Queue** topics append records to a persistent log. Each consumer group
//!   sees every entry once, split among its members, and an entry stays pending
//!   until the member acknowledges it. Idle pending entries are reclaimed and
//!   redelivered, so handlers must be idempotent.
//!
//! ## Core Modules
//!
//! - `message`: payload contracts and payload type resolution.
//! - `listener`: broadcast and queue listeners wrapping user handlers.
//! - `interceptor`: cross-cutting hooks run around every handler call.
//! - `dispatch`: the access point seam and the in-process `MemoryBroker`.
//! - `persistence`: the `sled`-backed append log behind queue topics.
//! - `codec`: payload (de)serialization.
//! - `config`: layered settings loading.
//! - `utils`: error types and logging setup.

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod interceptor;
pub mod listener;
pub mod message;
pub mod persistence;
pub mod utils;
