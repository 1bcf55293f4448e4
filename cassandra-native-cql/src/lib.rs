//! Defines CQL protocol-level types for talking to Apache Cassandra™ over the
//! native protocol, version 4.
//!
//! Mainly intended to be used by the `cassandra-native` driver: the driver treats
//! frame bodies as opaque and relies on this crate to produce and consume them.

pub mod deserialize;
pub mod errors;
pub mod frame;
pub mod serialize;

pub use crate::frame::types::{Consistency, SerialConsistency};
