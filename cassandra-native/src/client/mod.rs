//! The entry point of the driver: [`Session`](session::Session) and the
//! builder that creates it.

pub mod session;

pub mod session_builder;

pub use cassandra_native_cql::frame::Compression;
