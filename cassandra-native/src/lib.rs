//! Async driver for Apache Cassandra™ and compatible databases, speaking
//! version 4 of the CQL native protocol.
//!
//! Requests are multiplexed over a small pool of connections: each
//! connection carries up to a bounded number of concurrent requests, told
//! apart by their stream ids. One pooled connection is also registered for
//! topology and status events, which keep track of the nodes believed up.
//! Failed attempts are retried according to a [`RetryPolicy`](policies::retry::RetryPolicy),
//! and slow idempotent requests can be duplicated on another connection by a
//! [`SpeculativeExecutionPolicy`](policies::speculative_execution::SpeculativeExecutionPolicy).
//!
//! # Connecting
//! ```no_run
//! # use cassandra_native::SessionBuilder;
//! # use cassandra_native::statement::Consistency;
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let session = SessionBuilder::new()
//!     .known_node("127.0.0.1:9042")
//!     .use_keyspace("examples_ks", false)
//!     .build()
//!     .await?;
//!
//! let rows = session
//!     .query("SELECT a, b FROM tab", Consistency::One)
//!     .await?;
//! for row in &rows.rows {
//!     let a: i32 = row.get(0)?;
//!     let b: Option<String> = row.get(1)?;
//!     println!("{a} {b:?}");
//! }
//! # Ok(())
//! # }
//! ```

pub use cassandra_native_cql::{deserialize, frame, serialize};

pub mod authentication;
pub mod client;
pub(crate) mod cluster;
pub mod errors;
pub(crate) mod network;
pub mod policies;
pub mod response;
pub mod statement;
pub(crate) mod utils;

pub use client::session::{Session, SessionConfig};
pub use client::session_builder::SessionBuilder;
