//! A scriptable CQL node for driver tests.
//!
//! [`MockNode`] listens on a loopback port and answers the native protocol
//! v4 handshake like a single-node cluster would. Tests steer it with
//! [`RequestRule`]s: a [`Condition`] on the incoming request and a
//! [`Reaction`] (answer, delay, never answer, close the connection). The
//! node also records every request it received and can push server events
//! to the connections that registered for them.

mod actions;
mod frame;
mod node;

pub use actions::{Condition, Reaction, RequestRule, ResponseFn};
pub use node::{MockConfig, MockNode, ReceivedRequest};
