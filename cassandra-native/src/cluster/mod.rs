//! Cluster membership: which configured nodes are believed up, and the one
//! connection that receives the server's topology and status events.

mod event_router;
mod topology;

pub(crate) use event_router::{EventRouter, SubscriptionState};
pub(crate) use topology::TopologyTracker;
