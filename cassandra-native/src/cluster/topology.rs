use crate::errors::InvariantViolation;
use crate::frame::response::event::{Event, StatusChangeEvent, TopologyChangeEvent};
use crate::frame::server_event_type::EventType;

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Mutex as StdMutex, PoisonError};
use tracing::{debug, info};

/// Tracks the configured endpoints and the subset of them currently believed up.
///
/// The configured set is fixed at construction. The live set starts equal
/// to it and changes only through [`TopologyTracker::apply_event`], so it is
/// always a subset of the configured set.
#[derive(Debug)]
pub(crate) struct TopologyTracker {
    configured: Vec<SocketAddr>,
    live: StdMutex<HashSet<SocketAddr>>,
}

impl TopologyTracker {
    pub(crate) fn new(configured: Vec<SocketAddr>) -> Self {
        let mut seen = HashSet::with_capacity(configured.len());
        let configured: Vec<SocketAddr> = configured
            .into_iter()
            .filter(|addr| seen.insert(*addr))
            .collect();
        let live = StdMutex::new(configured.iter().copied().collect());
        Self { configured, live }
    }

    pub(crate) fn configured_endpoints(&self) -> &[SocketAddr] {
        &self.configured
    }

    fn lock_live(&self) -> std::sync::MutexGuard<'_, HashSet<SocketAddr>> {
        self.live.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the endpoints currently believed up.
    pub(crate) fn live_endpoints(&self) -> Vec<SocketAddr> {
        let live = self.lock_live();
        // Configured order keeps the snapshot deterministic.
        self.configured
            .iter()
            .filter(|addr| live.contains(addr))
            .copied()
            .collect()
    }

    pub(crate) fn is_up(&self, endpoint: SocketAddr) -> bool {
        self.lock_live().contains(&endpoint)
    }

    /// Rejects events the live set cannot absorb: MOVED_NODE, since token
    /// ownership is not tracked, and schema changes, which were never
    /// registered for.
    pub(crate) fn check_event(event: &Event) -> Result<(), InvariantViolation> {
        match event {
            Event::StatusChange(_)
            | Event::TopologyChange(TopologyChangeEvent::NewNode(_))
            | Event::TopologyChange(TopologyChangeEvent::RemovedNode(_)) => Ok(()),
            Event::TopologyChange(TopologyChangeEvent::MovedNode(addr)) => {
                Err(InvariantViolation::NodeMoved(*addr))
            }
            Event::SchemaChange(_) => Err(InvariantViolation::UnexpectedEvent(
                EventType::SchemaChange,
            )),
        }
    }

    /// Applies a topology or status event to the live set.
    ///
    /// UP and NEW_NODE add a configured endpoint, DOWN and REMOVED_NODE
    /// remove it. Endpoints outside the configured set are ignored. Events
    /// refused by [`TopologyTracker::check_event`] change nothing.
    pub(crate) fn apply_event(&self, event: &Event) -> Result<(), InvariantViolation> {
        Self::check_event(event)?;
        match event {
            Event::StatusChange(StatusChangeEvent::Up(addr))
            | Event::TopologyChange(TopologyChangeEvent::NewNode(addr)) => self.mark_up(*addr),
            Event::StatusChange(StatusChangeEvent::Down(addr))
            | Event::TopologyChange(TopologyChangeEvent::RemovedNode(addr)) => {
                self.mark_down(*addr)
            }
            _ => {}
        }
        Ok(())
    }

    fn mark_up(&self, endpoint: SocketAddr) {
        if !self.configured.contains(&endpoint) {
            debug!("Ignoring UP for unknown endpoint {}", endpoint);
            return;
        }
        if self.lock_live().insert(endpoint) {
            info!("Node {} is up", endpoint);
        }
    }

    fn mark_down(&self, endpoint: SocketAddr) {
        if self.lock_live().remove(&endpoint) {
            info!("Node {} is down", endpoint);
        }
    }
}
