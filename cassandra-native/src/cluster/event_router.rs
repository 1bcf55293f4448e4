use crate::errors::{ConnectionError, NewSessionError};
use crate::frame::response::event::Event;
use crate::network::{Connection, ConnectionPool};

use futures::future::RemoteHandle;
use futures::FutureExt;
use rand::seq::SliceRandom;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

const EVENT_CHANNEL_SIZE: usize = 32;

/// Where the session stands with respect to server event delivery.
///
/// `Unsubscribed -> Subscribing -> Subscribed -> (connection broke) ->
/// Unsubscribed -> Subscribing -> ...`
#[derive(Clone)]
pub(crate) enum SubscriptionState {
    Unsubscribed,
    Subscribing,
    Subscribed(Arc<Connection>),
}

impl std::fmt::Debug for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubscriptionState::Unsubscribed => f.write_str("Unsubscribed"),
            SubscriptionState::Subscribing => f.write_str("Subscribing"),
            SubscriptionState::Subscribed(conn) => f
                .debug_tuple("Subscribed")
                .field(&conn.get_connect_address())
                .finish(),
        }
    }
}

/// Keeps exactly one pooled connection registered for topology and status
/// events, and applies the events it receives to the pool's topology.
///
/// A replacement event connection is opened outside the pool and becomes
/// available to requests only once its registration succeeded.
pub(crate) struct EventRouter {
    state: Arc<StdMutex<SubscriptionState>>,
    _worker_handle: RemoteHandle<()>,
}

struct EventWorker {
    pool: Arc<ConnectionPool>,
    state: Arc<StdMutex<SubscriptionState>>,

    // Held by the worker so that `events` never closes; each subscription
    // gets a clone.
    events_sender: mpsc::Sender<Event>,
    events: mpsc::Receiver<Event>,
}

impl EventRouter {
    /// Subscribes a first connection and starts the worker that keeps a
    /// subscription alive. Fails when no configured endpoint accepted both
    /// a connection and the registration.
    pub(crate) async fn start(pool: Arc<ConnectionPool>) -> Result<EventRouter, NewSessionError> {
        let (events_sender, events) = mpsc::channel(EVENT_CHANNEL_SIZE);
        let state = Arc::new(StdMutex::new(SubscriptionState::Unsubscribed));
        let worker = EventWorker {
            pool,
            state: state.clone(),
            events_sender,
            events,
        };

        let conn = worker.subscribe_round().await?;
        // Nothing else holds the pool yet, so it cannot be closed.
        let _ = worker
            .pool
            .insert_event_connection(&conn)
            .await
            .map_err(ConnectionError::from)?;
        worker.set_state(SubscriptionState::Subscribed(conn.clone()));

        let (fut, worker_handle) = worker.work(conn).remote_handle();
        tokio::spawn(fut);

        Ok(EventRouter {
            state,
            _worker_handle: worker_handle,
        })
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn event_connection(&self) -> Option<Arc<Connection>> {
        match self.state() {
            SubscriptionState::Subscribed(conn) => Some(conn),
            _ => None,
        }
    }
}

impl EventWorker {
    fn set_state(&self, new_state: SubscriptionState) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        trace!("Event subscription: {:?} -> {:?}", *state, new_state);
        *state = new_state;
    }

    async fn work(mut self, mut conn: Arc<Connection>) {
        loop {
            tokio::select! {
                // Events already delivered by a connection go first, even
                // if it broke afterwards.
                biased;

                Some(event) = self.events.recv() => {
                    if !self.on_event(event) {
                        // Breaking it leads to the replacement below.
                        conn.start_close();
                    }
                }

                err = conn.wait_until_broken() => {
                    warn!(
                        "Event connection to {} broke: {}",
                        conn.get_connect_address(),
                        err
                    );
                    self.pool.evict(&conn);
                    self.set_state(SubscriptionState::Unsubscribed);
                    conn = match self.resubscribe().await {
                        Some(replacement) => replacement,
                        None => return,
                    };
                }
            }
        }
    }

    // Returns false for an event the subscription must not survive.
    fn on_event(&self, event: Event) -> bool {
        debug!("Received server event: {:?}", event);
        match self.pool.topology().apply_event(&event) {
            Ok(()) => true,
            Err(err) => {
                error!("Unexpected server event {:?}: {}", event, err);
                false
            }
        }
    }

    // Replaces the event connection, retrying without delay until one
    // subscribes. Returns None once the pool is shut down.
    async fn resubscribe(&self) -> Option<Arc<Connection>> {
        loop {
            if self.pool.is_closed() {
                return None;
            }
            match self.subscribe_round().await {
                Ok(conn) => match self.pool.insert_event_connection(&conn).await {
                    Ok(true) => {
                        info!(
                            "Event connection replaced by one to {}",
                            conn.get_connect_address()
                        );
                        self.set_state(SubscriptionState::Subscribed(conn.clone()));
                        return Some(conn);
                    }
                    Ok(false) => {
                        conn.start_close();
                        self.set_state(SubscriptionState::Unsubscribed);
                        return None;
                    }
                    Err(err) => {
                        warn!(
                            "Replacement event connection to {} could not switch keyspace: {}",
                            conn.get_connect_address(),
                            err
                        );
                        conn.start_close();
                        self.set_state(SubscriptionState::Unsubscribed);
                        tokio::task::yield_now().await;
                    }
                },
                Err(err) => {
                    warn!("Failed to replace the event connection: {}", err);
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    // Tries each configured endpoint once, live ones first, each group in
    // random order.
    async fn subscribe_round(&self) -> Result<Arc<Connection>, NewSessionError> {
        self.set_state(SubscriptionState::Subscribing);

        let mut last_error = NewSessionError::EmptyKnownNodesList;
        for endpoint in self.candidates() {
            let conn = match self.pool.open_detached(endpoint).await {
                Ok(conn) => Arc::new(conn),
                Err(err) => {
                    debug!("Event connection to {} failed: {}", endpoint, err);
                    last_error = err.into();
                    continue;
                }
            };
            match conn.subscribe(self.events_sender.clone()).await {
                Ok(()) => return Ok(conn),
                Err(err) => {
                    debug!("Registration on {} failed: {}", endpoint, err);
                    conn.start_close();
                    last_error = err.into();
                }
            }
        }

        self.set_state(SubscriptionState::Unsubscribed);
        Err(last_error)
    }

    fn candidates(&self) -> Vec<SocketAddr> {
        let topology = self.pool.topology();
        let mut rng = rand::rng();

        let mut live = topology.live_endpoints();
        live.shuffle(&mut rng);
        let mut down: Vec<SocketAddr> = topology
            .configured_endpoints()
            .iter()
            .filter(|endpoint| !live.contains(endpoint))
            .copied()
            .collect();
        down.shuffle(&mut rng);

        live.extend(down);
        live
    }
}
