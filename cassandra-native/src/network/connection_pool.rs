use super::connection::{open_connection, Connection, ConnectionConfig, VerifiedKeyspaceName};

use crate::cluster::TopologyTracker;
use crate::errors::{ConnectionError, ExecutionError, RequestAttemptError, UseKeyspaceError};

use futures::future::join_all;
use itertools::Itertools;
use rand::Rng;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

/// Connections the pool keeps when nothing else is configured.
pub(crate) const DEFAULT_MAX_POOL_SIZE: usize = 8;

// How long `change_keyspace` waits before asking a connection whose
// stream slots were all taken again.
const SLOTS_EXHAUSTED_BACKOFF: Duration = Duration::from_millis(5);

#[derive(Clone)]
pub(crate) struct PoolConfig {
    pub(crate) connection_config: ConnectionConfig,
    pub(crate) max_pool_size: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection_config: ConnectionConfig::default(),
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
        }
    }
}

/// Connections shared by every request of a session, to any of the live
/// endpoints, bounded by `max_pool_size`.
///
/// Entries are owned by the pool; an entry found unhealthy is evicted.
/// The connection subscribed to server events lives in the pool like any
/// other. When it is evicted its place stays reserved until the event
/// router inserts a subscribed replacement.
///
/// A connection joins the pool only while the state lock shows that it is
/// in the pool's current keyspace, so that `change_keyspace` either sees it
/// among the entries or it already uses the new keyspace.
pub(crate) struct ConnectionPool {
    config: PoolConfig,
    topology: Arc<TopologyTracker>,
    state: StdMutex<PoolState>,
    // Signalled whenever an opening finishes or the event connection joins.
    settled: Notify,
}

#[derive(Default)]
struct PoolState {
    entries: Vec<Arc<Connection>>,
    // Connections being opened by `acquire`, counted against the bound.
    opening: usize,
    event_slot_reserved: bool,
    keyspace: Option<Arc<VerifiedKeyspaceName>>,
    closed: bool,
}

impl PoolState {
    fn occupied(&self) -> usize {
        self.entries.len() + self.opening + usize::from(self.event_slot_reserved)
    }
}

enum Selection {
    Ready(Arc<Connection>),
    Open(SocketAddr),
    // Every place is taken by connections still being opened.
    Wait,
    Existing(&'static str),
}

// Releases the capacity taken by a connection being opened, also when the
// acquiring request is cancelled mid-connect.
struct OpeningGuard<'a> {
    pool: &'a ConnectionPool,
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        self.pool.lock_state().opening -= 1;
        self.pool.settled.notify_waiters();
    }
}

impl ConnectionPool {
    pub(crate) fn new(
        config: PoolConfig,
        topology: Arc<TopologyTracker>,
        keyspace: Option<VerifiedKeyspaceName>,
    ) -> Self {
        Self {
            config,
            topology,
            state: StdMutex::new(PoolState {
                keyspace: keyspace.map(Arc::new),
                ..Default::default()
            }),
            settled: Notify::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PoolState> {
        // No I/O happens while the lock is held.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn max_size(&self) -> usize {
        self.config.max_pool_size
    }

    pub(crate) fn topology(&self) -> &TopologyTracker {
        &self.topology
    }

    pub(crate) fn keyspace(&self) -> Option<Arc<VerifiedKeyspaceName>> {
        self.lock_state().keyspace.clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.lock_state().closed
    }

    /// Picks a connection for a request attempt.
    ///
    /// A healthy connection to an endpoint outside `tried` is preferred.
    /// Failing that, while below capacity, a new connection is opened to a
    /// random live endpoint (again preferring one outside `tried`).
    /// Otherwise any healthy connection is returned. When there is none
    /// because every place is held by a connection being opened, the call
    /// waits for one of those openings to finish and selects again.
    /// Unhealthy entries met on the way are evicted.
    pub(crate) async fn acquire(
        &self,
        tried: &[SocketAddr],
    ) -> Result<Arc<Connection>, ExecutionError> {
        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);

            let selection = {
                let mut state = self.lock_state();
                if state.closed {
                    return Err(ExecutionError::Disposed);
                }
                Self::evict_unhealthy(&mut state);
                self.select(&mut state, tried, settled.as_mut())
            };

            let reason = match selection {
                Selection::Ready(conn) => return Ok(conn),
                Selection::Wait => {
                    trace!("All pool places are being opened, waiting");
                    settled.await;
                    continue;
                }
                Selection::Open(endpoint) => match self.open_pooled(endpoint).await {
                    Ok(conn) => return Ok(conn),
                    Err(ExecutionError::Disposed) => return Err(ExecutionError::Disposed),
                    Err(err) => err.to_string(),
                },
                Selection::Existing(reason) => reason.to_owned(),
            };

            let state = self.lock_state();
            return Self::choose_random_connection_from_slice(&state.entries)
                .ok_or(ExecutionError::NoHostAvailable { reason });
        }
    }

    fn select(
        &self,
        state: &mut PoolState,
        tried: &[SocketAddr],
        settled: Pin<&mut Notified<'_>>,
    ) -> Selection {
        let untried: Vec<Arc<Connection>> = state
            .entries
            .iter()
            .filter(|conn| !tried.contains(&conn.get_connect_address()))
            .cloned()
            .collect();
        if let Some(conn) = Self::choose_random_connection_from_slice(&untried) {
            return Selection::Ready(conn);
        }

        if state.occupied() < self.config.max_pool_size {
            return match self.choose_endpoint(tried) {
                Some(endpoint) => {
                    state.opening += 1;
                    Selection::Open(endpoint)
                }
                None => Selection::Existing("no live endpoint to connect to"),
            };
        }

        if state.entries.is_empty() && state.opening > 0 {
            // Registered under the lock, so the wakeup of an opening that
            // finishes right after cannot be missed.
            settled.enable();
            return Selection::Wait;
        }
        Selection::Existing("the only free place is reserved for the event connection")
    }

    async fn open_pooled(&self, endpoint: SocketAddr) -> Result<Arc<Connection>, ExecutionError> {
        let _opening = OpeningGuard { pool: self };

        let keyspace = self.keyspace();
        let conn = match open_connection(
            endpoint,
            &self.config.connection_config,
            keyspace.as_deref(),
        )
        .await
        {
            Ok(conn) => Arc::new(conn),
            Err(err) => {
                warn!("Failed to open connection to {}: {}", endpoint, err);
                return Err(ExecutionError::NoHostAvailable {
                    reason: err.to_string(),
                });
            }
        };

        if !self.admit(&conn, false).await? {
            conn.start_close();
            return Err(ExecutionError::Disposed);
        }
        debug!("Opened pooled connection to {}", endpoint);
        Ok(conn)
    }

    // Pushes `conn` once it is in the current keyspace, switching it first
    // if the keyspace changed since it was opened. Returns false once the
    // pool is shut down.
    async fn admit(
        &self,
        conn: &Arc<Connection>,
        as_event_connection: bool,
    ) -> Result<bool, UseKeyspaceError> {
        loop {
            let wanted = {
                let mut state = self.lock_state();
                if state.closed {
                    return Ok(false);
                }
                match state.keyspace.clone() {
                    Some(wanted) if conn.get_keyspace().as_ref() != Some(&wanted) => wanted,
                    _ => {
                        if as_event_connection {
                            state.event_slot_reserved = false;
                        }
                        state.entries.push(conn.clone());
                        return Ok(true);
                    }
                }
            };
            trace!(
                "Keyspace changed while opening connection to {}, switching to {}",
                conn.get_connect_address(),
                wanted.as_str()
            );
            Self::use_keyspace_on(conn, &wanted).await?;
        }
    }

    fn choose_endpoint(&self, tried: &[SocketAddr]) -> Option<SocketAddr> {
        let live = self.topology.live_endpoints();
        let untried: Vec<SocketAddr> = live
            .iter()
            .filter(|endpoint| !tried.contains(endpoint))
            .copied()
            .collect();
        let candidates = if untried.is_empty() { live } else { untried };
        if candidates.is_empty() {
            return None;
        }
        let idx = rand::rng().random_range(0..candidates.len());
        Some(candidates[idx])
    }

    fn choose_random_connection_from_slice(v: &[Arc<Connection>]) -> Option<Arc<Connection>> {
        trace!(
            connections = tracing::field::display(
                v.iter().map(|conn| conn.get_connect_address()).join(", ")
            ),
            "Available"
        );
        if v.is_empty() {
            None
        } else if v.len() == 1 {
            Some(v[0].clone())
        } else {
            let idx = rand::rng().random_range(0..v.len());
            Some(v[idx].clone())
        }
    }

    fn evict_unhealthy(state: &mut PoolState) {
        let mut lost_event_connection = false;
        state.entries.retain(|conn| {
            if conn.is_healthy() {
                return true;
            }
            debug!(
                "Evicting broken connection to {}",
                conn.get_connect_address()
            );
            lost_event_connection |= conn.is_subscribed();
            false
        });
        if lost_event_connection {
            state.event_slot_reserved = true;
        }
    }

    /// Removes `conn` from the pool, if it is still there. Evicting the
    /// event connection reserves its place for the replacement.
    pub(crate) fn evict(&self, conn: &Arc<Connection>) {
        let mut state = self.lock_state();
        let before = state.entries.len();
        state.entries.retain(|entry| !Arc::ptr_eq(entry, conn));
        if state.entries.len() != before && conn.is_subscribed() {
            state.event_slot_reserved = true;
        }
    }

    /// Opens a connection that is not part of the pool yet, to `endpoint`.
    pub(crate) async fn open_detached(
        &self,
        endpoint: SocketAddr,
    ) -> Result<Connection, ConnectionError> {
        let keyspace = self.keyspace();
        open_connection(
            endpoint,
            &self.config.connection_config,
            keyspace.as_deref(),
        )
        .await
    }

    /// Makes a subscribed connection available for queries, taking the
    /// place reserved for it. The connection is first switched to the
    /// pool's keyspace if that changed since it was opened. Returns false
    /// once the pool is shut down.
    pub(crate) async fn insert_event_connection(
        &self,
        conn: &Arc<Connection>,
    ) -> Result<bool, UseKeyspaceError> {
        let inserted = self.admit(conn, true).await?;
        self.settled.notify_waiters();
        Ok(inserted)
    }

    /// Switches every healthy pooled connection, and every connection opened
    /// later, to `keyspace`.
    pub(crate) async fn change_keyspace(
        &self,
        keyspace: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        let connections: Vec<Arc<Connection>> = {
            let mut state = self.lock_state();
            state.keyspace = Some(Arc::new(keyspace.clone()));
            state
                .entries
                .iter()
                .filter(|conn| conn.is_healthy())
                .cloned()
                .collect()
        };

        let results = join_all(
            connections
                .iter()
                .map(|conn| Self::use_keyspace_on(conn, &keyspace)),
        )
        .await;

        for result in results {
            match result {
                Ok(()) => {}
                // A connection that broke meanwhile will be evicted;
                // its replacement opens in the new keyspace.
                Err(UseKeyspaceError::RequestError(
                    RequestAttemptError::BrokenConnectionError(_),
                )) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn use_keyspace_on(
        conn: &Connection,
        keyspace: &VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        loop {
            match conn.use_keyspace(keyspace).await {
                Err(UseKeyspaceError::RequestError(RequestAttemptError::UnableToAllocStreamId)) => {
                    trace!(
                        "Stream slots of connection to {} exhausted, retrying USE",
                        conn.get_connect_address()
                    );
                    tokio::time::sleep(SLOTS_EXHAUSTED_BACKOFF).await;
                }
                result => return result,
            }
        }
    }

    pub(crate) fn connections(&self) -> Vec<Arc<Connection>> {
        self.lock_state().entries.clone()
    }

    /// Closes every pooled connection and refuses further acquisitions.
    pub(crate) async fn shutdown(&self) {
        let entries = self.take_entries();
        join_all(entries.iter().map(|conn| conn.close())).await;
    }

    /// Like [`ConnectionPool::shutdown`], but does not wait for the
    /// connections to go down.
    pub(crate) fn shutdown_nowait(&self) {
        for conn in self.take_entries() {
            conn.start_close();
        }
    }

    fn take_entries(&self) -> Vec<Arc<Connection>> {
        let mut state = self.lock_state();
        state.closed = true;
        std::mem::take(&mut state.entries)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionPool, PoolConfig};
    use crate::cluster::TopologyTracker;
    use crate::errors::ExecutionError;
    use crate::frame::request::RequestOpcode;
    use crate::network::{ConnectionConfig, VerifiedKeyspaceName};
    use crate::statement::unprepared::Statement;
    use crate::statement::Consistency;
    use crate::utils::test_utils::setup_tracing;
    use assert_matches::assert_matches;
    use cassandra_native_mock::{Condition, MockNode, Reaction, RequestRule};
    use futures::future::join_all;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;

    fn pool_for(addrs: Vec<SocketAddr>, max_pool_size: usize) -> ConnectionPool {
        ConnectionPool::new(
            PoolConfig {
                connection_config: ConnectionConfig::default(),
                max_pool_size,
            },
            Arc::new(TopologyTracker::new(addrs)),
            None,
        )
    }

    async fn closed_port() -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn opens_lazily_and_prefers_untried_endpoints() {
        setup_tracing();
        let node = MockNode::start().await.unwrap();
        let pool = pool_for(vec![node.address()], 2);
        assert!(pool.connections().is_empty());

        let first = pool.acquire(&[]).await.unwrap();
        let again = pool.acquire(&[]).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(node.accepted_connections(), 1);

        // Having tried the only endpoint, a second connection is opened.
        let second = pool.acquire(&[node.address()]).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(pool.connections().len(), 2);

        // At capacity, an existing connection is handed out.
        let third = pool.acquire(&[node.address()]).await.unwrap();
        assert!(Arc::ptr_eq(&third, &first) || Arc::ptr_eq(&third, &second));
        assert_eq!(node.accepted_connections(), 2);
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn concurrent_acquires_respect_capacity() {
        setup_tracing();
        let node = MockNode::start().await.unwrap();
        let pool = pool_for(vec![node.address()], 3);

        let tried = [node.address()];
        let acquired = join_all((0..16).map(|_| pool.acquire(&tried))).await;
        assert!(acquired.iter().all(|res| res.is_ok()));
        assert!(pool.connections().len() <= 3);
        assert!(node.accepted_connections() <= 3);
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn acquires_wait_for_connections_being_opened() {
        setup_tracing();
        let node = MockNode::start().await.unwrap();
        // Slow handshakes keep both places in the opening state while the
        // other acquires arrive.
        node.set_rules(vec![RequestRule(
            Condition::RequestOpcode(RequestOpcode::Startup),
            Reaction::Default.delayed(Duration::from_millis(100)),
        )]);
        let pool = pool_for(vec![node.address()], 2);

        let acquired = join_all((0..4).map(|_| pool.acquire(&[]))).await;
        for res in &acquired {
            assert_matches!(res, Ok(_));
        }
        assert_eq!(pool.connections().len(), 2);
        assert_eq!(node.accepted_connections(), 2);
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn waiting_acquire_opens_when_an_opening_fails() {
        setup_tracing();
        let node = MockNode::start().await.unwrap();
        node.set_rules(vec![RequestRule(
            Condition::RequestOpcode(RequestOpcode::Startup)
                .and(Condition::ConnectionSeqNo(0)),
            Reaction::CloseConnection.delayed(Duration::from_millis(100)),
        )]);
        let pool = pool_for(vec![node.address()], 1);

        // The second acquire waits for the first opening, which fails, and
        // then takes the freed place.
        let (first, second) = tokio::join!(pool.acquire(&[]), pool.acquire(&[]));
        assert_matches!(first, Err(ExecutionError::NoHostAvailable { .. }));
        second.unwrap();
        assert_eq!(node.accepted_connections(), 2);
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn broken_connections_are_evicted() {
        setup_tracing();
        let node = MockNode::start().await.unwrap();
        let pool = pool_for(vec![node.address()], 1);

        let first = pool.acquire(&[]).await.unwrap();
        first.close().await;

        let replacement = pool.acquire(&[]).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &replacement));
        assert!(replacement.is_healthy());
        assert_eq!(pool.connections().len(), 1);
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn evicting_event_connection_reserves_its_place() {
        setup_tracing();
        let node = MockNode::start().await.unwrap();
        let pool = pool_for(vec![node.address()], 1);

        let event_conn = Arc::new(pool.open_detached(node.address()).await.unwrap());
        let (sink, _events) = tokio::sync::mpsc::channel(8);
        event_conn.subscribe(sink).await.unwrap();
        assert!(pool.insert_event_connection(&event_conn).await.unwrap());

        event_conn.close().await;

        // The only place is reserved for the replacement event connection.
        assert_matches!(
            pool.acquire(&[]).await,
            Err(ExecutionError::NoHostAvailable { reason }) if reason.contains("event connection")
        );
        let replacement = Arc::new(pool.open_detached(node.address()).await.unwrap());
        assert!(pool.insert_event_connection(&replacement).await.unwrap());
        let acquired = pool.acquire(&[]).await.unwrap();
        assert!(Arc::ptr_eq(&acquired, &replacement));
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn unreachable_endpoint_gives_no_host_available() {
        setup_tracing();
        let pool = pool_for(vec![closed_port().await], 2);
        assert_matches!(
            pool.acquire(&[]).await,
            Err(ExecutionError::NoHostAvailable { .. })
        );
        assert!(pool.connections().is_empty());
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn shutdown_closes_connections_and_refuses_acquire() {
        setup_tracing();
        let node = MockNode::start().await.unwrap();
        let pool = pool_for(vec![node.address()], 2);
        let conn = pool.acquire(&[]).await.unwrap();

        pool.shutdown().await;
        assert!(!conn.is_healthy());
        assert_matches!(pool.acquire(&[]).await, Err(ExecutionError::Disposed));
    }

    #[tokio::test]
    #[ntest::timeout(20000)]
    async fn change_keyspace_waits_for_exhausted_slots() {
        setup_tracing();
        let node = MockNode::start().await.unwrap();
        node.set_rules(vec![RequestRule(
            Condition::body_contains("slow"),
            Reaction::Default.delayed(Duration::from_millis(200)),
        )]);
        let pool = ConnectionPool::new(
            PoolConfig {
                connection_config: ConnectionConfig {
                    stream_slots: 2,
                    ..Default::default()
                },
                max_pool_size: 2,
            },
            Arc::new(TopologyTracker::new(vec![node.address()])),
            None,
        );

        let busy = pool.acquire(&[]).await.unwrap();
        let idle = pool.acquire(&[node.address()]).await.unwrap();
        assert!(!Arc::ptr_eq(&busy, &idle));

        let slow_queries: Vec<_> = (0..2)
            .map(|_| {
                let busy = busy.clone();
                tokio::spawn(async move {
                    busy.query(&Statement::new("slow"), Consistency::One).await
                })
            })
            .collect();
        node.wait_for_requests(2, |r| r.query_text() == Some("slow"))
            .await;

        let ks2 = VerifiedKeyspaceName::new("ks2".to_owned(), false).unwrap();
        pool.change_keyspace(ks2.clone()).await.unwrap();

        for conn in pool.connections() {
            assert_eq!(conn.get_keyspace().as_deref(), Some(&ks2));
        }
        for query in slow_queries {
            assert!(query.await.unwrap().is_ok());
        }
    }
}
