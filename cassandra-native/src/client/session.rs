//! `Session` is the main object used in the driver.\
//! It manages all connections to the cluster and allows to execute CQL requests.

use crate::authentication::AuthenticatorProvider;
use crate::cluster::{EventRouter, TopologyTracker};
use crate::errors::{BadQuery, ExecutionError, NewSessionError, RequestAttemptError};
use crate::frame::response::result::{Rows, SchemaChange};
use crate::frame::types::Consistency;
use crate::frame::Compression;
use crate::network::{
    Connection, ConnectionConfig, ConnectionPool, PoolConfig, VerifiedKeyspaceName,
    DEFAULT_MAX_POOL_SIZE, DEFAULT_STREAM_SLOTS,
};
use crate::policies::retry::{DefaultRetryPolicy, RequestInfo, RetryDecision, RetryPolicy};
use crate::policies::speculative_execution::{self, SpeculativeExecutionPolicy};
use crate::response::{Output, OutputShape, QueryResponse};
use crate::serialize::SerializedValues;
use crate::statement::prepared::PreparedStatement;
use crate::statement::unprepared::Statement;
use crate::statement::StatementConfig;
use crate::utils::RecordError;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use tracing::{debug, trace, trace_span, Instrument};

pub(crate) const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);

const DEFAULT_PORT: u16 = 9042;

/// `Session` manages connections to the cluster and allows to execute CQL requests.
///
/// Requests are multiplexed over a bounded pool of connections shared by all
/// callers. One pooled connection also receives topology and status events,
/// which keep [`Session::live_nodes`] up to date.
pub struct Session {
    pool: Arc<ConnectionPool>,
    event_router: StdMutex<Option<EventRouter>>,
    retry_policy: Arc<dyn RetryPolicy>,
    speculative_execution_policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,
    default_consistency: Consistency,
    request_timeout: Option<Duration>,
    disposed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("live_nodes", &self.live_nodes())
            .field("keyspace", &self.get_keyspace())
            .field("retry_policy", &self.retry_policy)
            .field(
                "speculative_execution_policy",
                &self.speculative_execution_policy,
            )
            .field("default_consistency", &self.default_consistency)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

/// Configuration options for [`Session`].
/// Can be created manually, but usually it's easier to use
/// [SessionBuilder](super::session_builder::SessionBuilder)
#[derive(Clone)]
#[non_exhaustive]
pub struct SessionConfig {
    /// List of database servers known on Session startup, as hostnames or
    /// `ip:port` strings. If the port is not given, 9042 is used.
    pub known_nodes: Vec<String>,

    /// Known database servers given by address.
    pub known_node_addrs: Vec<SocketAddr>,

    /// Preferred compression algorithm to use on connections.
    /// If it's not supported by database server Session will fall back to no compression.
    pub compression: Option<Compression>,

    /// Whether to set the nodelay TCP flag.
    pub tcp_nodelay: bool,

    /// TCP keepalive interval, which means how often keepalive messages
    /// are sent **on TCP layer** when a connection is idle.
    /// If `None`, no TCP keepalive messages are sent.
    pub tcp_keepalive_interval: Option<Duration>,

    /// Keyspace to be used on all connections.
    /// Each connection will send `"USE <keyspace_name>"` before sending any requests.
    /// This can be later changed with [`Session::change_keyspace`].
    pub used_keyspace: Option<String>,

    /// Whether the keyspace name is case-sensitive.
    pub keyspace_case_sensitive: bool,

    /// Provider of authenticators, used when a node demands authentication.
    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,

    /// Timeout for establishing a TCP connection to a node.
    pub connect_timeout: Duration,

    /// A request waiting longer than this for its response breaks the
    /// connection it was sent on. `None` disables the check.
    pub abort_timeout: Option<Duration>,

    /// The maximal number of connections the session keeps, to all nodes together.
    pub max_pool_size: usize,

    /// The number of requests that can be in flight on one connection.
    pub stream_slots: usize,

    /// Consistency used by statements which do not set their own.
    pub default_consistency: Consistency,

    /// Decides whether a failed attempt is retried.
    pub retry_policy: Arc<dyn RetryPolicy>,

    /// When set, idempotent requests are duplicated on another connection
    /// if they take too long.
    pub speculative_execution_policy: Option<Arc<dyn SpeculativeExecutionPolicy>>,

    /// Time after which a request fails with [`ExecutionError::RequestTimeout`],
    /// unless the statement sets its own. `None` means no timeout.
    pub request_timeout: Option<Duration>,

    /// How often an idle connection is checked with an OPTIONS request.
    /// `None` disables the keepalive.
    pub keepalive_interval: Option<Duration>,

    /// How long a keepalive request may wait for its response before the
    /// connection is considered broken.
    pub keepalive_timeout: Option<Duration>,
}

impl SessionConfig {
    /// Creates a [`SessionConfig`] with default configuration
    /// # Default configuration
    /// * Compression: None
    /// * Connection timeout: 5 seconds
    /// * Max pool size: 8 connections
    /// * Stream slots: 128 per connection
    /// * Default consistency: LocalQuorum
    /// * Retry policy: [`DefaultRetryPolicy`]
    /// * No speculative execution, no request timeout
    /// * Keepalive: every 30 seconds, 30 seconds to answer
    pub fn new() -> Self {
        SessionConfig {
            known_nodes: Vec::new(),
            known_node_addrs: Vec::new(),
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            used_keyspace: None,
            keyspace_case_sensitive: false,
            authenticator: None,
            connect_timeout: DEFAULT_CONNECTION_TIMEOUT,
            abort_timeout: None,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            stream_slots: DEFAULT_STREAM_SLOTS,
            default_consistency: Consistency::LocalQuorum,
            retry_policy: Arc::new(DefaultRetryPolicy::new()),
            speculative_execution_policy: None,
            request_timeout: None,
            keepalive_interval: Some(DEFAULT_KEEPALIVE_INTERVAL),
            keepalive_timeout: Some(DEFAULT_KEEPALIVE_TIMEOUT),
        }
    }

    /// Adds a known database server with a hostname.
    /// If the port is not explicitly specified, 9042 is used as default
    pub fn add_known_node(&mut self, hostname: impl AsRef<str>) {
        self.known_nodes.push(hostname.as_ref().to_string());
    }

    /// Adds a known database server with an IP address
    pub fn add_known_node_addr(&mut self, node_addr: SocketAddr) {
        self.known_node_addrs.push(node_addr);
    }

    /// Adds a list of known database servers with IP addresses
    pub fn add_known_nodes_addr(&mut self, node_addrs: impl IntoIterator<Item = SocketAddr>) {
        self.known_node_addrs.extend(node_addrs);
    }

    fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            compression: self.compression,
            tcp_nodelay: self.tcp_nodelay,
            tcp_keepalive_interval: self.tcp_keepalive_interval,
            connect_timeout: self.connect_timeout,
            abort_timeout: self.abort_timeout,
            stream_slots: self.stream_slots,
            authenticator: self.authenticator.clone(),
            keepalive_interval: self.keepalive_interval,
            keepalive_timeout: self.keepalive_timeout,
        }
    }
}

/// Creates default [`SessionConfig`], same as [`SessionConfig::new`]
impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

async fn resolve_hostname(hostname: &str) -> Vec<SocketAddr> {
    let resolved = match tokio::net::lookup_host(hostname).await {
        Ok(addrs) => Ok(addrs.collect::<Vec<_>>()),
        // The hostname may lack a port.
        Err(_) => tokio::net::lookup_host((hostname, DEFAULT_PORT))
            .await
            .map(|addrs| addrs.collect()),
    };
    match resolved {
        Ok(addrs) => addrs,
        Err(err) => {
            debug!("Failed to resolve {}: {}", hostname, err);
            Vec::new()
        }
    }
}

// A snapshot of the endpoints already used by the attempts of one request,
// shared by its speculative fibers.
struct TriedEndpoints(StdMutex<Vec<SocketAddr>>);

impl TriedEndpoints {
    fn snapshot(&self) -> Vec<SocketAddr> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record(&self, endpoint: SocketAddr) {
        let mut tried = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if !tried.contains(&endpoint) {
            tried.push(endpoint);
        }
    }
}

fn slots_exhausted() -> ExecutionError {
    ExecutionError::NoHostAvailable {
        reason: "stream slots exhausted".to_owned(),
    }
}

impl Session {
    /// Estabilishes a CQL session with the database
    ///
    /// Usually it's easier to use [SessionBuilder](super::session_builder::SessionBuilder)
    /// instead of calling `Session::connect` directly.
    pub async fn connect(config: SessionConfig) -> Result<Session, NewSessionError> {
        if config.known_nodes.is_empty() && config.known_node_addrs.is_empty() {
            return Err(NewSessionError::EmptyKnownNodesList);
        }

        let mut endpoints = config.known_node_addrs.clone();
        let mut unresolved = Vec::new();
        for hostname in &config.known_nodes {
            let resolved = resolve_hostname(hostname).await;
            if resolved.is_empty() {
                unresolved.push(hostname.clone());
            }
            endpoints.extend(resolved);
        }
        if endpoints.is_empty() {
            return Err(NewSessionError::FailedToResolveAnyHostname(unresolved));
        }

        let keyspace = config
            .used_keyspace
            .clone()
            .map(|name| VerifiedKeyspaceName::new(name, config.keyspace_case_sensitive))
            .transpose()?;

        let topology = Arc::new(TopologyTracker::new(endpoints));
        let pool = Arc::new(ConnectionPool::new(
            PoolConfig {
                connection_config: config.connection_config(),
                max_pool_size: config.max_pool_size,
            },
            topology,
            keyspace,
        ));
        let event_router = EventRouter::start(pool.clone()).await?;

        Ok(Session {
            pool,
            event_router: StdMutex::new(Some(event_router)),
            retry_policy: config.retry_policy,
            speculative_execution_policy: config.speculative_execution_policy,
            default_consistency: config.default_consistency,
            request_timeout: config.request_timeout,
            disposed: AtomicBool::new(false),
        })
    }

    /// Runs a statement which returns no rows, e.g. an `INSERT` or a `CREATE TABLE`.
    /// Returns the schema change, if the statement made one.
    pub async fn non_query(
        &self,
        query: impl Into<Statement>,
        consistency: Consistency,
    ) -> Result<Option<SchemaChange>, ExecutionError> {
        let statement = query.into().with_consistency(consistency);
        self.non_query_statement(&statement).await
    }

    /// Like [`Session::non_query`], with the settings of `statement`.
    pub async fn non_query_statement(
        &self,
        statement: &Statement,
    ) -> Result<Option<SchemaChange>, ExecutionError> {
        self.query_output("non_query", OutputShape::NonQuery, statement)
            .await?
            .into_non_query()
    }

    /// Runs a statement with a scalar outcome. `USE <keyspace>` is the one
    /// there is, and its outcome is the keyspace name.
    ///
    /// The whole session then uses the keyspace the server reported, as
    /// after [`Session::change_keyspace`].
    pub async fn scalar(
        &self,
        query: impl Into<Statement>,
        consistency: Consistency,
    ) -> Result<String, ExecutionError> {
        let statement = query.into().with_consistency(consistency);
        self.scalar_statement(&statement).await
    }

    /// Like [`Session::scalar`], with the settings of `statement`.
    pub async fn scalar_statement(&self, statement: &Statement) -> Result<String, ExecutionError> {
        let keyspace_name = self
            .query_output("scalar", OutputShape::Scalar, statement)
            .await?
            .into_scalar()?;

        // Only the connection that ran it has switched so far.
        let keyspace =
            VerifiedKeyspaceName::new(keyspace_name.clone(), true).map_err(BadQuery::from)?;
        self.pool.change_keyspace(keyspace).await?;
        Ok(keyspace_name)
    }

    /// Runs a statement which returns rows.
    pub async fn query(
        &self,
        query: impl Into<Statement>,
        consistency: Consistency,
    ) -> Result<Rows, ExecutionError> {
        let statement = query.into().with_consistency(consistency);
        self.query_statement(&statement).await
    }

    /// Like [`Session::query`], with the settings of `statement`.
    pub async fn query_statement(&self, statement: &Statement) -> Result<Rows, ExecutionError> {
        self.query_output("query", OutputShape::Rows, statement)
            .await?
            .into_rows()
    }

    async fn query_output(
        &self,
        kind: &'static str,
        shape: OutputShape,
        statement: &Statement,
    ) -> Result<Output, ExecutionError> {
        self.run_request(
            kind,
            shape,
            &statement.config,
            |connection: Arc<Connection>, consistency: Consistency| async move {
                connection.query(statement, consistency).await
            },
        )
        .await
    }

    /// Prepares a statement on one of the nodes. Executions on other
    /// connections prepare it there when the node does not know it yet.
    pub async fn prepare(
        &self,
        query: impl Into<Statement>,
    ) -> Result<PreparedStatement, ExecutionError> {
        let statement = query.into();
        self.prepare_statement(&statement).await
    }

    /// Like [`Session::prepare`]. The prepared statement inherits the
    /// settings of `statement`.
    pub async fn prepare_statement(
        &self,
        statement: &Statement,
    ) -> Result<PreparedStatement, ExecutionError> {
        // Preparing has no side effects, whatever the statement does.
        let mut config = statement.config.clone();
        config.is_idempotent = true;

        let prepared = self
            .run_request(
                "prepare",
                OutputShape::Prepared,
                &config,
                |connection: Arc<Connection>, _consistency: Consistency| async move {
                    connection.prepare(statement).await
                },
            )
            .await?
            .into_prepared()?;

        Ok(PreparedStatement::new(prepared, statement))
    }

    /// Executes a prepared statement which returns rows.
    pub async fn execute(
        &self,
        prepared: &PreparedStatement,
        values: &SerializedValues,
        consistency: Consistency,
    ) -> Result<Rows, ExecutionError> {
        self.execute_output(prepared, values, Some(consistency), OutputShape::Rows)
            .await?
            .into_rows()
    }

    /// Executes a prepared statement which returns no rows.
    pub async fn execute_non_query(
        &self,
        prepared: &PreparedStatement,
        values: &SerializedValues,
        consistency: Consistency,
    ) -> Result<Option<SchemaChange>, ExecutionError> {
        self.execute_output(prepared, values, Some(consistency), OutputShape::NonQuery)
            .await?
            .into_non_query()
    }

    /// Like [`Session::execute`], with the consistency set on `prepared`.
    pub async fn execute_statement(
        &self,
        prepared: &PreparedStatement,
        values: &SerializedValues,
    ) -> Result<Rows, ExecutionError> {
        self.execute_output(prepared, values, None, OutputShape::Rows)
            .await?
            .into_rows()
    }

    async fn execute_output(
        &self,
        prepared: &PreparedStatement,
        values: &SerializedValues,
        consistency: Option<Consistency>,
        shape: OutputShape,
    ) -> Result<Output, ExecutionError> {
        prepared.check_values(values)?;

        let mut config = prepared.config.clone();
        if consistency.is_some() {
            config.consistency = consistency;
        }

        self.run_request(
            "execute",
            shape,
            &config,
            |connection: Arc<Connection>, consistency: Consistency| async move {
                connection.execute(prepared, values, consistency).await
            },
        )
        .await
    }

    /// Switches every connection of the session to `keyspace_name`.
    ///
    /// Case-insensitive names are lowercased by the database, the
    /// case-sensitive ones are sent in quotes.
    pub async fn change_keyspace(
        &self,
        keyspace_name: impl Into<String>,
        case_sensitive: bool,
    ) -> Result<(), ExecutionError> {
        self.check_not_disposed()?;
        let keyspace = VerifiedKeyspaceName::new(keyspace_name.into(), case_sensitive)
            .map_err(BadQuery::from)?;
        self.pool.change_keyspace(keyspace).await?;
        Ok(())
    }

    /// Closes every connection and fails the requests waiting on them.
    /// Any later operation fails with [`ExecutionError::Disposed`].
    /// Calling it again does nothing.
    pub async fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Shutting down the session");
        self.stop_event_router();
        self.pool.shutdown().await;
    }

    fn stop_event_router(&self) {
        let router = self
            .event_router
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        // Dropping the router's handle stops its worker.
        drop(router);
    }

    /// Whether `node` is among the nodes currently believed up.
    pub fn is_up(&self, node: SocketAddr) -> bool {
        self.pool.topology().is_up(node)
    }

    /// The known nodes currently believed up.
    pub fn live_nodes(&self) -> Vec<SocketAddr> {
        self.pool.topology().live_endpoints()
    }

    /// The keyspace the session's connections use, if any.
    pub fn get_keyspace(&self) -> Option<String> {
        self.pool.keyspace().map(|ks| ks.as_str().to_owned())
    }

    fn check_not_disposed(&self) -> Result<(), ExecutionError> {
        if self.disposed.load(Ordering::SeqCst) {
            Err(ExecutionError::Disposed)
        } else {
            Ok(())
        }
    }

    // Runs a request to completion: retries per the retry policy, speculates
    // for idempotent requests when a speculative policy is set, and bounds
    // the whole thing with the request timeout.
    async fn run_request<QueryFut>(
        &self,
        kind: &'static str,
        shape: OutputShape,
        statement_config: &StatementConfig,
        run_request_once: impl Fn(Arc<Connection>, Consistency) -> QueryFut,
    ) -> Result<Output, ExecutionError>
    where
        QueryFut: Future<Output = Result<QueryResponse, RequestAttemptError>>,
    {
        self.check_not_disposed()?;

        let span = trace_span!(
            "Request",
            kind,
            status = tracing::field::Empty,
            error = tracing::field::Empty
        );
        let consistency = statement_config.determine_consistency(self.default_consistency);
        let tried = TriedEndpoints(StdMutex::new(Vec::new()));

        let runner = async {
            let tried = &tried;
            let run_request_once = &run_request_once;
            match self.speculative_execution_policy.as_deref() {
                Some(speculative) if statement_config.is_idempotent => {
                    let fiber_generator = |is_first: bool| {
                        if !is_first {
                            trace!("Starting a speculative execution");
                        }
                        self.run_request_fiber(
                            tried,
                            run_request_once,
                            statement_config.is_idempotent,
                            consistency,
                            shape,
                        )
                    };
                    speculative_execution::execute(speculative, fiber_generator).await
                }
                _ => self
                    .run_request_fiber(
                        tried,
                        run_request_once,
                        statement_config.is_idempotent,
                        consistency,
                        shape,
                    )
                    .await
                    .unwrap_or_else(|| {
                        Err(ExecutionError::NoHostAvailable {
                            reason: "no attempt could be made".to_owned(),
                        })
                    }),
            }
        };

        let effective_timeout = statement_config.request_timeout.or(self.request_timeout);
        let result = match effective_timeout {
            Some(timeout) => tokio::time::timeout(timeout, runner.instrument(span.clone()))
                .await
                .unwrap_or(Err(ExecutionError::RequestTimeout(timeout))),
            None => runner.instrument(span.clone()).await,
        };

        if result.is_ok() {
            span.record("status", "OK");
        }
        result.record_error(&span)
    }

    // One line of attempts. Gives up after as many attempts as there are
    // connections and endpoints to try, so a pool whose connections are all
    // busy or broken ends the request instead of spinning. Returns None
    // only when no attempt was made at all.
    async fn run_request_fiber<QueryFut>(
        &self,
        tried: &TriedEndpoints,
        run_request_once: &impl Fn(Arc<Connection>, Consistency) -> QueryFut,
        is_idempotent: bool,
        consistency: Consistency,
        shape: OutputShape,
    ) -> Option<Result<Output, ExecutionError>>
    where
        QueryFut: Future<Output = Result<QueryResponse, RequestAttemptError>>,
    {
        let attempt_budget =
            self.pool.max_size() + self.pool.topology().configured_endpoints().len();
        let mut retry_session = self.retry_policy.new_session();
        let mut current_consistency = consistency;
        let mut same_target: Option<Arc<Connection>> = None;
        let mut last_error: Option<ExecutionError> = None;

        for _ in 0..attempt_budget {
            let connection = match same_target.take().filter(|conn| conn.is_healthy()) {
                Some(connection) => connection,
                None => match self.pool.acquire(&tried.snapshot()).await {
                    Ok(connection) => connection,
                    Err(e) => {
                        trace!(error = %e, "Choosing connection failed");
                        return Some(Err(match (e, last_error) {
                            (ExecutionError::Disposed, _) => ExecutionError::Disposed,
                            (_, Some(last_error)) => last_error,
                            (e, None) => e,
                        }));
                    }
                },
            };
            let endpoint = connection.get_connect_address();
            tried.record(endpoint);
            trace!(connection = %endpoint, "Sending");

            let request_result = run_request_once(connection.clone(), current_consistency)
                .await
                .and_then(|response| {
                    if let Some(tracing_id) = response.tracing_id {
                        trace!(tracing_id = %tracing_id, "Request traced");
                    }
                    response.into_output()?.into_non_error()
                });

            let request_error = match request_result {
                Ok(output) => {
                    trace!("Request succeeded");
                    return Some(Ok(output));
                }
                Err(RequestAttemptError::UnableToAllocStreamId) => {
                    // Local contention, not a failure of the request.
                    trace!(connection = %endpoint, "Stream slots exhausted");
                    last_error = Some(slots_exhausted());
                    continue;
                }
                Err(e) => {
                    trace!(last_error = %e, "Request failed");
                    e
                }
            };

            let decision = retry_session.decide_should_retry(RequestInfo {
                error: &request_error,
                is_idempotent,
                consistency: current_consistency,
            });
            trace!(retry_decision = ?decision);

            last_error = Some(request_error.into());

            match decision {
                RetryDecision::RetrySameTarget(new_cl) => {
                    current_consistency = new_cl.unwrap_or(current_consistency);
                    same_target = Some(connection);
                }
                RetryDecision::RetryNextTarget(new_cl) => {
                    current_consistency = new_cl.unwrap_or(current_consistency);
                }
                RetryDecision::DontRetry => break,
                RetryDecision::IgnoreWriteError => match shape.ignored_write() {
                    Some(output) => return Some(Ok(output)),
                    None => break,
                },
            }
        }

        last_error.map(Err)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.stop_event_router();
            self.pool.shutdown_nowait();
        }
    }
}
