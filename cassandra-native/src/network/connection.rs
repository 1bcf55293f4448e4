use crate::authentication::AuthenticatorProvider;
use crate::cluster::TopologyTracker;
use crate::errors::{
    BadKeyspaceName, BrokenConnectionError, BrokenConnectionErrorKind, ConnectionError,
    ConnectionSetupRequestError, ConnectionSetupRequestErrorKind, CqlEventHandlingError,
    CqlRequestKind, CqlResponseKind, DbError, InternalRequestError, InvariantViolation,
    RequestAttemptError, ResponseParseError, SubscribeError, UseKeyspaceError,
};
use crate::frame::request::options::{self, Options};
use crate::frame::request::{
    AuthResponse, Execute, Prepare, Query, Register, SerializableRequest, Startup,
};
use crate::frame::response::authenticate::Authenticate;
use crate::frame::response::event::Event;
use crate::frame::response::{Error, Response, ResponseOpcode, Supported};
use crate::frame::server_event_type::EventType;
use crate::frame::types::Consistency;
use crate::frame::{self, Compression, FrameParams, SerializedRequest};
use crate::response::{NonErrorAuthResponse, NonErrorStartupResponse, Output, QueryResponse};
use crate::serialize::SerializedValues;
use crate::statement::prepared::PreparedStatement;
use crate::statement::unprepared::Statement;
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use futures::{future::RemoteHandle, FutureExt};
use socket2::{SockRef, TcpKeepalive};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::sync::{Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

// The term "orphan" refers to stream ids that were allocated for a {request, response} that no
// one is waiting for anymore (due to cancellation of `Connection::send_request`). An orphan
// older than `OLD_AGE_ORPHAN_THRESHOLD` is an old orphan. A connection on which more than half
// of the stream slots are held by old orphans is shut down.
const OLD_AGE_ORPHAN_THRESHOLD: Duration = Duration::from_secs(1);

/// Stream ids a connection may have in flight when nothing else is configured.
pub(crate) const DEFAULT_STREAM_SLOTS: usize = 128;

// The protocol allows non-negative i16 stream ids only.
const MAX_STREAM_SLOTS: usize = i16::MAX as usize + 1;

pub(crate) struct Connection {
    _worker_handle: RemoteHandle<()>,

    connect_address: SocketAddr,
    config: ConnectionConfig,
    router_handle: Arc<RouterHandle>,
    health: watch::Receiver<Option<BrokenConnectionError>>,
    event_sink: Arc<ArcSwapOption<mpsc::Sender<Event>>>,
    keyspace: ArcSwapOption<VerifiedKeyspaceName>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("connect_address", &self.connect_address)
            .finish_non_exhaustive()
    }
}

struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,

    // Each request sent by `Connection::send_request` needs a unique request id.
    // This field is a monotonic generator of such ids.
    request_id_generator: AtomicU64,
    // If a `Connection::send_request` is cancelled, it sends notification
    // about orphaning via the sender below.
    // Unbounded, so that it can be pushed to from `Drop`.
    orphan_notification_sender: mpsc::UnboundedSender<RequestId>,
    // Breaks the connection from the outside: abort timeouts and `close()`.
    abort_sender: mpsc::UnboundedSender<BrokenConnectionErrorKind>,
    abort_timeout: Option<Duration>,
}

impl RouterHandle {
    fn allocate_request_id(&self) -> RequestId {
        self.request_id_generator
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<TaskResponse, InternalRequestError> {
        let serialized_request = SerializedRequest::make(request, compression, tracing)?;
        let request_id = self.allocate_request_id();

        let (response_sender, receiver) = oneshot::channel();
        let response_handler = ResponseHandler {
            response_sender,
            request_id,
        };

        // Dropping `notifier` (before calling `notifier.disable()`) will send a notification to
        // `Connection::router`. This notification is then used to mark a `stream_id` associated
        // with this request as orphaned and free associated resources.
        let notifier = OrphanhoodNotifier::new(request_id, &self.orphan_notification_sender);

        self.submit_channel
            .send(Task {
                serialized_request,
                response_handler,
            })
            .await
            .map_err(|_| -> BrokenConnectionError {
                BrokenConnectionErrorKind::ChannelError.into()
            })?;

        let received = match self.abort_timeout {
            Some(abort_timeout) => match tokio::time::timeout(abort_timeout, receiver).await {
                Ok(received) => received,
                Err(_) => {
                    warn!(
                        "No response within the abort timeout of {:?}, breaking the connection",
                        abort_timeout
                    );
                    let _ = self
                        .abort_sender
                        .send(BrokenConnectionErrorKind::AbortTimeout(abort_timeout));
                    return Err(BrokenConnectionError::from(
                        BrokenConnectionErrorKind::AbortTimeout(abort_timeout),
                    )
                    .into());
                }
            },
            None => receiver.await,
        };

        let task_response = received.map_err(|_| -> BrokenConnectionError {
            BrokenConnectionErrorKind::ChannelError.into()
        })?;

        // Response was successfully received, so it's time to disable
        // notification about orphaning.
        notifier.disable();

        task_response
    }
}

type RequestId = u64;

struct ResponseHandler {
    response_sender: oneshot::Sender<Result<TaskResponse, InternalRequestError>>,
    request_id: RequestId,
}

// Used to notify `Connection::orphaner` about `Connection::send_request`
// future being dropped before receiving response.
struct OrphanhoodNotifier<'a> {
    enabled: bool,
    request_id: RequestId,
    notification_sender: &'a mpsc::UnboundedSender<RequestId>,
}

impl<'a> OrphanhoodNotifier<'a> {
    fn new(
        request_id: RequestId,
        notification_sender: &'a mpsc::UnboundedSender<RequestId>,
    ) -> Self {
        Self {
            enabled: true,
            request_id,
            notification_sender,
        }
    }

    fn disable(mut self) {
        self.enabled = false;
    }
}

impl Drop for OrphanhoodNotifier<'_> {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.notification_sender.send(self.request_id);
        }
    }
}

struct Task {
    serialized_request: SerializedRequest,
    response_handler: ResponseHandler,
}

struct TaskResponse {
    params: FrameParams,
    opcode: ResponseOpcode,
    body: Bytes,
}

/// Per-connection settings, derived from the session configuration.
#[derive(Clone)]
pub(crate) struct ConnectionConfig {
    pub(crate) compression: Option<Compression>,
    pub(crate) tcp_nodelay: bool,
    pub(crate) tcp_keepalive_interval: Option<Duration>,
    pub(crate) connect_timeout: Duration,
    /// A request waiting longer than this for its response breaks the connection.
    pub(crate) abort_timeout: Option<Duration>,
    pub(crate) stream_slots: usize,
    pub(crate) authenticator: Option<Arc<dyn AuthenticatorProvider>>,

    pub(crate) keepalive_interval: Option<Duration>,
    pub(crate) keepalive_timeout: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            compression: None,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            connect_timeout: Duration::from_secs(5),
            abort_timeout: None,
            stream_slots: DEFAULT_STREAM_SLOTS,
            authenticator: None,
            keepalive_interval: None,
            keepalive_timeout: None,
        }
    }
}

fn lock_handlers(
    handler_map: &StdMutex<ResponseHandlerMap>,
) -> MutexGuard<'_, ResponseHandlerMap> {
    // The reader, writer and orphaner run on the same task and never hold
    // the lock across an .await, so the lock is never contended.
    handler_map.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Connection {
    /// Opens a TCP connection and starts the router on it, but does not
    /// send any frames yet.
    async fn new(
        connect_address: SocketAddr,
        config: ConnectionConfig,
    ) -> Result<Self, ConnectionError> {
        let stream = match tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(connect_address),
        )
        .await
        {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(ConnectionError::ConnectTimeout);
            }
        };
        stream.set_nodelay(config.tcp_nodelay)?;

        if let Some(tcp_keepalive_interval) = config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, tcp_keepalive_interval)?;
        }

        let (sender, receiver) = mpsc::channel(1024);
        let (health_sender, health) = watch::channel(None);
        // Unbounded because it allows for synchronous pushes
        let (orphan_notification_sender, orphan_notification_receiver) = mpsc::unbounded_channel();
        let (abort_sender, abort_receiver) = mpsc::unbounded_channel();

        let router_handle = Arc::new(RouterHandle {
            submit_channel: sender,
            request_id_generator: AtomicU64::new(0),
            orphan_notification_sender,
            abort_sender,
            abort_timeout: config.abort_timeout,
        });
        let event_sink = Arc::new(ArcSwapOption::empty());

        let (task, _worker_handle) = Self::router(
            config.clone(),
            stream,
            receiver,
            health_sender,
            orphan_notification_receiver,
            abort_receiver,
            router_handle.clone(),
            event_sink.clone(),
            connect_address,
        )
        .remote_handle();
        tokio::task::spawn(task);

        Ok(Connection {
            _worker_handle,
            connect_address,
            config,
            router_handle,
            health,
            event_sink,
            keyspace: ArcSwapOption::empty(),
        })
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        // Our interval is the idle time before keepalives begin to be sent
        // ("time" in socket2 terms); socket2's interval is the time between keepalive packets.
        let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        #[cfg(any(
            target_os = "android",
            target_os = "freebsd",
            target_os = "ios",
            target_os = "linux",
            target_os = "macos",
            target_os = "netbsd",
            target_os = "windows",
        ))]
        {
            tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));
        }

        let sf = SockRef::from(&stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }

    async fn startup(
        &self,
        options: HashMap<String, String>,
    ) -> Result<NonErrorStartupResponse, ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new(CqlRequestKind::Startup, kind)
        };

        let response = self
            .send_request(&Startup { options }, false, false)
            .await
            .map_err(|e| err(e.into()))?;

        match response.response {
            Response::Ready => Ok(NonErrorStartupResponse::Ready),
            Response::Authenticate(auth) => Ok(NonErrorStartupResponse::Authenticate(auth)),
            Response::Error(Error { error, reason }) => {
                Err(err(ConnectionSetupRequestErrorKind::DbError(error, reason)))
            }
            other => Err(err(ConnectionSetupRequestErrorKind::UnexpectedResponse(
                other.to_response_kind(),
            ))),
        }
    }

    async fn get_options(&self) -> Result<Supported, ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new(CqlRequestKind::Options, kind)
        };

        let response = self
            .send_request(&Options, false, false)
            .await
            .map_err(|e| err(e.into()))?;

        match response.response {
            Response::Supported(supported) => Ok(supported),
            Response::Error(Error { error, reason }) => {
                Err(err(ConnectionSetupRequestErrorKind::DbError(error, reason)))
            }
            other => Err(err(ConnectionSetupRequestErrorKind::UnexpectedResponse(
                other.to_response_kind(),
            ))),
        }
    }

    async fn perform_authenticate(
        &self,
        authenticate: &Authenticate,
    ) -> Result<(), ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new(CqlRequestKind::AuthResponse, kind)
        };

        let authenticator_provider = self
            .config
            .authenticator
            .as_ref()
            .ok_or_else(|| err(ConnectionSetupRequestErrorKind::MissingAuthentication))?;

        let (mut response, mut auth_session) = authenticator_provider
            .start_authentication_session(&authenticate.authenticator_name)
            .await
            .map_err(|e| err(ConnectionSetupRequestErrorKind::StartAuthSessionError(e)))?;

        loop {
            match self.authenticate_response(response).await? {
                NonErrorAuthResponse::AuthChallenge(challenge) => {
                    response = auth_session
                        .evaluate_challenge(challenge.authenticate_message.as_deref())
                        .await
                        .map_err(|e| {
                            err(ConnectionSetupRequestErrorKind::AuthChallengeEvaluationError(e))
                        })?;
                }
                NonErrorAuthResponse::AuthSuccess(success) => {
                    auth_session
                        .success(success.success_message.as_deref())
                        .await
                        .map_err(|e| err(ConnectionSetupRequestErrorKind::AuthFinishError(e)))?;
                    return Ok(());
                }
            }
        }
    }

    async fn authenticate_response(
        &self,
        response: Option<Vec<u8>>,
    ) -> Result<NonErrorAuthResponse, ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new(CqlRequestKind::AuthResponse, kind)
        };

        let response = self
            .send_request(&AuthResponse { response }, false, false)
            .await
            .map_err(|e| err(e.into()))?;

        match response.response {
            Response::AuthSuccess(auth_success) => {
                Ok(NonErrorAuthResponse::AuthSuccess(auth_success))
            }
            Response::AuthChallenge(auth_challenge) => {
                Ok(NonErrorAuthResponse::AuthChallenge(auth_challenge))
            }
            Response::Error(Error { error, reason }) => {
                Err(err(ConnectionSetupRequestErrorKind::DbError(error, reason)))
            }
            other => Err(err(ConnectionSetupRequestErrorKind::UnexpectedResponse(
                other.to_response_kind(),
            ))),
        }
    }

    /// Sends an unprepared statement with no bound values.
    pub(crate) async fn query(
        &self,
        statement: &Statement,
        consistency: Consistency,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let query_frame = Query {
            contents: statement.contents.clone(),
            parameters: statement
                .config
                .query_parameters(consistency, SerializedValues::new()),
        };

        self.send_request(&query_frame, true, statement.config.tracing)
            .await
            .map_err(Into::into)
    }

    pub(crate) async fn prepare(
        &self,
        statement: &Statement,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let prepare_frame = Prepare {
            query: statement.contents.clone(),
        };

        self.send_request(&prepare_frame, true, statement.config.tracing)
            .await
            .map_err(Into::into)
    }

    /// Executes a prepared statement. If the node no longer knows the
    /// statement, it is prepared again on this connection and executed once more.
    pub(crate) async fn execute(
        &self,
        prepared: &PreparedStatement,
        values: &SerializedValues,
        consistency: Consistency,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let execute_frame = Execute {
            id: prepared.get_id().clone(),
            parameters: prepared.config.query_parameters(consistency, values.clone()),
        };

        let response = self
            .send_request(&execute_frame, true, prepared.config.tracing)
            .await?;

        match &response.response {
            Response::Error(Error {
                error: DbError::Unprepared { statement_id },
                ..
            }) => {
                debug!(
                    "Connection to {}: statement {:?} is unprepared, repreparing",
                    self.connect_address, statement_id
                );
                self.reprepare(prepared).await?;
                self.send_request(&execute_frame, true, prepared.config.tracing)
                    .await
                    .map_err(Into::into)
            }
            _ => Ok(response),
        }
    }

    async fn reprepare(&self, previous_prepared: &PreparedStatement) -> Result<(), RequestAttemptError> {
        let mut statement = Statement::new(previous_prepared.get_statement());
        statement.config = previous_prepared.config.clone();

        let reprepared = self.prepare(&statement).await?.into_output()?.into_non_error()?;
        match reprepared {
            Output::Prepared(prepared) if prepared.id == *previous_prepared.get_id() => Ok(()),
            Output::Prepared(_) => {
                error!(
                    "Statement {:?} was reprepared under a different id",
                    previous_prepared.get_statement()
                );
                Err(RequestAttemptError::UnexpectedResponse(
                    CqlResponseKind::Result,
                ))
            }
            _ => Err(RequestAttemptError::UnexpectedResponse(
                CqlResponseKind::Result,
            )),
        }
    }

    /// Switches this connection to `keyspace_name`. The keyspace reported
    /// back by the server must be the one requested.
    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        // Trying to pass keyspace as bound value in "USE ?" doesn't work
        // So we have to create a string for query: "USE " + new_keyspace
        // To avoid any possible CQL injections it's good to verify that the name is valid
        let query: Statement = match keyspace_name.is_case_sensitive {
            true => format!("USE \"{}\"", keyspace_name.as_str()),
            false => format!("USE {}", keyspace_name.as_str()),
        }
        .into();

        let query_response = self.query(&query, Consistency::One).await?;
        Self::verify_use_keyspace_result(keyspace_name, query_response)?;

        self.keyspace.store(Some(Arc::new(keyspace_name.clone())));
        Ok(())
    }

    fn verify_use_keyspace_result(
        keyspace_name: &VerifiedKeyspaceName,
        query_response: QueryResponse,
    ) -> Result<(), UseKeyspaceError> {
        match query_response.into_output()?.into_non_error()? {
            Output::SetKeyspace(result_keyspace_name) => {
                let matches = if keyspace_name.is_case_sensitive {
                    result_keyspace_name == keyspace_name.as_str()
                } else {
                    result_keyspace_name.eq_ignore_ascii_case(keyspace_name.as_str())
                };
                if !matches {
                    return Err(UseKeyspaceError::KeyspaceNameMismatch {
                        expected_keyspace_name: keyspace_name.as_str().to_owned(),
                        result_keyspace_name,
                    });
                }
                Ok(())
            }
            other => Err(InvariantViolation::UnexpectedOutput {
                expected: "SetKeyspace",
                got: other.kind_name(),
            }
            .into()),
        }
    }

    async fn register(
        &self,
        event_types_to_register_for: Vec<EventType>,
    ) -> Result<(), ConnectionSetupRequestError> {
        let err = |kind: ConnectionSetupRequestErrorKind| {
            ConnectionSetupRequestError::new(CqlRequestKind::Register, kind)
        };

        let register_frame = Register {
            event_types_to_register_for,
        };

        let response = self
            .send_request(&register_frame, true, false)
            .await
            .map_err(|e| err(e.into()))?;

        match response.response {
            Response::Ready => Ok(()),
            Response::Error(Error { error, reason }) => {
                Err(err(ConnectionSetupRequestErrorKind::DbError(error, reason)))
            }
            other => Err(err(ConnectionSetupRequestErrorKind::UnexpectedResponse(
                other.to_response_kind(),
            ))),
        }
    }

    /// Registers this connection for topology and status events, which are
    /// then forwarded to `sink`. On failure the connection stays unsubscribed.
    pub(crate) async fn subscribe(&self, sink: mpsc::Sender<Event>) -> Result<(), SubscribeError> {
        if self.event_sink.load().is_some() {
            return Err(SubscribeError::AlreadySubscribed);
        }
        self.event_sink.store(Some(Arc::new(sink)));

        let registered = self
            .register(vec![EventType::TopologyChange, EventType::StatusChange])
            .await;
        if let Err(e) = registered {
            self.event_sink.store(None);
            return Err(e.into());
        }

        debug!("Connection to {} subscribed to events", self.connect_address);
        Ok(())
    }

    pub(crate) fn is_subscribed(&self) -> bool {
        self.event_sink.load().is_some()
    }

    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compress: bool,
        tracing: bool,
    ) -> Result<QueryResponse, InternalRequestError> {
        if let Some(broken) = self.broken_error() {
            return Err(broken.into());
        }

        let compression = if compress {
            self.config.compression
        } else {
            None
        };

        let task_response = match self
            .router_handle
            .send_request(request, compression, tracing)
            .await
        {
            Ok(task_response) => task_response,
            // The router is gone; report why, if it said so.
            Err(InternalRequestError::BrokenConnection(err))
                if matches!(err.kind(), BrokenConnectionErrorKind::ChannelError) =>
            {
                return Err(self.broken_error().unwrap_or(err).into());
            }
            Err(err) => return Err(err),
        };

        let response = Self::parse_response(task_response, self.config.compression)?;

        Ok(response)
    }

    fn parse_response(
        task_response: TaskResponse,
        compression: Option<Compression>,
    ) -> Result<QueryResponse, ResponseParseError> {
        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            compression,
            task_response.body,
        )?;

        for warn_description in &body_with_ext.warnings {
            warn!(
                warning = warn_description.as_str(),
                "Response from the database contains a warning",
            );
        }

        let response = Response::deserialize(task_response.opcode, &body_with_ext.body)?;

        Ok(QueryResponse {
            response,
            warnings: body_with_ext.warnings,
            tracing_id: body_with_ext.trace_id,
            custom_payload: body_with_ext.custom_payload,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn router(
        config: ConnectionConfig,
        stream: impl AsyncRead + AsyncWrite,
        receiver: mpsc::Receiver<Task>,
        health_sender: watch::Sender<Option<BrokenConnectionError>>,
        orphan_notification_receiver: mpsc::UnboundedReceiver<RequestId>,
        abort_receiver: mpsc::UnboundedReceiver<BrokenConnectionErrorKind>,
        router_handle: Arc<RouterHandle>,
        event_sink: Arc<ArcSwapOption<mpsc::Sender<Event>>>,
        node_address: SocketAddr,
    ) {
        let (read_half, write_half) = split(stream);
        // The handler_map is shared between the reader, writer and orphaner
        // futures, which run on the same task. A RefCell would make the
        // whole future !Sync, hence the mutex.
        let handler_map = StdMutex::new(ResponseHandlerMap::new(config.stream_slots));

        let k = Self::keepaliver(
            router_handle,
            config.keepalive_interval,
            config.keepalive_timeout,
            node_address,
        );

        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            &handler_map,
            &event_sink,
            config.compression,
        );
        let w = Self::writer(
            BufWriter::with_capacity(8192, write_half),
            &handler_map,
            receiver,
        );
        let o = Self::orphaner(
            &handler_map,
            orphan_notification_receiver,
            config.stream_slots,
        );
        let a = Self::aborter(abort_receiver);

        let result = futures::try_join!(r, w, o, k, a);

        let error: BrokenConnectionError = match result {
            Ok(_) => return, // Connection was dropped, we can return
            Err(err) => err,
        };
        debug!("Connection to {} broken: {}", node_address, error);

        // Mark the connection unhealthy before failing the waiters, so that
        // a waiter woken with the error already sees the connection as broken.
        let _ = health_sender.send(Some(error.clone()));

        // Respond to all pending requests with the error
        let response_handlers: HashMap<i16, ResponseHandler> = handler_map
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
            .into_handlers();

        for (_, handler) in response_handlers {
            // Ignore sending error, request was dropped
            let _ = handler.response_sender.send(Err(error.clone().into()));
        }
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        event_sink: &ArcSwapOption<mpsc::Sender<Event>>,
        compression: Option<Compression>,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) = frame::read_response_frame(&mut read_half)
                .await
                .map_err(BrokenConnectionErrorKind::FrameHeaderParseError)?;
            let response = TaskResponse {
                params,
                opcode,
                body,
            };

            match params.stream.cmp(&frame::EVENT_STREAM_ID) {
                Ordering::Less => {
                    // Negative streams other than -1 are reserved and unused.
                    continue;
                }
                Ordering::Equal => {
                    if let Some(event_sender) = event_sink.load_full() {
                        Self::handle_event(response, compression, &event_sender)
                            .await
                            .map_err(BrokenConnectionErrorKind::CqlEventHandlingError)?
                    }
                    continue;
                }
                Ordering::Greater => {}
            }

            let handler_lookup_res = lock_handlers(handler_map).lookup(params.stream);

            use HandlerLookupResult::*;
            match handler_lookup_res {
                Handler(handler) => {
                    // Don't care if sending of the response fails. This must
                    // mean that the receiver side was impatient and is not
                    // waiting for the result anymore.
                    let _ = handler.response_sender.send(Ok(response));
                }
                Missing => {
                    warn!(
                        "Dropping response with unexpected stream id {}",
                        params.stream
                    );
                }
                Orphaned => {
                    // The waiter is gone; the slot was released by the lookup.
                }
            }
        }
    }

    fn alloc_stream_id(
        handler_map: &StdMutex<ResponseHandlerMap>,
        response_handler: ResponseHandler,
    ) -> Option<i16> {
        match lock_handlers(handler_map).allocate(response_handler) {
            Ok(stream_id) => {
                trace!("Allocated stream id {}", stream_id);
                Some(stream_id)
            }
            Err(response_handler) => {
                error!("Could not allocate stream id");
                let _ = response_handler
                    .response_sender
                    .send(Err(InternalRequestError::UnableToAllocStreamId));
                None
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut task_receiver: mpsc::Receiver<Task>,
    ) -> Result<(), BrokenConnectionError> {
        // When the Connection object is dropped, the sender half
        // of the channel will be dropped, this task will return an error
        // and the whole worker will be stopped
        while let Some(mut task) = task_receiver.recv().await {
            let mut num_requests = 0;
            let mut total_sent = 0;
            while let Some(stream_id) = Self::alloc_stream_id(handler_map, task.response_handler) {
                let mut req = task.serialized_request;
                req.set_stream(stream_id);
                let req_data: &[u8] = req.get_data();
                total_sent += req_data.len();
                num_requests += 1;
                write_half
                    .write_all(req_data)
                    .await
                    .map_err(BrokenConnectionErrorKind::WriteError)?;
                task = match task_receiver.try_recv() {
                    Ok(t) => t,
                    Err(_) => break,
                }
            }
            trace!("Sending {} requests; {} bytes", num_requests, total_sent);
            write_half
                .flush()
                .await
                .map_err(BrokenConnectionErrorKind::WriteError)?;
        }

        Ok(())
    }

    // This task receives notifications from `OrphanhoodNotifier`s and tries to
    // mark streams as orphaned. It also checks count of old orphans periodically.
    // Once old orphans hold more than half of the slots, `orphaner` returns an error
    // causing the connection to break.
    async fn orphaner(
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut orphan_receiver: mpsc::UnboundedReceiver<RequestId>,
        stream_slots: usize,
    ) -> Result<(), BrokenConnectionError> {
        let old_orphan_count_threshold = stream_slots / 2;
        let mut interval = tokio::time::interval(OLD_AGE_ORPHAN_THRESHOLD);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let old_orphan_count = lock_handlers(handler_map).old_orphans_count();
                    if old_orphan_count > old_orphan_count_threshold {
                        warn!(
                            "Too many old orphaned stream ids: {}",
                            old_orphan_count,
                        );
                        return Err(BrokenConnectionErrorKind::TooManyOrphanedStreamIds(
                            u16::try_from(old_orphan_count).unwrap_or(u16::MAX),
                        ).into())
                    }
                }
                Some(request_id) = orphan_receiver.recv() => {
                    trace!(
                        "Trying to orphan stream id associated with request_id = {}",
                        request_id,
                    );
                    lock_handlers(handler_map).orphan(request_id);
                }
                else => { break }
            }
        }

        Ok(())
    }

    async fn keepaliver(
        router_handle: Arc<RouterHandle>,
        keepalive_interval: Option<Duration>,
        keepalive_timeout: Option<Duration>,
        node_address: SocketAddr, // This address is only used to enrich the log messages
    ) -> Result<(), BrokenConnectionError> {
        async fn issue_keepalive_query(
            router_handle: &RouterHandle,
        ) -> Result<(), BrokenConnectionError> {
            router_handle
                .send_request(&Options, None, false)
                .await
                .map(|_| ())
                .map_err(|req_err| {
                    BrokenConnectionErrorKind::KeepaliveRequestError(Arc::new(req_err)).into()
                })
        }

        let Some(keepalive_interval) = keepalive_interval else {
            // No keepalives are to be sent.
            return Ok(());
        };

        let mut interval = tokio::time::interval(keepalive_interval);
        interval.tick().await; // Use up the first, instant tick.

        // Default behaviour (Burst) is not suitable for sending keepalives.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let keepalive_query = issue_keepalive_query(&router_handle);
            let query_result = if let Some(timeout) = keepalive_timeout {
                match tokio::time::timeout(timeout, keepalive_query).await {
                    Ok(res) => res,
                    Err(_) => {
                        warn!(
                            "Timed out while waiting for response to keepalive request on connection to node {}",
                            node_address
                        );
                        return Err(BrokenConnectionErrorKind::KeepaliveTimeout(node_address).into());
                    }
                }
            } else {
                keepalive_query.await
            };
            if let Err(err) = query_result {
                warn!(
                    "Failed to execute keepalive request on connection to node {} - {}",
                    node_address, err
                );
                return Err(err);
            }

            trace!(
                "Keepalive request successful on connection to node {}",
                node_address
            );
        }
    }

    // Completes with an error as soon as someone asks to break the connection.
    async fn aborter(
        mut abort_receiver: mpsc::UnboundedReceiver<BrokenConnectionErrorKind>,
    ) -> Result<(), BrokenConnectionError> {
        match abort_receiver.recv().await {
            Some(kind) => Err(kind.into()),
            None => Ok(()),
        }
    }

    async fn handle_event(
        task_response: TaskResponse,
        compression: Option<Compression>,
        event_sender: &mpsc::Sender<Event>,
    ) -> Result<(), CqlEventHandlingError> {
        let event = match Self::parse_response(task_response, compression) {
            Ok(r) => match r.response {
                Response::Event(event) => event,
                _ => {
                    error!("Expected to receive Event response, got {:?}", r.response);
                    return Err(CqlEventHandlingError::UnexpectedResponse(
                        r.response.to_response_kind(),
                    ));
                }
            },
            Err(e) => match e {
                ResponseParseError::BodyExtensionsParseError(e) => return Err(e.into()),
                ResponseParseError::CqlResponseParseError(e) => match e {
                    crate::frame::frame_errors::CqlResponseParseError::CqlEventParseError(e) => {
                        return Err(e.into())
                    }
                    // Received a response other than EVENT, but failed to deserialize it.
                    _ => {
                        return Err(CqlEventHandlingError::UnexpectedResponse(
                            e.to_response_kind(),
                        ));
                    }
                },
            },
        };

        TopologyTracker::check_event(&event)?;

        event_sender
            .send(event)
            .await
            .map_err(|_| CqlEventHandlingError::SendError)
    }

    /// Breaks the connection and fails every outstanding waiter with
    /// [`BrokenConnectionErrorKind::Closed`]. Returns once the router is down.
    pub(crate) async fn close(&self) {
        self.start_close();
        self.wait_until_broken().await;
    }

    /// Asks the router to break the connection with
    /// [`BrokenConnectionErrorKind::Closed`], without waiting for it.
    pub(crate) fn start_close(&self) {
        let _ = self
            .router_handle
            .abort_sender
            .send(BrokenConnectionErrorKind::Closed);
    }

    /// Resolves once the connection is broken, with the reason.
    pub(crate) async fn wait_until_broken(&self) -> BrokenConnectionError {
        let mut health = self.health.clone();
        loop {
            let broken = health.borrow_and_update().clone();
            if let Some(err) = broken {
                return err;
            }
            if health.changed().await.is_err() {
                // The router stopped without reporting an error.
                return BrokenConnectionErrorKind::ChannelError.into();
            }
        }
    }

    pub(crate) fn broken_error(&self) -> Option<BrokenConnectionError> {
        self.health.borrow().clone()
    }

    pub(crate) fn is_healthy(&self) -> bool {
        self.health.borrow().is_none()
    }

    pub(crate) fn get_connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    pub(crate) fn get_keyspace(&self) -> Option<Arc<VerifiedKeyspaceName>> {
        self.keyspace.load_full()
    }

    #[cfg(test)]
    pub(crate) fn get_compression(&self) -> Option<Compression> {
        self.config.compression
    }
}

/// Opens a connection and performs the handshake: OPTIONS, compression
/// negotiation, STARTUP, authentication and, when `keyspace` is given, USE.
pub(crate) async fn open_connection(
    connect_address: SocketAddr,
    config: &ConnectionConfig,
    keyspace: Option<&VerifiedKeyspaceName>,
) -> Result<Connection, ConnectionError> {
    debug!("Opening connection to {}", connect_address);

    /* Setup connection on TCP level and prepare for sending/receiving CQL frames. */
    let mut connection = Connection::new(connect_address, config.clone()).await?;

    /* Perform OPTIONS/SUPPORTED/STARTUP handshake. */

    // Get OPTIONS SUPPORTED by the cluster.
    let mut supported = connection.get_options().await?;
    let supported_compression = supported
        .options
        .remove(options::COMPRESSION)
        .unwrap_or_default();

    /* Prepare options that the driver opts-in in STARTUP frame. */
    let mut startup_options = HashMap::new();

    // The only CQL protocol version supported by the driver.
    startup_options.insert(
        options::CQL_VERSION.to_owned(),
        options::DEFAULT_CQL_PROTOCOL_VERSION.to_owned(),
    );
    startup_options.insert(
        options::DRIVER_NAME.to_owned(),
        options::DEFAULT_DRIVER_NAME.to_owned(),
    );
    startup_options.insert(
        options::DRIVER_VERSION.to_owned(),
        options::DEFAULT_DRIVER_VERSION.to_owned(),
    );

    // Optional compression.
    if let Some(compression) = &config.compression {
        let compression_str = compression.as_str();
        if supported_compression.iter().any(|c| c == compression_str) {
            // Compression is reported to be supported by the server,
            // request it from the server
            startup_options.insert(options::COMPRESSION.to_owned(), compression_str.to_owned());
        } else {
            // Fall back to no compression
            warn!(
                "Requested compression <{}> is not supported by the cluster. Falling back to no compression",
                compression_str
            );
            connection.config.compression = None;
        }
    }

    /* Send the STARTUP frame with all the requested options. */
    let startup_result = connection.startup(startup_options).await?;
    match startup_result {
        NonErrorStartupResponse::Ready => {}
        NonErrorStartupResponse::Authenticate(authenticate) => {
            connection.perform_authenticate(&authenticate).await?;
        }
    }

    if let Some(keyspace) = keyspace {
        connection.use_keyspace(keyspace).await?;
    }

    Ok(connection)
}

struct OrphanageTracker {
    orphans: HashMap<i16, Instant>,
    by_orphaning_times: BTreeSet<(Instant, i16)>,
}

impl OrphanageTracker {
    fn new() -> Self {
        Self {
            orphans: HashMap::new(),
            by_orphaning_times: BTreeSet::new(),
        }
    }

    fn insert(&mut self, stream_id: i16) {
        let now = Instant::now();
        self.orphans.insert(stream_id, now);
        self.by_orphaning_times.insert((now, stream_id));
    }

    fn remove(&mut self, stream_id: i16) {
        if let Some(time) = self.orphans.remove(&stream_id) {
            self.by_orphaning_times.remove(&(time, stream_id));
        }
    }

    fn contains(&self, stream_id: i16) -> bool {
        self.orphans.contains_key(&stream_id)
    }

    fn orphans_older_than(&self, age: Duration) -> usize {
        let Some(minimal_age) = Instant::now().checked_sub(age) else {
            return 0;
        };
        // Linear in the number of old orphans only.
        self.by_orphaning_times
            .range(..(minimal_age, i16::MAX))
            .count()
    }
}

struct ResponseHandlerMap {
    stream_set: StreamIdSet,
    handlers: HashMap<i16, ResponseHandler>,

    request_to_stream: HashMap<RequestId, i16>,
    orphanage_tracker: OrphanageTracker,
}

enum HandlerLookupResult {
    Orphaned,
    Handler(ResponseHandler),
    Missing,
}

impl ResponseHandlerMap {
    fn new(stream_slots: usize) -> Self {
        Self {
            stream_set: StreamIdSet::new(stream_slots),
            handlers: HashMap::new(),
            request_to_stream: HashMap::new(),
            orphanage_tracker: OrphanageTracker::new(),
        }
    }

    fn allocate(&mut self, response_handler: ResponseHandler) -> Result<i16, ResponseHandler> {
        match self.stream_set.allocate() {
            Some(stream_id) => {
                self.request_to_stream
                    .insert(response_handler.request_id, stream_id);
                self.handlers.insert(stream_id, response_handler);
                Ok(stream_id)
            }
            None => Err(response_handler),
        }
    }

    // Orphan stream_id (associated with this request_id) by moving it to
    // `orphanage_tracker`, and freeing its handler
    fn orphan(&mut self, request_id: RequestId) {
        if let Some(stream_id) = self.request_to_stream.remove(&request_id) {
            debug!(
                "Orphaning stream_id = {} associated with request_id = {}",
                stream_id, request_id
            );
            self.orphanage_tracker.insert(stream_id);
            self.handlers.remove(&stream_id);
        }
    }

    fn old_orphans_count(&self) -> usize {
        self.orphanage_tracker
            .orphans_older_than(OLD_AGE_ORPHAN_THRESHOLD)
    }

    fn lookup(&mut self, stream_id: i16) -> HandlerLookupResult {
        if self.orphanage_tracker.contains(stream_id) {
            self.orphanage_tracker.remove(stream_id);
            self.stream_set.free(stream_id);
            return HandlerLookupResult::Orphaned;
        }

        match self.handlers.remove(&stream_id) {
            Some(handler) => {
                // A mapping `request_id` -> `stream_id` must be removed, to
                // prevent marking this `stream_id` as orphaned by some late
                // orphan notification.
                self.request_to_stream.remove(&handler.request_id);
                self.stream_set.free(stream_id);
                HandlerLookupResult::Handler(handler)
            }
            None => HandlerLookupResult::Missing,
        }
    }

    // Retrieves the map of handlers, used after connection breaks
    // and we have to respond to all of them with an error
    fn into_handlers(self) -> HashMap<i16, ResponseHandler> {
        self.handlers
    }
}

/// Bitmap of the stream ids in use, bounded by the configured slot count.
struct StreamIdSet {
    used_bitmap: Box<[u64]>,
    slots: usize,
}

impl StreamIdSet {
    fn new(slots: usize) -> Self {
        let slots = slots.clamp(1, MAX_STREAM_SLOTS);
        Self {
            used_bitmap: vec![0; slots.div_ceil(64)].into_boxed_slice(),
            slots,
        }
    }

    fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones() as usize;
                let stream_id = block_id * 64 + off;
                // Ids are handed out lowest first, so the first free id
                // past the bound means every id below it is taken.
                if stream_id >= self.slots {
                    return None;
                }
                *block |= 1u64 << off;
                return i16::try_from(stream_id).ok();
            }
        }
        None
    }

    fn free(&mut self, stream_id: i16) {
        let Ok(stream_id) = usize::try_from(stream_id) else {
            return;
        };
        if stream_id >= self.slots {
            return;
        }
        self.used_bitmap[stream_id / 64] &= !(1 << (stream_id % 64));
    }
}

/// This type can only hold a valid keyspace name
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct VerifiedKeyspaceName {
    name: Arc<String>,
    pub(crate) is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    pub(crate) fn new(
        keyspace_name: String,
        case_sensitive: bool,
    ) -> Result<Self, BadKeyspaceName> {
        Self::verify_keyspace_name_is_valid(&keyspace_name)?;

        Ok(VerifiedKeyspaceName {
            name: Arc::new(keyspace_name),
            is_case_sensitive: case_sensitive,
        })
    }

    pub(crate) fn as_str(&self) -> &str {
        self.name.as_str()
    }

    // Up to 48 ASCII alphanumerics or underscores. Servers accept an
    // underscore as the first character, so we do too.
    fn verify_keyspace_name_is_valid(keyspace_name: &str) -> Result<(), BadKeyspaceName> {
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }

        if let Some(character) = keyspace_name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
        {
            return Err(BadKeyspaceName::IllegalCharacter(
                keyspace_name.to_string(),
                character,
            ));
        }

        // Only ascii is left, so the length in bytes is the length in characters.
        if keyspace_name.len() > 48 {
            return Err(BadKeyspaceName::TooLong(
                keyspace_name.to_string(),
                keyspace_name.len(),
            ));
        }

        Ok(())
    }
}
