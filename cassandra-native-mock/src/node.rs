use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use cassandra_native_cql::errors::DbError;
use cassandra_native_cql::frame::request::options::{COMPRESSION, CQL_VERSION};
use cassandra_native_cql::frame::request::{AuthResponse, Request};
use cassandra_native_cql::frame::response::authenticate::{AuthSuccess, Authenticate};
use cassandra_native_cql::frame::response::event::Event;
use cassandra_native_cql::frame::response::result::{
    self, ColumnSpec, ColumnType, Prepared, PreparedMetadata, ResultMetadata, SetKeyspace,
    TableSpec,
};
use cassandra_native_cql::frame::response::{Error, Response, ResponseOpcode, Supported};
use cassandra_native_cql::frame::{Compression, FLAG_COMPRESSION};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::actions::{EvaluationContext, Reaction, RequestRule};
use crate::frame::{read_request_frame, response_frame};

const PASSWORD_AUTHENTICATOR: &str = "org.apache.cassandra.auth.PasswordAuthenticator";

/// How a [`MockNode`] answers the handshake.
#[derive(Debug, Clone)]
pub struct MockConfig {
    /// Algorithms listed under COMPRESSION in SUPPORTED.
    pub supported_compression: Vec<String>,
    /// When set, STARTUP is answered with AUTHENTICATE and only this
    /// username/password pair is accepted.
    pub credentials: Option<(String, String)>,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            supported_compression: vec!["lz4".to_owned(), "snappy".to_owned()],
            credentials: None,
        }
    }
}

/// A request as the node received it.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    /// Sequence number of the connection it came on.
    pub connection_seq_no: usize,
    pub stream: i16,
    pub request: Request,
}

impl ReceivedRequest {
    /// Text of a QUERY or PREPARE request.
    pub fn query_text(&self) -> Option<&str> {
        match &self.request {
            Request::Query(query) => Some(&query.contents),
            Request::Prepare(prepare) => Some(&prepare.query),
            _ => None,
        }
    }
}

struct ConnectionHandle {
    frames: mpsc::UnboundedSender<Vec<u8>>,
    compression: Option<Compression>,
    registered: bool,
    close: Arc<Notify>,
}

struct NodeState {
    config: MockConfig,
    rules: Mutex<Vec<RequestRule>>,
    received: Mutex<Vec<ReceivedRequest>>,
    connections: Mutex<HashMap<usize, ConnectionHandle>>,
    next_connection_seq_no: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A CQL node listening on a loopback port. It speaks protocol v4 well
/// enough for the driver's handshake and request paths, and follows
/// [`RequestRule`]s for everything a test wants to script.
///
/// Dropping the node closes the listener and every connection.
pub struct MockNode {
    address: SocketAddr,
    state: Arc<NodeState>,
    acceptor: JoinHandle<()>,
}

impl MockNode {
    /// Starts a node with the default [`MockConfig`].
    pub async fn start() -> io::Result<MockNode> {
        Self::start_with(MockConfig::default()).await
    }

    pub async fn start_with(config: MockConfig) -> io::Result<MockNode> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let address = listener.local_addr()?;
        let state = Arc::new(NodeState {
            config,
            rules: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            connections: Mutex::new(HashMap::new()),
            next_connection_seq_no: AtomicUsize::new(0),
        });
        let acceptor = tokio::spawn(accept_loop(listener, state.clone()));
        debug!("Mock node listening on {}", address);

        Ok(MockNode {
            address,
            state,
            acceptor,
        })
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Replaces the rules. Requests matched by none get [`Reaction::Default`].
    pub fn set_rules(&self, rules: Vec<RequestRule>) {
        *lock(&self.state.rules) = rules;
    }

    /// Every request received so far, in arrival order.
    pub fn received(&self) -> Vec<ReceivedRequest> {
        lock(&self.state.received).clone()
    }

    /// Number of received requests satisfying `pred`.
    pub fn count_received(&self, pred: impl Fn(&ReceivedRequest) -> bool) -> usize {
        lock(&self.state.received).iter().filter(|r| pred(r)).count()
    }

    /// Waits until at least `count` received requests satisfy `pred`.
    pub async fn wait_for_requests(&self, count: usize, pred: impl Fn(&ReceivedRequest) -> bool) {
        while self.count_received(&pred) < count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Number of connections currently open.
    pub fn connection_count(&self) -> usize {
        lock(&self.state.connections).len()
    }

    /// Number of connections accepted since the node started.
    pub fn accepted_connections(&self) -> usize {
        self.state.next_connection_seq_no.load(Ordering::SeqCst)
    }

    /// Number of open connections that registered for events.
    pub fn registered_connections(&self) -> usize {
        lock(&self.state.connections)
            .values()
            .filter(|c| c.registered)
            .count()
    }

    /// Pushes `event` to every connection that registered for events.
    /// Returns the number of connections it was sent to.
    pub fn push_event(&self, event: &Event) -> usize {
        let mut body = Vec::new();
        if let Err(err) = event.serialize(&mut body) {
            warn!("Could not serialize event {:?}: {}", event, err);
            return 0;
        }
        self.push_event_body(&body)
    }

    /// Pushes a raw EVENT body, which need not be well formed, to every
    /// connection that registered for events.
    pub fn push_event_body(&self, body: &[u8]) -> usize {
        let connections = lock(&self.state.connections);
        connections
            .values()
            .filter(|c| c.registered)
            .filter(|c| {
                response_frame(-1, ResponseOpcode::Event, body, c.compression)
                    .map(|frame| c.frames.send(frame).is_ok())
                    .unwrap_or(false)
            })
            .count()
    }

    /// Sends an unsolicited response on `stream` over every open connection.
    pub fn push_response(&self, stream: i16, response: &Response) -> usize {
        let mut body = Vec::new();
        if response.serialize(&mut body).is_err() {
            return 0;
        }
        let connections = lock(&self.state.connections);
        connections
            .values()
            .filter(|c| {
                response_frame(stream, response.opcode(), &body, c.compression)
                    .map(|frame| c.frames.send(frame).is_ok())
                    .unwrap_or(false)
            })
            .count()
    }

    /// Closes the connections that registered for events. Returns how many there were.
    pub fn close_registered_connections(&self) -> usize {
        let connections = lock(&self.state.connections);
        let mut closed = 0;
        for handle in connections.values().filter(|c| c.registered) {
            handle.close.notify_one();
            closed += 1;
        }
        closed
    }

    /// Closes every open connection.
    pub fn close_all_connections(&self) {
        for handle in lock(&self.state.connections).values() {
            handle.close.notify_one();
        }
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.acceptor.abort();
        self.close_all_connections();
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<NodeState>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let seq_no = state.next_connection_seq_no.fetch_add(1, Ordering::SeqCst);
                debug!("Accepted connection {} from {}", seq_no, peer);
                tokio::spawn(serve_connection(stream, seq_no, state.clone()));
            }
            Err(err) => {
                warn!("Mock node stopped accepting connections: {}", err);
                return;
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, seq_no: usize, state: Arc<NodeState>) {
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();
    let (frames, mut frames_receiver) = mpsc::unbounded_channel::<Vec<u8>>();
    let close = Arc::new(Notify::new());

    lock(&state.connections).insert(
        seq_no,
        ConnectionHandle {
            frames: frames.clone(),
            compression: None,
            registered: false,
            close: close.clone(),
        },
    );

    let writer = tokio::spawn(async move {
        while let Some(frame) = frames_receiver.recv().await {
            if write_half.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    tokio::select! {
        res = state.read_requests(&mut read_half, seq_no, &frames) => {
            if let Err(err) = res {
                debug!("Connection {} failed: {}", seq_no, err);
            }
        }
        _ = close.notified() => {
            debug!("Closing connection {}", seq_no);
        }
    }

    writer.abort();
    lock(&state.connections).remove(&seq_no);
}

impl NodeState {
    async fn read_requests(
        self: &Arc<Self>,
        read_half: &mut (impl tokio::io::AsyncRead + Unpin),
        seq_no: usize,
        frames: &mpsc::UnboundedSender<Vec<u8>>,
    ) -> io::Result<()> {
        loop {
            let Some(frame) = read_request_frame(read_half).await? else {
                return Ok(());
            };

            let body = if frame.flags & FLAG_COMPRESSION != 0 {
                let compression = self.compression_of(seq_no).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, "compressed frame before STARTUP")
                })?;
                cassandra_native_cql::frame::decompress(&frame.body, compression)
                    .map(Bytes::from)
                    .map_err(io::Error::other)?
            } else {
                frame.body
            };

            let request =
                Request::deserialize(&mut &body[..], frame.opcode).map_err(io::Error::other)?;
            lock(&self.received).push(ReceivedRequest {
                connection_seq_no: seq_no,
                stream: frame.stream,
                request: request.clone(),
            });

            let reaction = {
                let ctx = EvaluationContext {
                    connection_seq_no: seq_no,
                    opcode: frame.opcode,
                    body: &body,
                };
                let mut rules = lock(&self.rules);
                rules
                    .iter_mut()
                    .find_map(|RequestRule(condition, reaction)| {
                        condition.eval(&ctx).then(|| reaction.clone())
                    })
                    .unwrap_or(Reaction::Default)
            };

            let keep_open = self.react(seq_no, frame.stream, &request, reaction, frames);

            if let Request::Startup(startup) = &request {
                self.negotiate_compression(seq_no, startup.options.get(COMPRESSION));
            }

            if !keep_open {
                return Ok(());
            }
        }
    }

    // Returns false if the connection is to be closed.
    fn react(
        self: &Arc<Self>,
        seq_no: usize,
        stream: i16,
        request: &Request,
        reaction: Reaction,
        frames: &mpsc::UnboundedSender<Vec<u8>>,
    ) -> bool {
        let response = match reaction {
            Reaction::Default => self.default_response(seq_no, request),
            Reaction::Respond(response) => response,
            Reaction::RespondWith(f) => f(request),
            Reaction::Ignore => return true,
            Reaction::CloseConnection => return false,
            Reaction::Delayed(delay, inner) => {
                let state = self.clone();
                let request = request.clone();
                let frames = frames.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if !state.react(seq_no, stream, &request, *inner, &frames) {
                        state.close_connection(seq_no);
                    }
                });
                return true;
            }
        };

        let mut body = Vec::new();
        if let Err(err) = response.serialize(&mut body) {
            warn!("Could not serialize response {:?}: {}", response, err);
            return true;
        }
        match response_frame(stream, response.opcode(), &body, self.compression_of(seq_no)) {
            Ok(frame) => {
                let _ = frames.send(frame);
            }
            Err(err) => warn!("Could not build response frame: {}", err),
        }
        true
    }

    fn default_response(&self, seq_no: usize, request: &Request) -> Response {
        match request {
            Request::Options => Response::Supported(Supported {
                options: HashMap::from([
                    (
                        COMPRESSION.to_owned(),
                        self.config.supported_compression.clone(),
                    ),
                    (CQL_VERSION.to_owned(), vec!["3.4.5".to_owned()]),
                ]),
            }),
            Request::Startup(_) => match self.config.credentials {
                Some(_) => Response::Authenticate(Authenticate {
                    authenticator_name: PASSWORD_AUTHENTICATOR.to_owned(),
                }),
                None => Response::Ready,
            },
            Request::AuthResponse(auth) => self.check_credentials(auth),
            Request::Register(_) => {
                if let Some(handle) = lock(&self.connections).get_mut(&seq_no) {
                    handle.registered = true;
                }
                Response::Ready
            }
            Request::Query(query) => match use_keyspace_target(&query.contents) {
                Some(keyspace_name) => {
                    Response::Result(result::Result::SetKeyspace(SetKeyspace { keyspace_name }))
                }
                None => Response::Result(result::Result::Void),
            },
            Request::Prepare(prepare) => prepared_response(&prepare.query),
            Request::Execute(_) => Response::Result(result::Result::Void),
            _ => Response::Error(Error {
                error: DbError::ProtocolError,
                reason: "Unsupported request".to_owned(),
            }),
        }
    }

    fn check_credentials(&self, auth: &AuthResponse) -> Response {
        let Some((username, password)) = &self.config.credentials else {
            return Response::Error(Error {
                error: DbError::ProtocolError,
                reason: "Authentication was not requested".to_owned(),
            });
        };
        let expected = [&[0u8][..], username.as_bytes(), &[0u8], password.as_bytes()].concat();
        if auth.response.as_deref() == Some(&expected[..]) {
            Response::AuthSuccess(AuthSuccess {
                success_message: None,
            })
        } else {
            Response::Error(Error {
                error: DbError::AuthenticationError,
                reason: "Username and/or password are incorrect".to_owned(),
            })
        }
    }

    fn negotiate_compression(&self, seq_no: usize, requested: Option<&String>) {
        let compression = match requested.map(String::as_str) {
            Some("lz4") => Compression::Lz4,
            Some("snappy") => Compression::Snappy,
            _ => return,
        };
        if !self
            .config
            .supported_compression
            .iter()
            .any(|c| c == compression.as_str())
        {
            return;
        }
        if let Some(handle) = lock(&self.connections).get_mut(&seq_no) {
            handle.compression = Some(compression);
        }
    }

    fn compression_of(&self, seq_no: usize) -> Option<Compression> {
        lock(&self.connections)
            .get(&seq_no)
            .and_then(|c| c.compression)
    }

    fn close_connection(&self, seq_no: usize) {
        if let Some(handle) = lock(&self.connections).get(&seq_no) {
            handle.close.notify_one();
        }
    }
}

/// The keyspace named by a `USE` statement, normalised the way a server
/// reports it back: quoted names verbatim, bare names lowercased.
fn use_keyspace_target(contents: &str) -> Option<String> {
    let mut words = contents.split_whitespace();
    if !words.next()?.eq_ignore_ascii_case("use") {
        return None;
    }
    let name = words.next()?.trim_end_matches(';');
    Some(
        match name.strip_prefix('"').and_then(|n| n.strip_suffix('"')) {
            Some(quoted) => quoted.replace("\"\"", "\""),
            None => name.to_lowercase(),
        },
    )
}

fn prepared_response(query: &str) -> Response {
    let mut hasher = DefaultHasher::new();
    query.hash(&mut hasher);
    let id = Bytes::copy_from_slice(&hasher.finish().to_be_bytes());

    let col_specs: Vec<ColumnSpec> = (0..query.matches('?').count())
        .map(|i| ColumnSpec::new(format!("v{i}"), ColumnType::Int, TableSpec::new("ks", "t")))
        .collect();

    Response::Result(result::Result::Prepared(Prepared {
        id,
        prepared_metadata: PreparedMetadata {
            flags: 0,
            col_count: col_specs.len(),
            pk_indexes: Vec::new(),
            col_specs,
        },
        result_metadata: ResultMetadata::default(),
    }))
}
