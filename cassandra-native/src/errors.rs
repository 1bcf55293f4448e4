//! Errors reported by the driver, from a single request attempt on
//! one connection up to the failure handed back to the caller.

use std::error::Error;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::authentication::AuthError;
use crate::frame::frame_errors::{
    CqlEventParseError, CqlRequestSerializationError, CqlResponseParseError,
    FrameBodyExtensionsParseError, FrameHeaderParseError,
};
use crate::frame::server_event_type::EventType;
use crate::serialize::SerializationError;

pub use cassandra_native_cql::errors::{CqlRequestKind, CqlResponseKind, DbError, WriteType};

/// Error returned to the caller of a [`Session`](crate::client::session::Session) operation.
///
/// [`ExecutionError::DbError`] and [`ExecutionError::NoHostAvailable`] are
/// the failures a well-behaved caller should expect; the remaining variants
/// report misuse, shutdown or a broken protocol assumption.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ExecutionError {
    /// Database sent a response containing some error with a message
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// No connection could serve the request, after all retries and
    /// speculative attempts were exhausted.
    #[error("No host available: {reason}")]
    NoHostAvailable {
        /// Why the last attempt failed.
        reason: String,
    },

    /// The connection died while the request was in flight, and the
    /// request could not be safely retried elsewhere.
    #[error(transparent)]
    ConnectionBroken(#[from] BrokenConnectionError),

    /// A response or event broke an assumption about the protocol.
    #[error(transparent)]
    InvariantViolation(#[from] InvariantViolation),

    /// The session was shut down.
    #[error("Session has been shut down")]
    Disposed,

    /// The request did not complete within its configured timeout.
    #[error("Request timed out after {0:?}")]
    RequestTimeout(Duration),

    /// Changing the keyspace failed.
    #[error(transparent)]
    UseKeyspace(#[from] UseKeyspaceError),

    /// Caller passed an invalid query.
    #[error(transparent)]
    BadQuery(#[from] BadQuery),
}

impl From<RequestAttemptError> for ExecutionError {
    fn from(err: RequestAttemptError) -> Self {
        match err {
            RequestAttemptError::DbError(db_error, reason) => {
                ExecutionError::DbError(db_error, reason)
            }
            RequestAttemptError::UnableToAllocStreamId => ExecutionError::NoHostAvailable {
                reason: "stream slots exhausted".to_owned(),
            },
            RequestAttemptError::BrokenConnectionError(e) => ExecutionError::ConnectionBroken(e),
            RequestAttemptError::CqlRequestSerialization(e) => {
                ExecutionError::BadQuery(BadQuery::CqlRequestSerialization(e))
            }
            RequestAttemptError::BodyExtensionsParseError(e) => {
                InvariantViolation::MalformedResponse(e.into()).into()
            }
            RequestAttemptError::CqlResponseParseError(e) => {
                InvariantViolation::MalformedResponse(e.into()).into()
            }
            RequestAttemptError::UnexpectedResponse(kind) => {
                InvariantViolation::UnexpectedResponse(kind).into()
            }
        }
    }
}

/// Caller passed an invalid query.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum BadQuery {
    /// Bound values could not be serialized.
    #[error("Serializing values failed: {0}")]
    SerializationError(#[from] SerializationError),

    /// The number of bound values differs from the number of markers
    /// of the prepared statement.
    #[error("Prepared statement expects {expected} values, {got} were bound")]
    WrongValuesCount {
        /// Number of bind markers.
        expected: usize,
        /// Number of values passed.
        got: u16,
    },

    /// The request frame could not be built.
    #[error("Failed to serialize request: {0}")]
    CqlRequestSerialization(CqlRequestSerializationError),

    /// The keyspace name is not valid.
    #[error("Passed invalid keyspace name to use: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),
}

/// Invalid keyspace name given to `Session::use_keyspace()`
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BadKeyspaceName {
    /// Keyspace name is empty
    #[error("Keyspace name is empty")]
    Empty,

    /// Keyspace name too long, must be up to 48 characters
    #[error("Keyspace name too long, must be up to 48 characters, found {1} characters. Bad keyspace name: '{0}'")]
    TooLong(String, usize),

    /// Illegal character - only alphanumeric and underscores allowed.
    #[error("Illegal character found: '{1}', only alphanumeric and underscores allowed. Bad keyspace name: '{0}'")]
    IllegalCharacter(String, char),
}

/// An outcome that contradicts what the protocol guarantees for the
/// request that produced it. Never retried.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum InvariantViolation {
    /// The output kind does not match the shape of the operation.
    #[error("Expected {expected} output, got {got}")]
    UnexpectedOutput {
        /// Output kinds accepted by the operation.
        expected: &'static str,
        /// Output kind actually received.
        got: &'static str,
    },

    /// The server answered with a response opcode that is invalid for the request.
    #[error("Received unexpected response from the server: {0}")]
    UnexpectedResponse(CqlResponseKind),

    /// The response could not be decoded.
    #[error("Malformed response: {0}")]
    MalformedResponse(#[from] ResponseParseError),

    /// An event of a category the event connection never registered for.
    #[error("Unexpected {0} event on the event connection")]
    UnexpectedEvent(EventType),

    /// A node changed its token ownership, which the driver does not track.
    #[error("Node {0} moved")]
    NodeMoved(SocketAddr),
}

/// Failure to decode a response frame body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ResponseParseError {
    /// Failed to parse body extensions (tracing id, warnings, custom payload).
    #[error(transparent)]
    BodyExtensionsParseError(#[from] FrameBodyExtensionsParseError),

    /// Failed to parse the response body itself.
    #[error(transparent)]
    CqlResponseParseError(#[from] CqlResponseParseError),
}

/// An error that occurred during a single attempt of a QUERY, PREPARE
/// or EXECUTE request on one connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestAttemptError {
    /// Failed to serialize the request.
    #[error("Failed to serialize request: {0}")]
    CqlRequestSerialization(#[from] CqlRequestSerializationError),

    /// Every stream slot of the connection is taken.
    #[error("Unable to allocate stream id")]
    UnableToAllocStreamId,

    /// The connection broke before the response arrived.
    #[error(transparent)]
    BrokenConnectionError(#[from] BrokenConnectionError),

    /// Failed to deserialize frame body extensions.
    #[error(transparent)]
    BodyExtensionsParseError(#[from] FrameBodyExtensionsParseError),

    /// Received a response, but failed to deserialize it.
    #[error(transparent)]
    CqlResponseParseError(#[from] CqlResponseParseError),

    /// Database sent a response containing some error with a message
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// Received an unexpected response from the server.
    #[error("Received unexpected response from the server: {0}. Expected RESULT or ERROR response.")]
    UnexpectedResponse(CqlResponseKind),
}

impl RequestAttemptError {
    /// True if the error guarantees that the server did not apply the
    /// statement, so even a non-idempotent request may be sent again.
    pub fn guarantees_not_applied(&self) -> bool {
        match self {
            RequestAttemptError::UnableToAllocStreamId
            | RequestAttemptError::CqlRequestSerialization(_) => true,
            RequestAttemptError::DbError(db_error, _) => db_error.guarantees_not_applied(),
            RequestAttemptError::BrokenConnectionError(_)
            | RequestAttemptError::BodyExtensionsParseError(_)
            | RequestAttemptError::CqlResponseParseError(_)
            | RequestAttemptError::UnexpectedResponse(_) => false,
        }
    }
}

/// Error of a request sent through the router, before its response
/// was interpreted by the caller.
#[derive(Error, Debug, Clone)]
pub(crate) enum InternalRequestError {
    #[error(transparent)]
    CqlRequestSerialization(#[from] CqlRequestSerializationError),
    #[error(transparent)]
    BodyExtensionsParseError(#[from] FrameBodyExtensionsParseError),
    #[error(transparent)]
    CqlResponseParseError(#[from] CqlResponseParseError),
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),
    #[error("Unable to allocate stream id")]
    UnableToAllocStreamId,
}

impl From<ResponseParseError> for InternalRequestError {
    fn from(value: ResponseParseError) -> Self {
        match value {
            ResponseParseError::BodyExtensionsParseError(e) => e.into(),
            ResponseParseError::CqlResponseParseError(e) => e.into(),
        }
    }
}

impl From<InternalRequestError> for RequestAttemptError {
    fn from(value: InternalRequestError) -> Self {
        match value {
            InternalRequestError::CqlRequestSerialization(e) => e.into(),
            InternalRequestError::BodyExtensionsParseError(e) => e.into(),
            InternalRequestError::CqlResponseParseError(e) => match e {
                // Only RESULT and ERROR are valid here. Failing to parse any
                // other response means it was unexpected in the first place.
                CqlResponseParseError::CqlErrorParseError(_)
                | CqlResponseParseError::CqlResultParseError(_) => e.into(),
                _ => RequestAttemptError::UnexpectedResponse(e.to_response_kind()),
            },
            InternalRequestError::BrokenConnection(e) => e.into(),
            InternalRequestError::UnableToAllocStreamId => {
                RequestAttemptError::UnableToAllocStreamId
            }
        }
    }
}

/// Error that occurred while opening a connection (the ConnectError of
/// the connection lifecycle).
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionError {
    /// Connect timeout elapsed before the TCP connection was established.
    #[error("Connect timeout elapsed")]
    ConnectTimeout,

    /// Input/Output error occurred.
    #[error(transparent)]
    IoError(Arc<std::io::Error>),

    /// A request performed during connection setup failed.
    #[error(transparent)]
    ConnectionSetupRequestError(#[from] ConnectionSetupRequestError),

    /// The connection broke during setup.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// Selecting the configured keyspace failed.
    #[error(transparent)]
    UseKeyspace(#[from] UseKeyspaceError),
}

impl From<std::io::Error> for ConnectionError {
    fn from(value: std::io::Error) -> Self {
        ConnectionError::IoError(Arc::new(value))
    }
}

/// Error that occurred during a request issued while setting a connection
/// up (OPTIONS, STARTUP, AUTH_RESPONSE, REGISTER).
#[derive(Error, Debug, Clone)]
#[error("Failed to perform a connection setup request. Request: {request_kind}, reason: {error}")]
pub struct ConnectionSetupRequestError {
    request_kind: CqlRequestKind,
    error: ConnectionSetupRequestErrorKind,
}

impl ConnectionSetupRequestError {
    pub(crate) fn new(request_kind: CqlRequestKind, error: ConnectionSetupRequestErrorKind) -> Self {
        ConnectionSetupRequestError {
            request_kind,
            error,
        }
    }

    /// The request that failed.
    pub fn request_kind(&self) -> CqlRequestKind {
        self.request_kind
    }

    /// Why it failed.
    pub fn error(&self) -> &ConnectionSetupRequestErrorKind {
        &self.error
    }
}

/// Why a connection setup request failed.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConnectionSetupRequestErrorKind {
    /// Failed to serialize the request.
    #[error("Failed to serialize request: {0}")]
    CqlRequestSerialization(#[from] CqlRequestSerializationError),

    /// Failed to deserialize frame body extensions.
    #[error(transparent)]
    BodyExtensionsParseError(#[from] FrameBodyExtensionsParseError),

    /// Failed to deserialize the response.
    #[error(transparent)]
    CqlResponseParseError(#[from] CqlResponseParseError),

    /// The server answered with an error.
    #[error("Database returned an error: {0}, Error message: {1}")]
    DbError(DbError, String),

    /// The server answered with a response invalid for the request.
    #[error("Received unexpected response from the server: {0}")]
    UnexpectedResponse(CqlResponseKind),

    /// The connection broke during setup.
    #[error(transparent)]
    BrokenConnection(#[from] BrokenConnectionError),

    /// Every stream slot was taken.
    #[error("Unable to allocate stream id")]
    UnableToAllocStreamId,

    /// The server requires authentication, but no authenticator was configured.
    #[error("Authentication is required. You can use SessionBuilder::user(\"user\", \"pass\") to provide credentials or SessionBuilder::authenticator_provider to provide custom authenticator")]
    MissingAuthentication,

    /// The authenticator failed to start a session.
    #[error("Failed to start authentication session: {0}")]
    StartAuthSessionError(AuthError),

    /// The authenticator failed to answer a challenge.
    #[error("Failed to evaluate auth challenge on client side: {0}")]
    AuthChallengeEvaluationError(AuthError),

    /// The authenticator rejected the success message.
    #[error("Failed to finish authentication on client side: {0}")]
    AuthFinishError(AuthError),
}

impl From<InternalRequestError> for ConnectionSetupRequestErrorKind {
    fn from(value: InternalRequestError) -> Self {
        match value {
            InternalRequestError::CqlRequestSerialization(e) => e.into(),
            InternalRequestError::BodyExtensionsParseError(e) => e.into(),
            InternalRequestError::CqlResponseParseError(e) => match e {
                CqlResponseParseError::CqlResultParseError(_) => {
                    ConnectionSetupRequestErrorKind::UnexpectedResponse(e.to_response_kind())
                }
                e => e.into(),
            },
            InternalRequestError::BrokenConnection(e) => e.into(),
            InternalRequestError::UnableToAllocStreamId => {
                ConnectionSetupRequestErrorKind::UnableToAllocStreamId
            }
        }
    }
}

/// Error of a `USE <keyspace>` request.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum UseKeyspaceError {
    /// Passed invalid keyspace name to use.
    #[error("Passed invalid keyspace name to use: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),

    /// The request failed.
    #[error(transparent)]
    RequestError(#[from] RequestAttemptError),

    /// The server answered with something other than a SetKeyspace result.
    #[error(transparent)]
    InvariantViolation(#[from] InvariantViolation),

    /// The server reported a different keyspace than the one requested.
    #[error("Keyspace name mismatch; expected: {expected_keyspace_name}, received: {result_keyspace_name}")]
    KeyspaceNameMismatch {
        /// The keyspace requested.
        expected_keyspace_name: String,
        /// The keyspace named in the SetKeyspace result.
        result_keyspace_name: String,
    },
}

/// Failure to subscribe a connection to server events. The caller has
/// to pick a different connection.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum SubscribeError {
    /// The REGISTER request failed or was not answered with READY.
    #[error("Failed to register for events: {0}")]
    RegisterFailed(#[from] ConnectionSetupRequestError),

    /// Another sink already receives events from this connection.
    #[error("Connection is already subscribed to events")]
    AlreadySubscribed,
}

/// A connection was dropped and all its in-flight requests were failed.
#[derive(Error, Debug, Clone)]
#[error("Connection broken, reason: {0}")]
pub struct BrokenConnectionError(Arc<BrokenConnectionErrorKind>);

impl BrokenConnectionError {
    /// Why the connection broke.
    pub fn kind(&self) -> &BrokenConnectionErrorKind {
        &self.0
    }
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(value: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError(Arc::new(value))
    }
}

/// Why a connection broke.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum BrokenConnectionErrorKind {
    /// The connection was closed by the driver.
    #[error("Connection closed")]
    Closed,

    /// A request waited for its response longer than the abort timeout.
    #[error("A request was not answered within the abort timeout of {0:?}")]
    AbortTimeout(Duration),

    /// Driver sent a keepalive request to the database, but the request timed out.
    #[error("Timed out while waiting for response to keepalive request on connection to node {0}")]
    KeepaliveTimeout(SocketAddr),

    /// Driver sent a keepalive request to the database, but request execution failed.
    #[error("Failed to execute keepalive request: {0}")]
    KeepaliveRequestError(Arc<dyn Error + Sync + Send>),

    /// Failed to deserialize response frame header.
    #[error("Failed to deserialize frame: {0}")]
    FrameHeaderParseError(#[from] FrameHeaderParseError),

    /// Failed to handle a CQL event received on the event stream.
    #[error("Failed to handle server event: {0}")]
    CqlEventHandlingError(#[from] CqlEventHandlingError),

    /// Failed to write data to the socket.
    #[error("Failed to write data: {0}")]
    WriteError(std::io::Error),

    /// Too many orphaned stream ids were kept by the connection.
    #[error("Too many orphaned stream ids: {0}")]
    TooManyOrphanedStreamIds(u16),

    /// Failed to send a request to the router, or to receive its response.
    #[error("Failed to send/receive data needed to perform a request via tokio channel.")]
    ChannelError,
}

/// Failed to handle a CQL event received on the event stream (-1).
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum CqlEventHandlingError {
    /// Received an event frame, but failed to decode it.
    #[error("Failed to deserialize EVENT response: {0}")]
    CqlEventParseError(#[from] CqlEventParseError),

    /// A frame other than EVENT arrived on the event stream.
    #[error("Received unexpected server response on stream -1: {0}. Expected EVENT response")]
    UnexpectedResponse(CqlResponseKind),

    /// Failed to deserialize frame body extensions.
    #[error("Failed to deserialize a header of frame with EVENT response: {0}")]
    BodyExtensionParseError(#[from] FrameBodyExtensionsParseError),

    /// The event decoded fine, but the driver cannot act on it.
    #[error("Received an event the connection cannot handle: {0}")]
    UnexpectedEvent(#[from] InvariantViolation),

    /// The event sink was dropped.
    #[error("Failed to send event info via channel. The channel is probably closed")]
    SendError,
}

/// Error that occurred during session creation.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum NewSessionError {
    /// List of known nodes passed to Session constructor is empty.
    /// There needs to be at least one node to connect to.
    #[error("Empty known nodes list")]
    EmptyKnownNodesList,

    /// Failed to resolve hostname passed in Session creation.
    #[error("Couldn't resolve any hostname: {0:?}")]
    FailedToResolveAnyHostname(Vec<String>),

    /// The configured keyspace name is not valid.
    #[error("Passed invalid keyspace name to use: {0}")]
    BadKeyspaceName(#[from] BadKeyspaceName),

    /// Could not open the first connection.
    #[error("Failed to connect to any known node: {0}")]
    ConnectionError(#[from] ConnectionError),

    /// The first connection refused to subscribe to events.
    #[error(transparent)]
    SubscribeError(#[from] SubscribeError),
}

#[cfg(test)]
mod tests {
    use super::{
        BrokenConnectionErrorKind, ExecutionError, InvariantViolation, RequestAttemptError,
    };
    use crate::errors::DbError;
    use crate::frame::types::Consistency;
    use assert_matches::assert_matches;

    // Displaying ExecutionError::DbError must show the error description,
    // its parameters and the server message.
    #[test]
    fn dberror_full_info() {
        let db_error = DbError::Unavailable {
            consistency: Consistency::Three,
            required: 3,
            alive: 2,
        };

        let db_error_displayed: String = format!("{}", db_error);

        let mut expected_dberr_msg =
            "Not enough nodes are alive to satisfy required consistency level ".to_string();
        expected_dberr_msg += "(consistency: Three, required: 3, alive: 2)";

        assert_eq!(db_error_displayed, expected_dberr_msg);

        let execution_error =
            ExecutionError::DbError(db_error, "a message about unavailable error".to_string());
        let execution_error_displayed: String = format!("{}", execution_error);

        let mut expected_err_msg = "Database returned an error: ".to_string();
        expected_err_msg += &expected_dberr_msg;
        expected_err_msg += ", Error message: a message about unavailable error";

        assert_eq!(execution_error_displayed, expected_err_msg);
    }

    #[test]
    fn exhausted_slots_surface_as_no_host_available() {
        let err: ExecutionError = RequestAttemptError::UnableToAllocStreamId.into();
        assert_matches!(err, ExecutionError::NoHostAvailable { reason } if reason.contains("stream slots"));
    }

    #[test]
    fn unexpected_response_is_an_invariant_violation() {
        let err: ExecutionError = RequestAttemptError::UnexpectedResponse(
            crate::errors::CqlResponseKind::Supported,
        )
        .into();
        assert_matches!(
            err,
            ExecutionError::InvariantViolation(InvariantViolation::UnexpectedResponse(_))
        );
    }

    #[test]
    fn broken_connection_does_not_guarantee_not_applied() {
        let broken = RequestAttemptError::BrokenConnectionError(
            BrokenConnectionErrorKind::TooManyOrphanedStreamIds(5).into(),
        );
        assert!(!broken.guarantees_not_applied());
        assert!(RequestAttemptError::UnableToAllocStreamId.guarantees_not_applied());
        assert!(RequestAttemptError::DbError(DbError::IsBootstrapping, String::new())
            .guarantees_not_applied());
        assert!(!RequestAttemptError::DbError(DbError::Overloaded, String::new())
            .guarantees_not_applied());
    }
}
