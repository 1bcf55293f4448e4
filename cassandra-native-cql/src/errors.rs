//! Errors reported by the server in ERROR responses, and response kinds
//! used when a response of an unexpected type arrives.

use crate::Consistency;
use bytes::Bytes;
use thiserror::Error;

/// The error of an ERROR response, with the details the protocol attaches
/// to its code.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum DbError {
    #[error("Syntax error in the statement")]
    SyntaxError,

    #[error("Invalid statement")]
    Invalid,

    /// `table` is empty when the keyspace itself already existed.
    #[error("{keyspace}.{table} already exists")]
    AlreadyExists { keyspace: String, table: String },

    #[error("Function {keyspace}.{function}({arg_types:?}) failed")]
    FunctionFailure {
        keyspace: String,
        function: String,
        arg_types: Vec<String>,
    },

    #[error("Bad credentials")]
    AuthenticationError,

    #[error("Not authorized to run the statement")]
    Unauthorized,

    #[error("Statement rejected by the server configuration")]
    ConfigError,

    /// The coordinator knew before starting that too few replicas were
    /// alive.
    #[error("Cannot achieve consistency {consistency}: {alive} of {required} required replicas alive")]
    Unavailable {
        consistency: Consistency,
        required: i32,
        alive: i32,
    },

    #[error("Coordinator overloaded")]
    Overloaded,

    #[error("Coordinator is bootstrapping")]
    IsBootstrapping,

    #[error("Truncate failed")]
    TruncateError,

    /// `data_present` tells whether the replica asked for data (rather than
    /// a digest) answered.
    #[error("Read timed out at {consistency}: {received} of {required} replies, data present: {data_present}")]
    ReadTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        data_present: bool,
    },

    #[error("{write_type} write timed out at {consistency}: {received} of {required} acknowledgements")]
    WriteTimeout {
        consistency: Consistency,
        received: i32,
        required: i32,
        write_type: WriteType,
    },

    #[error("Read failed at {consistency}: {received} of {required} replies, {numfailures} failures, data present: {data_present}")]
    ReadFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        data_present: bool,
    },

    #[error("{write_type} write failed at {consistency}: {received} of {required} acknowledgements, {numfailures} failures")]
    WriteFailure {
        consistency: Consistency,
        received: i32,
        required: i32,
        numfailures: i32,
        write_type: WriteType,
    },

    /// The node does not know the prepared statement; it has to be prepared
    /// again before it can be executed.
    #[error("Statement {statement_id:?} is not prepared on this node")]
    Unprepared { statement_id: Bytes },

    #[error("Server error")]
    ServerError,

    #[error("Protocol error")]
    ProtocolError,

    /// A code the protocol does not define.
    #[error("Error code {0:#06x}")]
    Other(i32),
}

impl DbError {
    /// The numeric code of this error on the wire.
    pub fn code(&self) -> i32 {
        match self {
            DbError::ServerError => 0x0000,
            DbError::ProtocolError => 0x000A,
            DbError::AuthenticationError => 0x0100,
            DbError::Unavailable { .. } => 0x1000,
            DbError::Overloaded => 0x1001,
            DbError::IsBootstrapping => 0x1002,
            DbError::TruncateError => 0x1003,
            DbError::WriteTimeout { .. } => 0x1100,
            DbError::ReadTimeout { .. } => 0x1200,
            DbError::ReadFailure { .. } => 0x1300,
            DbError::FunctionFailure { .. } => 0x1400,
            DbError::WriteFailure { .. } => 0x1500,
            DbError::SyntaxError => 0x2000,
            DbError::Unauthorized => 0x2100,
            DbError::Invalid => 0x2200,
            DbError::ConfigError => 0x2300,
            DbError::AlreadyExists { .. } => 0x2400,
            DbError::Unprepared { .. } => 0x2500,
            DbError::Other(code) => *code,
        }
    }

    /// True if the error is local to the node that reported it, so that
    /// another speculative attempt of the same request may still succeed.
    pub fn can_speculative_retry(&self) -> bool {
        // New variants must be classified here explicitly.
        #[deny(clippy::wildcard_enum_match_arm)]
        match self {
            DbError::Unavailable { .. }
            | DbError::Overloaded
            | DbError::IsBootstrapping
            | DbError::ReadTimeout { .. }
            | DbError::WriteTimeout { .. }
            | DbError::ReadFailure { .. }
            | DbError::WriteFailure { .. }
            | DbError::Unprepared { .. }
            | DbError::ServerError => true,

            // Every other node would answer the same.
            DbError::SyntaxError
            | DbError::Invalid
            | DbError::AlreadyExists { .. }
            | DbError::Unauthorized
            | DbError::AuthenticationError
            | DbError::ProtocolError
            | DbError::ConfigError
            | DbError::FunctionFailure { .. }
            | DbError::TruncateError
            | DbError::Other(_) => false,
        }
    }

    /// True when the server guarantees that the statement was not
    /// applied, so even a non-idempotent statement may be sent again.
    pub fn guarantees_not_applied(&self) -> bool {
        matches!(
            self,
            DbError::Unavailable { .. }
                | DbError::IsBootstrapping
                | DbError::ReadTimeout { .. }
                | DbError::ReadFailure { .. }
                | DbError::Unprepared { .. }
        )
    }
}

/// The kind of write that timed out or failed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WriteType {
    Simple,
    /// A logged batch whose batch log was written.
    Batch,
    UnloggedBatch,
    Counter,
    /// A logged batch that failed while writing its batch log.
    BatchLog,
    Cas,
    View,
    Cdc,
    /// A name the protocol does not define.
    Other(String),
}

const WRITE_TYPE_NAMES: [(WriteType, &str); 8] = [
    (WriteType::Simple, "SIMPLE"),
    (WriteType::Batch, "BATCH"),
    (WriteType::UnloggedBatch, "UNLOGGED_BATCH"),
    (WriteType::Counter, "COUNTER"),
    (WriteType::BatchLog, "BATCH_LOG"),
    (WriteType::Cas, "CAS"),
    (WriteType::View, "VIEW"),
    (WriteType::Cdc, "CDC"),
];

impl std::fmt::Display for WriteType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for WriteType {
    fn from(name: &str) -> WriteType {
        WRITE_TYPE_NAMES
            .iter()
            .find(|(_, known)| *known == name)
            .map(|(write_type, _)| write_type.clone())
            .unwrap_or_else(|| WriteType::Other(name.to_owned()))
    }
}

impl WriteType {
    /// The name of this write type on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            WriteType::Other(name) => name,
            known => WRITE_TYPE_NAMES
                .iter()
                .find(|(write_type, _)| write_type == known)
                .map_or("", |(_, name)| name),
        }
    }
}

/// Opcodes of the responses a server may send.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CqlResponseKind {
    Error,
    Ready,
    Authenticate,
    Supported,
    Result,
    Event,
    AuthChallenge,
    AuthSuccess,
}

impl std::fmt::Display for CqlResponseKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CqlResponseKind::Error => "ERROR",
            CqlResponseKind::Ready => "READY",
            CqlResponseKind::Authenticate => "AUTHENTICATE",
            CqlResponseKind::Supported => "SUPPORTED",
            CqlResponseKind::Result => "RESULT",
            CqlResponseKind::Event => "EVENT",
            CqlResponseKind::AuthChallenge => "AUTH_CHALLENGE",
            CqlResponseKind::AuthSuccess => "AUTH_SUCCESS",
        })
    }
}

/// Opcodes of the requests the driver sends.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CqlRequestKind {
    Startup,
    AuthResponse,
    Options,
    Query,
    Prepare,
    Execute,
    Register,
}

impl std::fmt::Display for CqlRequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CqlRequestKind::Startup => "STARTUP",
            CqlRequestKind::AuthResponse => "AUTH_RESPONSE",
            CqlRequestKind::Options => "OPTIONS",
            CqlRequestKind::Query => "QUERY",
            CqlRequestKind::Prepare => "PREPARE",
            CqlRequestKind::Execute => "EXECUTE",
            CqlRequestKind::Register => "REGISTER",
        })
    }
}
