//! Errors that can occur while reading frames from the wire, serializing
//! requests, or parsing response bodies.

use std::sync::Arc;

use super::TryFromPrimitiveError;
use crate::errors::CqlResponseKind;
use thiserror::Error;

/// An error that occurred while reading and validating a frame header,
/// or while reading the frame body that follows it.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameHeaderParseError {
    #[error("Failed to read the frame header: {0}")]
    HeaderIoError(Arc<std::io::Error>),
    #[error("Received frame marked as coming from a client")]
    FrameFromClient,
    #[error("Received frame marked as coming from the server")]
    FrameFromServer,
    #[error("Received a frame from version {0}, but only 4 is supported")]
    VersionNotSupported(u8),
    #[error("Unrecognized opcode: {0}")]
    UnknownOpcode(#[from] TryFromPrimitiveError<u8>),
    #[error("Failed to read a chunk of the frame body: {0}")]
    BodyChunkIoError(Arc<std::io::Error>),
    #[error("Connection was closed before body was read: missing {0} out of {1}")]
    ConnectionClosed(usize, usize),
}

/// An error that occurred while decompressing a frame body or reading the
/// body extensions (tracing id, warnings, custom payload) at its beginning.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum FrameBodyExtensionsParseError {
    #[error("Frame is compressed, but no compression was negotiated for the connection")]
    NoCompressionNegotiated,
    #[error("Malformed tracing id: {0}")]
    TraceIdParse(LowLevelDeserializationError),
    #[error("Malformed warnings list: {0}")]
    WarningsListParse(LowLevelDeserializationError),
    #[error("Malformed custom payload map: {0}")]
    CustomPayloadMapParse(LowLevelDeserializationError),
    #[error("Snappy decompression failed")]
    SnapDecompressError,
    #[error("LZ4 body is too short to hold the uncompressed length")]
    Lz4MissingLength,
    #[error("LZ4 decompression failed: {0}")]
    Lz4DecompressError(Arc<lz4_flex::block::DecompressError>),
}

/// An error that occurred while serializing a request body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlRequestSerializationError {
    #[error("Failed to serialize request body: a length does not fit into its wire type: {0}")]
    LengthOverflow(#[from] std::num::TryFromIntError),
    #[error("Failed to serialize bound values: {0}")]
    ValuesSerialization(#[from] crate::serialize::SerializationError),
    #[error("Snappy compression failed")]
    SnapCompressError,
}

/// An error that occurred while deserializing a response body.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlResponseParseError {
    #[error("Failed to deserialize ERROR response: {0}")]
    CqlErrorParseError(#[from] CqlErrorParseError),
    #[error("Failed to deserialize AUTH_CHALLENGE response: {0}")]
    CqlAuthChallengeParseError(#[from] CqlAuthChallengeParseError),
    #[error("Failed to deserialize AUTH_SUCCESS response: {0}")]
    CqlAuthSuccessParseError(#[from] CqlAuthSuccessParseError),
    #[error("Failed to deserialize AUTHENTICATE response: {0}")]
    CqlAuthenticateParseError(#[from] CqlAuthenticateParseError),
    #[error("Failed to deserialize SUPPORTED response: {0}")]
    CqlSupportedParseError(#[from] CqlSupportedParseError),
    #[error("Failed to deserialize EVENT response: {0}")]
    CqlEventParseError(#[from] CqlEventParseError),
    #[error("Failed to deserialize RESULT response: {0}")]
    CqlResultParseError(#[from] CqlResultParseError),
}

impl CqlResponseParseError {
    /// Kind of the response that failed to be parsed.
    pub fn to_response_kind(&self) -> CqlResponseKind {
        match self {
            CqlResponseParseError::CqlErrorParseError(_) => CqlResponseKind::Error,
            CqlResponseParseError::CqlAuthChallengeParseError(_) => CqlResponseKind::AuthChallenge,
            CqlResponseParseError::CqlAuthSuccessParseError(_) => CqlResponseKind::AuthSuccess,
            CqlResponseParseError::CqlAuthenticateParseError(_) => CqlResponseKind::Authenticate,
            CqlResponseParseError::CqlSupportedParseError(_) => CqlResponseKind::Supported,
            CqlResponseParseError::CqlEventParseError(_) => CqlResponseKind::Event,
            CqlResponseParseError::CqlResultParseError(_) => CqlResponseKind::Result,
        }
    }
}

/// An error type returned when deserialization of ERROR response fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlErrorParseError {
    #[error("Malformed error code: {0}")]
    ErrorCodeParseError(LowLevelDeserializationError),
    #[error("Malformed error reason: {0}")]
    ReasonParseError(LowLevelDeserializationError),
    #[error("Malformed error field {field} of DB error {db_error}: {err}")]
    MalformedErrorField {
        db_error: &'static str,
        field: &'static str,
        err: LowLevelDeserializationError,
    },
}

/// An error type returned when deserialization of AUTH_CHALLENGE response fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlAuthChallengeParseError {
    #[error("Malformed authenticate message: {0}")]
    AuthMessageParseError(LowLevelDeserializationError),
}

/// An error type returned when deserialization of AUTH_SUCCESS response fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlAuthSuccessParseError {
    #[error("Malformed success message: {0}")]
    SuccessMessageParseError(LowLevelDeserializationError),
}

/// An error type returned when deserialization of AUTHENTICATE response fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlAuthenticateParseError {
    #[error("Malformed authenticator name: {0}")]
    AuthNameParseError(LowLevelDeserializationError),
}

/// An error type returned when deserialization of SUPPORTED response fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlSupportedParseError {
    #[error("Malformed options map: {0}")]
    OptionsMapDeserialization(LowLevelDeserializationError),
}

/// An error type returned when deserialization of EVENT response fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlEventParseError {
    #[error("Malformed event type string: {0}")]
    EventTypeParseError(LowLevelDeserializationError),
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    #[error("Failed to deserialize schema change event: {0}")]
    SchemaChangeEventParseError(#[from] SchemaChangeEventParseError),
    #[error("Failed to deserialize topology change event: {0}")]
    TopologyChangeEventParseError(ClusterChangeEventParseError),
    #[error("Failed to deserialize status change event: {0}")]
    StatusChangeEventParseError(ClusterChangeEventParseError),
}

/// An error type returned when deserialization of
/// SCHEMA_CHANGE event fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum SchemaChangeEventParseError {
    #[error("Malformed schema change type string: {0}")]
    TypeOfChangeParseError(LowLevelDeserializationError),
    #[error("Malformed schema change target string: {0}")]
    TargetTypeParseError(LowLevelDeserializationError),
    #[error("Malformed name of keyspace affected by schema change: {0}")]
    AffectedKeyspaceParseError(LowLevelDeserializationError),
    #[error("Malformed name of the object affected by schema change: {0}")]
    AffectedTargetNameParseError(LowLevelDeserializationError),
    #[error("Malformed arguments list of the function affected by schema change: {0}")]
    ArgumentsParseError(LowLevelDeserializationError),
    #[error("Unknown target of schema change: {0}")]
    UnknownTargetOfSchemaChange(String),
}

/// An error type returned when deserialization of TOPOLOGY_CHANGE or
/// STATUS_CHANGE event fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ClusterChangeEventParseError {
    #[error("Malformed type of change: {0}")]
    TypeOfChangeParseError(LowLevelDeserializationError),
    #[error("Malformed node address: {0}")]
    NodeAddressParseError(LowLevelDeserializationError),
    #[error("Unknown type of change: {0}")]
    UnknownTypeOfChange(String),
}

/// An error type returned when deserialization of RESULT response fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CqlResultParseError {
    #[error("Malformed RESULT response id: {0}")]
    ResultIdParseError(LowLevelDeserializationError),
    #[error("Unknown RESULT response id: {0}")]
    UnknownResultId(i32),
    #[error("RESULT:Set_keyspace response deserialization failed: {0}")]
    SetKeyspaceParseError(LowLevelDeserializationError),
    #[error("RESULT:Schema_change response deserialization failed: {0}")]
    SchemaChangeParseError(#[from] SchemaChangeEventParseError),
    #[error("RESULT:Prepared response deserialization failed: {0}")]
    PreparedParseError(#[from] PreparedParseError),
    #[error("RESULT:Rows response deserialization failed: {0}")]
    RawRowsParseError(#[from] RowsParseError),
}

/// An error that occurred while deserializing the metadata of a RESULT:Rows
/// or RESULT:Prepared response.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ResultMetadataParseError {
    #[error("Malformed metadata flags: {0}")]
    FlagsParseError(LowLevelDeserializationError),
    #[error("Malformed column count: {0}")]
    ColumnCountParseError(LowLevelDeserializationError),
    #[error("Malformed paging state: {0}")]
    PagingStateParseError(LowLevelDeserializationError),
    #[error("Malformed global table spec: {0}")]
    GlobalTableSpecParseError(LowLevelDeserializationError),
    #[error("Malformed column spec at index {column_index}: {err}")]
    ColumnSpecParseError {
        column_index: usize,
        err: LowLevelDeserializationError,
    },
    #[error("Unsupported column type id {type_id} at index {column_index}")]
    UnsupportedColumnType { column_index: usize, type_id: u16 },
    #[error("Malformed partition key count: {0}")]
    PkCountParseError(LowLevelDeserializationError),
    #[error("Malformed partition key index: {0}")]
    PkIndexParseError(LowLevelDeserializationError),
}

/// An error type returned when deserialization of RESULT:Prepared response fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum PreparedParseError {
    #[error("Malformed prepared statement's id: {0}")]
    IdParseError(LowLevelDeserializationError),
    #[error("Invalid bind metadata: {0}")]
    BindMetadataParseError(ResultMetadataParseError),
    #[error("Invalid result metadata: {0}")]
    ResultMetadataParseError(ResultMetadataParseError),
}

/// An error type returned when deserialization of RESULT:Rows response fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RowsParseError {
    #[error("Invalid result metadata: {0}")]
    ResultMetadataParseError(#[from] ResultMetadataParseError),
    #[error("Malformed rows count: {0}")]
    RowsCountParseError(LowLevelDeserializationError),
    #[error("Malformed cell in row {row_index}, column {column_index}: {err}")]
    CellParseError {
        row_index: usize,
        column_index: usize,
        err: LowLevelDeserializationError,
    },
}

/// A low level deserialization error.
///
/// This type of error is returned when deserialization
/// of some primitive value fails.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum LowLevelDeserializationError {
    #[error(transparent)]
    IoError(Arc<std::io::Error>),
    #[error(transparent)]
    TryFromIntError(#[from] std::num::TryFromIntError),
    #[error(transparent)]
    TryFromSliceError(#[from] std::array::TryFromSliceError),
    #[error("Not enough bytes! expected: {expected}, received: {received}")]
    TooFewBytesReceived { expected: usize, received: usize },
    #[error("Invalid value length: {0}")]
    InvalidValueLength(i32),
    #[error("Unknown consistency: {0}")]
    UnknownConsistency(#[from] TryFromPrimitiveError<u16>),
    #[error("Invalid inet bytes length: {0}. Accepted lengths are 4 and 16 bytes.")]
    InvalidInetLength(u8),
    #[error("UTF8 deserialization failed: {0}")]
    UTF8DeserializationError(#[from] std::str::Utf8Error),
}

impl From<std::io::Error> for LowLevelDeserializationError {
    fn from(value: std::io::Error) -> Self {
        Self::IoError(Arc::new(value))
    }
}
