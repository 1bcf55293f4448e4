//! CQL requests sent by the client.

pub mod auth_response;
pub mod execute;
pub mod options;
pub mod prepare;
pub mod query;
pub mod register;
pub mod startup;

use thiserror::Error;

use crate::errors::CqlRequestKind;
use crate::Consistency;
use bytes::Bytes;

pub use auth_response::AuthResponse;
pub use execute::Execute;
pub use options::Options;
pub use prepare::Prepare;
pub use query::Query;
pub use register::Register;
pub use startup::Startup;

use super::frame_errors::{CqlRequestSerializationError, LowLevelDeserializationError};
use super::TryFromPrimitiveError;

/// Opcode of a request, used to identify the request type in a CQL frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum RequestOpcode {
    Startup = 0x01,
    Options = 0x05,
    Query = 0x07,
    Prepare = 0x09,
    Execute = 0x0A,
    Register = 0x0B,
    AuthResponse = 0x0F,
}

impl RequestOpcode {
    pub fn kind(&self) -> CqlRequestKind {
        match self {
            RequestOpcode::Startup => CqlRequestKind::Startup,
            RequestOpcode::Options => CqlRequestKind::Options,
            RequestOpcode::Query => CqlRequestKind::Query,
            RequestOpcode::Prepare => CqlRequestKind::Prepare,
            RequestOpcode::Execute => CqlRequestKind::Execute,
            RequestOpcode::Register => CqlRequestKind::Register,
            RequestOpcode::AuthResponse => CqlRequestKind::AuthResponse,
        }
    }
}

impl TryFrom<u8> for RequestOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Startup),
            0x05 => Ok(Self::Options),
            0x07 => Ok(Self::Query),
            0x09 => Ok(Self::Prepare),
            0x0A => Ok(Self::Execute),
            0x0B => Ok(Self::Register),
            0x0F => Ok(Self::AuthResponse),
            _ => Err(TryFromPrimitiveError {
                enum_name: "RequestOpcode",
                primitive: value,
            }),
        }
    }
}

/// Requests that can be serialized into a CQL frame.
pub trait SerializableRequest {
    const OPCODE: RequestOpcode;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError>;

    fn to_bytes(&self) -> Result<Bytes, CqlRequestSerializationError> {
        let mut v = Vec::new();
        self.serialize(&mut v)?;
        Ok(v.into())
    }
}

/// Requests that can be deserialized from a CQL frame.
///
/// The driver never reads requests; this exists for the mock server and
/// for tests asserting on what was sent.
pub trait DeserializableRequest: SerializableRequest + Sized {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError>;
}

/// An error type returned by [`DeserializableRequest::deserialize`].
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum RequestDeserializationError {
    #[error("Low level deser error: {0}")]
    LowLevelDeserialization(#[from] LowLevelDeserializationError),
    #[error("Specified flags are not recognised: {flags:02x}")]
    UnknownFlags { flags: u8 },
    #[error("Named values in frame are currently unsupported")]
    NamedValuesUnsupported,
    #[error("Expected SerialConsistency, got regular Consistency: {0}")]
    ExpectedSerialConsistency(Consistency),
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
}

/// A request as read by a server.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Request {
    Startup(Startup),
    Options,
    Query(Query),
    Prepare(Prepare),
    Execute(Execute),
    Register(Register),
    AuthResponse(AuthResponse),
}

impl Request {
    /// Deserializes the request body identified by `opcode`.
    pub fn deserialize(
        buf: &mut &[u8],
        opcode: RequestOpcode,
    ) -> Result<Self, RequestDeserializationError> {
        match opcode {
            RequestOpcode::Startup => Startup::deserialize(buf).map(Self::Startup),
            RequestOpcode::Options => Options::deserialize(buf).map(|_| Self::Options),
            RequestOpcode::Query => Query::deserialize(buf).map(Self::Query),
            RequestOpcode::Prepare => Prepare::deserialize(buf).map(Self::Prepare),
            RequestOpcode::Execute => Execute::deserialize(buf).map(Self::Execute),
            RequestOpcode::Register => Register::deserialize(buf).map(Self::Register),
            RequestOpcode::AuthResponse => AuthResponse::deserialize(buf).map(Self::AuthResponse),
        }
    }

    pub fn opcode(&self) -> RequestOpcode {
        match self {
            Request::Startup(_) => RequestOpcode::Startup,
            Request::Options => RequestOpcode::Options,
            Request::Query(_) => RequestOpcode::Query,
            Request::Prepare(_) => RequestOpcode::Prepare,
            Request::Execute(_) => RequestOpcode::Execute,
            Request::Register(_) => RequestOpcode::Register,
            Request::AuthResponse(_) => RequestOpcode::AuthResponse,
        }
    }

    /// Retrieves consistency from request frame, if present.
    pub fn get_consistency(&self) -> Option<Consistency> {
        match self {
            Request::Query(q) => Some(q.parameters.consistency),
            Request::Execute(e) => Some(e.parameters.consistency),
            _ => None,
        }
    }
}
