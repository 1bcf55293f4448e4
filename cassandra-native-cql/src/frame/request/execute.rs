//! CQL protocol-level representation of a `EXECUTE` request.

use crate::frame::frame_errors::CqlRequestSerializationError;
use bytes::Bytes;

use crate::{
    frame::request::{RequestOpcode, SerializableRequest},
    frame::types,
};

use super::{query::QueryParameters, DeserializableRequest, RequestDeserializationError};

/// CQL protocol-level representation of an `EXECUTE` request,
/// used to execute a single prepared statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Execute {
    /// ID of the prepared statement to execute.
    pub id: Bytes,

    /// Various parameters controlling the execution of the statement.
    pub parameters: QueryParameters,
}

impl SerializableRequest for Execute {
    const OPCODE: RequestOpcode = RequestOpcode::Execute;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        types::write_short_bytes(&self.id[..], buf)?;
        self.parameters.serialize(buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Execute {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let id = types::read_short_bytes(buf)?.to_vec().into();
        let parameters = QueryParameters::deserialize(buf)?;

        Ok(Self { id, parameters })
    }
}
