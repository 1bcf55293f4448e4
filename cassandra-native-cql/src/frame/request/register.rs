use crate::frame::{
    frame_errors::CqlRequestSerializationError,
    request::{RequestOpcode, SerializableRequest},
    server_event_type::EventType,
    types,
};

use super::{DeserializableRequest, RequestDeserializationError};

/// Asks the server to push events of the listed categories on this connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub event_types_to_register_for: Vec<EventType>,
}

impl SerializableRequest for Register {
    const OPCODE: RequestOpcode = RequestOpcode::Register;

    fn serialize(&self, buf: &mut Vec<u8>) -> Result<(), CqlRequestSerializationError> {
        let event_types_list = self
            .event_types_to_register_for
            .iter()
            .map(|event| event.to_string())
            .collect::<Vec<_>>();

        types::write_string_list(&event_types_list, buf)?;
        Ok(())
    }
}

impl DeserializableRequest for Register {
    fn deserialize(buf: &mut &[u8]) -> Result<Self, RequestDeserializationError> {
        let event_types_to_register_for = types::read_string_list(buf)?
            .into_iter()
            .map(|name| {
                name.parse::<EventType>()
                    .map_err(|_| RequestDeserializationError::UnknownEventType(name))
            })
            .collect::<Result<_, _>>()?;
        Ok(Self {
            event_types_to_register_for,
        })
    }
}
