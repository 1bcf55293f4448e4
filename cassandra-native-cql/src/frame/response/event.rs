//! CQL protocol-level representation of an `EVENT` response.

use crate::frame::frame_errors::{
    ClusterChangeEventParseError, CqlEventParseError, SchemaChangeEventParseError,
};
use crate::frame::server_event_type::EventType;
use crate::frame::types;
use bytes::BufMut;
use std::net::SocketAddr;

/// Event that the server notified the client about.
#[derive(Debug, Clone, PartialEq, Eq)]
// Check triggers because all variants end with "Change".
#[allow(clippy::enum_variant_names)]
pub enum Event {
    /// Topology changed.
    TopologyChange(TopologyChangeEvent),
    /// Status of a node changed.
    StatusChange(StatusChangeEvent),
    /// Schema changed.
    SchemaChange(SchemaChangeEvent),
}

/// Event that notifies about changes in the cluster topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyChangeEvent {
    /// A new node was added to the cluster.
    NewNode(SocketAddr),
    /// A node was removed from the cluster.
    RemovedNode(SocketAddr),
    /// A node moved to a different position in the token ring.
    MovedNode(SocketAddr),
}

/// Event that notifies about changes in the nodes' status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChangeEvent {
    /// A node went up.
    Up(SocketAddr),
    /// A node went down.
    Down(SocketAddr),
}

/// Event that notifies about changes in the schema. Also used as the body
/// of a RESULT:Schema_change response.
#[derive(Debug, Clone, PartialEq, Eq)]
// Check triggers because all variants end with "Change".
#[allow(clippy::enum_variant_names)]
pub enum SchemaChangeEvent {
    /// Keyspace was altered.
    KeyspaceChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
    },
    /// Table was altered.
    TableChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        object_name: String,
    },
    /// Type was altered.
    TypeChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        type_name: String,
    },
    /// Function was altered.
    FunctionChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        function_name: String,
        arguments: Vec<String>,
    },
    /// Aggregate was altered.
    AggregateChange {
        change_type: SchemaChangeType,
        keyspace_name: String,
        aggregate_name: String,
        arguments: Vec<String>,
    },
}

/// Type of change that was made to the schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaChangeType {
    /// The affected schema item was created.
    Created,
    /// The affected schema item was updated.
    Updated,
    /// The affected schema item was dropped.
    Dropped,
    /// A placeholder for an invalid schema change type.
    Invalid,
}

impl SchemaChangeType {
    fn as_str(&self) -> &'static str {
        match self {
            SchemaChangeType::Created => "CREATED",
            SchemaChangeType::Updated => "UPDATED",
            SchemaChangeType::Dropped => "DROPPED",
            SchemaChangeType::Invalid => "INVALID",
        }
    }
}

impl Event {
    /// Deserialize an event from the provided buffer.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, CqlEventParseError> {
        let event_type: EventType = types::read_string(buf)
            .map_err(CqlEventParseError::EventTypeParseError)?
            .parse()?;
        match event_type {
            EventType::TopologyChange => Ok(Self::TopologyChange(
                TopologyChangeEvent::deserialize(buf)
                    .map_err(CqlEventParseError::TopologyChangeEventParseError)?,
            )),
            EventType::StatusChange => Ok(Self::StatusChange(
                StatusChangeEvent::deserialize(buf)
                    .map_err(CqlEventParseError::StatusChangeEventParseError)?,
            )),
            EventType::SchemaChange => Ok(Self::SchemaChange(SchemaChangeEvent::deserialize(buf)?)),
        }
    }

    /// The category this event belongs to.
    pub fn event_type(&self) -> EventType {
        match self {
            Event::TopologyChange(_) => EventType::TopologyChange,
            Event::StatusChange(_) => EventType::StatusChange,
            Event::SchemaChange(_) => EventType::SchemaChange,
        }
    }

    /// Serializes the event body, as a server would push it.
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
        types::write_string(&self.event_type().to_string(), buf)?;
        match self {
            Event::TopologyChange(change) => {
                let (type_of_change, addr) = match change {
                    TopologyChangeEvent::NewNode(addr) => ("NEW_NODE", addr),
                    TopologyChangeEvent::RemovedNode(addr) => ("REMOVED_NODE", addr),
                    TopologyChangeEvent::MovedNode(addr) => ("MOVED_NODE", addr),
                };
                types::write_string(type_of_change, buf)?;
                types::write_inet(*addr, buf);
            }
            Event::StatusChange(change) => {
                let (type_of_change, addr) = match change {
                    StatusChangeEvent::Up(addr) => ("UP", addr),
                    StatusChangeEvent::Down(addr) => ("DOWN", addr),
                };
                types::write_string(type_of_change, buf)?;
                types::write_inet(*addr, buf);
            }
            Event::SchemaChange(change) => change.serialize(buf)?,
        }
        Ok(())
    }
}

impl SchemaChangeEvent {
    /// Deserialize a schema change event from the provided buffer.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, SchemaChangeEventParseError> {
        let type_of_change_string =
            types::read_string(buf).map_err(SchemaChangeEventParseError::TypeOfChangeParseError)?;
        let type_of_change = match type_of_change_string {
            "CREATED" => SchemaChangeType::Created,
            "UPDATED" => SchemaChangeType::Updated,
            "DROPPED" => SchemaChangeType::Dropped,
            _ => SchemaChangeType::Invalid,
        };

        let target =
            types::read_string(buf).map_err(SchemaChangeEventParseError::TargetTypeParseError)?;
        let keyspace_affected = types::read_string(buf)
            .map_err(SchemaChangeEventParseError::AffectedKeyspaceParseError)?
            .to_string();

        let read_name = |buf: &mut &[u8]| {
            types::read_string(buf)
                .map(str::to_string)
                .map_err(SchemaChangeEventParseError::AffectedTargetNameParseError)
        };

        match target {
            "KEYSPACE" => Ok(Self::KeyspaceChange {
                change_type: type_of_change,
                keyspace_name: keyspace_affected,
            }),
            "TABLE" => Ok(Self::TableChange {
                change_type: type_of_change,
                keyspace_name: keyspace_affected,
                object_name: read_name(buf)?,
            }),
            "TYPE" => Ok(Self::TypeChange {
                change_type: type_of_change,
                keyspace_name: keyspace_affected,
                type_name: read_name(buf)?,
            }),
            "FUNCTION" => Ok(Self::FunctionChange {
                change_type: type_of_change,
                keyspace_name: keyspace_affected,
                function_name: read_name(buf)?,
                arguments: types::read_string_list(buf)
                    .map_err(SchemaChangeEventParseError::ArgumentsParseError)?,
            }),
            "AGGREGATE" => Ok(Self::AggregateChange {
                change_type: type_of_change,
                keyspace_name: keyspace_affected,
                aggregate_name: read_name(buf)?,
                arguments: types::read_string_list(buf)
                    .map_err(SchemaChangeEventParseError::ArgumentsParseError)?,
            }),
            _ => Err(SchemaChangeEventParseError::UnknownTargetOfSchemaChange(
                target.to_string(),
            )),
        }
    }

    /// Serializes the schema change body.
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
        match self {
            SchemaChangeEvent::KeyspaceChange {
                change_type,
                keyspace_name,
            } => {
                types::write_string(change_type.as_str(), buf)?;
                types::write_string("KEYSPACE", buf)?;
                types::write_string(keyspace_name, buf)?;
            }
            SchemaChangeEvent::TableChange {
                change_type,
                keyspace_name,
                object_name,
            } => {
                types::write_string(change_type.as_str(), buf)?;
                types::write_string("TABLE", buf)?;
                types::write_string(keyspace_name, buf)?;
                types::write_string(object_name, buf)?;
            }
            SchemaChangeEvent::TypeChange {
                change_type,
                keyspace_name,
                type_name,
            } => {
                types::write_string(change_type.as_str(), buf)?;
                types::write_string("TYPE", buf)?;
                types::write_string(keyspace_name, buf)?;
                types::write_string(type_name, buf)?;
            }
            SchemaChangeEvent::FunctionChange {
                change_type,
                keyspace_name,
                function_name: name,
                arguments,
            }
            | SchemaChangeEvent::AggregateChange {
                change_type,
                keyspace_name,
                aggregate_name: name,
                arguments,
            } => {
                let target = match self {
                    SchemaChangeEvent::FunctionChange { .. } => "FUNCTION",
                    _ => "AGGREGATE",
                };
                types::write_string(change_type.as_str(), buf)?;
                types::write_string(target, buf)?;
                types::write_string(keyspace_name, buf)?;
                types::write_string(name, buf)?;
                types::write_string_list(arguments, buf)?;
            }
        }
        Ok(())
    }
}

impl TopologyChangeEvent {
    /// Deserialize a topology change event from the provided buffer.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ClusterChangeEventParseError> {
        let type_of_change = types::read_string(buf)
            .map_err(ClusterChangeEventParseError::TypeOfChangeParseError)?;
        let addr =
            types::read_inet(buf).map_err(ClusterChangeEventParseError::NodeAddressParseError)?;

        match type_of_change {
            "NEW_NODE" => Ok(Self::NewNode(addr)),
            "REMOVED_NODE" => Ok(Self::RemovedNode(addr)),
            "MOVED_NODE" => Ok(Self::MovedNode(addr)),
            _ => Err(ClusterChangeEventParseError::UnknownTypeOfChange(
                type_of_change.to_string(),
            )),
        }
    }
}

impl StatusChangeEvent {
    /// Deserialize a status change event from the provided buffer.
    pub fn deserialize(buf: &mut &[u8]) -> Result<Self, ClusterChangeEventParseError> {
        let type_of_change = types::read_string(buf)
            .map_err(ClusterChangeEventParseError::TypeOfChangeParseError)?;
        let addr =
            types::read_inet(buf).map_err(ClusterChangeEventParseError::NodeAddressParseError)?;

        match type_of_change {
            "UP" => Ok(Self::Up(addr)),
            "DOWN" => Ok(Self::Down(addr)),
            _ => Err(ClusterChangeEventParseError::UnknownTypeOfChange(
                type_of_change.to_string(),
            )),
        }
    }
}
