//! Serialization of values bound to a statement's markers.

use std::net::IpAddr;

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

use crate::frame::types;

/// An error that occurred while serializing bound values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum SerializationError {
    /// A single value is longer than the protocol allows.
    #[error("Value of type {rust_name} is too big to be sent in a request")]
    ValueOverflow { rust_name: &'static str },
    /// More values were bound than the protocol allows (u16::MAX).
    #[error("Too many values bound to a single statement")]
    TooManyValues,
}

/// Writes a single `[value]` into the request buffer.
///
/// The writer is consumed by exactly one of its setters, so an
/// implementation cannot leave a value half-written.
pub struct CellWriter<'buf> {
    buf: &'buf mut Vec<u8>,
}

impl<'buf> CellWriter<'buf> {
    pub fn new(buf: &'buf mut Vec<u8>) -> Self {
        Self { buf }
    }

    /// Writes a null value.
    pub fn set_null(self) {
        types::write_int(-1, self.buf);
    }

    /// Writes an unset value; the server leaves the column untouched.
    pub fn set_unset(self) {
        types::write_int(-2, self.buf);
    }

    /// Writes `contents` as a non-null value.
    pub fn set_value<T: ?Sized>(self, contents: &[u8]) -> Result<(), SerializationError> {
        types::write_bytes(contents, self.buf).map_err(|_| SerializationError::ValueOverflow {
            rust_name: std::any::type_name::<T>(),
        })
    }
}

/// A type that can be bound to a statement's marker.
pub trait SerializeValue {
    fn serialize(&self, writer: CellWriter<'_>) -> Result<(), SerializationError>;
}

macro_rules! impl_serialize_via_be_bytes {
    ($($t:ty),*) => {
        $(
            impl SerializeValue for $t {
                fn serialize(&self, writer: CellWriter<'_>) -> Result<(), SerializationError> {
                    writer.set_value::<$t>(&self.to_be_bytes())
                }
            }
        )*
    };
}

impl_serialize_via_be_bytes!(i8, i16, i32, i64, f32, f64);

impl SerializeValue for bool {
    fn serialize(&self, writer: CellWriter<'_>) -> Result<(), SerializationError> {
        writer.set_value::<bool>(&[u8::from(*self)])
    }
}

impl SerializeValue for str {
    fn serialize(&self, writer: CellWriter<'_>) -> Result<(), SerializationError> {
        writer.set_value::<str>(self.as_bytes())
    }
}

impl SerializeValue for String {
    fn serialize(&self, writer: CellWriter<'_>) -> Result<(), SerializationError> {
        writer.set_value::<String>(self.as_bytes())
    }
}

impl SerializeValue for [u8] {
    fn serialize(&self, writer: CellWriter<'_>) -> Result<(), SerializationError> {
        writer.set_value::<[u8]>(self)
    }
}

impl SerializeValue for Vec<u8> {
    fn serialize(&self, writer: CellWriter<'_>) -> Result<(), SerializationError> {
        writer.set_value::<Vec<u8>>(self)
    }
}

impl SerializeValue for Bytes {
    fn serialize(&self, writer: CellWriter<'_>) -> Result<(), SerializationError> {
        writer.set_value::<Bytes>(self)
    }
}

impl SerializeValue for Uuid {
    fn serialize(&self, writer: CellWriter<'_>) -> Result<(), SerializationError> {
        writer.set_value::<Uuid>(self.as_bytes())
    }
}

impl SerializeValue for IpAddr {
    fn serialize(&self, writer: CellWriter<'_>) -> Result<(), SerializationError> {
        match self {
            IpAddr::V4(v4) => writer.set_value::<IpAddr>(&v4.octets()),
            IpAddr::V6(v6) => writer.set_value::<IpAddr>(&v6.octets()),
        }
    }
}

impl<T: SerializeValue> SerializeValue for Option<T> {
    fn serialize(&self, writer: CellWriter<'_>) -> Result<(), SerializationError> {
        match self {
            Some(v) => v.serialize(writer),
            None => {
                writer.set_null();
                Ok(())
            }
        }
    }
}

impl<T: SerializeValue + ?Sized> SerializeValue for &T {
    fn serialize(&self, writer: CellWriter<'_>) -> Result<(), SerializationError> {
        T::serialize(*self, writer)
    }
}

/// Marks a bound value as unset: the column keeps whatever it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Unset;

impl SerializeValue for Unset {
    fn serialize(&self, writer: CellWriter<'_>) -> Result<(), SerializationError> {
        writer.set_unset();
        Ok(())
    }
}

/// Values bound to a statement, already in their wire form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SerializedValues {
    serialized_values: Vec<u8>,
    element_count: u16,
}

impl SerializedValues {
    /// Creates an empty value list.
    pub const fn new() -> Self {
        SerializedValues {
            serialized_values: Vec::new(),
            element_count: 0,
        }
    }

    /// Serializes and appends a single value.
    pub fn add_value<T: SerializeValue + ?Sized>(
        &mut self,
        val: &T,
    ) -> Result<(), SerializationError> {
        if self.element_count == u16::MAX {
            return Err(SerializationError::TooManyValues);
        }

        let len_before = self.serialized_values.len();
        if let Err(err) = val.serialize(CellWriter::new(&mut self.serialized_values)) {
            self.serialized_values.truncate(len_before);
            return Err(err);
        }
        self.element_count += 1;
        Ok(())
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.element_count == 0
    }

    #[inline]
    pub fn element_count(&self) -> u16 {
        self.element_count
    }

    /// Writes the `[short]` count followed by the values.
    pub fn write_to_request(&self, buf: &mut impl bytes::BufMut) {
        types::write_short(self.element_count, buf);
        buf.put_slice(&self.serialized_values);
    }

    /// Reads a value list as written by [`SerializedValues::write_to_request`].
    pub fn new_from_frame(
        buf: &mut &[u8],
    ) -> Result<Self, crate::frame::frame_errors::LowLevelDeserializationError> {
        let element_count = types::read_short(buf)?;
        let start = *buf;
        for _ in 0..element_count {
            types::read_value(buf)?;
        }
        let consumed = start.len() - buf.len();
        Ok(SerializedValues {
            serialized_values: start[..consumed].to_vec(),
            element_count,
        })
    }

    /// Iterates over the values as they appear on the wire.
    pub fn iter(&self) -> impl Iterator<Item = types::RawValue<'_>> {
        let mut buf = &self.serialized_values[..];
        (0..self.element_count).map_while(move |_| types::read_value(&mut buf).ok())
    }
}
