//! Notations of the native protocol body: `[int]`, `[short]`, `[string]`,
//! `[bytes]`, `[inet]`, `[consistency]` and the collections built of them.
//!
//! Readers advance the `&[u8]` they are given past what they consumed.
//! Writers fail only when a length does not fit its prefix.

use super::frame_errors::LowLevelDeserializationError;
use super::TryFromPrimitiveError;
use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, Bytes};
use std::collections::HashMap;
use std::convert::{TryFrom, TryInto};
use std::net::{IpAddr, SocketAddr};
use std::num::TryFromIntError;
use std::str;
use thiserror::Error;
use uuid::Uuid;

/// Consistency level of a request.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum Consistency {
    Any = 0x0000,
    One = 0x0001,
    Two = 0x0002,
    Three = 0x0003,
    Quorum = 0x0004,
    All = 0x0005,
    #[default]
    LocalQuorum = 0x0006,
    EachQuorum = 0x0007,
    // Only meaningful for the Paxos phase, or for a SELECT that should
    // read through it.
    Serial = 0x0008,
    LocalSerial = 0x0009,
    LocalOne = 0x000A,
}

impl Consistency {
    const ALL: [Consistency; 11] = [
        Consistency::Any,
        Consistency::One,
        Consistency::Two,
        Consistency::Three,
        Consistency::Quorum,
        Consistency::All,
        Consistency::LocalQuorum,
        Consistency::EachQuorum,
        Consistency::Serial,
        Consistency::LocalSerial,
        Consistency::LocalOne,
    ];

    pub fn is_serial(&self) -> bool {
        matches!(self, Consistency::Serial | Consistency::LocalSerial)
    }
}

impl TryFrom<u16> for Consistency {
    type Error = TryFromPrimitiveError<u16>;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Consistency::ALL
            .into_iter()
            .find(|c| *c as u16 == value)
            .ok_or(TryFromPrimitiveError {
                enum_name: "Consistency",
                primitive: value,
            })
    }
}

impl std::fmt::Display for Consistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Consistency level used for the Paxos phase of lightweight transactions.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u16)]
pub enum SerialConsistency {
    Serial = Consistency::Serial as u16,
    LocalSerial = Consistency::LocalSerial as u16,
}

impl std::fmt::Display for SerialConsistency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Error)]
#[error("{0} is not a serial consistency")]
pub struct NonSerialConsistencyError(Consistency);

impl TryFrom<Consistency> for SerialConsistency {
    type Error = NonSerialConsistencyError;

    fn try_from(c: Consistency) -> Result<Self, Self::Error> {
        match c {
            Consistency::Serial => Ok(SerialConsistency::Serial),
            Consistency::LocalSerial => Ok(SerialConsistency::LocalSerial),
            other => Err(NonSerialConsistencyError(other)),
        }
    }
}

/// A `[value]`: bytes, null, or the "unset" marker of bound values.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RawValue<'a> {
    Null,
    Unset,
    Value(&'a [u8]),
}

pub(crate) fn read_raw_bytes<'a>(
    count: usize,
    buf: &mut &'a [u8],
) -> Result<&'a [u8], LowLevelDeserializationError> {
    if buf.len() < count {
        return Err(LowLevelDeserializationError::TooFewBytesReceived {
            expected: count,
            received: buf.len(),
        });
    }
    let (taken, rest) = buf.split_at(count);
    *buf = rest;
    Ok(taken)
}

pub fn read_int(buf: &mut &[u8]) -> Result<i32, LowLevelDeserializationError> {
    Ok(buf.read_i32::<BigEndian>()?)
}

pub fn write_int(v: i32, buf: &mut impl BufMut) {
    buf.put_i32(v);
}

pub fn read_int_length(buf: &mut &[u8]) -> Result<usize, LowLevelDeserializationError> {
    Ok(read_int(buf)?.try_into()?)
}

pub(crate) fn write_int_length(v: usize, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_int(v.try_into()?, buf);
    Ok(())
}

pub fn read_long(buf: &mut &[u8]) -> Result<i64, LowLevelDeserializationError> {
    Ok(buf.read_i64::<BigEndian>()?)
}

pub fn write_long(v: i64, buf: &mut impl BufMut) {
    buf.put_i64(v);
}

pub fn read_short(buf: &mut &[u8]) -> Result<u16, LowLevelDeserializationError> {
    Ok(buf.read_u16::<BigEndian>()?)
}

pub fn write_short(v: u16, buf: &mut impl BufMut) {
    buf.put_u16(v);
}

pub(crate) fn read_short_length(buf: &mut &[u8]) -> Result<usize, LowLevelDeserializationError> {
    Ok(read_short(buf)?.into())
}

pub(crate) fn write_short_length(v: usize, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_short(v.try_into()?, buf);
    Ok(())
}

// `[bytes]` with a negative length is null.
pub fn read_bytes_opt<'a>(
    buf: &mut &'a [u8],
) -> Result<Option<&'a [u8]>, LowLevelDeserializationError> {
    match usize::try_from(read_int(buf)?) {
        Ok(len) => read_raw_bytes(len, buf).map(Some),
        Err(_) => Ok(None),
    }
}

/// `[bytes]` that must not be null.
pub fn read_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_int_length(buf)?;
    read_raw_bytes(len, buf)
}

pub fn read_value<'a>(buf: &mut &'a [u8]) -> Result<RawValue<'a>, LowLevelDeserializationError> {
    match read_int(buf)? {
        -1 => Ok(RawValue::Null),
        -2 => Ok(RawValue::Unset),
        len => match usize::try_from(len) {
            Ok(len) => read_raw_bytes(len, buf).map(RawValue::Value),
            Err(_) => Err(LowLevelDeserializationError::InvalidValueLength(len)),
        },
    }
}

pub fn read_short_bytes<'a>(buf: &mut &'a [u8]) -> Result<&'a [u8], LowLevelDeserializationError> {
    let len = read_short_length(buf)?;
    read_raw_bytes(len, buf)
}

pub fn write_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_int_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn write_bytes_opt(
    v: Option<impl AsRef<[u8]>>,
    buf: &mut impl BufMut,
) -> Result<(), TryFromIntError> {
    match v {
        Some(bytes) => write_bytes(bytes.as_ref(), buf),
        None => {
            write_int(-1, buf);
            Ok(())
        }
    }
}

pub fn write_short_bytes(v: &[u8], buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_short_length(v.len(), buf)?;
    buf.put_slice(v);
    Ok(())
}

pub fn read_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    Ok(str::from_utf8(read_short_bytes(buf)?)?)
}

pub fn write_string(v: &str, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_short_bytes(v.as_bytes(), buf)
}

pub fn read_long_string<'a>(buf: &mut &'a [u8]) -> Result<&'a str, LowLevelDeserializationError> {
    Ok(str::from_utf8(read_bytes(buf)?)?)
}

pub fn write_long_string(v: &str, buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_bytes(v.as_bytes(), buf)
}

// `[short] n` followed by n entries, each read by `entry`.
fn read_short_prefixed<T, C: FromIterator<T>>(
    buf: &mut &[u8],
    mut entry: impl FnMut(&mut &[u8]) -> Result<T, LowLevelDeserializationError>,
) -> Result<C, LowLevelDeserializationError> {
    let count = read_short_length(buf)?;
    (0..count).map(|_| entry(buf)).collect()
}

pub fn read_bytes_map(
    buf: &mut &[u8],
) -> Result<HashMap<String, Bytes>, LowLevelDeserializationError> {
    read_short_prefixed(buf, |buf| {
        let key = read_string(buf)?.to_owned();
        Ok((key, Bytes::copy_from_slice(read_bytes(buf)?)))
    })
}

pub fn read_string_map(
    buf: &mut &[u8],
) -> Result<HashMap<String, String>, LowLevelDeserializationError> {
    read_short_prefixed(buf, |buf| {
        let key = read_string(buf)?.to_owned();
        Ok((key, read_string(buf)?.to_owned()))
    })
}

pub fn write_string_map(
    v: &HashMap<impl AsRef<str>, impl AsRef<str>>,
    buf: &mut impl BufMut,
) -> Result<(), TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for (key, val) in v {
        write_string(key.as_ref(), buf)?;
        write_string(val.as_ref(), buf)?;
    }
    Ok(())
}

pub fn read_string_list(buf: &mut &[u8]) -> Result<Vec<String>, LowLevelDeserializationError> {
    read_short_prefixed(buf, |buf| Ok(read_string(buf)?.to_owned()))
}

pub fn write_string_list(v: &[String], buf: &mut impl BufMut) -> Result<(), TryFromIntError> {
    write_short_length(v.len(), buf)?;
    v.iter().try_for_each(|s| write_string(s, buf))
}

pub fn read_string_multimap(
    buf: &mut &[u8],
) -> Result<HashMap<String, Vec<String>>, LowLevelDeserializationError> {
    read_short_prefixed(buf, |buf| {
        let key = read_string(buf)?.to_owned();
        Ok((key, read_string_list(buf)?))
    })
}

pub fn write_string_multimap(
    v: &HashMap<String, Vec<String>>,
    buf: &mut impl BufMut,
) -> Result<(), TryFromIntError> {
    write_short_length(v.len(), buf)?;
    for (key, val) in v {
        write_string(key, buf)?;
        write_string_list(val, buf)?;
    }
    Ok(())
}

pub fn read_uuid(buf: &mut &[u8]) -> Result<Uuid, LowLevelDeserializationError> {
    let raw: [u8; 16] = read_raw_bytes(16, buf)?.try_into()?;
    Ok(Uuid::from_bytes(raw))
}

pub fn read_consistency(buf: &mut &[u8]) -> Result<Consistency, LowLevelDeserializationError> {
    Consistency::try_from(read_short(buf)?).map_err(LowLevelDeserializationError::UnknownConsistency)
}

pub fn write_consistency(c: Consistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

pub fn write_serial_consistency(c: SerialConsistency, buf: &mut impl BufMut) {
    write_short(c as u16, buf);
}

/// `[inet]`: a one byte address length, the address, then an `[int]` port.
pub fn read_inet(buf: &mut &[u8]) -> Result<SocketAddr, LowLevelDeserializationError> {
    let ip = match buf.read_u8()? {
        4 => IpAddr::from(<[u8; 4]>::try_from(read_raw_bytes(4, buf)?)?),
        16 => IpAddr::from(<[u8; 16]>::try_from(read_raw_bytes(16, buf)?)?),
        len => return Err(LowLevelDeserializationError::InvalidInetLength(len)),
    };
    let port = read_int(buf)?;
    Ok(SocketAddr::new(ip, port as u16))
}

pub fn write_inet(addr: SocketAddr, buf: &mut impl BufMut) {
    match addr.ip() {
        IpAddr::V4(ip) => {
            buf.put_u8(4);
            buf.put_slice(&ip.octets());
        }
        IpAddr::V6(ip) => {
            buf.put_u8(16);
            buf.put_slice(&ip.octets());
        }
    }
    write_int(addr.port().into(), buf)
}
