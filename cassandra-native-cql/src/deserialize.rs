//! Conversion of raw cells into Rust values.

use bytes::Bytes;
use thiserror::Error;
use uuid::Uuid;

/// An error that occurred while converting a cell into a Rust value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum DeserializationError {
    #[error("Expected a non-null value for {rust_name}, got null")]
    UnexpectedNull { rust_name: &'static str },
    #[error("Expected {expected} bytes for {rust_name}, got {got}")]
    ByteLengthMismatch {
        rust_name: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("Cell is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("Column index {index} is out of range, the row has {column_count} columns")]
    ColumnIndexOutOfRange { index: usize, column_count: usize },
}

/// A type that a single cell can be converted into.
pub trait DeserializeValue: Sized {
    fn deserialize(cell: Option<&[u8]>) -> Result<Self, DeserializationError>;
}

fn ensure_not_null<T>(cell: Option<&[u8]>) -> Result<&[u8], DeserializationError> {
    cell.ok_or(DeserializationError::UnexpectedNull {
        rust_name: std::any::type_name::<T>(),
    })
}

fn ensure_exact_length<T, const N: usize>(
    cell: Option<&[u8]>,
) -> Result<[u8; N], DeserializationError> {
    let val = ensure_not_null::<T>(cell)?;
    val.try_into()
        .map_err(|_| DeserializationError::ByteLengthMismatch {
            rust_name: std::any::type_name::<T>(),
            expected: N,
            got: val.len(),
        })
}

impl DeserializeValue for i32 {
    fn deserialize(cell: Option<&[u8]>) -> Result<Self, DeserializationError> {
        ensure_exact_length::<Self, 4>(cell).map(i32::from_be_bytes)
    }
}

impl DeserializeValue for i64 {
    fn deserialize(cell: Option<&[u8]>) -> Result<Self, DeserializationError> {
        ensure_exact_length::<Self, 8>(cell).map(i64::from_be_bytes)
    }
}

impl DeserializeValue for bool {
    fn deserialize(cell: Option<&[u8]>) -> Result<Self, DeserializationError> {
        ensure_exact_length::<Self, 1>(cell).map(|[b]| b != 0)
    }
}

impl DeserializeValue for String {
    fn deserialize(cell: Option<&[u8]>) -> Result<Self, DeserializationError> {
        let val = ensure_not_null::<Self>(cell)?;
        Ok(std::str::from_utf8(val)?.to_owned())
    }
}

impl DeserializeValue for Uuid {
    fn deserialize(cell: Option<&[u8]>) -> Result<Self, DeserializationError> {
        ensure_exact_length::<Self, 16>(cell).map(Uuid::from_bytes)
    }
}

impl DeserializeValue for Bytes {
    fn deserialize(cell: Option<&[u8]>) -> Result<Self, DeserializationError> {
        ensure_not_null::<Self>(cell).map(Bytes::copy_from_slice)
    }
}

impl DeserializeValue for Vec<u8> {
    fn deserialize(cell: Option<&[u8]>) -> Result<Self, DeserializationError> {
        ensure_not_null::<Self>(cell).map(<[u8]>::to_vec)
    }
}

impl<T: DeserializeValue> DeserializeValue for Option<T> {
    fn deserialize(cell: Option<&[u8]>) -> Result<Self, DeserializationError> {
        cell.map(|val| T::deserialize(Some(val))).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::{DeserializationError, DeserializeValue};
    use assert_matches::assert_matches;
    use uuid::Uuid;

    #[test]
    fn fixed_size_values() {
        assert_eq!(i32::deserialize(Some(&[0, 0, 1, 0])).unwrap(), 256);
        assert_eq!(i64::deserialize(Some(&(-3i64).to_be_bytes())).unwrap(), -3);
        assert!(bool::deserialize(Some(&[1])).unwrap());

        let id = Uuid::new_v4();
        assert_eq!(Uuid::deserialize(Some(id.as_bytes())).unwrap(), id);
    }

    #[test]
    fn wrong_length_is_rejected() {
        assert_matches!(
            i32::deserialize(Some(&[0, 1])),
            Err(DeserializationError::ByteLengthMismatch {
                expected: 4,
                got: 2,
                ..
            })
        );
    }

    #[test]
    fn null_handling() {
        assert_matches!(
            String::deserialize(None),
            Err(DeserializationError::UnexpectedNull { .. })
        );
        assert_eq!(Option::<String>::deserialize(None).unwrap(), None);
        assert_eq!(
            Option::<String>::deserialize(Some(b"x")).unwrap(),
            Some("x".to_owned())
        );
    }
}
