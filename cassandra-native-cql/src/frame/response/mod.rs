//! Response bodies sent by the server, and the opcodes that identify them.

pub mod authenticate;
pub mod error;
pub mod event;
pub mod result;
pub mod supported;

use bytes::{BufMut, Bytes};

use crate::errors::CqlResponseKind;
use crate::frame::frame_errors::CqlResponseParseError;
pub use error::Error;
pub use supported::Supported;

use super::TryFromPrimitiveError;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ResponseOpcode {
    Error = 0x00,
    Ready = 0x02,
    Authenticate = 0x03,
    Supported = 0x06,
    Result = 0x08,
    Event = 0x0C,
    AuthChallenge = 0x0E,
    AuthSuccess = 0x10,
}

impl TryFrom<u8> for ResponseOpcode {
    type Error = TryFromPrimitiveError<u8>;

    fn try_from(value: u8) -> Result<Self, TryFromPrimitiveError<u8>> {
        match value {
            0x00 => Ok(Self::Error),
            0x02 => Ok(Self::Ready),
            0x03 => Ok(Self::Authenticate),
            0x06 => Ok(Self::Supported),
            0x08 => Ok(Self::Result),
            0x0C => Ok(Self::Event),
            0x0E => Ok(Self::AuthChallenge),
            0x10 => Ok(Self::AuthSuccess),
            _ => Err(TryFromPrimitiveError {
                enum_name: "ResponseOpcode",
                primitive: value,
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Response {
    Error(Error),
    Ready,
    Result(result::Result),
    Authenticate(authenticate::Authenticate),
    AuthSuccess(authenticate::AuthSuccess),
    AuthChallenge(authenticate::AuthChallenge),
    Supported(Supported),
    Event(event::Event),
}

impl Response {
    pub fn to_response_kind(&self) -> CqlResponseKind {
        match self {
            Response::Error(_) => CqlResponseKind::Error,
            Response::Ready => CqlResponseKind::Ready,
            Response::Result(_) => CqlResponseKind::Result,
            Response::Authenticate(_) => CqlResponseKind::Authenticate,
            Response::AuthSuccess(_) => CqlResponseKind::AuthSuccess,
            Response::AuthChallenge(_) => CqlResponseKind::AuthChallenge,
            Response::Supported(_) => CqlResponseKind::Supported,
            Response::Event(_) => CqlResponseKind::Event,
        }
    }

    pub fn opcode(&self) -> ResponseOpcode {
        match self {
            Response::Error(_) => ResponseOpcode::Error,
            Response::Ready => ResponseOpcode::Ready,
            Response::Result(_) => ResponseOpcode::Result,
            Response::Authenticate(_) => ResponseOpcode::Authenticate,
            Response::AuthSuccess(_) => ResponseOpcode::AuthSuccess,
            Response::AuthChallenge(_) => ResponseOpcode::AuthChallenge,
            Response::Supported(_) => ResponseOpcode::Supported,
            Response::Event(_) => ResponseOpcode::Event,
        }
    }

    /// Deserializes a response body (extensions already stripped).
    pub fn deserialize(
        opcode: ResponseOpcode,
        body: &Bytes,
    ) -> Result<Response, CqlResponseParseError> {
        let buf = &mut &body[..];
        let response = match opcode {
            ResponseOpcode::Error => Response::Error(Error::deserialize(buf)?),
            ResponseOpcode::Ready => Response::Ready,
            ResponseOpcode::Authenticate => {
                Response::Authenticate(authenticate::Authenticate::deserialize(buf)?)
            }
            ResponseOpcode::Supported => Response::Supported(Supported::deserialize(buf)?),
            ResponseOpcode::Result => Response::Result(result::deserialize(body)?),
            ResponseOpcode::Event => Response::Event(event::Event::deserialize(buf)?),
            ResponseOpcode::AuthChallenge => {
                Response::AuthChallenge(authenticate::AuthChallenge::deserialize(buf)?)
            }
            ResponseOpcode::AuthSuccess => {
                Response::AuthSuccess(authenticate::AuthSuccess::deserialize(buf)?)
            }
        };

        Ok(response)
    }

    /// Serializes the response body, as a server would.
    pub fn serialize(&self, buf: &mut impl BufMut) -> Result<(), std::num::TryFromIntError> {
        match self {
            Response::Error(err) => err.serialize(buf),
            Response::Ready => Ok(()),
            Response::Result(res) => res.serialize(buf),
            Response::Authenticate(auth) => auth.serialize(buf),
            Response::AuthSuccess(auth_succ) => auth_succ.serialize(buf),
            Response::AuthChallenge(auth_chal) => auth_chal.serialize(buf),
            Response::Supported(sup) => sup.serialize(buf),
            Response::Event(event) => event.serialize(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Response, ResponseOpcode};
    use crate::errors::CqlResponseKind;
    use crate::frame::frame_errors::CqlResponseParseError;
    use assert_matches::assert_matches;
    use bytes::Bytes;

    #[test]
    fn opcodes_are_recognised() {
        for raw in [0x00u8, 0x02, 0x03, 0x06, 0x08, 0x0C, 0x0E, 0x10] {
            let opcode = ResponseOpcode::try_from(raw).unwrap();
            assert_eq!(opcode as u8, raw);
        }
        assert!(ResponseOpcode::try_from(0x07).is_err());
    }

    #[test]
    fn truncated_body_reports_response_kind() {
        let err = Response::deserialize(ResponseOpcode::Supported, &Bytes::from_static(&[0, 1]))
            .unwrap_err();
        assert_matches!(err, CqlResponseParseError::CqlSupportedParseError(_));
        assert_eq!(err.to_response_kind(), CqlResponseKind::Supported);
    }
}
