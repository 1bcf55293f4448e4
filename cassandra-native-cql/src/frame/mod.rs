//! Framing of the native protocol v4: the 9-byte header, body extensions
//! and body compression.

pub mod frame_errors;
pub mod request;
pub mod response;
pub mod server_event_type;
pub mod types;

use bytes::{Buf, BufMut, Bytes};
use frame_errors::{
    CqlRequestSerializationError, FrameBodyExtensionsParseError, FrameHeaderParseError,
};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

use std::fmt::Display;
use std::{collections::HashMap, convert::TryFrom};

use request::SerializableRequest;
use response::ResponseOpcode;

/// Length of the frame header.
pub const HEADER_SIZE: usize = 9;

/// The only protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u8 = 0x04;

// Frame flags
/// The frame body is compressed with the negotiated algorithm.
pub const FLAG_COMPRESSION: u8 = 0x01;
/// Request tracing is enabled (requests) or a tracing id precedes the body (responses).
pub const FLAG_TRACING: u8 = 0x02;
/// A custom payload map precedes the body.
pub const FLAG_CUSTOM_PAYLOAD: u8 = 0x04;
/// A list of warnings precedes the body.
pub const FLAG_WARNING: u8 = 0x08;

/// Stream id used by the server for pushed events.
pub const EVENT_STREAM_ID: i16 = -1;

/// The wire protocol compression algorithm.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Compression {
    /// LZ4 compression algorithm.
    Lz4,
    /// Snappy compression algorithm.
    Snappy,
}

impl Compression {
    /// Name of the algorithm as used in STARTUP/SUPPORTED options.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::Lz4 => "lz4",
            Compression::Snappy => "snappy",
        }
    }
}

impl Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request serialized into a complete frame, waiting for its stream id.
pub struct SerializedRequest {
    data: Vec<u8>,
}

impl SerializedRequest {
    /// Serializes `req` into a frame. The stream id is left zeroed;
    /// it is filled in by [`SerializedRequest::set_stream`] once allocated.
    pub fn make<R: SerializableRequest>(
        req: &R,
        compression: Option<Compression>,
        tracing: bool,
    ) -> Result<SerializedRequest, CqlRequestSerializationError> {
        let mut flags = 0;
        let mut data = vec![0; HEADER_SIZE];

        if let Some(compression) = compression {
            flags |= FLAG_COMPRESSION;
            let body = req.to_bytes()?;
            compress_append(&body, compression, &mut data)?;
        } else {
            req.serialize(&mut data)?;
        }

        if tracing {
            flags |= FLAG_TRACING;
        }

        data[0] = PROTOCOL_VERSION;
        data[1] = flags;
        // Leave space for the stream number
        data[4] = R::OPCODE as u8;

        let req_size = (data.len() - HEADER_SIZE) as u32;
        data[5..9].copy_from_slice(&req_size.to_be_bytes());

        Ok(Self { data })
    }

    /// Writes the stream id into the header.
    pub fn set_stream(&mut self, stream: i16) {
        self.data[2..4].copy_from_slice(&stream.to_be_bytes());
    }

    /// The whole frame, header included.
    pub fn get_data(&self) -> &[u8] {
        &self.data[..]
    }
}

/// Parts of the frame header which are not determined by the request/response type.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameParams {
    pub version: u8,
    pub flags: u8,
    pub stream: i16,
}

impl Default for FrameParams {
    fn default() -> Self {
        Self {
            version: PROTOCOL_VERSION,
            flags: 0x00,
            stream: 0,
        }
    }
}

impl FrameParams {
    /// Header parameters of a frame answering the frame with these parameters.
    pub const fn for_response(&self) -> FrameParams {
        Self {
            version: 0x80 | (self.version & 0x7F),
            ..*self
        }
    }

    /// Header parameters of a request frame with these parameters.
    pub const fn for_request(&self) -> FrameParams {
        Self {
            version: self.version & 0x7F,
            ..*self
        }
    }
}

/// Reads one response frame: header first, then exactly `length` bytes of body.
pub async fn read_response_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> Result<(FrameParams, ResponseOpcode, Bytes), FrameHeaderParseError> {
    let mut raw_header = [0u8; HEADER_SIZE];
    reader
        .read_exact(&mut raw_header[..])
        .await
        .map_err(|err| FrameHeaderParseError::HeaderIoError(Arc::new(err)))?;

    let mut buf = &raw_header[..];

    let version = buf.get_u8();
    if version & 0x80 != 0x80 {
        return Err(FrameHeaderParseError::FrameFromClient);
    }
    if version & 0x7F != PROTOCOL_VERSION {
        return Err(FrameHeaderParseError::VersionNotSupported(version & 0x7f));
    }

    let flags = buf.get_u8();
    let stream = buf.get_i16();

    let frame_params = FrameParams {
        version,
        flags,
        stream,
    };

    let opcode = ResponseOpcode::try_from(buf.get_u8())?;

    // TODO: Guard from frames that are too large
    let length = buf.get_u32() as usize;
    let body = read_body(reader, length).await?;

    Ok((frame_params, opcode, body))
}

/// Reads `length` bytes of a frame body whose header has already been consumed.
pub async fn read_body(
    reader: &mut (impl AsyncRead + Unpin),
    length: usize,
) -> Result<Bytes, FrameHeaderParseError> {
    let mut raw_body = Vec::with_capacity(length).limit(length);
    while raw_body.has_remaining_mut() {
        let n = reader
            .read_buf(&mut raw_body)
            .await
            .map_err(|err| FrameHeaderParseError::BodyChunkIoError(Arc::new(err)))?;
        if n == 0 {
            // EOF, too early
            return Err(FrameHeaderParseError::ConnectionClosed(
                raw_body.remaining_mut(),
                length,
            ));
        }
    }

    Ok(raw_body.into_inner().into())
}

/// A response body with its extensions stripped off.
#[derive(Debug)]
pub struct ResponseBodyWithExtensions {
    pub trace_id: Option<Uuid>,
    pub warnings: Vec<String>,
    pub body: Bytes,
    pub custom_payload: Option<HashMap<String, Bytes>>,
}

/// Decompresses the body (if flagged) and strips the tracing id,
/// warnings and custom payload that precede it.
pub fn parse_response_body_extensions(
    flags: u8,
    compression: Option<Compression>,
    mut body: Bytes,
) -> Result<ResponseBodyWithExtensions, FrameBodyExtensionsParseError> {
    if flags & FLAG_COMPRESSION != 0 {
        if let Some(compression) = compression {
            body = decompress(&body, compression)?.into();
        } else {
            return Err(FrameBodyExtensionsParseError::NoCompressionNegotiated);
        }
    }

    let trace_id = if flags & FLAG_TRACING != 0 {
        let buf = &mut &*body;
        let trace_id =
            types::read_uuid(buf).map_err(FrameBodyExtensionsParseError::TraceIdParse)?;
        body.advance(16);
        Some(trace_id)
    } else {
        None
    };

    let warnings = if flags & FLAG_WARNING != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let warnings = types::read_string_list(buf)
            .map_err(FrameBodyExtensionsParseError::WarningsListParse)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        warnings
    } else {
        Vec::new()
    };

    let custom_payload = if flags & FLAG_CUSTOM_PAYLOAD != 0 {
        let body_len = body.len();
        let buf = &mut &*body;
        let payload_map = types::read_bytes_map(buf)
            .map_err(FrameBodyExtensionsParseError::CustomPayloadMapParse)?;
        let buf_len = buf.len();
        body.advance(body_len - buf_len);
        Some(payload_map)
    } else {
        None
    };

    Ok(ResponseBodyWithExtensions {
        trace_id,
        warnings,
        body,
        custom_payload,
    })
}

/// Compresses `uncomp_body` and appends the result to `out`.
pub fn compress_append(
    uncomp_body: &[u8],
    compression: Compression,
    out: &mut Vec<u8>,
) -> Result<(), CqlRequestSerializationError> {
    match compression {
        Compression::Lz4 => {
            let uncomp_len = uncomp_body.len() as u32;
            let tmp = lz4_flex::compress(uncomp_body);
            out.reserve_exact(std::mem::size_of::<u32>() + tmp.len());
            out.put_u32(uncomp_len);
            out.extend_from_slice(&tmp[..]);
            Ok(())
        }
        Compression::Snappy => {
            let old_size = out.len();
            out.resize(old_size + snap::raw::max_compress_len(uncomp_body.len()), 0);
            let compressed_size = snap::raw::Encoder::new()
                .compress(uncomp_body, &mut out[old_size..])
                .map_err(|_| CqlRequestSerializationError::SnapCompressError)?;
            out.truncate(old_size + compressed_size);
            Ok(())
        }
    }
}

/// Decompresses a body compressed with `compression`.
pub fn decompress(
    mut comp_body: &[u8],
    compression: Compression,
) -> Result<Vec<u8>, FrameBodyExtensionsParseError> {
    match compression {
        Compression::Lz4 => {
            if comp_body.len() < std::mem::size_of::<u32>() {
                return Err(FrameBodyExtensionsParseError::Lz4MissingLength);
            }
            let uncomp_len = comp_body.get_u32() as usize;
            let uncomp_body = lz4_flex::decompress(comp_body, uncomp_len)
                .map_err(|err| FrameBodyExtensionsParseError::Lz4DecompressError(Arc::new(err)))?;
            Ok(uncomp_body)
        }
        Compression::Snappy => snap::raw::Decoder::new()
            .decompress_vec(comp_body)
            .map_err(|_| FrameBodyExtensionsParseError::SnapDecompressError),
    }
}

/// An error type for parsing an enum value from a primitive.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No discriminant in enum `{enum_name}` matches the value `{primitive:?}`")]
pub struct TryFromPrimitiveError<T: Copy + std::fmt::Debug> {
    enum_name: &'static str,
    primitive: T,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::request::Options;

    #[test]
    fn test_lz4_compress() {
        let mut out = Vec::from(&b"Hello"[..]);
        let uncomp_body = b", World!";
        let compression = Compression::Lz4;
        let expect = vec![
            72, 101, 108, 108, 111, 0, 0, 0, 8, 128, 44, 32, 87, 111, 114, 108, 100, 33,
        ];

        compress_append(uncomp_body, compression, &mut out).unwrap();
        assert_eq!(expect, out);
    }

    #[test]
    fn test_lz4_decompress() {
        let mut comp_body = Vec::new();
        let uncomp_body = "Hello, World!".repeat(100);
        let compression = Compression::Lz4;
        compress_append(uncomp_body.as_bytes(), compression, &mut comp_body).unwrap();
        let result = decompress(&comp_body[..], compression).unwrap();
        assert_eq!(32, comp_body.len());
        assert_eq!(uncomp_body.as_bytes(), result);
    }

    #[test]
    fn test_snappy_decompress_garbage() {
        let result = decompress(&[0xff, 0xff, 0xff, 0xff, 0x0f], Compression::Snappy);
        assert!(matches!(
            result,
            Err(FrameBodyExtensionsParseError::SnapDecompressError)
        ));
    }

    #[test]
    fn serialized_request_header_layout() {
        let mut req = SerializedRequest::make(&Options, None, false).unwrap();
        req.set_stream(0x0102);
        assert_eq!(req.get_data(), &[0x04, 0x00, 0x01, 0x02, 0x05, 0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn read_response_frame_rejects_client_frames() {
        let raw = [0x04u8, 0, 0, 1, 0x02, 0, 0, 0, 0];
        let res = read_response_frame(&mut &raw[..]).await;
        assert!(matches!(res, Err(FrameHeaderParseError::FrameFromClient)));
    }

    #[tokio::test]
    async fn read_response_frame_reads_exact_body() {
        let raw = [0x84u8, 0, 0xff, 0xff, 0x0C, 0, 0, 0, 3, 1, 2, 3, 4, 5];
        let (params, opcode, body) = read_response_frame(&mut &raw[..]).await.unwrap();
        assert_eq!(params.stream, -1);
        assert_eq!(opcode, ResponseOpcode::Event);
        assert_eq!(&body[..], &[1, 2, 3]);
    }

    #[test]
    fn body_extensions_warnings_are_stripped() {
        let mut raw = Vec::new();
        types::write_string_list(&["careful".to_owned()], &mut raw).unwrap();
        raw.extend_from_slice(&[0xAA, 0xBB]);

        let parsed = parse_response_body_extensions(FLAG_WARNING, None, raw.into()).unwrap();
        assert_eq!(parsed.warnings, vec!["careful".to_owned()]);
        assert_eq!(&parsed.body[..], &[0xAA, 0xBB]);
        assert!(parsed.trace_id.is_none());
    }
}
