use std::io;

use bytes::Bytes;
use cassandra_native_cql::frame::request::RequestOpcode;
use cassandra_native_cql::frame::response::ResponseOpcode;
use cassandra_native_cql::frame::{
    compress_append, read_body, Compression, FLAG_COMPRESSION, HEADER_SIZE, PROTOCOL_VERSION,
};
use tokio::io::{AsyncRead, AsyncReadExt};

pub(crate) struct RequestFrame {
    pub(crate) flags: u8,
    pub(crate) stream: i16,
    pub(crate) opcode: RequestOpcode,
    pub(crate) body: Bytes,
}

/// Reads one request frame. Returns `None` on a clean EOF between frames.
pub(crate) async fn read_request_frame(
    reader: &mut (impl AsyncRead + Unpin),
) -> io::Result<Option<RequestFrame>> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    if header[0] != PROTOCOL_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported request version byte {:#04x}", header[0]),
        ));
    }
    let flags = header[1];
    let stream = i16::from_be_bytes([header[2], header[3]]);
    let opcode = RequestOpcode::try_from(header[4]).map_err(io::Error::other)?;
    let length = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    let body = read_body(reader, length).await.map_err(io::Error::other)?;

    Ok(Some(RequestFrame {
        flags,
        stream,
        opcode,
        body,
    }))
}

/// Builds a complete response frame around an uncompressed body.
pub(crate) fn response_frame(
    stream: i16,
    opcode: ResponseOpcode,
    body: &[u8],
    compression: Option<Compression>,
) -> io::Result<Vec<u8>> {
    let mut data = vec![0u8; HEADER_SIZE];
    let mut flags = 0;
    match compression {
        Some(compression) => {
            flags |= FLAG_COMPRESSION;
            compress_append(body, compression, &mut data).map_err(io::Error::other)?;
        }
        None => data.extend_from_slice(body),
    }

    let length = u32::try_from(data.len() - HEADER_SIZE).map_err(io::Error::other)?;
    data[0] = 0x80 | PROTOCOL_VERSION;
    data[1] = flags;
    data[2..4].copy_from_slice(&stream.to_be_bytes());
    data[4] = opcode as u8;
    data[5..9].copy_from_slice(&length.to_be_bytes());
    Ok(data)
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use cassandra_native_cql::frame::read_response_frame;
    use cassandra_native_cql::frame::response::ResponseOpcode;

    use super::response_frame;

    #[tokio::test]
    async fn driver_reads_mock_frames() {
        let frame = response_frame(-1, ResponseOpcode::Event, b"body", None).unwrap();
        let (params, opcode, body) = read_response_frame(&mut &frame[..]).await.unwrap();
        assert_eq!(params.stream, -1);
        assert_eq!(opcode, ResponseOpcode::Event);
        assert_eq!(body, Bytes::from_static(b"body"));
    }
}
