use crate::protocol::{PayloadItem, SendError};
use bytes::{Buf, BufMut, BytesMut};
use std::io::Write;

use tokio_util::codec::Encoder;

/// Frames request body data with chunked transfer encoding.
///
/// Empty chunks are skipped, a zero sized chunk would end the body early.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedEncoder {
    eof: bool,
    send_size: u64,
}

impl ChunkedEncoder {
    pub fn new() -> Self {
        Self { eof: false, send_size: 0 }
    }

    pub fn is_finish(&self) -> bool {
        self.eof
    }

    /// Total number of payload bytes framed so far.
    pub fn send_size(&self) -> u64 {
        self.send_size
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for ChunkedEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if self.eof {
            return Err(SendError::invalid_body("chunked body already finished"));
        }

        match item {
            PayloadItem::Chunk(mut bytes) => {
                let size = bytes.remaining();
                if size == 0 {
                    return Ok(());
                }
                write!(dst.writer(), "{size:X}\r\n")?;
                dst.reserve(size + 2);
                while bytes.has_remaining() {
                    let chunk = bytes.chunk();
                    let len = chunk.len();
                    dst.extend_from_slice(chunk);
                    bytes.advance(len);
                }
                dst.extend_from_slice(b"\r\n");
                self.send_size += size as u64;
                Ok(())
            }
            PayloadItem::Eof => {
                self.eof = true;
                dst.extend_from_slice(b"0\r\n\r\n");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn frames_chunks_and_end() {
        let mut encoder = ChunkedEncoder::new();
        let mut dst = BytesMut::new();

        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"hello world, hello")), &mut dst).unwrap();
        encoder.encode(PayloadItem::Chunk(Bytes::new()), &mut dst).unwrap();
        encoder.encode(PayloadItem::<Bytes>::Eof, &mut dst).unwrap();

        assert_eq!(&dst[..], b"12\r\nhello world, hello\r\n0\r\n\r\n");
        assert!(encoder.is_finish());
        assert_eq!(encoder.send_size(), 18);

        let result = encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"late")), &mut dst);
        assert!(matches!(result, Err(SendError::InvalidBody { .. })));
    }
}
