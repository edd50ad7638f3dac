use crate::protocol::{PayloadItem, SendError};
use bytes::{Buf, BytesMut};
use tokio_util::codec::Encoder;

/// Writes a body of a declared Content-Length as is.
///
/// Writing more than declared, or finishing with bytes still missing, is an
/// error: the peer would otherwise misread the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthEncoder {
    length: u64,
    eof: bool,
}

impl LengthEncoder {
    pub fn new(length: u64) -> Self {
        Self { length, eof: false }
    }

    pub fn is_finish(&self) -> bool {
        self.eof
    }

    pub fn remaining(&self) -> u64 {
        self.length
    }
}

impl<D: Buf> Encoder<PayloadItem<D>> for LengthEncoder {
    type Error = SendError;

    fn encode(&mut self, item: PayloadItem<D>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            PayloadItem::Chunk(mut bytes) => {
                let size = bytes.remaining() as u64;
                if size > self.length {
                    return Err(SendError::invalid_body(format!(
                        "body exceeds content-length, {size} bytes written with {} remaining",
                        self.length
                    )));
                }
                while bytes.has_remaining() {
                    let chunk = bytes.chunk();
                    let len = chunk.len();
                    dst.extend_from_slice(chunk);
                    bytes.advance(len);
                }
                self.length -= size;
                Ok(())
            }
            PayloadItem::Eof => {
                if self.length > 0 {
                    return Err(SendError::invalid_body(format!("body ended with {} bytes missing", self.length)));
                }
                self.eof = true;
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
    fn enforces_declared_length() {
        let mut encoder = LengthEncoder::new(5);
        let mut dst = BytesMut::new();

        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"abc")), &mut dst).unwrap();
        assert!(encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"def")), &mut dst).is_err());
        assert!(encoder.encode(PayloadItem::<Bytes>::Eof, &mut dst).is_err());

        encoder.encode(PayloadItem::Chunk(Bytes::from_static(b"de")), &mut dst).unwrap();
        encoder.encode(PayloadItem::<Bytes>::Eof, &mut dst).unwrap();

        assert_eq!(&dst[..], b"abcde");
        assert!(encoder.is_finish());
    }
}
