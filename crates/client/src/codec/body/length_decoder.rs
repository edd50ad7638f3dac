//! Decoder implementation for bodies delimited by Content-Length.
//!
//! See [RFC 9112 Section 6.2](https://www.rfc-editor.org/rfc/rfc9112#section-6.2).

use std::cmp;

use crate::protocol::{ParseError, PayloadItem};
use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// A decoder for bodies with a known content length.
///
/// Bytes beyond the declared length are left in the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LengthDecoder {
    /// The number of bytes remaining to be read from the payload
    length: u64,
}

impl LengthDecoder {
    pub fn new(length: u64) -> Self {
        Self { length }
    }

    pub fn remaining(&self) -> u64 {
        self.length
    }
}

impl Decoder for LengthDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    /// # Returns
    /// * `Ok(Some(PayloadItem::Eof))` when all bytes have been read
    /// * `Ok(Some(PayloadItem::Chunk(bytes)))` when some of the remaining bytes are available
    /// * `Ok(None)` when more data is needed
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.length == 0 {
            return Ok(Some(PayloadItem::Eof));
        }

        if src.is_empty() {
            return Ok(None);
        }

        // Read the minimum of remaining length and available bytes
        let len = cmp::min(self.length, src.len() as u64);
        let bytes = src.split_to(usize::try_from(len).unwrap_or(usize::MAX)).freeze();

        self.length -= bytes.len() as u64;
        Ok(Some(PayloadItem::Chunk(bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic() {
        let mut buffer: BytesMut = BytesMut::from(&b"101234567890abcdef\r\n\r\n"[..]);

        let mut length_decoder = LengthDecoder::new(10);
        let payload = length_decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(payload.is_chunk());

        let bytes = payload.as_bytes().unwrap();
        assert_eq!(&bytes[..], b"1012345678");
        assert_eq!(&buffer[..], b"90abcdef\r\n\r\n");

        assert!(length_decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }

    #[test]
    fn test_fragments() {
        let mut buffer = BytesMut::from(&b"12"[..]);
        let mut length_decoder = LengthDecoder::new(5);

        assert_eq!(&length_decoder.decode(&mut buffer).unwrap().unwrap().into_bytes().unwrap()[..], b"12");
        assert_eq!(length_decoder.remaining(), 3);
        assert!(length_decoder.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"345");
        assert_eq!(&length_decoder.decode(&mut buffer).unwrap().unwrap().into_bytes().unwrap()[..], b"345");
        assert!(length_decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }
}
