//! Decoder implementation for response bodies.
//!
//! [`PayloadDecoder`] picks the decoding strategy for the [`PayloadSize`]
//! derived from the response head:
//! - Content-Length based payloads
//! - Chunked transfer encoding
//! - Payloads delimited by the end of the connection
//! - Messages with no body

use crate::codec::body::chunked_decoder::ChunkedDecoder;
use crate::codec::body::length_decoder::LengthDecoder;
use crate::codec::header::HeaderLimits;
use crate::protocol::{ParseError, PayloadItem, PayloadSize};
use bytes::BytesMut;
use http::HeaderMap;
use tokio_util::codec::Decoder;

/// A unified decoder for response payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadDecoder {
    /// The specific decoding strategy to use
    kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Kind {
    /// Decode payload with a fixed content length
    Length(LengthDecoder),

    /// Decode payload using chunked transfer encoding
    Chunked(ChunkedDecoder),

    /// Everything until the peer closes the connection
    UntilClose,

    /// Handle messages with no body
    NoBody,
}

impl PayloadDecoder {
    /// Creates the decoder for a body of `size`, `limits` apply to chunked trailers.
    pub fn new(size: PayloadSize, limits: HeaderLimits) -> Self {
        let kind = match size {
            PayloadSize::Length(length) => Kind::Length(LengthDecoder::new(length)),
            PayloadSize::Chunked => Kind::Chunked(ChunkedDecoder::new(limits)),
            PayloadSize::UntilClose => Kind::UntilClose,
            PayloadSize::Empty => Kind::NoBody,
        };
        Self { kind }
    }

    pub fn empty() -> Self {
        Self { kind: Kind::NoBody }
    }

    pub fn chunked(limits: HeaderLimits) -> Self {
        Self { kind: Kind::Chunked(ChunkedDecoder::new(limits)) }
    }

    pub fn fix_length(size: u64) -> Self {
        Self { kind: Kind::Length(LengthDecoder::new(size)) }
    }

    pub fn until_close() -> Self {
        Self { kind: Kind::UntilClose }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self.kind, Kind::Chunked(_))
    }

    pub fn is_until_close(&self) -> bool {
        matches!(self.kind, Kind::UntilClose)
    }

    /// Whether a chunked body is waiting for its trailer section.
    pub fn in_trailers(&self) -> bool {
        match &self.kind {
            Kind::Chunked(decoder) => decoder.in_trailers(),
            _ => false,
        }
    }

    /// Takes the trailers of a completely decoded chunked body.
    pub fn take_trailers(&mut self) -> Option<HeaderMap> {
        match &mut self.kind {
            Kind::Chunked(decoder) => decoder.take_trailers(),
            _ => None,
        }
    }
}

impl Decoder for PayloadDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match &mut self.kind {
            Kind::Length(length_decoder) => length_decoder.decode(src),
            Kind::Chunked(chunked_decoder) => chunked_decoder.decode(src),
            Kind::UntilClose if src.is_empty() => Ok(None),
            Kind::UntilClose => Ok(Some(PayloadItem::Chunk(src.split().freeze()))),
            Kind::NoBody => Ok(Some(PayloadItem::Eof)),
        }
    }

    /// Called once the peer closed the connection.
    ///
    /// Only a body delimited by the close ends cleanly here, every other
    /// kind that still expects bytes is truncated.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.is_until_close() {
            return Ok(Some(if src.is_empty() { PayloadItem::Eof } else { PayloadItem::Chunk(src.split().freeze()) }));
        }

        match self.decode(src)? {
            Some(item) => Ok(Some(item)),
            None => Err(ParseError::invalid_body("connection closed before the body was complete")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn until_close_takes_everything() {
        let mut decoder = PayloadDecoder::until_close();
        let mut buffer = BytesMut::from("abc");

        assert_eq!(decoder.decode(&mut buffer).unwrap().unwrap().into_bytes().unwrap(), "abc");
        assert!(decoder.decode(&mut buffer).unwrap().is_none());

        buffer.extend_from_slice(b"def");
        assert_eq!(decoder.decode_eof(&mut buffer).unwrap().unwrap().into_bytes().unwrap(), "def");
        assert!(decoder.decode_eof(&mut buffer).unwrap().unwrap().is_eof());
    }

    #[test]
    fn truncated_length_fails_on_eof() {
        let mut decoder = PayloadDecoder::new(PayloadSize::Length(10), HeaderLimits::default());
        let mut buffer = BytesMut::from("abc");

        assert!(decoder.decode_eof(&mut buffer).unwrap().unwrap().is_chunk());
        assert!(matches!(decoder.decode_eof(&mut buffer), Err(ParseError::InvalidBody { .. })));
    }

    #[test]
    fn no_body_is_eof() {
        let mut decoder = PayloadDecoder::new(PayloadSize::Empty, HeaderLimits::default());
        assert!(decoder.decode(&mut BytesMut::new()).unwrap().unwrap().is_eof());
    }
}
