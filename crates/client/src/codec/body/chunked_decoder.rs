//! Decoder implementation for HTTP chunked transfer encoding.
//!
//! This module decodes response bodies that use chunked transfer encoding as
//! specified in [RFC 9112 Section 7.1](https://www.rfc-editor.org/rfc/rfc9112#section-7.1).
//!
//! The decoder is lenient where real servers are sloppy: whitespace around
//! the chunk size is skipped, bare `LF` is accepted wherever `CRLF` is
//! expected, and chunk extensions are ignored. The trailer section after the
//! last chunk is parsed with the same field grammar as the header section and
//! can be taken with [`ChunkedDecoder::take_trailers`].

use std::task::Poll;

use bytes::{Buf, Bytes, BytesMut};
use http::HeaderMap;
use tokio_util::codec::Decoder;
use tracing::trace;
use ChunkedState::*;

use crate::codec::header::{HeaderLimits, decode_trailers};
use crate::protocol::{ParseError, PayloadItem};

/// A decoder for handling HTTP chunked transfer encoding.
///
/// The decoder processes incoming bytes according to the chunked format:
/// - Each chunk starts with its size in hexadecimal
/// - Followed by optional extensions and a line terminator
/// - Then the chunk data and a line terminator
/// - A zero-sized chunk is followed by the trailer section and ends the body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkedDecoder {
    state: ChunkedState,
    remaining_size: u64,
    size_digits: usize,
    limits: HeaderLimits,
    trailers: Option<HeaderMap>,
}

impl ChunkedDecoder {
    /// Creates a new decoder, ready to read the size of the first chunk.
    ///
    /// `limits` apply to the trailer section.
    pub fn new(limits: HeaderLimits) -> Self {
        Self { state: Size, remaining_size: 0, size_digits: 0, limits, trailers: None }
    }

    /// Whether the last chunk was read and the trailer section is pending.
    pub fn in_trailers(&self) -> bool {
        self.state == Trailers
    }

    /// Takes the trailers once the body has been decoded completely.
    pub fn take_trailers(&mut self) -> Option<HeaderMap> {
        self.trailers.take()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    /// Read the chunk size in hex, skipping leading whitespace
    Size,
    /// Handle whitespace after size
    SizeLws,
    /// Skip chunk extensions
    Extension,
    /// Read LF after chunk size
    SizeLf,
    /// Read chunk data
    Body,
    /// Read CR after chunk data
    BodyCr,
    /// Read LF after chunk data
    BodyLf,
    /// Read the trailer section after the last chunk
    Trailers,
    /// Final state after reading the trailer section
    End,
}

impl Decoder for ChunkedDecoder {
    type Item = PayloadItem;
    type Error = ParseError;

    /// Decodes chunked transfer encoded data from the input buffer.
    ///
    /// # Returns
    /// - `Ok(Some(PayloadItem::Chunk(bytes)))` when chunk data is available
    /// - `Ok(Some(PayloadItem::Eof))` once the trailer section has been read
    /// - `Ok(None)` when more data is needed
    /// - `Err(ParseError)` if the chunked encoding is invalid
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if self.state == End {
                trace!("finished reading chunked data");
                return Ok(Some(PayloadItem::Eof));
            }

            if src.is_empty() {
                // need more data
                return Ok(None);
            }

            let mut buf = None;

            self.state = match self.step(src, &mut buf) {
                Poll::Pending => return Ok(None),
                Poll::Ready(Ok(new_state)) => new_state,
                Poll::Ready(Err(e)) => return Err(e),
            };

            if let Some(bytes) = buf {
                trace!(len = bytes.len(), "read chunked bytes");
                return Ok(Some(PayloadItem::Chunk(bytes)));
            }
        }
    }
}

macro_rules! try_next_byte {
    ($src:ident) => {{
        if $src.len() > 0 {
            $src.get_u8()
        } else {
            return Poll::Pending;
        }
    }};
}

impl ChunkedDecoder {
    /// Processes the next step in the chunked decoding state machine.
    fn step(&mut self, src: &mut BytesMut, buf: &mut Option<Bytes>) -> Poll<Result<ChunkedState, ParseError>> {
        match self.state {
            Size => self.read_size(src),
            SizeLws => self.read_size_lws(src),
            Extension => self.read_extension(src),
            SizeLf => self.read_size_lf(src),
            Body => self.read_body(src, buf),
            BodyCr => Self::read_body_cr(src),
            BodyLf => Self::read_body_lf(src),
            Trailers => self.read_trailers(src),
            End => Poll::Ready(Ok(End)),
        }
    }

    /// Reads the chunk size in hexadecimal, one digit at a time.
    ///
    /// # State Transitions
    /// - On hex digit: Stay in Size state to read more digits
    /// - On whitespace before any digit: Stay in Size state
    /// - On whitespace after digits: Transition to SizeLws state
    /// - On semicolon: Transition to Extension state
    /// - On CR: Transition to SizeLf state
    /// - On LF: Finish the size line
    fn read_size(&mut self, src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        let b = try_next_byte!(src);

        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b + 10 - b'a',
            b'A'..=b'F' => b + 10 - b'A',
            b'\t' | b' ' if self.size_digits == 0 => return Poll::Ready(Ok(Size)),
            _ if self.size_digits == 0 => {
                return Poll::Ready(Err(ParseError::invalid_chunk(format!("missing chunk size, found byte {b:#04x}"))));
            }
            b'\t' | b' ' => return Poll::Ready(Ok(SizeLws)),
            b';' => return Poll::Ready(Ok(Extension)),
            b'\r' => return Poll::Ready(Ok(SizeLf)),
            b'\n' => return Poll::Ready(Ok(self.finish_size_line())),
            _ => return Poll::Ready(Err(ParseError::invalid_chunk(format!("invalid chunk size byte {b:#04x}")))),
        };

        self.remaining_size = match self.remaining_size.checked_mul(16).and_then(|size| size.checked_add(u64::from(digit))) {
            Some(size) => size,
            None => return Poll::Ready(Err(ParseError::invalid_chunk("chunk size overflow"))),
        };
        self.size_digits += 1;

        Poll::Ready(Ok(Size))
    }

    /// Processes linear whitespace after the chunk size.
    ///
    /// No more digits may follow, only extensions or the end of the line.
    fn read_size_lws(&mut self, src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\t' | b' ' => Poll::Ready(Ok(SizeLws)),
            b';' => Poll::Ready(Ok(Extension)),
            b'\r' => Poll::Ready(Ok(SizeLf)),
            b'\n' => Poll::Ready(Ok(self.finish_size_line())),
            _ => Poll::Ready(Err(ParseError::invalid_chunk("invalid chunk size linear white space"))),
        }
    }

    /// Skips chunk extensions up to the end of the size line.
    fn read_extension(&mut self, src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(SizeLf)),
            b'\n' => Poll::Ready(Ok(self.finish_size_line())),
            _ => Poll::Ready(Ok(Extension)),
        }
    }

    /// Validates the LF byte after the chunk size line.
    fn read_size_lf(&mut self, src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\n' => Poll::Ready(Ok(self.finish_size_line())),
            _ => Poll::Ready(Err(ParseError::invalid_chunk("invalid chunk size LF"))),
        }
    }

    /// A zero sized chunk is the last one and is followed by the trailers.
    fn finish_size_line(&mut self) -> ChunkedState {
        self.size_digits = 0;
        if self.remaining_size == 0 { Trailers } else { Body }
    }

    /// Reads up to `remaining_size` bytes of chunk data.
    ///
    /// Partial chunk data is handed out as soon as it is available.
    fn read_body(&mut self, src: &mut BytesMut, buf: &mut Option<Bytes>) -> Poll<Result<ChunkedState, ParseError>> {
        if src.is_empty() {
            return Poll::Ready(Ok(Body));
        }

        if self.remaining_size == 0 {
            return Poll::Ready(Ok(BodyCr));
        }

        // cap remaining bytes at the max capacity of usize
        let remaining = usize::try_from(self.remaining_size).unwrap_or(usize::MAX);
        let read_size = std::cmp::min(remaining, src.len());

        self.remaining_size -= read_size as u64;
        *buf = Some(src.split_to(read_size).freeze());

        if self.remaining_size > 0 { Poll::Ready(Ok(Body)) } else { Poll::Ready(Ok(BodyCr)) }
    }

    /// Validates the line terminator after chunk data.
    fn read_body_cr(src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\r' => Poll::Ready(Ok(BodyLf)),
            b'\n' => Poll::Ready(Ok(Size)),
            _ => Poll::Ready(Err(ParseError::invalid_chunk("invalid chunk body CR"))),
        }
    }

    fn read_body_lf(src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match try_next_byte!(src) {
            b'\n' => Poll::Ready(Ok(Size)),
            _ => Poll::Ready(Err(ParseError::invalid_chunk("invalid chunk body LF"))),
        }
    }

    /// Reads the whole trailer section at once, or nothing.
    fn read_trailers(&mut self, src: &mut BytesMut) -> Poll<Result<ChunkedState, ParseError>> {
        match decode_trailers(src, self.limits) {
            Ok(Some(trailers)) => {
                self.trailers = Some(trailers);
                Poll::Ready(Ok(End))
            }
            Ok(None) => Poll::Pending,
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> ChunkedDecoder {
        ChunkedDecoder::new(HeaderLimits::default())
    }

    #[test]
    fn test_basic() {
        let mut buffer: BytesMut = BytesMut::from(&b"10\r\n1234567890abcdef\r\n0\r\n\r\n"[..]);
        let mut decoder = decoder();

        let item = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(item.is_chunk());
        assert_eq!(&item.as_bytes().unwrap()[..], b"1234567890abcdef");

        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
        assert!(decoder.take_trailers().unwrap().is_empty());
    }

    #[test]
    fn test_multiple_chunks() {
        let mut buffer: BytesMut = BytesMut::from(&b"5\r\nhello\r\n7\r\n, world\r\n0\r\n\r\n"[..]);
        let mut decoder = decoder();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::copy_from_slice(b"hello"));

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::copy_from_slice(b", world"));

        let eof = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(eof.is_eof());
    }

    #[test]
    fn test_chunks_with_extensions() {
        let mut buffer: BytesMut = BytesMut::from(&b"5;chunk-ext=value\r\nhello\r\n0;last\r\n\r\n"[..]);
        let mut decoder = decoder();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::copy_from_slice(b"hello"));

        let eof = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(eof.is_eof());
    }

    #[test]
    fn test_spaces_around_size() {
        let mut buffer: BytesMut = BytesMut::from(&b"  5  \r\nhello\r\n \t0\t\r\n\r\n"[..]);
        let mut decoder = decoder();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::copy_from_slice(b"hello"));
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }

    #[test]
    fn test_bare_lf() {
        let mut buffer: BytesMut = BytesMut::from(&b"5\nhello\n0\n\n"[..]);
        let mut decoder = decoder();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::copy_from_slice(b"hello"));
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
    }

    #[test]
    fn test_chunks_with_trailers() {
        let mut buffer: BytesMut = BytesMut::from(&b"5\r\nhello\r\n0\r\nTrailer: value\r\nX-Sum: 1, 2\r\n\r\n"[..]);
        let mut decoder = decoder();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::copy_from_slice(b"hello"));

        let eof = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(eof.is_eof());

        let trailers = decoder.take_trailers().unwrap();
        assert_eq!(trailers["trailer"], "value");
        assert_eq!(trailers.get_all("x-sum").iter().count(), 2);
    }

    #[test]
    fn test_trailers_in_fragments() {
        let mut buffer: BytesMut = BytesMut::from(&b"0\r\nTrail"[..]);
        let mut decoder = decoder();

        assert!(decoder.decode(&mut buffer).unwrap().is_none());
        assert!(decoder.in_trailers());

        buffer.extend_from_slice(b"er: value\r\n\r\n");
        assert!(decoder.decode(&mut buffer).unwrap().unwrap().is_eof());
        assert_eq!(decoder.take_trailers().unwrap()["trailer"], "value");
    }

    #[test]
    fn test_incomplete_chunk() {
        let mut buffer: BytesMut = BytesMut::from(&b"5\r\nhel"[..]);
        let mut decoder = decoder();

        // partial chunk data is returned right away
        let chunk = decoder.decode(&mut buffer).unwrap();
        assert_eq!(chunk.unwrap().as_bytes().unwrap(), &Bytes::copy_from_slice(b"hel"));

        buffer.extend_from_slice(b"lo\r\n0\r\n\r\n");

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::copy_from_slice(b"lo"));

        let eof = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(eof.is_eof());
    }

    #[test]
    fn test_invalid_chunk_size() {
        let mut buffer: BytesMut = BytesMut::from(&b"xyz\r\n"[..]);
        let result = decoder().decode(&mut buffer);
        assert!(matches!(result, Err(ParseError::InvalidChunk { .. })));

        let mut buffer: BytesMut = BytesMut::from(&b"\r\n"[..]);
        let result = decoder().decode(&mut buffer);
        assert!(matches!(result, Err(ParseError::InvalidChunk { .. })));

        let mut buffer: BytesMut = BytesMut::from(&b"1 2\r\n"[..]);
        let result = decoder().decode(&mut buffer);
        assert!(matches!(result, Err(ParseError::InvalidChunk { .. })));
    }

    #[test]
    fn test_size_overflow() {
        let mut buffer: BytesMut = BytesMut::from(&b"fffffffffffffffff\r\n"[..]);
        let result = decoder().decode(&mut buffer);
        assert!(matches!(result, Err(ParseError::InvalidChunk { .. })));
    }

    #[test]
    fn test_missing_crlf() {
        let mut buffer: BytesMut = BytesMut::from(&b"5\r\nhelloBad"[..]);
        let mut decoder = decoder();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap(), &Bytes::copy_from_slice(b"hello"));

        let result = decoder.decode(&mut buffer);
        assert!(result.is_err());
    }

    #[test]
    fn test_large_chunk() {
        let size = 1024 * 1024;
        let mut data = Vec::with_capacity(size + 16);
        data.extend(format!("{size:x}\r\n").into_bytes());
        data.extend(vec![b'A'; size]);
        data.extend(b"\r\n0\r\n\r\n");

        let mut buffer = BytesMut::from(&data[..]);
        let mut decoder = decoder();

        let chunk = decoder.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(chunk.as_bytes().unwrap().len(), size);
        assert!(chunk.as_bytes().unwrap().iter().all(|&b| b == b'A'));

        let eof = decoder.decode(&mut buffer).unwrap().unwrap();
        assert!(eof.is_eof());
    }

    #[test]
    fn test_byte_by_byte() {
        let input = b"4\r\nWiki\r\n5\r\npedia\r\n0\r\nExpires: never\r\n\r\n";
        let mut decoder = decoder();
        let mut buffer = BytesMut::new();
        let mut body = Vec::new();
        let mut eof = false;

        for &b in input {
            buffer.extend_from_slice(&[b]);
            while let Some(item) = decoder.decode(&mut buffer).unwrap() {
                match item {
                    PayloadItem::Chunk(bytes) => body.extend_from_slice(&bytes),
                    PayloadItem::Eof => {
                        eof = true;
                        break;
                    }
                }
            }
        }

        assert!(eof);
        assert_eq!(body, b"Wikipedia");
        assert_eq!(decoder.take_trailers().unwrap()["expires"], "never");
    }

    #[test]
    fn test_folded_trailer() {
        let input = b"0\r\nX-Trail: first\r\n   second\r\n\r\n";
        let mut decoder = decoder();
        let mut buffer = BytesMut::new();
        let mut eof = false;

        for fragment in input.chunks(3) {
            buffer.extend_from_slice(fragment);
            if let Some(item) = decoder.decode(&mut buffer).unwrap() {
                eof = item.is_eof();
            }
        }

        assert!(eof);
        assert_eq!(decoder.take_trailers().unwrap()["x-trail"], "first second");
    }
}
