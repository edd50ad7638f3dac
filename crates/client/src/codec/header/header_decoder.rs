//! Decoder for the status line and header section of a response
//!
//! The decoder is called again every time more bytes arrive. It never
//! consumes anything until the whole head is available, so a head split
//! across any number of reads decodes exactly like one received at once.
//!
//! Parsing itself is done by `httparse`, configured to accept obsolete line
//! folding and bare `LF` line endings. On top of it the decoder enforces the
//! configured [`HeaderLimits`] on every attempt, so an endless header section
//! or an endless single line is rejected before it is terminated.

use bytes::{Buf, BytesMut};
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Response, StatusCode, Version};
use httparse::{Error, Status};
use tokio_util::codec::Decoder;
use tracing::{trace, warn};

use super::{HeaderLimits, append_field};
use crate::codec::window::longest_line_within;
use crate::ensure;
use crate::protocol::{ParseError, PayloadSize, ReasonPhrase, ResponseHead};

/// Decoder for response heads implementing the [`Decoder`] trait.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderDecoder {
    limits: HeaderLimits,
    /// Bytes of the pending head already parsed without finding its end.
    scanned: usize,
    /// Start of the last, still unterminated, line of the pending head.
    line_start: usize,
}

impl HeaderDecoder {
    pub fn new(limits: HeaderLimits) -> Self {
        Self { limits, scanned: 0, line_start: 0 }
    }

    /// Forgets a partially received head.
    pub fn reset(&mut self) {
        self.scanned = 0;
        self.line_start = 0;
    }

    pub fn limits(&self) -> HeaderLimits {
        self.limits
    }
}

impl Decoder for HeaderDecoder {
    type Item = ResponseHead;
    type Error = ParseError;

    /// Attempts to decode a response head from `src`.
    ///
    /// Returns `Ok(None)` while the head is incomplete, leaving `src`
    /// untouched. On success the head bytes are consumed and `src` starts
    /// with the first byte of the body.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let HeaderLimits { max_header_size, max_line_size, max_header_count } = self.limits;

        // the head can only end with a new line terminator
        if self.scanned > 0 && self.scanned <= src.len() && !src[self.scanned..].contains(&b'\n') {
            self.scanned = src.len();
            ensure!(src.len() <= max_header_size, ParseError::too_large_header(src.len(), max_header_size));
            ensure!(longest_line_within(&src[self.line_start..], max_line_size), ParseError::line_too_long(max_line_size));
            return Ok(None);
        }

        let mut headers = vec![httparse::EMPTY_HEADER; max_header_count];
        let mut response = httparse::Response::new(&mut headers);
        let mut config = httparse::ParserConfig::default();
        config
            .allow_obsolete_multiline_headers_in_responses(true)
            .allow_multiple_spaces_in_response_status_delimiters(true);

        let parsed = config.parse_response(&mut response, src).map_err(|e| match e {
            Error::TooManyHeaders => ParseError::too_many_headers(max_header_count),
            Error::Version | Error::Status => ParseError::invalid_status_line(e),
            e => ParseError::invalid_header(e),
        })?;

        let head_size = match parsed {
            Status::Partial => {
                ensure!(src.len() <= max_header_size, ParseError::too_large_header(src.len(), max_header_size));
                ensure!(longest_line_within(src, max_line_size), ParseError::line_too_long(max_line_size));
                self.scanned = src.len();
                self.line_start = src.iter().rposition(|&b| b == b'\n').map_or(0, |lf| lf + 1);
                trace!(buffered = src.len(), "response head is incomplete");
                return Ok(None);
            }
            Status::Complete(head_size) => head_size,
        };
        self.reset();

        ensure!(head_size <= max_header_size, ParseError::too_large_header(head_size, max_header_size));
        ensure!(longest_line_within(&src[..head_size], max_line_size), ParseError::line_too_long(max_line_size));

        let version = match response.version {
            Some(0) => Version::HTTP_10,
            Some(1) => Version::HTTP_11,
            v => return Err(ParseError::invalid_status_line(format!("unsupported version {v:?}"))),
        };

        let code = response.code.unwrap_or_default();
        let status =
            StatusCode::from_u16(code).map_err(|e| ParseError::invalid_status_line(format!("status {code}: {e}")))?;

        let mut header_map = HeaderMap::with_capacity(response.headers.len());
        for header in response.headers.iter() {
            append_field(&mut header_map, header.name, header.value)?;
        }

        let mut head = Response::new(());
        *head.status_mut() = status;
        *head.version_mut() = version;
        *head.headers_mut() = header_map;
        head.extensions_mut().insert(ReasonPhrase::new(response.reason.unwrap_or_default()));

        trace!(head_size, status = status.as_u16(), headers = head.headers().len(), "decoded response head");
        src.advance(head_size);
        Ok(Some(head))
    }
}

/// Determines how the body following `head` is delimited.
///
/// Responses to `HEAD`, informational responses, `204` and `304` never have
/// a body. A chunked transfer coding wins over `Content-Length`. Without any
/// length indicator the body runs until the connection closes.
pub(crate) fn parse_payload(head: &ResponseHead, body_allowed: bool) -> Result<PayloadSize, ParseError> {
    let status = head.status();
    if !body_allowed
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Ok(PayloadSize::new_empty());
    }

    let headers = head.headers();

    // refer: https://www.rfc-editor.org/rfc/rfc9112.html#name-message-body-length
    if headers.contains_key(TRANSFER_ENCODING) {
        if headers.contains_key(CONTENT_LENGTH) {
            warn!("response carries both transfer-encoding and content-length, ignoring content-length");
        }
        return Ok(if is_chunked(headers) { PayloadSize::new_chunked() } else { PayloadSize::UntilClose });
    }

    let mut length = None;
    for value in headers.get_all(CONTENT_LENGTH) {
        let value = value.to_str().map_err(|_| ParseError::invalid_content_length("value is not visible ascii"))?;
        let parsed = value
            .trim()
            .parse::<u64>()
            .map_err(|_| ParseError::invalid_content_length(format!("value {value} is not u64")))?;
        match length {
            Some(previous) if previous != parsed => {
                return Err(ParseError::invalid_content_length(format!("conflicting values {previous} and {parsed}")));
            }
            _ => length = Some(parsed),
        }
    }

    Ok(match length {
        Some(0) => PayloadSize::new_empty(),
        Some(length) => PayloadSize::new_length(length),
        None => PayloadSize::UntilClose,
    })
}

/// Chunked must be the final transfer coding to delimit the body.
///
/// The values are already split on commas, so the final coding is the last
/// value of the last field.
fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .next_back()
        .is_some_and(|value| value.as_bytes().trim_ascii().eq_ignore_ascii_case(b"chunked"))
}
