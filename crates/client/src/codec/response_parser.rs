//! Incremental parser for one response at a time.
//!
//! [`ResponseParser`] drives the [`HeaderDecoder`] and the [`PayloadDecoder`]
//! over the bytes read from the connection. It keeps whatever it can't use
//! yet in the caller's buffer, so a response split across any number of
//! reads parses exactly like one delivered at once.
//!
//! ```text
//! Idle -> StatusLine -> Headers -> Body -> Trailers -> Complete
//!                             \__________________________/
//!                               no body (HEAD, 1xx, 204, 304, length 0)
//! ```
//!
//! Body bytes are pushed into the [`BodyInputStream`] of the current response
//! as soon as they are decoded.

use std::sync::Arc;

use bytes::BytesMut;
use http::HeaderMap;
use tokio_util::codec::Decoder;
use tracing::{debug, trace, warn};

use crate::codec::body::PayloadDecoder;
use crate::codec::header::{HeaderDecoder, HeaderLimits, parse_payload};
use crate::config::ConnectorConfig;
use crate::protocol::body::BodyInputStream;
use crate::protocol::{HttpResponse, ParseError, PayloadItem, ResponseHead, TransportError};

/// Where the parser is within the current response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserState {
    /// Reset and waiting for the first byte
    Idle,
    StatusLine,
    Headers,
    Body,
    Trailers,
    Complete,
}

/// Parses a sequence of responses, one per [`reset`](Self::reset).
#[derive(Debug)]
pub struct ResponseParser {
    header_decoder: HeaderDecoder,
    state: ParserState,
    body_allowed: bool,
    payload_decoder: Option<PayloadDecoder>,
    response: Option<Arc<HttpResponse>>,
    body: BodyInputStream,
    failed: bool,
}

impl ResponseParser {
    pub fn new(limits: HeaderLimits) -> Self {
        Self {
            header_decoder: HeaderDecoder::new(limits),
            state: ParserState::Idle,
            body_allowed: true,
            payload_decoder: None,
            response: None,
            body: BodyInputStream::new(),
            failed: false,
        }
    }

    pub fn with_config(config: &ConnectorConfig) -> Self {
        Self::new(config.header_limits())
    }

    /// Prepares the parser for the response to the next request.
    ///
    /// `body_allowed` is false for responses to `HEAD`, whose framing headers
    /// describe a body that is never sent.
    pub fn reset(&mut self, body_allowed: bool) {
        self.state = ParserState::Idle;
        self.header_decoder.reset();
        self.body_allowed = body_allowed;
        self.payload_decoder = None;
        self.response = None;
        self.body = BodyInputStream::new();
        self.failed = false;
    }

    pub fn state(&self) -> ParserState {
        self.state
    }

    /// Whether the status line and all headers have been parsed.
    pub fn is_header_parsed(&self) -> bool {
        matches!(self.state, ParserState::Body | ParserState::Trailers | ParserState::Complete)
    }

    pub fn is_complete(&self) -> bool {
        self.state == ParserState::Complete
    }

    /// The current response, available once the head has been parsed.
    pub fn response(&self) -> Option<Arc<HttpResponse>> {
        self.response.as_ref().map(Arc::clone)
    }

    /// The body stream of the current response.
    pub fn body(&self) -> &BodyInputStream {
        &self.body
    }

    /// Parses as much of `src` as possible.
    ///
    /// Consumed bytes are removed from `src`; an incomplete head or chunk
    /// frame stays in it until more bytes arrive. Bytes following a complete
    /// response are left untouched. A parse error fails the body stream too
    /// and is final for the current response.
    pub fn parse(&mut self, src: &mut BytesMut) -> Result<(), ParseError> {
        if self.failed {
            return Err(ParseError::invalid_body("response already failed"));
        }

        self.parse_inner(src).inspect_err(|e| {
            debug!(cause = %e, state = ?self.state, "response parse failed");
            self.fail(TransportError::from(e.clone()));
        })
    }

    fn parse_inner(&mut self, src: &mut BytesMut) -> Result<(), ParseError> {
        loop {
            match self.state {
                ParserState::Idle => {
                    if src.is_empty() {
                        return Ok(());
                    }
                    self.state = ParserState::StatusLine;
                }

                ParserState::StatusLine | ParserState::Headers => match self.header_decoder.decode(src)? {
                    Some(head) => self.on_head(head)?,
                    None => {
                        if src.contains(&b'\n') {
                            self.state = ParserState::Headers;
                        }
                        return Ok(());
                    }
                },

                ParserState::Body | ParserState::Trailers => {
                    let Some(decoder) = self.payload_decoder.as_mut() else {
                        return Err(ParseError::invalid_body("no payload decoder for the body"));
                    };
                    match decoder.decode(src)? {
                        Some(PayloadItem::Chunk(bytes)) => self.on_body_data(bytes),
                        Some(PayloadItem::Eof) => self.on_body_complete(),
                        None => {
                            if decoder.in_trailers() {
                                self.state = ParserState::Trailers;
                            }
                            return Ok(());
                        }
                    }
                }

                ParserState::Complete => return Ok(()),
            }
        }
    }

    fn on_head(&mut self, head: ResponseHead) -> Result<(), ParseError> {
        let payload_size = parse_payload(&head, self.body_allowed)?;
        trace!(status = head.status().as_u16(), ?payload_size, "parsed response head");

        self.response = Some(Arc::new(HttpResponse::new(head, self.body.clone())));

        if payload_size.is_empty() {
            self.on_body_complete();
        } else {
            self.payload_decoder = Some(PayloadDecoder::new(payload_size, self.header_decoder.limits()));
            self.state = ParserState::Body;
        }
        Ok(())
    }

    fn on_body_data(&mut self, bytes: bytes::Bytes) {
        trace!(len = bytes.len(), "parsed response body bytes");
        if let Err(e) = self.body.notify_data_available(bytes) {
            warn!(cause = %e, "body stream refused response bytes");
        }
    }

    fn on_body_complete(&mut self) {
        let trailers = self.payload_decoder.as_mut().and_then(PayloadDecoder::take_trailers);
        if let Some(response) = &self.response {
            response.set_trailers(trailers.unwrap_or_else(HeaderMap::new));
        }
        if let Err(e) = self.body.notify_all_data_read() {
            warn!(cause = %e, "body stream was already finished");
        }
        self.state = ParserState::Complete;
    }

    /// The peer closed the connection.
    ///
    /// This completes a body delimited by the close. Any other response in
    /// progress is truncated and fails with [`TransportError::ConnectionClosed`].
    pub fn on_connection_closed(&mut self, src: &mut BytesMut) -> Result<(), TransportError> {
        match self.state {
            ParserState::Idle | ParserState::Complete => return Ok(()),
            _ if self.failed => return Ok(()),
            _ => {}
        }

        if let Some(decoder) = self.payload_decoder.as_mut().filter(|decoder| decoder.is_until_close()) {
            loop {
                match decoder.decode_eof(src) {
                    Ok(Some(PayloadItem::Chunk(bytes))) => {
                        if let Err(e) = self.body.notify_data_available(bytes) {
                            warn!(cause = %e, "body stream refused response bytes");
                        }
                    }
                    Ok(Some(PayloadItem::Eof) | None) => break,
                    Err(e) => {
                        let error = TransportError::from(e);
                        self.fail(error.clone());
                        return Err(error);
                    }
                }
            }
            self.on_body_complete();
            return Ok(());
        }

        debug!(state = ?self.state, "connection closed before the response was complete");
        self.fail(TransportError::ConnectionClosed);
        Err(TransportError::ConnectionClosed)
    }

    /// Fails the response in progress, e.g. after a transport failure.
    pub fn abort(&mut self, error: TransportError) {
        match self.state {
            ParserState::Idle | ParserState::Complete => {}
            _ => self.fail(error),
        }
    }

    fn fail(&mut self, error: TransportError) {
        if self.failed {
            return;
        }
        self.failed = true;
        // the body may already be finished when a trailing byte is malformed
        let _ = self.body.notify_error(error);
    }
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self::new(HeaderLimits::default())
    }
}
