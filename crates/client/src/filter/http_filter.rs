use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use http::Method;
use tokio_util::codec::Encoder;
use tracing::{debug, trace, warn};

use super::{Filter, FilterContext, ResponseEvent, WriteCompletion};
use crate::codec::header::HeaderLimits;
use crate::codec::{RequestEncoder, ResponseParser};
use crate::config::ConnectorConfig;
use crate::protocol::body::BodyOutputStream;
use crate::protocol::{HttpRequest, RequestBody, TransportError};

/// Turns requests into bytes and bytes into responses.
///
/// Handles one exchange at a time: `send` resets the response parser, bytes
/// read afterwards are parsed into the response to that request. A streamed
/// request body is opened once its head has been written and writes into the
/// chain right below this filter.
#[derive(Debug)]
pub struct HttpFilter {
    parser: ResponseParser,
    encoder: RequestEncoder,
    read_buffer: BytesMut,
    in_flight: bool,
    head_delivered: bool,
    request_body: Option<BodyOutputStream>,
}

impl HttpFilter {
    pub fn new(limits: HeaderLimits) -> Self {
        Self {
            parser: ResponseParser::new(limits),
            encoder: RequestEncoder::new(),
            read_buffer: BytesMut::new(),
            in_flight: false,
            head_delivered: false,
            request_body: None,
        }
    }

    pub fn with_config(config: &ConnectorConfig) -> Self {
        Self::new(config.header_limits())
    }

    /// Reports the parser's progress upward: the head once, then completion.
    fn emit(&mut self, ctx: &mut FilterContext<'_>) {
        let Some(response) = self.parser.response() else {
            return;
        };
        if !self.head_delivered {
            self.head_delivered = true;
            ctx.on_response(ResponseEvent::Head(Arc::clone(&response)));
        }
        if self.parser.is_complete() {
            self.in_flight = false;
            self.request_body = None;
            if !self.read_buffer.is_empty() {
                warn!(len = self.read_buffer.len(), "discarding bytes received after the response");
                self.read_buffer.clear();
            }
            ctx.on_response(ResponseEvent::Complete(response));
        }
    }

    /// Ends the exchange in flight with `error`.
    fn fail(&mut self, ctx: &mut FilterContext<'_>, error: TransportError) {
        self.in_flight = false;
        self.parser.abort(error.clone());
        if let Some(body) = self.request_body.take() {
            let body_error = error.clone();
            ctx.defer(move || body.fail(body_error));
        }
        ctx.on_error(error);
    }
}

impl Default for HttpFilter {
    fn default() -> Self {
        Self::new(HeaderLimits::default())
    }
}

impl Filter for HttpFilter {
    fn send(&mut self, ctx: &mut FilterContext<'_>, request: HttpRequest, completion: WriteCompletion) {
        if self.in_flight {
            warn!("a request is already in flight on this connection");
            ctx.complete(completion, Err(TransportError::Closed));
            return;
        }

        let (parts, body) = request.into_parts();
        let payload_size = body.payload_size();
        let body_allowed = parts.method != Method::HEAD;
        debug!(method = %parts.method, uri = %parts.uri, ?payload_size, "sending request");

        let mut head = BytesMut::new();
        if let Err(e) = self.encoder.encode((parts, payload_size), &mut head) {
            let error = TransportError::from(e);
            if let RequestBody::Streaming(stream) = body {
                let body_error = error.clone();
                ctx.defer(move || stream.fail(body_error));
            }
            ctx.complete(completion, Err(error));
            return;
        }

        self.parser.reset(body_allowed);
        self.read_buffer.clear();
        self.in_flight = true;
        self.head_delivered = false;

        match body {
            RequestBody::Empty => ctx.write(head.freeze(), completion),
            RequestBody::Buffered(bytes) => {
                head.extend_from_slice(&bytes);
                ctx.write(head.freeze(), completion);
            }
            RequestBody::Streaming(stream) => {
                let writer = ctx.downstream_writer();
                let opened = stream.clone();
                self.request_body = Some(stream);
                ctx.write(
                    head.freeze(),
                    WriteCompletion::new(move |result| {
                        match &result {
                            Ok(()) => opened.open(Arc::new(writer)),
                            Err(e) => opened.fail(e.clone()),
                        }
                        completion.complete(result);
                    }),
                );
            }
        }
    }

    fn close(&mut self, ctx: &mut FilterContext<'_>) {
        if self.in_flight {
            debug!("closing with a request in flight");
            self.in_flight = false;
            self.parser.abort(TransportError::Closed);
            if let Some(body) = self.request_body.take() {
                ctx.defer(move || body.fail(TransportError::Closed));
            }
        }
        ctx.close();
    }

    fn on_read(&mut self, ctx: &mut FilterContext<'_>, data: Bytes) {
        if !self.in_flight {
            warn!(len = data.len(), "discarding bytes received with no request in flight");
            return;
        }

        trace!(len = data.len(), "parsing response bytes");
        self.read_buffer.extend_from_slice(&data);
        match self.parser.parse(&mut self.read_buffer) {
            Ok(()) => self.emit(ctx),
            Err(e) => self.fail(ctx, e.into()),
        }
    }

    fn on_connection_closed(&mut self, ctx: &mut FilterContext<'_>) {
        if self.in_flight {
            match self.parser.on_connection_closed(&mut self.read_buffer) {
                Ok(()) if self.parser.is_complete() => self.emit(ctx),
                Ok(()) => self.fail(ctx, TransportError::ConnectionClosed),
                Err(e) => self.fail(ctx, e),
            }
        }
        ctx.on_connection_closed();
    }

    fn on_error(&mut self, ctx: &mut FilterContext<'_>, error: TransportError) {
        if self.in_flight {
            self.fail(ctx, error);
        } else {
            ctx.on_error(error);
        }
    }
}
