//! The bidirectional filter pipeline a connection is built from.
//!
//! A [`FilterChain`] is an ordered list of [`Filter`]s, application side
//! first. Requests and raw bytes travel *down* the chain towards the socket,
//! socket events travel *up* towards the application:
//!
//! ```text
//!   application  <- ChainEvent channel
//!       |  ^
//!   HttpFilter        encodes requests, parses responses
//!       |  ^
//!   (TLS / custom)    byte transforms
//!       |  ^
//!   TransportFilter   tokio stream
//! ```
//!
//! Every hook of [`Filter`] forwards its event unchanged by default, so a
//! filter only implements the directions it transforms.

mod chain;
mod completion;
mod http_filter;
mod transport;

pub use chain::{ChainHandle, ChainWriter, FilterChain, FilterContext};
pub use completion::WriteCompletion;
pub use http_filter::HttpFilter;
pub use transport::{AsyncStream, TransportFilter};

use std::sync::Arc;

use bytes::Bytes;

use crate::protocol::{HttpRequest, HttpResponse, TransportError};

/// One stage of a [`FilterChain`].
///
/// Hooks are called with the chain's dispatch lock held, one at a time, and
/// must not block. Events raised through the [`FilterContext`] are queued and
/// delivered after the hook returns.
pub trait Filter: Send {
    /// Opens the transport to `addr` (`host:port`).
    fn connect(&mut self, ctx: &mut FilterContext<'_>, addr: String) {
        ctx.connect(addr);
    }

    fn write(&mut self, ctx: &mut FilterContext<'_>, data: Bytes, completion: WriteCompletion) {
        ctx.write(data, completion);
    }

    /// Sends a whole request. The completion reports when its head (and a
    /// buffered body) has been written.
    fn send(&mut self, ctx: &mut FilterContext<'_>, request: HttpRequest, completion: WriteCompletion) {
        ctx.send(request, completion);
    }

    fn close(&mut self, ctx: &mut FilterContext<'_>) {
        ctx.close();
    }

    fn on_connect(&mut self, ctx: &mut FilterContext<'_>) {
        ctx.on_connect();
    }

    fn on_read(&mut self, ctx: &mut FilterContext<'_>, data: Bytes) {
        ctx.on_read(data);
    }

    fn on_response(&mut self, ctx: &mut FilterContext<'_>, event: ResponseEvent) {
        ctx.on_response(event);
    }

    fn on_connection_closed(&mut self, ctx: &mut FilterContext<'_>) {
        ctx.on_connection_closed();
    }

    fn on_error(&mut self, ctx: &mut FilterContext<'_>, error: TransportError) {
        ctx.on_error(error);
    }
}

/// The write side of a chain position, as seen by the body output stream.
pub trait DownstreamWriter: Send + Sync {
    fn write(&self, data: Bytes, completion: WriteCompletion);
}

/// Progress of the response to the request in flight.
#[derive(Debug, Clone)]
pub enum ResponseEvent {
    /// The status line and headers were parsed; the body may still be arriving.
    Head(Arc<HttpResponse>),
    /// The whole response, trailers included, was parsed.
    Complete(Arc<HttpResponse>),
}

/// Events leaving the top of the chain.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    Connected,
    Read(Bytes),
    Response(ResponseEvent),
    ConnectionClosed,
    Error(TransportError),
}
