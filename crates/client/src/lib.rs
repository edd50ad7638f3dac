//! An asynchronous micro HTTP/1.1 client transport
//!
//! This crate provides the moving parts below an HTTP client API: an
//! incremental response parser, a filter pipeline carrying bytes between the
//! application and a tokio socket, and body streams usable from blocking
//! threads as well as from listener callbacks.
//!
//! # Features
//!
//! - Incremental response parsing, independent of how the bytes are fragmented
//! - Content-length, chunked (with trailers) and read-until-close bodies
//! - Obsolete header line folding and comma separated header values
//! - Streaming request bodies, chunked or with a known length
//! - Synchronous and listener driven body streams
//! - Keep-alive connections with connect, response and idle timeouts
//!
//! # Example
//!
//! ```no_run
//! use std::io::Read;
//!
//! use http::Request;
//! use micro_http_client::config::ConnectorConfig;
//! use micro_http_client::connection::HttpConnection;
//! use micro_http_client::protocol::RequestBody;
//! use tracing::info;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut connection = HttpConnection::new("example.com:80", ConnectorConfig::default());
//!     connection.connect().await?;
//!
//!     let request = Request::get("http://example.com/").body(RequestBody::Empty)?;
//!     let response = connection.send(request).await?;
//!     info!(status = %response.status(), "received response head");
//!
//!     let body = response.body().clone();
//!     let text = tokio::task::spawn_blocking(move || {
//!         let mut text = String::new();
//!         (&body).read_to_string(&mut text).map(|_| text)
//!     })
//!     .await??;
//!     info!(len = text.len(), "received response body");
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! The crate is organized into several key modules:
//!
//! - [`connection`]: request/response lifecycle of one connection
//! - [`filter`]: the filter chain and the transport and HTTP filters
//! - [`codec`]: response parsing and request encoding
//! - [`protocol`]: messages, body streams and errors
//! - [`config`]: connection settings
//!
//! # Body Streaming
//!
//! A response body is handed out as soon as the response head is parsed and
//! fills up while the rest arrives. It is read either with blocking calls
//! (from a thread allowed to block) or by registering a
//! [`ReadListener`](protocol::body::ReadListener). Request bodies work the
//! same way in the other direction through
//! [`BodyOutputStream`](protocol::body::BodyOutputStream).
//!
//! # Error Handling
//!
//! - [`protocol::HttpError`]: Top-level error type
//! - [`protocol::ParseError`]: Malformed or oversized responses
//! - [`protocol::TransportError`]: Socket and connection failures
//! - [`protocol::UsageError`]: Misuse of a body stream
//!
//! # Limitations
//!
//! - HTTP/1.1 only, one request in flight per connection
//! - No TLS filter is provided; one can be placed in the chain with
//!   [`HttpConnection::with_filters`](connection::HttpConnection::with_filters)

pub mod codec;
pub mod config;
pub mod connection;
pub mod filter;
pub mod protocol;

mod utils;
pub(crate) use utils::ensure;
