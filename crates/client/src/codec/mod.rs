//! HTTP/1.1 codec for the client side of a connection
//!
//! This module turns response bytes into [`HttpResponse`](crate::protocol::HttpResponse)s
//! and requests into bytes. Everything here is incremental: input may arrive
//! in fragments of any size and partial input is kept until it can be used.
//!
//! # Architecture
//!
//! - Response handling:
//!   - [`ResponseParser`]: drives status line, header, body and trailer parsing
//!   - Header parsing via the [`header`] module
//!   - Payload decoding via the [`body`] module
//!
//! - Request handling:
//!   - [`RequestEncoder`]: serializes the request line and headers
//!   - Payload encoding via the [`body`] module
//!
//! # Example
//!
//! ```
//! use bytes::BytesMut;
//! use micro_http_client::codec::ResponseParser;
//!
//! let mut parser = ResponseParser::default();
//! parser.reset(true);
//!
//! let mut buffer = BytesMut::from("HTTP/1.1 204 No Content\r\n");
//! parser.parse(&mut buffer).unwrap();
//! assert!(!parser.is_header_parsed());
//!
//! buffer.extend_from_slice(b"\r\n");
//! parser.parse(&mut buffer).unwrap();
//! assert!(parser.is_complete());
//! ```

pub mod body;
pub mod header;
mod request_encoder;
mod response_parser;
mod window;

pub use request_encoder::RequestEncoder;
pub use response_parser::{ParserState, ResponseParser};
