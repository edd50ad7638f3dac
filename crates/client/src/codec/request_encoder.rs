//! Encoder for request heads
//!
//! Serializes the request line and header fields, completing the framing
//! headers for the [`PayloadSize`] of the body that follows: a
//! `Content-Length` for known sizes, `Transfer-Encoding: chunked` otherwise.
//! A missing `Host` header is filled in from the request URI.

use crate::protocol::{PayloadSize, SendError};

use bytes::{BufMut, BytesMut};

use http::{HeaderValue, Method, Version, header, request};
use std::io::{self, ErrorKind, Write};
use tokio_util::codec::Encoder;
use tracing::error;

/// Initial buffer size allocated for header serialization
const INIT_HEADER_SIZE: usize = 4 * 1024;

const CHUNKED: HeaderValue = HeaderValue::from_static("chunked");

/// Encoder for request heads implementing the [`Encoder`] trait.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestEncoder;

impl RequestEncoder {
    pub fn new() -> Self {
        Self
    }
}

impl Encoder<(request::Parts, PayloadSize)> for RequestEncoder {
    type Error = SendError;

    /// Encodes the request head into `dst`.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - HTTP version is neither HTTP/1.0 nor HTTP/1.1
    /// - The URI has no authority and no `Host` header was given
    fn encode(&mut self, item: (request::Parts, PayloadSize), dst: &mut BytesMut) -> Result<(), Self::Error> {
        let (mut parts, payload_size) = item;

        let version = match parts.version {
            Version::HTTP_11 => "HTTP/1.1",
            Version::HTTP_10 => "HTTP/1.0",
            v => {
                error!(http_version = ?v, "unsupported http version");
                return Err(io::Error::from(ErrorKind::Unsupported).into());
            }
        };

        let target = parts.uri.path_and_query().map_or("/", |target| target.as_str());

        dst.reserve(INIT_HEADER_SIZE);
        write!(dst.writer(), "{} {target} {version}\r\n", parts.method)?;

        let headers = &mut parts.headers;

        if !headers.contains_key(header::HOST) {
            let authority = parts
                .uri
                .authority()
                .ok_or_else(|| SendError::invalid_body("request has neither a host header nor an absolute uri"))?;
            let host = match authority.port() {
                Some(port) => format!("{}:{}", authority.host(), port),
                None => authority.host().to_owned(),
            };
            let host = HeaderValue::from_str(&host).map_err(|e| SendError::invalid_body(format!("host: {e}")))?;
            headers.insert(header::HOST, host);
        }

        // Set appropriate content length or transfer encoding header
        match payload_size {
            PayloadSize::Length(n) => {
                headers.remove(header::TRANSFER_ENCODING);
                headers.insert(header::CONTENT_LENGTH, n.into());
            }
            PayloadSize::Chunked => {
                headers.remove(header::CONTENT_LENGTH);
                headers.insert(header::TRANSFER_ENCODING, CHUNKED);
            }
            PayloadSize::Empty | PayloadSize::UntilClose => {
                headers.remove(header::TRANSFER_ENCODING);
                if expects_body(&parts.method) {
                    headers.insert(header::CONTENT_LENGTH, 0.into());
                } else {
                    headers.remove(header::CONTENT_LENGTH);
                }
            }
        }

        for (header_name, header_value) in headers.iter() {
            dst.put_slice(header_name.as_ref());
            dst.put_slice(b": ");
            dst.put_slice(header_value.as_ref());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

/// Methods whose requests are expected to carry a body, even an empty one.
fn expects_body(method: &Method) -> bool {
    matches!(*method, Method::POST | Method::PUT | Method::PATCH)
}
