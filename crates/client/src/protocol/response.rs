//! HTTP response handling implementation.
//!
//! A response is exposed in two layers: [`ResponseHead`] is what the header
//! decoder produces, and [`HttpResponse`] is what the application gets once
//! the head is complete. The head of an [`HttpResponse`] never changes after
//! that point; only the trailers are filled in later, once the body has been
//! read completely.

use std::fmt;
use std::sync::OnceLock;

use http::{HeaderMap, Response, StatusCode, Version};

use crate::protocol::body::BodyInputStream;

/// Type alias for HTTP response headers.
///
/// This type represents the header portion of an HTTP response, using
/// `http::Response<()>` with an empty body placeholder. The reason phrase
/// travels in the extensions as a [`ReasonPhrase`].
pub type ResponseHead = Response<()>;

/// The reason phrase of a status line, exactly as received.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReasonPhrase(String);

impl ReasonPhrase {
    pub fn new<S: Into<String>>(reason: S) -> Self {
        Self(reason.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A received response: its head, its trailers and the stream of its body.
pub struct HttpResponse {
    head: ResponseHead,
    trailers: OnceLock<HeaderMap>,
    body: BodyInputStream,
}

impl HttpResponse {
    pub(crate) fn new(head: ResponseHead, body: BodyInputStream) -> Self {
        Self { head, trailers: OnceLock::new(), body }
    }

    pub fn status(&self) -> StatusCode {
        self.head.status()
    }

    pub fn version(&self) -> Version {
        self.head.version()
    }

    /// The protocol version as written on the status line, e.g. `HTTP/1.1`.
    pub fn protocol_version(&self) -> &'static str {
        if self.head.version() == Version::HTTP_10 { "HTTP/1.0" } else { "HTTP/1.1" }
    }

    pub fn reason_phrase(&self) -> &str {
        self.head.extensions().get::<ReasonPhrase>().map_or("", ReasonPhrase::as_str)
    }

    pub fn headers(&self) -> &HeaderMap {
        self.head.headers()
    }

    pub fn head(&self) -> &ResponseHead {
        &self.head
    }

    /// The trailers of a chunked body.
    ///
    /// `None` until the body has been read completely; an empty map for
    /// bodies that ended without trailers.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.get()
    }

    pub fn body(&self) -> &BodyInputStream {
        &self.body
    }

    /// Whether the server asked to close the connection after this response.
    pub fn is_connection_close(&self) -> bool {
        let close = self
            .headers()
            .get_all(http::header::CONNECTION)
            .iter()
            .any(|value| value.as_bytes().eq_ignore_ascii_case(b"close"));
        let keep_alive = self
            .headers()
            .get_all(http::header::CONNECTION)
            .iter()
            .any(|value| value.as_bytes().eq_ignore_ascii_case(b"keep-alive"));
        close || (self.version() == Version::HTTP_10 && !keep_alive)
    }

    pub(crate) fn set_trailers(&self, trailers: HeaderMap) {
        // a message has exactly one trailer section
        let _ = self.trailers.set(trailers);
    }
}

impl fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpResponse")
            .field("status", &self.status())
            .field("reason", &self.reason_phrase())
            .field("version", &self.version())
            .field("headers", self.headers())
            .field("trailers", &self.trailers.get())
            .finish_non_exhaustive()
    }
}
