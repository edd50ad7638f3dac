//! HTTP request handling implementation.
//!
//! Requests are plain `http::Request` values carrying a [`RequestBody`].

use bytes::Bytes;
use http::Request;

use crate::protocol::PayloadSize;
use crate::protocol::body::BodyOutputStream;

/// Type alias for a request ready to be sent.
pub type HttpRequest = Request<RequestBody>;

/// The body of an outgoing request.
#[derive(Debug, Default)]
pub enum RequestBody {
    /// No body at all
    #[default]
    Empty,
    /// A body known up front, sent right after the head
    Buffered(Bytes),
    /// A body written by the application through a [`BodyOutputStream`]
    /// after the head has been sent
    Streaming(BodyOutputStream),
}

impl RequestBody {
    /// The framing the request head announces for this body.
    pub fn payload_size(&self) -> PayloadSize {
        match self {
            RequestBody::Empty => PayloadSize::new_empty(),
            RequestBody::Buffered(bytes) => PayloadSize::new_length(bytes.len() as u64),
            RequestBody::Streaming(stream) => stream.payload_size(),
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(bytes: Bytes) -> Self {
        if bytes.is_empty() { RequestBody::Empty } else { RequestBody::Buffered(bytes) }
    }
}

impl From<&'static str> for RequestBody {
    fn from(str: &'static str) -> Self {
        Bytes::from_static(str.as_bytes()).into()
    }
}

impl From<String> for RequestBody {
    fn from(string: String) -> Self {
        Bytes::from(string).into()
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(vec: Vec<u8>) -> Self {
        Bytes::from(vec).into()
    }
}

impl From<BodyOutputStream> for RequestBody {
    fn from(stream: BodyOutputStream) -> Self {
        RequestBody::Streaming(stream)
    }
}

impl From<()> for RequestBody {
    fn from((): ()) -> Self {
        RequestBody::Empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_size_of_bodies() {
        assert_eq!(RequestBody::Empty.payload_size(), PayloadSize::Empty);
        assert_eq!(RequestBody::from("hello").payload_size(), PayloadSize::Length(5));
        assert_eq!(RequestBody::from(String::new()).payload_size(), PayloadSize::Empty);
        assert_eq!(RequestBody::from(BodyOutputStream::chunked(16)).payload_size(), PayloadSize::Chunked);
        assert_eq!(RequestBody::from(BodyOutputStream::fixed_length(3, 16)).payload_size(), PayloadSize::Length(3));
    }
}
