//! Core HTTP protocol abstractions of the client.
//!
//! # Architecture
//!
//! - **Message Handling** ([`message`]): payload items and sizes shared by the codecs
//!   - [`PayloadItem`]: Handles individual payload chunks and EOF
//!   - [`PayloadSize`]: How a body is delimited on the wire
//!
//! - **Request** ([`request`]): [`HttpRequest`] with its [`RequestBody`]
//!
//! - **Response** ([`response`]): [`ResponseHead`] as decoded and the
//!   [`HttpResponse`] handed to the application
//!
//! - **Body Streaming** ([`body`]): [`BodyInputStream`](body::BodyInputStream) and
//!   [`BodyOutputStream`](body::BodyOutputStream)
//!
//! - **Error Handling** ([`error`]):
//!   - [`HttpError`]: Top-level error type
//!   - [`ParseError`]: Malformed or oversized responses
//!   - [`SendError`]: Requests that can't be encoded
//!   - [`TransportError`]: Failures of the connection below the application
//!   - [`UsageError`]: Contract violations at a stream call site
//!   - [`BodyError`]: What the body stream operations return

mod message;
pub use message::PayloadItem;
pub use message::PayloadSize;

mod request;
pub use request::HttpRequest;
pub use request::RequestBody;

mod response;
pub use response::HttpResponse;
pub use response::ReasonPhrase;
pub use response::ResponseHead;

mod error;
pub use error::BodyError;
pub use error::ConnectionError;
pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;
pub use error::TransportError;
pub use error::UsageError;

pub mod body;
