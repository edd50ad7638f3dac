//! Body framing for responses (decoding) and requests (encoding)
//!
//! ## Decoders
//! - [`PayloadDecoder`]: picks the strategy for a response body: content-length,
//!   chunked with trailers, until the connection closes, or no body
//!
//! ## Encoders
//! - [`PayloadEncoder`]: frames request body data with content-length or
//!   chunked transfer encoding
//!
//! All decoders are incremental: they hand out body bytes as soon as they
//! arrive and keep their position across calls, so the wire can be split at
//! any byte.

mod chunked_decoder;
mod chunked_encoder;
mod length_decoder;
mod length_encoder;
mod payload_decoder;
mod payload_encoder;

pub use payload_decoder::PayloadDecoder;
pub use payload_encoder::PayloadEncoder;
