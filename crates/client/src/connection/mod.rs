//! Connection lifecycle
//!
//! [`HttpConnection`] sends requests over a [`FilterChain`](crate::filter::FilterChain)
//! one at a time and tracks the exchange through its [`ConnectionState`]:
//!
//! - connects with an optional connect timeout
//! - enforces a response timeout from sending a request until its response
//!   is complete
//! - returns to idle after each response unless the server asked to close
//! - refuses to reuse a connection idle for longer than the idle timeout

mod http_connection;

pub use http_connection::{ConnectionState, HttpConnection};
