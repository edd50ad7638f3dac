//! Body streams of the client.
//!
//! Both directions of a message body are streamed between the application
//! and the connection:
//!
//! - [`BodyInputStream`]: the response body. The response parser pushes
//!   decoded bytes in, the application reads them out.
//! - [`BodyOutputStream`]: a streamed request body. The application writes,
//!   the stream frames the bytes and passes them down the filter chain.
//!
//! # Modes
//!
//! Each stream is used either synchronously or asynchronously, never both:
//!
//! - **Synchronous**: blocking `read`/`write` calls, also available through
//!   [`std::io::Read`] and [`std::io::Write`]. The calling thread waits on a
//!   condition variable until the stream can make progress.
//! - **Asynchronous**: the application attaches a [`ReadListener`] or
//!   [`WriteListener`], checks `is_ready()` before each operation and gets a
//!   callback when the stream becomes ready again. Callbacks of an input
//!   stream can be moved off the I/O path with a [`ListenerExecutor`].
//!
//! The first operation decides the mode; mixing modes afterwards fails with
//! a [`UsageError`](crate::protocol::UsageError).

mod executor;
mod input_stream;
mod listener;
mod output_stream;

pub use executor::ListenerExecutor;
pub use input_stream::BodyInputStream;
pub use listener::{ReadListener, WriteListener};
pub use output_stream::BodyOutputStream;
