//! Connection settings.
//!
//! [`ConnectorConfig`] can be built in code with its `with_*` setters or
//! deserialized with serde; missing fields take their defaults.
//!
//! ```
//! use std::time::Duration;
//! use micro_http_client::config::ConnectorConfig;
//!
//! let config = ConnectorConfig::default()
//!     .with_chunk_size(8 * 1024)
//!     .with_response_timeout(Some(Duration::from_secs(30)));
//! assert_eq!(config.chunk_size(), 8 * 1024);
//! ```

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::codec::header::{DEFAULT_MAX_HEADER_COUNT, DEFAULT_MAX_HEADER_SIZE, DEFAULT_MAX_LINE_SIZE, HeaderLimits};

pub const DEFAULT_CHUNK_SIZE: usize = 4096;

pub const DEFAULT_READ_BUFFER_SIZE: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ConnectorConfig {
    chunk_size: usize,
    max_header_size: usize,
    max_line_size: usize,
    max_header_count: usize,
    read_buffer_size: usize,
    connect_timeout: Option<Duration>,
    response_timeout: Option<Duration>,
    connection_idle_timeout: Option<Duration>,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_header_size: DEFAULT_MAX_HEADER_SIZE,
            max_line_size: DEFAULT_MAX_LINE_SIZE,
            max_header_count: DEFAULT_MAX_HEADER_COUNT,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            connect_timeout: None,
            response_timeout: None,
            connection_idle_timeout: None,
        }
    }
}

impl ConnectorConfig {
    /// Size of the pieces a streamed request body is written in.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_header_size(mut self, max_header_size: usize) -> Self {
        self.max_header_size = max_header_size;
        self
    }

    pub fn with_max_line_size(mut self, max_line_size: usize) -> Self {
        self.max_line_size = max_line_size;
        self
    }

    pub fn with_max_header_count(mut self, max_header_count: usize) -> Self {
        self.max_header_count = max_header_count;
        self
    }

    pub fn with_read_buffer_size(mut self, read_buffer_size: usize) -> Self {
        self.read_buffer_size = read_buffer_size;
        self
    }

    /// `None` waits for the connection as long as the OS does.
    pub fn with_connect_timeout(mut self, connect_timeout: Option<Duration>) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Limit from the request being sent until the response is complete.
    pub fn with_response_timeout(mut self, response_timeout: Option<Duration>) -> Self {
        self.response_timeout = response_timeout;
        self
    }

    /// How long an idle connection may be reused.
    pub fn with_connection_idle_timeout(mut self, connection_idle_timeout: Option<Duration>) -> Self {
        self.connection_idle_timeout = connection_idle_timeout;
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn max_header_size(&self) -> usize {
        self.max_header_size
    }

    pub fn max_line_size(&self) -> usize {
        self.max_line_size
    }

    pub fn max_header_count(&self) -> usize {
        self.max_header_count
    }

    pub fn read_buffer_size(&self) -> usize {
        self.read_buffer_size
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout
    }

    pub fn connection_idle_timeout(&self) -> Option<Duration> {
        self.connection_idle_timeout
    }

    pub fn header_limits(&self) -> HeaderLimits {
        HeaderLimits {
            max_header_size: self.max_header_size,
            max_line_size: self.max_line_size,
            max_header_count: self.max_header_count,
        }
    }

    /// Replaces unusable zero sizes with their defaults.
    pub fn validated(mut self) -> Self {
        fn fallback(name: &str, value: &mut usize, default: usize) {
            if *value == 0 {
                warn!(setting = name, default, "zero is not a valid size, using the default");
                *value = default;
            }
        }

        fallback("chunk_size", &mut self.chunk_size, DEFAULT_CHUNK_SIZE);
        fallback("max_header_size", &mut self.max_header_size, DEFAULT_MAX_HEADER_SIZE);
        fallback("max_line_size", &mut self.max_line_size, DEFAULT_MAX_LINE_SIZE);
        fallback("max_header_count", &mut self.max_header_count, DEFAULT_MAX_HEADER_COUNT);
        fallback("read_buffer_size", &mut self.read_buffer_size, DEFAULT_READ_BUFFER_SIZE);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_sizes_fall_back() {
        let config = ConnectorConfig::default().with_chunk_size(0).with_read_buffer_size(0).validated();
        assert_eq!(config.chunk_size(), DEFAULT_CHUNK_SIZE);
        assert_eq!(config.read_buffer_size(), DEFAULT_READ_BUFFER_SIZE);
    }

    #[test]
    fn deserialize_with_defaults() {
        let config: ConnectorConfig = serde_json::from_str(
            r#"{
                "chunk_size": 1024,
                "max_header_size": 16384,
                "response_timeout": { "secs": 5, "nanos": 0 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.chunk_size(), 1024);
        assert_eq!(config.header_limits().max_header_size, 16384);
        assert_eq!(config.header_limits().max_line_size, DEFAULT_MAX_LINE_SIZE);
        assert_eq!(config.response_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.connect_timeout(), None);
    }
}
