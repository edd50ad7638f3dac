use std::io;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("response parse error: {source}")]
    ParseError {
        #[from]
        source: ParseError,
    },

    #[error("request send error: {source}")]
    SendError {
        #[from]
        source: SendError,
    },

    #[error("transport error: {source}")]
    TransportError {
        #[from]
        source: TransportError,
    },

    #[error("usage error: {source}")]
    UsageError {
        #[from]
        source: UsageError,
    },

    #[error("connection error: {source}")]
    ConnectionError {
        #[from]
        source: ConnectionError,
    },
}

/// Misuse or failure of a [`HttpConnection`](crate::connection::HttpConnection)
/// as a whole, as opposed to a single message.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("connection is {current}, expected {expected}")]
    IllegalState { current: &'static str, expected: &'static str },

    #[error("connection was idle for longer than {idle_timeout:?}")]
    IdleTimeout { idle_timeout: std::time::Duration },

    #[error("connection is closed")]
    Closed,
}

/// Malformed or oversized response data. Parse failures are fatal to the
/// message being parsed.
#[derive(Error, Debug, Clone)]
pub enum ParseError {
    #[error("header size too large, current: {current_size} exceed the limit {max_size}")]
    TooLargeHeader { current_size: usize, max_size: usize },

    #[error("line size exceed the limit {max_size}")]
    LineTooLong { max_size: usize },

    #[error("header number exceed the limit {max_num}")]
    TooManyHeaders { max_num: usize },

    #[error("invalid status line: {reason}")]
    InvalidStatusLine { reason: String },

    #[error("invalid header: {reason}")]
    InvalidHeader { reason: String },

    #[error("invalid content-length header: {reason}")]
    InvalidContentLength { reason: String },

    #[error("invalid chunk: {reason}")]
    InvalidChunk { reason: String },

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("io error: {source}")]
    Io { source: Arc<io::Error> },
}

impl ParseError {
    pub fn too_large_header(current_size: usize, max_size: usize) -> Self {
        Self::TooLargeHeader { current_size, max_size }
    }

    pub fn line_too_long(max_size: usize) -> Self {
        Self::LineTooLong { max_size }
    }

    pub fn too_many_headers(max_num: usize) -> Self {
        Self::TooManyHeaders { max_num }
    }

    pub fn invalid_status_line<S: ToString>(str: S) -> Self {
        Self::InvalidStatusLine { reason: str.to_string() }
    }

    pub fn invalid_header<S: ToString>(str: S) -> Self {
        Self::InvalidHeader { reason: str.to_string() }
    }

    pub fn invalid_chunk<S: ToString>(str: S) -> Self {
        Self::InvalidChunk { reason: str.to_string() }
    }

    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn invalid_content_length<S: ToString>(str: S) -> Self {
        Self::InvalidContentLength { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: Arc::new(e.into()) }
    }
}

impl From<io::Error> for ParseError {
    fn from(e: io::Error) -> Self {
        Self::io(e)
    }
}

#[derive(Error, Debug)]
pub enum SendError {
    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl SendError {
    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io { source: e.into() }
    }
}

/// Failures coming from below the application: the socket, a filter or the
/// response parser aborting a message.
///
/// The same failure is usually delivered to several parties (the filter chain,
/// the parser and a body stream), so the variants hold their causes behind
/// an [`Arc`] and the whole error is cheap to clone.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(Arc<io::Error>),

    #[error("malformed response: {0}")]
    Parse(ParseError),

    #[error("request could not be encoded: {0}")]
    Send(Arc<SendError>),

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("write was dropped before completion")]
    Canceled,

    #[error("transport already closed")]
    Closed,
}

impl TransportError {
    pub fn io<E: Into<io::Error>>(e: E) -> Self {
        Self::Io(Arc::new(e.into()))
    }
}

impl From<io::Error> for TransportError {
    fn from(e: io::Error) -> Self {
        Self::io(e)
    }
}

impl From<ParseError> for TransportError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

impl From<SendError> for TransportError {
    fn from(e: SendError) -> Self {
        Self::Send(Arc::new(e))
    }
}

/// Programming errors at a stream call site: the caller broke the stream's
/// contract, nothing went wrong on the network.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageError {
    #[error("synchronous operation is not supported in asynchronous mode")]
    SyncOperationInAsyncMode,

    #[error("asynchronous operation is not supported in synchronous mode")]
    AsyncOperationInSyncMode,

    #[error("listener can be set only once")]
    ListenerAlreadySet,

    #[error("operation is not possible while the stream is not ready")]
    NotReady,

    #[error("another write is still pending")]
    WritePending,

    #[error("stream has been closed")]
    StreamClosed,

    #[error("stream does not accept more input")]
    ClosedForInput,
}

/// Error returned by the body stream operations.
#[derive(Error, Debug, Clone)]
pub enum BodyError {
    #[error(transparent)]
    Usage(#[from] UsageError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Send(Arc<SendError>),
}

impl From<SendError> for BodyError {
    fn from(e: SendError) -> Self {
        Self::Send(Arc::new(e))
    }
}

impl From<BodyError> for io::Error {
    fn from(e: BodyError) -> Self {
        let kind = match &e {
            BodyError::Usage(_) => io::ErrorKind::Unsupported,
            BodyError::Transport(TransportError::Io(source)) => source.kind(),
            BodyError::Transport(TransportError::Timeout(_)) => io::ErrorKind::TimedOut,
            BodyError::Transport(TransportError::ConnectionClosed) => io::ErrorKind::UnexpectedEof,
            BodyError::Transport(_) => io::ErrorKind::BrokenPipe,
            BodyError::Send(_) => io::ErrorKind::InvalidInput,
        };
        io::Error::new(kind, e)
    }
}
