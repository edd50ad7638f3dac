use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::channel::mpsc::UnboundedReceiver;
use futures::{FutureExt, StreamExt};
use tokio::time::{Instant, timeout_at};
use tracing::{debug, trace, warn};

use crate::config::ConnectorConfig;
use crate::filter::{AsyncStream, ChainEvent, Filter, FilterChain, HttpFilter, ResponseEvent, TransportFilter, WriteCompletion};
use crate::protocol::body::BodyOutputStream;
use crate::protocol::{ConnectionError, HttpError, HttpRequest, HttpResponse, TransportError};

/// Lifecycle of an [`HttpConnection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Created,
    Connecting,
    ConnectTimeout,
    Idle,
    SendingRequest,
    ReceivingHeader,
    ReceivingBody,
    Received,
    ResponseTimeout,
    ClosedByServer,
    Closed,
    Error,
    IdleTimeout,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Created => "created",
            ConnectionState::Connecting => "connecting",
            ConnectionState::ConnectTimeout => "connect timeout",
            ConnectionState::Idle => "idle",
            ConnectionState::SendingRequest => "sending request",
            ConnectionState::ReceivingHeader => "receiving header",
            ConnectionState::ReceivingBody => "receiving body",
            ConnectionState::Received => "received",
            ConnectionState::ResponseTimeout => "response timeout",
            ConnectionState::ClosedByServer => "closed by server",
            ConnectionState::Closed => "closed",
            ConnectionState::Error => "error",
            ConnectionState::IdleTimeout => "idle timeout",
        }
    }

    /// Whether a request/response exchange is in progress.
    fn is_exchanging(self) -> bool {
        matches!(
            self,
            ConnectionState::SendingRequest | ConnectionState::ReceivingHeader | ConnectionState::ReceivingBody
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One HTTP/1.1 connection, carrying one request at a time.
///
/// The connection owns a [`FilterChain`] (an [`HttpFilter`] above a
/// [`TransportFilter`] by default) and follows its events to move through
/// the [`ConnectionState`]s:
///
/// ```text
/// Created -> Connecting -> Idle -> SendingRequest -> ReceivingHeader
///                           ^                              |
///                           |                              v
///                           +------- Received <------ ReceivingBody
/// ```
///
/// A response with `Connection: close` (or an HTTP/1.0 response without
/// keep-alive) ends in `Closed` instead of `Idle`. Events are consumed while
/// the connection is awaited, so the move from `ReceivingBody` to `Idle`
/// is observed by the next [`send`](Self::send), [`finish`](Self::finish) or
/// [`state`](Self::state) call.
pub struct HttpConnection {
    addr: String,
    config: ConnectorConfig,
    chain: FilterChain,
    events: UnboundedReceiver<ChainEvent>,
    state: ConnectionState,
    persistent: bool,
    idle_since: Option<Instant>,
    response_deadline: Option<Instant>,
    response: Option<Arc<HttpResponse>>,
    error: Option<TransportError>,
}

impl HttpConnection {
    /// A connection to `addr` (`host:port`) over TCP.
    pub fn new(addr: impl Into<String>, config: ConnectorConfig) -> Self {
        let config = config.validated();
        let filters: Vec<Box<dyn Filter>> =
            vec![Box::new(HttpFilter::with_config(&config)), Box::new(TransportFilter::new(&config))];
        Self::with_filters(addr, config, filters)
    }

    /// A connection over an already connected stream.
    pub fn with_stream<S: AsyncStream>(stream: S, config: ConnectorConfig) -> Self {
        let config = config.validated();
        let filters: Vec<Box<dyn Filter>> = vec![
            Box::new(HttpFilter::with_config(&config)),
            Box::new(TransportFilter::with_stream(stream, &config)),
        ];
        Self::with_filters("stream", config, filters)
    }

    /// A connection over a custom chain, e.g. with a TLS filter between
    /// the [`HttpFilter`] and the [`TransportFilter`].
    pub fn with_filters(addr: impl Into<String>, config: ConnectorConfig, filters: Vec<Box<dyn Filter>>) -> Self {
        let (chain, events) = FilterChain::new(filters);
        Self {
            addr: addr.into(),
            config,
            chain,
            events,
            state: ConnectionState::Created,
            persistent: true,
            idle_since: None,
            response_deadline: None,
            response: None,
            error: None,
        }
    }

    /// The current state, after applying the events received so far.
    pub fn state(&mut self) -> ConnectionState {
        while let Some(Some(event)) = self.events.next().now_or_never() {
            if let Err(e) = self.apply(event) {
                trace!(cause = %e, "connection failed while polled");
            }
        }
        self.state
    }

    /// A chunked request body written in pieces of the configured chunk size.
    pub fn chunked_body(&self) -> BodyOutputStream {
        BodyOutputStream::chunked(self.config.chunk_size())
    }

    /// A request body of exactly `length` bytes.
    pub fn fixed_length_body(&self, length: u64) -> BodyOutputStream {
        BodyOutputStream::fixed_length(length, self.config.chunk_size())
    }

    /// The failure that put the connection into the `Error` state.
    pub fn error(&self) -> Option<&TransportError> {
        self.error.as_ref()
    }

    /// The response to the last request.
    pub fn response(&self) -> Option<Arc<HttpResponse>> {
        self.response.as_ref().map(Arc::clone)
    }

    pub async fn connect(&mut self) -> Result<(), HttpError> {
        self.expect_state(ConnectionState::Created)?;
        self.change_state(ConnectionState::Connecting);
        self.chain.connect(self.addr.clone());

        let deadline = self.config.connect_timeout().map(|timeout| Instant::now() + timeout);
        match self.wait(deadline, |state| state != ConnectionState::Connecting).await {
            Ok(()) if self.state == ConnectionState::Idle => Ok(()),
            Ok(()) => Err(self.failure().into()),
            Err(Elapsed) => {
                warn!(addr = self.addr, "connect timed out");
                self.change_state(ConnectionState::ConnectTimeout);
                self.close();
                Err(TransportError::Timeout("connect").into())
            }
        }
    }

    /// Sends `request` and waits for the head of its response.
    ///
    /// A response to the previous request that is still arriving is awaited
    /// first. The body of the returned response keeps arriving in the
    /// background and is read from [`HttpResponse::body`].
    pub async fn send(&mut self, request: HttpRequest) -> Result<Arc<HttpResponse>, HttpError> {
        self.finish().await?;
        self.check_idle_timeout()?;
        self.expect_state(ConnectionState::Idle)?;

        self.response = None;
        self.error = None;
        self.persistent = true;
        self.idle_since = None;
        self.change_state(ConnectionState::SendingRequest);

        let (completion, sent) = WriteCompletion::channel();
        self.chain.send(request, completion);
        self.response_deadline = self.config.response_timeout().map(|timeout| Instant::now() + timeout);

        match with_deadline(self.response_deadline, sent).await {
            Ok(Ok(Ok(()))) => {
                if self.state == ConnectionState::SendingRequest {
                    self.change_state(ConnectionState::ReceivingHeader);
                }
            }
            Ok(Ok(Err(e))) => return Err(self.fail(e).into()),
            Ok(Err(_canceled)) => return Err(self.fail(TransportError::Canceled).into()),
            Err(Elapsed) => return Err(self.response_timed_out().into()),
        }

        let deadline = self.response_deadline;
        let head_received = |state: ConnectionState| !matches!(state, ConnectionState::SendingRequest | ConnectionState::ReceivingHeader);
        match self.wait(deadline, head_received).await {
            Ok(()) => match &self.response {
                Some(response) => Ok(Arc::clone(response)),
                None => Err(self.failure().into()),
            },
            Err(Elapsed) => Err(self.response_timed_out().into()),
        }
    }

    /// Waits until the response in progress, if any, has been received
    /// completely.
    pub async fn finish(&mut self) -> Result<(), HttpError> {
        self.state();
        if !self.state.is_exchanging() {
            return Ok(());
        }

        let deadline = self.response_deadline;
        match self.wait(deadline, |state| !state.is_exchanging()).await {
            Ok(()) if self.error.is_none() && matches!(self.state, ConnectionState::Idle | ConnectionState::Closed) => Ok(()),
            Ok(()) => Err(self.failure().into()),
            Err(Elapsed) => Err(self.response_timed_out().into()),
        }
    }

    pub fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.chain.close();
        self.change_state(ConnectionState::Closed);
    }

    /// Applies chain events until `done` holds for the state or `deadline`
    /// passes.
    async fn wait<F>(&mut self, deadline: Option<Instant>, done: F) -> Result<(), Elapsed>
    where
        F: Fn(ConnectionState) -> bool,
    {
        let events = async {
            while !done(self.state) {
                let event = self.events.next().await.unwrap_or(ChainEvent::Error(TransportError::Closed));
                // failures are recorded in the state
                let _ = self.apply(event);
            }
        };
        with_deadline(deadline, events).await
    }

    fn apply(&mut self, event: ChainEvent) -> Result<(), TransportError> {
        match event {
            ChainEvent::Connected => {
                if self.state == ConnectionState::Connecting {
                    self.enter_idle();
                }
            }

            ChainEvent::Response(ResponseEvent::Head(response)) => {
                if !matches!(self.state, ConnectionState::SendingRequest | ConnectionState::ReceivingHeader) {
                    warn!(state = %self.state, "unexpected response head");
                    return Ok(());
                }
                if self.state == ConnectionState::SendingRequest {
                    // the response overtook the write completion
                    self.change_state(ConnectionState::ReceivingHeader);
                }
                self.persistent = !response.is_connection_close();
                self.response = Some(response);
                self.change_state(ConnectionState::ReceivingBody);
            }

            ChainEvent::Response(ResponseEvent::Complete(_)) => {
                if self.state != ConnectionState::ReceivingBody {
                    warn!(state = %self.state, "unexpected response completion");
                    return Ok(());
                }
                self.response_deadline = None;
                self.change_state(ConnectionState::Received);
                if self.persistent {
                    self.enter_idle();
                } else {
                    self.close();
                }
            }

            ChainEvent::ConnectionClosed => {
                self.response_deadline = None;
                if self.state != ConnectionState::Error {
                    self.change_state(ConnectionState::ClosedByServer);
                }
                self.close();
            }

            ChainEvent::Error(error) => {
                self.fail(error.clone());
                return Err(error);
            }

            ChainEvent::Read(data) => warn!(len = data.len(), "raw bytes reached the connection"),
        }
        Ok(())
    }

    fn enter_idle(&mut self) {
        self.idle_since = Some(Instant::now());
        self.change_state(ConnectionState::Idle);
    }

    fn check_idle_timeout(&mut self) -> Result<(), ConnectionError> {
        let (Some(idle_timeout), Some(idle_since)) = (self.config.connection_idle_timeout(), self.idle_since) else {
            return Ok(());
        };
        if self.state == ConnectionState::Idle && idle_since.elapsed() >= idle_timeout {
            debug!(addr = self.addr, ?idle_timeout, "connection idle for too long");
            self.change_state(ConnectionState::IdleTimeout);
            self.close();
            return Err(ConnectionError::IdleTimeout { idle_timeout });
        }
        Ok(())
    }

    fn response_timed_out(&mut self) -> TransportError {
        warn!(addr = self.addr, state = %self.state, "response timed out");
        self.change_state(ConnectionState::ResponseTimeout);
        self.close();
        TransportError::Timeout("response")
    }

    fn fail(&mut self, error: TransportError) -> TransportError {
        debug!(addr = self.addr, cause = %error, "connection failed");
        self.response_deadline = None;
        self.error = Some(error.clone());
        self.change_state(ConnectionState::Error);
        self.close();
        error
    }

    /// Why the connection stopped in a state other than the one awaited.
    fn failure(&self) -> TransportError {
        self.error.clone().unwrap_or(TransportError::ConnectionClosed)
    }

    fn expect_state(&self, expected: ConnectionState) -> Result<(), ConnectionError> {
        if self.state == expected {
            return Ok(());
        }
        if self.state == ConnectionState::Closed {
            return Err(ConnectionError::Closed);
        }
        Err(ConnectionError::IllegalState { current: self.state.as_str(), expected: expected.as_str() })
    }

    fn change_state(&mut self, new_state: ConnectionState) {
        if self.state == ConnectionState::Closed {
            return;
        }
        debug!(addr = self.addr, from = %self.state, to = %new_state, "connection state changed");
        self.state = new_state;
    }
}

impl fmt::Debug for HttpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpConnection")
            .field("addr", &self.addr)
            .field("state", &self.state)
            .field("persistent", &self.persistent)
            .finish_non_exhaustive()
    }
}

/// The deadline of a connection step passed.
#[derive(Debug)]
struct Elapsed;

async fn with_deadline<F: Future>(deadline: Option<Instant>, future: F) -> Result<F::Output, Elapsed> {
    match deadline {
        Some(deadline) => timeout_at(deadline, future).await.map_err(|_elapsed| Elapsed),
        None => Ok(future.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestBody;
    use http::{Request, StatusCode};
    use indoc::indoc;
    use std::io::Read;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    fn get(uri: &str) -> HttpRequest {
        Request::get(uri).body(RequestBody::Empty).unwrap()
    }

    /// Reads one request head from the server side of the stream.
    async fn read_head(server: &mut DuplexStream) -> String {
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            let mut byte = [0u8; 1];
            server.read_exact(&mut byte).await.unwrap();
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    async fn connected(config: ConnectorConfig) -> (HttpConnection, DuplexStream) {
        let (client, server) = duplex(1024);
        let mut connection = HttpConnection::with_stream(client, config);
        connection.connect().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Idle);
        (connection, server)
    }

    fn read_body(response: &HttpResponse) -> String {
        let mut body = String::new();
        response.body().read_to_string(&mut body).unwrap();
        body
    }

    #[tokio::test]
    async fn keep_alive_exchanges() {
        let (mut connection, mut server) = connected(ConnectorConfig::default()).await;

        let server_task = tokio::spawn(async move {
            for body in ["first", "second"] {
                let head = read_head(&mut server).await;
                assert!(head.starts_with("GET /"), "{head}");
                let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{body}", body.len());
                server.write_all(response.as_bytes()).await.unwrap();
            }
            server
        });

        let first = connection.send(get("http://localhost/one")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        connection.finish().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Idle);
        assert_eq!(read_body(&first), "first");

        let second = connection.send(get("http://localhost/two")).await.unwrap();
        connection.finish().await.unwrap();
        assert_eq!(read_body(&second), "second");

        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn connection_close_header_closes() {
        let (mut connection, mut server) = connected(ConnectorConfig::default()).await;

        tokio::spawn(async move {
            read_head(&mut server).await;
            let response = indoc! {"
                HTTP/1.1 200 OK
                Connection: close
                Content-Length: 2

                ok"};
            server.write_all(response.as_bytes()).await.unwrap();
        });

        let response = connection.send(get("http://localhost/")).await.unwrap();
        assert!(response.is_connection_close());
        connection.finish().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(read_body(&response), "ok");

        let error = connection.send(get("http://localhost/")).await.unwrap_err();
        assert!(matches!(error, HttpError::ConnectionError { source: ConnectionError::Closed }));
    }

    #[tokio::test]
    async fn streamed_request_body() {
        let (mut connection, mut server) = connected(ConnectorConfig::default().with_chunk_size(8)).await;

        let server_task = tokio::spawn(async move {
            let head = read_head(&mut server).await;
            assert!(head.contains("transfer-encoding: chunked\r\n"), "{head}");

            let expected = b"8\r\n01234567\r\n2\r\n89\r\n0\r\n\r\n";
            let mut body = vec![0u8; expected.len()];
            server.read_exact(&mut body).await.unwrap();
            assert_eq!(&body[..], &expected[..]);

            server.write_all(b"HTTP/1.1 204 No Content\r\n\r\n").await.unwrap();
            server
        });

        let body = connection.chunked_body();
        let writer = body.clone();
        let request = Request::post("http://localhost/upload").body(RequestBody::from(body)).unwrap();

        let upload = tokio::task::spawn_blocking(move || {
            writer.write(b"0123456789").unwrap();
            writer.close().unwrap();
        });

        let response = connection.send(request).await.unwrap();
        upload.await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        connection.finish().await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Idle);

        let _server = server_task.await.unwrap();
    }

    #[tokio::test]
    async fn server_close_before_response() {
        let (mut connection, mut server) = connected(ConnectorConfig::default()).await;

        tokio::spawn(async move {
            read_head(&mut server).await;
            drop(server);
        });

        let error = connection.send(get("http://localhost/")).await.unwrap_err();
        assert!(matches!(error, HttpError::TransportError { source: TransportError::ConnectionClosed }));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn malformed_response_fails_exchange() {
        let (mut connection, mut server) = connected(ConnectorConfig::default()).await;

        tokio::spawn(async move {
            read_head(&mut server).await;
            server.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: x\r\n\r\n").await.unwrap();
            server
        });

        let error = connection.send(get("http://localhost/")).await.unwrap_err();
        assert!(matches!(error, HttpError::TransportError { source: TransportError::Parse(_) }));
        assert!(connection.error().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn response_timeout() {
        let config = ConnectorConfig::default().with_response_timeout(Some(Duration::from_secs(5)));
        let (mut connection, mut server) = connected(config).await;

        let server_task = tokio::spawn(async move {
            read_head(&mut server).await;
            server
        });

        let error = connection.send(get("http://localhost/")).await.unwrap_err();
        assert!(matches!(error, HttpError::TransportError { source: TransportError::Timeout("response") }));
        assert_eq!(connection.state(), ConnectionState::Closed);

        let _server = server_task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout() {
        let config = ConnectorConfig::default().with_connection_idle_timeout(Some(Duration::from_secs(1)));
        let (mut connection, _server) = connected(config).await;

        tokio::time::advance(Duration::from_secs(2)).await;

        let error = connection.send(get("http://localhost/")).await.unwrap_err();
        assert!(matches!(error, HttpError::ConnectionError { source: ConnectionError::IdleTimeout { .. } }));
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn connect_twice_is_illegal() {
        let (mut connection, _server) = connected(ConnectorConfig::default()).await;
        let error = connection.connect().await.unwrap_err();
        assert!(matches!(
            error,
            HttpError::ConnectionError { source: ConnectionError::IllegalState { current: "idle", expected: "created" } }
        ));
    }
}
