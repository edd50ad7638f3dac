use std::fmt;
use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::{ChainHandle, Filter, FilterContext, WriteCompletion};
use crate::config::ConnectorConfig;
use crate::protocol::TransportError;

/// Any byte stream the transport can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

type WriteJob = (Bytes, WriteCompletion);

/// The bottom of a chain: moves bytes between the chain and a tokio stream.
///
/// On `connect` it opens a TCP connection (or takes over the stream it was
/// built with) and spawns a reader and a writer task on the runtime it was
/// created in. Writes are queued and written in order, each completed once
/// the bytes were flushed to the stream.
pub struct TransportFilter {
    read_buffer_size: usize,
    stream: Option<Box<dyn AsyncStream>>,
    writer: Option<mpsc::UnboundedSender<WriteJob>>,
    cancel: CancellationToken,
    runtime: Option<Handle>,
}

impl TransportFilter {
    /// A transport connecting over TCP, using the current tokio runtime.
    pub fn new(config: &ConnectorConfig) -> Self {
        Self {
            read_buffer_size: config.read_buffer_size(),
            stream: None,
            writer: None,
            cancel: CancellationToken::new(),
            runtime: Handle::try_current().ok(),
        }
    }

    /// A transport running over an already connected stream; the address
    /// passed to `connect` is ignored.
    pub fn with_stream<S: AsyncStream>(stream: S, config: &ConnectorConfig) -> Self {
        let mut transport = Self::new(config);
        transport.stream = Some(Box::new(stream));
        transport
    }

    /// Spawns the socket tasks on `runtime` instead of the current runtime.
    pub fn with_runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }
}

impl Filter for TransportFilter {
    fn connect(&mut self, ctx: &mut FilterContext<'_>, addr: String) {
        let Some(runtime) = self.runtime.clone() else {
            error!(addr, "no tokio runtime to run the transport on");
            ctx.on_error(TransportError::io(io::Error::other("no tokio runtime available")));
            return;
        };
        if self.writer.is_some() || self.cancel.is_cancelled() {
            warn!(addr, "transport can only be connected once");
            ctx.on_error(TransportError::Closed);
            return;
        }

        let (jobs, queue) = mpsc::unbounded_channel();
        self.writer = Some(jobs);

        let handle = ctx.handle();
        let stream = self.stream.take();
        let cancel = self.cancel.clone();
        let read_buffer_size = self.read_buffer_size;

        runtime.spawn(async move {
            let stream = match stream {
                Some(stream) => stream,
                None => {
                    let connecting = tokio::select! {
                        () = cancel.cancelled() => return,
                        connecting = TcpStream::connect(&addr) => connecting,
                    };
                    match connecting {
                        Ok(tcp) => {
                            if let Err(e) = tcp.set_nodelay(true) {
                                warn!(cause = %e, "failed to set TCP_NODELAY");
                            }
                            Box::new(tcp) as Box<dyn AsyncStream>
                        }
                        Err(e) => {
                            warn!(addr, cause = %e, "failed to connect");
                            cancel.cancel();
                            handle.on_error(e.into());
                            return;
                        }
                    }
                }
            };

            debug!(addr, "transport connected");
            let (reader, writer) = tokio::io::split(stream);
            tokio::spawn(write_loop(writer, queue, cancel.clone()));
            handle.on_connect();
            read_loop(reader, handle, cancel, read_buffer_size).await;
        });
    }

    fn write(&mut self, ctx: &mut FilterContext<'_>, data: Bytes, completion: WriteCompletion) {
        let Some(jobs) = &self.writer else {
            ctx.complete(completion, Err(TransportError::Closed));
            return;
        };
        if let Err(mpsc::error::SendError((_, completion))) = jobs.send((data, completion)) {
            ctx.complete(completion, Err(TransportError::Closed));
        }
    }

    fn close(&mut self, _ctx: &mut FilterContext<'_>) {
        trace!("closing transport");
        self.writer = None;
        self.cancel.cancel();
    }
}

impl Drop for TransportFilter {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for TransportFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportFilter")
            .field("read_buffer_size", &self.read_buffer_size)
            .field("connected", &self.writer.is_some())
            .field("closed", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

async fn write_loop<W>(mut writer: W, mut queue: mpsc::UnboundedReceiver<WriteJob>, cancel: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let job = tokio::select! {
            () = cancel.cancelled() => None,
            job = queue.recv() => job,
        };
        let Some((data, completion)) = job else {
            break;
        };

        let written = async {
            writer.write_all(&data).await?;
            writer.flush().await
        };
        match written.await {
            Ok(()) => {
                trace!(len = data.len(), "wrote bytes to transport");
                completion.complete(Ok(()));
            }
            Err(e) => {
                warn!(cause = %e, "failed to write to transport");
                completion.complete(Err(e.into()));
                cancel.cancel();
                break;
            }
        }
    }

    queue.close();
    while let Ok((_, completion)) = queue.try_recv() {
        completion.complete(Err(TransportError::Closed));
    }
    if let Err(e) = writer.shutdown().await {
        trace!(cause = %e, "transport shutdown failed");
    }
}

async fn read_loop<R>(mut reader: R, handle: ChainHandle, cancel: CancellationToken, read_buffer_size: usize)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = BytesMut::with_capacity(read_buffer_size);
    loop {
        buffer.reserve(read_buffer_size);
        let read = tokio::select! {
            () = cancel.cancelled() => {
                trace!("transport closed locally, stop reading");
                return;
            }
            read = reader.read_buf(&mut buffer) => read,
        };

        match read {
            Ok(0) => {
                debug!("connection closed by peer");
                handle.on_connection_closed();
                break;
            }
            Ok(n) => {
                trace!(len = n, "read bytes from transport");
                handle.on_read(buffer.split().freeze());
            }
            Err(e) => {
                warn!(cause = %e, "failed to read from transport");
                handle.on_error(e.into());
                break;
            }
        }
    }
    cancel.cancel();
}
