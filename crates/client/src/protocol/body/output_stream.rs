//! The producer side of a streamed request body.
//!
//! The application writes into a [`BodyOutputStream`]; the stream frames the
//! bytes for the announced [`PayloadSize`] and hands them to the layer below
//! the HTTP filter once the request head has been sent, which is when the
//! stream gets [`open`](BodyOutputStream::open)ed.
//!
//! Bytes are collected up to the configured chunk size before anything is
//! written, so every chunk on the wire except the last one has exactly that
//! size. At most one write is in flight at any time: synchronous writers
//! block until it completes, asynchronous writers are told through
//! [`WriteListener::on_write_possible`].

use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Encoder;
use tracing::{trace, warn};

use super::listener::{Mode, WriteListener};
use crate::codec::body::PayloadEncoder;
use crate::ensure;
use crate::filter::{DownstreamWriter, WriteCompletion};
use crate::protocol::{BodyError, PayloadItem, PayloadSize, TransportError, UsageError};

/// A request body written by the application, synchronously or asynchronously.
///
/// Clones share the same stream.
#[derive(Clone)]
pub struct BodyOutputStream {
    shared: Arc<OutputShared>,
}

struct OutputShared {
    state: Mutex<OutputState>,
    changed: Condvar,
    chunk_size: usize,
    payload_size: PayloadSize,
}

type CloseListener = Box<dyn FnOnce() + Send>;

struct OutputState {
    mode: Mode,
    encoder: PayloadEncoder,
    buffer: BytesMut,
    downstream: Option<Arc<dyn DownstreamWriter>>,
    listener: Option<Arc<dyn WriteListener>>,
    listener_set: bool,
    call_listener: bool,
    pending: bool,
    closed: bool,
    failure: Option<BodyError>,
    write_result: Option<Result<(), TransportError>>,
    close_listener: Option<CloseListener>,
}

enum Notification {
    WritePossible,
    Error(BodyError),
}

impl OutputState {
    fn is_ready(&self) -> bool {
        self.downstream.is_some() && !self.pending && !self.closed && self.failure.is_none()
    }

    fn check_writable(&self) -> Result<(), BodyError> {
        ensure!(!self.closed, UsageError::StreamClosed.into());
        if let Some(failure) = &self.failure {
            return Err(failure.clone());
        }
        Ok(())
    }

    /// Checks the mode specific preconditions of a write, flush or close.
    fn check_can_write(&mut self) -> Result<(), BodyError> {
        if self.mode == Mode::Undecided {
            self.mode = Mode::Synchronous;
        }
        self.check_writable()?;
        match self.mode {
            Mode::Asynchronous => ensure!(self.is_ready(), UsageError::NotReady.into()),
            _ => ensure!(!self.pending, UsageError::WritePending.into()),
        }
        Ok(())
    }

    /// Frames `data` in pieces of at most `chunk_size`, optionally ending the body.
    ///
    /// The encoder only advances when the whole frame could be encoded.
    fn encode(&mut self, mut data: Bytes, chunk_size: usize, eof: bool) -> Result<Bytes, BodyError> {
        let mut encoder = self.encoder.clone();
        let mut dst = BytesMut::with_capacity(data.len() + 16);
        while !data.is_empty() {
            let piece = data.split_to(chunk_size.min(data.len()));
            encoder.encode(PayloadItem::Chunk(piece), &mut dst)?;
        }
        if eof {
            encoder.encode(PayloadItem::<Bytes>::Eof, &mut dst)?;
        }
        self.encoder = encoder;
        Ok(dst.freeze())
    }

    fn notification(&mut self, notification: Notification) -> Option<(Arc<dyn WriteListener>, Notification)> {
        let listener = self.listener.as_ref().map(Arc::clone)?;
        Some((listener, notification))
    }
}

fn notify(dispatch: Option<(Arc<dyn WriteListener>, Notification)>) {
    let Some((listener, notification)) = dispatch else {
        return;
    };
    match notification {
        Notification::WritePossible => {
            if let Err(error) = listener.on_write_possible() {
                listener.on_error(error);
            }
        }
        Notification::Error(error) => listener.on_error(error),
    }
}

impl OutputShared {
    fn lock(&self) -> MutexGuard<'_, OutputState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Completion of the write in flight.
    fn on_write_complete(&self, result: Result<(), TransportError>) {
        let mut close_listener = None;
        let dispatch = {
            let mut state = self.lock();
            state.pending = false;

            if state.mode == Mode::Asynchronous {
                match result {
                    Ok(()) => {
                        if state.closed {
                            close_listener = state.close_listener.take();
                            None
                        } else if state.call_listener {
                            state.call_listener = false;
                            state.notification(Notification::WritePossible)
                        } else {
                            None
                        }
                    }
                    Err(e) => {
                        let error = BodyError::from(e);
                        state.failure = Some(error.clone());
                        state.notification(Notification::Error(error))
                    }
                }
            } else {
                state.write_result = Some(result);
                self.changed.notify_all();
                None
            }
        };

        notify(dispatch);
        if let Some(close_listener) = close_listener {
            close_listener();
        }
    }
}

impl BodyOutputStream {
    /// Creates a stream for a body framed as `payload_size`, collecting
    /// `chunk_size` bytes before each write.
    pub fn new(payload_size: PayloadSize, chunk_size: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        let state = OutputState {
            mode: Mode::Undecided,
            encoder: PayloadEncoder::from(payload_size),
            buffer: BytesMut::with_capacity(chunk_size),
            downstream: None,
            listener: None,
            listener_set: false,
            call_listener: true,
            pending: false,
            closed: false,
            failure: None,
            write_result: None,
            close_listener: None,
        };
        Self {
            shared: Arc::new(OutputShared {
                state: Mutex::new(state),
                changed: Condvar::new(),
                chunk_size,
                payload_size,
            }),
        }
    }

    /// A body sent with chunked transfer encoding.
    pub fn chunked(chunk_size: usize) -> Self {
        Self::new(PayloadSize::new_chunked(), chunk_size)
    }

    /// A body of exactly `length` bytes, announced with Content-Length.
    pub fn fixed_length(length: u64, chunk_size: usize) -> Self {
        Self::new(PayloadSize::new_length(length), chunk_size)
    }

    pub fn payload_size(&self) -> PayloadSize {
        self.shared.payload_size
    }

    pub fn chunk_size(&self) -> usize {
        self.shared.chunk_size
    }

    fn lock(&self) -> MutexGuard<'_, OutputState> {
        self.shared.lock()
    }

    /// Writes `data` into the body.
    ///
    /// In synchronous mode this blocks until the stream is open and, when a
    /// chunk had to be sent, until the write completed. In asynchronous mode
    /// it must only be called while [`is_ready`](Self::is_ready) is true.
    pub fn write(&self, data: &[u8]) -> Result<(), BodyError> {
        let mut state = self.lock();
        state.check_can_write()?;

        if data.is_empty() {
            return Ok(());
        }

        let chunk_size = self.shared.chunk_size;
        if state.buffer.len() + data.len() < chunk_size {
            state.buffer.extend_from_slice(data);
            return Ok(());
        }

        // send whole chunks only, the remainder waits in the buffer
        let keep = (state.buffer.len() + data.len()) % chunk_size;
        let split = data.len() - keep;
        let mut out = BytesMut::with_capacity(state.buffer.len() + split);
        out.extend_from_slice(&state.buffer);
        out.extend_from_slice(&data[..split]);

        let frame = state.encode(out.freeze(), chunk_size, false)?;
        state.buffer.clear();
        state.buffer.extend_from_slice(&data[split..]);
        self.send(state, frame)
    }

    /// Sends whatever is buffered, even if it is less than a chunk.
    pub fn flush(&self) -> Result<(), BodyError> {
        let mut state = self.lock();
        if state.closed || state.buffer.is_empty() {
            return Ok(());
        }
        state.check_can_write()?;

        let data = Bytes::copy_from_slice(&state.buffer);
        let frame = state.encode(data, self.shared.chunk_size, false)?;
        state.buffer.clear();
        self.send(state, frame)
    }

    /// Flushes the buffer and ends the body.
    ///
    /// For chunked bodies this writes the terminating empty chunk. The close
    /// listener runs once the last write has completed. Closing twice is a
    /// no-op.
    pub fn close(&self) -> Result<(), BodyError> {
        let mut state = self.lock();
        if state.closed {
            return Ok(());
        }
        state.check_can_write()?;

        let data = Bytes::copy_from_slice(&state.buffer);
        let frame = state.encode(data, self.shared.chunk_size, true)?;
        state.buffer.clear();
        state.closed = true;
        trace!(len = frame.len(), "closing body output stream");

        if frame.is_empty() {
            let close_listener = state.close_listener.take();
            drop(state);
            if let Some(close_listener) = close_listener {
                close_listener();
            }
            return Ok(());
        }

        self.send(state, frame)
    }

    fn send(&self, mut state: MutexGuard<'_, OutputState>, frame: Bytes) -> Result<(), BodyError> {
        if state.mode == Mode::Asynchronous {
            let Some(downstream) = state.downstream.as_ref().map(Arc::clone) else {
                return Err(UsageError::NotReady.into());
            };
            state.pending = true;
            drop(state);

            let shared = Arc::clone(&self.shared);
            downstream.write(frame, WriteCompletion::new(move |result| shared.on_write_complete(result)));
            return Ok(());
        }

        // the slot is held while waiting for the request head to go out
        state.pending = true;
        state.write_result = None;
        let downstream = loop {
            if let Some(failure) = &state.failure {
                let failure = failure.clone();
                state.pending = false;
                return Err(failure);
            }
            if let Some(downstream) = &state.downstream {
                break Arc::clone(downstream);
            }
            state = self.shared.changed.wait(state).unwrap_or_else(PoisonError::into_inner);
        };
        drop(state);

        let shared = Arc::clone(&self.shared);
        downstream.write(frame, WriteCompletion::new(move |result| shared.on_write_complete(result)));

        let mut state = self.lock();
        while state.pending {
            state = self.shared.changed.wait(state).unwrap_or_else(PoisonError::into_inner);
        }

        if let Some(Err(e)) = state.write_result.take() {
            let error = BodyError::from(e);
            state.failure = Some(error.clone());
            return Err(error);
        }

        if state.closed {
            let close_listener = state.close_listener.take();
            drop(state);
            if let Some(close_listener) = close_listener {
                close_listener();
            }
        }
        Ok(())
    }

    /// Whether a write is possible right now, asynchronous mode only.
    ///
    /// Returning `false` arms the listener for the next `on_write_possible`.
    pub fn is_ready(&self) -> Result<bool, UsageError> {
        let mut state = self.lock();
        ensure!(state.mode != Mode::Synchronous, UsageError::AsyncOperationInSyncMode);
        let ready = state.is_ready();
        if !ready {
            state.call_listener = true;
        }
        Ok(ready)
    }

    /// Attaches the listener and commits the stream to asynchronous mode.
    ///
    /// The listener is called right away when the stream is already open.
    pub fn set_write_listener(&self, listener: Arc<dyn WriteListener>) -> Result<(), UsageError> {
        let dispatch = {
            let mut state = self.lock();
            ensure!(!state.listener_set, UsageError::ListenerAlreadySet);
            state.mode.enter_async()?;
            state.listener_set = true;
            state.listener = Some(listener);

            if state.is_ready() {
                state.call_listener = false;
                state.notification(Notification::WritePossible)
            } else {
                state.call_listener = true;
                None
            }
        };

        notify(dispatch);
        Ok(())
    }

    /// Runs `listener` once the body has been completely handed to the transport.
    pub fn set_close_listener<F>(&self, listener: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.lock().close_listener = Some(Box::new(listener));
    }

    /// Connects the stream to the layer its frames are written to.
    ///
    /// Blocked synchronous writers resume, an asynchronous listener is told
    /// that writing is possible.
    pub fn open(&self, downstream: Arc<dyn DownstreamWriter>) {
        let dispatch = {
            let mut state = self.lock();
            if state.downstream.is_some() {
                warn!("body output stream opened twice, keeping the first downstream");
                return;
            }
            state.downstream = Some(downstream);
            self.shared.changed.notify_all();

            if state.mode == Mode::Asynchronous && state.call_listener && state.is_ready() {
                state.call_listener = false;
                state.notification(Notification::WritePossible)
            } else {
                None
            }
        };

        notify(dispatch);
    }

    /// Fails the stream because the request can no longer be sent.
    ///
    /// Ignored when the body was already sent completely.
    pub fn fail(&self, error: TransportError) {
        let dispatch = {
            let mut state = self.lock();
            if state.failure.is_some() || (state.closed && !state.pending) {
                return;
            }
            let error = BodyError::from(error);
            state.failure = Some(error.clone());
            self.shared.changed.notify_all();

            if state.mode == Mode::Asynchronous { state.notification(Notification::Error(error)) } else { None }
        };

        notify(dispatch);
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

impl fmt::Debug for BodyOutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("BodyOutputStream")
            .field("payload_size", &self.shared.payload_size)
            .field("chunk_size", &self.shared.chunk_size)
            .field("mode", &state.mode)
            .field("buffered", &state.buffer.len())
            .field("opened", &state.downstream.is_some())
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}

impl io::Write for BodyOutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        BodyOutputStream::write(self, buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        BodyOutputStream::flush(self).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct MockDownstream {
        written: Mutex<Vec<Bytes>>,
        held: Mutex<Vec<WriteCompletion>>,
        hold: bool,
        fail: bool,
    }

    impl MockDownstream {
        fn holding() -> Arc<Self> {
            Arc::new(Self { hold: true, ..Self::default() })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self { fail: true, ..Self::default() })
        }

        fn written(&self) -> String {
            self.written.lock().unwrap().iter().map(|b| String::from_utf8_lossy(b).into_owned()).collect()
        }

        fn release(&self) {
            let held: Vec<_> = self.held.lock().unwrap().drain(..).collect();
            for completion in held {
                completion.complete(Ok(()));
            }
        }
    }

    impl DownstreamWriter for MockDownstream {
        fn write(&self, data: Bytes, completion: WriteCompletion) {
            self.written.lock().unwrap().push(data);
            if self.hold {
                self.held.lock().unwrap().push(completion);
            } else if self.fail {
                completion.complete(Err(TransportError::ConnectionClosed));
            } else {
                completion.complete(Ok(()));
            }
        }
    }

    #[derive(Default)]
    struct CountingListener {
        write_possible: AtomicUsize,
        errors: AtomicUsize,
    }

    impl WriteListener for CountingListener {
        fn on_write_possible(&self) -> Result<(), BodyError> {
            self.write_possible.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_error(&self, _error: BodyError) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn sync_chunked_body() {
        let downstream = Arc::new(MockDownstream::default());
        let stream = BodyOutputStream::chunked(4);
        let closed = Arc::new(AtomicUsize::new(0));
        let closed_count = Arc::clone(&closed);
        stream.set_close_listener(move || {
            closed_count.fetch_add(1, Ordering::SeqCst);
        });
        stream.open(Arc::clone(&downstream) as Arc<dyn DownstreamWriter>);

        stream.write(b"ab").unwrap();
        assert_eq!(downstream.written(), "");

        stream.write(b"cdefghij").unwrap();
        assert_eq!(downstream.written(), "4\r\nabcd\r\n4\r\nefgh\r\n");

        stream.close().unwrap();
        stream.close().unwrap();
        assert_eq!(downstream.written(), "4\r\nabcd\r\n4\r\nefgh\r\n2\r\nij\r\n0\r\n\r\n");
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        assert!(matches!(stream.write(b"late"), Err(BodyError::Usage(UsageError::StreamClosed))));
    }

    #[test]
    fn flush_sends_partial_chunk() {
        let downstream = Arc::new(MockDownstream::default());
        let stream = BodyOutputStream::chunked(1024);
        stream.open(Arc::clone(&downstream) as Arc<dyn DownstreamWriter>);

        stream.write(b"hello").unwrap();
        stream.flush().unwrap();
        stream.flush().unwrap();
        assert_eq!(downstream.written(), "5\r\nhello\r\n");
    }

    #[test]
    fn sync_write_waits_for_open() {
        let downstream = Arc::new(MockDownstream::default());
        let stream = BodyOutputStream::chunked(4);
        let writer = stream.clone();

        let handle = thread::spawn(move || writer.write(b"12345678"));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(downstream.written(), "");

        stream.open(Arc::clone(&downstream) as Arc<dyn DownstreamWriter>);
        handle.join().unwrap().unwrap();
        assert_eq!(downstream.written(), "4\r\n1234\r\n4\r\n5678\r\n");
    }

    #[test]
    fn concurrent_write_while_waiting_for_open() {
        let downstream = MockDownstream::holding();
        let stream = BodyOutputStream::chunked(2);
        let writer = stream.clone();

        let handle = thread::spawn(move || writer.write(b"aa"));
        thread::sleep(Duration::from_millis(20));
        assert!(matches!(stream.write(b"bb"), Err(BodyError::Usage(UsageError::WritePending))));

        stream.open(Arc::clone(&downstream) as Arc<dyn DownstreamWriter>);
        while downstream.held.lock().unwrap().is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(downstream.held.lock().unwrap().len(), 1);
        downstream.release();

        handle.join().unwrap().unwrap();
        assert_eq!(downstream.written(), "2\r\naa\r\n");
    }

    #[test]
    fn fail_wakes_writer_waiting_for_open() {
        let stream = BodyOutputStream::chunked(2);
        let writer = stream.clone();

        let handle = thread::spawn(move || writer.write(b"1234"));
        thread::sleep(Duration::from_millis(20));
        stream.fail(TransportError::Closed);

        assert!(matches!(handle.join().unwrap(), Err(BodyError::Transport(TransportError::Closed))));
    }

    #[test]
    fn fixed_length_body() {
        let downstream = Arc::new(MockDownstream::default());
        let stream = BodyOutputStream::fixed_length(5, 4);
        stream.open(Arc::clone(&downstream) as Arc<dyn DownstreamWriter>);

        stream.write(b"hello").unwrap();
        assert_eq!(downstream.written(), "hell");
        assert!(matches!(stream.write(b"!!!!"), Err(BodyError::Send(_))));
        stream.close().unwrap();
        assert_eq!(downstream.written(), "hello");
    }

    #[test]
    fn transport_failure_sticks() {
        let stream = BodyOutputStream::chunked(2);
        stream.open(MockDownstream::failing());

        assert!(matches!(stream.write(b"abcd"), Err(BodyError::Transport(TransportError::ConnectionClosed))));
        assert!(matches!(stream.write(b"ef"), Err(BodyError::Transport(TransportError::ConnectionClosed))));
        assert!(stream.close().is_err());
    }

    #[test]
    fn async_writes_follow_readiness() {
        let downstream = MockDownstream::holding();
        let listener = Arc::new(CountingListener::default());
        let stream = BodyOutputStream::chunked(4);

        stream.set_write_listener(Arc::clone(&listener) as Arc<dyn WriteListener>).unwrap();
        assert_eq!(stream.is_ready(), Ok(false));
        assert!(matches!(stream.write(b"1234"), Err(BodyError::Usage(UsageError::NotReady))));
        assert_eq!(listener.write_possible.load(Ordering::SeqCst), 0);

        stream.open(Arc::clone(&downstream) as Arc<dyn DownstreamWriter>);
        assert_eq!(listener.write_possible.load(Ordering::SeqCst), 1);
        assert_eq!(stream.is_ready(), Ok(true));

        stream.write(b"12345678").unwrap();
        assert_eq!(stream.is_ready(), Ok(false));
        assert!(matches!(stream.write(b"9"), Err(BodyError::Usage(UsageError::NotReady))));

        downstream.release();
        assert_eq!(listener.write_possible.load(Ordering::SeqCst), 2);
        assert_eq!(stream.is_ready(), Ok(true));

        stream.close().unwrap();
        downstream.release();
        assert_eq!(downstream.written(), "4\r\n1234\r\n4\r\n5678\r\n0\r\n\r\n");
        assert_eq!(listener.write_possible.load(Ordering::SeqCst), 2);
        assert_eq!(listener.errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn async_failure_reaches_listener() {
        let listener = Arc::new(CountingListener::default());
        let stream = BodyOutputStream::chunked(2);
        stream.set_write_listener(Arc::clone(&listener) as Arc<dyn WriteListener>).unwrap();
        stream.open(MockDownstream::failing());

        stream.write(b"ab").unwrap();
        assert_eq!(listener.errors.load(Ordering::SeqCst), 1);
        assert_eq!(stream.is_ready(), Ok(false));
    }

    #[test]
    fn modes_do_not_mix() {
        let stream = BodyOutputStream::chunked(8);
        stream.write(b"a").unwrap();
        assert_eq!(stream.is_ready(), Err(UsageError::AsyncOperationInSyncMode));
        assert_eq!(
            stream.set_write_listener(Arc::new(CountingListener::default())),
            Err(UsageError::AsyncOperationInSyncMode)
        );

        let stream = BodyOutputStream::chunked(8);
        stream.set_write_listener(Arc::new(CountingListener::default())).unwrap();
        assert_eq!(
            stream.set_write_listener(Arc::new(CountingListener::default())),
            Err(UsageError::ListenerAlreadySet)
        );
    }
}
