//! The consumer side of a response body.
//!
//! [`BodyInputStream`] sits between the response parser, which pushes body
//! bytes into it as they are decoded, and the application, which reads them
//! either with blocking calls or through a [`ReadListener`].
//!
//! The stream buffers everything the parser pushes and never applies
//! backpressure to the connection: the parser must be able to finish a
//! message (and free the connection for the next one) regardless of how fast
//! the application reads.

use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use bytes::{Buf, Bytes};
use tracing::trace;

use super::executor::ListenerExecutor;
use super::listener::{Mode, ReadListener};
use crate::ensure;
use crate::protocol::{BodyError, TransportError, UsageError};

/// A response body stream, readable synchronously or asynchronously.
///
/// Clones share the same stream.
#[derive(Clone)]
pub struct BodyInputStream {
    shared: Arc<Shared>,
}

struct Shared {
    state: Mutex<InputState>,
    data_ready: Condvar,
}

#[derive(Default)]
struct InputState {
    mode: Mode,
    data: VecDeque<Bytes>,
    buffered: usize,
    terminal: Option<Terminal>,
    closed: bool,
    listener: Option<Arc<dyn ReadListener>>,
    listener_set: bool,
    executor: Option<ListenerExecutor>,
    call_listener: bool,
    terminal_delivered: bool,
}

/// How the producer ended the stream.
enum Terminal {
    Eof,
    Error(TransportError),
}

enum Notification {
    DataAvailable,
    AllDataRead,
    Error(BodyError),
}

/// A listener call prepared under the lock and run after releasing it.
struct Dispatch {
    listener: Arc<dyn ReadListener>,
    executor: Option<ListenerExecutor>,
    notification: Notification,
}

impl Dispatch {
    fn run(self) {
        let Dispatch { listener, executor, notification } = self;
        let job = move || {
            let result = match notification {
                Notification::DataAvailable => listener.on_data_available(),
                Notification::AllDataRead => listener.on_all_data_read(),
                Notification::Error(error) => {
                    listener.on_error(error);
                    Ok(())
                }
            };
            if let Err(error) = result {
                listener.on_error(error);
            }
        };
        match executor {
            Some(executor) => executor.execute(Box::new(job)),
            None => job(),
        }
    }
}

impl InputState {
    fn copy_into(&mut self, buf: &mut [u8]) -> usize {
        let mut n = 0;
        while n < buf.len() {
            let Some(front) = self.data.front_mut() else {
                break;
            };
            let take = front.len().min(buf.len() - n);
            buf[n..n + take].copy_from_slice(&front[..take]);
            front.advance(take);
            if front.is_empty() {
                self.data.pop_front();
            }
            n += take;
        }
        self.buffered -= n;
        n
    }

    /// Non-blocking read of whatever is buffered, or the terminal outcome.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<Option<usize>, BodyError> {
        ensure!(!self.closed, UsageError::StreamClosed.into());
        if self.buffered > 0 {
            return Ok(Some(self.copy_into(buf)));
        }
        match &self.terminal {
            Some(Terminal::Eof) => Ok(Some(0)),
            Some(Terminal::Error(e)) => Err(e.clone().into()),
            None => Ok(None),
        }
    }

    fn data_dispatch(&mut self) -> Option<Dispatch> {
        let listener = self.listener.as_ref().map(Arc::clone)?;
        self.call_listener = false;
        Some(Dispatch { listener, executor: self.executor.clone(), notification: Notification::DataAvailable })
    }

    /// The final listener call, once the producer is done and the buffer is
    /// drained. Delivered at most once; the listener is released afterwards.
    fn terminal_dispatch(&mut self) -> Option<Dispatch> {
        if self.terminal_delivered || self.buffered > 0 || self.listener.is_none() {
            return None;
        }
        let notification = match self.terminal.as_ref()? {
            Terminal::Eof => Notification::AllDataRead,
            Terminal::Error(e) => Notification::Error(e.clone().into()),
        };
        self.terminal_delivered = true;
        let listener = self.listener.take()?;
        Some(Dispatch { listener, executor: self.executor.clone(), notification })
    }

    fn listening(&self) -> bool {
        self.mode == Mode::Asynchronous && self.call_listener && self.listener.is_some()
    }
}

impl BodyInputStream {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared { state: Mutex::new(InputState::default()), data_ready: Condvar::new() }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InputState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads body bytes into `buf`, returning `Ok(0)` at the end of the body.
    ///
    /// On an undecided stream this commits to synchronous mode and blocks
    /// until data, the end of the body, or a failure arrives. In asynchronous
    /// mode it must only be called while [`is_ready`](Self::is_ready) is true.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, BodyError> {
        let mut state = self.lock();

        if state.mode == Mode::Asynchronous {
            return state.read_available(buf)?.ok_or_else(|| UsageError::NotReady.into());
        }

        state.mode.enter_sync()?;
        loop {
            ensure!(!state.closed, UsageError::StreamClosed.into());
            if buf.is_empty() {
                return Ok(0);
            }
            if let Some(n) = state.read_available(buf)? {
                return Ok(n);
            }
            state = self.shared.data_ready.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Reads a single byte, `None` at the end of the body.
    pub fn read_byte(&self) -> Result<Option<u8>, BodyError> {
        let mut byte = [0u8; 1];
        Ok((self.read(&mut byte)? == 1).then_some(byte[0]))
    }

    /// Discards up to `n` bytes, blocking like [`read`](Self::read).
    /// Returns how many were skipped, fewer than `n` only at the end of the
    /// body.
    pub fn skip(&self, n: usize) -> Result<usize, BodyError> {
        let mut scratch = [0u8; 512];
        let mut skipped = 0;
        while skipped < n {
            let want = (n - skipped).min(scratch.len());
            match self.read(&mut scratch[..want])? {
                0 => break,
                read => skipped += read,
            }
        }
        Ok(skipped)
    }

    /// Like [`read`](Self::read) in synchronous mode, but returns `Ok(None)`
    /// instead of blocking when nothing is buffered yet.
    pub fn try_read(&self, buf: &mut [u8]) -> Result<Option<usize>, BodyError> {
        let mut state = self.lock();
        state.mode.enter_sync()?;
        state.read_available(buf)
    }

    /// Number of bytes that can be read without blocking.
    pub fn available(&self) -> Result<usize, BodyError> {
        let state = self.lock();
        ensure!(!state.closed, UsageError::StreamClosed.into());
        if state.buffered == 0 {
            if let Some(Terminal::Error(e)) = &state.terminal {
                return Err(e.clone().into());
            }
        }
        Ok(state.buffered)
    }

    /// Whether data can be read without blocking, asynchronous mode only.
    ///
    /// Returning `false` arms the listener: it gets `on_data_available` as
    /// soon as data arrives. Once the body has ended and everything was read,
    /// this also delivers `on_all_data_read` (or `on_error`) exactly once.
    /// An undecided stream is never ready.
    pub fn is_ready(&self) -> Result<bool, UsageError> {
        let (ready, dispatch) = {
            let mut state = self.lock();
            match state.mode {
                Mode::Synchronous => return Err(UsageError::AsyncOperationInSyncMode),
                Mode::Undecided => return Ok(false),
                Mode::Asynchronous => {}
            }

            if state.buffered > 0 && !state.closed {
                (true, None)
            } else {
                state.call_listener = true;
                (false, state.terminal_dispatch())
            }
        };

        if let Some(dispatch) = dispatch {
            dispatch.run();
        }
        Ok(ready)
    }

    /// Attaches the listener and commits the stream to asynchronous mode.
    ///
    /// If data is already buffered the listener is called right away, as it
    /// is when the body already ended without data.
    pub fn set_read_listener(&self, listener: Arc<dyn ReadListener>) -> Result<(), UsageError> {
        let dispatch = {
            let mut state = self.lock();
            ensure!(!state.listener_set, UsageError::ListenerAlreadySet);
            state.mode.enter_async()?;
            state.listener_set = true;
            state.listener = Some(listener);

            if state.buffered > 0 {
                state.data_dispatch()
            } else {
                state.call_listener = true;
                state.terminal_dispatch()
            }
        };

        if let Some(dispatch) = dispatch {
            dispatch.run();
        }
        Ok(())
    }

    /// Runs listener callbacks on `executor` and commits the stream to
    /// asynchronous mode.
    pub fn set_listener_executor(&self, executor: ListenerExecutor) -> Result<(), UsageError> {
        let mut state = self.lock();
        state.mode.enter_async()?;
        state.executor = Some(executor);
        Ok(())
    }

    /// Closes the consumer side. Buffered and later data is discarded and
    /// blocked readers wake up with [`UsageError::StreamClosed`].
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        trace!(discarded = state.buffered, "closing body input stream");
        state.closed = true;
        state.data.clear();
        state.buffered = 0;
        self.shared.data_ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Whether the producer has ended the stream and nothing is left to read.
    pub fn is_finished(&self) -> bool {
        let state = self.lock();
        state.terminal.is_some() && state.buffered == 0
    }

    /// Pushes a piece of the body, called by the producer.
    pub fn notify_data_available(&self, data: Bytes) -> Result<(), UsageError> {
        let dispatch = {
            let mut state = self.lock();
            ensure!(state.terminal.is_none(), UsageError::ClosedForInput);
            if data.is_empty() || state.closed {
                return Ok(());
            }

            state.buffered += data.len();
            state.data.push_back(data);
            self.shared.data_ready.notify_all();

            if state.listening() { state.data_dispatch() } else { None }
        };

        if let Some(dispatch) = dispatch {
            dispatch.run();
        }
        Ok(())
    }

    /// Marks the end of the body, called by the producer.
    pub fn notify_all_data_read(&self) -> Result<(), UsageError> {
        self.finish(Terminal::Eof)
    }

    /// Fails the body, called by the producer. Data buffered before the
    /// failure stays readable; the error surfaces once it is drained.
    pub fn notify_error(&self, error: TransportError) -> Result<(), UsageError> {
        self.finish(Terminal::Error(error))
    }

    fn finish(&self, terminal: Terminal) -> Result<(), UsageError> {
        let dispatch = {
            let mut state = self.lock();
            ensure!(state.terminal.is_none(), UsageError::ClosedForInput);
            state.terminal = Some(terminal);
            self.shared.data_ready.notify_all();

            if state.listening() { state.terminal_dispatch() } else { None }
        };

        if let Some(dispatch) = dispatch {
            dispatch.run();
        }
        Ok(())
    }
}

impl Default for BodyInputStream {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BodyInputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("BodyInputStream")
            .field("mode", &state.mode)
            .field("buffered", &state.buffered)
            .field("closed_for_input", &state.terminal.is_some())
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}

impl io::Read for BodyInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        BodyInputStream::read(self, buf).map_err(Into::into)
    }
}

impl io::Read for &BodyInputStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        BodyInputStream::read(self, buf).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use std::thread;
    use std::time::Duration;

    /// Drains the stream on every `on_data_available` and records what it saw.
    struct RecordingListener {
        stream: BodyInputStream,
        events: Mutex<Vec<String>>,
        fail_on_data: bool,
    }

    impl RecordingListener {
        fn new(stream: &BodyInputStream) -> Arc<Self> {
            Arc::new(Self { stream: stream.clone(), events: Mutex::new(Vec::new()), fail_on_data: false })
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ReadListener for RecordingListener {
        fn on_data_available(&self) -> Result<(), BodyError> {
            if self.fail_on_data {
                return Err(UsageError::NotReady.into());
            }
            let mut buf = [0u8; 64];
            while self.stream.is_ready()? {
                let n = self.stream.read(&mut buf)?;
                self.events.lock().unwrap().push(format!("data:{}", String::from_utf8_lossy(&buf[..n])));
            }
            Ok(())
        }

        fn on_all_data_read(&self) -> Result<(), BodyError> {
            self.events.lock().unwrap().push("all".into());
            Ok(())
        }

        fn on_error(&self, error: BodyError) {
            self.events.lock().unwrap().push(format!("error:{error}"));
        }
    }

    #[test]
    fn sync_read_blocks_until_data() {
        let stream = BodyInputStream::new();
        let producer = stream.clone();

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.notify_data_available(Bytes::from_static(b"hello ")).unwrap();
            thread::sleep(Duration::from_millis(20));
            producer.notify_data_available(Bytes::from_static(b"world")).unwrap();
            producer.notify_all_data_read().unwrap();
        });

        let mut body = String::new();
        (&stream).read_to_string(&mut body).unwrap();
        handle.join().unwrap();

        assert_eq!(body, "hello world");
        assert_eq!(stream.read(&mut [0u8; 4]).unwrap(), 0);
        assert!(stream.is_finished());
    }

    #[test]
    fn data_before_error_stays_readable() {
        let stream = BodyInputStream::new();
        stream.notify_data_available(Bytes::from_static(b"abc")).unwrap();
        stream.notify_error(TransportError::ConnectionClosed).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).unwrap(), 3);
        assert!(matches!(stream.read(&mut buf), Err(BodyError::Transport(TransportError::ConnectionClosed))));
        assert!(stream.available().is_err());
    }

    #[test]
    fn producer_cannot_notify_after_the_end() {
        let stream = BodyInputStream::new();
        stream.notify_all_data_read().unwrap();
        assert_eq!(stream.notify_data_available(Bytes::from_static(b"x")), Err(UsageError::ClosedForInput));
        assert_eq!(stream.notify_all_data_read(), Err(UsageError::ClosedForInput));
        assert_eq!(stream.notify_error(TransportError::Closed), Err(UsageError::ClosedForInput));
    }

    #[test]
    fn try_read_does_not_block() {
        let stream = BodyInputStream::new();
        let mut buf = [0u8; 4];
        assert_eq!(stream.try_read(&mut buf).unwrap(), None);

        stream.notify_data_available(Bytes::from_static(b"abcdef")).unwrap();
        assert_eq!(stream.available().unwrap(), 6);
        assert_eq!(stream.try_read(&mut buf).unwrap(), Some(4));
        assert_eq!(&buf, b"abcd");
        assert_eq!(stream.read_byte().unwrap(), Some(b'e'));
        assert_eq!(stream.available().unwrap(), 1);

        stream.notify_all_data_read().unwrap();
        assert_eq!(stream.try_read(&mut buf).unwrap(), Some(1));
        assert_eq!(stream.try_read(&mut buf).unwrap(), Some(0));
        assert_eq!(stream.read_byte().unwrap(), None);
    }

    #[test]
    fn skip_discards_across_pieces() {
        let stream = BodyInputStream::new();
        stream.notify_data_available(Bytes::from_static(b"abc")).unwrap();
        stream.notify_data_available(Bytes::from_static(b"defg")).unwrap();
        stream.notify_all_data_read().unwrap();

        assert_eq!(stream.skip(5).unwrap(), 5);
        assert_eq!(stream.read_byte().unwrap(), Some(b'f'));
        assert_eq!(stream.skip(10).unwrap(), 1);
    }

    #[test]
    fn modes_do_not_mix() {
        let stream = BodyInputStream::new();
        assert_eq!(stream.is_ready(), Ok(false));
        stream.notify_data_available(Bytes::from_static(b"a")).unwrap();
        stream.read(&mut [0u8; 1]).unwrap();

        assert_eq!(stream.is_ready(), Err(UsageError::AsyncOperationInSyncMode));
        let listener = RecordingListener::new(&stream);
        assert_eq!(stream.set_read_listener(listener), Err(UsageError::AsyncOperationInSyncMode));

        let stream = BodyInputStream::new();
        stream.set_read_listener(RecordingListener::new(&stream)).unwrap();
        assert!(matches!(stream.try_read(&mut [0u8; 1]), Err(BodyError::Usage(UsageError::SyncOperationInAsyncMode))));
        assert!(matches!(stream.read(&mut [0u8; 1]), Err(BodyError::Usage(UsageError::NotReady))));
        assert_eq!(stream.set_read_listener(RecordingListener::new(&stream)), Err(UsageError::ListenerAlreadySet));
    }

    #[test]
    fn listener_follows_readiness() {
        let stream = BodyInputStream::new();
        let listener = RecordingListener::new(&stream);
        stream.set_read_listener(Arc::clone(&listener) as Arc<dyn ReadListener>).unwrap();
        assert!(listener.events().is_empty());

        // each notification is drained by the listener before the next one
        stream.notify_data_available(Bytes::from_static(b"abcd")).unwrap();
        stream.notify_data_available(Bytes::from_static(b"ef")).unwrap();
        stream.notify_all_data_read().unwrap();

        assert_eq!(listener.events(), vec!["data:abcd", "data:ef", "all"]);

        // the end is reported exactly once
        assert_eq!(stream.is_ready(), Ok(false));
        assert_eq!(listener.events().len(), 3);
    }

    #[test]
    fn listener_attached_late_sees_buffered_data() {
        let stream = BodyInputStream::new();
        stream.notify_data_available(Bytes::from_static(b"early")).unwrap();
        stream.notify_all_data_read().unwrap();

        let listener = RecordingListener::new(&stream);
        stream.set_read_listener(Arc::clone(&listener) as Arc<dyn ReadListener>).unwrap();
        assert_eq!(listener.events(), vec!["data:early", "all"]);
    }

    #[test]
    fn listener_attached_after_empty_body() {
        let stream = BodyInputStream::new();
        stream.notify_all_data_read().unwrap();

        let listener = RecordingListener::new(&stream);
        stream.set_read_listener(Arc::clone(&listener) as Arc<dyn ReadListener>).unwrap();
        assert_eq!(listener.events(), vec!["all"]);
    }

    #[test]
    fn listener_gets_transport_error_once() {
        let stream = BodyInputStream::new();
        let listener = RecordingListener::new(&stream);
        stream.set_read_listener(Arc::clone(&listener) as Arc<dyn ReadListener>).unwrap();

        stream.notify_error(TransportError::ConnectionClosed).unwrap();
        stream.is_ready().unwrap();

        assert_eq!(listener.events(), vec!["error:connection closed by peer"]);
    }

    #[test]
    fn listener_failure_is_reported_to_on_error() {
        let stream = BodyInputStream::new();
        let listener = Arc::new(RecordingListener {
            stream: stream.clone(),
            events: Mutex::new(Vec::new()),
            fail_on_data: true,
        });
        stream.set_read_listener(Arc::clone(&listener) as Arc<dyn ReadListener>).unwrap();
        stream.notify_data_available(Bytes::from_static(b"x")).unwrap();

        assert_eq!(listener.events(), vec![format!("error:{}", UsageError::NotReady)]);
    }

    #[test]
    fn close_wakes_blocked_reader() {
        let stream = BodyInputStream::new();
        let reader = stream.clone();
        let handle = thread::spawn(move || reader.read(&mut [0u8; 8]));

        thread::sleep(Duration::from_millis(20));
        stream.close();

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(BodyError::Usage(UsageError::StreamClosed))));

        // data arriving after close is dropped silently
        stream.notify_data_available(Bytes::from_static(b"late")).unwrap();
        assert!(stream.available().is_err());
    }

    #[tokio::test]
    async fn listener_runs_on_executor() {
        struct Forward(BodyInputStream, Mutex<Option<futures::channel::oneshot::Sender<Vec<u8>>>>, Mutex<Vec<u8>>);

        impl ReadListener for Forward {
            fn on_data_available(&self) -> Result<(), BodyError> {
                let mut buf = [0u8; 16];
                while self.0.is_ready()? {
                    let n = self.0.read(&mut buf)?;
                    self.2.lock().unwrap().extend_from_slice(&buf[..n]);
                }
                Ok(())
            }

            fn on_all_data_read(&self) -> Result<(), BodyError> {
                if let Some(done) = self.1.lock().unwrap().take() {
                    let _ = done.send(self.2.lock().unwrap().clone());
                }
                Ok(())
            }

            fn on_error(&self, _error: BodyError) {}
        }

        let stream = BodyInputStream::new();
        let (done_tx, done_rx) = futures::channel::oneshot::channel();
        stream.set_listener_executor(ListenerExecutor::current()).unwrap();
        stream
            .set_read_listener(Arc::new(Forward(stream.clone(), Mutex::new(Some(done_tx)), Mutex::new(Vec::new()))))
            .unwrap();

        stream.notify_data_available(Bytes::from_static(b"from ")).unwrap();
        stream.notify_data_available(Bytes::from_static(b"executor")).unwrap();
        stream.notify_all_data_read().unwrap();

        assert_eq!(done_rx.await.unwrap(), b"from executor");
    }
}
