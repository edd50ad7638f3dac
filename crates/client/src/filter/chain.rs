use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use bytes::Bytes;
use futures::channel::mpsc;
use tracing::{trace, warn};

use super::{ChainEvent, DownstreamWriter, Filter, ResponseEvent, WriteCompletion};
use crate::protocol::{HttpRequest, TransportError};

type Deferred = Box<dyn FnOnce() + Send>;

/// An event on its way to a chain position.
enum Hop {
    /// Travelling towards the socket, delivered to the filter at the index.
    Down(usize, Downward),
    /// Travelling towards the application; `None` is the application itself.
    Up(Option<usize>, ChainEvent),
}

enum Downward {
    Connect(String),
    Write(Bytes, WriteCompletion),
    Send(HttpRequest, WriteCompletion),
    Close,
}

struct Inner {
    filters: Mutex<Vec<Box<dyn Filter>>>,
    pending: Mutex<Pending>,
    events: mpsc::UnboundedSender<ChainEvent>,
}

#[derive(Default)]
struct Pending {
    hops: VecDeque<Hop>,
    draining: bool,
}

/// An ordered list of filters, application side first.
///
/// Events are dispatched through a trampoline: an event raised while another
/// one is being dispatched, by a filter or by another thread, is queued and
/// delivered by the dispatch already running. Filters therefore never
/// re-enter each other and every event is delivered in the order it was
/// raised.
pub struct FilterChain {
    inner: Arc<Inner>,
}

impl FilterChain {
    /// Builds a chain; events leaving its top are delivered to the returned
    /// receiver.
    pub fn new(filters: Vec<Box<dyn Filter>>) -> (Self, mpsc::UnboundedReceiver<ChainEvent>) {
        let (events, receiver) = mpsc::unbounded();
        let inner = Inner { filters: Mutex::new(filters), pending: Mutex::new(Pending::default()), events };
        (Self { inner: Arc::new(inner) }, receiver)
    }

    pub fn connect(&self, addr: impl Into<String>) {
        self.inner.dispatch(Hop::Down(0, Downward::Connect(addr.into())));
    }

    pub fn write(&self, data: Bytes, completion: WriteCompletion) {
        self.inner.dispatch(Hop::Down(0, Downward::Write(data, completion)));
    }

    pub fn send(&self, request: HttpRequest, completion: WriteCompletion) {
        self.inner.dispatch(Hop::Down(0, Downward::Send(request, completion)));
    }

    pub fn close(&self) {
        self.inner.dispatch(Hop::Down(0, Downward::Close));
    }

    /// A writer entering the chain at its top.
    pub fn writer(&self) -> ChainWriter {
        ChainWriter { inner: Arc::downgrade(&self.inner), index: 0 }
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.inner.filters.lock().unwrap_or_else(PoisonError::into_inner).len();
        f.debug_struct("FilterChain").field("filters", &len).finish()
    }
}

impl Inner {
    fn lock_pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatch(self: &Arc<Self>, hop: Hop) {
        {
            let mut pending = self.lock_pending();
            pending.hops.push_back(hop);
            if pending.draining {
                return;
            }
            pending.draining = true;
        }

        loop {
            let hop = {
                let mut pending = self.lock_pending();
                match pending.hops.pop_front() {
                    Some(hop) => hop,
                    None => {
                        pending.draining = false;
                        return;
                    }
                }
            };

            let mut raised = VecDeque::new();
            let mut deferred = Vec::new();
            {
                let mut filters = self.filters.lock().unwrap_or_else(PoisonError::into_inner);
                self.deliver(&mut filters, hop, &mut raised, &mut deferred);
            }

            if !raised.is_empty() {
                self.lock_pending().hops.extend(raised);
            }
            for job in deferred {
                job();
            }
        }
    }

    fn deliver(
        self: &Arc<Self>,
        filters: &mut [Box<dyn Filter>],
        hop: Hop,
        raised: &mut VecDeque<Hop>,
        deferred: &mut Vec<Deferred>,
    ) {
        match hop {
            Hop::Down(index, downward) => {
                let Some(filter) = filters.get_mut(index) else {
                    Self::fall_off_bottom(downward, deferred);
                    return;
                };
                let mut ctx = FilterContext { index, chain: self, raised, deferred };
                match downward {
                    Downward::Connect(addr) => filter.connect(&mut ctx, addr),
                    Downward::Write(data, completion) => filter.write(&mut ctx, data, completion),
                    Downward::Send(request, completion) => filter.send(&mut ctx, request, completion),
                    Downward::Close => filter.close(&mut ctx),
                }
            }

            Hop::Up(Some(index), event) => {
                let Some(filter) = filters.get_mut(index) else {
                    warn!(index, "dropping event for a filter outside the chain");
                    return;
                };
                let mut ctx = FilterContext { index, chain: self, raised, deferred };
                match event {
                    ChainEvent::Connected => filter.on_connect(&mut ctx),
                    ChainEvent::Read(data) => filter.on_read(&mut ctx, data),
                    ChainEvent::Response(event) => filter.on_response(&mut ctx, event),
                    ChainEvent::ConnectionClosed => filter.on_connection_closed(&mut ctx),
                    ChainEvent::Error(error) => filter.on_error(&mut ctx, error),
                }
            }

            Hop::Up(None, event) => {
                if self.events.unbounded_send(event).is_err() {
                    trace!("chain event receiver dropped, discarding event");
                }
            }
        }
    }

    /// Downward events no filter consumed.
    fn fall_off_bottom(downward: Downward, deferred: &mut Vec<Deferred>) {
        match downward {
            Downward::Write(data, completion) => {
                warn!(len = data.len(), "write reached the bottom of the chain");
                deferred.push(Box::new(move || completion.complete(Err(TransportError::Closed))));
            }
            Downward::Send(_, completion) => {
                warn!("request reached the bottom of the chain");
                deferred.push(Box::new(move || completion.complete(Err(TransportError::Closed))));
            }
            Downward::Connect(addr) => warn!(addr, "no transport filter to connect"),
            Downward::Close => {}
        }
    }
}

/// A filter's view of its neighbours while one of its hooks runs.
pub struct FilterContext<'a> {
    index: usize,
    chain: &'a Arc<Inner>,
    raised: &'a mut VecDeque<Hop>,
    deferred: &'a mut Vec<Deferred>,
}

impl FilterContext<'_> {
    fn down(&mut self, downward: Downward) {
        self.raised.push_back(Hop::Down(self.index + 1, downward));
    }

    fn up(&mut self, event: ChainEvent) {
        self.raised.push_back(Hop::Up(self.index.checked_sub(1), event));
    }

    pub fn connect(&mut self, addr: String) {
        self.down(Downward::Connect(addr));
    }

    pub fn write(&mut self, data: Bytes, completion: WriteCompletion) {
        self.down(Downward::Write(data, completion));
    }

    pub fn send(&mut self, request: HttpRequest, completion: WriteCompletion) {
        self.down(Downward::Send(request, completion));
    }

    pub fn close(&mut self) {
        self.down(Downward::Close);
    }

    pub fn on_connect(&mut self) {
        self.up(ChainEvent::Connected);
    }

    pub fn on_read(&mut self, data: Bytes) {
        self.up(ChainEvent::Read(data));
    }

    pub fn on_response(&mut self, event: ResponseEvent) {
        self.up(ChainEvent::Response(event));
    }

    pub fn on_connection_closed(&mut self) {
        self.up(ChainEvent::ConnectionClosed);
    }

    pub fn on_error(&mut self, error: TransportError) {
        self.up(ChainEvent::Error(error));
    }

    /// Completes `completion` once the dispatch lock is released.
    pub fn complete(&mut self, completion: WriteCompletion, result: Result<(), TransportError>) {
        self.deferred.push(Box::new(move || completion.complete(result)));
    }

    /// Runs `job` once the dispatch lock is released.
    pub fn defer<F>(&mut self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.deferred.push(Box::new(job));
    }

    /// A handle raising upward events from this position, usable from other
    /// tasks.
    pub fn handle(&self) -> ChainHandle {
        ChainHandle { inner: Arc::downgrade(self.chain), index: self.index }
    }

    /// A writer entering the chain right below this position.
    pub fn downstream_writer(&self) -> ChainWriter {
        ChainWriter { inner: Arc::downgrade(self.chain), index: self.index + 1 }
    }
}

impl fmt::Debug for FilterContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterContext").field("index", &self.index).finish_non_exhaustive()
    }
}

/// Raises upward events on behalf of a filter, from outside its hooks.
///
/// The transport filter uses it from its socket tasks. Events raised after
/// the chain was dropped are discarded.
#[derive(Clone)]
pub struct ChainHandle {
    inner: Weak<Inner>,
    index: usize,
}

impl ChainHandle {
    fn up(&self, event: ChainEvent) {
        match self.inner.upgrade() {
            Some(inner) => inner.dispatch(Hop::Up(self.index.checked_sub(1), event)),
            None => trace!("filter chain dropped, discarding event"),
        }
    }

    pub fn on_connect(&self) {
        self.up(ChainEvent::Connected);
    }

    pub fn on_read(&self, data: Bytes) {
        self.up(ChainEvent::Read(data));
    }

    pub fn on_connection_closed(&self) {
        self.up(ChainEvent::ConnectionClosed);
    }

    pub fn on_error(&self, error: TransportError) {
        self.up(ChainEvent::Error(error));
    }
}

impl fmt::Debug for ChainHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainHandle").field("index", &self.index).finish()
    }
}

/// Writes raw bytes into the chain at a fixed position.
#[derive(Clone)]
pub struct ChainWriter {
    inner: Weak<Inner>,
    index: usize,
}

impl DownstreamWriter for ChainWriter {
    fn write(&self, data: Bytes, completion: WriteCompletion) {
        match self.inner.upgrade() {
            Some(inner) => inner.dispatch(Hop::Down(self.index, Downward::Write(data, completion))),
            None => completion.complete(Err(TransportError::Closed)),
        }
    }
}

impl fmt::Debug for ChainWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainWriter").field("index", &self.index).finish()
    }
}
