//! Callback-driven TCP transport and listener.
//!
//! [`TcpTransport`] owns one nonblocking connection: it mediates between
//! socket readiness delivered by the reactor and the user's [`Protocol`],
//! buffering writes, enforcing flow control with high/low water marks,
//! arming the idle timeout, and guaranteeing an orderly teardown with
//! exactly one `connection_lost` per connection. [`TcpServer`] owns the
//! listening socket, builds a transport per accepted connection through a
//! [`TransportFactory`], and tracks live connections so stopping the
//! listener closes them all.

pub(crate) mod config;
pub(crate) mod traits;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::rc::Rc;

use mio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, trace, warn};

pub use config::{TcpServerConfig, TcpServerConfigBuilder, DEFAULT_BACKLOG};
pub use traits::{Capabilities, Protocol, TransportFactory};

use crate::error::{Error, Result};
use crate::event::EventSet;
use crate::watcher::Watcher;
use crate::EventLoop;

/// Scratch buffer size for a single recv.
const RECV_BUFFER_SIZE: usize = 8192;

/// Default high water mark of the write buffer.
pub const DEFAULT_WRITE_LIMIT: usize = 384 * 1024;

/// Smallest accepted high water mark.
pub const MIN_WRITE_LIMIT: usize = 64 * 1024;

/// Low water mark for a given high water mark.
fn low_water(high: usize) -> usize {
    high * 67 / 100
}

/// Notification for the protocol, queued when raised from inside another
/// protocol callback and delivered when the outer callback returns. This
/// keeps callbacks strictly sequential per connection.
enum Notice {
    PauseWriting,
    ResumeWriting,
    Timeout,
    Lost(Option<io::Error>),
}

/// Replaces the user protocol once `connection_lost` has been delivered, so
/// the transport/protocol reference cycle is broken deterministically.
struct Inert;

impl Protocol for Inert {
    fn connection_made(&mut self, _transport: &TcpTransport) {}
    fn data_received(&mut self, _data: &[u8]) {}
    fn connection_lost(&mut self, _error: Option<io::Error>) {}
}

struct TransportState {
    stream: Option<TcpStream>,
    fd: RawFd,
    io: Option<Watcher>,
    timer: Option<Watcher>,
    write_buf: VecDeque<u8>,
    high: usize,
    low: usize,
    closing: bool,
    closed: bool,
    paused_reading: bool,
    paused_writing: bool,
    /// High-water notification sent to the protocol and not yet rescinded.
    protocol_paused: bool,
    lost_sent: bool,
    flush_cb: Option<Box<dyn FnOnce()>>,
    /// Listener deregistration hook.
    on_close: Option<Box<dyn FnOnce(RawFd)>>,
    timeout: f64,
    connecting: bool,
    peer: Option<SocketAddr>,
    local: Option<SocketAddr>,
}

struct TransportInner {
    caps: Capabilities,
    state: RefCell<TransportState>,
    protocol: RefCell<Box<dyn Protocol>>,
    pending: RefCell<VecDeque<Notice>>,
}

/// A buffered, half-closeable TCP connection bound to an [`EventLoop`].
///
/// Cheap to clone; all clones refer to the same connection. Every method is
/// safe to call from any protocol callback. Once the connection reaches its
/// terminal state all operations become no-ops.
pub struct TcpTransport {
    inner: Rc<TransportInner>,
}

impl Clone for TcpTransport {
    fn clone(&self) -> Self {
        TcpTransport {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl TcpTransport {
    /// Wrap an accepted (or otherwise connected) nonblocking socket and
    /// invoke `connection_made` on the protocol.
    pub fn new(ev: &EventLoop, stream: TcpStream, protocol: Box<dyn Protocol>) -> Result<TcpTransport> {
        Self::build(ev, stream, protocol, false)
    }

    /// Open a client connection. `connection_made` fires once the
    /// nonblocking connect completes; a failed connect is surfaced as
    /// `connection_lost` with the error.
    pub fn connect(ev: &EventLoop, addr: SocketAddr, protocol: Box<dyn Protocol>) -> Result<TcpTransport> {
        let stream = TcpStream::connect(addr)?;
        Self::build(ev, stream, protocol, true)
    }

    fn build(
        ev: &EventLoop,
        stream: TcpStream,
        protocol: Box<dyn Protocol>,
        connecting: bool,
    ) -> Result<TcpTransport> {
        let caps = protocol.capabilities();
        let fd = stream.as_raw_fd();
        let peer = stream.peer_addr().ok();
        let local = stream.local_addr().ok();

        let inner = Rc::new(TransportInner {
            caps,
            state: RefCell::new(TransportState {
                stream: Some(stream),
                fd,
                io: None,
                timer: None,
                write_buf: VecDeque::new(),
                high: DEFAULT_WRITE_LIMIT,
                low: low_water(DEFAULT_WRITE_LIMIT),
                closing: false,
                closed: false,
                paused_reading: false,
                paused_writing: true,
                protocol_paused: false,
                lost_sent: false,
                flush_cb: None,
                on_close: None,
                timeout: 0.0,
                connecting,
                peer,
                local,
            }),
            protocol: RefCell::new(protocol),
            pending: RefCell::new(VecDeque::new()),
        });
        let transport = TcpTransport { inner };

        let weak = Rc::downgrade(&transport.inner);
        let initial_mask = if connecting { EventSet::WRITE } else { EventSet::READ };
        let io = ev.io_watcher(fd, initial_mask, move |ev, _watcher, set| {
            if let Some(inner) = weak.upgrade() {
                TcpTransport { inner }.handle_io(ev, set);
            }
        });
        if let Err(e) = io.start() {
            io.cancel();
            return Err(e);
        }

        let weak = Rc::downgrade(&transport.inner);
        let timer = ev.timer_watcher(0.0, move |_ev, watcher, set| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let transport = TcpTransport { inner };
            if set.contains(EventSet::CLEANUP) {
                transport.terminate(None);
                return;
            }
            // Single-shot: the protocol re-arms on activity if it wants to.
            watcher.stop();
            if transport.inner.caps.timeout {
                transport.notify(Notice::Timeout);
            }
        });

        {
            let mut state = transport.inner.state.borrow_mut();
            state.io = Some(io);
            state.timer = Some(timer);
        }

        if !connecting {
            transport.inner.protocol.borrow_mut().connection_made(&transport);
            transport.drain_notices();
        }
        Ok(transport)
    }

    /// Peer address, if the socket is still open and connected.
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.inner.state.borrow().peer
    }

    /// Local address of the socket.
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.inner.state.borrow().local
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().closed
    }

    /// Queue `data` for sending. Callable from any protocol callback. Bytes
    /// written after `close()` are dropped.
    pub fn write(&self, data: &[u8]) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.closed || state.closing {
                debug!(len = data.len(), "write on closing transport dropped");
                return;
            }
            state.write_buf.extend(data.iter().copied());
        }
        self.reconcile();
    }

    /// Run `callback` once the write buffer next drains; immediately if it
    /// is already empty. Bytes queued at or before this call are on the
    /// wire when the callback runs.
    pub fn flush<F>(&self, callback: F)
    where
        F: FnOnce() + 'static,
    {
        let mut callback: Option<Box<dyn FnOnce()>> = Some(Box::new(callback));
        {
            let mut state = self.inner.state.borrow_mut();
            if !state.closed && !state.write_buf.is_empty() {
                let fresh = callback.take().expect("just set");
                state.flush_cb = Some(match state.flush_cb.take() {
                    Some(prev) => Box::new(move || {
                        prev();
                        fresh();
                    }),
                    None => fresh,
                });
            }
        }
        if let Some(callback) = callback {
            callback();
        }
    }

    /// High water mark of the write buffer.
    pub fn write_limit(&self) -> usize {
        self.inner.state.borrow().high
    }

    /// Set the high water mark (at least [`MIN_WRITE_LIMIT`]). The low
    /// water mark follows at 67% and hysteresis crossings are re-evaluated
    /// immediately.
    pub fn set_write_limit(&self, bytes: usize) -> Result<()> {
        if bytes < MIN_WRITE_LIMIT {
            return Err(Error::Configuration(format!(
                "write limit must be at least {MIN_WRITE_LIMIT} bytes, got {bytes}"
            )));
        }
        {
            let mut state = self.inner.state.borrow_mut();
            state.high = bytes;
            state.low = low_water(bytes);
        }
        self.reconcile();
        Ok(())
    }

    /// Idle timeout in seconds; 0 when disabled.
    pub fn timeout(&self) -> f64 {
        self.inner.state.borrow().timeout
    }

    /// Arm (or, with a non-positive value, disarm) the idle timeout. The
    /// timer is single-shot: it fires `connection_timeout` once and the
    /// protocol decides whether to close or re-arm.
    pub fn set_timeout(&self, seconds: f64) {
        let timer = {
            let mut state = self.inner.state.borrow_mut();
            if state.closed {
                return;
            }
            state.timeout = seconds.max(0.0);
            state.timer.clone()
        };
        if let Some(timer) = timer {
            let _ = timer.set_seconds(seconds);
        }
    }

    /// Stop delivering `data_received` until `resume_reading`.
    pub fn pause_reading(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.closed {
                return;
            }
            state.paused_reading = true;
        }
        self.sync_interest();
    }

    /// Resume delivery of `data_received`. No-op while closing.
    pub fn resume_reading(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.closed || state.closing {
                return;
            }
            state.paused_reading = false;
        }
        self.sync_interest();
    }

    /// Graceful close: stop reading, finish draining the write buffer, then
    /// tear the connection down. Idempotent.
    pub fn close(&self) {
        {
            let mut state = self.inner.state.borrow_mut();
            if state.closed || state.closing {
                return;
            }
            state.closing = true;
            state.paused_reading = true;
        }
        self.sync_interest();
        self.reconcile();
    }

    /// Immediate teardown, discarding anything still buffered. The protocol
    /// sees `connection_lost(None)`.
    pub fn abort(&self) {
        self.terminate(None);
    }

    pub(crate) fn set_on_close<F>(&self, hook: F)
    where
        F: FnOnce(RawFd) + 'static,
    {
        let mut state = self.inner.state.borrow_mut();
        if !state.closed {
            state.on_close = Some(Box::new(hook));
        }
    }

    /// Tear the connection down: cancel both watchers, deliver
    /// `connection_lost` (with `error` iff an I/O error caused this),
    /// notify the listener, shut down and release the socket.
    fn terminate(&self, error: Option<io::Error>) {
        let (io, timer, on_close, fd, stream, flush_cb) = {
            let mut state = self.inner.state.borrow_mut();
            if state.closed {
                return;
            }
            state.closed = true;
            state.closing = true;
            (
                state.io.take(),
                state.timer.take(),
                state.on_close.take(),
                state.fd,
                state.stream.take(),
                state.flush_cb.take(),
            )
        };
        trace!(fd, error = ?error, "transport terminating");
        if let Some(watcher) = io {
            watcher.cancel();
        }
        if let Some(watcher) = timer {
            watcher.cancel();
        }
        self.notify(Notice::Lost(error));
        if let Some(hook) = on_close {
            hook(fd);
        }
        if let Some(stream) = stream {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        drop(flush_cb);
    }

    /// Reconcile transport state with the write buffer, after every buffer
    /// mutation: finish a graceful close once drained, keep WRITE interest
    /// matching buffer occupancy, run the flow-control hysteresis, and fire
    /// a pending flush callback when empty.
    fn reconcile(&self) {
        let mut pause = false;
        let mut resume = false;
        let mut flush_cb = None;
        let abort_now;
        {
            let mut state = self.inner.state.borrow_mut();
            if state.closed {
                return;
            }
            if state.closing && state.write_buf.is_empty() {
                abort_now = true;
            } else {
                abort_now = false;
                let len = state.write_buf.len();
                state.paused_writing = len == 0;
                if self.inner.caps.flow_control {
                    if len > state.high && !state.protocol_paused {
                        state.protocol_paused = true;
                        pause = true;
                    } else if len < state.low && state.protocol_paused {
                        state.protocol_paused = false;
                        resume = true;
                    }
                }
                if len == 0 {
                    flush_cb = state.flush_cb.take();
                }
            }
        }
        if abort_now {
            self.terminate(None);
            return;
        }
        self.sync_interest();
        if pause {
            self.notify(Notice::PauseWriting);
        }
        if resume {
            self.notify(Notice::ResumeWriting);
        }
        if let Some(callback) = flush_cb {
            callback();
        }
    }

    /// Bring the I/O watcher's mask in line with the pause flags, stopping
    /// the watcher entirely when neither direction is wanted.
    fn sync_interest(&self) {
        let (watcher, desired) = {
            let state = self.inner.state.borrow();
            if state.closed {
                return;
            }
            let mut mask = EventSet::NONE;
            if state.connecting {
                mask = EventSet::WRITE;
            } else {
                if !state.paused_reading && !state.closing {
                    mask |= EventSet::READ;
                }
                if !state.paused_writing {
                    mask |= EventSet::WRITE;
                }
            }
            (state.io.clone(), mask)
        };
        let Some(watcher) = watcher else {
            return;
        };
        if desired.is_empty() {
            watcher.stop();
        } else if watcher.event_mask() != desired || !watcher.is_active() {
            let _ = watcher.set_event_mask(desired);
            let _ = watcher.start();
        }
    }

    fn handle_io(&self, _ev: &EventLoop, set: EventSet) {
        if set.contains(EventSet::CLEANUP) {
            self.terminate(None);
            return;
        }
        if set.contains(EventSet::ERROR) {
            let error = {
                let state = self.inner.state.borrow();
                state
                    .stream
                    .as_ref()
                    .and_then(|stream| stream.take_error().ok().flatten())
            }
            .unwrap_or_else(|| io::Error::other("socket error readiness"));
            warn!(error = %error, "error event on connection");
            self.terminate(Some(error));
            return;
        }
        if self.inner.state.borrow().connecting {
            if set.is_writable() {
                self.finish_connect();
            }
            return;
        }
        if set.is_readable() {
            self.handle_read();
        }
        if self.is_closed() {
            return;
        }
        if set.is_writable() {
            self.handle_write();
        }
    }

    fn finish_connect(&self) {
        let check = {
            let mut state = self.inner.state.borrow_mut();
            let Some(stream) = state.stream.as_mut() else {
                return;
            };
            match stream.take_error() {
                Ok(Some(e)) | Err(e) => Err(e),
                Ok(None) => match stream.peer_addr() {
                    Ok(peer) => {
                        let local = stream.local_addr().ok();
                        state.peer = Some(peer);
                        state.local = local;
                        state.connecting = false;
                        Ok(true)
                    }
                    Err(ref e)
                        if e.kind() == io::ErrorKind::NotConnected
                            || e.raw_os_error() == Some(libc::EINPROGRESS) =>
                    {
                        Ok(false)
                    }
                    Err(e) => Err(e),
                },
            }
        };
        match check {
            Ok(true) => {
                debug!(peer = ?self.remote_address(), "connection established");
                self.sync_interest();
                self.inner.protocol.borrow_mut().connection_made(self);
                self.drain_notices();
                self.reconcile();
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "connect failed");
                self.terminate(Some(e));
            }
        }
    }

    /// Drain readable data: one recv per pass into the scratch buffer,
    /// repeated until the socket would block, the peer closes, or a
    /// callback pauses/closes the transport.
    fn handle_read(&self) {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            {
                let state = self.inner.state.borrow();
                if state.closed || state.closing || state.paused_reading {
                    return;
                }
            }
            let result = {
                let mut state = self.inner.state.borrow_mut();
                let Some(stream) = state.stream.as_mut() else {
                    return;
                };
                stream.read(&mut buf)
            };
            match result {
                Ok(0) => {
                    debug!("closed while reading");
                    self.terminate(None);
                    return;
                }
                Ok(n) => {
                    self.inner.protocol.borrow_mut().data_received(&buf[..n]);
                    self.drain_notices();
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "error while reading");
                    self.terminate(Some(e));
                    return;
                }
            }
        }
    }

    /// Send from the write buffer until it drains or the socket would
    /// block, reconciling after every chunk so flow-control notifications
    /// fire as soon as their threshold is crossed.
    fn handle_write(&self) {
        loop {
            let result = {
                let mut state = self.inner.state.borrow_mut();
                if state.closed {
                    return;
                }
                if state.write_buf.is_empty() {
                    break;
                }
                let state = &mut *state;
                let Some(stream) = state.stream.as_mut() else {
                    return;
                };
                let (front, _) = state.write_buf.as_slices();
                match stream.write(front) {
                    Ok(n) => {
                        state.write_buf.drain(..n);
                        Ok(n)
                    }
                    Err(e) => Err(e),
                }
            };
            match result {
                Ok(0) => return,
                Ok(_) => {
                    self.reconcile();
                    if self.is_closed() {
                        return;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "error while writing");
                    self.terminate(Some(e));
                    return;
                }
            }
        }
        self.reconcile();
    }

    /// Raise a protocol notification. Delivered immediately when possible;
    /// queued when the protocol is already in a callback, and drained when
    /// that callback returns. Nothing is delivered after `connection_lost`.
    fn notify(&self, notice: Notice) {
        self.inner.pending.borrow_mut().push_back(notice);
        self.drain_notices();
    }

    fn drain_notices(&self) {
        loop {
            let Ok(mut protocol) = self.inner.protocol.try_borrow_mut() else {
                // Inside a protocol callback; the outer drain continues.
                return;
            };
            let notice = self.inner.pending.borrow_mut().pop_front();
            let Some(notice) = notice else {
                break;
            };
            match notice {
                Notice::Lost(error) => {
                    let already = {
                        let mut state = self.inner.state.borrow_mut();
                        std::mem::replace(&mut state.lost_sent, true)
                    };
                    if !already {
                        protocol.connection_lost(error);
                    }
                }
                notice => {
                    if self.inner.state.borrow().lost_sent {
                        continue;
                    }
                    match notice {
                        Notice::PauseWriting => protocol.pause_writing(),
                        Notice::ResumeWriting => protocol.resume_writing(),
                        Notice::Timeout => protocol.connection_timeout(),
                        Notice::Lost(_) => unreachable!("handled above"),
                    }
                }
            }
        }
        // Once the connection is lost and nothing is queued, detach the
        // user protocol so the transport/protocol cycle unwinds.
        let done = self.inner.state.borrow().lost_sent && self.inner.pending.borrow().is_empty();
        if done {
            if let Ok(mut protocol) = self.inner.protocol.try_borrow_mut() {
                *protocol = Box::new(Inert);
            }
        }
    }
}

struct ServerState {
    listener: Option<TcpListener>,
    watcher: Option<Watcher>,
    connections: HashMap<RawFd, TcpTransport>,
    local_addr: Option<SocketAddr>,
    stopped: bool,
}

struct ServerInner {
    config: TcpServerConfig,
    factory: TransportFactory,
    state: RefCell<ServerState>,
}

/// Accepting side of the TCP layer.
///
/// Owns the listening socket and the table of live transports. Accepted
/// sockets are handed to the [`TransportFactory`]; every transport gets a
/// close hook that removes it from the table. Stopping the server closes
/// all live connections before the listening socket.
pub struct TcpServer {
    inner: Rc<ServerInner>,
}

impl Clone for TcpServer {
    fn clone(&self) -> Self {
        TcpServer {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl TcpServer {
    pub fn new(config: TcpServerConfig, factory: TransportFactory) -> TcpServer {
        TcpServer {
            inner: Rc::new(ServerInner {
                config,
                factory,
                state: RefCell::new(ServerState {
                    listener: None,
                    watcher: None,
                    connections: HashMap::new(),
                    local_addr: None,
                    stopped: false,
                }),
            }),
        }
    }

    /// Standard server: one fresh protocol from `protocol_factory` per
    /// accepted connection, wrapped in the stock transport.
    pub fn with_protocols<F>(config: TcpServerConfig, protocol_factory: F) -> TcpServer
    where
        F: Fn() -> Box<dyn Protocol> + 'static,
    {
        Self::new(
            config,
            Box::new(move |ev, stream| TcpTransport::new(ev, stream, protocol_factory())),
        )
    }

    /// Bind, listen, and register the accept watcher on `ev`. Bind and
    /// listen failures propagate to the caller.
    pub fn start(&self, ev: &EventLoop) -> Result<()> {
        if self.inner.config.write_limit < MIN_WRITE_LIMIT {
            return Err(Error::Configuration(format!(
                "write limit must be at least {MIN_WRITE_LIMIT} bytes, got {}",
                self.inner.config.write_limit
            )));
        }
        let listener = bind_listener(self.inner.config.address, self.inner.config.backlog)?;
        let local_addr = listener.local_addr()?;
        let fd = listener.as_raw_fd();

        let weak = Rc::downgrade(&self.inner);
        let watcher = ev.io_watcher(fd, EventSet::READ, move |ev, _watcher, set| {
            if let Some(inner) = weak.upgrade() {
                TcpServer { inner }.handle_accept(ev, set);
            }
        });
        if let Err(e) = watcher.start() {
            watcher.cancel();
            return Err(e);
        }

        {
            let mut state = self.inner.state.borrow_mut();
            state.listener = Some(listener);
            state.watcher = Some(watcher);
            state.local_addr = Some(local_addr);
            state.stopped = false;
        }
        info!(%local_addr, "listening");
        Ok(())
    }

    /// Address the listening socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner
            .state
            .borrow()
            .local_addr
            .ok_or_else(|| Error::Configuration("listener is not started".into()))
    }

    /// Number of live connections.
    pub fn connection_count(&self) -> usize {
        self.inner.state.borrow().connections.len()
    }

    /// Idempotent teardown: stop accepting, close every live connection
    /// gracefully, then close the listening socket.
    pub fn stop(&self) {
        let (watcher, listener, connections) = {
            let mut state = self.inner.state.borrow_mut();
            if state.stopped {
                return;
            }
            state.stopped = true;
            let snapshot: Vec<TcpTransport> = state.connections.values().cloned().collect();
            (state.watcher.take(), state.listener.take(), snapshot)
        };
        if let Some(watcher) = watcher {
            watcher.cancel();
        }
        for transport in connections {
            transport.close();
        }
        self.inner.state.borrow_mut().connections.clear();
        drop(listener);
        info!("listener stopped");
    }

    fn handle_accept(&self, ev: &EventLoop, set: EventSet) {
        if set.contains(EventSet::CLEANUP) || set.contains(EventSet::ERROR) {
            self.stop();
            return;
        }
        loop {
            let accepted = {
                let state = self.inner.state.borrow();
                let Some(listener) = state.listener.as_ref() else {
                    return;
                };
                listener.accept()
            };
            match accepted {
                Ok((stream, peer_addr)) => {
                    if let Err(e) = stream.set_nodelay(self.inner.config.no_delay) {
                        trace!(error = %e, "failed to set TCP_NODELAY");
                    }
                    let fd = stream.as_raw_fd();
                    match (self.inner.factory)(ev, stream) {
                        Ok(transport) => {
                            let _ = transport.set_write_limit(self.inner.config.write_limit);
                            if transport.is_closed() {
                                // The protocol hung up in connection_made.
                                continue;
                            }
                            let weak = Rc::downgrade(&self.inner);
                            transport.set_on_close(move |fd| {
                                if let Some(inner) = weak.upgrade() {
                                    inner.state.borrow_mut().connections.remove(&fd);
                                }
                            });
                            self.inner
                                .state
                                .borrow_mut()
                                .connections
                                .insert(fd, transport);
                            debug!(%peer_addr, "accepted connection");
                        }
                        Err(e) => {
                            error!(error = %e, "transport factory failed; stopping listener");
                            self.stop();
                            return;
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e)
                    if e.kind() == io::ErrorKind::ConnectionAborted
                        || e.kind() == io::ErrorKind::ConnectionReset =>
                {
                    warn!(error = %e, "transient accept error");
                    continue;
                }
                Err(ref e)
                    if e.raw_os_error() == Some(libc::EMFILE)
                        || e.raw_os_error() == Some(libc::ENFILE) =>
                {
                    // Descriptor table exhausted. The listener socket is
                    // fine; stop draining and accept again once fds free up.
                    warn!(error = %e, "accept deferred: out of file descriptors");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "accept failed; stopping listener");
                    self.stop();
                    return;
                }
            }
        }
    }
}

/// Build a listening socket with address reuse and an explicit backlog,
/// nonblocking, ready for the accept watcher.
fn bind_listener(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let bind_err = |source: io::Error| Error::Bind { addr, source };

    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(bind_err(io::Error::last_os_error()));
        }
        let close_on_err = |fd: RawFd, e: io::Error| {
            unsafe { libc::close(fd) };
            bind_err(e)
        };

        let one: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) != 0
        {
            return Err(close_on_err(fd, io::Error::last_os_error()));
        }

        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(close_on_err(fd, io::Error::last_os_error()));
        }

        let (storage, len) = socket_addr_raw(addr);
        if libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) != 0 {
            return Err(close_on_err(fd, io::Error::last_os_error()));
        }
        if libc::listen(fd, backlog) != 0 {
            return Err(close_on_err(fd, io::Error::last_os_error()));
        }

        Ok(TcpListener::from_raw_fd(fd))
    }
}

fn socket_addr_raw(addr: SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    match addr {
        SocketAddr::V4(v4) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        }
        SocketAddr::V6(v6) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                (*sin6).sin6_flowinfo = v6.flowinfo();
                (*sin6).sin6_scope_id = v6.scope_id();
            }
            (
                storage,
                std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::net::TcpStream as StdTcpStream;
    use std::thread;
    use std::time::Duration;

    fn any_local() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    /// Connected (mio, std) pair for driving a transport directly.
    fn socket_pair() -> (TcpStream, StdTcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = StdTcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        server_side.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server_side), client)
    }

    #[derive(Default)]
    struct Counters {
        lost_clean: Cell<u32>,
        lost_error: Cell<u32>,
        pauses: Cell<u32>,
        resumes: Cell<u32>,
        timeouts: Cell<u32>,
    }

    #[test]
    fn test_low_water_tracks_high() {
        for high in [
            MIN_WRITE_LIMIT,
            MIN_WRITE_LIMIT + 1,
            100_000,
            DEFAULT_WRITE_LIMIT,
            1 << 24,
        ] {
            let low = low_water(high);
            assert!(low < high);
            let exact = (0.67 * high as f64).floor() as usize;
            assert!(low >= exact.saturating_sub(1));
            assert!(low <= exact + 1);
        }
    }

    struct Echo {
        ev: EventLoop,
        transport: Option<TcpTransport>,
        counters: Rc<Counters>,
    }

    impl Protocol for Echo {
        fn connection_made(&mut self, transport: &TcpTransport) {
            self.transport = Some(transport.clone());
        }

        fn data_received(&mut self, data: &[u8]) {
            self.transport.as_ref().unwrap().write(data);
        }

        fn connection_lost(&mut self, error: Option<io::Error>) {
            match error {
                None => self.counters.lost_clean.set(self.counters.lost_clean.get() + 1),
                Some(_) => self.counters.lost_error.set(self.counters.lost_error.get() + 1),
            }
            self.ev.stop();
        }
    }

    #[test]
    fn test_echo_round_trip() {
        let ev = EventLoop::new().unwrap();
        let counters = Rc::new(Counters::default());

        let server = {
            let ev = ev.clone();
            let counters = counters.clone();
            TcpServer::with_protocols(
                TcpServerConfig::builder().address(any_local()).build(),
                move || {
                    Box::new(Echo {
                        ev: ev.clone(),
                        transport: None,
                        counters: counters.clone(),
                    })
                },
            )
        };
        server.start(&ev).unwrap();
        let addr = server.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut stream = StdTcpStream::connect(addr).unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            stream.write_all(b"hello").unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).unwrap();
            buf
        });

        ev.on_timeout(10.0, |ev| ev.stop()).unwrap();
        ev.run().unwrap();

        assert_eq!(&client.join().unwrap(), b"hello");
        assert_eq!(counters.lost_clean.get(), 1);
        assert_eq!(counters.lost_error.get(), 0);
    }

    struct IdleCloser {
        ev: EventLoop,
        transport: Option<TcpTransport>,
        counters: Rc<Counters>,
    }

    impl Protocol for IdleCloser {
        fn connection_made(&mut self, transport: &TcpTransport) {
            self.transport = Some(transport.clone());
            transport.set_timeout(0.05);
        }

        fn data_received(&mut self, _data: &[u8]) {
            // Quiet peer expected; re-arm anyway.
            self.transport.as_ref().unwrap().set_timeout(0.15);
        }

        fn connection_lost(&mut self, _error: Option<io::Error>) {
            self.ev.stop();
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                timeout: true,
                ..Capabilities::default()
            }
        }

        fn connection_timeout(&mut self) {
            self.counters.timeouts.set(self.counters.timeouts.get() + 1);
            self.transport.as_ref().unwrap().close();
        }
    }

    #[test]
    fn test_idle_timeout_closes_quiet_peer() {
        let ev = EventLoop::new().unwrap();
        let counters = Rc::new(Counters::default());

        let server = {
            let ev = ev.clone();
            let counters = counters.clone();
            TcpServer::with_protocols(
                TcpServerConfig::builder().address(any_local()).build(),
                move || {
                    Box::new(IdleCloser {
                        ev: ev.clone(),
                        transport: None,
                        counters: counters.clone(),
                    })
                },
            )
        };
        server.start(&ev).unwrap();
        let addr = server.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut stream = StdTcpStream::connect(addr).unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut buf = [0u8; 1];
            // Send nothing; the idle timeout closes us and we observe EOF.
            stream.read(&mut buf)
        });

        ev.on_timeout(10.0, |ev| ev.stop()).unwrap();
        ev.run().unwrap();

        assert_eq!(client.join().unwrap().unwrap(), 0);
        assert_eq!(counters.timeouts.get(), 1);
    }

    struct Firehose {
        ev: EventLoop,
        counters: Rc<Counters>,
        payload: usize,
    }

    impl Protocol for Firehose {
        fn connection_made(&mut self, transport: &TcpTransport) {
            transport.write(&vec![0x42u8; self.payload]);
        }

        fn data_received(&mut self, _data: &[u8]) {}

        fn connection_lost(&mut self, _error: Option<io::Error>) {
            self.ev.stop();
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities {
                flow_control: true,
                ..Capabilities::default()
            }
        }

        fn pause_writing(&mut self) {
            self.counters.pauses.set(self.counters.pauses.get() + 1);
        }

        fn resume_writing(&mut self) {
            self.counters.resumes.set(self.counters.resumes.get() + 1);
        }
    }

    #[test]
    fn test_flow_control_pairs_pause_and_resume() {
        let ev = EventLoop::new().unwrap();
        let counters = Rc::new(Counters::default());
        const PAYLOAD: usize = 200 * 1024;

        let server = {
            let ev = ev.clone();
            let counters = counters.clone();
            TcpServer::with_protocols(
                TcpServerConfig::builder()
                    .address(any_local())
                    .write_limit(MIN_WRITE_LIMIT)
                    .build(),
                move || {
                    Box::new(Firehose {
                        ev: ev.clone(),
                        counters: counters.clone(),
                        payload: PAYLOAD,
                    })
                },
            )
        };
        server.start(&ev).unwrap();
        let addr = server.local_addr().unwrap();

        let client = thread::spawn(move || {
            let mut stream = StdTcpStream::connect(addr).unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut received = 0usize;
            let mut buf = [0u8; 4096];
            while received < PAYLOAD {
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => received += n,
                    Err(e) => panic!("client read failed: {e}"),
                }
            }
            received
        });

        ev.on_timeout(10.0, |ev| ev.stop()).unwrap();
        ev.run().unwrap();

        assert_eq!(client.join().unwrap(), PAYLOAD);
        assert_eq!(counters.pauses.get(), 1);
        assert_eq!(counters.resumes.get(), 1);
    }

    struct LostCounter {
        counters: Rc<Counters>,
    }

    impl Protocol for LostCounter {
        fn connection_made(&mut self, _transport: &TcpTransport) {}

        fn data_received(&mut self, _data: &[u8]) {}

        fn connection_lost(&mut self, error: Option<io::Error>) {
            match error {
                None => self.counters.lost_clean.set(self.counters.lost_clean.get() + 1),
                Some(_) => self.counters.lost_error.set(self.counters.lost_error.get() + 1),
            }
        }
    }

    #[test]
    fn test_listener_stop_closes_live_connections() {
        let ev = EventLoop::new().unwrap();
        let counters = Rc::new(Counters::default());

        let server = {
            let counters = counters.clone();
            TcpServer::with_protocols(
                TcpServerConfig::builder().address(any_local()).build(),
                move || {
                    Box::new(LostCounter {
                        counters: counters.clone(),
                    })
                },
            )
        };
        server.start(&ev).unwrap();
        let addr = server.local_addr().unwrap();

        let clients: Vec<_> = (0..3)
            .map(|_| {
                thread::spawn(move || {
                    let mut stream = StdTcpStream::connect(addr).unwrap();
                    stream
                        .set_read_timeout(Some(Duration::from_secs(10)))
                        .unwrap();
                    let mut buf = [0u8; 1];
                    // Hold the connection until the server closes it.
                    let _ = stream.read(&mut buf);
                })
            })
            .collect();

        let poller = {
            let server = server.clone();
            ev.timer_watcher(0.01, move |ev, watcher, _| {
                if server.connection_count() == 3 {
                    watcher.stop();
                    server.stop();
                    ev.stop();
                }
            })
        };
        poller.start().unwrap();
        ev.on_timeout(10.0, |ev| ev.stop()).unwrap();
        ev.run().unwrap();

        for client in clients {
            client.join().unwrap();
        }
        assert_eq!(counters.lost_clean.get(), 3);
        assert_eq!(counters.lost_error.get(), 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_abort_on_peer_reset_carries_error() {
        let ev = EventLoop::new().unwrap();
        let counters = Rc::new(Counters::default());

        let server = {
            let counters = counters.clone();
            TcpServer::with_protocols(
                TcpServerConfig::builder().address(any_local()).build(),
                move || {
                    Box::new(LostCounter {
                        counters: counters.clone(),
                    })
                },
            )
        };
        server.start(&ev).unwrap();
        let addr = server.local_addr().unwrap();

        let client = thread::spawn(move || {
            let stream = StdTcpStream::connect(addr).unwrap();
            // RST on close.
            let linger = libc::linger {
                l_onoff: 1,
                l_linger: 0,
            };
            unsafe {
                libc::setsockopt(
                    stream.as_raw_fd(),
                    libc::SOL_SOCKET,
                    libc::SO_LINGER,
                    &linger as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::linger>() as libc::socklen_t,
                );
            }
            thread::sleep(Duration::from_millis(50));
            drop(stream);
        });

        // The reactor keeps running after the connection error; only the
        // stopper ends the loop.
        ev.on_timeout(1.0, |ev| ev.stop()).unwrap();
        ev.run().unwrap();
        client.join().unwrap();

        assert_eq!(counters.lost_error.get(), 1);
        assert_eq!(counters.lost_clean.get(), 0);
    }

    struct Pinger {
        ev: EventLoop,
        transport: Option<TcpTransport>,
        counters: Rc<Counters>,
        got: Vec<u8>,
    }

    impl Protocol for Pinger {
        fn connection_made(&mut self, transport: &TcpTransport) {
            self.transport = Some(transport.clone());
            transport.write(b"ping");
        }

        fn data_received(&mut self, data: &[u8]) {
            self.got.extend_from_slice(data);
            if self.got == b"pong" {
                self.transport.as_ref().unwrap().close();
            }
        }

        fn connection_lost(&mut self, error: Option<io::Error>) {
            match error {
                None => self.counters.lost_clean.set(self.counters.lost_clean.get() + 1),
                Some(_) => self.counters.lost_error.set(self.counters.lost_error.get() + 1),
            }
            self.ev.stop();
        }
    }

    #[test]
    fn test_client_connect_round_trip() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let peer = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"ping");
            stream.write_all(b"pong").unwrap();
            // Wait for the client's close.
            let _ = stream.read(&mut buf);
        });

        let ev = EventLoop::new().unwrap();
        let counters = Rc::new(Counters::default());
        let transport = TcpTransport::connect(
            &ev,
            addr,
            Box::new(Pinger {
                ev: ev.clone(),
                transport: None,
                counters: counters.clone(),
                got: Vec::new(),
            }),
        )
        .unwrap();

        ev.on_timeout(10.0, |ev| ev.stop()).unwrap();
        ev.run().unwrap();
        peer.join().unwrap();

        assert_eq!(counters.lost_clean.get(), 1);
        assert!(transport.is_closed());
    }

    #[test]
    fn test_write_limit_validation() {
        let ev = EventLoop::new().unwrap();
        let (stream, _client) = socket_pair();
        let counters = Rc::new(Counters::default());
        let transport = TcpTransport::new(
            &ev,
            stream,
            Box::new(LostCounter {
                counters: counters.clone(),
            }),
        )
        .unwrap();

        assert_eq!(transport.write_limit(), DEFAULT_WRITE_LIMIT);
        assert!(matches!(
            transport.set_write_limit(MIN_WRITE_LIMIT - 1),
            Err(Error::Configuration(_))
        ));
        transport.set_write_limit(MIN_WRITE_LIMIT).unwrap();
        assert_eq!(transport.write_limit(), MIN_WRITE_LIMIT);
    }

    #[test]
    fn test_flush_runs_immediately_on_empty_buffer() {
        let ev = EventLoop::new().unwrap();
        let (stream, _client) = socket_pair();
        let counters = Rc::new(Counters::default());
        let transport = TcpTransport::new(
            &ev,
            stream,
            Box::new(LostCounter {
                counters: counters.clone(),
            }),
        )
        .unwrap();

        let flushed = Rc::new(Cell::new(0u32));
        let flushed_in = flushed.clone();
        transport.flush(move || flushed_in.set(flushed_in.get() + 1));
        assert_eq!(flushed.get(), 1);
    }

    #[test]
    fn test_flush_fires_once_after_drain() {
        let ev = EventLoop::new().unwrap();
        let counters = Rc::new(Counters::default());
        let flushed = Rc::new(Cell::new(0u32));

        let (stream, mut client) = socket_pair();
        let transport = TcpTransport::new(
            &ev,
            stream,
            Box::new(LostCounter {
                counters: counters.clone(),
            }),
        )
        .unwrap();

        transport.write(b"payload");
        {
            let flushed = flushed.clone();
            let ev_in = ev.clone();
            transport.flush(move || {
                flushed.set(flushed.get() + 1);
                ev_in.stop();
            });
        }
        assert_eq!(flushed.get(), 0);

        let reader = thread::spawn(move || {
            client
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut buf = [0u8; 7];
            client.read_exact(&mut buf).unwrap();
            buf
        });

        ev.on_timeout(5.0, |ev| ev.stop()).unwrap();
        ev.run().unwrap();

        assert_eq!(&reader.join().unwrap(), b"payload");
        assert_eq!(flushed.get(), 1);
        transport.abort();
    }

    #[test]
    fn test_write_accounting_across_abort() {
        let ev = EventLoop::new().unwrap();
        let counters = Rc::new(Counters::default());
        let (stream, mut client) = socket_pair();
        let transport = TcpTransport::new(
            &ev,
            stream,
            Box::new(LostCounter {
                counters: counters.clone(),
            }),
        )
        .unwrap();

        // The client is not reading, so the kernel buffers fill and part of
        // the payload stays queued in the transport.
        const PAYLOAD: usize = 4 * 1024 * 1024;
        transport.write(&vec![0x5au8; PAYLOAD]);
        ev.on_timeout(0.3, |ev| ev.stop()).unwrap();
        ev.run().unwrap();

        let residual = transport.inner.state.borrow().write_buf.len();
        transport.abort();
        assert_eq!(counters.lost_clean.get(), 1);

        // Everything handed to the kernel before the abort is still
        // delivered; count it off the wire until EOF.
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut on_wire = 0usize;
        let mut buf = [0u8; 65536];
        loop {
            match client.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => on_wire += n,
                Err(e) => panic!("client read failed: {e}"),
            }
        }
        assert_eq!(PAYLOAD, on_wire + residual);
    }

    #[test]
    fn test_close_is_idempotent_and_drops_late_writes() {
        let ev = EventLoop::new().unwrap();
        let counters = Rc::new(Counters::default());
        let (stream, _client) = socket_pair();
        let transport = TcpTransport::new(
            &ev,
            stream,
            Box::new(LostCounter {
                counters: counters.clone(),
            }),
        )
        .unwrap();

        transport.close();
        assert!(transport.is_closed());
        transport.close();
        transport.write(b"ignored");
        transport.abort();

        assert_eq!(counters.lost_clean.get(), 1);
        assert_eq!(counters.lost_error.get(), 0);
    }

    #[test]
    fn test_remote_address_matches_peer() {
        let ev = EventLoop::new().unwrap();
        let counters = Rc::new(Counters::default());
        let (stream, client) = socket_pair();
        let transport = TcpTransport::new(
            &ev,
            stream,
            Box::new(LostCounter {
                counters: counters.clone(),
            }),
        )
        .unwrap();

        assert_eq!(transport.remote_address(), Some(client.local_addr().unwrap()));
        assert!(transport.local_address().is_some());
        transport.abort();
    }

    #[test]
    fn test_bind_listener_rejects_bad_address() {
        // Port 1 is privileged; binding must fail for a normal user, and
        // the error must carry the bind taxonomy.
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        match bind_listener(addr, DEFAULT_BACKLOG) {
            Err(Error::Bind { addr: a, .. }) => assert_eq!(a, addr),
            Ok(_) => {
                // Running as root; at least the happy path worked.
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
}
