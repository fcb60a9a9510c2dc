use std::io;

use crate::error::Result;
use crate::net::tcp::TcpTransport;
use crate::EventLoop;

/// Optional abilities a protocol advertises.
///
/// The transport reads this once, when the connection is made, and stores
/// it: flow-control and timeout notifications are only delivered to
/// protocols that declared the matching capability. Absence is legal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Deliver `pause_writing`/`resume_writing` around the write buffer's
    /// high/low water marks.
    pub flow_control: bool,
    /// Deliver `connection_timeout` when the idle timer elapses.
    pub timeout: bool,
}

/// The contract a connection handler implements.
///
/// All callbacks run synchronously on the reactor thread. For one
/// connection, `connection_made` happens before any `data_received`,
/// `data_received` is never re-entered, and `connection_lost` is delivered
/// exactly once, after every other callback.
pub trait Protocol {
    /// Called once when the transport is ready. Keep a clone of the
    /// transport to write from later callbacks.
    fn connection_made(&mut self, transport: &TcpTransport);

    /// Called with received bytes. The slice is a borrowed view, valid only
    /// for the duration of the call.
    fn data_received(&mut self, data: &[u8]);

    /// Called exactly once when the connection is gone. `error` is present
    /// iff the connection was aborted by an I/O error; a peer close or a
    /// local `close()` delivers `None`.
    fn connection_lost(&mut self, error: Option<io::Error>);

    /// Which optional callbacks this protocol wants. Read once at
    /// connection time.
    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// The write buffer crossed above the high water mark.
    fn pause_writing(&mut self) {}

    /// The write buffer drained below the low water mark.
    fn resume_writing(&mut self) {}

    /// The idle timeout elapsed. The transport does not close by itself;
    /// call `close()` here to drop idle peers.
    fn connection_timeout(&mut self) {}
}

/// Builds a transport for every accepted connection.
///
/// A plain constructor closure: the listener stores one and calls it once
/// per accept. An error is treated as a fatal configuration problem and
/// stops the listener.
pub type TransportFactory = Box<dyn Fn(&EventLoop, mio::net::TcpStream) -> Result<TcpTransport>>;
