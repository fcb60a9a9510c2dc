//! weir-io: a single-threaded reactor and TCP transport layer.
//!
//! The [`EventLoop`] dispatches I/O readiness, timers, signals, idle work
//! and deferred calls to [`Watcher`] callbacks, all on one thread. On top of
//! it, [`net::tcp`] provides a buffered TCP transport with flow control and
//! idle timeouts, a listening server, and the [`Protocol`] contract user
//! code implements.
//!
//! Everything runs cooperatively: callbacks return to the loop, nothing
//! blocks, and no locks are involved. Handles are not `Send`; one loop
//! belongs to one thread.

pub mod error;
pub mod event;
pub mod net;
mod poll;
mod reactor;
pub mod watcher;

pub use error::{Error, Result};
pub use event::{EventSet, Priority};
pub use net::tcp::{Capabilities, Protocol, TcpServer, TcpServerConfig, TcpTransport};
pub use reactor::EventLoop;
pub use watcher::Watcher;
