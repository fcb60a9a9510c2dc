use std::io;
use std::net::SocketAddr;
use std::result::Result as StdResult;

use thiserror::Error;

pub type Result<T> = StdResult<T, Error>;

/// Errors surfaced by the reactor and the TCP layer.
///
/// Recoverable conditions (a single connection failing, a transient accept
/// error) never appear here: they are confined to the affected connection and
/// reported through `Protocol::connection_lost` or logged. What reaches this
/// enum is fatal to the operation that returned it.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: io::Error,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("watcher is cancelled")]
    WatcherCancelled,

    #[error("operation not supported by this watcher kind")]
    WatcherKind,

    #[error("event loop is gone")]
    LoopGone,
}
