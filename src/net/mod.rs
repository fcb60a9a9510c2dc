//! Network transports driven by the reactor.
//!
//! This module provides the TCP layer that integrates with the single-threaded
//! event loop. The design eliminates the need for async/await while providing
//! efficient non-blocking I/O through protocol callbacks.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Application                       │
//! │  ┌──────────────┐          ┌─────────────────┐              │
//! │  │ TcpServer /  │────────▶│ Your Protocol   │              │
//! │  │ TcpTransport │          │ (Protocol trait)│              │
//! │  └──────────────┘          └─────────────────┘              │
//! └────────────┬──────────────────────┬─────────────────────────┘
//!              │                      │ Callbacks
//!              │ Watchers             │ (connection_made,
//!              ▼                      │  data_received, ...)
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         EventLoop                           │
//! │  ┌──────────┐       ┌──────────┐       ┌──────────────┐     │
//! │  │ Backend  │─────▶│ Watcher  │─────▶│ Deferred /   │     │
//! │  │ (poll)   │       │ Registry │       │ Idle queue   │     │
//! │  └──────────┘       └──────────┘       └──────────────┘     │
//! └────────────┬────────────────────────────────────────────────┘
//!              │ OS readiness
//!              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Operating System (epoll/kqueue)                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The reactor polls for readiness; when a socket becomes readable or
//! writable, the matching transport runs, moving bytes between the socket
//! and the protocol callbacks you implemented, all on the reactor thread.
//!
//! # Example
//!
//! ```rust,no_run
//! use weir_io::net::tcp::{TcpServer, TcpServerConfig, TcpTransport, Protocol};
//! use weir_io::{error::Result, EventLoop};
//!
//! struct EchoProtocol {
//!     transport: Option<TcpTransport>,
//! }
//!
//! impl Protocol for EchoProtocol {
//!     fn connection_made(&mut self, transport: &TcpTransport) {
//!         self.transport = Some(transport.clone());
//!     }
//!
//!     fn data_received(&mut self, data: &[u8]) {
//!         self.transport.as_ref().unwrap().write(data);
//!     }
//!
//!     fn connection_lost(&mut self, _error: Option<std::io::Error>) {}
//! }
//!
//! # fn main() -> Result<()> {
//! let ev = EventLoop::new()?;
//! let config = TcpServerConfig::builder()
//!     .address("127.0.0.1:8080".parse().unwrap())
//!     .build();
//! let server = TcpServer::with_protocols(config, || {
//!     Box::new(EchoProtocol { transport: None })
//! });
//! server.start(&ev)?;
//! ev.run()?;
//! # Ok(())
//! # }
//! ```

pub mod tcp;
