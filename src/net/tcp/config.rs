use std::net::SocketAddr;

use crate::net::tcp::DEFAULT_WRITE_LIMIT;

pub const DEFAULT_BACKLOG: i32 = 64;

/// Configuration for a TCP listener.
///
/// Controls the bind address, the accept backlog, socket options applied to
/// accepted connections, and the write-buffer limit handed to every new
/// transport. Use TcpServerConfig::builder() for ergonomic construction.
#[derive(Clone)]
pub struct TcpServerConfig {
    /// Address to bind to
    pub address: SocketAddr,
    /// listen(2) backlog
    pub backlog: i32,
    /// Enable TCP_NODELAY on accepted connections
    pub no_delay: bool,
    /// High water mark for each connection's write buffer
    pub write_limit: usize,
}

impl TcpServerConfig {
    /// Create a new builder for TcpServerConfig
    pub fn builder() -> TcpServerConfigBuilder {
        TcpServerConfigBuilder::new()
    }
}

impl Default for TcpServerConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:8080".parse().expect("static address"),
            backlog: DEFAULT_BACKLOG,
            no_delay: true,
            write_limit: DEFAULT_WRITE_LIMIT,
        }
    }
}

/// Builder for TcpServerConfig.
///
/// All fields are optional and fall back to TcpServerConfig::default()
/// if not explicitly set.
pub struct TcpServerConfigBuilder {
    address: Option<SocketAddr>,
    backlog: Option<i32>,
    no_delay: Option<bool>,
    write_limit: Option<usize>,
}

impl TcpServerConfigBuilder {
    pub fn new() -> Self {
        Self {
            address: None,
            backlog: None,
            no_delay: None,
            write_limit: None,
        }
    }

    /// Set the address to bind to
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Set the listen backlog
    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = Some(enabled);
        self
    }

    /// Set the write-buffer high water mark for accepted connections
    pub fn write_limit(mut self, bytes: usize) -> Self {
        self.write_limit = Some(bytes);
        self
    }

    /// Build the TcpServerConfig
    pub fn build(self) -> TcpServerConfig {
        let default = TcpServerConfig::default();
        TcpServerConfig {
            address: self.address.unwrap_or(default.address),
            backlog: self.backlog.unwrap_or(default.backlog),
            no_delay: self.no_delay.unwrap_or(default.no_delay),
            write_limit: self.write_limit.unwrap_or(default.write_limit),
        }
    }
}

impl Default for TcpServerConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
