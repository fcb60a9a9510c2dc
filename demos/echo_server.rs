//! Echo server with an idle timeout.
//!
//! Run with `cargo run --example echo_server`, then `nc 127.0.0.1 8080`.
//! Connections quiet for 30 seconds are closed.

use std::net::SocketAddr;

use weir_io::net::tcp::{Protocol, TcpServer, TcpServerConfig, TcpTransport};
use weir_io::{error::Result, Capabilities, EventLoop};

const IDLE_SECONDS: f64 = 30.0;

struct EchoProtocol {
    transport: Option<TcpTransport>,
}

impl Protocol for EchoProtocol {
    fn connection_made(&mut self, transport: &TcpTransport) {
        println!("client connected: {:?}", transport.remote_address());
        self.transport = Some(transport.clone());
        transport.set_timeout(IDLE_SECONDS);
    }

    fn data_received(&mut self, data: &[u8]) {
        let transport = self.transport.as_ref().expect("connection_made ran");
        transport.write(data);
        transport.set_timeout(IDLE_SECONDS);
    }

    fn connection_lost(&mut self, error: Option<std::io::Error>) {
        match error {
            None => println!("client disconnected"),
            Some(e) => println!("client connection failed: {e}"),
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            timeout: true,
            ..Capabilities::default()
        }
    }

    fn connection_timeout(&mut self) {
        println!("client idle for {IDLE_SECONDS}s, closing");
        self.transport.as_ref().expect("connection_made ran").close();
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr: SocketAddr = "127.0.0.1:8080".parse().expect("static address");
    let ev = EventLoop::default_loop();

    let server = TcpServer::with_protocols(
        TcpServerConfig::builder().address(addr).build(),
        || Box::new(EchoProtocol { transport: None }),
    );
    server.start(&ev)?;

    {
        let server = server.clone();
        ev.on_signal(libc::SIGINT, move |ev| {
            println!("shutting down");
            server.stop();
            ev.stop();
        })?;
    }

    println!("echo server listening on {addr} (ctrl-c to stop)");
    ev.run()
}
