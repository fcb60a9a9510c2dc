//! Character-generator server showcasing write flow control.
//!
//! Every connection gets an endless stream of pattern lines. The protocol
//! writes a large burst, waits for `pause_writing` once the buffer crosses
//! the high water mark, and continues on `resume_writing` after the buffer
//! drains below the low water mark, so a slow reader never makes the server
//! buffer grow without bound.
//!
//! Run with `cargo run --example chargen`, then `nc 127.0.0.1 8019 | pv > /dev/null`.

use std::net::SocketAddr;

use weir_io::net::tcp::{Protocol, TcpServer, TcpServerConfig, TcpTransport};
use weir_io::{error::Result, Capabilities, EventLoop};

/// Lines per burst; each line is 72 printable characters plus CRLF.
const BURST_LINES: usize = 8 * 1024;

struct ChargenProtocol {
    transport: Option<TcpTransport>,
    first_char: u8,
}

impl ChargenProtocol {
    fn pump(&mut self) {
        let transport = self.transport.as_ref().expect("connection_made ran");
        if transport.is_closed() {
            return;
        }
        let mut line = [0u8; 74];
        line[72] = b'\r';
        line[73] = b'\n';
        for _ in 0..BURST_LINES {
            for (i, slot) in line[..72].iter_mut().enumerate() {
                *slot = b' ' + (self.first_char - b' ' + i as u8) % 95;
            }
            self.first_char = b' ' + (self.first_char - b' ' + 1) % 95;
            transport.write(&line);
        }
    }
}

impl Protocol for ChargenProtocol {
    fn connection_made(&mut self, transport: &TcpTransport) {
        println!("client connected: {:?}", transport.remote_address());
        self.transport = Some(transport.clone());
        self.pump();
    }

    fn data_received(&mut self, _data: &[u8]) {}

    fn connection_lost(&mut self, error: Option<std::io::Error>) {
        match error {
            None => println!("client disconnected"),
            Some(e) => println!("client connection failed: {e}"),
        }
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            flow_control: true,
            ..Capabilities::default()
        }
    }

    fn pause_writing(&mut self) {
        // Buffer above the high water mark; wait for the drain.
    }

    fn resume_writing(&mut self) {
        self.pump();
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let addr: SocketAddr = "127.0.0.1:8019".parse().expect("static address");
    let ev = EventLoop::default_loop();

    let server = TcpServer::with_protocols(
        TcpServerConfig::builder().address(addr).build(),
        || {
            Box::new(ChargenProtocol {
                transport: None,
                first_char: b' ',
            })
        },
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

    println!("chargen server listening on {addr} (ctrl-c to stop)");
    ev.run()
}
