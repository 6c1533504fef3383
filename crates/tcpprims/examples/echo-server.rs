//! Minimal echo server: every frame is sent back on the connection it came
//! in on.
//!
//! Run with:
//!   cargo run --example echo-server -- 127.0.0.1:7878 selector
//!
//! In another terminal:
//!   cargo run --features cli -- send 127.0.0.1:7878 --data hello --wait

use std::io::BufRead;

use tcpprims::frame::Bytes;
use tcpprims::peer::{ConnectionId, Handler, Server, Strategy, Transport};

struct Echo;

impl Handler for Echo {
    fn on_accept(&self, _link: &dyn Transport, id: ConnectionId) {
        eprintln!("{id} connected");
    }

    fn on_receive(&self, link: &dyn Transport, id: ConnectionId, payload: Bytes) {
        eprintln!("{id}: {} bytes", payload.len());
        if let Err(err) = link.send(id, &payload) {
            eprintln!("{id}: echo failed: {err}");
        }
    }

    fn on_close(&self, _link: &dyn Transport, id: ConnectionId) {
        eprintln!("{id} disconnected");
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let addr = args.next().unwrap_or_else(|| "127.0.0.1:7878".to_string());
    let strategy: Strategy = args.next().as_deref().unwrap_or("blocking").parse()?;

    let server = Server::listen(strategy, addr.as_str(), Echo)?;
    eprintln!(
        "Listening on {} ({strategy}); press Enter to stop",
        server.local_addr()
    );

    let _ = std::io::stdin().lock().lines().next();
    server.stop();
    Ok(())
}
