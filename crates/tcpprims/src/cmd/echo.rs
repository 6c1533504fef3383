use std::sync::mpsc;

use bytes::Bytes;
use tcpprims_peer::{ConnectionId, Handler, PeerConfig, Server, Transport};

use crate::cmd::{install_ctrlc_handler, EchoArgs};
use crate::exit::{peer_error, CliResult, SUCCESS};

struct Echo;

impl Handler for Echo {
    fn on_accept(&self, _link: &dyn Transport, id: ConnectionId) {
        tracing::info!(%id, "client connected");
    }

    fn on_receive(&self, link: &dyn Transport, id: ConnectionId, payload: Bytes) {
        tracing::info!(%id, size = payload.len(), "echoing frame");
        if let Err(err) = link.send(id, &payload) {
            tracing::warn!(%id, error = %err, "echo send failed");
        }
    }

    fn on_close(&self, _link: &dyn Transport, id: ConnectionId) {
        tracing::info!(%id, "client disconnected");
    }
}

pub fn run(args: EchoArgs, config: PeerConfig) -> CliResult<i32> {
    let server = Server::listen_with_config(args.strategy, args.addr.as_str(), Echo, config)
        .map_err(|err| peer_error("bind failed", err))?;
    tracing::info!(
        addr = %server.local_addr(),
        strategy = %args.strategy,
        "echo server ready"
    );

    let (interrupted, wait) = mpsc::channel();
    install_ctrlc_handler(interrupted, || ())?;
    let _ = wait.recv();

    tracing::info!("shutting down");
    server.stop();
    Ok(SUCCESS)
}
