use std::fs;
use std::sync::{mpsc, Mutex};

use bytes::Bytes;
use tcpprims_frame::FrameError;
use tcpprims_peer::{Client, ConnectionId, Handler, PeerConfig, Transport};

use crate::cmd::SendArgs;
use crate::exit::{frame_error, peer_error, CliError, CliResult, FAILURE, SUCCESS};
use crate::output::{print_frame, OutputFormat};

enum Reply {
    Frame(ConnectionId, Bytes),
    Closed,
}

/// Forwards the first reply, or the close that made one impossible.
struct ReplyForwarder(Mutex<Option<mpsc::Sender<Reply>>>);

impl ReplyForwarder {
    fn forward(&self, reply: Reply) {
        let sender = self.0.lock().ok().and_then(|mut slot| slot.take());
        if let Some(sender) = sender {
            let _ = sender.send(reply);
        }
    }
}

impl Handler for ReplyForwarder {
    fn on_receive(&self, _link: &dyn Transport, id: ConnectionId, payload: Bytes) {
        self.forward(Reply::Frame(id, payload));
    }

    fn on_close(&self, _link: &dyn Transport, _id: ConnectionId) {
        self.forward(Reply::Closed);
    }
}

pub fn run(args: SendArgs, format: OutputFormat, config: PeerConfig) -> CliResult<i32> {
    let payload = resolve_payload(&args)?;
    // Fail before touching the network.
    if payload.len() > config.max_payload_size {
        let err = FrameError::PayloadTooLarge {
            size: payload.len(),
            max: config.max_payload_size,
        };
        return Err(frame_error("send failed", err));
    }

    let (replies, inbox) = mpsc::channel();
    let client = Client::with_config(
        args.strategy,
        ReplyForwarder(Mutex::new(Some(replies))),
        config,
    )
    .map_err(|err| peer_error("client setup failed", err))?;

    let result = exchange(&client, &args, &payload, &inbox, format);
    client.stop();
    result
}

fn exchange(
    client: &Client,
    args: &SendArgs,
    payload: &[u8],
    inbox: &mpsc::Receiver<Reply>,
    format: OutputFormat,
) -> CliResult<i32> {
    let id = client
        .connect(args.addr.as_str())
        .map_err(|err| peer_error("connect failed", err))?;
    client
        .send(id, payload)
        .map_err(|err| peer_error("send failed", err))?;
    tracing::debug!(%id, size = payload.len(), "frame sent");

    if args.wait {
        match inbox.recv() {
            Ok(Reply::Frame(from, reply)) => print_frame(from, &reply, format),
            Ok(Reply::Closed) | Err(_) => {
                return Err(CliError::new(
                    FAILURE,
                    "receive failed: connection closed before a reply arrived",
                ))
            }
        }
    }
    Ok(SUCCESS)
}

fn resolve_payload(args: &SendArgs) -> CliResult<Vec<u8>> {
    if let Some(data) = &args.data {
        return Ok(data.as_bytes().to_vec());
    }
    if let Some(path) = &args.file {
        return fs::read(path).map_err(|err| {
            crate::exit::io_error(&format!("failed reading {}", path.display()), err)
        });
    }
    Ok(Vec::new())
}
