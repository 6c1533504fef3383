use std::sync::mpsc;

use bytes::Bytes;
use tcpprims_peer::{ConnectionId, PeerConfig, Server, Transport};

use crate::cmd::{install_ctrlc_handler, ListenArgs};
use crate::exit::{peer_error, CliResult, SUCCESS};
use crate::output::{print_frame, OutputFormat};

enum ListenEvent {
    Frame(ConnectionId, Bytes),
    Interrupted,
}

pub fn run(args: ListenArgs, format: OutputFormat, config: PeerConfig) -> CliResult<i32> {
    let (events, inbox) = mpsc::channel();

    let frames = events.clone();
    let server = Server::listen_with_config(
        args.strategy,
        args.addr.as_str(),
        move |_link: &dyn Transport, id: ConnectionId, payload: Bytes| {
            let _ = frames.send(ListenEvent::Frame(id, payload));
        },
        config,
    )
    .map_err(|err| peer_error("bind failed", err))?;
    tracing::info!(
        addr = %server.local_addr(),
        strategy = %args.strategy,
        "listening"
    );

    install_ctrlc_handler(events, || ListenEvent::Interrupted)?;

    let printed = print_until(&inbox, args.count, format);
    tracing::debug!(printed, "listen finished");

    server.stop();
    Ok(SUCCESS)
}

/// Print frames until `count` is reached or the user interrupts.
fn print_until(
    inbox: &mpsc::Receiver<ListenEvent>,
    count: Option<usize>,
    format: OutputFormat,
) -> usize {
    let mut printed = 0usize;
    if count == Some(0) {
        return printed;
    }

    while let Ok(event) = inbox.recv() {
        match event {
            ListenEvent::Frame(id, payload) => {
                print_frame(id, &payload, format);
                printed = printed.saturating_add(1);
                if count.is_some_and(|count| printed >= count) {
                    break;
                }
            }
            ListenEvent::Interrupted => break,
        }
    }
    printed
}
