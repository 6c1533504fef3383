mod common;

use std::io::Write;
use std::sync::mpsc;
use std::time::Duration;

use bytes::Bytes;
use common::{Event, RawPeer, Recorder, STRATEGIES};
use tcpprims_frame::FrameError;
use tcpprims_peer::{Client, ConnectionId, PeerConfig, PeerError, Server, Transport};
use tcpprims_transport::TcpConnection;

const BOUND: usize = 256 * 1024;

fn bounded() -> PeerConfig {
    PeerConfig {
        max_payload_size: BOUND,
        ..PeerConfig::default()
    }
}

#[test]
fn payloads_roundtrip_in_order() {
    for strategy in STRATEGIES {
        let server_events = Recorder::echoing();
        let server = Server::listen_with_config(
            strategy,
            "127.0.0.1:0",
            server_events.handler(),
            bounded(),
        )
        .expect("server should bind");

        let client_events = Recorder::new();
        let client = Client::with_config(strategy, client_events.handler(), bounded())
            .expect("client should start");
        let id = client
            .connect(server.local_addr())
            .expect("client should connect");

        let near_bound: Vec<u8> = (0..BOUND - 1).map(|i| (i % 251) as u8).collect();
        let at_bound = vec![0xA5; BOUND];
        let payloads: Vec<Bytes> = vec![
            Bytes::new(),
            Bytes::from_static(b"x"),
            Bytes::from_static(b"hello, world"),
            Bytes::from(near_bound),
            Bytes::from(at_bound),
            Bytes::new(),
        ];
        for payload in &payloads {
            client.send(id, payload).expect("send should succeed");
        }

        let echoed = client_events.wait_for_payloads(id, payloads.len());
        assert_eq!(echoed, payloads, "{strategy}: echo mismatch");
        assert_eq!(client_events.events()[0], Event::Connect(id), "{strategy}");

        client.stop();
        server.stop();
    }
}

#[test]
fn oversized_send_fails_and_keeps_connection() {
    for strategy in STRATEGIES {
        let server = Server::listen_with_config(
            strategy,
            "127.0.0.1:0",
            Recorder::echoing().handler(),
            bounded(),
        )
        .expect("server should bind");
        let client_events = Recorder::new();
        let client = Client::with_config(strategy, client_events.handler(), bounded())
            .expect("client should start");
        let id = client
            .connect(server.local_addr())
            .expect("client should connect");

        let err = client
            .send(id, &vec![0u8; BOUND + 1])
            .expect_err("oversized send should fail");
        assert!(
            matches!(err, PeerError::Frame(FrameError::PayloadTooLarge { .. })),
            "{strategy}: {err}"
        );

        client.send(id, b"still here").expect("send should succeed");
        assert_eq!(
            client_events.wait_for_payloads(id, 1),
            vec![Bytes::from_static(b"still here")]
        );
        assert_eq!(client.connection_id(), Some(id));

        client.stop();
        server.stop();
    }
}

#[test]
fn strategies_interoperate_on_the_wire() {
    for (server_strategy, client_strategy) in [
        (STRATEGIES[0], STRATEGIES[1]),
        (STRATEGIES[1], STRATEGIES[0]),
    ] {
        let server = Server::listen(
            server_strategy,
            "127.0.0.1:0",
            Recorder::echoing().handler(),
        )
        .expect("server should bind");
        let client_events = Recorder::new();
        let client =
            Client::new(client_strategy, client_events.handler()).expect("client should start");
        let id = client
            .connect(server.local_addr())
            .expect("client should connect");

        client.send(id, b"across").expect("send should succeed");
        assert_eq!(
            client_events.wait_for_payloads(id, 1),
            vec![Bytes::from_static(b"across")]
        );

        client.stop();
        server.stop();
    }
}

#[test]
fn fragmented_input_decodes_identically() {
    for strategy in STRATEGIES {
        let events = Recorder::new();
        let server =
            Server::listen(strategy, "127.0.0.1:0", events.handler()).expect("server should bind");

        let payloads: [&[u8]; 3] = [b"first", b"", b"third frame"];
        let mut wire = Vec::new();
        for payload in payloads {
            wire.extend_from_slice(&(payload.len() as u32).to_be_bytes());
            wire.extend_from_slice(payload);
        }

        let mut stream = TcpConnection::connect(server.local_addr()).expect("should connect");
        stream.set_nodelay(true).expect("nodelay should apply");
        let id = events.wait_for_accepts(1)[0];
        for byte in &wire {
            stream.write_all(std::slice::from_ref(byte)).expect("write should succeed");
            std::thread::sleep(Duration::from_millis(1));
        }

        let got = events.wait_for_payloads(id, payloads.len());
        let expected: Vec<Bytes> = payloads.iter().map(|p| Bytes::copy_from_slice(p)).collect();
        assert_eq!(got, expected, "{strategy}");

        server.stop();
    }
}

#[test]
fn per_connection_receiver_takes_precedence() {
    for strategy in STRATEGIES {
        let events = Recorder::new();
        let server =
            Server::listen(strategy, "127.0.0.1:0", events.handler()).expect("server should bind");

        let mut peer = RawPeer::connect(server.local_addr());
        let id = events.wait_for_accepts(1)[0];

        let (tx, rx) = mpsc::channel();
        let tx = std::sync::Mutex::new(tx);
        server.set_receiver(
            id,
            std::sync::Arc::new(move |from: ConnectionId, payload: Bytes| {
                let _ = tx.lock().unwrap().send((from, payload));
            }),
        );
        // Give the selector loop a chance to apply the queued command.
        server.send(id, b"sync").expect("send should succeed");
        assert_eq!(&peer.recv()[..], b"sync");

        peer.send(b"routed");
        let (from, payload) = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("receiver should be called");
        assert_eq!(from, id);
        assert_eq!(&payload[..], b"routed");
        assert!(common::received(&events.events(), id).is_empty(), "{strategy}");

        server.stop();
    }
}
