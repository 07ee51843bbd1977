// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    any::Any,
    net::SocketAddr,
    sync::{Arc, atomic::AtomicU64},
};

use ipcmux_rs::{
    connection::{Connection, ConnectionId, ConnectionTimers, Receiver},
    framer::{DEFAULT_MAX_PACKET, HEADER_LEN, PacketFramer},
    pool::{ConnectionPool, ConnSpawnHook, PoolLimits},
    reader::{MessageReader, ReaderEvent},
    registry::test_support::BytesRegistry,
    resolver::StaticResolver,
};
use tokio::{
    io::AsyncReadExt,
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

/// Events the fake peer reports back to the test about one accepted
/// connection: raw bytes seen at the TCP level (so a test can tell a
/// message was only partially received) and fully reassembled messages.
/// `peer` numbers accepted sockets in accept order, so a test driving a
/// pool with more than one live connection can tell them apart.
#[derive(Debug)]
pub enum PeerEvent {
    RawBytes { peer: usize, len: usize },
    Message { peer: usize, len: usize },
    Disconnected { peer: usize },
}

/// A loopback TCP acceptor that decodes the wire protocol the same way
/// `Connection::read_loop` does, without any of the pool/writer machinery,
/// so tests can observe exactly what a real peer would see.
pub struct FakePeer {
    pub addr: SocketAddr,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

pub async fn spawn_fake_peer() -> FakePeer {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind loopback listener");
    let addr = listener.local_addr().expect("local addr");
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut next_peer = 0usize;
        loop {
            let Ok((stream, _)) = listener.accept().await else { break };
            let tx = tx.clone();
            let peer = next_peer;
            next_peer += 1;
            tokio::spawn(read_connection(stream, peer, tx));
        }
    });

    FakePeer { addr, events: rx }
}

async fn read_connection(mut stream: TcpStream, peer: usize, tx: mpsc::UnboundedSender<PeerEvent>) {
    let framer = PacketFramer::new(DEFAULT_MAX_PACKET);
    let registry = BytesRegistry;
    let mut reader = MessageReader::new();
    let mut header_buf = [0u8; HEADER_LEN];

    loop {
        if stream.read_exact(&mut header_buf).await.is_err() {
            break;
        }
        let Ok(header) = framer.parse_header(&header_buf) else { break };
        let payload_len = header.size as usize - HEADER_LEN;
        let mut payload = vec![0u8; payload_len];
        if payload_len > 0 && stream.read_exact(&mut payload).await.is_err() {
            break;
        }
        let _ = tx.send(PeerEvent::RawBytes { peer, len: HEADER_LEN + payload_len });

        let Ok(events) = reader.consume_packet(&header, &payload, &framer, &registry) else { break };
        for event in events {
            if let ReaderEvent::Message { value, .. } = event
                && let Ok(bytes) = value.downcast::<Vec<u8>>()
            {
                let _ = tx.send(PeerEvent::Message { peer, len: bytes.len() });
            }
        }
    }
    let _ = tx.send(PeerEvent::Disconnected { peer });
}

pub struct NullReceiver;

impl Receiver for NullReceiver {
    fn receive_message(&self, _conn_id: ConnectionId, _type_idx: u32, _value: Box<dyn Any + Send>) {}
}

/// Builds a pool pointed at `peer_addr` and wires its connection-spawn hook
/// to hand every `Arc<Connection>` it creates back to the test, so tests
/// can drive connection lifecycle (`kill`, `request_close`) directly.
pub fn pool_with_peer(
    name: &str,
    peer_addr: SocketAddr,
    limits: PoolLimits,
) -> (Arc<ConnectionPool>, mpsc::UnboundedReceiver<(ConnectionId, Arc<Connection>)>) {
    let resolver = Arc::new(StaticResolver::new());
    resolver.insert(name, vec![peer_addr]);
    pool_with_resolver(name, resolver, limits)
}

/// Like [`pool_with_peer`] but hands back the `StaticResolver` too, so a
/// test can re-point the pool at a different address mid-run (e.g. to
/// observe a replacement connection after killing the first one).
pub fn pool_with_resolver(
    name: &str,
    resolver: Arc<StaticResolver>,
    limits: PoolLimits,
) -> (Arc<ConnectionPool>, mpsc::UnboundedReceiver<(ConnectionId, Arc<Connection>)>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let hook: ConnSpawnHook = Arc::new(move |id, conn, _pool_id| {
        let _ = tx.send((id, conn));
    });

    let pool = ConnectionPool::new(
        name,
        1,
        limits,
        PacketFramer::new(DEFAULT_MAX_PACKET),
        Arc::new(BytesRegistry),
        resolver,
        Arc::new(NullReceiver),
        ConnectionTimers::default(),
        Arc::new(AtomicU64::new(1)),
        Some(hook),
    );
    (pool, rx)
}

pub fn small_limits(max_multiplex: usize, max_waiting: usize, max_pending: usize, max_continuous: u32) -> PoolLimits {
    PoolLimits {
        max_per_pool_connection_count: 1,
        writer: ipcmux_rs::writer::WriterLimits {
            max_multiplex,
            max_waiting,
            max_pending,
            max_continuous_packet_count: max_continuous,
        },
        msg_cancel_connection_wait: std::time::Duration::from_millis(50),
    }
}
