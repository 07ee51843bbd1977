// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The per-socket connection state machine. Drives a
//! [`crate::writer::MessageWriter`] and [`crate::reader::MessageReader`]
//! against a live `TcpStream`, reporting completions, stop, and unsent
//! messages back to the owning [`crate::pool::ConnectionPool`].
//!
//! The reactor itself (sockets, timers, wakeups) is out of scope for this
//! module; it satisfies that boundary directly with tokio tasks rather
//! than introducing a separate reactor trait. Each active connection is
//! never touched concurrently by two reactor threads: the write half and
//! `MessageWriter` live entirely inside one task, the read half and
//! `MessageReader` entirely inside another; every other thread reaches
//! them only through the `inbox` channel, never by locking shared state
//! directly.

use std::{
    any::Any,
    sync::{
        Arc, Weak,
        atomic::{AtomicU8, Ordering},
    },
    time::Duration,
};

use anyhow::{Result, anyhow};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    time::timeout,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    error::CompletionError,
    framer::{HEADER_LEN, PacketFramer, PacketType},
    message::{MessageBundle, RequestId},
    pool::ConnectionPool,
    reader::{MessageReader, ReaderEvent},
    registry::TypeRegistry,
    writer::{MessageWriter, WriterLimits},
};

pub type ConnectionId = u64;

/// Races one I/O future against a timeout and a cancellation token.
async fn io_with_timeout<F, T>(label: &'static str, fut: F, io_timeout: Duration, cancel: &CancellationToken) -> Result<T>
where F: Future<Output = std::io::Result<T>> {
    tokio::select! {
        _ = cancel.cancelled() => Err(anyhow!("{label} cancelled")),
        res = timeout(io_timeout, fut) => match res {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(anyhow!("{label} timeout")),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Init = 0,
    Resolving = 1,
    Connecting = 2,
    Active = 3,
    Stopping = 4,
    Stopped = 5,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Init,
            1 => Self::Resolving,
            2 => Self::Connecting,
            3 => Self::Active,
            4 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Receives events the reader cannot interpret itself: completed inbound
/// messages and control packets are reported to the receiver directly.
/// The runtime never inspects message contents beyond routing them here.
pub trait Receiver: Send + Sync {
    fn receive_message(&self, conn_id: ConnectionId, type_idx: u32, value: Box<dyn Any + Send>);
    fn receive_keep_alive(&self, conn_id: ConnectionId) {
        let _ = conn_id;
    }
    fn receive_cancel_request(&self, conn_id: ConnectionId, request_id: RequestId) {
        let _ = (conn_id, request_id);
    }
}

#[derive(Clone, Copy)]
pub struct ConnectionTimers {
    pub keep_alive: Duration,
    pub inactivity_timeout: Duration,
    pub io_timeout: Duration,
}

impl Default for ConnectionTimers {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(30),
            inactivity_timeout: Duration::from_secs(120),
            io_timeout: Duration::from_secs(20),
        }
    }
}

/// Events the write loop processes; this is the only door into the
/// connection's `MessageWriter` from outside its own task.
enum WriteEvent {
    Enqueue(MessageBundle),
    CancelInFlight(usize),
    PullFromPool,
}

/// A handle to one TCP connection driving one writer/reader pair. Cheap to
/// clone and share; the actual socket halves and message state live only
/// inside the two spawned loop tasks.
pub struct Connection {
    pub id: ConnectionId,
    pool: Weak<ConnectionPool>,
    state: AtomicU8,
    cancel: CancellationToken,
    inbox: mpsc::UnboundedSender<WriteEvent>,
}

impl Connection {
    /// Spawns an already-connected socket (outgoing, post-resolve, or
    /// server-accepted) and starts its read/write loops.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        id: ConnectionId,
        pool: Weak<ConnectionPool>,
        stream: TcpStream,
        writer_limits: WriterLimits,
        framer: PacketFramer,
        registry: Arc<dyn TypeRegistry>,
        receiver: Arc<dyn Receiver>,
        timers: ConnectionTimers,
    ) -> Arc<Self> {
        stream.set_nodelay(true).ok();
        let (read_half, write_half) = stream.into_split();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::unbounded_channel();

        let conn = Arc::new(Self {
            id,
            pool,
            state: AtomicU8::new(ConnectionState::Active as u8),
            cancel: cancel.clone(),
            inbox: tx,
        });

        let write_conn = conn.clone();
        let write_framer = framer.clone();
        let write_registry = registry.clone();
        tokio::spawn(async move {
            write_conn.clone().write_loop(write_half, rx, write_framer, write_registry, writer_limits, timers).await;
        });

        let read_conn = conn.clone();
        tokio::spawn(async move {
            read_conn.clone().read_loop(read_half, framer, registry, receiver, timers).await;
        });

        conn
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    /// Admits a new message. Never blocks: the bundle is handed off to the
    /// write loop over a channel.
    pub fn enqueue(&self, bundle: MessageBundle) {
        if let Err(err) = self.inbox.send(WriteEvent::Enqueue(bundle)) {
            // Write loop already exited; report the failure the same way a
            // dead connection would instead of dropping the bundle.
            if let WriteEvent::Enqueue(bundle) = err.0 {
                crate::service::complete_closed(bundle);
            }
        }
    }

    /// Wakes the write loop so it re-checks the pool for new work.
    pub fn notify_work(&self) {
        let _ = self.inbox.send(WriteEvent::PullFromPool);
    }

    /// Drops an in-flight write-id's partial serialization and tells the
    /// peer (the pool's cancel visitor).
    pub fn cancel_in_flight(&self, write_id: u32) {
        let _ = self.inbox.send(WriteEvent::CancelInFlight(write_id as usize));
    }

    /// Enters `Stopping`; the loops observe the cancellation token and
    /// exit, triggering rescue via `on_connection_close`. Also tells the
    /// owning pool this connection wants to stop so it can start handing
    /// off the cancel-delivery role before teardown completes.
    pub fn request_close(&self) {
        if self.begin_stop()
            && let Some(pool) = self.pool.upgrade()
        {
            pool.on_connection_want_stop(self.id);
        }
    }

    pub fn kill(&self) {
        self.begin_stop();
    }

    /// Returns `true` the first time this connection transitions into
    /// `Stopping`.
    fn begin_stop(&self) -> bool {
        let prev = self.state.swap(ConnectionState::Stopping as u8, Ordering::SeqCst);
        let first = prev != ConnectionState::Stopping as u8 && prev != ConnectionState::Stopped as u8;
        if first {
            self.cancel.cancel();
        }
        first
    }

    async fn write_loop(
        self: Arc<Self>,
        mut write_half: OwnedWriteHalf,
        mut inbox: mpsc::UnboundedReceiver<WriteEvent>,
        framer: PacketFramer,
        registry: Arc<dyn TypeRegistry>,
        writer_limits: WriterLimits,
        timers: ConnectionTimers,
    ) {
        let mut writer = MessageWriter::new(writer_limits);
        let mut buf = vec![0u8; framer.max_payload() + HEADER_LEN];

        let result: Result<()> = async {
            loop {
                if let Some(pool) = self.pool.upgrade() {
                    for (pool_idx, bundle) in pool.check_pool_for_new_messages(self.id) {
                        if let Some(writer_id) = writer.enqueue(bundle) {
                            pool.record_writer_id(pool_idx, self.id, writer_id as u32);
                        }
                    }
                }

                let n = writer.write(&mut buf, false, &framer, registry.as_ref())?;
                if n > 0 {
                    io_with_timeout("write packet", write_half.write_all(&buf[..n]), timers.io_timeout, &self.cancel).await?;
                    continue;
                }

                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    event = inbox.recv() => match event {
                        Some(WriteEvent::Enqueue(bundle)) => { writer.enqueue(bundle); }
                        Some(WriteEvent::CancelInFlight(idx)) => {
                            if let Some(bundle) = writer.cancel_in_flight(idx) {
                                bundle.complete(CompletionError::Canceled);
                                send_cancel_message(&mut write_half, &framer, idx as u16, &self.cancel, timers.io_timeout).await?;
                            }
                        }
                        Some(WriteEvent::PullFromPool) => {}
                        None => break,
                    },
                    _ = tokio::time::sleep(timers.keep_alive) => {
                        let kn = writer.write(&mut buf, true, &framer, registry.as_ref())?;
                        if kn > 0 {
                            io_with_timeout("write keep-alive", write_half.write_all(&buf[..kn]), timers.io_timeout, &self.cancel).await?;
                        }
                    },
                }
            }
            Ok(())
        }
        .await;

        if let Err(e) = result {
            debug!(conn_id = self.id, "write loop exited: {e}");
        }

        let _ = write_half.shutdown().await;
        let unsent = writer.fetch_unsent_messages();
        self.finish_stop(unsent);
    }

    async fn read_loop(
        self: Arc<Self>,
        mut read_half: OwnedReadHalf,
        framer: PacketFramer,
        registry: Arc<dyn TypeRegistry>,
        receiver: Arc<dyn Receiver>,
        timers: ConnectionTimers,
    ) {
        let mut reader = MessageReader::new();
        let mut header_buf = [0u8; HEADER_LEN];

        let result: Result<()> = async {
            loop {
                io_with_timeout("read header", read_half.read_exact(&mut header_buf), timers.inactivity_timeout, &self.cancel).await?;

                let header = framer.parse_header(&header_buf)?;
                let payload_len = header.size as usize - HEADER_LEN;
                let mut payload = vec![0u8; payload_len];
                if payload_len > 0 {
                    io_with_timeout("read payload", read_half.read_exact(&mut payload), timers.io_timeout, &self.cancel).await?;
                }

                let events = reader.consume_packet(&header, &payload, &framer, registry.as_ref())?;
                for event in events {
                    match event {
                        ReaderEvent::Message { type_idx, value } => receiver.receive_message(self.id, type_idx, value),
                        ReaderEvent::KeepAlive => receiver.receive_keep_alive(self.id),
                        ReaderEvent::CancelRequest { request_id } => receiver.receive_cancel_request(self.id, request_id),
                        // Our own read slot for this write-id was already
                        // dropped inside `consume_packet`; nothing else to
                        // do here since this id only ever identifies the
                        // peer's outbound message, never ours.
                        ReaderEvent::CancelMessage { .. } => {}
                        ReaderEvent::AckCount { .. } | ReaderEvent::Update { .. } => {}
                    }
                }
            }
        }
        .await;

        if let Err(e) = result {
            debug!(conn_id = self.id, "read loop exited: {e}");
        }
        self.begin_stop();
    }

    /// Hands everything the writer never finished sending back to the
    /// pool for rescue.
    fn finish_stop(&self, unsent: Vec<MessageBundle>) {
        self.cancel.cancel();
        if let Some(pool) = self.pool.upgrade() {
            pool.on_connection_close(self.id, unsent);
        } else {
            for bundle in unsent {
                bundle.complete(CompletionError::ConnectionClosed);
            }
        }
        self.state.store(ConnectionState::Stopped as u8, Ordering::SeqCst);
    }
}

async fn send_cancel_message(
    write_half: &mut OwnedWriteHalf,
    framer: &PacketFramer,
    write_id: u16,
    cancel: &CancellationToken,
    io_timeout: Duration,
) -> Result<()> {
    let mut buf = vec![0u8; HEADER_LEN + 2];
    buf[HEADER_LEN..].copy_from_slice(&write_id.to_be_bytes());
    framer.stamp_header(&mut buf, PacketType::CancelMessage, 2, false)?;
    io_with_timeout("write cancel", write_half.write_all(&buf), io_timeout, cancel).await
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("id", &self.id).field("state", &self.state()).finish()
    }
}
