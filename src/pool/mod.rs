// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The per-recipient connection pool. Owns user-visible messages until they
//! are handed to a connection, schedules assignment, enforces pool-wide
//! synchronous order, and rescues messages back from a dying connection.
//!
//! The three intrusive lists the design notes describe (*order*, *async*,
//! *cache*) are represented the same way [`crate::writer::MessageWriter`]
//! represents its write queue: a flat slot table plus `VecDeque<usize>`
//! index queues, rather than hand-rolled prev/next links. *async* is not
//! tracked as a separate queue at all — whether a slot is asynchronous is a
//! property of its message flags, so "the first async entry in order" is
//! found by scanning `order`, which is cheap at the sizes this runtime
//! targets and keeps the invariant (`slot in async iff slot in order and
//! asynchronous`) true by construction instead of by upkeep.

use std::{
    collections::{HashMap, VecDeque},
    net::SocketAddr,
    sync::{
        Arc, Mutex, OnceLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use tracing::warn;

use crate::{
    connection::{Connection, ConnectionId, ConnectionTimers, Receiver},
    error::{CompletionError, RuntimeError},
    framer::PacketFramer,
    message::{MessageBundle, MessageId},
    registry::TypeRegistry,
    resolver::Resolver,
    writer::WriterLimits,
};

struct Slot {
    bundle: Option<MessageBundle>,
    unique: u64,
    conn_id: Option<ConnectionId>,
    /// The write-id [`crate::writer::MessageWriter`] assigned this message
    /// on the owning connection, once it lands in the writer's live queue.
    /// `None` until [`ConnectionPool::record_writer_id`] reports it back.
    writer_id: Option<u32>,
    cancelable: bool,
    canceled: bool,
}

impl Slot {
    fn is_async(&self) -> bool {
        self.bundle.as_ref().is_some_and(|b| b.message.flags.is_asynchronous())
    }
}

struct PoolInner {
    slots: Vec<Slot>,
    free: Vec<usize>,
    order: VecDeque<usize>,
    next_unique: u64,
    connections: HashMap<ConnectionId, Arc<Connection>>,
    pending_resolve_count: usize,
    conn_waitingq: VecDeque<ConnectionId>,
    synchronous_connection_id: Option<ConnectionId>,
    cancel_connection_id: Option<ConnectionId>,
    /// Set while the designated cancel-delivery connection is mid-stop and
    /// a grace period is running to hand the role to another connection.
    msg_cancel_connection_stopping: bool,
    is_stopping: bool,
}

/// Rescue disposition for one bundle a dying connection never finished
/// sending. Idempotent messages not yet fully sent get exactly one further
/// delivery attempt; anything fully sent is assumed delivered; anything
/// else is lost along with the connection. Returns `true` if the bundle
/// was reinserted into `order` for retry.
fn rescue_bundle(inner: &mut PoolInner, bundle: MessageBundle) -> bool {
    if bundle.message.flags.is_done_send() {
        bundle.complete(CompletionError::NoError);
        return false;
    }
    if bundle.message.flags.is_idempotent() {
        let (idx, _unique) = inner.alloc_slot(bundle);
        inner.order.push_front(idx);
        return true;
    }
    bundle.complete(CompletionError::ConnectionClosed);
    false
}

impl PoolInner {
    fn active_connection_count(&self) -> usize {
        self.connections.values().filter(|c| c.is_active()).count()
    }

    fn alloc_slot(&mut self, bundle: MessageBundle) -> (usize, u64) {
        let unique = self.next_unique;
        self.next_unique += 1;
        let slot = Slot { bundle: Some(bundle), unique, conn_id: None, writer_id: None, cancelable: false, canceled: false };
        let idx = if let Some(idx) = self.free.pop() {
            self.slots[idx] = slot;
            idx
        } else {
            self.slots.push(slot);
            self.slots.len() - 1
        };
        (idx, unique)
    }

    fn recycle(&mut self, idx: usize) {
        self.slots[idx].bundle = None;
        self.free.push(idx);
    }
}

/// Per-connection tunables plus the pool's own provisioning cap.
#[derive(Debug, Clone, Copy)]
pub struct PoolLimits {
    pub max_per_pool_connection_count: usize,
    pub writer: WriterLimits,
    /// Grace period a stopping `cancel_connection_id` is given before a
    /// replacement is designated (`msg_cancel_connection_wait_seconds`
    /// config key).
    pub msg_cancel_connection_wait: Duration,
}

/// Invoked whenever a pool brings a new connection under management,
/// whether self-provisioned or handed in by the caller
/// via [`ConnectionPool::register_connection`]. Lets
/// [`crate::service::Service`] track every connection in the system under
/// one id space without the pool needing to know about `Service` itself.
pub type ConnSpawnHook = Arc<dyn Fn(ConnectionId, Arc<Connection>, u64) + Send + Sync>;

/// A named recipient's connection pool.
pub struct ConnectionPool {
    pub name: String,
    pub pool_id: u64,
    inner: Mutex<PoolInner>,
    limits: PoolLimits,
    framer_template: PacketFramer,
    registry: Arc<dyn TypeRegistry>,
    resolver: Arc<dyn Resolver>,
    receiver: Arc<dyn Receiver>,
    timers: ConnectionTimers,
    conn_id_source: Arc<AtomicU64>,
    on_connection: Option<ConnSpawnHook>,
    self_weak: OnceLock<Weak<ConnectionPool>>,
}

impl ConnectionPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        pool_id: u64,
        limits: PoolLimits,
        framer_template: PacketFramer,
        registry: Arc<dyn TypeRegistry>,
        resolver: Arc<dyn Resolver>,
        receiver: Arc<dyn Receiver>,
        timers: ConnectionTimers,
        conn_id_source: Arc<AtomicU64>,
        on_connection: Option<ConnSpawnHook>,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            name: name.into(),
            pool_id,
            inner: Mutex::new(PoolInner {
                slots: Vec::new(),
                free: Vec::new(),
                order: VecDeque::new(),
                next_unique: 0,
                connections: HashMap::new(),
                pending_resolve_count: 0,
                conn_waitingq: VecDeque::new(),
                synchronous_connection_id: None,
                cancel_connection_id: None,
                msg_cancel_connection_stopping: false,
                is_stopping: false,
            }),
            limits,
            framer_template,
            registry,
            resolver,
            receiver,
            timers,
            conn_id_source,
            on_connection,
            self_weak: OnceLock::new(),
        });
        let _ = pool.self_weak.set(Arc::downgrade(&pool));
        pool
    }

    fn weak_self(&self) -> Weak<ConnectionPool> {
        self.self_weak.get().cloned().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.inner.lock().expect("pool mutex poisoned");
        inner.order.is_empty() && inner.connections.is_empty()
    }

    /// Send admission. Allocates a slot, links it into `order`, and wakes
    /// a connection to carry it. A `WaitResponse` message with no
    /// caller-assigned request id is given a fresh one, since the peer's
    /// reply can only be matched back to the writer's response-wait table
    /// by that id.
    pub fn do_send(self: &Arc<Self>, mut bundle: MessageBundle, cancelable: bool) -> MessageId {
        if bundle.message.flags.wants_response() && bundle.message.request_id == 0 {
            bundle.message.request_id = crate::utils::fresh_request_id();
        }
        let is_sync = bundle.message.flags.is_synchronous();
        let (idx, unique) = {
            let mut inner = self.inner.lock().expect("pool mutex poisoned");
            let (idx, unique) = inner.alloc_slot(bundle);
            inner.slots[idx].cancelable = cancelable;
            inner.order.push_back(idx);
            (idx, unique)
        };
        self.wake_connection_for(is_sync);
        MessageId { index: idx as u32, unique }
    }

    /// Waking a connection after `do_send`.
    fn wake_connection_for(self: &Arc<Self>, is_sync: bool) {
        let woken = {
            let mut inner = self.inner.lock().expect("pool mutex poisoned");

            if is_sync {
                if let Some(conn_id) = inner.synchronous_connection_id {
                    if let Some(conn) = inner.connections.get(&conn_id).filter(|c| c.is_active()) {
                        conn.notify_work();
                        true
                    } else {
                        inner.synchronous_connection_id = None;
                        false
                    }
                } else {
                    false
                }
            } else {
                false
            }
        };
        if woken {
            return;
        }

        let waiting_conn = {
            let mut inner = self.inner.lock().expect("pool mutex poisoned");
            loop {
                let Some(conn_id) = inner.conn_waitingq.pop_front() else { break None };
                if let Some(conn) = inner.connections.get(&conn_id).filter(|c| c.is_active()) {
                    break Some(conn.clone());
                }
            }
        };
        if let Some(conn) = waiting_conn {
            conn.notify_work();
            return;
        }

        self.maybe_provision_connection();
    }

    /// Provisions a new connection when under the pool's concurrency cap;
    /// provisioning is bounded so a burst of sends can't spawn unbounded
    /// connections.
    fn maybe_provision_connection(self: &Arc<Self>) {
        let should_provision = {
            let mut inner = self.inner.lock().expect("pool mutex poisoned");
            let total = inner.active_connection_count() + inner.pending_resolve_count;
            let fits = total < self.limits.max_per_pool_connection_count
                && inner.pending_resolve_count < self.limits.max_per_pool_connection_count;
            if fits {
                inner.pending_resolve_count += 1;
            }
            fits
        };
        if !should_provision {
            return;
        }

        let pool = self.clone();
        tokio::spawn(async move {
            let result = pool.resolver.resolve(&pool.name).await.and_then(|addrs| {
                addrs.into_iter().next().ok_or(RuntimeError::PoolInexistent(pool.name.clone()))
            });

            let addr: SocketAddr = match result {
                Ok(addr) => addr,
                Err(e) => {
                    warn!(pool = %pool.name, "name resolution failed: {e}");
                    let mut inner = pool.inner.lock().expect("pool mutex poisoned");
                    inner.pending_resolve_count -= 1;
                    return;
                }
            };

            let stream = match tokio::net::TcpStream::connect(addr).await {
                Ok(s) => s,
                Err(e) => {
                    warn!(pool = %pool.name, %addr, "connect failed: {e}");
                    let mut inner = pool.inner.lock().expect("pool mutex poisoned");
                    inner.pending_resolve_count -= 1;
                    return;
                }
            };

            let conn_id = pool.conn_id_source.fetch_add(1, Ordering::Relaxed);
            let conn = Connection::spawn(
                conn_id,
                pool.weak_self(),
                stream,
                pool.limits.writer,
                pool.framer_template.clone(),
                pool.registry.clone(),
                pool.receiver.clone(),
                pool.timers,
            );

            let mut inner = pool.inner.lock().expect("pool mutex poisoned");
            inner.pending_resolve_count -= 1;
            inner.connections.insert(conn_id, conn.clone());
            if inner.cancel_connection_id.is_none() {
                inner.cancel_connection_id = Some(conn_id);
            }
            drop(inner);
            if let Some(hook) = &pool.on_connection {
                hook(conn_id, conn.clone(), pool.pool_id);
            }
            conn.notify_work();
        });
    }

    /// Attaches an already-established connection (server-accepted or
    /// handed in by `Service::activate_connection`).
    pub fn register_connection(&self, conn_id: ConnectionId, conn: Arc<Connection>) {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        inner.connections.insert(conn_id, conn);
        if inner.cancel_connection_id.is_none() {
            inner.cancel_connection_id = Some(conn_id);
        }
    }

    pub fn active_connection_count(&self) -> usize {
        self.inner.lock().expect("pool mutex poisoned").active_connection_count()
    }

    /// The pool-side assignment policy. Returns at most one bundle; the
    /// connection calls this again whenever it goes idle.
    pub fn check_pool_for_new_messages(&self, conn_id: ConnectionId) -> Vec<(usize, MessageBundle)> {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");

        let Some(&front_idx) = inner.order.front() else { return Vec::new() };
        let front_is_async = inner.slots[front_idx].is_async();

        if front_is_async || inner.synchronous_connection_id == Some(conn_id) {
            return self.hand_off(&mut inner, front_idx, conn_id).map(|b| (front_idx, b)).into_iter().collect();
        }

        if inner.synchronous_connection_id.is_none() {
            inner.synchronous_connection_id = Some(conn_id);
            return self.hand_off(&mut inner, front_idx, conn_id).map(|b| (front_idx, b)).into_iter().collect();
        }

        // `front` is synchronous and belongs to a different connection:
        // find the first asynchronous entry anywhere in `order`.
        if let Some(pos) = inner.order.iter().position(|&idx| inner.slots[idx].is_async()) {
            let idx = inner.order.remove(pos).expect("position was just found");
            return self.hand_off(&mut inner, idx, conn_id).map(|b| (idx, b)).into_iter().collect();
        }

        let _ = &mut inner; // touched above only through the guard's DerefMut

        inner.conn_waitingq.push_back(conn_id);
        Vec::new()
    }

    /// Reports the write-id [`crate::writer::MessageWriter::enqueue`]
    /// assigned a message the pool handed off, so a later `cancel_message`
    /// can reach it on the connection's writer.
    /// A no-op if the slot was already canceled or recycled in the
    /// meantime; if it's still pending cancellation, delivers the
    /// cancel right away instead of dropping it.
    pub fn record_writer_id(&self, pool_idx: usize, conn_id: ConnectionId, writer_id: u32) {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        let Some(slot) = inner.slots.get(pool_idx) else { return };
        if slot.bundle.is_some() || slot.conn_id != Some(conn_id) {
            return;
        }
        if slot.canceled {
            if let Some(conn) = inner.connections.get(&conn_id) {
                conn.cancel_in_flight(writer_id);
            }
            return;
        }
        inner.slots[pool_idx].writer_id = Some(writer_id);
    }

    fn hand_off(&self, inner: &mut PoolInner, idx: usize, conn_id: ConnectionId) -> Option<MessageBundle> {
        // `idx` may still be `order`'s front (the async/sync-owner cases)
        // or already removed (the rotate-and-extract case); pop it from
        // `order` if it's still there.
        if inner.order.front() == Some(&idx) {
            inner.order.pop_front();
        } else {
            inner.order.retain(|&i| i != idx);
        }

        let bundle = inner.slots[idx].bundle.take()?;
        if inner.slots[idx].cancelable && !inner.slots[idx].canceled {
            inner.slots[idx].conn_id = Some(conn_id);
            // Slot lives on (for cancellation lookups) until the
            // connection reports completion; nothing further to do here.
        } else {
            inner.recycle(idx);
        }
        Some(bundle)
    }

    /// Cancellation. Idempotent.
    pub fn cancel_message(&self, msg_id: MessageId) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        let idx = msg_id.index as usize;
        let Some(slot) = inner.slots.get_mut(idx) else {
            return Err(RuntimeError::PoolInexistent(self.name.clone()));
        };
        if slot.unique != msg_id.unique {
            return Ok(()); // stale id: already completed/recycled, idempotent no-op.
        }
        if slot.canceled {
            return Ok(());
        }
        slot.canceled = true;

        if let Some(conn_id) = slot.conn_id {
            // `writer_id` may still be unset if the message hasn't reached
            // the connection's writer yet (still in its pending queue, or
            // the race between hand-off and `record_writer_id`); in that
            // case the cancel is recorded and delivered once it lands.
            if let Some(writer_id) = slot.writer_id
                && let Some(conn) = inner.connections.get(&conn_id)
            {
                conn.cancel_in_flight(writer_id);
            }
            return Ok(());
        }

        // Still pool-resident: nothing was ever put on the wire, so it can
        // be completed locally instead of round-tripping through the
        // guaranteed-delivery cancel channel.
        if let Some(bundle) = slot.bundle.take() {
            inner.order.retain(|&i| i != idx);
            inner.recycle(idx);
            drop(inner);
            bundle.complete(CompletionError::Canceled);
        }
        Ok(())
    }

    /// Connection death rescue.
    pub fn on_connection_close(self: &Arc<Self>, conn_id: ConnectionId, unsent: Vec<MessageBundle>) {
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        inner.connections.remove(&conn_id);
        if inner.synchronous_connection_id == Some(conn_id) {
            inner.synchronous_connection_id = None;
        }
        if inner.cancel_connection_id == Some(conn_id) {
            inner.cancel_connection_id = inner.connections.keys().next().copied();
            inner.msg_cancel_connection_stopping = false;
        }
        inner.conn_waitingq.retain(|&id| id != conn_id);

        // Drop any cancelable slots this connection was carrying; they
        // are about to be rescued back via `unsent` instead.
        for slot in inner.slots.iter_mut() {
            if slot.conn_id == Some(conn_id) {
                slot.conn_id = None;
            }
        }

        if inner.connections.is_empty() {
            inner.is_stopping = false;
            let mut never_attempted = Vec::new();
            while let Some(idx) = inner.order.pop_front() {
                if let Some(bundle) = inner.slots[idx].bundle.take() {
                    never_attempted.push(bundle);
                }
                inner.recycle(idx);
            }

            let mut any_retried = false;
            for bundle in never_attempted.into_iter().chain(unsent).rev() {
                if rescue_bundle(&mut inner, bundle) {
                    any_retried = true;
                }
            }
            drop(inner);
            if any_retried {
                self.maybe_provision_connection();
            }
            return;
        }
        drop(inner);

        // Reinsert rescued bundles at the front of `order`, preserving
        // their relative order.
        let mut inner = self.inner.lock().expect("pool mutex poisoned");
        for bundle in unsent.into_iter().rev() {
            rescue_bundle(&mut inner, bundle);
        }
    }

    /// Connection want-stop. If the stopping connection is the pool's
    /// cancel-delivery channel and other connections remain, the handoff
    /// to a replacement is delayed by
    /// `msg_cancel_connection_wait` so in-flight cancellations can still
    /// reach the peer through it; with no other connection left, the pool
    /// goes straight to `is_stopping`.
    pub fn on_connection_want_stop(self: &Arc<Self>, conn_id: ConnectionId) {
        let replacement = {
            let mut inner = self.inner.lock().expect("pool mutex poisoned");
            if inner.cancel_connection_id != Some(conn_id) {
                return;
            }
            let replacement = inner.connections.keys().find(|&&id| id != conn_id).copied();
            if replacement.is_none() {
                inner.is_stopping = true;
                return;
            }
            inner.msg_cancel_connection_stopping = true;
            replacement
        };

        let pool = self.weak_self();
        let wait = self.limits.msg_cancel_connection_wait;
        tokio::spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(pool) = pool.upgrade() else { return };
            let mut inner = pool.inner.lock().expect("pool mutex poisoned");
            if inner.msg_cancel_connection_stopping {
                inner.cancel_connection_id = replacement;
                inner.msg_cancel_connection_stopping = false;
            }
        });
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool").field("name", &self.name).field("pool_id", &self.pool_id).finish()
    }
}
