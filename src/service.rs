// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The `Service` façade: the single entry point callers use to
//! send messages, activate connections (accepted or outgoing), and manage
//! pool/connection lifecycle. Owns the pool directory and binds together
//! the registry, resolver and receiver collaborators every pool and
//! connection shares.
//!
//! One level up from [`crate::pool::ConnectionPool`]: where a pool tracks
//! one recipient's connections, `Service` tracks every pool under one
//! name-keyed directory, with a `OnceLock`-held weak self so spawned work
//! (the accept loop, pool connection-spawn hooks) can call back in.

use std::sync::{
    Arc, Mutex, OnceLock, Weak,
    atomic::{AtomicU64, Ordering},
};

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    cfg::config::Config,
    connection::{Connection, ConnectionId, ConnectionTimers, Receiver},
    error::{CompletionError, RuntimeError},
    framer::{DEFAULT_MAX_PACKET, PacketFramer},
    message::{Message, MessageBundle, MessageId},
    pool::{ConnectionPool, PoolLimits},
    registry::TypeRegistry,
    resolver::Resolver,
};

struct ConnEntry {
    conn: Arc<Connection>,
    pool_id: Option<u64>,
}

/// The pool directory: a slot table of named pools, recycled via a free
/// list the same way [`crate::pool::ConnectionPool`] recycles its own
/// message slots and [`crate::writer::MessageWriter`] recycles write-ids.
/// The service mutex protects the pool directory and pool-id allocation.
#[derive(Default)]
struct Directory {
    pools: Vec<Option<Arc<ConnectionPool>>>,
    free: Vec<usize>,
    by_name: std::collections::HashMap<String, usize>,
}

impl Directory {
    fn insert(&mut self, name: String, pool: Arc<ConnectionPool>) -> u64 {
        let idx = if let Some(idx) = self.free.pop() {
            self.pools[idx] = Some(pool);
            idx
        } else {
            self.pools.push(Some(pool));
            self.pools.len() - 1
        };
        self.by_name.insert(name, idx);
        idx as u64
    }

    fn by_name(&self, name: &str) -> Option<Arc<ConnectionPool>> {
        let idx = *self.by_name.get(name)?;
        self.pools[idx].clone()
    }

    fn by_id(&self, id: u64) -> Option<Arc<ConnectionPool>> {
        self.pools.get(id as usize).and_then(|p| p.clone())
    }

    fn remove_empty_pools(&mut self) {
        let stale: Vec<(String, usize)> = self
            .by_name
            .iter()
            .filter(|&(_, &idx)| self.pools[idx].as_ref().is_some_and(|p| p.is_empty()))
            .map(|(name, &idx)| (name.clone(), idx))
            .collect();
        for (name, idx) in stale {
            self.by_name.remove(&name);
            self.pools[idx] = None;
            self.free.push(idx);
        }
    }
}

/// Routes `send` calls to pools, spawns connections up to pool limits, and
/// coordinates pool and connection lifecycle.
pub struct Service {
    directory: Mutex<Directory>,
    connections: DashMap<ConnectionId, ConnEntry>,
    next_conn_id: Arc<AtomicU64>,
    registry: Arc<dyn TypeRegistry>,
    resolver: Arc<dyn Resolver>,
    receiver: Arc<dyn Receiver>,
    timers: ConnectionTimers,
    config: Mutex<Config>,
    listener_cancel: Mutex<Option<CancellationToken>>,
    self_weak: OnceLock<Weak<Service>>,
}

impl Service {
    pub fn new(
        config: Config,
        registry: Arc<dyn TypeRegistry>,
        resolver: Arc<dyn Resolver>,
        receiver: Arc<dyn Receiver>,
    ) -> Arc<Self> {
        let service = Arc::new(Self {
            directory: Mutex::new(Directory::default()),
            connections: DashMap::new(),
            next_conn_id: Arc::new(AtomicU64::new(1)),
            registry,
            resolver,
            receiver,
            timers: ConnectionTimers::default(),
            config: Mutex::new(config),
            listener_cancel: Mutex::new(None),
            self_weak: OnceLock::new(),
        });
        let _ = service.self_weak.set(Arc::downgrade(&service));
        service
    }

    fn weak_self(&self) -> Weak<Service> {
        self.self_weak.get().cloned().unwrap_or_default()
    }

    fn is_server_only(&self) -> bool {
        self.config.lock().expect("config mutex poisoned").listener.server_only
    }

    /// Stops the current listener (if any), validates `config`, installs
    /// it, and optionally opens a new listener: stop then start the
    /// service.
    pub async fn reconfigure(self: &Arc<Self>, mut config: Config) -> anyhow::Result<()> {
        config.validate_and_normalize()?;

        if let Some(cancel) = self.listener_cancel.lock().expect("listener mutex poisoned").take() {
            cancel.cancel();
        }

        let should_listen = !config.listener.listen_address_str.is_empty();
        let addr = config.listener.listen_address_str.clone();
        *self.config.lock().expect("config mutex poisoned") = config;

        if should_listen {
            self.start_listener(&addr).await?;
        }
        Ok(())
    }

    async fn start_listener(self: &Arc<Self>, addr: &str) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        let cancel = CancellationToken::new();
        *self.listener_cancel.lock().expect("listener mutex poisoned") = Some(cancel.clone());

        let service = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, peer)) => {
                                info!(%peer, "accepted connection");
                                let service = service.clone();
                                tokio::spawn(async move {
                                    if let Err(e) = service.activate_accepted(stream, None, false).await {
                                        warn!("failed to activate accepted connection: {e}");
                                    }
                                });
                            }
                            Err(e) => {
                                warn!("accept failed: {e}");
                            }
                        }
                    }
                }
            }
        });
        Ok(())
    }

    fn mint_conn_id(&self) -> ConnectionId {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Looks up a pool by recipient name, creating it (and wiring it to
    /// this service's shared id source and connection-spawn hook) if it
    /// does not exist yet.
    fn pool_or_create(self: &Arc<Self>, name: &str) -> Arc<ConnectionPool> {
        let mut dir = self.directory.lock().expect("directory mutex poisoned");
        if let Some(pool) = dir.by_name(name) {
            return pool;
        }

        let pool_id = dir.pools.len() as u64;
        let cfg = self.config.lock().expect("config mutex poisoned").clone();
        let limits: PoolLimits = (&cfg).into();
        let hook_service = self.weak_self();
        let hook: crate::pool::ConnSpawnHook = Arc::new(move |conn_id, conn, pool_id| {
            if let Some(service) = hook_service.upgrade() {
                service.connections.insert(conn_id, ConnEntry { conn, pool_id: Some(pool_id) });
            }
        });

        let pool = ConnectionPool::new(
            name,
            pool_id,
            limits,
            PacketFramer::new(DEFAULT_MAX_PACKET),
            self.registry.clone(),
            self.resolver.clone(),
            self.receiver.clone(),
            self.timers,
            self.next_conn_id.clone(),
            Some(hook),
        );
        let assigned_id = dir.insert(name.to_string(), pool.clone());
        debug_assert_eq!(assigned_id, pool_id);
        pool
    }

    fn pool_by_name(&self, name: &str) -> Option<Arc<ConnectionPool>> {
        self.directory.lock().expect("directory mutex poisoned").by_name(name)
    }

    fn pool_by_id(&self, id: u64) -> Option<Arc<ConnectionPool>> {
        self.directory.lock().expect("directory mutex poisoned").by_id(id)
    }

    /// Routes a `send` to the named recipient's pool, creating the pool if
    /// it is unknown — unless the service is server-only, in which case
    /// only pools that already exist (from an accepted connection) can
    /// receive outgoing sends.
    pub fn send(
        self: &Arc<Self>,
        recipient: &str,
        message: Message,
        on_complete: Option<crate::message::CompletionFn>,
    ) -> Result<MessageId, RuntimeError> {
        let pool = if self.is_server_only() {
            self.pool_by_name(recipient).ok_or(RuntimeError::ServerOnly)?
        } else {
            self.pool_or_create(recipient)
        };
        Ok(pool.do_send(MessageBundle::new(message, on_complete), false))
    }

    /// Send to an already-known pool id, bypassing name lookup.
    pub fn send_to_pool(
        &self,
        pool_id: u64,
        message: Message,
        on_complete: Option<crate::message::CompletionFn>,
    ) -> Result<MessageId, RuntimeError> {
        let pool = self.pool_by_id(pool_id).ok_or(RuntimeError::PoolInexistent(pool_id.to_string()))?;
        Ok(pool.do_send(MessageBundle::new(message, on_complete), false))
    }

    /// Send directly to a specific connection, bypassing pool admission
    /// and synchronous-ordering scheduling entirely.
    pub fn send_to_connection(
        &self,
        conn_id: ConnectionId,
        message: Message,
        on_complete: Option<crate::message::CompletionFn>,
    ) -> Result<(), RuntimeError> {
        let entry = self.connections.get(&conn_id).ok_or(RuntimeError::ConnectionInexistent(conn_id))?;
        entry.conn.enqueue(MessageBundle::new(message, on_complete));
        Ok(())
    }

    pub fn cancel_message(&self, recipient: &str, msg_id: MessageId) -> Result<(), RuntimeError> {
        let pool = self.pool_by_name(recipient).ok_or_else(|| RuntimeError::PoolInexistent(recipient.to_string()))?;
        pool.cancel_message(msg_id)
    }

    pub fn delayed_close(&self, conn_id: ConnectionId) -> Result<(), RuntimeError> {
        let entry = self.connections.get(&conn_id).ok_or(RuntimeError::ConnectionInexistent(conn_id))?;
        entry.conn.request_close();
        Ok(())
    }

    pub fn forced_close(&self, conn_id: ConnectionId) -> Result<(), RuntimeError> {
        let entry = self.connections.get(&conn_id).ok_or(RuntimeError::ConnectionInexistent(conn_id))?;
        entry.conn.kill();
        Ok(())
    }

    /// A pure server-side accepted connection with no pool, or one that
    /// should attach to (or create) a named pool. `init_msg` is sent first if given,
    /// ahead of the connection being handed to the pool's scheduler.
    pub async fn activate_accepted(
        self: &Arc<Self>,
        stream: TcpStream,
        recipient_name: Option<&str>,
        may_quit: bool,
    ) -> Result<ConnectionId, RuntimeError> {
        self.activate(stream, recipient_name, None, may_quit, false).await
    }

    /// An outgoing connection belonging to an existing pool. The pool must
    /// already exist.
    pub async fn activate_outgoing(
        self: &Arc<Self>,
        stream: TcpStream,
        recipient_name: &str,
        init_msg: Option<Message>,
        may_quit: bool,
    ) -> Result<ConnectionId, RuntimeError> {
        self.activate(stream, Some(recipient_name), init_msg, may_quit, true).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn activate(
        self: &Arc<Self>,
        stream: TcpStream,
        recipient_name: Option<&str>,
        init_msg: Option<Message>,
        may_quit: bool,
        outgoing: bool,
    ) -> Result<ConnectionId, RuntimeError> {
        let conn_id = self.mint_conn_id();
        let cfg = self.config.lock().expect("config mutex poisoned").clone();

        let pool = match recipient_name {
            None => None,
            Some(name) if outgoing => Some(self.pool_by_name(name).ok_or_else(|| RuntimeError::PoolInexistent(name.to_string()))?),
            Some(name) => Some(self.pool_or_create(name)),
        };

        let conn = Connection::spawn(
            conn_id,
            pool.as_ref().map_or_else(Weak::new, |p| Arc::downgrade(p)),
            stream,
            (&cfg.writer).into(),
            PacketFramer::new(DEFAULT_MAX_PACKET),
            self.registry.clone(),
            self.receiver.clone(),
            self.timers,
        );
        self.connections.insert(conn_id, ConnEntry { conn: conn.clone(), pool_id: pool.as_ref().map(|p| p.pool_id) });

        if let Some(msg) = init_msg {
            conn.enqueue(MessageBundle::new(msg, None));
        }

        if let Some(pool) = &pool {
            pool.register_connection(conn_id, conn.clone());
            let over_limit = pool.active_connection_count() > cfg.pool.max_per_pool_connection_count;
            if over_limit && may_quit {
                conn.request_close();
            } else {
                conn.notify_work();
            }
        }

        Ok(conn_id)
    }

    /// Drops bookkeeping for a connection once it has fully stopped.
    /// Pools clean up their own membership via `on_connection_close`; this
    /// only removes the service-level id mapping.
    pub fn forget_connection(&self, conn_id: ConnectionId) {
        self.connections.remove(&conn_id);
        self.directory.lock().expect("directory mutex poisoned").remove_empty_pools();
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn pool_count(&self) -> usize {
        self.directory.lock().expect("directory mutex poisoned").by_name.len()
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("pools", &self.pool_count())
            .field("connections", &self.connection_count())
            .finish()
    }
}

/// Drops a message's completion with [`CompletionError::ConnectionClosed`]
/// when a connection's write loop has already exited by the time a
/// message reaches it — the race `Connection::enqueue` hits when a
/// `send_to_connection` target goes away concurrently with the send.
pub(crate) fn complete_closed(bundle: MessageBundle) {
    bundle.complete(CompletionError::ConnectionClosed);
}
