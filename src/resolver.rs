// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! The name→address resolver trait boundary: `resolve(name, cbk(addr_vec))`.
//! Resolution itself is out of scope for the core; a static-map
//! implementation is provided for tests.

use std::{net::SocketAddr, pin::Pin};

use crate::error::RuntimeError;

pub type ResolveFuture<'a> =
    Pin<Box<dyn Future<Output = Result<Vec<SocketAddr>, RuntimeError>> + Send + 'a>>;

/// Resolves a recipient name to one or more candidate addresses.
pub trait Resolver: Send + Sync {
    fn resolve(&self, name: &str) -> ResolveFuture<'_>;
}

/// A resolver backed by a fixed name→address table, used in tests and by
/// callers who already know their peers' addresses.
pub struct StaticResolver {
    table: dashmap::DashMap<String, Vec<SocketAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self { table: dashmap::DashMap::new() }
    }

    pub fn insert(&self, name: impl Into<String>, addrs: Vec<SocketAddr>) {
        self.table.insert(name.into(), addrs);
    }
}

impl Default for StaticResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, name: &str) -> ResolveFuture<'_> {
        let found = self.table.get(name).map(|v| v.clone());
        let name = name.to_string();
        Box::pin(async move {
            found.ok_or_else(|| RuntimeError::PoolInexistent(name))
        })
    }
}
