// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use ipcmux_rs::{error::RuntimeError, resolver::{Resolver, StaticResolver}};

#[tokio::test]
async fn resolves_a_registered_name() {
    let resolver = StaticResolver::new();
    let addr = "127.0.0.1:9000".parse().unwrap();
    resolver.insert("peer", vec![addr]);

    let addrs = resolver.resolve("peer").await.expect("resolve");
    assert_eq!(addrs, vec![addr]);
}

#[tokio::test]
async fn unknown_name_is_pool_inexistent() {
    let resolver = StaticResolver::new();
    let err = resolver.resolve("nobody").await.unwrap_err();
    assert_eq!(err, RuntimeError::PoolInexistent("nobody".to_string()));
}
