// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Scenario 1 (synchronous ordering), at reduced scale: synchronous
//! messages must complete in send order relative to each other, while
//! smaller asynchronous messages interleave and finish first.

use std::time::Duration;

use ipcmux_rs::message::{Message, MessageBundle, MessageFlags};
use tokio::time::timeout;

use crate::integration_tests::common::{PeerEvent, pool_with_peer, small_limits, spawn_fake_peer};

#[tokio::test]
async fn synchronous_messages_complete_in_send_order() {
    let mut peer = spawn_fake_peer().await;
    let limits = small_limits(4, 16, 16, 2);
    let (pool, _spawned) = pool_with_peer("peer", peer.addr, limits);

    let sizes = [("sync_big", 60_000usize, true), ("sync_small", 30_000, true), ("async_a", 4_000, false), ("async_b", 2_000, false)];

    for (_name, size, is_sync) in sizes {
        let flags = if is_sync { MessageFlags::SYNCHRONOUS } else { MessageFlags::ASYNCHRONOUS };
        let msg = Message::new(Box::new(vec![0xABu8; size]), 1, flags);
        pool.do_send(MessageBundle::new(msg, None), false);
    }

    let mut order = Vec::new();
    while order.len() < sizes.len() {
        match timeout(Duration::from_secs(5), peer.events.recv()).await {
            Ok(Some(PeerEvent::Message { len, .. })) => order.push(len),
            Ok(Some(_)) => {}
            _ => break,
        }
    }

    assert_eq!(order.len(), sizes.len(), "expected all four messages to reach the peer, got {order:?}");

    let pos_of = |len: usize| order.iter().position(|&l| l == len).expect("size present");
    assert!(pos_of(60_000) < pos_of(30_000), "sync_big must complete before sync_small: {order:?}");
    assert!(pos_of(4_000) < pos_of(60_000), "async_a should finish well before the large sync message: {order:?}");
    assert!(pos_of(2_000) < pos_of(60_000), "async_b should finish well before the large sync message: {order:?}");
}
