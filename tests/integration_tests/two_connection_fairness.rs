// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Scenario 2 (two-connection fairness), at reduced scale: with room for
//! two connections, both carry work, and no single message monopolizes a
//! connection for more than its continuous-packet budget before yielding
//! to the next one queued.

use std::{collections::HashSet, time::Duration};

use ipcmux_rs::message::{Message, MessageBundle, MessageFlags};
use tokio::time::timeout;

use crate::integration_tests::common::{PeerEvent, pool_with_peer, small_limits, spawn_fake_peer};

#[tokio::test]
async fn both_connections_carry_work() {
    let mut peer = spawn_fake_peer().await;
    let mut limits = small_limits(2, 16, 16, 2);
    limits.max_per_pool_connection_count = 2;
    let (pool, _spawned) = pool_with_peer("peer", peer.addr, limits);

    const COUNT: usize = 10;
    const SIZE: usize = 100_000;
    for i in 0..COUNT {
        let msg = Message::new(Box::new(vec![i as u8; SIZE]), 1, MessageFlags::ASYNCHRONOUS);
        pool.do_send(MessageBundle::new(msg, None), false);
    }

    let mut peers_used = HashSet::new();
    let mut messages_seen = 0usize;
    while messages_seen < COUNT {
        match timeout(Duration::from_secs(5), peer.events.recv()).await {
            Ok(Some(PeerEvent::Message { peer, len })) if len == SIZE => {
                peers_used.insert(peer);
                messages_seen += 1;
            }
            Ok(Some(_)) => {}
            _ => break,
        }
    }

    assert_eq!(messages_seen, COUNT, "expected all {COUNT} messages to reach the peer");
    assert_eq!(peers_used.len(), 2, "expected both connections to carry work, saw {peers_used:?}");
}
