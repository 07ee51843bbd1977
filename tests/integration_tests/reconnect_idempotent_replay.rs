// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Scenario 6 (reconnect + idempotent replay), at reduced scale: kill the
//! only connection in a pool while two messages are mid-transfer. The
//! idempotent one gets exactly one further delivery attempt on a
//! replacement connection; the non-idempotent one completes
//! `ConnectionClosed` instead of being retried.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use ipcmux_rs::{
    error::CompletionError,
    message::{Message, MessageBundle, MessageFlags},
    resolver::StaticResolver,
};
use tokio::{net::TcpListener, time::{sleep, timeout}};

use crate::integration_tests::common::{PeerEvent, pool_with_resolver, small_limits, spawn_fake_peer};

#[tokio::test]
async fn idempotent_message_is_retried_after_the_only_connection_dies() {
    // The first connection dials a peer that accepts but never reads, so
    // both messages are guaranteed to still be mid-transfer when killed.
    let black_hole = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let black_hole_addr = black_hole.local_addr().expect("addr");
    tokio::spawn(async move {
        let (_stream, _) = black_hole.accept().await.expect("accept");
        std::future::pending::<()>().await;
    });

    let resolver = Arc::new(StaticResolver::new());
    resolver.insert("peer", vec![black_hole_addr]);

    let limits = small_limits(4, 16, 16, 2);
    let (pool, mut spawned) = pool_with_resolver("peer", resolver.clone(), limits);

    const PAYLOAD: usize = 2_000_000;
    let idempotent_outcome: Arc<Mutex<Option<CompletionError>>> = Arc::new(Mutex::new(None));
    let plain_outcome: Arc<Mutex<Option<CompletionError>>> = Arc::new(Mutex::new(None));

    let io = idempotent_outcome.clone();
    let idempotent_msg =
        Message::new(Box::new(vec![0xA5u8; PAYLOAD]), 1, MessageFlags::IDEMPOTENT | MessageFlags::ASYNCHRONOUS);
    pool.do_send(
        MessageBundle::new(idempotent_msg, Some(Box::new(move |_v, err| *io.lock().unwrap() = Some(err)))),
        false,
    );

    let po = plain_outcome.clone();
    let plain_msg = Message::new(Box::new(vec![0x5Au8; PAYLOAD]), 1, MessageFlags::ASYNCHRONOUS);
    pool.do_send(MessageBundle::new(plain_msg, Some(Box::new(move |_v, err| *po.lock().unwrap() = Some(err)))), false);

    let (_first_id, first_conn) = timeout(Duration::from_secs(2), spawned.recv())
        .await
        .expect("connection spawns in time")
        .expect("hook channel open");

    sleep(Duration::from_millis(50)).await;

    // Retarget the pool's resolver before killing the connection, so the
    // replacement connection lands on a peer that actually reads.
    let mut peer = spawn_fake_peer().await;
    resolver.insert("peer", vec![peer.addr]);
    first_conn.kill();

    let (_second_id, _second_conn) = timeout(Duration::from_secs(2), spawned.recv())
        .await
        .expect("replacement connection spawns in time")
        .expect("hook channel open");

    let mut waited = Duration::ZERO;
    while (idempotent_outcome.lock().unwrap().is_none() || plain_outcome.lock().unwrap().is_none())
        && waited < Duration::from_secs(10)
    {
        sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }

    assert_eq!(
        *plain_outcome.lock().unwrap(),
        Some(CompletionError::ConnectionClosed),
        "non-idempotent message must not be retried"
    );

    let mut saw_full_idempotent_payload = false;
    loop {
        match timeout(Duration::from_millis(500), peer.events.recv()).await {
            Ok(Some(PeerEvent::Message { len, .. })) if len == PAYLOAD => {
                saw_full_idempotent_payload = true;
                break;
            }
            Ok(Some(_)) => {}
            _ => break,
        }
    }
    assert!(saw_full_idempotent_payload, "the idempotent message must reach the peer in full on the replacement connection");
    assert_eq!(
        *idempotent_outcome.lock().unwrap(),
        Some(CompletionError::NoError),
        "idempotent message must complete successfully after retry"
    );
}
