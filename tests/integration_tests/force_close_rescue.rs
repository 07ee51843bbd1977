// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Scenario 3 (force-close rescue), at reduced scale: kill a connection
//! mid-transfer and check every message's completion still fires exactly
//! once, with `ConnectionClosed` for anything not yet fully sent.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use ipcmux_rs::{
    error::CompletionError,
    message::{Message, MessageBundle, MessageFlags},
};
use tokio::{net::TcpListener, time::sleep};

use crate::integration_tests::common::{pool_with_peer, small_limits};

#[tokio::test]
async fn force_close_rescues_every_unsent_message_exactly_once() {
    // A peer that accepts but never reads, so the OS socket buffer fills
    // and the writer is guaranteed to still be mid-flight when killed.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let (_stream, _) = listener.accept().await.expect("accept");
        std::future::pending::<()>().await;
    });

    let limits = small_limits(2, 8, 8, 4);
    let (pool, mut spawned) = pool_with_peer("peer", addr, limits);

    let results: Arc<Mutex<Vec<CompletionError>>> = Arc::new(Mutex::new(Vec::new()));
    let sizes = [500_000usize; 7];
    for size in sizes {
        let results = results.clone();
        let msg = Message::new(Box::new(vec![0x11u8; size]), 1, MessageFlags::ASYNCHRONOUS);
        let bundle = MessageBundle::new(
            msg,
            Some(Box::new(move |_value, err| {
                results.lock().unwrap().push(err);
            })),
        );
        pool.do_send(bundle, false);
    }

    let (_conn_id, conn) = tokio::time::timeout(Duration::from_secs(2), spawned.recv())
        .await
        .expect("connection spawned in time")
        .expect("channel open");

    sleep(Duration::from_millis(50)).await;
    conn.kill();

    let mut waited = Duration::ZERO;
    while results.lock().unwrap().len() < sizes.len() && waited < Duration::from_secs(5) {
        sleep(Duration::from_millis(20)).await;
        waited += Duration::from_millis(20);
    }

    let results = results.lock().unwrap();
    assert_eq!(results.len(), sizes.len(), "every message must complete exactly once: {results:?}");
    assert!(
        results.iter().all(|e| matches!(e, CompletionError::NoError | CompletionError::ConnectionClosed)),
        "unexpected completion error: {results:?}"
    );
    assert!(
        results.iter().any(|e| *e == CompletionError::ConnectionClosed),
        "expected at least one message to be rescued as ConnectionClosed: {results:?}"
    );
}
