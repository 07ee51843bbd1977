// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Scenario 4 (cancel in flight), at reduced scale: canceling a message
//! while it is still being streamed completes it with `Canceled` and the
//! peer never sees the full payload.

use std::{sync::{Arc, Mutex}, time::Duration};

use ipcmux_rs::{
    error::CompletionError,
    message::{Message, MessageBundle, MessageFlags},
};
use tokio::time::{sleep, timeout};

use crate::integration_tests::common::{PeerEvent, pool_with_peer, small_limits, spawn_fake_peer};

#[tokio::test]
async fn canceling_an_in_flight_message_stops_delivery() {
    let mut peer = spawn_fake_peer().await;
    let limits = small_limits(4, 16, 16, 8);
    let (pool, _spawned) = pool_with_peer("peer", peer.addr, limits);

    const PAYLOAD: usize = 5_000_000;
    let outcome: Arc<Mutex<Option<CompletionError>>> = Arc::new(Mutex::new(None));
    let outcome2 = outcome.clone();

    let msg = Message::new(Box::new(vec![0x7Eu8; PAYLOAD]), 1, MessageFlags::ASYNCHRONOUS);
    let bundle = MessageBundle::new(
        msg,
        Some(Box::new(move |_value, err| {
            *outcome2.lock().unwrap() = Some(err);
        })),
    );
    let msg_id = pool.do_send(bundle, true);

    sleep(Duration::from_micros(200)).await;
    pool.cancel_message(msg_id).expect("cancel_message");

    let mut waited = Duration::ZERO;
    while outcome.lock().unwrap().is_none() && waited < Duration::from_secs(5) {
        sleep(Duration::from_millis(10)).await;
        waited += Duration::from_millis(10);
    }
    assert_eq!(*outcome.lock().unwrap(), Some(CompletionError::Canceled), "sender completion must be Canceled");

    let mut total_received = 0usize;
    let mut saw_full_message = false;
    loop {
        match timeout(Duration::from_millis(200), peer.events.recv()).await {
            Ok(Some(PeerEvent::RawBytes { len, .. })) => total_received += len,
            Ok(Some(PeerEvent::Message { len, .. })) if len == PAYLOAD => saw_full_message = true,
            Ok(Some(_)) => {}
            _ => break,
        }
    }

    assert!(!saw_full_message, "peer must never reassemble the canceled message in full");
    assert!(total_received < PAYLOAD, "peer should only have seen a prefix of the payload, got {total_received} bytes");
}
