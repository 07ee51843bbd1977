// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Scenario 5 (queue full), at reduced scale: once both the live write
//! queue and the pending queue are saturated, admission fails closed with
//! `QueueFull` rather than growing without bound, while everything
//! admitted earlier is unaffected.

use std::sync::{Arc, Mutex};

use ipcmux_rs::{
    error::CompletionError,
    message::{Message, MessageBundle, MessageFlags},
    writer::{MessageWriter, WriterLimits},
};

fn bundle(size: usize, result: Arc<Mutex<Option<CompletionError>>>) -> MessageBundle {
    let msg = Message::new(Box::new(vec![0u8; size]), 1, MessageFlags::ASYNCHRONOUS);
    MessageBundle::new(
        msg,
        Some(Box::new(move |_value, err| {
            *result.lock().unwrap() = Some(err);
        })),
    )
}

#[test]
fn admission_fails_closed_once_both_queues_are_full() {
    let limits = WriterLimits { max_multiplex: 1, max_waiting: 2, max_pending: 1, max_continuous_packet_count: 4 };
    let mut writer = MessageWriter::new(limits);

    let first_result = Arc::new(Mutex::new(None));
    let second_result = Arc::new(Mutex::new(None));
    let third_result = Arc::new(Mutex::new(None));

    // Fits directly into the live write queue.
    let first_id = writer.enqueue(bundle(16, first_result.clone()));
    assert!(first_id.is_some(), "first message should be admitted to the write queue");

    // Write queue is full (max_multiplex == 1); overflows into pending.
    let second_id = writer.enqueue(bundle(16, second_result.clone()));
    assert!(second_id.is_none(), "second message should overflow into the pending queue, not get a write-id yet");
    assert_eq!(writer.pending_queue_len(), 1);

    // Both queues are now full; this one is rejected outright.
    writer.enqueue(bundle(16, third_result.clone()));
    assert_eq!(
        *third_result.lock().unwrap(),
        Some(CompletionError::QueueFull),
        "third message must be completed with QueueFull, not silently queued"
    );

    // The first two are untouched by the rejection.
    assert!(first_result.lock().unwrap().is_none());
    assert!(second_result.lock().unwrap().is_none());
    assert_eq!(writer.write_queue_len(), 1);
    assert_eq!(writer.pending_queue_len(), 1);
}
