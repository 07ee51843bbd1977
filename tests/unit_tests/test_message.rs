// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use ipcmux_rs::{
    error::CompletionError,
    message::{Message, MessageBundle, MessageFlags, MessageId},
};

#[test]
fn flags_default_to_asynchronous() {
    assert!(MessageFlags::default().is_asynchronous());
    assert!(!MessageFlags::default().is_synchronous());
}

#[test]
fn synchronous_and_asynchronous_are_exclusive_in_practice() {
    let sync = MessageFlags::SYNCHRONOUS;
    assert!(sync.is_synchronous());
    assert!(!sync.is_asynchronous());
}

#[test]
fn terminal_message_is_recognized() {
    let msg = Message::terminal();
    assert!(msg.is_terminal());
    assert!(!Message::new(Box::new(()), 0, MessageFlags::ASYNCHRONOUS).is_terminal());
}

#[test]
fn message_id_invalid_is_not_valid() {
    assert!(!MessageId::INVALID.is_valid());
    assert_eq!(MessageId::default(), MessageId::INVALID);
}

#[test]
fn completion_fires_exactly_once_with_the_given_error() {
    let msg = Message::new(Box::new(7u8), 1, MessageFlags::ASYNCHRONOUS);
    let seen = std::sync::Arc::new(std::sync::Mutex::new(None));
    let seen2 = seen.clone();
    let bundle = MessageBundle::new(
        msg,
        Some(Box::new(move |value, err| {
            *seen2.lock().unwrap() = Some((*value.downcast::<u8>().unwrap(), err));
        })),
    );
    bundle.complete(CompletionError::Canceled);
    assert_eq!(*seen.lock().unwrap(), Some((7u8, CompletionError::Canceled)));
}

#[test]
fn completion_with_no_callback_is_a_silent_no_op() {
    let msg = Message::new(Box::new(()), 1, MessageFlags::ASYNCHRONOUS);
    MessageBundle::new(msg, None).complete(CompletionError::NoError);
}
