// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use ipcmux_rs::registry::{
    RunOutcome, TypeRegistry,
    test_support::{BYTES_TYPE_INDEX, BytesRegistry},
};

#[test]
fn type_index_of_recognizes_byte_vecs_only() {
    let registry = BytesRegistry;
    assert_eq!(registry.type_index_of(&vec![1u8, 2, 3] as &dyn std::any::Any), Some(BYTES_TYPE_INDEX));
    assert_eq!(registry.type_index_of(&42i32 as &dyn std::any::Any), None);
}

#[test]
fn unknown_type_index_is_rejected() {
    let registry = BytesRegistry;
    assert!(registry.new_deserializer(BYTES_TYPE_INDEX + 1).is_err());
}

#[test]
fn serializer_then_deserializer_round_trips_a_payload() {
    let registry = BytesRegistry;
    let payload = vec![9u8; 37];

    let mut ser = registry.new_serializer();
    ser.push(&payload, BYTES_TYPE_INDEX).expect("push");

    let mut buf = vec![0u8; 512];
    let outcome = ser.run(&mut buf).expect("run");
    assert!(outcome.is_done());
    let n = outcome.bytes();

    let mut de = registry.new_deserializer(BYTES_TYPE_INDEX).expect("deserializer");
    let outcome = de.run(&buf[..n]).expect("run");
    assert!(matches!(outcome, RunOutcome::Done(_)));

    let value = de.take().expect("value");
    let bytes = value.downcast_ref::<Vec<u8>>().expect("Vec<u8>");
    assert_eq!(*bytes, payload);
}

#[test]
fn serializer_reset_allows_reuse_for_a_different_payload() {
    let registry = BytesRegistry;
    let mut ser = registry.new_serializer();

    ser.push(&vec![1u8, 2], BYTES_TYPE_INDEX).expect("push");
    let mut buf = vec![0u8; 64];
    ser.run(&mut buf).expect("run");
    ser.reset();

    ser.push(&vec![3u8, 4, 5], BYTES_TYPE_INDEX).expect("push");
    let outcome = ser.run(&mut buf).expect("run");
    assert_eq!(outcome.bytes(), 4 + 3);
}
