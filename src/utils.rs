// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::sync::atomic::{AtomicU64, Ordering};

use rand::RngExt;

use crate::message::RequestId;

/// Process-wide request id counter, salted with a random high bit on
/// startup so ids from distinct runs of the same process name never
/// collide on the wire (request ids are not meant to be globally unique,
/// only unique per sender for the lifetime of a connection).
static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(0);

pub fn fresh_request_id() -> RequestId {
    static SALT: std::sync::OnceLock<u64> = std::sync::OnceLock::new();
    let salt = *SALT.get_or_init(|| rand::rng().random::<u64>() & 0xFFFF_0000_0000_0000);
    salt | NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed)
}
