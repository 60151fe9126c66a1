// SPDX-License-Identifier: BSD-3-Clause
// Copyright 2025. Triad National Security, LLC.

#![allow(dead_code)]

use std::sync::Once;
use std::time::{Duration, Instant};

use netring::Ring;

pub fn init() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Polls the ring until `done` returns true, failing the test after
/// `timeout`.
pub fn drive(ring: &mut Ring, timeout: Duration, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !done() {
        assert!(Instant::now() < deadline, "test timed out");
        ring.poll_completion_queues().expect("poll failed");
    }
}
