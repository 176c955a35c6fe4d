// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Strictly increasing delivery timestamps.
//!
//! Fragments of a split record are grouped back together by exact timestamp
//! equality, so every split record needs a timestamp no other record in the
//! process can get. [`MonotonicClock::next`] hands out `max(now, last + 1)`.

use std::sync::atomic::{AtomicI64, Ordering};

/// Shared "last assigned timestamp" state. One instance is injected into
/// every shipper of a process.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: AtomicI64,
}

impl MonotonicClock {
    #[must_use]
    pub fn new() -> Self {
        MonotonicClock {
            last: AtomicI64::new(0),
        }
    }

    /// Current wall clock time in epoch milliseconds.
    #[must_use]
    pub fn now() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    /// Next unique timestamp, never lower than the wall clock.
    pub fn next(&self) -> i64 {
        self.next_at(Self::now())
    }

    /// Next unique timestamp given the wall clock reading `now`.
    pub fn next_at(&self, now: i64) -> i64 {
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let candidate = now.max(last.saturating_add(1));
            match self.last.compare_exchange_weak(
                last,
                candidate,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return candidate,
                Err(actual) => last = actual,
            }
        }
    }

    /// Last timestamp handed out, zero if none.
    #[must_use]
    pub fn last(&self) -> i64 {
        self.last.load(Ordering::Acquire)
    }

    pub fn reset(&self) {
        self.last.store(0, Ordering::Release);
    }
}
