//! Countdown barrier that releases a payload to its last arrival.

use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts arrivals up to a fixed target.
///
/// The arrival that reaches the target receives the payload; every other
/// arrival, including any past the target, receives `None`. The target must be
/// at least one.
#[derive(Debug)]
pub struct JoinBarrier<T> {
    expected: usize,
    arrived: AtomicUsize,
    payload: Mutex<Option<T>>,
}

impl<T> JoinBarrier<T> {
    pub fn new(expected: usize, payload: T) -> Self {
        debug_assert!(expected > 0, "barrier needs at least one arrival");
        Self {
            expected,
            arrived: AtomicUsize::new(0),
            payload: Mutex::new(Some(payload)),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.arrived.load(Ordering::Acquire) >= self.expected
    }

    /// Record one arrival.
    pub fn arrive(&self) -> Option<T> {
        let previous = self.arrived.fetch_add(1, Ordering::AcqRel);
        if previous + 1 != self.expected {
            return None;
        }

        self.payload
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}
