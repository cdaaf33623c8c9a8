// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Concurrency gate: caps the number of simultaneously relaying sessions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared admission counter. Cloning shares the same underlying counter —
/// every worker thread and the dispatcher hold a clone.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    count: Arc<AtomicUsize>,
    max: usize,
}

/// Returned by [`ConcurrencyGate::admit`] while the permit is held; dropping
/// it releases the slot. Mirrors the historic child-counter increment at
/// fork time and decrement in the `SIGCHLD` handler, without requiring the
/// caller to remember to call `release`.
#[must_use = "dropping this immediately releases the admission slot"]
pub struct Permit {
    count: Arc<AtomicUsize>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::AcqRel);
    }
}

impl ConcurrencyGate {
    pub fn new(max: usize) -> Self {
        Self {
            count: Arc::new(AtomicUsize::new(0)),
            max,
        }
    }

    /// Try to admit one more session. Admission is refused once the count
    /// strictly exceeds `max` — i.e. the `max`-th concurrent session is
    /// still admitted, matching the historic `>` (not `>=`) comparison.
    pub fn admit(&self) -> Option<Permit> {
        let previous = self.count.fetch_add(1, Ordering::AcqRel);
        if previous + 1 > self.max {
            self.count.fetch_sub(1, Ordering::AcqRel);
            return None;
        }
        Some(Permit {
            count: Arc::clone(&self.count),
        })
    }

    pub fn current(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_max() {
        let gate = ConcurrencyGate::new(2);
        let a = gate.admit().unwrap();
        let b = gate.admit().unwrap();
        assert!(gate.admit().is_none());
        drop(a);
        drop(b);
    }

    #[test]
    fn releasing_a_permit_frees_a_slot() {
        let gate = ConcurrencyGate::new(1);
        let a = gate.admit().unwrap();
        assert!(gate.admit().is_none());
        drop(a);
        assert!(gate.admit().is_some());
    }

    #[test]
    fn zero_max_admits_nothing() {
        let gate = ConcurrencyGate::new(0);
        assert!(gate.admit().is_none());
    }

    #[test]
    fn current_reflects_live_permits() {
        let gate = ConcurrencyGate::new(5);
        let _a = gate.admit().unwrap();
        let _b = gate.admit().unwrap();
        assert_eq!(gate.current(), 2);
    }
}
