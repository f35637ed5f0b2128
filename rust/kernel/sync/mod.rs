// SPDX-License-Identifier: GPL-2.0 OR MIT

//! Synchronisation primitives.
//!
//! This module contains the kernel APIs related to synchronisation that are used by the driver:
//! a plain [`Mutex`], a [`CondVar`] whose waits are interruptible by a pending task signal, and
//! the wound/wait mutex in [`ww_mutex`].

use core::time::Duration;

pub mod ww_mutex;

pub use parking_lot::{Mutex, MutexGuard};
pub use std::sync::{Arc, Weak};

/// Interval at which blocked waiters re-check for pending signals.
pub(crate) const SIGNAL_POLL: Duration = Duration::from_millis(5);

/// The result of a timed wait on a [`CondVar`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CondVarTimeoutResult {
    /// The timeout elapsed.
    Timeout,
    /// The thread was woken up (or woke up spuriously).
    Woken {
        /// Time left until the timeout.
        remaining: Duration,
    },
    /// A signal is pending on the current task.
    Signal,
}

/// A conditional variable.
///
/// Exposes the kernel's `struct wait_queue_head` interface: waiters release the lock while
/// sleeping, may wake up spuriously and must re-check their condition.
#[derive(Default)]
pub struct CondVar(parking_lot::Condvar);

impl CondVar {
    /// Constructs a new condvar.
    pub const fn new() -> CondVar {
        CondVar(parking_lot::Condvar::new())
    }

    /// Releases the lock and waits for a notification, interruptibly.
    ///
    /// Returns whether there is a signal pending.
    #[must_use = "wait returns if a signal is pending, so the caller must check the return value"]
    pub fn wait<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>) -> bool {
        self.0.wait_for(guard, SIGNAL_POLL);
        crate::task::signal_pending()
    }

    /// Releases the lock and waits for a notification, uninterruptibly.
    pub fn wait_uninterruptible<T: ?Sized>(&self, guard: &mut MutexGuard<'_, T>) {
        self.0.wait(guard);
    }

    /// Releases the lock and waits for a notification or until `timeout` elapses.
    pub fn wait_timeout<T: ?Sized>(
        &self,
        guard: &mut MutexGuard<'_, T>,
        timeout: Duration,
    ) -> CondVarTimeoutResult {
        let start = std::time::Instant::now();
        self.0.wait_for(guard, timeout.min(SIGNAL_POLL));
        let remaining = timeout.saturating_sub(start.elapsed());
        if crate::task::signal_pending() {
            CondVarTimeoutResult::Signal
        } else if remaining.is_zero() {
            CondVarTimeoutResult::Timeout
        } else {
            CondVarTimeoutResult::Woken { remaining }
        }
    }

    /// Wakes a single waiter up, if any.
    pub fn notify_one(&self) {
        self.0.notify_one();
    }

    /// Wakes all waiters up, if any.
    pub fn notify_all(&self) {
        self.0.notify_all();
    }
}
