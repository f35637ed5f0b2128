// SPDX-License-Identifier: GPL-2.0 OR MIT

//! Tasks (threads).
//!
//! Hosted threads have no signals, so each task carries a "signal pending" flag which another
//! thread may raise through [`Task::signal`]. Interruptible waits in this crate poll the flag of
//! the current task and return `ERESTARTSYS` when it is set.

use crate::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};

struct TaskInner {
    name: String,
    pending: AtomicBool,
}

/// Wraps the kernel's notion of a task.
#[derive(Clone)]
pub struct Task(Arc<TaskInner>);

thread_local! {
    static CURRENT: Task = Task(Arc::new(TaskInner {
        name: std::thread::current().name().unwrap_or("<unnamed>").to_owned(),
        pending: AtomicBool::new(false),
    }));
}

impl Task {
    /// Returns a handle to the task of the calling thread.
    pub fn current() -> Task {
        CURRENT.with(|t| t.clone())
    }

    /// Returns the name of the task.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// Marks a signal as pending on this task.
    pub fn signal(&self) {
        self.0.pending.store(true, Ordering::Release);
    }

    /// Clears a pending signal, returning whether one was pending.
    pub fn clear_signal(&self) -> bool {
        self.0.pending.swap(false, Ordering::AcqRel)
    }

    /// Returns whether a signal is pending on this task.
    pub fn signal_pending(&self) -> bool {
        self.0.pending.load(Ordering::Acquire)
    }
}

/// Returns whether the current task has a pending signal.
pub fn signal_pending() -> bool {
    CURRENT.with(|t| t.signal_pending())
}
