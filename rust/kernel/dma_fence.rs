// SPDX-License-Identifier: GPL-2.0 OR MIT

//! DMA fences.
//!
//! C header: [`include/linux/dma-fence.h`](../../../../include/linux/dma-fence.h)
//!
//! A fence is a completion handle: it names a point (`seqno`) on a timeline (`context`) and
//! resolves once that point is reached. Producers either signal a fence explicitly or expose a
//! polled completion check through [`FenceOps::signaled`], which waiters consult.

use crate::{
    error::{code::*, Error, Result},
    sync::{Arc, CondVar, CondVarTimeoutResult, Mutex, SIGNAL_POLL},
    time::Deadline,
};
use core::any::Any;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use core::time::Duration;

static CONTEXT_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Allocates `num` consecutive fence contexts, returning the first one.
pub fn context_alloc(num: u64) -> u64 {
    CONTEXT_COUNTER.fetch_add(num, Ordering::Relaxed)
}

/// Operations implemented by a fence producer.
pub trait FenceOps: Send + Sync + 'static {
    /// Name of the driver which created the fence.
    fn driver_name(&self) -> &str;

    /// Name of the timeline the fence belongs to.
    fn timeline_name(&self) -> &str;

    /// Polled completion check, for fences backed by a hardware counter.
    fn signaled(&self) -> bool {
        false
    }

    /// Returns the ops as `Any`, so that a producer can recognize its own fences.
    fn as_any(&self) -> &dyn Any;
}

struct FenceState {
    signaled: bool,
    error: Option<Error>,
}

struct FenceObject {
    context: u64,
    seqno: u64,
    ops: Box<dyn FenceOps>,
    state: Mutex<FenceState>,
    cond: CondVar,
}

/// A reference-counted DMA fence.
#[derive(Clone)]
pub struct Fence(Arc<FenceObject>);

impl Fence {
    /// Creates a new, unsignaled fence.
    pub fn new(context: u64, seqno: u64, ops: impl FenceOps) -> Fence {
        Fence(Arc::new(FenceObject {
            context,
            seqno,
            ops: Box::new(ops),
            state: Mutex::new(FenceState {
                signaled: false,
                error: None,
            }),
            cond: CondVar::new(),
        }))
    }

    /// Returns the fence context (timeline) id.
    pub fn context(&self) -> u64 {
        self.0.context
    }

    /// Returns the sequence number of the fence within its context.
    pub fn seqno(&self) -> u64 {
        self.0.seqno
    }

    /// Returns the producer driver name.
    pub fn driver_name(&self) -> &str {
        self.0.ops.driver_name()
    }

    /// Returns the timeline name.
    pub fn timeline_name(&self) -> &str {
        self.0.ops.timeline_name()
    }

    /// Returns the ops of this fence if they are of type `T`.
    pub fn ops<T: FenceOps>(&self) -> Option<&T> {
        self.0.ops.as_any().downcast_ref::<T>()
    }

    /// Returns whether both handles refer to the same fence.
    pub fn ptr_eq(&self, other: &Fence) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Returns whether `self` is a later point than `other` on the same timeline.
    pub fn is_later(&self, other: &Fence) -> bool {
        self.context() == other.context() && self.seqno() > other.seqno()
    }

    fn poll(&self, state: &mut FenceState) -> bool {
        if !state.signaled && self.0.ops.signaled() {
            state.signaled = true;
            self.0.cond.notify_all();
        }
        state.signaled
    }

    /// Returns whether the fence has been signaled.
    pub fn is_signaled(&self) -> bool {
        let mut state = self.0.state.lock();
        self.poll(&mut state)
    }

    /// Signals the fence, waking up all waiters.
    ///
    /// Returns `EINVAL` if the fence was already signaled.
    pub fn signal(&self) -> Result {
        let mut state = self.0.state.lock();
        if state.signaled {
            return Err(EINVAL);
        }
        state.signaled = true;
        drop(state);
        self.0.cond.notify_all();
        Ok(())
    }

    /// Records an error on the fence. Must be called before signaling.
    pub fn set_error(&self, err: Error) {
        let mut state = self.0.state.lock();
        if !state.signaled {
            state.error = Some(err);
        }
    }

    /// Returns the error recorded on the fence, if any.
    pub fn error(&self) -> Option<Error> {
        self.0.state.lock().error
    }

    /// Waits for the fence to signal.
    ///
    /// A `None` timeout waits forever. Returns `ETIMEDOUT` if the timeout elapses (including a
    /// zero timeout on an unsignaled fence), and `ERESTARTSYS` if `intr` is set and the current
    /// task gets a signal.
    pub fn wait(&self, intr: bool, timeout: Option<Duration>) -> Result {
        let deadline = Deadline::new(timeout);
        let mut state = self.0.state.lock();
        loop {
            if self.poll(&mut state) {
                return Ok(());
            }
            if deadline.expired() {
                return Err(ETIMEDOUT);
            }
            if let CondVarTimeoutResult::Signal = self
                .0
                .cond
                .wait_timeout(&mut state, deadline.remaining(SIGNAL_POLL))
            {
                if intr {
                    return Err(ERESTARTSYS);
                }
            }
        }
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("driver", &self.driver_name())
            .field("timeline", &self.timeline_name())
            .field("context", &self.context())
            .field("seqno", &self.seqno())
            .finish()
    }
}

/// Fence ops for fences signaled purely in software.
pub struct SoftFence {
    timeline: String,
}

impl SoftFence {
    /// Creates ops for a software timeline.
    pub fn new(timeline: &str) -> SoftFence {
        SoftFence {
            timeline: timeline.to_owned(),
        }
    }
}

impl FenceOps for SoftFence {
    fn driver_name(&self) -> &str {
        "soft"
    }

    fn timeline_name(&self) -> &str {
        &self.timeline
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn signal_wakes_waiter() {
        let f = Fence::new(context_alloc(1), 1, SoftFence::new("t"));
        let f2 = f.clone();
        let t = thread::spawn(move || f2.wait(true, Some(Duration::from_secs(5))));
        thread::sleep(Duration::from_millis(10));
        f.signal().unwrap();
        assert_eq!(t.join().unwrap(), Ok(()));
        assert_eq!(f.signal(), Err(EINVAL));
    }

    #[test]
    fn zero_timeout() {
        let f = Fence::new(context_alloc(1), 1, SoftFence::new("t"));
        assert_eq!(f.wait(false, Some(Duration::ZERO)), Err(ETIMEDOUT));
        f.signal().unwrap();
        assert_eq!(f.wait(false, Some(Duration::ZERO)), Ok(()));
    }

    #[test]
    fn downcast_and_ordering() {
        let ctx = context_alloc(2);
        assert!(context_alloc(1) >= ctx + 2);
        let a = Fence::new(ctx, 1, SoftFence::new("t"));
        let b = Fence::new(ctx, 2, SoftFence::new("t"));
        assert!(b.is_later(&a));
        assert!(!a.is_later(&b));
        assert!(a.ops::<SoftFence>().is_some());
        assert_eq!(a.timeline_name(), "t");
    }
}
