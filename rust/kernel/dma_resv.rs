// SPDX-License-Identifier: GPL-2.0 OR MIT

//! DMA reservation objects.
//!
//! C header: [`include/linux/dma-resv.h`](../../../../include/linux/dma-resv.h)
//!
//! A reservation object records the fences that guard a buffer: at most one exclusive (write)
//! fence and a set of shared (read) fences. Adding an exclusive fence drops the shared set, since
//! the new writer is ordered after all of them. The fence lists may only be changed while the
//! object's wound/wait lock is held.

use crate::{
    dma_fence::Fence,
    error::{code::*, Result},
    pr_warn,
    sync::{
        ww_mutex::{AcquireCtx, WwClass, WwMutex},
        MutexGuard,
    },
    time::Deadline,
};
use core::time::Duration;

/// The lock class shared by all reservation objects.
pub static RESERVATION_WW_CLASS: WwClass = WwClass::new("reservation_ww_class");

/// The fences held by a reservation object.
#[derive(Default)]
pub struct ResvFences {
    excl: Option<Fence>,
    shared: Vec<Fence>,
    shared_max: usize,
}

impl ResvFences {
    /// Returns the exclusive fence, if any.
    pub fn excl(&self) -> Option<&Fence> {
        self.excl.as_ref()
    }

    /// Returns the shared fences.
    pub fn shared(&self) -> &[Fence] {
        &self.shared
    }

    /// Reserves space for `num` more shared fences.
    pub fn reserve_shared(&mut self, num: usize) -> Result {
        let needed = self.shared.len() + num;
        if needed > self.shared_max {
            self.shared.try_reserve(needed - self.shared.len())?;
            self.shared_max = needed;
        }
        Ok(())
    }

    /// Replaces the exclusive fence and drops all shared fences.
    ///
    /// `None` records that the write has already completed.
    pub fn add_excl_fence(&mut self, fence: Option<Fence>) {
        self.excl = fence;
        self.shared.clear();
        self.shared_max = 0;
    }

    /// Adds a shared fence.
    ///
    /// A fence already present from the same context, or any signaled fence, is replaced instead
    /// of growing the set. Space should have been reserved with [`ResvFences::reserve_shared`].
    pub fn add_shared_fence(&mut self, fence: Fence) {
        if let Some(slot) = self
            .shared
            .iter_mut()
            .find(|f| f.context() == fence.context() || f.is_signaled())
        {
            *slot = fence;
            return;
        }

        if self.shared.len() >= self.shared_max {
            pr_warn!(
                "dma_resv: shared fence added without a reserved slot ({}/{})",
                self.shared.len(),
                self.shared_max
            );
            self.shared_max = self.shared.len() + 1;
        }
        self.shared.push(fence);
    }

    /// Returns every fence a waiter must consider: the exclusive one, plus the shared ones if
    /// `all` is set.
    pub fn fences(&self, all: bool) -> Vec<Fence> {
        let mut fences: Vec<Fence> = self.excl.iter().cloned().collect();
        if all {
            fences.extend(self.shared.iter().cloned());
        }
        fences
    }
}

/// A reservation object.
pub struct Resv {
    lock: WwMutex<ResvFences>,
}

impl Default for Resv {
    fn default() -> Self {
        Resv::new()
    }
}

impl Resv {
    /// Creates an empty reservation object.
    pub fn new() -> Resv {
        Resv {
            lock: WwMutex::new(&RESERVATION_WW_CLASS, ResvFences::default()),
        }
    }

    /// Takes the reservation lock, interruptibly.
    pub fn lock(&self, ctx: Option<&AcquireCtx>) -> Result {
        self.lock.lock_interruptible(ctx)
    }

    /// Takes the reservation lock on the slow path after an `EDEADLK` backoff.
    pub fn lock_slow(&self, ctx: &AcquireCtx) -> Result {
        self.lock.lock_slow_interruptible(ctx)
    }

    /// Releases the reservation lock.
    pub fn unlock(&self) {
        self.lock.unlock();
    }

    /// Returns whether the calling thread holds the reservation lock.
    pub fn is_locked_by_current(&self) -> bool {
        self.lock.is_held_by_current()
    }

    /// Accesses the fences. The reservation lock must be held.
    pub fn fences(&self) -> MutexGuard<'_, ResvFences> {
        self.lock.data()
    }

    /// Returns whether all relevant fences have signaled, without taking the reservation lock.
    pub fn test_signaled(&self, all: bool) -> bool {
        let fences = self.lock.data_unlocked().fences(all);
        fences.iter().all(|f| f.is_signaled())
    }

    /// Waits for the relevant fences without taking the reservation lock.
    ///
    /// `all` selects shared fences as well as the exclusive one. A zero timeout only polls and
    /// returns `EBUSY` if any fence is still pending.
    pub fn wait_timeout(&self, all: bool, intr: bool, timeout: Option<Duration>) -> Result {
        let fences = self.lock.data_unlocked().fences(all);

        if timeout == Some(Duration::ZERO) {
            return match fences.iter().all(|f| f.is_signaled()) {
                true => Ok(()),
                false => Err(EBUSY),
            };
        }

        let deadline = Deadline::new(timeout);
        for fence in fences {
            let left = match timeout {
                None => None,
                Some(t) => Some(deadline.remaining(t)),
            };
            fence.wait(intr, left)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dma_fence::{context_alloc, SoftFence};

    fn fence(ctx: u64, seqno: u64) -> Fence {
        Fence::new(ctx, seqno, SoftFence::new("resv-test"))
    }

    #[test]
    fn exclusive_drops_shared() {
        let resv = Resv::new();
        let ctx = context_alloc(2);
        resv.lock(None).unwrap();
        {
            let mut f = resv.fences();
            f.reserve_shared(2).unwrap();
            f.add_shared_fence(fence(ctx, 1));
            f.add_shared_fence(fence(ctx + 1, 1));
            assert_eq!(f.shared().len(), 2);
            f.add_excl_fence(Some(fence(ctx, 2)));
            assert!(f.shared().is_empty());
            assert_eq!(f.excl().map(|f| f.seqno()), Some(2));
        }
        resv.unlock();
    }

    #[test]
    fn shared_same_context_replaced() {
        let resv = Resv::new();
        let ctx = context_alloc(1);
        resv.lock(None).unwrap();
        {
            let mut f = resv.fences();
            f.reserve_shared(1).unwrap();
            f.add_shared_fence(fence(ctx, 1));
            f.reserve_shared(1).unwrap();
            f.add_shared_fence(fence(ctx, 2));
            assert_eq!(f.shared().len(), 1);
            assert_eq!(f.shared()[0].seqno(), 2);
        }
        resv.unlock();
    }

    #[test]
    fn wait_and_poll() {
        let resv = Resv::new();
        let f = fence(context_alloc(1), 1);
        resv.lock(None).unwrap();
        resv.fences().add_excl_fence(Some(f.clone()));
        resv.unlock();

        assert!(!resv.test_signaled(true));
        assert_eq!(resv.wait_timeout(true, false, Some(Duration::ZERO)), Err(EBUSY));
        assert_eq!(
            resv.wait_timeout(false, false, Some(Duration::from_millis(5))),
            Err(ETIMEDOUT)
        );
        f.signal().unwrap();
        assert!(resv.test_signaled(true));
        assert_eq!(resv.wait_timeout(true, true, None), Ok(()));
    }
}
