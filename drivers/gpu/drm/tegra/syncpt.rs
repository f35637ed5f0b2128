// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! host1x syncpoints
//!
//! A syncpoint is a 32-bit hardware counter that engines increment as they finish work. The
//! driver keeps a shadow copy of it: `max` is the value the counter will reach once everything
//! queued so far has completed, `min` is the last value read back from the hardware. All
//! comparisons are wrap-safe.

use core::sync::atomic::{AtomicU32, Ordering};
use core::time::Duration;
use kernel::{prelude::*, sync::Mutex, task, time::Deadline};

use crate::{debug::*, hw::Host1xHardware};

const DEBUG_CLASS: DebugFlags = DebugFlags::Syncpt;

const WAIT_POLL: Duration = Duration::from_millis(1);

/// A host1x syncpoint.
pub struct Syncpoint {
    id: u32,
    name: String,
    min: AtomicU32,
    max: AtomicU32,
    client_managed: bool,
    hw: Arc<dyn Host1xHardware>,
}

impl Syncpoint {
    /// Returns the hardware id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Returns the syncpoint name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns whether `max` is managed by the client rather than tracked by the driver.
    pub fn client_managed(&self) -> bool {
        self.client_managed
    }

    /// Reserves `incrs` increments, returning the value reached once they are done.
    pub fn incr_max(&self, incrs: u32) -> u32 {
        self.max
            .fetch_add(incrs, Ordering::AcqRel)
            .wrapping_add(incrs)
    }

    /// Returns the cached hardware value.
    pub fn read_min(&self) -> u32 {
        self.min.load(Ordering::Acquire)
    }

    /// Returns the value the syncpoint will reach once all queued work completes.
    pub fn read_max(&self) -> u32 {
        self.max.load(Ordering::Acquire)
    }

    /// Refreshes the cached value from the hardware and returns it.
    pub fn load(&self) -> u32 {
        let live = self.hw.syncpt_load(self.id);
        let mut old = self.min.load(Ordering::Acquire);
        while let Err(cur) =
            self.min
                .compare_exchange_weak(old, live, Ordering::AcqRel, Ordering::Acquire)
        {
            old = cur;
        }

        if !self.client_managed && (self.read_max().wrapping_sub(live) as i32) < 0 {
            pr_err!(
                "syncpt {} ({}): load min {} beyond max {}",
                self.id,
                self.name,
                live,
                self.read_max()
            );
        }
        live
    }

    /// Increments the syncpoint from the CPU.
    pub fn incr(&self) {
        if !self.client_managed {
            self.incr_max(1);
        }
        self.cpu_incr();
    }

    /// Performs one increment already accounted for in `max`.
    pub(crate) fn cpu_incr(&self) {
        self.hw.syncpt_cpu_incr(self.id);
        self.load();
    }

    /// Returns whether the syncpoint has reached `thresh`, based on the cached value.
    pub fn is_expired_cached(&self, thresh: u32) -> bool {
        let current = self.read_min();

        if self.client_managed {
            return current.wrapping_sub(thresh) as i32 >= 0;
        }

        // Values between `current` and `max` are still pending. Anything else has either
        // passed or is beyond what was ever queued, and counts as expired.
        let future = self.read_max();
        future.wrapping_sub(thresh) >= current.wrapping_sub(thresh)
    }

    /// Returns whether the syncpoint has reached `thresh`, reading the hardware if needed.
    pub fn is_expired(&self, thresh: u32) -> bool {
        if self.is_expired_cached(thresh) {
            return true;
        }
        self.load();
        self.is_expired_cached(thresh)
    }

    /// Waits until the syncpoint reaches `thresh`, returning the value read.
    ///
    /// A zero timeout only checks and returns `EAGAIN`. A `None` timeout waits forever.
    /// Returns `ETIMEDOUT` on timeout and `ERESTARTSYS` if `intr` is set and a signal arrives.
    pub fn wait(&self, thresh: u32, timeout: Option<Duration>, intr: bool) -> Result<u32> {
        if self.is_expired(thresh) {
            return Ok(self.read_min());
        }
        if timeout == Some(Duration::ZERO) {
            return Err(EAGAIN);
        }

        mod_pr_debug!(
            "syncpt {}: waiting for {} (min {} max {})",
            self.id,
            thresh,
            self.read_min(),
            self.read_max()
        );

        let deadline = Deadline::new(timeout);
        loop {
            if self.is_expired(thresh) {
                return Ok(self.read_min());
            }
            if deadline.expired() {
                pr_warn!(
                    "syncpt {} ({}): timed out waiting for {} (min {} max {})",
                    self.id,
                    self.name,
                    thresh,
                    self.read_min(),
                    self.read_max()
                );
                return Err(ETIMEDOUT);
            }
            if intr && task::signal_pending() {
                return Err(ERESTARTSYS);
            }
            std::thread::sleep(deadline.remaining(WAIT_POLL));
        }
    }
}

impl core::fmt::Debug for Syncpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Syncpoint")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("min", &self.read_min())
            .field("max", &self.read_max())
            .finish()
    }
}

/// Allocator for the syncpoints of a host1x instance.
pub struct SyncptManager {
    hw: Arc<dyn Host1xHardware>,
    syncpts: Mutex<Vec<Option<Arc<Syncpoint>>>>,
}

impl SyncptManager {
    /// Creates a manager for every syncpoint the hardware has.
    pub fn new(hw: Arc<dyn Host1xHardware>) -> SyncptManager {
        let count = hw.num_syncpts() as usize;
        SyncptManager {
            hw,
            syncpts: Mutex::new(vec![None; count]),
        }
    }

    /// Allocates a free syncpoint. Returns `EBUSY` when all are in use.
    pub fn alloc(&self, name: &str, client_managed: bool) -> Result<Arc<Syncpoint>> {
        let mut syncpts = self.syncpts.lock();
        let (id, slot) = syncpts
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.is_none())
            .ok_or(EBUSY)?;

        let id = id as u32;
        let value = self.hw.syncpt_load(id);
        let sp = Arc::new(Syncpoint {
            id,
            name: format!("{}-{}", id, name),
            min: AtomicU32::new(value),
            max: AtomicU32::new(value),
            client_managed,
            hw: self.hw.clone(),
        });
        *slot = Some(sp.clone());

        mod_pr_debug!("syncpt: allocated {} at value {}", sp.name, value);
        Ok(sp)
    }

    /// Looks up an allocated syncpoint.
    pub fn get(&self, id: u32) -> Result<Arc<Syncpoint>> {
        self.syncpts
            .lock()
            .get(id as usize)
            .cloned()
            .flatten()
            .ok_or(ENOENT)
    }

    /// Returns a syncpoint to the pool.
    pub fn free(&self, sp: &Syncpoint) {
        if let Some(slot) = self.syncpts.lock().get_mut(sp.id as usize) {
            *slot = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::SimHost;

    #[test]
    fn expiry_and_wrap() {
        let host = SimHost::new(2, true);
        let mgr = SyncptManager::new(host.clone());
        let sp = mgr.alloc("test", false).unwrap();

        let end = sp.incr_max(2);
        assert_eq!(end, 2);
        assert!(!sp.is_expired(1));
        host.hw_incr(sp.id());
        assert!(sp.is_expired(1));
        assert!(!sp.is_expired(2));
        // Beyond max is treated as done.
        assert!(sp.is_expired(10));
        sp.incr();
        sp.incr();
        assert_eq!(sp.read_min(), 3);
        // One increment of the queued pair is still outstanding.
        assert_eq!(sp.read_max(), 4);
    }

    #[test]
    fn wrap_around() {
        let host = SimHost::new(1, true);
        let mgr = SyncptManager::new(host.clone());
        let sp = mgr.alloc("wrap", true).unwrap();
        sp.max.store(u32::MAX - 1, Ordering::Relaxed);
        sp.min.store(u32::MAX - 1, Ordering::Relaxed);
        assert!(sp.is_expired_cached(u32::MAX - 2));
        assert!(!sp.is_expired_cached(1));
    }

    #[test]
    fn wait_timeouts() {
        let host = SimHost::new(1, true);
        let mgr = SyncptManager::new(host.clone());
        let sp = mgr.alloc("wait", false).unwrap();
        let end = sp.incr_max(1);
        assert_eq!(sp.wait(end, Some(Duration::ZERO), true), Err(EAGAIN));
        assert_eq!(
            sp.wait(end, Some(Duration::from_millis(3)), false),
            Err(ETIMEDOUT)
        );
        host.hw_incr(0);
        assert_eq!(sp.wait(end, None, true), Ok(1));
    }

    #[test]
    fn pool() {
        let host = SimHost::new(1, true);
        let mgr = SyncptManager::new(host);
        let sp = mgr.alloc("a", false).unwrap();
        assert_eq!(mgr.alloc("b", false).err(), Some(EBUSY));
        assert_eq!(mgr.get(0).map(|s| s.id()), Ok(0));
        mgr.free(&sp);
        assert_eq!(mgr.get(0).err(), Some(ENOENT));
    }
}
