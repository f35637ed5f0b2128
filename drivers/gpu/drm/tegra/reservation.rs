// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Buffer reservation lists
//!
//! A submission touches many buffers, some of them more than once (as a command buffer and as a
//! relocation target, or as the target of several relocations). Before fences can be inspected
//! or attached, the reservation lock of every distinct buffer must be held. Concurrent
//! submitters may name the same buffers in any order, so the locks are taken with a wound/wait
//! acquire context: a younger submitter that collides with an older one drops everything, waits
//! for the contended lock, and retries.

use kernel::{
    dma_resv::RESERVATION_WW_CLASS,
    prelude::*,
    sync::ww_mutex::AcquireCtx,
};
use std::collections::BTreeMap;

use crate::{
    debug::*,
    gem::{BoId, Object},
};

const DEBUG_CLASS: DebugFlags = DebugFlags::Resv;

/// One buffer access of a submission.
#[derive(Debug)]
pub struct Reservation {
    /// The buffer.
    pub bo: Arc<Object>,
    /// The submission writes the buffer.
    pub write: bool,
    /// The entry is neither locked nor fenced.
    pub skip: bool,
}

/// The buffer accesses of one submission, in submission order.
pub struct ReservationList {
    entries: Vec<Reservation>,
    pending: BTreeMap<BoId, usize>,
    ctx: Option<AcquireCtx>,
    locked: bool,
}

impl ReservationList {
    /// Creates an empty list with room for `capacity` entries.
    pub fn new(capacity: usize) -> Result<ReservationList> {
        let mut entries = Vec::new();
        entries.try_reserve_exact(capacity)?;
        Ok(ReservationList {
            entries,
            pending: BTreeMap::new(),
            ctx: None,
            locked: false,
        })
    }

    /// Appends an access to `bo`, returning the entry index.
    ///
    /// If the buffer is already in the list the new entry is skipped and its access is merged
    /// into the first entry: a write is never downgraded to a read, and the buffer is locked if
    /// any of its accesses needs it.
    pub fn append(&mut self, bo: Arc<Object>, write: bool, skip: bool) -> Result<usize> {
        let index = self.entries.len();
        self.entries.try_reserve(1)?;

        if let Some(&first) = self.pending.get(&bo.id()) {
            let first = &mut self.entries[first];
            first.write |= write;
            first.skip &= skip;
            self.entries.push(Reservation {
                bo,
                write,
                skip: true,
            });
            return Ok(index);
        }

        self.pending.insert(bo.id(), index);
        self.entries.push(Reservation { bo, write, skip });
        Ok(index)
    }

    /// Returns all entries.
    pub fn entries(&self) -> &[Reservation] {
        &self.entries
    }

    /// Returns the entries that get locked and fenced.
    pub fn lockable(&self) -> impl Iterator<Item = &Reservation> {
        self.entries.iter().filter(|r| !r.skip)
    }

    /// Returns whether the reservation locks are held.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Returns whether the locks were taken through an acquire context.
    pub fn has_acquire_ctx(&self) -> bool {
        self.ctx.is_some()
    }

    fn unlock_except(&self, upto: usize, contended: Option<usize>) {
        for (i, r) in self.entries[..upto].iter().enumerate() {
            if !r.skip && Some(i) != contended {
                r.bo.resv().unlock();
            }
        }
        if let Some(c) = contended {
            self.entries[c].bo.resv().unlock();
        }
    }

    fn lock_all(&self, ctx: Option<&AcquireCtx>) -> Result {
        let mut contended: Option<usize> = None;

        'retry: loop {
            if let Some(c) = contended {
                let ctx = ctx.ok_or(EDEADLK)?;
                self.entries[c].bo.resv().lock_slow(ctx)?;
            }

            for (i, r) in self.entries.iter().enumerate() {
                if r.skip || Some(i) == contended {
                    continue;
                }

                if let Err(e) = r.bo.resv().lock(ctx) {
                    self.unlock_except(i, contended);
                    if e == EDEADLK {
                        mod_pr_debug!("resv: backing off on bo {} (entry {})", r.bo.id(), i);
                        contended = Some(i);
                        continue 'retry;
                    }
                    return Err(e);
                }
            }
            return Ok(());
        }
    }

    /// Takes the reservation lock of every lockable entry.
    ///
    /// On failure nothing is held. `ERESTARTSYS` is returned if the wait was interrupted.
    pub fn lock(&mut self) -> Result {
        if self.locked {
            return Err(EINVAL);
        }

        // A single lock cannot deadlock, skip the acquire context.
        let mut ctx = match self.lockable().count() {
            0 | 1 => None,
            _ => Some(AcquireCtx::new(&RESERVATION_WW_CLASS)),
        };

        self.lock_all(ctx.as_ref())?;

        if let Some(ctx) = ctx.as_mut() {
            ctx.done();
        }
        self.ctx = ctx;
        self.locked = true;
        Ok(())
    }

    /// Releases all reservation locks.
    pub fn unlock(&mut self) {
        if !self.locked {
            return;
        }
        for r in self.lockable() {
            r.bo.resv().unlock();
        }
        self.ctx = None;
        self.locked = false;
    }

    /// Reserves a shared fence slot on every entry that is only read.
    pub fn prealloc_shared(&self) -> Result {
        for r in self.lockable().filter(|r| !r.write) {
            r.bo.resv().fences().reserve_shared(1)?;
        }
        Ok(())
    }
}

impl Drop for ReservationList {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{gem::Backing, mmu::AddressSpace};
    use kernel::{device::Device, PAGE_SIZE};

    fn objects(n: usize) -> Vec<Arc<Object>> {
        let vm = AddressSpace::new(Device::new("resv-test"), 0x1000_0000, 16 * PAGE_SIZE as u64, true)
            .unwrap();
        (0..n)
            .map(|_| Object::new(&vm, PAGE_SIZE, Backing::Pages).unwrap())
            .collect()
    }

    #[test]
    fn new_list_starts_empty() {
        let mut list = ReservationList::new(4).unwrap();
        assert!(list.entries().is_empty());
        assert!(!list.is_locked());
        list.lock().unwrap();
        assert!(list.is_locked());
        assert!(!list.has_acquire_ctx());
        list.unlock();
        assert!(!list.is_locked());
    }

    #[test]
    fn duplicates_merge_into_first_entry() {
        let bos = objects(2);
        let mut list = ReservationList::new(4).unwrap();
        list.append(bos[0].clone(), false, false).unwrap();
        list.append(bos[1].clone(), false, false).unwrap();
        assert_eq!(list.append(bos[0].clone(), true, false), Ok(2));
        list.append(bos[0].clone(), false, false).unwrap();

        let e = list.entries();
        assert!(e[0].write && !e[0].skip);
        assert!(e[2].skip && e[3].skip);
        assert_eq!(list.lockable().count(), 2);
    }

    #[test]
    fn duplicate_unskips_first_entry() {
        let bos = objects(1);
        let mut list = ReservationList::new(2).unwrap();
        list.append(bos[0].clone(), false, true).unwrap();
        list.append(bos[0].clone(), true, false).unwrap();

        let e = list.entries();
        assert!(!e[0].skip && e[0].write);
        assert!(e[1].skip);
    }

    #[test]
    fn single_lock_has_no_context() {
        let bos = objects(2);
        let mut list = ReservationList::new(2).unwrap();
        list.append(bos[0].clone(), false, true).unwrap();
        list.append(bos[1].clone(), false, false).unwrap();
        list.lock().unwrap();
        assert!(!list.has_acquire_ctx());
        assert!(bos[1].resv().is_locked_by_current());
        assert!(!bos[0].resv().is_locked_by_current());
        list.unlock();
        assert!(!bos[1].resv().is_locked_by_current());
    }

    #[test]
    fn lock_unlock_and_prealloc() {
        let bos = objects(3);
        let mut list = ReservationList::new(3).unwrap();
        list.append(bos[0].clone(), true, false).unwrap();
        list.append(bos[1].clone(), false, false).unwrap();
        list.append(bos[2].clone(), false, false).unwrap();

        list.lock().unwrap();
        assert!(list.has_acquire_ctx());
        assert_eq!(list.lock(), Err(EINVAL));
        list.prealloc_shared().unwrap();
        assert!(bos.iter().all(|b| b.resv().is_locked_by_current()));
        drop(list);
        assert!(bos.iter().all(|b| !b.resv().is_locked_by_current()));
    }
}
