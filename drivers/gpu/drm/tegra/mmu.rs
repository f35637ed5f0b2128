// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! GART address space management
//!
//! Tegra20 has no real IOMMU, only a small GART aperture through which the host1x engines see
//! buffer memory. This module hands out aperture ranges to buffer objects and programs the GART.
//!
//! In static mode every object gets a range when it is created and keeps it until it is
//! destroyed. In dynamic mode an object is only mapped while it is pinned by a job. When the last
//! pin goes away the mapping is kept alive on an eviction list, so that pinning the object again
//! costs nothing. When the aperture runs out, the oldest entries of the eviction list are scanned
//! for a set of adjacent ranges that make room for the new object, and only those are evicted.
//! Pages of a victim that the new object is about to overwrite are not unmapped first.
//!
//! The range allocator, the per-object mapping state, the eviction list and the page table all
//! live under a single lock, so "mapped" and "cached" can never disagree.

use kernel::{
    device::Device,
    drm::mm,
    io_pgtable::{prot, Config, Gart, IoPageTable, Stats},
    prelude::*,
    sync::Mutex,
    PAGE_SIZE,
};
use std::collections::BTreeMap;

use crate::{
    debug::*,
    gem::{BoId, Object, SgTable},
};

const DEBUG_CLASS: DebugFlags = DebugFlags::Mmu;

const PGSZ: u64 = PAGE_SIZE as u64;

/// Mapping state of one object.
#[derive(Debug)]
struct Mapping {
    node: mm::Node,
    /// Number of outstanding pins.
    mapcnt: u32,
    /// Position on the eviction list, if the mapping is cached.
    cached: Option<u64>,
}

struct VmInner {
    dev: Device,
    mm: mm::Allocator<BoId>,
    gart: Gart,
    mappings: BTreeMap<BoId, Mapping>,
    /// Cached mappings, oldest first.
    evict: BTreeMap<u64, BoId>,
    evict_stamp: u64,
    evictions: u64,
}

impl VmInner {
    /// Map a contiguous range of pages.
    fn map_pages(&mut self, iova: u64, paddr: u64, pgcount: usize) -> Result {
        let mapped = self.gart.map_pages(
            iova as usize,
            paddr as usize,
            PAGE_SIZE,
            pgcount,
            prot::READ | prot::WRITE,
        )?;
        if mapped != pgcount * PAGE_SIZE {
            return Err(ENOMEM);
        }
        Ok(())
    }

    /// Unmap `[start, end)`.
    fn unmap_range(&mut self, start: u64, end: u64) {
        if end <= start {
            return;
        }
        mod_dev_dbg!(self.dev, "MMU: unmap {:#x}..{:#x}", start, end);
        let pgcount = ((end - start) / PGSZ) as usize;
        self.gart.unmap_pages(start as usize, PAGE_SIZE, pgcount);
    }

    /// Map an object's pages at the start of `node`.
    fn map_node(&mut self, node: mm::Node, sgt: &SgTable) -> Result {
        let mut iova = node.start();

        for entry in sgt.entries() {
            if (entry.phys | entry.len as u64 | iova) & (PGSZ - 1) != 0 {
                dev_err!(
                    self.dev,
                    "MMU: Mapping {:#x}:{:#x} -> {:#x} is not page-aligned",
                    entry.phys,
                    entry.len,
                    iova
                );
                return Err(EINVAL);
            }

            mod_dev_dbg!(
                self.dev,
                "MMU: map: {:#x}:{:#x} -> {:#x}",
                entry.phys,
                entry.len,
                iova
            );

            if let Err(e) = self.map_pages(iova, entry.phys, entry.len / PAGE_SIZE) {
                self.unmap_range(node.start(), iova);
                return Err(e);
            }
            iova += entry.len as u64;
        }
        Ok(())
    }

    /// Select and detach enough cached mappings to make room for `size` bytes.
    ///
    /// Victims are removed from the allocator and the eviction list but stay mapped in the GART;
    /// the caller decides which of their pages to unmap.
    fn evict_something(&mut self, size: u64) -> Result<Vec<mm::Node>> {
        let mut scan = self.mm.scan_init(size, PGSZ, 0, mm::InsertMode::Best);
        let mut scanned = Vec::new();
        scanned.try_reserve(self.evict.len())?;

        let mut found = false;
        for (&stamp, id) in self.evict.iter() {
            let Some(mapping) = self.mappings.get(id) else {
                continue;
            };
            scanned.push((stamp, *id, mapping.node));
            if self.mm.scan_add_block(&mut scan, mapping.node)? {
                found = true;
                break;
            }
        }

        let mut victims = Vec::new();
        for &(stamp, id, node) in scanned.iter().rev() {
            if self.mm.scan_remove_block(&mut scan, node)? {
                victims.push((stamp, id, node));
            }
        }

        if !found {
            mod_dev_dbg!(
                self.dev,
                "MMU: no room for {:#x} bytes after scanning {} cached mappings",
                size,
                scanned.len()
            );
            return Err(ENOSPC);
        }

        let mut nodes = Vec::new();
        nodes.try_reserve(victims.len())?;
        for (stamp, id, node) in victims {
            mod_dev_dbg!(self.dev, "MMU: evicting object {} at {:#x}", id, node.start());
            self.evict.remove(&stamp);
            self.mappings.remove(&id);
            self.mm.remove_node(node)?;
            self.evictions += 1;
            nodes.push(node);
        }
        Ok(nodes)
    }

    /// Unmap the pages of evicted mappings, except those inside `keep`.
    fn unmap_victims(&mut self, victims: &[mm::Node], keep: Option<mm::Node>) {
        for victim in victims {
            match keep {
                Some(keep) if !debug_enabled(DebugFlags::NoPartialUnmap) => {
                    if victim.start() < keep.start() {
                        self.unmap_range(victim.start(), victim.end().min(keep.start()));
                    }
                    if victim.end() > keep.end() {
                        self.unmap_range(victim.start().max(keep.end()), victim.end());
                    }
                }
                _ => self.unmap_range(victim.start(), victim.end()),
            }
        }
        if !victims.is_empty() {
            self.gart.flush_tlb_all();
        }
    }
}

/// The GART address space shared by all clients of a device.
pub struct AddressSpace {
    dynamic: bool,
    inner: Mutex<VmInner>,
}

impl AddressSpace {
    /// Creates the address space for an aperture of `size` bytes at `start`.
    pub fn new(dev: Device, start: u64, size: u64, dynamic: bool) -> Result<Arc<AddressSpace>> {
        let gart = Gart::new(Config {
            pgsize_bitmap: PAGE_SIZE,
            iova_start: start,
            iova_size: size,
        })?;

        dev_info!(
            dev,
            "MMU: GART aperture {:#x}..{:#x} ({} mapping)",
            start,
            start + size,
            if dynamic { "dynamic" } else { "static" }
        );

        Ok(Arc::new(AddressSpace {
            dynamic,
            inner: Mutex::new(VmInner {
                dev,
                mm: mm::Allocator::new(start, size)?,
                gart,
                mappings: BTreeMap::new(),
                evict: BTreeMap::new(),
                evict_stamp: 0,
                evictions: 0,
            }),
        }))
    }

    /// Returns whether objects are mapped per pin rather than for their lifetime.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic
    }

    /// Gives a newly created object its permanent range (static mode).
    pub(crate) fn map_static(&self, bo: &Object) -> Result<u64> {
        let mut inner = self.inner.lock();
        if inner.mappings.contains_key(&bo.id()) {
            return Err(EBUSY);
        }

        let node =
            inner
                .mm
                .insert_node_generic(bo.id(), bo.size() as u64, PGSZ, 0, mm::InsertMode::Best)?;
        if let Err(e) = inner.map_node(node, bo.sg_table()) {
            let _ = inner.mm.remove_node(node);
            return Err(e);
        }

        inner.mappings.insert(
            bo.id(),
            Mapping {
                node,
                mapcnt: 0,
                cached: None,
            },
        );
        bo.set_iova(node.start());
        Ok(node.start())
    }

    /// Pins `bo`, returning its device address.
    ///
    /// Returns `ENOSPC` if no room can be made even after evicting every cached mapping, and
    /// `ENOMEM` if the pages cannot be mapped. On failure the object is left unpinned.
    pub fn pin(&self, bo: &Object) -> Result<u64> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if !self.dynamic {
            let iova = inner
                .mappings
                .get(&bo.id())
                .map(|m| m.node.start())
                .ok_or(EINVAL)?;
            return Ok(iova);
        }

        if let Some(mapping) = inner.mappings.get_mut(&bo.id()) {
            mapping.mapcnt += 1;
            let start = mapping.node.start();
            if let Some(stamp) = mapping.cached.take() {
                inner.evict.remove(&stamp);
                mod_dev_dbg!(inner.dev, "MMU: reusing cached mapping of {} at {:#x}", bo.id(), start);
            }
            return Ok(start);
        }

        let size = bo.size() as u64;
        let mut victims = Vec::new();
        let node = match inner
            .mm
            .insert_node_generic(bo.id(), size, PGSZ, 0, mm::InsertMode::Best)
        {
            Ok(node) => node,
            Err(ENOSPC) => {
                victims = inner.evict_something(size)?;
                match inner
                    .mm
                    .insert_node_generic(bo.id(), size, PGSZ, 0, mm::InsertMode::Best)
                {
                    Ok(node) => node,
                    Err(e) => {
                        inner.unmap_victims(&victims, None);
                        return Err(e);
                    }
                }
            }
            Err(e) => return Err(e),
        };

        if let Err(e) = inner.map_node(node, bo.sg_table()) {
            dev_err!(inner.dev, "MMU: failed to map object {}: {:?}", bo.id(), e);
            let _ = inner.mm.remove_node(node);
            inner.unmap_victims(&victims, None);
            return Err(ENOMEM);
        }
        inner.unmap_victims(&victims, Some(node));

        inner.mappings.insert(
            bo.id(),
            Mapping {
                node,
                mapcnt: 1,
                cached: None,
            },
        );
        bo.set_iova(node.start());
        mod_dev_dbg!(
            inner.dev,
            "MMU: mapped object {} at {:#x} ({} victims)",
            bo.id(),
            node.start(),
            victims.len()
        );
        Ok(node.start())
    }

    /// Drops a pin. In dynamic mode the last pin moves the mapping to the eviction list.
    pub fn unpin(&self, bo: &Object) {
        if !self.dynamic {
            return;
        }

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let stamp = inner.evict_stamp;
        let Some(mapping) = inner.mappings.get_mut(&bo.id()) else {
            dev_warn!(inner.dev, "MMU: unpin of unmapped object {}", bo.id());
            return;
        };
        if mapping.mapcnt == 0 {
            dev_warn!(inner.dev, "MMU: unbalanced unpin of object {}", bo.id());
            return;
        }
        mapping.mapcnt -= 1;
        if mapping.mapcnt == 0 {
            mapping.cached = Some(stamp);
            inner.evict_stamp += 1;
            inner.evict.insert(stamp, bo.id());
        }
    }

    /// Tears down the mapping of a destroyed object.
    pub(crate) fn release(&self, id: BoId) {
        let mut inner = self.inner.lock();
        let Some(mapping) = inner.mappings.remove(&id) else {
            return;
        };
        if mapping.mapcnt > 0 {
            dev_warn!(
                inner.dev,
                "MMU: object {} destroyed with {} pins",
                id,
                mapping.mapcnt
            );
        }
        if let Some(stamp) = mapping.cached {
            inner.evict.remove(&stamp);
        }
        inner.unmap_range(mapping.node.start(), mapping.node.end());
        inner.gart.flush_tlb_all();
        if let Err(e) = inner.mm.remove_node(mapping.node) {
            dev_err!(inner.dev, "MMU: failed to free range of object {}: {:?}", id, e);
        }
    }

    /// Returns whether the object has a range in the aperture (pinned, cached or static).
    pub fn is_mapped(&self, id: BoId) -> bool {
        self.inner.lock().mappings.contains_key(&id)
    }

    /// Returns whether the object sits unpinned on the eviction list.
    pub fn is_cached(&self, id: BoId) -> bool {
        matches!(self.inner.lock().mappings.get(&id), Some(m) if m.cached.is_some())
    }

    /// Returns the number of pins held on the object.
    pub fn pin_count(&self, id: BoId) -> u32 {
        self.inner.lock().mappings.get(&id).map_or(0, |m| m.mapcnt)
    }

    /// Returns the cached objects, oldest first.
    pub fn cached(&self) -> Vec<BoId> {
        self.inner.lock().evict.values().copied().collect()
    }

    /// Returns the number of bytes of the aperture in use.
    pub fn used(&self) -> u64 {
        self.inner.lock().mm.used()
    }

    /// Returns the aperture size.
    pub fn size(&self) -> u64 {
        self.inner.lock().mm.size()
    }

    /// Returns the number of mappings evicted so far.
    pub fn evictions(&self) -> u64 {
        self.inner.lock().evictions
    }

    /// Returns the GART counters.
    pub fn gart_stats(&self) -> Stats {
        self.inner.lock().gart.stats()
    }

    /// Translates a device address through the GART.
    pub fn iova_to_phys(&self, iova: u64) -> Option<u64> {
        self.inner
            .lock()
            .gart
            .iova_to_phys(iova as usize)
            .map(|p| p.get())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gem::Backing;

    const APERTURE: u64 = 0x4000_0000;

    fn vm(pages: u64, dynamic: bool) -> Arc<AddressSpace> {
        AddressSpace::new(Device::new("mmu-test"), APERTURE, pages * PGSZ, dynamic).unwrap()
    }

    fn bo(vm: &Arc<AddressSpace>, pages: usize) -> Arc<Object> {
        Object::new(vm, pages * PAGE_SIZE, Backing::Pages).unwrap()
    }

    #[test]
    fn repin_reuses_cached_mapping() {
        let vm = vm(8, true);
        let a = bo(&vm, 2);
        assert!(!vm.is_mapped(a.id()));

        let iova = a.pin().unwrap();
        let maps = vm.gart_stats().map_calls;
        a.unpin();
        assert!(vm.is_cached(a.id()));
        assert_eq!(a.pin(), Ok(iova));
        assert!(!vm.is_cached(a.id()));
        assert_eq!(vm.gart_stats().map_calls, maps);

        // Nested pins only cache on the last unpin.
        assert_eq!(a.pin(), Ok(iova));
        a.unpin();
        assert!(!vm.is_cached(a.id()));
        a.unpin();
        assert!(vm.is_cached(a.id()));
        assert_eq!(vm.iova_to_phys(iova), Some(a.sg_table().entries()[0].phys));
    }

    #[test]
    fn evicts_oldest_first() {
        let vm = vm(4, true);
        let objs: Vec<_> = (0..4).map(|_| bo(&vm, 1)).collect();
        for o in &objs {
            o.pin().unwrap();
        }
        // Unpin in the order 2, 0, 3, 1.
        for i in [2, 0, 3, 1] {
            objs[i].unpin();
        }
        assert_eq!(
            vm.cached(),
            [2, 0, 3, 1].map(|i| objs[i].id()).to_vec()
        );

        let new = bo(&vm, 1);
        new.pin().unwrap();
        assert!(!vm.is_mapped(objs[2].id()));
        assert!(vm.is_mapped(objs[0].id()));
        assert_eq!(vm.evictions(), 1);
        assert_eq!(new.iova(), objs[2].iova());
    }

    #[test]
    fn pinned_objects_are_never_evicted() {
        let vm = vm(4, true);
        let a = bo(&vm, 2);
        let b = bo(&vm, 2);
        a.pin().unwrap();
        b.pin().unwrap();

        let c = bo(&vm, 1);
        assert_eq!(c.pin(), Err(ENOSPC));
        assert!(vm.is_mapped(a.id()) && vm.is_mapped(b.id()));
        assert_eq!(vm.pin_count(c.id()), 0);

        b.unpin();
        c.pin().unwrap();
        assert!(!vm.is_mapped(b.id()));
        assert_eq!(vm.used(), 3 * PGSZ);
    }

    #[test]
    fn partial_unmap_keeps_overlap() {
        let vm = vm(4, true);
        let big = bo(&vm, 4);
        big.pin().unwrap();
        big.unpin();
        let unmaps = vm.gart_stats().unmap_calls;

        let small = bo(&vm, 2);
        let iova = small.pin().unwrap();
        assert_eq!(iova, APERTURE);
        let stats = vm.gart_stats();
        // Only the tail of the victim is unmapped, the head is overwritten.
        assert_eq!(stats.unmap_calls, unmaps + 1);
        assert_eq!(stats.remapped_pages, 2);
        assert_eq!(stats.mapped_pages, 2);
    }

    #[test]
    fn destroy_releases_range() {
        let vm = vm(4, true);
        let a = bo(&vm, 2);
        a.pin().unwrap();
        a.unpin();
        let id = a.id();
        drop(a);
        assert!(!vm.is_mapped(id));
        assert!(vm.cached().is_empty());
        assert_eq!(vm.used(), 0);
        assert_eq!(vm.gart_stats().mapped_pages, 0);
    }

    #[test]
    fn static_mode() {
        let vm = vm(4, false);
        let a = bo(&vm, 2);
        assert!(vm.is_mapped(a.id()));
        assert_eq!(a.pin(), Ok(APERTURE));
        a.unpin();
        assert!(!vm.is_cached(a.id()));
        let _b = bo(&vm, 2);
        assert_eq!(Object::new(&vm, PAGE_SIZE, Backing::Pages).err(), Some(ENOSPC));
    }
}
