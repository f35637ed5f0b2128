// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Tegra GEM object implementation
//!
//! A buffer object owns its backing pages, its reservation object and its tiling mode. Device
//! mappings are not tracked here: the [`AddressSpace`] keeps the mapping state of every object
//! under its own lock, keyed by object id, and the object only mirrors the last device address
//! it was pinned at. Objects are shared through `Arc` between the per-file handle registry and
//! in-flight jobs, and unmapped from the address space when the last reference goes away.

use core::sync::atomic::{AtomicU64, Ordering};
use kernel::{
    dma_resv::Resv,
    prelude::*,
    sync::Mutex,
    PAGE_SIZE,
};
use std::collections::BTreeMap;

use crate::{
    debug::*,
    mmu::AddressSpace,
    util::{self, PageMemory, Pages},
};

const DEBUG_CLASS: DebugFlags = DebugFlags::Gem;

/// Identifies a buffer object for the lifetime of the device.
pub type BoId = u64;

static GEM_ID: AtomicU64 = AtomicU64::new(1);

/// How the pages of an object are laid out in bus address space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backing {
    /// One physically contiguous block.
    Contiguous,
    /// Individually allocated pages.
    Pages,
}

/// A physically contiguous run of an object's backing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SgEntry {
    /// Bus address of the run.
    pub phys: u64,
    /// Length of the run in bytes, a multiple of the page size.
    pub len: usize,
}

/// Scatter/gather table of an object's backing pages.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SgTable {
    entries: Vec<SgEntry>,
}

impl SgTable {
    /// Builds a table from per-page bus addresses, merging physically contiguous pages.
    pub fn from_pages(pages: &[u64]) -> Result<SgTable> {
        let mut entries: Vec<SgEntry> = Vec::new();
        for &phys in pages {
            match entries.last_mut() {
                Some(last) if last.phys + last.len as u64 == phys => last.len += PAGE_SIZE,
                _ => {
                    entries.try_reserve(1)?;
                    entries.push(SgEntry {
                        phys,
                        len: PAGE_SIZE,
                    });
                }
            }
        }
        Ok(SgTable { entries })
    }

    /// Returns the table entries.
    pub fn entries(&self) -> &[SgEntry] {
        &self.entries
    }

    /// Total length in bytes.
    pub fn len(&self) -> usize {
        self.entries.iter().map(|e| e.len).sum()
    }

    /// Returns whether the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Tiling layout of an object, as seen by the display and 2D engines.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Tiling {
    /// Linear pitch layout.
    #[default]
    Pitch,
    /// 16x16 tiles.
    Tiled,
    /// Block linear layout with a block height of `1 << height` GOBs.
    Block {
        /// Log2 of the block height.
        height: u32,
    },
}

impl Tiling {
    /// Decodes the `(mode, value)` pair used by the set/get tiling calls.
    pub fn from_raw(mode: u32, value: u32) -> Result<Tiling> {
        match (mode, value) {
            (0, 0) => Ok(Tiling::Pitch),
            (1, 0) => Ok(Tiling::Tiled),
            (2, height) if height <= 5 => Ok(Tiling::Block { height }),
            _ => Err(EINVAL),
        }
    }

    /// Encodes the tiling as a `(mode, value)` pair.
    pub fn to_raw(self) -> (u32, u32) {
        match self {
            Tiling::Pitch => (0, 0),
            Tiling::Tiled => (1, 0),
            Tiling::Block { height } => (2, height),
        }
    }
}

/// A Tegra buffer object.
pub struct Object {
    id: BoId,
    size: usize,
    backing: Backing,
    sgt: SgTable,
    data: Pages,
    tiling: Mutex<Tiling>,
    resv: Resv,
    iova: AtomicU64,
    vm: Arc<AddressSpace>,
}

impl Object {
    /// Allocates a new object of at least `size` bytes.
    ///
    /// In static mapping mode the object is mapped into the address space right away and keeps
    /// its device address until it is destroyed.
    pub fn new(vm: &Arc<AddressSpace>, size: usize, backing: Backing) -> Result<Arc<Object>> {
        if size == 0 {
            return Err(EINVAL);
        }
        let size = util::align(size, PAGE_SIZE);
        let data = Pages::new(size)?;

        let mut pages = Vec::new();
        pages.try_reserve_exact(data.count())?;
        match backing {
            Backing::Contiguous => {
                let base = util::alloc_phys(size);
                pages.extend((0..data.count()).map(|i| base + (i * PAGE_SIZE) as u64));
            }
            Backing::Pages => {
                pages.extend((0..data.count()).map(|_| util::alloc_phys(PAGE_SIZE)));
            }
        }
        let sgt = SgTable::from_pages(&pages)?;

        let obj = Arc::new(Object {
            id: GEM_ID.fetch_add(1, Ordering::Relaxed),
            size,
            backing,
            sgt,
            data,
            tiling: Mutex::new(Tiling::default()),
            resv: Resv::new(),
            iova: AtomicU64::new(0),
            vm: vm.clone(),
        });

        mod_pr_debug!(
            "gem: new object {} size {:#x} {:?} ({} sg entries)",
            obj.id,
            size,
            backing,
            obj.sgt.entries().len()
        );

        if !vm.is_dynamic() {
            vm.map_static(&obj)?;
        }

        Ok(obj)
    }

    /// Returns the object id.
    pub fn id(&self) -> BoId {
        self.id
    }

    /// Returns the size in bytes, a multiple of the page size.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the backing layout.
    pub fn backing(&self) -> Backing {
        self.backing
    }

    /// Returns the scatter/gather table of the backing pages.
    pub fn sg_table(&self) -> &SgTable {
        &self.sgt
    }

    /// Returns the reservation object.
    pub fn resv(&self) -> &Resv {
        &self.resv
    }

    /// Returns the address space the object is mapped into.
    pub fn vm(&self) -> &Arc<AddressSpace> {
        &self.vm
    }

    /// Returns the device address the object was last mapped at.
    ///
    /// Only meaningful while the object is pinned (or permanently mapped).
    pub fn iova(&self) -> u64 {
        self.iova.load(Ordering::Acquire)
    }

    pub(crate) fn set_iova(&self, iova: u64) {
        self.iova.store(iova, Ordering::Release);
    }

    /// Returns the tiling mode.
    pub fn tiling(&self) -> Tiling {
        *self.tiling.lock()
    }

    /// Sets the tiling mode.
    pub fn set_tiling(&self, tiling: Tiling) {
        *self.tiling.lock() = tiling;
    }

    /// Pins the object into the address space, returning its device address.
    pub fn pin(&self) -> Result<u64> {
        self.vm.pin(self)
    }

    /// Drops a pin taken with [`Object::pin`].
    pub fn unpin(&self) {
        self.vm.unpin(self)
    }
}

impl PageMemory for Object {
    fn size(&self) -> usize {
        self.size
    }

    fn with_page(&self, page: usize, f: &mut dyn FnMut(&mut [u8])) -> Result {
        self.data.with_page(page, f)
    }
}

impl Drop for Object {
    fn drop(&mut self) {
        mod_pr_debug!("gem: destroying object {}", self.id);
        self.vm.release(self.id);
    }
}

impl core::fmt::Debug for Object {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Object")
            .field("id", &self.id)
            .field("size", &self.size)
            .field("backing", &self.backing)
            .finish()
    }
}

struct Handles {
    next: u32,
    objects: BTreeMap<u32, Arc<Object>>,
}

/// Handle table mapping user handles to buffer objects.
pub struct Registry {
    inner: Mutex<Handles>,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl Registry {
    /// Creates an empty handle table.
    pub fn new() -> Registry {
        Registry {
            inner: Mutex::new(Handles {
                next: 1,
                objects: BTreeMap::new(),
            }),
        }
    }

    /// Registers `obj`, returning its new handle.
    pub fn insert(&self, obj: Arc<Object>) -> Result<u32> {
        let mut inner = self.inner.lock();
        let handle = inner.next;
        inner.next = handle.checked_add(1).ok_or(ENOSPC)?;
        inner.objects.insert(handle, obj);
        Ok(handle)
    }

    /// Looks up the object behind `handle`.
    pub fn lookup(&self, handle: u32) -> Result<Arc<Object>> {
        self.inner
            .lock()
            .objects
            .get(&handle)
            .cloned()
            .ok_or(ENOENT)
    }

    /// Drops the handle table's reference to the object behind `handle`.
    pub fn release(&self, handle: u32) -> Result {
        let obj = self.inner.lock().objects.remove(&handle).ok_or(ENOENT)?;
        // Drop outside the table lock, since destruction takes the address space lock.
        drop(obj);
        Ok(())
    }

    /// Number of live handles.
    pub fn len(&self) -> usize {
        self.inner.lock().objects.len()
    }

    /// Returns whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every handle.
    pub fn clear(&self) {
        let objects = core::mem::take(&mut self.inner.lock().objects);
        drop(objects);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::AddressSpace;
    use kernel::device::Device;

    fn vm(dynamic: bool) -> Arc<AddressSpace> {
        AddressSpace::new(Device::new("gem-test"), 0x4000_0000, 64 * PAGE_SIZE as u64, dynamic)
            .unwrap()
    }

    #[test]
    fn sg_merges_contiguous_pages() {
        let vm = vm(true);
        let c = Object::new(&vm, 3 * PAGE_SIZE - 5, Backing::Contiguous).unwrap();
        assert_eq!(c.size(), 3 * PAGE_SIZE);
        assert_eq!(c.sg_table().entries().len(), 1);
        assert_eq!(c.sg_table().len(), 3 * PAGE_SIZE);

        let p = Object::new(&vm, 3 * PAGE_SIZE, Backing::Pages).unwrap();
        assert_eq!(p.sg_table().entries().len(), 3);
        assert_eq!(Object::new(&vm, 0, Backing::Pages).err(), Some(EINVAL));
    }

    #[test]
    fn tiling_modes() {
        assert_eq!(Tiling::from_raw(2, 5), Ok(Tiling::Block { height: 5 }));
        assert_eq!(Tiling::from_raw(2, 6), Err(EINVAL));
        assert_eq!(Tiling::from_raw(1, 1), Err(EINVAL));
        assert_eq!(Tiling::from_raw(3, 0), Err(EINVAL));
        assert_eq!(Tiling::Tiled.to_raw(), (1, 0));
    }

    #[test]
    fn registry_lookup_release() {
        let vm = vm(false);
        let reg = Registry::new();
        let obj = Object::new(&vm, PAGE_SIZE, Backing::Pages).unwrap();
        let id = obj.id();
        assert!(vm.is_mapped(id));
        let h = reg.insert(obj).unwrap();
        assert_eq!(reg.lookup(h).map(|o| o.id()), Ok(id));
        assert_eq!(reg.lookup(h + 1).err(), Some(ENOENT));
        reg.release(h).unwrap();
        assert_eq!(reg.release(h), Err(ENOENT));
        assert!(!vm.is_mapped(id));
    }

    #[test]
    fn data_access() {
        let vm = vm(true);
        let obj = Object::new(&vm, 2 * PAGE_SIZE, Backing::Pages).unwrap();
        obj.write_word(PAGE_SIZE + 8, 0xdead_beef).unwrap();
        assert_eq!(obj.read_word(PAGE_SIZE + 8), Ok(0xdead_beef));
        assert_eq!(obj.read_word(2 * PAGE_SIZE), Err(EFAULT));
    }
}
