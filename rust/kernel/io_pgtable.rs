// SPDX-License-Identifier: GPL-2.0 OR MIT

//! IOMMU page table management
//!
//! C header: [`include/io-pgtable.h`](../../../../include/io-pgtable.h)
//!
//! Provides the generic [`IoPageTable`] interface and a flat, single-level table of the kind
//! used by small translation apertures (GART): one entry per page of the aperture, no
//! intermediate levels and no per-entry protection.

use crate::{
    error::{code::*, Result},
    pr_debug,
};
use core::num::NonZeroU64;

/// Protection flags used with IOMMU mappings.
pub mod prot {
    /// Read access.
    pub const READ: u32 = 1 << 0;
    /// Write access.
    pub const WRITE: u32 = 1 << 1;
    /// Request cache coherency.
    pub const CACHE: u32 = 1 << 2;
}

/// Represents a requested io_pgtable configuration.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Valid page sizes, as a bitmask of powers of two.
    pub pgsize_bitmap: usize,
    /// First IOVA translated by the table.
    pub iova_start: u64,
    /// Size of the translated IOVA range in bytes.
    pub iova_size: u64,
}

/// A generic IOMMU page table
pub trait IoPageTable: Send {
    /// Map a range of pages.
    ///
    /// Returns the number of bytes mapped.
    fn map_pages(
        &mut self,
        iova: usize,
        paddr: usize,
        pgsize: usize,
        pgcount: usize,
        prot: u32,
    ) -> Result<usize>;

    /// Unmap a range of pages.
    ///
    /// Returns the number of bytes unmapped.
    fn unmap_pages(&mut self, iova: usize, pgsize: usize, pgcount: usize) -> usize;

    /// Translate an IOVA to the corresponding physical address, if mapped.
    fn iova_to_phys(&mut self, iova: usize) -> Option<NonZeroU64>;

    /// Synchronously invalidate the entire TLB context.
    fn flush_tlb_all(&mut self) {}
}

/// Counters kept by [`Gart`], mostly useful to observe mapping behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
    /// Number of successful `map_pages` calls.
    pub map_calls: u64,
    /// Number of `unmap_pages` calls.
    pub unmap_calls: u64,
    /// Number of page entries written over a still-valid entry.
    pub remapped_pages: u64,
    /// Number of currently valid entries.
    pub mapped_pages: u64,
    /// Number of TLB flushes.
    pub flushes: u64,
}

/// A flat GART-style page table.
pub struct Gart {
    cfg: Config,
    page_size: usize,
    ptes: Vec<Option<u64>>,
    stats: Stats,
}

impl Gart {
    /// Creates a new, empty table for the configured aperture.
    pub fn new(cfg: Config) -> Result<Gart> {
        if cfg.pgsize_bitmap == 0 {
            return Err(EINVAL);
        }
        let page_size = 1usize << cfg.pgsize_bitmap.trailing_zeros();
        if cfg.iova_size == 0 || cfg.iova_size % page_size as u64 != 0 {
            return Err(EINVAL);
        }
        let count = usize::try_from(cfg.iova_size / page_size as u64)?;
        let mut ptes = Vec::new();
        ptes.try_reserve_exact(count)?;
        ptes.resize(count, None);

        Ok(Gart {
            cfg,
            page_size,
            ptes,
            stats: Stats::default(),
        })
    }

    /// Get the configuration for this page table.
    pub fn cfg(&self) -> &Config {
        &self.cfg
    }

    /// Returns the mapping counters.
    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Returns whether the page containing `iova` is mapped.
    pub fn is_mapped(&self, iova: u64) -> bool {
        matches!(self.index(iova as usize, 1), Ok(i) if self.ptes[i].is_some())
    }

    fn index(&self, iova: usize, pgcount: usize) -> Result<usize> {
        let iova = iova as u64;
        let start = self.cfg.iova_start;
        let len = pgcount as u64 * self.page_size as u64;
        if iova < start || iova + len > start + self.cfg.iova_size {
            return Err(EINVAL);
        }
        if (iova - start) % self.page_size as u64 != 0 {
            return Err(EINVAL);
        }
        Ok(((iova - start) / self.page_size as u64) as usize)
    }
}

impl IoPageTable for Gart {
    fn map_pages(
        &mut self,
        iova: usize,
        paddr: usize,
        pgsize: usize,
        pgcount: usize,
        _prot: u32,
    ) -> Result<usize> {
        if pgsize != self.page_size || paddr % pgsize != 0 {
            return Err(EINVAL);
        }
        let first = self.index(iova, pgcount)?;

        for i in 0..pgcount {
            let pte = &mut self.ptes[first + i];
            match pte {
                Some(_) => self.stats.remapped_pages += 1,
                None => self.stats.mapped_pages += 1,
            }
            *pte = Some((paddr + i * pgsize) as u64);
        }
        self.stats.map_calls += 1;

        Ok(pgsize * pgcount)
    }

    fn unmap_pages(&mut self, iova: usize, pgsize: usize, pgcount: usize) -> usize {
        self.stats.unmap_calls += 1;
        if pgsize != self.page_size {
            return 0;
        }
        let first = match self.index(iova, pgcount) {
            Ok(first) => first,
            Err(_) => {
                pr_debug!("gart: unmap out of range {:#x}+{:#x}", iova, pgsize * pgcount);
                return 0;
            }
        };

        let mut unmapped = 0;
        for pte in &mut self.ptes[first..first + pgcount] {
            if pte.take().is_some() {
                self.stats.mapped_pages -= 1;
                unmapped += pgsize;
            }
        }
        unmapped
    }

    fn iova_to_phys(&mut self, iova: usize) -> Option<NonZeroU64> {
        let offset = (iova - (iova % self.page_size)) as u64;
        let i = self.index(offset as usize, 1).ok()?;
        self.ptes[i].and_then(|pa| NonZeroU64::new(pa + (iova % self.page_size) as u64))
    }

    fn flush_tlb_all(&mut self) {
        self.stats.flushes += 1;
    }
}
