// SPDX-License-Identifier: GPL-2.0 OR MIT

//! The `kernel` crate.
//!
//! This crate contains the kernel APIs used by the Tegra DRM driver, implemented for a hosted
//! environment: errors, printing, locking (including wound/wait mutexes), DMA fences and
//! reservation objects, the DRM range allocator and IOMMU page tables.
//!
//! The APIs follow their C counterparts closely, so that driver code reads the same as it would
//! against the real kernel bindings.

pub mod device;
pub mod dma_fence;
pub mod dma_resv;
pub mod drm;
pub mod error;
pub mod io_pgtable;
pub mod prelude;
pub mod print;
pub mod sync;
pub mod task;
pub mod time;

#[doc(hidden)]
pub use log;

/// Page size of the device memory model.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Page shift of the device memory model.
pub const PAGE_SHIFT: usize = 12;
