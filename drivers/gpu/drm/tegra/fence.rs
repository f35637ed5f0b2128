// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Host1x fences and execution contexts
//!
//! Jobs signal completion through syncpoint thresholds. This module wraps a (syncpoint,
//! threshold) pair into a [`Fence`] so the rest of the driver (and other drivers) can wait on it,
//! and lets the channel code recognize such fences so it can turn them into hardware waits.
//!
//! Fences created by jobs carry an execution context id made from the client's hardware module
//! and the submitting file's context number. The device reserves
//! `DRM_CONTEXTS_MAX * MODULES_MAX` fence contexts for this at probe time.

use core::any::Any;
use kernel::{
    dma_fence::{Fence, FenceOps},
    prelude::*,
};

use crate::syncpt::Syncpoint;

/// Number of per-file contexts.
pub const DRM_CONTEXTS_MAX: u64 = 128;
/// Number of hardware modules.
pub const MODULES_MAX: u64 = 32;
/// Total number of fence contexts reserved by a device.
pub const CONTEXTS_TOTAL: u64 = DRM_CONTEXTS_MAX * MODULES_MAX;

const DRIVER_NAME: &str = "tegra-host1x";

/// The timeline jobs from one file on one hardware module execute on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ExecutionContext {
    base: u64,
    module: u32,
    drm_ctx: u32,
}

impl ExecutionContext {
    /// Builds the context for file context `drm_ctx` on hardware module `module`.
    pub fn new(base: u64, module: u32, drm_ctx: u32) -> Result<ExecutionContext> {
        if module as u64 >= MODULES_MAX || drm_ctx as u64 >= DRM_CONTEXTS_MAX {
            return Err(EINVAL);
        }
        Ok(ExecutionContext {
            base,
            module,
            drm_ctx,
        })
    }

    /// Returns the fence context id.
    pub fn value(&self) -> u64 {
        self.base + self.module as u64 * DRM_CONTEXTS_MAX + self.drm_ctx as u64
    }

    /// Returns whether a fence from `context` is implicitly ordered before work on this context.
    ///
    /// That is the case for fences from the same file context, which are submitted in order, and
    /// for fences from the same hardware module, which executes jobs in order.
    pub fn matches(&self, context: u64) -> bool {
        let rel = context.wrapping_sub(self.base);
        if rel >= CONTEXTS_TOTAL {
            return false;
        }

        let drm_ctx = rel & (DRM_CONTEXTS_MAX - 1);
        let module = rel & !(DRM_CONTEXTS_MAX - 1);

        drm_ctx == self.drm_ctx as u64 || module == self.module as u64 * DRM_CONTEXTS_MAX
    }
}

/// Fence ops for a syncpoint threshold.
pub struct Host1xFence {
    sp: Arc<Syncpoint>,
    thresh: u32,
}

impl Host1xFence {
    /// Returns the syncpoint the fence waits on.
    pub fn syncpt(&self) -> &Arc<Syncpoint> {
        &self.sp
    }

    /// Returns the threshold the fence waits for.
    pub fn threshold(&self) -> u32 {
        self.thresh
    }
}

impl FenceOps for Host1xFence {
    fn driver_name(&self) -> &str {
        DRIVER_NAME
    }

    fn timeline_name(&self) -> &str {
        self.sp.name()
    }

    fn signaled(&self) -> bool {
        self.sp.is_expired(self.thresh)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Creates a fence that signals once `sp` reaches `thresh`.
pub fn create(sp: &Arc<Syncpoint>, thresh: u32, context: u64, seqno: u64) -> Fence {
    Fence::new(
        context,
        seqno,
        Host1xFence {
            sp: sp.clone(),
            thresh,
        },
    )
}

/// Returns the syncpoint wait behind `fence`, if the hardware can wait for it directly.
pub fn host1x_wait(fence: &Fence) -> Option<(Arc<Syncpoint>, u32)> {
    fence
        .ops::<Host1xFence>()
        .map(|f| (f.sp.clone(), f.thresh))
}

/// Returns whether the hardware can wait for `fence` directly.
pub fn is_waitable(fence: &Fence) -> bool {
    fence.ops::<Host1xFence>().is_some()
}
