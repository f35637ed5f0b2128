// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Top-level device implementation.
//!
//! A [`TegraDevice`] ties the shared state of one host1x instance together: the syncpoint
//! allocator, the GART address space every buffer is mapped into, the engine clients with their
//! channels, and the fence context range reserved for job fences.

use core::sync::atomic::{AtomicU64, Ordering};
use kernel::{
    device::Device,
    dma_fence,
    prelude::*,
    sync::Mutex,
};

use crate::{
    channel::Channel,
    client::{Client, ClientKind},
    debug::{self, *},
    fence::{CONTEXTS_TOTAL, DRM_CONTEXTS_MAX},
    hw::Host1xHardware,
    mmu::AddressSpace,
    syncpt::SyncptManager,
    Params,
};

const DEBUG_CLASS: DebugFlags = DebugFlags::File;

/// Engines instantiated on every device, with the channel each one submits through.
const CLIENTS: &[(ClientKind, u32)] = &[(ClientKind::Gr2d, 0), (ClientKind::Gr3d, 1)];

/// Driver state of one host1x instance.
pub struct TegraDevice {
    dev: Device,
    params: Params,
    hw: Arc<dyn Host1xHardware>,
    syncpts: SyncptManager,
    vm: Arc<AddressSpace>,
    clients: Vec<Arc<Client>>,
    channels: Vec<Channel>,
    fence_context_base: u64,
    fence_seqno: AtomicU64,
    drm_contexts: Mutex<u128>,
}

impl TegraDevice {
    /// Brings up the device on top of `hw`.
    pub fn probe(
        name: &str,
        params: Params,
        hw: Arc<dyn Host1xHardware>,
    ) -> Result<Arc<TegraDevice>> {
        params.validate()?;
        debug::update_debug_flags(&params);

        let dev = Device::new(name);
        let syncpts = SyncptManager::new(hw.clone());
        let vm = AddressSpace::new(
            dev.clone(),
            params.iova_start,
            params.iova_size,
            params.dynamic_iommu_mapping,
        )?;

        let mut clients = Vec::new();
        clients.try_reserve_exact(CLIENTS.len())?;
        let mut channels = Vec::new();
        channels.try_reserve_exact(CLIENTS.len())?;
        for &(kind, channel) in CLIENTS {
            clients.push(Client::new(kind, channel, &syncpts)?);
            channels.push(Channel::new(&dev, channel, hw.clone()));
        }

        let fence_context_base = dma_fence::context_alloc(CONTEXTS_TOTAL);

        dev_info!(
            dev,
            "host1x: {} syncpts, GART {:#x}+{:#x} ({} mapping), firewall {}",
            hw.num_syncpts(),
            params.iova_start,
            params.iova_size,
            if params.dynamic_iommu_mapping { "dynamic" } else { "static" },
            if params.firewall { "on" } else { "off" }
        );

        Ok(Arc::new(TegraDevice {
            dev,
            params,
            hw,
            syncpts,
            vm,
            clients,
            channels,
            fence_context_base,
            fence_seqno: AtomicU64::new(0),
            drm_contexts: Mutex::new(0),
        }))
    }

    /// Returns the underlying device.
    pub fn dev(&self) -> &Device {
        &self.dev
    }

    /// Returns the driver parameters.
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Returns the hardware backend.
    pub fn hw(&self) -> &Arc<dyn Host1xHardware> {
        &self.hw
    }

    /// Returns the syncpoint allocator.
    pub fn syncpts(&self) -> &SyncptManager {
        &self.syncpts
    }

    /// Returns the GART address space.
    pub fn vm(&self) -> &Arc<AddressSpace> {
        &self.vm
    }

    /// Returns every client.
    pub fn clients(&self) -> &[Arc<Client>] {
        &self.clients
    }

    /// Returns the client running jobs of class `class`.
    pub fn client_by_class(&self, class: u32) -> Result<&Arc<Client>> {
        self.clients
            .iter()
            .find(|c| c.class() == class)
            .ok_or(ENODEV)
    }

    /// Returns channel `id`.
    pub fn channel(&self, id: u32) -> Result<&Channel> {
        self.channels.iter().find(|c| c.id() == id).ok_or(ENODEV)
    }

    /// Returns the first of the fence contexts reserved for jobs.
    pub fn fence_context_base(&self) -> u64 {
        self.fence_context_base
    }

    /// Returns the next job fence sequence number.
    pub fn next_fence_seqno(&self) -> u64 {
        self.fence_seqno.fetch_add(1, Ordering::Relaxed)
    }

    /// Allocates a per-file context number.
    pub(crate) fn alloc_drm_context(&self) -> Result<u32> {
        let mut used = self.drm_contexts.lock();
        let free = (!*used).trailing_zeros();
        if free as u64 >= DRM_CONTEXTS_MAX {
            dev_warn!(self.dev, "out of DRM contexts");
            return Err(ENOSPC);
        }
        *used |= 1u128 << free;
        mod_dev_dbg!(self.dev, "allocated DRM context {}", free);
        Ok(free)
    }

    /// Releases a per-file context number.
    pub(crate) fn free_drm_context(&self, ctx: u32) {
        if (ctx as u64) < DRM_CONTEXTS_MAX {
            *self.drm_contexts.lock() &= !(1u128 << ctx);
        }
    }

    /// Reaps completed jobs on every channel. Returns how many were reaped.
    pub fn update(&self) -> usize {
        self.channels.iter().map(|c| c.update()).sum()
    }
}

impl Drop for TegraDevice {
    fn drop(&mut self) {
        for client in &self.clients {
            for sp in client.syncpts() {
                self.syncpts.free(sp);
            }
        }
        mod_dev_dbg!(self.dev, "device removed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::{class, sim::SimHost};

    #[test]
    fn probe_and_contexts() {
        let host = SimHost::new(16, true);
        let tdev = TegraDevice::probe("tegra-test", Params::default(), host).unwrap();
        assert_eq!(tdev.clients().len(), 2);
        assert!(tdev.client_by_class(class::GR3D).is_ok());
        assert_eq!(tdev.client_by_class(0x30).err(), Some(ENODEV));
        assert_eq!(tdev.channel(1).map(|c| c.id()), Ok(1));

        let a = tdev.alloc_drm_context().unwrap();
        let b = tdev.alloc_drm_context().unwrap();
        assert_ne!(a, b);
        tdev.free_drm_context(a);
        assert_eq!(tdev.alloc_drm_context(), Ok(a));
    }

    #[test]
    fn contexts_run_out() {
        let tdev = TegraDevice::probe("tegra-test", Params::default(), SimHost::new(8, true)).unwrap();
        for _ in 0..DRM_CONTEXTS_MAX {
            tdev.alloc_drm_context().unwrap();
        }
        assert_eq!(tdev.alloc_drm_context(), Err(ENOSPC));
    }
}
