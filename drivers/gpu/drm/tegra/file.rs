// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! File implementation, which represents a single DRM client.
//!
//! Each open file owns a buffer handle table, the channel contexts it opened, the fences it
//! received from submissions and a per-file context number that tags its job fences.

use core::time::Duration;
use kernel::{dma_fence::Fence, prelude::*, sync::Mutex, time};
use std::collections::BTreeMap;

use crate::{
    client::Client,
    debug::*,
    driver::TegraDevice,
    gem::{self, Backing, Tiling},
    submit,
    uapi::{self, GemCreateFlags, SubmitFlags},
};

const DEBUG_CLASS: DebugFlags = DebugFlags::File;

/// A channel context: the client a file submits to.
pub struct Context {
    client: Arc<Client>,
}

impl Context {
    /// Returns the client.
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }
}

struct Table<T> {
    next: u32,
    items: BTreeMap<u32, T>,
}

impl<T: Clone> Table<T> {
    fn new() -> Table<T> {
        Table {
            next: 1,
            items: BTreeMap::new(),
        }
    }

    fn insert(&mut self, item: T) -> Result<u32> {
        let id = self.next;
        self.next = id.checked_add(1).ok_or(ENOSPC)?;
        self.items.insert(id, item);
        Ok(id)
    }

    fn get(&self, id: u32) -> Result<T> {
        self.items.get(&id).cloned().ok_or(ENOENT)
    }

    fn remove(&mut self, id: u32) -> Result<T> {
        self.items.remove(&id).ok_or(ENOENT)
    }
}

/// State associated with a client.
pub struct File {
    device: Arc<TegraDevice>,
    drm_context: u32,
    objects: gem::Registry,
    contexts: Mutex<Table<Arc<Context>>>,
    fences: Mutex<Table<Fence>>,
}

fn timeout_ms(ms: u32) -> Option<Duration> {
    match ms {
        u32::MAX => None,
        ms => time::msecs_to_timeout(ms),
    }
}

impl File {
    /// Create a new `File` instance for a fresh client.
    pub fn open(device: &Arc<TegraDevice>) -> Result<File> {
        let drm_context = device.alloc_drm_context()?;

        mod_dev_dbg!(device.dev(), "[File {}]: DRM device opened", drm_context);
        Ok(File {
            device: device.clone(),
            drm_context,
            objects: gem::Registry::new(),
            contexts: Mutex::new(Table::new()),
            fences: Mutex::new(Table::new()),
        })
    }

    /// Returns the per-file context number.
    pub fn drm_context(&self) -> u32 {
        self.drm_context
    }

    /// Returns the buffer handle table.
    pub fn objects(&self) -> &gem::Registry {
        &self.objects
    }

    /// Looks up the buffer behind `handle`.
    pub fn object(&self, handle: u32) -> Result<Arc<gem::Object>> {
        self.objects.lookup(handle)
    }

    /// Looks up the fence behind `handle`.
    pub fn fence(&self, handle: u32) -> Result<Fence> {
        self.fences.lock().get(handle)
    }

    /// Registers `fence` with the file, returning its handle.
    pub fn import_fence(&self, fence: Fence) -> Result<u32> {
        self.fences.lock().insert(fence)
    }

    /// Drops a fence handle.
    pub fn close_fence(&self, handle: u32) -> Result {
        self.fences.lock().remove(handle).map(|_| ())
    }

    fn context(&self, handle: u64) -> Result<Arc<Context>> {
        self.contexts.lock().get(u32::try_from(handle)?)
    }

    /// IOCTL: open_channel: Open a context on the engine of the given class.
    pub fn open_channel(
        device: &TegraDevice,
        data: &mut uapi::OpenChannel,
        file: &File,
    ) -> Result<u32> {
        let client = device.client_by_class(data.client)?.clone();
        let handle = file.contexts.lock().insert(Arc::new(Context { client }))?;
        data.context = handle as u64;

        mod_dev_dbg!(
            device.dev(),
            "[File {}]: IOCTL: open_channel class={:#x} context={}",
            file.drm_context,
            data.client,
            handle
        );
        Ok(0)
    }

    /// IOCTL: close_channel: Close a context.
    pub fn close_channel(
        device: &TegraDevice,
        data: &mut uapi::CloseChannel,
        file: &File,
    ) -> Result<u32> {
        mod_dev_dbg!(
            device.dev(),
            "[File {}]: IOCTL: close_channel context={}",
            file.drm_context,
            data.context
        );
        file.contexts
            .lock()
            .remove(u32::try_from(data.context)?)
            .map(|_| 0)
    }

    /// IOCTL: get_syncpt: Return the id of one of the context's syncpoints.
    pub fn get_syncpt(
        _device: &TegraDevice,
        data: &mut uapi::GetSyncpt,
        file: &File,
    ) -> Result<u32> {
        let context = file.context(data.context)?;
        let sp = context
            .client
            .syncpts()
            .get(data.index as usize)
            .ok_or(EINVAL)?;
        data.id = sp.id();
        Ok(0)
    }

    /// IOCTL: syncpt_read: Read the current value of a syncpoint.
    pub fn syncpt_read(
        device: &TegraDevice,
        data: &mut uapi::SyncptRead,
        _file: &File,
    ) -> Result<u32> {
        let sp = device.syncpts().get(data.id)?;
        data.value = sp.load();
        Ok(0)
    }

    /// IOCTL: syncpt_incr: Increment a syncpoint from the CPU.
    pub fn syncpt_incr(
        device: &TegraDevice,
        data: &mut uapi::SyncptIncr,
        _file: &File,
    ) -> Result<u32> {
        let sp = device.syncpts().get(data.id)?;
        sp.incr();
        Ok(0)
    }

    /// IOCTL: syncpt_wait: Wait for a syncpoint to reach a threshold.
    pub fn syncpt_wait(
        device: &TegraDevice,
        data: &mut uapi::SyncptWait,
        _file: &File,
    ) -> Result<u32> {
        let sp = device.syncpts().get(data.id)?;
        data.value = sp.wait(data.thresh, timeout_ms(data.timeout), true)?;
        Ok(0)
    }

    /// IOCTL: submit: Submit a job to a context.
    pub fn submit(device: &TegraDevice, data: &mut uapi::Submit, file: &File) -> Result<u32> {
        let context = file.context(data.context)?;

        mod_dev_dbg!(
            device.dev(),
            "[File {}]: IOCTL: submit context={} cmdbufs={} relocs={} flags={:?}",
            file.drm_context,
            data.context,
            data.cmdbufs.len(),
            data.relocs.len(),
            data.flags
        );

        let in_fence = match data.flags.contains(SubmitFlags::WAIT_FENCE) {
            true => Some(file.fence(data.fence)?),
            false => None,
        };

        let res = submit::submit(
            device,
            &file.objects,
            file.drm_context,
            &context.client,
            data,
            in_fence,
        );

        let submitted = match res {
            Ok(s) => s,
            Err(e) => {
                if e != ERESTARTSYS {
                    dev_info!(
                        device.dev(),
                        "[File {}]: IOCTL: submit failed! (err: {:?})",
                        file.drm_context,
                        e
                    );
                }
                return Err(e);
            }
        };

        data.fence = match data.flags.contains(SubmitFlags::CREATE_FENCE) {
            true => {
                let (context, seqno) = (submitted.fence.context(), submitted.fence.seqno());
                let handle = file.import_fence(submitted.fence)?;
                cls_pr_debug!(
                    Fence,
                    "[File {}]: fence {}:{} installed as handle {}",
                    file.drm_context,
                    context,
                    seqno,
                    handle
                );
                handle
            }
            false => submitted.job.syncpt_end(),
        };
        Ok(0)
    }

    /// IOCTL: gem_create: Create a new GEM object.
    pub fn gem_create(
        device: &TegraDevice,
        data: &mut uapi::GemCreate,
        file: &File,
    ) -> Result<u32> {
        mod_dev_dbg!(
            device.dev(),
            "[File {}]: IOCTL: gem_create size={:#x} flags={:?}",
            file.drm_context,
            data.size,
            data.flags
        );

        let backing = match data.flags.contains(GemCreateFlags::CONTIGUOUS) {
            true => Backing::Contiguous,
            false => Backing::Pages,
        };
        let bo = gem::Object::new(device.vm(), usize::try_from(data.size)?, backing)?;
        if data.flags.contains(GemCreateFlags::TILED) {
            bo.set_tiling(Tiling::Tiled);
        }

        data.handle = file.objects.insert(bo)?;
        Ok(0)
    }

    /// IOCTL: gem_close: Drop a GEM handle.
    pub fn gem_close(
        _device: &TegraDevice,
        data: &mut uapi::GemClose,
        file: &File,
    ) -> Result<u32> {
        file.objects.release(data.handle)?;
        Ok(0)
    }

    /// IOCTL: gem_set_tiling: Set the tiling mode of a GEM object.
    pub fn gem_set_tiling(
        _device: &TegraDevice,
        data: &mut uapi::GemTiling,
        file: &File,
    ) -> Result<u32> {
        let tiling = Tiling::from_raw(data.mode, data.value)?;
        file.objects.lookup(data.handle)?.set_tiling(tiling);
        Ok(0)
    }

    /// IOCTL: gem_get_tiling: Get the tiling mode of a GEM object.
    pub fn gem_get_tiling(
        _device: &TegraDevice,
        data: &mut uapi::GemTiling,
        file: &File,
    ) -> Result<u32> {
        let bo = file.objects.lookup(data.handle)?;
        (data.mode, data.value) = bo.tiling().to_raw();
        Ok(0)
    }

    /// IOCTL: gem_cpu_prep: Wait until the CPU may access a GEM object.
    ///
    /// Writers wait for every fence, readers for the last writer. A zero timeout only polls and
    /// returns `EBUSY` if the object is still in use.
    pub fn gem_cpu_prep(
        device: &TegraDevice,
        data: &mut uapi::GemCpuPrep,
        file: &File,
    ) -> Result<u32> {
        let bo = file.objects.lookup(data.handle)?;
        let timeout = time::msecs_to_timeout(data.timeout);
        let res = bo.resv().wait_timeout(data.write, true, timeout);
        if let Err(e) = res {
            mod_dev_dbg!(
                device.dev(),
                "[File {}]: IOCTL: gem_cpu_prep handle={} busy ({:?})",
                file.drm_context,
                data.handle,
                e
            );
        }
        res.map(|_| 0)
    }
}

impl Drop for File {
    fn drop(&mut self) {
        mod_dev_dbg!(self.device.dev(), "[File {}]: Closing...", self.drm_context);
        self.objects.clear();
        self.device.free_drm_context(self.drm_context);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{hw::sim::SimHost, Params};
    use kernel::PAGE_SIZE;

    fn device() -> Arc<TegraDevice> {
        TegraDevice::probe("file-test", Params::default(), SimHost::new(8, true)).unwrap()
    }

    #[test]
    fn gem_lifecycle() {
        let tdev = device();
        let file = File::open(&tdev).unwrap();

        let mut create = uapi::GemCreate {
            size: 100,
            flags: GemCreateFlags::TILED,
            ..Default::default()
        };
        File::gem_create(&tdev, &mut create, &file).unwrap();
        let bo = file.object(create.handle).unwrap();
        assert_eq!(bo.size(), PAGE_SIZE);

        let mut tiling = uapi::GemTiling {
            handle: create.handle,
            ..Default::default()
        };
        File::gem_get_tiling(&tdev, &mut tiling, &file).unwrap();
        assert_eq!((tiling.mode, tiling.value), (uapi::tiling::TILED, 0));

        tiling.mode = uapi::tiling::BLOCK;
        tiling.value = 9;
        assert_eq!(File::gem_set_tiling(&tdev, &mut tiling, &file), Err(EINVAL));
        tiling.value = 4;
        File::gem_set_tiling(&tdev, &mut tiling, &file).unwrap();
        assert_eq!(bo.tiling(), Tiling::Block { height: 4 });

        let mut prep = uapi::GemCpuPrep {
            handle: create.handle,
            timeout: 0,
            write: true,
        };
        assert_eq!(File::gem_cpu_prep(&tdev, &mut prep, &file), Ok(0));

        let mut close = uapi::GemClose {
            handle: create.handle,
        };
        File::gem_close(&tdev, &mut close, &file).unwrap();
        assert_eq!(File::gem_close(&tdev, &mut close, &file), Err(ENOENT));
    }

    #[test]
    fn channels_and_syncpoints() {
        let tdev = device();
        let file = File::open(&tdev).unwrap();

        let mut open = uapi::OpenChannel {
            client: 0x51,
            ..Default::default()
        };
        File::open_channel(&tdev, &mut open, &file).unwrap();

        let mut get = uapi::GetSyncpt {
            context: open.context,
            ..Default::default()
        };
        File::get_syncpt(&tdev, &mut get, &file).unwrap();

        let mut incr = uapi::SyncptIncr { id: get.id };
        File::syncpt_incr(&tdev, &mut incr, &file).unwrap();
        let mut read = uapi::SyncptRead {
            id: get.id,
            ..Default::default()
        };
        File::syncpt_read(&tdev, &mut read, &file).unwrap();
        assert_eq!(read.value, 1);

        // Nothing beyond the current value was queued yet, so a higher threshold has passed.
        let mut wait = uapi::SyncptWait {
            id: get.id,
            thresh: 2,
            timeout: 0,
            ..Default::default()
        };
        File::syncpt_wait(&tdev, &mut wait, &file).unwrap();
        assert_eq!(wait.value, 1);

        let sp = tdev.syncpts().get(get.id).unwrap();
        assert_eq!(sp.incr_max(1), 2);
        assert_eq!(File::syncpt_wait(&tdev, &mut wait, &file), Err(EAGAIN));
        wait.thresh = 1;
        File::syncpt_wait(&tdev, &mut wait, &file).unwrap();
        assert_eq!(wait.value, 1);

        File::syncpt_incr(&tdev, &mut incr, &file).unwrap();
        wait.thresh = 2;
        File::syncpt_wait(&tdev, &mut wait, &file).unwrap();
        assert_eq!(wait.value, 2);

        let mut close = uapi::CloseChannel {
            context: open.context,
        };
        File::close_channel(&tdev, &mut close, &file).unwrap();
        assert_eq!(File::get_syncpt(&tdev, &mut get, &file), Err(ENOENT));

        open.client = 0x30;
        assert_eq!(File::open_channel(&tdev, &mut open, &file), Err(ENODEV));
    }

    #[test]
    fn files_get_distinct_contexts() {
        let tdev = device();
        let a = File::open(&tdev).unwrap();
        let b = File::open(&tdev).unwrap();
        assert_ne!(a.drm_context(), b.drm_context());
        let ctx = a.drm_context();
        drop(a);
        let c = File::open(&tdev).unwrap();
        assert_eq!(c.drm_context(), ctx);
    }
}
