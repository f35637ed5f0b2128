// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! host1x jobs
//!
//! A job is the unit of submission: a list of gathers (spans of command words inside buffer
//! objects), the relocations that patch buffer addresses into those words, the syncpoint
//! increments the job performs and the fences the hardware must wait for before running it.
//!
//! Pinning a job makes every buffer it references visible to the engine, runs the firewall and
//! applies the relocations. With the firewall enabled, gathers are not pinned at all: their
//! content is copied into a driver-owned buffer, validated there, and the relocations are
//! patched into that copy, so user space cannot change a stream after it has been checked.
//!
//! Once handed to a channel the job is shared (`Arc`) between the submitter and the channel's
//! in-flight list. Its pins are dropped when it completes, or when it is dropped unsubmitted.

use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use kernel::{
    device::Device,
    dma_fence::Fence,
    prelude::*,
    sync::Mutex,
};

use crate::{
    client::Client,
    debug::*,
    firewall::{self, GatherCopy},
    gem::{BoId, Object},
    syncpt::Syncpoint,
    util::PageMemory,
};

const DEBUG_CLASS: DebugFlags = DebugFlags::Job;

/// A span of command words inside a buffer object.
#[derive(Debug)]
pub struct Gather {
    /// Buffer holding the words.
    pub bo: Arc<Object>,
    /// Byte offset of the first word.
    pub offset: u32,
    /// Number of words.
    pub words: u32,
    /// Class the words execute in.
    pub class: u32,
    base: u64,
    copy_offset: Option<usize>,
    handled: bool,
}

impl Gather {
    /// Device address the channel fetches the gather from.
    pub fn address(&self) -> u64 {
        match self.copy_offset {
            Some(off) => self.base + off as u64,
            None => self.base + self.offset as u64,
        }
    }

    /// Byte offset of the gather's words inside the firewall copy, if there is one.
    pub fn copy_offset(&self) -> Option<usize> {
        self.copy_offset
    }

    /// Returns whether the buffer byte offset `offset` lies inside the gather.
    pub fn contains(&self, bo: BoId, offset: u64) -> bool {
        let start = self.offset as u64;
        bo == self.bo.id() && offset >= start && offset < start + self.words as u64 * 4
    }
}

/// One side of a relocation: a buffer and a byte offset into it.
#[derive(Clone, Debug)]
pub struct RelocBuf {
    /// The buffer.
    pub bo: Arc<Object>,
    /// Byte offset.
    pub offset: u64,
}

/// Patch the word at `cmdbuf` with `(address of target) >> shift`.
#[derive(Clone, Debug)]
pub struct Reloc {
    /// Location of the word to patch.
    pub cmdbuf: RelocBuf,
    /// Location whose device address is written.
    pub target: RelocBuf,
    /// Right shift applied to the address.
    pub shift: u32,
}

/// A host1x job.
pub struct Job {
    dev: Device,
    client: Arc<Client>,
    syncpt: Arc<Syncpoint>,
    syncpt_incrs: u32,
    syncpt_end: u32,
    timeout: Duration,
    serialize: bool,
    gathers: Vec<Gather>,
    relocs: Vec<Reloc>,
    fences: Vec<Fence>,
    reloc_addr_phys: Vec<u64>,
    unpins: Mutex<Vec<Arc<Object>>>,
    gather_copy: Option<GatherCopy>,
    completed: AtomicBool,
}

impl Job {
    /// Allocates a job with room for `num_cmdbufs` gathers and `num_relocs` relocations.
    pub fn new(
        dev: &Device,
        client: &Arc<Client>,
        syncpt: &Arc<Syncpoint>,
        syncpt_incrs: u32,
        num_cmdbufs: usize,
        num_relocs: usize,
    ) -> Result<Job> {
        let mut gathers = Vec::new();
        gathers.try_reserve_exact(num_cmdbufs)?;
        let mut relocs = Vec::new();
        relocs.try_reserve_exact(num_relocs)?;
        let mut unpins = Vec::new();
        unpins.try_reserve_exact(num_relocs + num_cmdbufs)?;

        Ok(Job {
            dev: dev.clone(),
            client: client.clone(),
            syncpt: syncpt.clone(),
            syncpt_incrs,
            syncpt_end: 0,
            timeout: Duration::from_millis(10000),
            serialize: false,
            gathers,
            relocs,
            fences: Vec::new(),
            reloc_addr_phys: Vec::new(),
            unpins: Mutex::new(unpins),
            gather_copy: None,
            completed: AtomicBool::new(false),
        })
    }

    /// Appends a gather of `words` words at byte `offset` of `bo`.
    pub fn add_gather(&mut self, bo: Arc<Object>, words: u32, offset: u32) -> Result {
        self.gathers.try_reserve(1)?;
        self.gathers.push(Gather {
            bo,
            offset,
            words,
            class: self.client.class(),
            base: 0,
            copy_offset: None,
            handled: false,
        });
        Ok(())
    }

    /// Appends a relocation.
    pub fn add_reloc(&mut self, reloc: Reloc) -> Result {
        self.relocs.try_reserve(1)?;
        self.relocs.push(reloc);
        Ok(())
    }

    /// Makes the job wait for `fence` in hardware before it starts.
    pub fn add_fence(&mut self, fence: Fence) -> Result {
        self.fences.try_reserve(1)?;
        self.fences.push(fence);
        Ok(())
    }

    /// Sets the job timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Makes the job wait for all previous work on its syncpoint.
    pub fn set_serialize(&mut self, serialize: bool) {
        self.serialize = serialize;
    }

    pub(crate) fn set_syncpt_end(&mut self, end: u32) {
        self.syncpt_end = end;
    }

    /// Returns the device the job was created on.
    pub fn dev(&self) -> &Device {
        &self.dev
    }

    /// Returns the client the job runs on.
    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Returns the syncpoint the job increments.
    pub fn syncpt(&self) -> &Arc<Syncpoint> {
        &self.syncpt
    }

    /// Returns the number of increments the gathers perform.
    pub fn syncpt_incrs(&self) -> u32 {
        self.syncpt_incrs
    }

    /// Returns the syncpoint value reached once the job has completed. Valid once submitted.
    pub fn syncpt_end(&self) -> u32 {
        self.syncpt_end
    }

    /// Returns the job timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Returns whether the job waits for all previous work on its syncpoint.
    pub fn serialize(&self) -> bool {
        self.serialize
    }

    /// Returns the gathers.
    pub fn gathers(&self) -> &[Gather] {
        &self.gathers
    }

    /// Returns the relocations.
    pub fn relocs(&self) -> &[Reloc] {
        &self.relocs
    }

    /// Returns the fences the hardware waits for.
    pub fn fences(&self) -> &[Fence] {
        &self.fences
    }

    /// Returns the validated copy of the gathers, if the firewall made one.
    pub fn gather_copy(&self) -> Option<&GatherCopy> {
        self.gather_copy.as_ref()
    }

    /// Returns the words the engine will fetch for gather `index`.
    pub fn gather_content(&self, index: usize) -> Result<Vec<u32>> {
        let g = self.gathers.get(index).ok_or(EINVAL)?;
        match (&self.gather_copy, g.copy_offset) {
            (Some(copy), Some(off)) => copy.read_words(off, g.words as usize),
            _ => g.bo.read_words(g.offset as usize, g.words as usize),
        }
    }

    /// Number of buffer pins currently held.
    pub fn num_pins(&self) -> usize {
        self.unpins.lock().len()
    }

    fn pin_job(&mut self, firewall: bool) -> Result {
        let mut addrs = Vec::new();
        addrs.try_reserve_exact(self.relocs.len())?;

        for reloc in &self.relocs {
            let bo = reloc.target.bo.clone();
            let iova = bo.pin()?;
            addrs.push(iova);
            self.unpins.lock().push(bo);
        }
        self.reloc_addr_phys = addrs;

        // Gather content is copied by the firewall, no need to pin it.
        if firewall {
            return Ok(());
        }

        for g in &mut self.gathers {
            let bo = g.bo.clone();
            g.base = bo.pin()?;
            self.unpins.lock().push(bo);
        }
        Ok(())
    }

    fn reloc_addr(&self, index: usize) -> u32 {
        let reloc = &self.relocs[index];
        ((self.reloc_addr_phys[index] + reloc.target.offset) >> reloc.shift) as u32
    }

    /// Patches the relocations of gather `index` into its firewall copy.
    fn do_relocs_copy(&self, index: usize, copy: &GatherCopy) -> Result {
        let g = &self.gathers[index];
        let copy_offset = g.copy_offset.ok_or(EINVAL)?;

        for (i, reloc) in self.relocs.iter().enumerate() {
            if !g.contains(reloc.cmdbuf.bo.id(), reloc.cmdbuf.offset) {
                continue;
            }
            let pos = copy_offset + (reloc.cmdbuf.offset - g.offset as u64) as usize;
            copy.write_word(pos, self.reloc_addr(i))?;
        }
        Ok(())
    }

    /// Patches every relocation pointing into the buffer of gather `index`.
    fn do_relocs_bo(&self, index: usize) -> Result {
        let cmdbuf = &self.gathers[index].bo;

        for (i, reloc) in self.relocs.iter().enumerate() {
            if reloc.cmdbuf.bo.id() != cmdbuf.id() {
                continue;
            }
            cmdbuf.write_word(reloc.cmdbuf.offset as usize, self.reloc_addr(i))?;
        }
        Ok(())
    }

    fn pin_inner(&mut self, firewall: bool) -> Result {
        firewall::check_job(self)?;
        self.pin_job(firewall)?;

        if firewall {
            let (copy, offsets) = firewall::copy_gathers(self)?;
            for (g, off) in self.gathers.iter_mut().zip(offsets) {
                g.base = copy.phys();
                g.copy_offset = Some(off);
            }
            for i in 0..self.gathers.len() {
                self.do_relocs_copy(i, &copy)?;
            }
            self.gather_copy = Some(copy);
            return Ok(());
        }

        for i in 0..self.gathers.len() {
            if self.gathers[i].handled {
                continue;
            }
            let (id, base) = (self.gathers[i].bo.id(), self.gathers[i].base);
            for g in self.gathers[i + 1..].iter_mut() {
                if g.bo.id() == id {
                    g.handled = true;
                    g.base = base;
                }
            }
            self.do_relocs_bo(i)?;
        }
        Ok(())
    }

    /// Pins every buffer the job references, runs the firewall and applies the relocations.
    ///
    /// On failure every pin taken is dropped again.
    pub fn pin(&mut self, firewall: bool) -> Result {
        let res = self.pin_inner(firewall);
        if let Err(e) = res {
            mod_dev_dbg!(self.dev, "job: pin failed: {:?}", e);
            self.unpin();
        }
        res
    }

    /// Drops all buffer pins held by the job.
    pub fn unpin(&self) {
        let unpins = core::mem::take(&mut *self.unpins.lock());
        for bo in unpins.iter() {
            bo.unpin();
        }
    }

    /// Returns whether the job has completed.
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire) || self.syncpt.is_expired(self.syncpt_end)
    }

    /// Marks the job completed and drops its pins.
    pub fn complete(&self) {
        if self.completed.swap(true, Ordering::AcqRel) {
            return;
        }
        mod_dev_dbg!(
            self.dev,
            "job: syncpt {} reached {}, releasing {} pins",
            self.syncpt.id(),
            self.syncpt_end,
            self.num_pins()
        );
        self.unpin();
    }

    /// Waits for the job to complete, then releases its pins.
    ///
    /// `None` uses the job timeout. Returns `ETIMEDOUT` if the job does not complete in time.
    pub fn wait(&self, timeout: Option<Duration>) -> Result {
        let timeout = timeout.unwrap_or(self.timeout);
        self.syncpt.wait(self.syncpt_end, Some(timeout), true)?;
        self.complete();
        Ok(())
    }

    /// Logs the job state.
    pub fn dump(&self) {
        dev_dbg!(self.dev, "    SYNCPT_ID   {}", self.syncpt.id());
        dev_dbg!(self.dev, "    SYNCPT_VAL  {}", self.syncpt_end);
        dev_dbg!(self.dev, "    TIMEOUT     {}", self.timeout.as_millis());
        dev_dbg!(self.dev, "    NUM_FENCES  {}", self.fences.len());
        dev_dbg!(self.dev, "    NUM_HANDLES {}", self.num_pins());
    }
}

impl Drop for Job {
    fn drop(&mut self) {
        self.unpin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::ClientKind,
        hw::{class, opcode, sim::SimHost, uclass},
        mmu::AddressSpace,
        syncpt::SyncptManager,
        gem::Backing,
    };
    use kernel::PAGE_SIZE;

    struct Setup {
        dev: Device,
        vm: Arc<AddressSpace>,
        client: Arc<Client>,
        _mgr: SyncptManager,
    }

    fn setup() -> Setup {
        let dev = Device::new("job-test");
        let host = SimHost::new(4, true);
        let mgr = SyncptManager::new(host);
        let client = Client::new(ClientKind::Gr2d, 0, &mgr).unwrap();
        let vm = AddressSpace::new(dev.clone(), 0x4000_0000, 16 * PAGE_SIZE as u64, true).unwrap();
        Setup {
            dev,
            vm,
            client,
            _mgr: mgr,
        }
    }

    /// A stream writing DSTA_BASE_ADDR (reloc at word 1) and finishing with an increment.
    fn stream(sp: u32) -> Vec<u32> {
        vec![
            opcode::setclass(class::GR2D, 0x2b, 1),
            0,
            opcode::nonincr(uclass::INCR_SYNCPT, 1),
            uclass::incr_syncpt(uclass::COND_OP_DONE, sp),
        ]
    }

    fn job_with_reloc(s: &Setup, cmd_offset: u32) -> (Job, Arc<Object>, Arc<Object>) {
        let sp = s.client.syncpts()[0].clone();
        let cmd = Object::new(&s.vm, PAGE_SIZE, Backing::Pages).unwrap();
        cmd.write_words(cmd_offset as usize, &stream(sp.id())).unwrap();
        let target = Object::new(&s.vm, 2 * PAGE_SIZE, Backing::Contiguous).unwrap();

        let mut job = Job::new(&s.dev, &s.client, &sp, 1, 1, 1).unwrap();
        job.add_gather(cmd.clone(), 4, cmd_offset).unwrap();
        job.add_reloc(Reloc {
            cmdbuf: RelocBuf {
                bo: cmd.clone(),
                offset: cmd_offset as u64 + 4,
            },
            target: RelocBuf {
                bo: target.clone(),
                offset: 0x40,
            },
            shift: 0,
        })
        .unwrap();
        (job, cmd, target)
    }

    #[test]
    fn firewall_patches_copy_only() {
        let s = setup();
        let (mut job, cmd, target) = job_with_reloc(&s, 0x100);
        job.pin(true).unwrap();

        // Only the relocation target is pinned.
        assert_eq!(job.num_pins(), 1);
        let content = job.gather_content(0).unwrap();
        assert_eq!(content[1], (target.iova() + 0x40) as u32);
        assert_eq!(cmd.read_word(0x104), Ok(0));
        let copy = job.gather_copy().unwrap();
        assert_eq!(job.gathers()[0].address(), copy.phys());

        job.complete();
        assert_eq!(job.num_pins(), 0);
        assert!(s.vm.is_cached(target.id()));
    }

    #[test]
    fn direct_patches_buffer() {
        let s = setup();
        let (mut job, cmd, target) = job_with_reloc(&s, 0);
        job.pin(false).unwrap();
        assert_eq!(job.num_pins(), 2);
        assert_eq!(cmd.read_word(4), Ok((target.iova() + 0x40) as u32));
        assert_eq!(job.gathers()[0].address(), cmd.iova());
        drop(job);
        assert_eq!(s.vm.pin_count(cmd.id()), 0);
    }

    #[test]
    fn failed_pin_releases_everything() {
        let s = setup();
        let (mut job, _cmd, target) = job_with_reloc(&s, 0);
        // Too few declared relocations for the stream.
        job.relocs.clear();
        assert_eq!(job.pin(true), Err(EINVAL));
        assert_eq!(job.num_pins(), 0);
        assert_eq!(s.vm.pin_count(target.id()), 0);
    }
}
