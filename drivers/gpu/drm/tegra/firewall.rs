// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Command stream firewall
//!
//! User space builds command streams in buffers it keeps mapped, so the driver cannot trust them:
//! a stream could write arbitrary addresses into engine registers, increment syncpoints it does
//! not own, or make the channel jump somewhere else. The firewall works in two passes:
//!
//! 1. [`check_job`] verifies that every gather and relocation lies inside its buffer.
//! 2. [`copy_gathers`] copies all gathers into one driver-owned buffer and walks the copy word by
//!    word. Address registers may only be written at the exact locations named by relocations,
//!    syncpoint increments must target the client's syncpoints and add up to the declared count,
//!    and opcodes that redirect the command DMA are rejected.
//!
//! The channel fetches the copy, never the user buffer, so the stream cannot change after it has
//! been checked.

use kernel::prelude::*;

use crate::{
    client::Client,
    debug::*,
    hw::{uclass, Op, GATHER_MAX_WORDS},
    job::{Gather, Job},
    util::{self, PageMemory, Pages},
};

const DEBUG_CLASS: DebugFlags = DebugFlags::Firewall;

/// A reason for rejecting a command stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    /// A gather starts with no syncpoint increments left to perform.
    #[error("no syncpoint increments left")]
    NoIncrsLeft,
    /// `SETCLASS` to a class the job may not use.
    #[error("invalid class {0:#x}")]
    Class(u32),
    /// A write mask or count runs past the end of the gather.
    #[error("invalid write mask")]
    Mask,
    /// An opcode that redirects the command DMA.
    #[error("forbidden command")]
    Forbidden,
    /// An opcode the hardware does not know.
    #[error("invalid command {0:#x}")]
    InvalidCommand(u32),
    /// An increment of a syncpoint the client does not own.
    #[error("syncpoint {0} not owned by the client")]
    ForeignSyncpt(u32),
    /// More syncpoint increments than declared.
    #[error("too many syncpoint increments")]
    TooManyIncrs,
    /// The final increment is not the last word of the last gather.
    #[error("final syncpoint increment is not the last command")]
    LastIncrPosition,
    /// The final increment does not wait for the engine to finish.
    #[error("final syncpoint increment has condition {0}, expected OP_DONE")]
    LastIncrCondition(u32),
    /// An address register written through an immediate.
    #[error("immediate write to address register {0:#x}")]
    ImmediateAddress(u32),
    /// An address register written with no relocation left.
    #[error("address register {0:#x} written without a relocation")]
    MissingReloc(u32),
    /// An address register written somewhere the next relocation does not point to.
    #[error("relocation mismatch on address register {0:#x}")]
    RelocMismatch(u32),
    /// A syncpoint wait from user space.
    #[error("syncpoint wait not allowed")]
    Wait,
}

impl From<Violation> for Error {
    fn from(_: Violation) -> Error {
        EINVAL
    }
}

type FwResult<T = ()> = core::result::Result<T, Violation>;

/// The driver-owned copy of a job's gathers.
pub struct GatherCopy {
    mem: Pages,
    phys: u64,
}

impl GatherCopy {
    fn new(size: usize) -> Result<GatherCopy> {
        Ok(GatherCopy {
            mem: Pages::new(size)?,
            phys: util::alloc_phys(size),
        })
    }

    /// Device address of the first word.
    pub fn phys(&self) -> u64 {
        self.phys
    }
}

impl PageMemory for GatherCopy {
    fn size(&self) -> usize {
        self.mem.size()
    }

    fn with_page(&self, page: usize, f: &mut dyn FnMut(&mut [u8])) -> Result {
        self.mem.with_page(page, f)
    }
}

/// Logs up to `max` words of a gather, decoded.
fn dump_gather(index: usize, mem: &dyn PageMemory, offset: usize, words: u32, max: u32) {
    let count = words.min(max) as usize;
    pr_info!(
        "host1x firewall: gather #{}: {} words at {:#x}{}",
        index,
        words,
        offset,
        if count < words as usize { " (truncated)" } else { "" }
    );
    if !debug_enabled(DebugFlags::Firewall) && !debug_enabled(DebugFlags::TraceCmdbuf) {
        return;
    }
    match mem.read_words(offset, count) {
        Ok(data) => {
            for (i, w) in data.iter().enumerate() {
                pr_info!("    {:#08x}: {:08x} {:?}", offset + i * 4, w, Op::decode(*w));
            }
        }
        Err(e) => pr_info!("    unreadable: {:?}", e),
    }
}

fn dump_gathers_bo(job: &Job) {
    for (i, g) in job.gathers().iter().enumerate() {
        let avail = (g.bo.size() as u64).saturating_sub(g.offset as u64) / 4;
        dump_gather(
            i,
            &*g.bo,
            g.offset as usize,
            g.words,
            avail.min(g.words as u64) as u32,
        );
    }
}

fn check_gather_bounds(g: &Gather) -> bool {
    g.offset & 3 == 0
        && g.words <= GATHER_MAX_WORDS
        && g.offset as u64 + g.words as u64 * 4 <= g.bo.size() as u64
}

fn check_reloc_bounds(offset: u64, size: usize) -> bool {
    offset & 3 == 0 && offset < size as u64
}

/// Checks that every gather and relocation of `job` lies inside its buffer.
pub fn check_job(job: &Job) -> Result {
    let gathers_ok = job.gathers().iter().all(check_gather_bounds);
    let relocs_ok = job.relocs().iter().all(|r| {
        check_reloc_bounds(r.target.offset, r.target.bo.size())
            && check_reloc_bounds(r.cmdbuf.offset, r.cmdbuf.bo.size())
    });

    if gathers_ok && relocs_ok {
        return Ok(());
    }

    dump_gathers_bo(job);
    dev_err!(job.dev(), "Job checking failed");
    Err(EINVAL)
}

/// Walk state over the gathers of one job.
struct Firewall<'a> {
    job: &'a Job,
    client: &'a Client,
    class: u32,
    /// Index of the next relocation to consume.
    reloc: usize,
    syncpt_incrs: u32,
    /// Current gather.
    gather: usize,
    words: &'a [u32],
    /// Index of the next unconsumed word in `words`.
    pos: usize,
}

impl<'a> Firewall<'a> {
    fn remaining(&self) -> usize {
        self.words.len() - self.pos
    }

    fn is_last_gather(&self) -> bool {
        self.gather + 1 == self.job.gathers().len()
    }

    /// Byte offset of the current word inside the gather's buffer.
    fn bo_offset(&self) -> u64 {
        self.job.gathers()[self.gather].offset as u64 + self.pos as u64 * 4
    }

    fn check_incr_syncpt(&mut self, value: u32, immediate: bool) -> FwResult {
        let cond = value >> 8 & 0xff;
        let id = value & 0xff;

        if self.syncpt_incrs == 0 {
            return Err(Violation::TooManyIncrs);
        }
        if self.syncpt_incrs == 1 {
            // Data words are checked before they are consumed, immediates after.
            let left = if immediate { 0 } else { 1 };
            if !self.is_last_gather() || self.remaining() != left {
                return Err(Violation::LastIncrPosition);
            }
            if cond != uclass::COND_OP_DONE {
                return Err(Violation::LastIncrCondition(cond));
            }
        }
        if !self.client.owns_syncpt(id) {
            return Err(Violation::ForeignSyncpt(id));
        }
        self.syncpt_incrs -= 1;
        Ok(())
    }

    fn check_reloc(&mut self, reg: u32) -> FwResult {
        let reloc = self
            .job
            .relocs()
            .get(self.reloc)
            .ok_or(Violation::MissingReloc(reg))?;
        let gather = &self.job.gathers()[self.gather];

        if reloc.cmdbuf.bo.id() != gather.bo.id()
            || reloc.cmdbuf.offset != self.bo_offset()
            || reloc.shift != 0
        {
            return Err(Violation::RelocMismatch(reg));
        }
        self.reloc += 1;
        Ok(())
    }

    /// Checks one register write. `value` is the word written.
    fn check_register(&mut self, reg: u32, value: u32, immediate: bool) -> FwResult {
        if reg == uclass::INCR_SYNCPT {
            return self.check_incr_syncpt(value, immediate);
        }
        if self.client.is_addr_reg(self.class, reg) {
            if immediate {
                return Err(Violation::ImmediateAddress(reg));
            }
            return self.check_reloc(reg);
        }
        if reg == uclass::WAIT_SYNCPT {
            return Err(Violation::Wait);
        }
        Ok(())
    }

    fn check_data(&mut self, reg: u32) -> FwResult {
        if self.remaining() == 0 {
            return Err(Violation::Mask);
        }
        let value = self.words[self.pos];
        self.check_register(reg, value, false)?;
        self.pos += 1;
        Ok(())
    }

    fn check_mask(&mut self, offset: u32, mask: u32) -> FwResult {
        for bit in (0..16).filter(|bit| mask & (1 << bit) != 0) {
            self.check_data(offset + bit)?;
        }
        Ok(())
    }

    fn check_class(&self, class: u32) -> FwResult {
        match self.client.is_valid_class(class) {
            true => Ok(()),
            false => Err(Violation::Class(class)),
        }
    }

    fn validate_gather(&mut self) -> FwResult {
        if self.syncpt_incrs == 0 {
            return Err(Violation::NoIncrsLeft);
        }

        while self.remaining() > 0 {
            let op = Op::decode(self.words[self.pos]);
            self.pos += 1;

            match op {
                Op::SetClass { class, offset, mask } => {
                    self.check_class(class)?;
                    self.class = class;
                    self.check_mask(offset, mask)?;
                }
                Op::Incr { offset, count } => {
                    for i in 0..count {
                        self.check_data(offset + i)?;
                    }
                }
                Op::NonIncr { offset, count } => {
                    for _ in 0..count {
                        self.check_data(offset)?;
                    }
                }
                Op::Mask { offset, mask } => self.check_mask(offset, mask)?,
                Op::Imm { offset, value } => self.check_register(offset, value, true)?,
                Op::Restart | Op::Gather { .. } | Op::Extend => {
                    return Err(Violation::Forbidden)
                }
                Op::Invalid(op) => return Err(Violation::InvalidCommand(op)),
            }
        }
        Ok(())
    }
}

/// Copies all gathers of `job` into a driver-owned buffer and validates the copy.
///
/// Returns the copy and the byte offset of each gather inside it.
pub fn copy_gathers(job: &Job) -> Result<(GatherCopy, Vec<usize>)> {
    let size: usize = job.gathers().iter().map(|g| g.words as usize * 4).sum();
    let copy = GatherCopy::new(size)?;

    let mut offsets = Vec::new();
    offsets.try_reserve_exact(job.gathers().len())?;

    let mut pos = 0;
    for g in job.gathers() {
        let words = g.bo.read_words(g.offset as usize, g.words as usize)?;
        copy.write_words(pos, &words)?;
        offsets.push(pos);
        pos += g.words as usize * 4;
    }

    let mut contents = Vec::new();
    contents.try_reserve_exact(job.gathers().len())?;
    for (g, off) in job.gathers().iter().zip(&offsets) {
        contents.push(copy.read_words(*off, g.words as usize)?);
    }

    let mut fw = Firewall {
        job,
        client: job.client(),
        class: job.client().class(),
        reloc: 0,
        syncpt_incrs: job.syncpt_incrs(),
        gather: 0,
        words: &[],
        pos: 0,
    };
    let mut checked = 0;

    for (i, g) in job.gathers().iter().enumerate() {
        fw.gather = i;
        fw.class = g.class;
        fw.words = &contents[i];
        fw.pos = 0;

        let res = fw.validate_gather();
        checked += fw.pos;

        if let Err(v) = res {
            for (j, g) in job.gathers()[..=i].iter().enumerate() {
                dump_gather(j, &copy, offsets[j], g.words, GATHER_MAX_WORDS);
            }
            fw_err!("{}", v);
            dev_err!(
                job.dev(),
                "Command stream validation failed at word #{} of gather #{}, checked {} words totally",
                fw.pos.saturating_sub(1),
                i,
                checked
            );
            return Err(v.into());
        }

        if debug_enabled(DebugFlags::TraceCmdbuf) {
            dump_gather(i, &copy, offsets[i], g.words, GATHER_MAX_WORDS);
        }
    }

    let relocs_left = job.relocs().len() - fw.reloc;
    if relocs_left > 0 || fw.syncpt_incrs > 0 {
        for (j, g) in job.gathers().iter().enumerate() {
            dump_gather(j, &copy, offsets[j], g.words, GATHER_MAX_WORDS);
        }
        if relocs_left > 0 {
            fw_err!("{} relocations left", relocs_left);
        }
        if fw.syncpt_incrs > 0 {
            fw_err!("{} syncpoint increments left", fw.syncpt_incrs);
        }
        dev_err!(job.dev(), "Command stream validation failed");
        return Err(EINVAL);
    }

    mod_dev_dbg!(
        job.dev(),
        "firewall: {} gathers, {} words validated",
        job.gathers().len(),
        checked
    );
    Ok((copy, offsets))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::ClientKind,
        gem::{Backing, Object},
        hw::{class, opcode, sim::SimHost},
        job::{Reloc, RelocBuf},
        mmu::AddressSpace,
        syncpt::SyncptManager,
    };
    use kernel::{device::Device, PAGE_SIZE};

    struct Setup {
        dev: Device,
        vm: Arc<AddressSpace>,
        client: Arc<Client>,
        other: Arc<Client>,
        _mgr: SyncptManager,
    }

    fn setup() -> Setup {
        let _ = env_logger::builder().is_test(true).try_init();
        let dev = Device::new("fw-test");
        let mgr = SyncptManager::new(SimHost::new(8, true));
        let client = Client::new(ClientKind::Gr2d, 0, &mgr).unwrap();
        let other = Client::new(ClientKind::Gr3d, 1, &mgr).unwrap();
        let vm = AddressSpace::new(dev.clone(), 0x4000_0000, 64 * PAGE_SIZE as u64, true).unwrap();
        Setup {
            dev,
            vm,
            client,
            other,
            _mgr: mgr,
        }
    }

    fn sp(s: &Setup) -> u32 {
        s.client.syncpts()[0].id()
    }

    fn last_incr(id: u32) -> [u32; 2] {
        [
            opcode::nonincr(uclass::INCR_SYNCPT, 1),
            uclass::incr_syncpt(uclass::COND_OP_DONE, id),
        ]
    }

    /// Builds a job with a single gather holding `words`, and `relocs` as
    /// `(word index, shift)` pairs.
    fn job(s: &Setup, words: &[u32], incrs: u32, relocs: &[(u64, u32)]) -> Job {
        let cmd = Object::new(&s.vm, PAGE_SIZE, Backing::Pages).unwrap();
        cmd.write_words(0, words).unwrap();
        let target = Object::new(&s.vm, PAGE_SIZE, Backing::Pages).unwrap();
        let sp = s.client.syncpts()[0].clone();

        let mut job = Job::new(&s.dev, &s.client, &sp, incrs, 1, relocs.len()).unwrap();
        job.add_gather(cmd.clone(), words.len() as u32, 0).unwrap();
        for &(word, shift) in relocs {
            job.add_reloc(Reloc {
                cmdbuf: RelocBuf {
                    bo: cmd.clone(),
                    offset: word * 4,
                },
                target: RelocBuf {
                    bo: target.clone(),
                    offset: 0,
                },
                shift,
            })
            .unwrap();
        }
        job
    }

    fn validate(job: &Job) -> Result {
        check_job(job)?;
        copy_gathers(job).map(|_| ())
    }

    #[test]
    fn accepts_well_formed_stream() {
        let s = setup();
        let mut words = vec![
            opcode::setclass(class::GR2D, 0, 0),
            opcode::incr(0x2b, 1),
            0xdead_0000,
            opcode::imm(0x40, 0x1234),
        ];
        words.extend(last_incr(sp(&s)));
        let job = job(&s, &words, 1, &[(2, 0)]);
        let (copy, offsets) = copy_gathers(&job).unwrap();
        assert_eq!(offsets, vec![0]);
        assert_eq!(copy.read_words(0, words.len()).unwrap(), words);
    }

    #[test]
    fn immediate_final_increment() {
        let s = setup();
        let words = [opcode::imm(
            uclass::INCR_SYNCPT,
            uclass::incr_syncpt(uclass::COND_OP_DONE, sp(&s)),
        )];
        assert_eq!(validate(&job(&s, &words, 1, &[])), Ok(()));
    }

    #[test]
    fn rejects_address_write_without_reloc() {
        let s = setup();
        let mut words = vec![opcode::setclass(class::GR2D, 0x2b, 1), 0x1000];
        words.extend(last_incr(sp(&s)));
        assert_eq!(validate(&job(&s, &words, 1, &[])), Err(EINVAL));
    }

    #[test]
    fn rejects_mismatched_or_shifted_reloc() {
        let s = setup();
        let mut words = vec![opcode::setclass(class::GR2D, 0x2b, 1), 0x1000];
        words.extend(last_incr(sp(&s)));
        assert_eq!(validate(&job(&s, &words, 1, &[(0, 0)])), Err(EINVAL));
        assert_eq!(validate(&job(&s, &words, 1, &[(1, 4)])), Err(EINVAL));
        assert_eq!(validate(&job(&s, &words, 1, &[(1, 0)])), Ok(()));
    }

    #[test]
    fn rejects_immediate_address() {
        let s = setup();
        let mut words = vec![opcode::imm(0x2b, 0x10)];
        words.extend(last_incr(sp(&s)));
        assert_eq!(validate(&job(&s, &words, 1, &[])), Err(EINVAL));
    }

    #[test]
    fn syncpoint_rules() {
        let s = setup();
        let id = sp(&s);
        let foreign = s.other.syncpts()[0].id();

        // Foreign syncpoint.
        assert_eq!(validate(&job(&s, &last_incr(foreign), 1, &[])), Err(EINVAL));
        // Final increment must wait for the engine.
        let words = [
            opcode::nonincr(uclass::INCR_SYNCPT, 1),
            uclass::incr_syncpt(uclass::COND_IMMEDIATE, id),
        ];
        assert_eq!(validate(&job(&s, &words, 1, &[])), Err(EINVAL));
        // Final increment must be the last word.
        let mut words = last_incr(id).to_vec();
        words.push(opcode::imm(0x40, 0));
        assert_eq!(validate(&job(&s, &words, 1, &[])), Err(EINVAL));
        // Declared more increments than performed.
        assert_eq!(validate(&job(&s, &last_incr(id), 2, &[])), Err(EINVAL));
        // Two increments, the first one may be immediate.
        let words = [
            opcode::nonincr(uclass::INCR_SYNCPT, 2),
            uclass::incr_syncpt(uclass::COND_IMMEDIATE, id),
            uclass::incr_syncpt(uclass::COND_OP_DONE, id),
        ];
        assert_eq!(validate(&job(&s, &words, 2, &[])), Ok(()));
    }

    #[test]
    fn rejects_forbidden_commands() {
        let s = setup();
        for bad in [opcode::gather(4), 0x5000_0000, 0xe000_0000, 0x7000_0000] {
            let mut words = vec![bad];
            words.extend(last_incr(sp(&s)));
            assert_eq!(validate(&job(&s, &words, 1, &[])), Err(EINVAL));
        }
    }

    #[test]
    fn rejects_wait_and_foreign_class() {
        let s = setup();
        let mut words = vec![opcode::nonincr(uclass::WAIT_SYNCPT, 1), 0];
        words.extend(last_incr(sp(&s)));
        assert_eq!(validate(&job(&s, &words, 1, &[])), Err(EINVAL));

        let mut words = vec![opcode::setclass(class::GR3D, 0, 0)];
        words.extend(last_incr(sp(&s)));
        assert_eq!(validate(&job(&s, &words, 1, &[])), Err(EINVAL));
    }

    #[test]
    fn class_switch_selects_address_registers() {
        let s = setup();

        // The source-buffer class shares the address registers of the 2D class.
        let mut words = vec![opcode::setclass(class::GR2D_SB, 0x48, 1), 0x1000];
        words.extend(last_incr(sp(&s)));
        assert_eq!(validate(&job(&s, &words, 1, &[])), Err(EINVAL));
        assert_eq!(validate(&job(&s, &words, 1, &[(1, 0)])), Ok(()));

        let mut words = vec![
            opcode::setclass(class::GR2D_SB, 0, 0),
            opcode::incr(0x2e, 1),
            0x1234,
            opcode::setclass(class::GR2D, 0x2b, 1),
            0,
        ];
        words.extend(last_incr(sp(&s)));
        assert_eq!(validate(&job(&s, &words, 1, &[(4, 0)])), Ok(()));
    }

    #[test]
    fn rejects_truncated_payload() {
        let s = setup();
        let words = [opcode::incr(0x40, 3), 0, 0];
        assert_eq!(validate(&job(&s, &words, 1, &[])), Err(EINVAL));
    }

    #[test]
    fn bounds_checks() {
        let s = setup();
        let mut j = job(&s, &last_incr(sp(&s)), 1, &[]);
        let bo = j.gathers()[0].bo.clone();
        j.add_gather(bo.clone(), 2, 2).unwrap();
        assert_eq!(check_job(&j), Err(EINVAL));

        let mut j = job(&s, &last_incr(sp(&s)), 1, &[]);
        j.add_gather(bo.clone(), GATHER_MAX_WORDS + 1, 0).unwrap();
        assert_eq!(check_job(&j), Err(EINVAL));

        let mut j = job(&s, &last_incr(sp(&s)), 1, &[]);
        j.add_gather(bo.clone(), 2, PAGE_SIZE as u32 - 4).unwrap();
        assert_eq!(check_job(&j), Err(EINVAL));

        let mut j = job(&s, &last_incr(sp(&s)), 1, &[]);
        j.add_reloc(Reloc {
            cmdbuf: RelocBuf {
                bo: bo.clone(),
                offset: PAGE_SIZE as u64,
            },
            target: RelocBuf { bo, offset: 0 },
            shift: 0,
        })
        .unwrap();
        assert_eq!(check_job(&j), Err(EINVAL));
    }
}
