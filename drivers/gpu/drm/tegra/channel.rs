// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! host1x channels
//!
//! A channel feeds one engine. Submitting a job builds its push buffer: optional waits (for the
//! previous work on the job's syncpoint, and for host1x fences the job depends on), one `GATHER`
//! per gather with a class switch wherever the class changes, and a final syncpoint increment that
//! marks the job done. The channel keeps submitted jobs in flight until their syncpoint passes
//! the job's end value, then releases their pins.

use kernel::{device::Device, prelude::*, sync::Mutex};
use std::collections::VecDeque;

use crate::{
    debug::*,
    fence,
    hw::{class, opcode, uclass, CdmaJob, Host1xHardware},
    job::Job,
};

const DEBUG_CLASS: DebugFlags = DebugFlags::Channel;

/// A host1x channel.
pub struct Channel {
    id: u32,
    dev: Device,
    hw: Arc<dyn Host1xHardware>,
    /// Serializes syncpoint reservation and queueing, so jobs reach the hardware in `max` order.
    submit_lock: Mutex<()>,
    inflight: Mutex<VecDeque<Arc<Job>>>,
}

fn push(pb: &mut Vec<u32>, words: &[u32]) -> Result {
    pb.try_reserve(words.len())?;
    pb.extend_from_slice(words);
    Ok(())
}

fn push_wait(pb: &mut Vec<u32>, id: u32, thresh: u32) -> Result {
    push(
        pb,
        &[
            opcode::setclass(class::HOST1X, uclass::WAIT_SYNCPT, 1),
            uclass::wait_syncpt(id, thresh),
        ],
    )
}

impl Channel {
    /// Creates channel `id`.
    pub fn new(dev: &Device, id: u32, hw: Arc<dyn Host1xHardware>) -> Channel {
        Channel {
            id,
            dev: dev.clone(),
            hw,
            submit_lock: Mutex::new(()),
            inflight: Mutex::new(VecDeque::new()),
        }
    }

    /// Returns the channel index.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Number of jobs submitted but not yet reaped.
    pub fn inflight(&self) -> usize {
        self.inflight.lock().len()
    }

    fn push_fences(&self, job: &Job, pb: &mut Vec<u32>) -> Result {
        for f in job.fences() {
            if f.is_signaled() {
                continue;
            }
            let (sp, thresh) = fence::host1x_wait(f).ok_or_else(|| {
                dev_err!(self.dev, "channel {}: job fence {:?} is not a host1x fence", self.id, f);
                EINVAL
            })?;
            mod_dev_dbg!(
                self.dev,
                "channel {}: waiting for syncpt {} >= {}",
                self.id,
                sp.id(),
                thresh
            );
            push_wait(pb, sp.id(), thresh)?;
        }
        Ok(())
    }

    fn push_gathers(job: &Job, pb: &mut Vec<u32>) -> Result {
        let mut class = 0;

        for g in job.gathers() {
            if class != g.class {
                class = g.class;
                // SETCLASS needs a following word before the next opcode.
                push(pb, &[opcode::setclass(class, 0, 0), opcode::nonincr(0, 0)])?;
            }
            push(pb, &[opcode::gather(g.words), g.address() as u32])?;
        }
        Ok(())
    }

    /// Queues `job` on the channel.
    ///
    /// The job must be pinned. On success it is tracked as in flight until
    /// [`Channel::update`] sees it complete.
    pub fn submit(&self, mut job: Job) -> Result<Arc<Job>> {
        let _guard = self.submit_lock.lock();
        let sp = job.syncpt().clone();
        let mut pb = Vec::new();

        if job.serialize() {
            push_wait(&mut pb, sp.id(), sp.read_max())?;
        }
        self.push_fences(&job, &mut pb)?;

        let incrs = job.syncpt_incrs() + 1;
        let end = sp.incr_max(incrs);
        job.set_syncpt_end(end);

        let built = Self::push_gathers(&job, &mut pb).and_then(|_| {
            push(
                &mut pb,
                &[
                    opcode::nonincr(uclass::INCR_SYNCPT, 1),
                    uclass::incr_syncpt(uclass::COND_OP_DONE, sp.id()),
                ],
            )
        });

        let res = built.and_then(|_| {
            self.hw.submit(CdmaJob {
                channel: self.id,
                pushbuf: pb,
                syncpt_id: sp.id(),
                syncpt_end: end,
                user_incrs: job.syncpt_incrs(),
            })
        });

        if let Err(e) = res {
            // The increments are already reserved. Perform them so later waiters are not stuck.
            dev_err!(self.dev, "channel {}: submit failed: {:?}", self.id, e);
            for _ in 0..incrs {
                sp.cpu_incr();
            }
            return Err(e);
        }

        mod_dev_dbg!(
            self.dev,
            "channel {}: job queued, syncpt {} end {}",
            self.id,
            sp.id(),
            end
        );
        debug! {
            job.dump();
        }

        let job = Arc::new(job);
        let mut inflight = self.inflight.lock();
        inflight.try_reserve(1)?;
        inflight.push_back(job.clone());
        Ok(job)
    }

    /// Reaps completed jobs, releasing their pins. Returns how many were reaped.
    pub fn update(&self) -> usize {
        let mut inflight = self.inflight.lock();
        let before = inflight.len();

        inflight.retain(|job| {
            if !job.is_complete() {
                return true;
            }
            job.complete();
            false
        });

        let reaped = before - inflight.len();
        if reaped > 0 {
            mod_dev_dbg!(self.dev, "channel {}: reaped {} jobs", self.id, reaped);
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::{Client, ClientKind},
        fence::create,
        gem::{Backing, Object},
        hw::{sim::SimHost, Op},
        mmu::AddressSpace,
        syncpt::SyncptManager,
        util::PageMemory,
    };
    use core::time::Duration;
    use kernel::{dma_fence::context_alloc, PAGE_SIZE};

    struct Setup {
        dev: Device,
        host: Arc<SimHost>,
        mgr: SyncptManager,
        vm: Arc<AddressSpace>,
        client: Arc<Client>,
    }

    fn setup(auto: bool) -> Setup {
        let _ = env_logger::builder().is_test(true).try_init();
        let dev = Device::new("channel-test");
        let host = SimHost::new(8, auto);
        let mgr = SyncptManager::new(host.clone());
        let client = Client::new(ClientKind::Gr2d, 0, &mgr).unwrap();
        let vm = AddressSpace::new(dev.clone(), 0x4000_0000, 64 * PAGE_SIZE as u64, true).unwrap();
        Setup {
            dev,
            host,
            mgr,
            vm,
            client,
        }
    }

    fn job(s: &Setup) -> Job {
        let sp = s.client.syncpts()[0].clone();
        let cmd = Object::new(&s.vm, PAGE_SIZE, Backing::Pages).unwrap();
        cmd.write_words(
            0,
            &[
                opcode::nonincr(uclass::INCR_SYNCPT, 1),
                uclass::incr_syncpt(uclass::COND_OP_DONE, sp.id()),
            ],
        )
        .unwrap();
        let mut job = Job::new(&s.dev, &s.client, &sp, 1, 1, 0).unwrap();
        job.add_gather(cmd, 2, 0).unwrap();
        job
    }

    #[test]
    fn push_buffer_layout() {
        let s = setup(true);
        let ch = Channel::new(&s.dev, 0, s.host.clone());
        let mut j = job(&s);
        j.set_serialize(true);
        j.pin(true).unwrap();
        let addr = j.gathers()[0].address() as u32;

        let j = ch.submit(j).unwrap();
        assert_eq!(j.syncpt_end(), 2);

        let hist = s.host.history();
        let id = j.syncpt().id();
        assert_eq!(
            hist[0].pushbuf,
            vec![
                opcode::setclass(class::HOST1X, uclass::WAIT_SYNCPT, 1),
                uclass::wait_syncpt(id, 0),
                opcode::setclass(class::GR2D, 0, 0),
                opcode::nonincr(0, 0),
                opcode::gather(2),
                addr,
                opcode::nonincr(uclass::INCR_SYNCPT, 1),
                uclass::incr_syncpt(uclass::COND_OP_DONE, id),
            ]
        );
        assert!(matches!(Op::decode(hist[0].pushbuf[4]), Op::Gather { count: 2 }));

        j.wait(Some(Duration::from_secs(1))).unwrap();
        assert_eq!(ch.update(), 1);
        assert_eq!(j.num_pins(), 0);
    }

    #[test]
    fn host1x_fences_become_waits() {
        let s = setup(false);
        let ch = Channel::new(&s.dev, 0, s.host.clone());
        let other = s.mgr.alloc("other", false).unwrap();
        let thresh = other.incr_max(1);
        let ctx = context_alloc(1);

        let mut j = job(&s);
        j.add_fence(create(&other, thresh, ctx, 1)).unwrap();
        j.pin(true).unwrap();
        let j = ch.submit(j).unwrap();

        let hist = s.host.history();
        let pb = &hist[0].pushbuf;
        assert_eq!(pb[1], uclass::wait_syncpt(other.id(), thresh));

        // Blocked behind the fence.
        assert_eq!(s.host.process(), 0);
        assert_eq!(ch.update(), 0);
        assert_eq!(ch.inflight(), 1);

        other.incr();
        assert_eq!(s.host.process(), 1);
        assert!(j.is_complete());
        assert_eq!(ch.update(), 1);
        assert_eq!(ch.inflight(), 0);
    }

    #[test]
    fn signaled_fences_are_skipped() {
        let s = setup(true);
        let ch = Channel::new(&s.dev, 0, s.host.clone());
        let other = s.mgr.alloc("other", false).unwrap();

        let mut j = job(&s);
        j.add_fence(create(&other, 0, context_alloc(1), 1)).unwrap();
        j.pin(true).unwrap();
        ch.submit(j).unwrap();

        let hist = s.host.history();
        let pb = &hist[0].pushbuf;
        assert_eq!(pb[0], opcode::setclass(class::GR2D, 0, 0));
    }
}
