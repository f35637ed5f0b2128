// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Software host1x
//!
//! Executes push buffers against an in-memory syncpoint file. Each channel runs its jobs in
//! submission order. A job only starts once every `WAIT_SYNCPT` it contains is satisfied; it then
//! performs the increments its gathers declared and the increments written by the push buffer
//! itself. Jobs run either as soon as they are submitted or when [`SimHost::process`] is called,
//! which lets tests hold work back and observe in-flight state.

use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use kernel::{prelude::*, sync::Mutex};
use std::collections::{BTreeMap, VecDeque};

use super::{class, uclass, CdmaJob, Host1xHardware, Op};
use crate::debug::*;

const DEBUG_CLASS: DebugFlags = DebugFlags::Sim;

#[derive(Default)]
struct SimState {
    queues: BTreeMap<u32, VecDeque<CdmaJob>>,
    history: Vec<CdmaJob>,
}

/// A software host1x.
pub struct SimHost {
    syncpts: Vec<AtomicU32>,
    auto_complete: AtomicBool,
    state: Mutex<SimState>,
}

impl SimHost {
    /// Creates a host with `num_syncpts` syncpoints, all at zero.
    pub fn new(num_syncpts: u32, auto_complete: bool) -> Arc<SimHost> {
        Arc::new(SimHost {
            syncpts: (0..num_syncpts).map(|_| AtomicU32::new(0)).collect(),
            auto_complete: AtomicBool::new(auto_complete),
            state: Mutex::new(SimState::default()),
        })
    }

    /// Selects whether jobs run as soon as they are submitted.
    pub fn set_auto_complete(&self, auto: bool) {
        self.auto_complete.store(auto, Ordering::Relaxed);
        if auto {
            self.process();
        }
    }

    /// Runs every job that can run, returning how many completed.
    pub fn process(&self) -> usize {
        let mut state = self.state.lock();
        let mut done = 0;
        loop {
            let mut progress = false;
            for queue in state.queues.values_mut() {
                while let Some(job) = queue.front() {
                    if !self.ready(job) {
                        break;
                    }
                    if let Some(job) = queue.pop_front() {
                        self.execute(&job);
                        done += 1;
                        progress = true;
                    }
                }
            }
            if !progress {
                return done;
            }
        }
    }

    /// Number of jobs that have not run yet.
    pub fn pending(&self) -> usize {
        self.state.lock().queues.values().map(|q| q.len()).sum()
    }

    /// Every job submitted so far.
    pub fn history(&self) -> Vec<CdmaJob> {
        self.state.lock().history.clone()
    }

    /// Increments a syncpoint as if an engine outside the driver's control had.
    pub fn hw_incr(&self, id: u32) {
        if let Some(sp) = self.syncpts.get(id as usize) {
            sp.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn value(&self, id: u32) -> u32 {
        self.syncpts
            .get(id as usize)
            .map_or(0, |sp| sp.load(Ordering::Acquire))
    }

    /// Walks the push buffer, calling `write` for every register write with the current class.
    fn walk(job: &CdmaJob, mut write: impl FnMut(u32, u32, u32)) -> Result {
        let mut class = 0;
        let mut i = 0;
        let words = &job.pushbuf;

        while i < words.len() {
            let op = Op::decode(words[i]);
            i += 1;
            let payload = op.payload() as usize;
            if i + payload > words.len() {
                return Err(EINVAL);
            }
            let data = &words[i..i + payload];
            i += payload;

            match op {
                Op::SetClass { class: c, offset, mask } => {
                    class = c;
                    masked(offset, mask, data, |reg, val| write(class, reg, val));
                }
                Op::Mask { offset, mask } => {
                    masked(offset, mask, data, |reg, val| write(class, reg, val))
                }
                Op::Incr { offset, .. } => {
                    for (j, val) in data.iter().enumerate() {
                        write(class, offset + j as u32, *val);
                    }
                }
                Op::NonIncr { offset, .. } => {
                    for val in data {
                        write(class, offset, *val);
                    }
                }
                Op::Imm { offset, value } => write(class, offset, value),
                Op::Gather { .. } => {}
                Op::Restart | Op::Extend | Op::Invalid(_) => return Err(EINVAL),
            }
        }
        Ok(())
    }

    fn ready(&self, job: &CdmaJob) -> bool {
        let mut ready = true;
        let res = Self::walk(job, |class, reg, val| {
            if class == class::HOST1X && reg == uclass::WAIT_SYNCPT {
                let (id, thresh) = (val >> 24, val & 0xff_ffff);
                let cur = self.value(id) & 0xff_ffff;
                if (cur.wrapping_sub(thresh) << 8) as i32 >= 0 {
                    return;
                }
                ready = false;
            }
        });
        // Malformed jobs are dropped by `execute`.
        res.is_err() || ready
    }

    fn execute(&self, job: &CdmaJob) {
        for _ in 0..job.user_incrs {
            self.hw_incr(job.syncpt_id);
        }
        let res = Self::walk(job, |_class, reg, val| {
            if reg == uclass::INCR_SYNCPT {
                self.hw_incr(val & 0xff);
            }
        });
        match res {
            Ok(()) => mod_pr_debug!(
                "sim: channel {} job done, syncpt {} = {} (end {})",
                job.channel,
                job.syncpt_id,
                self.value(job.syncpt_id),
                job.syncpt_end
            ),
            Err(_) => pr_err!(
                "sim: channel {}: malformed push buffer, job dropped",
                job.channel
            ),
        }
    }
}

fn masked(offset: u32, mask: u32, data: &[u32], mut write: impl FnMut(u32, u32)) {
    let regs = (0..16).filter(|bit| mask & (1 << bit) != 0);
    for (bit, val) in regs.zip(data) {
        write(offset + bit, *val);
    }
}

impl Host1xHardware for SimHost {
    fn num_syncpts(&self) -> u32 {
        self.syncpts.len() as u32
    }

    fn submit(&self, job: CdmaJob) -> Result {
        {
            let mut state = self.state.lock();
            state.history.try_reserve(1)?;
            state.history.push(job.clone());
            state.queues.entry(job.channel).or_default().push_back(job);
        }
        if self.auto_complete.load(Ordering::Relaxed) {
            self.process();
        }
        Ok(())
    }

    fn syncpt_load(&self, id: u32) -> u32 {
        self.value(id)
    }

    fn syncpt_cpu_incr(&self, id: u32) {
        self.hw_incr(id)
    }
}
