// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Job submission
//!
//! Turns a user submission into a queued job:
//!
//! - resolve handles and build the job and its reservation list,
//! - lock every buffer and make room for the new fences,
//! - order the job after the fences already on the buffers, either through hardware syncpoint
//!   waits (host1x fences) or by waiting on the CPU (anything else),
//! - pin, validate and relocate, then queue the job on the client's channel,
//! - publish the job fence on the buffers: exclusive for writes, shared for reads.
//!
//! Fences from the submitting file context, or from the same hardware module, are already
//! ordered with the new job and are not waited for.

use core::time::Duration;
use kernel::{dma_fence::Fence, prelude::*};

use crate::{
    client::Client,
    debug::*,
    driver::TegraDevice,
    fence::{self, ExecutionContext},
    gem::{Object, Registry},
    job::{Job, Reloc, RelocBuf},
    reservation::ReservationList,
    uapi::{self, RelocFlags},
};

const DEBUG_CLASS: DebugFlags = DebugFlags::Submit;

/// Result of a successful submission.
pub struct Submitted {
    /// The queued job.
    pub job: Arc<Job>,
    /// Fence signaled when the job completes.
    pub fence: Fence,
}

/// Makes `job` wait for `f`, unless it is already ordered with it.
fn await_fence(job: &mut Job, exec: &ExecutionContext, f: Fence) -> Result {
    if exec.matches(f.context()) {
        cls_dev_dbg!(
            Fence,
            job.dev(),
            "submit: skipping fence {}:{} from a matching context",
            f.context(),
            f.seqno()
        );
        return Ok(());
    }

    if fence::is_waitable(&f) {
        mod_dev_dbg!(job.dev(), "submit: hardware wait for fence {}:{}", f.context(), f.seqno());
        return job.add_fence(f);
    }

    mod_dev_dbg!(
        job.dev(),
        "submit: CPU wait for {} fence {}:{}",
        f.driver_name(),
        f.context(),
        f.seqno()
    );
    f.wait(true, None)
}

/// Orders `job` after the fences on `bo`. The reservation lock must be held.
pub fn await_bo(job: &mut Job, exec: &ExecutionContext, bo: &Object, write: bool) -> Result {
    // Readers only wait for the last writer, writers for everyone.
    let fences = bo.resv().fences().fences(write);

    for f in fences {
        await_fence(job, exec, f)?;
    }
    Ok(())
}

/// Orders `job` after the fences on every buffer of `list`.
pub fn await_fences(job: &mut Job, exec: &ExecutionContext, list: &ReservationList) -> Result {
    for r in list.lockable() {
        await_bo(job, exec, &r.bo, r.write)?;
    }
    Ok(())
}

/// Publishes `fence` on every buffer of `list`. The reservation locks must be held.
pub fn attach_fence(list: &ReservationList, fence: &Fence) {
    let mut fence = Some(fence.clone());

    for r in list.lockable() {
        // Once the fence has signaled there is nothing left to order against.
        if fence.as_ref().is_some_and(|f| f.is_signaled()) {
            fence = None;
        }

        let mut fences = r.bo.resv().fences();
        if r.write {
            fences.add_excl_fence(fence.clone());
        } else if let Some(f) = &fence {
            fences.add_shared_fence(f.clone());
        }
    }
}

/// Resolves handles and builds the job and the reservation list for `args`.
fn prepare(
    tdev: &TegraDevice,
    objects: &Registry,
    client: &Arc<Client>,
    args: &uapi::Submit,
) -> Result<(Job, ReservationList)> {
    let sp_args = args.syncpts[0];
    let sp = client
        .syncpts()
        .iter()
        .find(|sp| sp.id() == sp_args.id)
        .ok_or(ENOENT)?;

    let mut job = Job::new(
        tdev.dev(),
        client,
        sp,
        sp_args.incrs,
        args.cmdbufs.len(),
        args.relocs.len(),
    )?;
    job.set_serialize(true);

    let params = tdev.params();
    let mut timeout = params.default_timeout_ms;
    if args.timeout != 0 && args.timeout < params.max_submit_timeout_ms {
        timeout = args.timeout;
    }
    job.set_timeout(Duration::from_millis(timeout as u64));

    let mut list = ReservationList::new(args.cmdbufs.len() + args.relocs.len() * 2)?;

    // Command buffers are copied by the firewall, the copies need no reservation.
    let skip_cmdbufs = params.firewall;
    for cmdbuf in &args.cmdbufs {
        let bo = objects.lookup(cmdbuf.handle)?;
        job.add_gather(bo.clone(), cmdbuf.words, cmdbuf.offset)?;
        list.append(bo, false, skip_cmdbufs)?;
    }

    for reloc in &args.relocs {
        let write = !reloc.flags.contains(RelocFlags::READ);

        let cmdbuf = objects.lookup(reloc.cmdbuf.handle)?;
        list.append(cmdbuf.clone(), write, true)?;
        let target = objects.lookup(reloc.target.handle)?;
        list.append(target.clone(), write, false)?;

        job.add_reloc(Reloc {
            cmdbuf: RelocBuf {
                bo: cmdbuf,
                offset: reloc.cmdbuf.offset as u64,
            },
            target: RelocBuf {
                bo: target,
                offset: reloc.target.offset as u64,
            },
            shift: reloc.shift,
        })?;
    }

    Ok((job, list))
}

/// Submits a job on `client` for file context `drm_ctx`.
///
/// `in_fence` is a fence the job must wait for before it starts.
pub fn submit(
    tdev: &TegraDevice,
    objects: &Registry,
    drm_ctx: u32,
    client: &Arc<Client>,
    args: &uapi::Submit,
    in_fence: Option<Fence>,
) -> Result<Submitted> {
    if args.syncpts.len() != 1 || args.num_waitchks != 0 {
        return Err(EINVAL);
    }

    let exec = ExecutionContext::new(tdev.fence_context_base(), client.module(), drm_ctx)?;
    let channel = tdev.channel(client.channel())?;
    let (mut job, mut list) = prepare(tdev, objects, client, args)?;

    if let Some(f) = in_fence {
        match fence::is_waitable(&f) {
            true => job.add_fence(f)?,
            false => f.wait(true, None)?,
        }
    }

    list.lock()?;
    list.prealloc_shared()?;
    await_fences(&mut job, &exec, &list)?;

    job.pin(tdev.params().firewall)?;
    let sp = job.syncpt().clone();
    let job = channel.submit(job)?;

    let out = fence::create(&sp, job.syncpt_end(), exec.value(), tdev.next_fence_seqno());
    attach_fence(&list, &out);
    list.unlock();

    mod_dev_dbg!(
        tdev.dev(),
        "submit: ctx {} queued job on channel {}, syncpt {} end {}",
        drm_ctx,
        channel.id(),
        sp.id(),
        job.syncpt_end()
    );

    Ok(Submitted { job, fence: out })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fence::DRM_CONTEXTS_MAX,
        gem::Backing,
        hw::sim::SimHost,
        Params,
    };
    use kernel::{
        dma_fence::{context_alloc, SoftFence},
        PAGE_SIZE,
    };
    use std::thread;

    struct Setup {
        tdev: Arc<TegraDevice>,
        client: Arc<Client>,
    }

    fn setup() -> Setup {
        let _ = env_logger::builder().is_test(true).try_init();
        let host = SimHost::new(16, false);
        let tdev = TegraDevice::probe("submit-test", Params::default(), host).unwrap();
        let client = tdev.clients()[0].clone();
        Setup { tdev, client }
    }

    fn job(s: &Setup) -> Job {
        let sp = &s.client.syncpts()[0];
        Job::new(s.tdev.dev(), &s.client, sp, 1, 0, 0).unwrap()
    }

    fn bo_with_fences(s: &Setup, excl: Option<Fence>, shared: &[Fence]) -> Arc<Object> {
        let bo = Object::new(s.tdev.vm(), PAGE_SIZE, Backing::Pages).unwrap();
        bo.resv().lock(None).unwrap();
        {
            let mut f = bo.resv().fences();
            f.add_excl_fence(excl);
            for sf in shared {
                f.reserve_shared(1).unwrap();
                f.add_shared_fence(sf.clone());
            }
        }
        bo
    }

    fn exec(s: &Setup, drm_ctx: u32) -> ExecutionContext {
        ExecutionContext::new(s.tdev.fence_context_base(), s.client.module(), drm_ctx).unwrap()
    }

    /// A host1x fence from another module and another file context.
    fn foreign_host1x_fence(s: &Setup) -> Fence {
        let sp = &s.tdev.clients()[1].syncpts()[0];
        let thresh = sp.incr_max(1);
        let other = ExecutionContext::new(
            s.tdev.fence_context_base(),
            s.tdev.clients()[1].module(),
            5,
        )
        .unwrap();
        fence::create(sp, thresh, other.value(), 1)
    }

    #[test]
    fn same_context_fences_are_skipped() {
        let s = setup();
        let own = exec(&s, 3);
        let sp = &s.client.syncpts()[0];
        let thresh = sp.incr_max(1);

        // Same file context on another module, and same module from another file.
        let same_file = ExecutionContext::new(s.tdev.fence_context_base(), 2, 3).unwrap();
        let same_module = exec(&s, 7);
        let bo = bo_with_fences(
            &s,
            Some(fence::create(sp, thresh, same_file.value(), 1)),
            &[fence::create(sp, thresh, same_module.value(), 2)],
        );

        let mut j = job(&s);
        await_bo(&mut j, &own, &bo, true).unwrap();
        assert!(j.fences().is_empty());
        bo.resv().unlock();
    }

    #[test]
    fn foreign_host1x_fence_becomes_hardware_wait() {
        let s = setup();
        let f = foreign_host1x_fence(&s);
        let bo = bo_with_fences(&s, Some(f.clone()), &[]);

        let mut j = job(&s);
        await_bo(&mut j, &exec(&s, 0), &bo, false).unwrap();
        assert_eq!(j.fences().len(), 1);
        assert!(j.fences()[0].ptr_eq(&f));
        bo.resv().unlock();
    }

    #[test]
    fn readers_ignore_shared_fences() {
        let s = setup();
        let reader = foreign_host1x_fence(&s);
        let bo = bo_with_fences(&s, None, &[reader]);

        let mut j = job(&s);
        await_bo(&mut j, &exec(&s, 0), &bo, false).unwrap();
        assert!(j.fences().is_empty());
        await_bo(&mut j, &exec(&s, 0), &bo, true).unwrap();
        assert_eq!(j.fences().len(), 1);
        bo.resv().unlock();
    }

    #[test]
    fn foreign_soft_fence_waits_on_cpu() {
        let s = setup();
        let f = Fence::new(context_alloc(1), 1, SoftFence::new("camera"));
        let bo = bo_with_fences(&s, Some(f.clone()), &[]);

        let signaler = {
            let f = f.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                f.signal().unwrap();
            })
        };

        let mut j = job(&s);
        await_bo(&mut j, &exec(&s, 0), &bo, false).unwrap();
        assert!(f.is_signaled());
        assert!(j.fences().is_empty());
        signaler.join().unwrap();
        bo.resv().unlock();
    }

    #[test]
    fn attach_write_replaces_read_adds() {
        let s = setup();
        let old = foreign_host1x_fence(&s);
        let w = Object::new(s.tdev.vm(), PAGE_SIZE, Backing::Pages).unwrap();
        let r = bo_with_fences(&s, None, &[old]);
        r.resv().unlock();

        let mut list = ReservationList::new(2).unwrap();
        list.append(w.clone(), true, false).unwrap();
        list.append(r.clone(), false, false).unwrap();
        list.lock().unwrap();
        list.prealloc_shared().unwrap();

        let sp = &s.client.syncpts()[0];
        let f = fence::create(sp, sp.incr_max(1), exec(&s, 0).value(), 9);
        attach_fence(&list, &f);

        assert!(w.resv().fences().excl().is_some_and(|e| e.ptr_eq(&f)));
        assert_eq!(r.resv().fences().shared().len(), 2);
        list.unlock();
    }

    #[test]
    fn attach_signaled_fence_clears_writers() {
        let s = setup();
        let w = bo_with_fences(&s, Some(foreign_host1x_fence(&s)), &[]);
        w.resv().unlock();

        let mut list = ReservationList::new(1).unwrap();
        list.append(w.clone(), true, false).unwrap();
        list.lock().unwrap();

        let sp = &s.client.syncpts()[0];
        let f = fence::create(sp, sp.read_min(), exec(&s, 0).value(), 1);
        attach_fence(&list, &f);
        assert!(w.resv().fences().excl().is_none());
    }

    #[test]
    fn rejects_unsupported_arguments() {
        let s = setup();
        let objects = Registry::new();
        let mut args = uapi::Submit::default();
        assert_eq!(
            submit(&s.tdev, &objects, 0, &s.client, &args, None).err(),
            Some(EINVAL)
        );

        args.syncpts.push(uapi::Syncpt { id: 1234, incrs: 1 });
        args.num_waitchks = 1;
        assert_eq!(
            submit(&s.tdev, &objects, 0, &s.client, &args, None).err(),
            Some(EINVAL)
        );

        args.num_waitchks = 0;
        assert_eq!(
            submit(&s.tdev, &objects, 0, &s.client, &args, None).err(),
            Some(ENOENT)
        );

        args.syncpts[0].id = s.client.syncpts()[0].id();
        assert_eq!(
            submit(&s.tdev, &objects, DRM_CONTEXTS_MAX as u32, &s.client, &args, None).err(),
            Some(EINVAL)
        );

        args.cmdbufs.push(uapi::Cmdbuf {
            handle: 77,
            offset: 0,
            words: 2,
        });
        assert_eq!(
            submit(&s.tdev, &objects, 0, &s.client, &args, None).err(),
            Some(ENOENT)
        );
    }
}
