// SPDX-License-Identifier: GPL-2.0 OR MIT

//! Wound/wait mutexes.
//!
//! C header: [`include/linux/ww_mutex.h`](../../../../include/linux/ww_mutex.h)
//!
//! A [`WwMutex`] may be taken on its own, or as part of an [`AcquireCtx`] when a caller needs to
//! hold several of them at once. Every context draws a stamp from its [`WwClass`]; when a context
//! blocks on a mutex held by a younger context, the younger one is "wounded". A wounded context
//! that already holds locks gets `EDEADLK` from its next (or current) lock attempt, and must drop
//! everything it holds and start over with [`WwMutex::lock_slow`] on the contended lock. Older
//! contexts therefore never wait on a cycle, and the younger ones make progress once the older
//! ones are done.
//!
//! Unlike the C API, the lock and unlock calls are not tied to a guard object, since reservation
//! lists are locked and unlocked in separate steps.

use crate::{
    error::{code::*, Result},
    pr_debug, pr_warn,
    sync::{Arc, CondVar, Mutex, MutexGuard, SIGNAL_POLL},
};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, ThreadId};

/// A class of wound/wait mutexes sharing one stamp sequence.
pub struct WwClass {
    name: &'static str,
    stamp: AtomicU64,
}

impl WwClass {
    /// Creates a new class.
    pub const fn new(name: &'static str) -> WwClass {
        WwClass {
            name,
            stamp: AtomicU64::new(1),
        }
    }

    /// Returns the name of the class.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Acquire context state visible to the mutexes it currently holds.
struct CtxState {
    stamp: u64,
    wounded: AtomicBool,
    acquired: AtomicUsize,
}

/// An acquire context, used to take several [`WwMutex`]es of the same class.
pub struct AcquireCtx {
    class: &'static WwClass,
    state: Arc<CtxState>,
    done: bool,
}

impl AcquireCtx {
    /// Initializes a context with a fresh stamp.
    pub fn new(class: &'static WwClass) -> AcquireCtx {
        AcquireCtx {
            class,
            state: Arc::new(CtxState {
                stamp: class.stamp.fetch_add(1, Ordering::Relaxed),
                wounded: AtomicBool::new(false),
                acquired: AtomicUsize::new(0),
            }),
            done: false,
        }
    }

    /// Returns the stamp of this context. Lower stamps are older.
    pub fn stamp(&self) -> u64 {
        self.state.stamp
    }

    /// Returns the number of mutexes currently held through this context.
    pub fn acquired(&self) -> usize {
        self.state.acquired.load(Ordering::Acquire)
    }

    /// Returns whether an older context has asked this one to back off.
    pub fn is_wounded(&self) -> bool {
        self.state.wounded.load(Ordering::Acquire)
    }

    /// Marks the end of the acquire phase. No further locks may be taken with this context.
    pub fn done(&mut self) {
        self.done = true;
    }
}

impl Drop for AcquireCtx {
    fn drop(&mut self) {
        let held = self.acquired();
        if held != 0 {
            pr_warn!(
                "ww_acquire_fini: context {} of class {} still holds {} locks",
                self.stamp(),
                self.class.name,
                held
            );
        }
    }
}

struct Owner {
    locked: bool,
    thread: Option<ThreadId>,
    ctx: Option<Arc<CtxState>>,
}

/// A wound/wait mutex protecting a `T`.
pub struct WwMutex<T> {
    class: &'static WwClass,
    owner: Mutex<Owner>,
    cond: CondVar,
    data: Mutex<T>,
}

impl<T> WwMutex<T> {
    /// Creates a new, unlocked mutex of the given class.
    pub fn new(class: &'static WwClass, data: T) -> WwMutex<T> {
        WwMutex {
            class,
            owner: Mutex::new(Owner {
                locked: false,
                thread: None,
                ctx: None,
            }),
            cond: CondVar::new(),
            data: Mutex::new(data),
        }
    }

    /// Locks the mutex, uninterruptibly.
    ///
    /// With a context, returns `EDEADLK` when the context must back off, and `EALREADY` when the
    /// context already holds this mutex.
    pub fn lock(&self, ctx: Option<&AcquireCtx>) -> Result {
        self.lock_common(ctx, false, false)
    }

    /// Locks the mutex, returning `ERESTARTSYS` if a signal arrives while waiting.
    pub fn lock_interruptible(&self, ctx: Option<&AcquireCtx>) -> Result {
        self.lock_common(ctx, false, true)
    }

    /// Slow-path lock, taken after backing off with `EDEADLK`.
    ///
    /// The context must not hold any lock, so this cannot fail with `EDEADLK`.
    pub fn lock_slow(&self, ctx: &AcquireCtx) -> Result {
        self.lock_common(Some(ctx), true, false)
    }

    /// Interruptible variant of [`WwMutex::lock_slow`].
    pub fn lock_slow_interruptible(&self, ctx: &AcquireCtx) -> Result {
        self.lock_common(Some(ctx), true, true)
    }

    /// Attempts to take the mutex without blocking and without a context.
    pub fn trylock(&self) -> bool {
        let mut owner = self.owner.lock();
        if owner.locked {
            return false;
        }
        owner.locked = true;
        owner.thread = Some(thread::current().id());
        true
    }

    fn lock_common(&self, ctx: Option<&AcquireCtx>, slow: bool, interruptible: bool) -> Result {
        if let Some(ctx) = ctx {
            if !core::ptr::eq(ctx.class, self.class) {
                pr_warn!(
                    "ww_mutex: context of class {} used on mutex of class {}",
                    ctx.class.name,
                    self.class.name
                );
                return Err(EINVAL);
            }
            if ctx.done {
                pr_warn!("ww_mutex: lock after ww_acquire_done");
            }
            if ctx.acquired() == 0 {
                ctx.state.wounded.store(false, Ordering::Release);
            } else if slow {
                pr_warn!("ww_mutex: slow path lock with {} locks held", ctx.acquired());
            }
        }

        let mut owner = self.owner.lock();
        loop {
            if let Some(ctx) = ctx {
                if let Some(holder) = owner.ctx.as_ref() {
                    if Arc::ptr_eq(holder, &ctx.state) {
                        return Err(EALREADY);
                    }
                }
                if ctx.acquired() > 0 && ctx.is_wounded() {
                    return Err(EDEADLK);
                }
            }

            if !owner.locked {
                owner.locked = true;
                owner.thread = Some(thread::current().id());
                owner.ctx = ctx.map(|c| {
                    c.state.acquired.fetch_add(1, Ordering::AcqRel);
                    c.state.clone()
                });
                return Ok(());
            }

            if let (Some(ctx), Some(holder)) = (ctx, owner.ctx.as_ref()) {
                if ctx.stamp() < holder.stamp && !holder.wounded.swap(true, Ordering::AcqRel) {
                    pr_debug!(
                        "ww_mutex {}: context {} wounds context {}",
                        self.class.name,
                        ctx.stamp(),
                        holder.stamp
                    );
                }
            }

            self.wait(&mut owner, interruptible)?;
        }
    }

    fn wait(&self, owner: &mut MutexGuard<'_, Owner>, interruptible: bool) -> Result {
        if interruptible {
            if self.cond.wait(owner) {
                return Err(ERESTARTSYS);
            }
        } else {
            // Wake up periodically to notice being wounded while asleep.
            let _ = self.cond.wait_timeout(owner, SIGNAL_POLL);
        }
        Ok(())
    }

    /// Unlocks the mutex.
    pub fn unlock(&self) {
        let mut owner = self.owner.lock();
        if !owner.locked {
            pr_warn!("ww_mutex {}: unlock of unlocked mutex", self.class.name);
            return;
        }
        if let Some(ctx) = owner.ctx.take() {
            ctx.acquired.fetch_sub(1, Ordering::AcqRel);
        }
        owner.locked = false;
        owner.thread = None;
        drop(owner);
        self.cond.notify_all();
    }

    /// Returns whether the mutex is currently held.
    pub fn is_locked(&self) -> bool {
        self.owner.lock().locked
    }

    /// Returns whether the mutex is held by the calling thread.
    pub fn is_held_by_current(&self) -> bool {
        let owner = self.owner.lock();
        owner.locked && owner.thread == Some(thread::current().id())
    }

    /// Accesses the protected data. The mutex must be held by the caller.
    pub fn data(&self) -> MutexGuard<'_, T> {
        debug_assert!(
            self.is_held_by_current(),
            "ww_mutex {}: data accessed without holding the lock",
            self.class.name
        );
        self.data.lock()
    }

    /// Accesses the protected data without checking the lock.
    ///
    /// Only for read-only snapshots that tolerate concurrent updates.
    pub fn data_unlocked(&self) -> MutexGuard<'_, T> {
        self.data.lock()
    }

    /// Returns a mutable reference to the data, which needs no locking.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }
}
