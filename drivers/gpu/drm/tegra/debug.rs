// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Debug enable/disable flags and convenience macros

#[allow(unused_imports)]
pub(crate) use super::{cls_dev_dbg, cls_pr_debug, debug, fw_err, mod_dev_dbg, mod_pr_debug};
use core::sync::atomic::{AtomicU64, Ordering};

static DEBUG_FLAGS: AtomicU64 = AtomicU64::new(0);

/// Debug flag bit indices
pub enum DebugFlags {
    // 0-3: Memory-related debug
    Mmu = 0,
    Gem = 1,
    Resv = 2,

    // 4-7: Synchronization
    Syncpt = 4,
    Fence = 5,

    // 8-13: Submission
    File = 8,
    Submit = 9,
    Job = 10,
    Channel = 11,
    Firewall = 12,
    Sim = 13,

    // 32-: Behavior flags
    TraceCmdbuf = 32,
    NoPartialUnmap = 33,
}

/// Update the cached global debug flags from the driver parameters
pub fn update_debug_flags(params: &crate::Params) {
    DEBUG_FLAGS.store(params.debug_flags, Ordering::Relaxed);
}

/// Check whether debug is enabled for a given flag
#[inline(always)]
pub fn debug_enabled(flag: DebugFlags) -> bool {
    DEBUG_FLAGS.load(Ordering::Relaxed) & 1 << (flag as usize) != 0
}

/// Run some code only if debug is enabled for the calling module
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => {
        if $crate::debug::debug_enabled(DEBUG_CLASS) {
            $($arg)*
        }
    };
}

/// pr_debug!() if debug is enabled for the calling module
#[macro_export]
macro_rules! mod_pr_debug (
    ($($arg:tt)*) => (
        $crate::debug! { ::kernel::pr_debug! ( $($arg)* ); }
    )
);

/// dev_dbg!() if debug is enabled for the calling module
#[macro_export]
macro_rules! mod_dev_dbg (
    ($($arg:tt)*) => (
        $crate::debug! { ::kernel::dev_dbg! ( $($arg)* ); }
    )
);

/// pr_debug!() if debug is enabled for a specific module
#[macro_export]
macro_rules! cls_pr_debug (
    ($cls:ident, $($arg:tt)*) => (
        if $crate::debug::debug_enabled($crate::debug::DebugFlags::$cls) {
            ::kernel::pr_debug! ( $($arg)* );
        }
    )
);

/// dev_dbg!() if debug is enabled for a specific module
#[macro_export]
macro_rules! cls_dev_dbg (
    ($cls:ident, $($arg:tt)*) => (
        if $crate::debug::debug_enabled($crate::debug::DebugFlags::$cls) {
            ::kernel::dev_dbg! ( $($arg)* );
        }
    )
);

/// Firewall rejection message, always printed.
#[macro_export]
macro_rules! fw_err (
    ($($arg:tt)*) => (
        ::kernel::pr_err!("host1x firewall: {}", format_args!($($arg)*))
    )
);
