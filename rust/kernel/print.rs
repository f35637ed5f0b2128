// SPDX-License-Identifier: GPL-2.0 OR MIT

//! Printing facilities.
//!
//! The `pr_*` and `dev_*` macros keep the call shape of their C counterparts but route every
//! message through the [`log`] facade, so the host decides where output goes (tests install
//! `env_logger`). The log target is the module path of the caller.

/// Prints an emergency-level message.
#[macro_export]
macro_rules! pr_emerg (
    ($($arg:tt)*) => ( $crate::log::error!($($arg)*) )
);

/// Prints a critical-level message.
#[macro_export]
macro_rules! pr_crit (
    ($($arg:tt)*) => ( $crate::log::error!($($arg)*) )
);

/// Prints an error-level message.
#[macro_export]
macro_rules! pr_err (
    ($($arg:tt)*) => ( $crate::log::error!($($arg)*) )
);

/// Prints a warning-level message.
#[macro_export]
macro_rules! pr_warn (
    ($($arg:tt)*) => ( $crate::log::warn!($($arg)*) )
);

/// Prints an info-level message.
#[macro_export]
macro_rules! pr_info (
    ($($arg:tt)*) => ( $crate::log::info!($($arg)*) )
);

/// Prints a debug-level message.
#[macro_export]
macro_rules! pr_debug (
    ($($arg:tt)*) => ( $crate::log::debug!($($arg)*) )
);

#[doc(hidden)]
#[macro_export]
macro_rules! dev_printk (
    ($lvl:ident, $dev:expr, $($arg:tt)*) => (
        $crate::log::$lvl!("{}: {}", $crate::device::RawDevice::name(&$dev), format_args!($($arg)*))
    )
);

/// Prints an error-level message prefixed with the device name.
#[macro_export]
macro_rules! dev_err (
    ($dev:expr, $($arg:tt)*) => ( $crate::dev_printk!(error, $dev, $($arg)*) )
);

/// Prints a warning-level message prefixed with the device name.
#[macro_export]
macro_rules! dev_warn (
    ($dev:expr, $($arg:tt)*) => ( $crate::dev_printk!(warn, $dev, $($arg)*) )
);

/// Prints an info-level message prefixed with the device name.
#[macro_export]
macro_rules! dev_info (
    ($dev:expr, $($arg:tt)*) => ( $crate::dev_printk!(info, $dev, $($arg)*) )
);

/// Prints a debug-level message prefixed with the device name.
#[macro_export]
macro_rules! dev_dbg (
    ($dev:expr, $($arg:tt)*) => ( $crate::dev_printk!(debug, $dev, $($arg)*) )
);
