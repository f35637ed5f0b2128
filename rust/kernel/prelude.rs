// SPDX-License-Identifier: GPL-2.0 OR MIT

//! The `kernel` prelude.
//!
//! These are the most common items used by driver code.
//!
//! # Examples
//!
//! ```
//! use kernel::prelude::*;
//! ```

pub use crate::{dev_dbg, dev_err, dev_info, dev_warn};
pub use crate::{pr_crit, pr_debug, pr_emerg, pr_err, pr_info, pr_warn};

pub use crate::error::{code::*, Error, Result};
pub use crate::sync::Arc;
