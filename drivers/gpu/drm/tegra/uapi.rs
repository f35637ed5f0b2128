// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! User API structures
//!
//! Argument blocks of the Tegra DRM ioctls. The field layout follows the C uapi header; arrays
//! that user space passes by pointer are carried as vectors.

use bitflags::bitflags;

bitflags! {
    /// Flags of [`Submit`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SubmitFlags: u32 {
        /// `fence` names an input fence the job waits for.
        const WAIT_FENCE = 1 << 0;
        /// Return a fence handle instead of the raw syncpoint value.
        const CREATE_FENCE = 1 << 1;
    }
}

bitflags! {
    /// Flags of [`Reloc`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct RelocFlags: u32 {
        /// The engine only reads the target.
        const READ = 1 << 0;
    }
}

bitflags! {
    /// Flags of [`GemCreate`].
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct GemCreateFlags: u32 {
        /// Create the buffer with the tiled layout.
        const TILED = 1 << 0;
        /// Scan lines are stored bottom-up.
        const BOTTOM_UP = 1 << 1;
        /// Back the buffer with one physically contiguous block.
        const CONTIGUOUS = 1 << 2;
    }
}

/// `TEGRA_OPEN_CHANNEL`
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenChannel {
    /// in: class of the engine.
    pub client: u32,
    /// out: context handle.
    pub context: u64,
}

/// `TEGRA_CLOSE_CHANNEL`
#[derive(Clone, Copy, Debug, Default)]
pub struct CloseChannel {
    /// in: context handle.
    pub context: u64,
}

/// `TEGRA_GET_SYNCPT`
#[derive(Clone, Copy, Debug, Default)]
pub struct GetSyncpt {
    /// in: context handle.
    pub context: u64,
    /// in: index among the client's syncpoints.
    pub index: u32,
    /// out: syncpoint id.
    pub id: u32,
}

/// `TEGRA_SYNCPT_READ`
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncptRead {
    /// in: syncpoint id.
    pub id: u32,
    /// out: current value.
    pub value: u32,
}

/// `TEGRA_SYNCPT_INCR`
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncptIncr {
    /// in: syncpoint id.
    pub id: u32,
}

/// `TEGRA_SYNCPT_WAIT`
#[derive(Clone, Copy, Debug, Default)]
pub struct SyncptWait {
    /// in: syncpoint id.
    pub id: u32,
    /// in: threshold.
    pub thresh: u32,
    /// in: timeout in milliseconds, `u32::MAX` waits forever.
    pub timeout: u32,
    /// out: value reached.
    pub value: u32,
}

/// A gather of a submission.
#[derive(Clone, Copy, Debug, Default)]
pub struct Cmdbuf {
    /// Buffer handle.
    pub handle: u32,
    /// Byte offset of the first word.
    pub offset: u32,
    /// Number of words.
    pub words: u32,
}

/// One side of a relocation.
#[derive(Clone, Copy, Debug, Default)]
pub struct RelocBuf {
    /// Buffer handle.
    pub handle: u32,
    /// Byte offset.
    pub offset: u32,
}

/// A relocation of a submission.
#[derive(Clone, Copy, Debug, Default)]
pub struct Reloc {
    /// Word to patch.
    pub cmdbuf: RelocBuf,
    /// Address to patch in.
    pub target: RelocBuf,
    /// Right shift applied to the address.
    pub shift: u32,
    /// Access flags.
    pub flags: RelocFlags,
}

/// Syncpoint increments of a submission.
#[derive(Clone, Copy, Debug, Default)]
pub struct Syncpt {
    /// Syncpoint id.
    pub id: u32,
    /// Number of increments the gathers perform.
    pub incrs: u32,
}

/// `TEGRA_SUBMIT`
#[derive(Clone, Debug, Default)]
pub struct Submit {
    /// in: context handle.
    pub context: u64,
    /// in: syncpoint increments, exactly one entry is supported.
    pub syncpts: Vec<Syncpt>,
    /// in: gathers.
    pub cmdbufs: Vec<Cmdbuf>,
    /// in: relocations.
    pub relocs: Vec<Reloc>,
    /// in: number of wait checks, must be zero.
    pub num_waitchks: u32,
    /// in: timeout in milliseconds, zero for the default.
    pub timeout: u32,
    /// in: flags.
    pub flags: SubmitFlags,
    /// in: input fence handle with `WAIT_FENCE`.
    /// out: fence handle with `CREATE_FENCE`, the syncpoint end value otherwise.
    pub fence: u32,
}

/// `TEGRA_GEM_CREATE`
#[derive(Clone, Copy, Debug, Default)]
pub struct GemCreate {
    /// in: size in bytes.
    pub size: u64,
    /// in: flags.
    pub flags: GemCreateFlags,
    /// out: buffer handle.
    pub handle: u32,
}

/// `GEM_CLOSE`
#[derive(Clone, Copy, Debug, Default)]
pub struct GemClose {
    /// in: buffer handle.
    pub handle: u32,
}

/// Tiling modes of [`GemTiling`].
pub mod tiling {
    pub const PITCH: u32 = 0;
    pub const TILED: u32 = 1;
    pub const BLOCK: u32 = 2;
}

/// `TEGRA_GEM_SET_TILING` / `TEGRA_GEM_GET_TILING`
#[derive(Clone, Copy, Debug, Default)]
pub struct GemTiling {
    /// in: buffer handle.
    pub handle: u32,
    /// in/out: tiling mode.
    pub mode: u32,
    /// in/out: mode parameter (block height for `BLOCK`).
    pub value: u32,
}

/// `TEGRA_GEM_CPU_PREP`
#[derive(Clone, Copy, Debug, Default)]
pub struct GemCpuPrep {
    /// in: buffer handle.
    pub handle: u32,
    /// in: timeout in milliseconds, zero only polls.
    pub timeout: u32,
    /// in: the CPU is going to write the buffer.
    pub write: bool,
}
