// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! host1x hardware interface
//!
//! This module contains the host1x command stream encoding shared by the channel code, the
//! firewall and the software host, and the [`Host1xHardware`] trait through which the driver
//! talks to the channel DMA engines and syncpoint registers.

use kernel::prelude::*;

pub mod sim;

/// Engine class ids.
pub mod class {
    /// The host1x class itself, used for syncpoint waits.
    pub const HOST1X: u32 = 0x01;
    /// 2D engine.
    pub const GR2D: u32 = 0x51;
    /// 2D engine, surface blit mode.
    pub const GR2D_SB: u32 = 0x52;
    /// 3D engine.
    pub const GR3D: u32 = 0x60;
}

/// Registers present in every class.
pub mod uclass {
    /// Increments a syncpoint. Value: `cond << 8 | id`.
    pub const INCR_SYNCPT: u32 = 0x00;
    /// Waits for a syncpoint (host1x class only). Value: `id << 24 | threshold`.
    pub const WAIT_SYNCPT: u32 = 0x08;

    /// Increment when the write is reached.
    pub const COND_IMMEDIATE: u32 = 0;
    /// Increment once the engine has finished all preceding operations.
    pub const COND_OP_DONE: u32 = 1;

    /// Encodes an `INCR_SYNCPT` value.
    pub const fn incr_syncpt(cond: u32, id: u32) -> u32 {
        (cond & 0xff) << 8 | (id & 0xff)
    }

    /// Encodes a `WAIT_SYNCPT` value.
    pub const fn wait_syncpt(id: u32, thresh: u32) -> u32 {
        (id & 0xff) << 24 | (thresh & 0xff_ffff)
    }
}

/// Opcode numbers (bits 31..28 of a command word).
pub mod opcode {
    pub const SETCLASS: u32 = 0x0;
    pub const INCR: u32 = 0x1;
    pub const NONINCR: u32 = 0x2;
    pub const MASK: u32 = 0x3;
    pub const IMM: u32 = 0x4;
    pub const RESTART: u32 = 0x5;
    pub const GATHER: u32 = 0x6;
    pub const EXTEND: u32 = 0xe;

    /// Encodes a SETCLASS, optionally writing the registers selected by `mask`.
    pub const fn setclass(class: u32, offset: u32, mask: u32) -> u32 {
        SETCLASS << 28 | (offset & 0xfff) << 16 | (class & 0x3ff) << 6 | (mask & 0x3f)
    }

    /// Encodes a write of `count` words to consecutive registers.
    pub const fn incr(offset: u32, count: u32) -> u32 {
        INCR << 28 | (offset & 0xfff) << 16 | (count & 0xffff)
    }

    /// Encodes a write of `count` words to a single register.
    pub const fn nonincr(offset: u32, count: u32) -> u32 {
        NONINCR << 28 | (offset & 0xfff) << 16 | (count & 0xffff)
    }

    /// Encodes a write to the registers selected by `mask`, relative to `offset`.
    pub const fn mask(offset: u32, mask: u32) -> u32 {
        MASK << 28 | (offset & 0xfff) << 16 | (mask & 0xffff)
    }

    /// Encodes an immediate 16-bit register write.
    pub const fn imm(offset: u32, value: u32) -> u32 {
        IMM << 28 | (offset & 0xfff) << 16 | (value & 0xffff)
    }

    /// Encodes a GATHER header. The next word is the gather address.
    pub const fn gather(count: u32) -> u32 {
        GATHER << 28 | (count & 0x3fff)
    }
}

/// Maximum number of words a single GATHER can fetch.
pub const GATHER_MAX_WORDS: u32 = 16383;

/// A decoded command word.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    /// Switch class, then write the registers in `mask` (relative to `offset`).
    SetClass {
        class: u32,
        offset: u32,
        mask: u32,
    },
    /// Write `count` words to `offset`, `offset + 1`, ...
    Incr { offset: u32, count: u32 },
    /// Write `count` words to `offset`.
    NonIncr { offset: u32, count: u32 },
    /// Write the registers in `mask` (relative to `offset`).
    Mask { offset: u32, mask: u32 },
    /// Write `value` to `offset`.
    Imm { offset: u32, value: u32 },
    /// Jump the DMA get pointer.
    Restart,
    /// Fetch `count` words from the address in the next word.
    Gather { count: u32 },
    /// Extended opcode.
    Extend,
    /// Unknown opcode.
    Invalid(u32),
}

impl Op {
    /// Decodes a command word.
    pub fn decode(word: u32) -> Op {
        match word >> 28 {
            opcode::SETCLASS => Op::SetClass {
                class: word >> 6 & 0x3ff,
                offset: word >> 16 & 0xfff,
                mask: word & 0x3f,
            },
            opcode::INCR => Op::Incr {
                offset: word >> 16 & 0xfff,
                count: word & 0xffff,
            },
            opcode::NONINCR => Op::NonIncr {
                offset: word >> 16 & 0xfff,
                count: word & 0xffff,
            },
            opcode::MASK => Op::Mask {
                offset: word >> 16 & 0xfff,
                mask: word & 0xffff,
            },
            opcode::IMM => Op::Imm {
                offset: word >> 16 & 0x1fff,
                value: word & 0xffff,
            },
            opcode::RESTART => Op::Restart,
            opcode::GATHER => Op::Gather {
                count: word & 0x3fff,
            },
            opcode::EXTEND => Op::Extend,
            op => Op::Invalid(op),
        }
    }

    /// Returns the number of data words following the command word.
    pub fn payload(&self) -> u32 {
        match *self {
            Op::SetClass { mask, .. } | Op::Mask { mask, .. } => mask.count_ones(),
            Op::Incr { count, .. } | Op::NonIncr { count, .. } => count,
            Op::Gather { .. } => 1,
            _ => 0,
        }
    }
}

/// A push buffer ready for a channel's DMA engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CdmaJob {
    /// Channel index.
    pub channel: u32,
    /// Push buffer words.
    pub pushbuf: Vec<u32>,
    /// Syncpoint incremented by the job.
    pub syncpt_id: u32,
    /// Syncpoint value once the job has completed.
    pub syncpt_end: u32,
    /// Increments performed by the gathers themselves.
    pub user_incrs: u32,
}

/// Access to the host1x hardware.
pub trait Host1xHardware: Send + Sync {
    /// Number of syncpoints.
    fn num_syncpts(&self) -> u32;

    /// Queues a push buffer on a channel.
    fn submit(&self, job: CdmaJob) -> Result;

    /// Reads the current value of a syncpoint.
    fn syncpt_load(&self, id: u32) -> u32;

    /// Increments a syncpoint from the CPU.
    fn syncpt_cpu_incr(&self, id: u32);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_matches_encoders() {
        assert_eq!(
            Op::decode(opcode::setclass(class::GR2D, 0x2b, 0x3)),
            Op::SetClass {
                class: class::GR2D,
                offset: 0x2b,
                mask: 0x3
            }
        );
        assert_eq!(
            Op::decode(opcode::nonincr(uclass::INCR_SYNCPT, 1)),
            Op::NonIncr {
                offset: 0,
                count: 1
            }
        );
        assert_eq!(Op::decode(opcode::mask(0x10, 0b1011)).payload(), 3);
        assert_eq!(Op::decode(opcode::gather(16)), Op::Gather { count: 16 });
        assert_eq!(Op::decode(0x7000_0000), Op::Invalid(7));
        assert_eq!(Op::decode(0xe000_0000), Op::Extend);
        assert_eq!(uclass::incr_syncpt(uclass::COND_OP_DONE, 3), 0x103);
    }
}
