// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! host1x engine clients
//!
//! A client is one of the engines user space can submit work to. It owns the syncpoints jobs
//! on it may increment and knows which of its registers hold memory addresses, which the
//! firewall only lets user space write through relocations.

use kernel::prelude::*;

use crate::{
    debug::*,
    hw::class,
    syncpt::{Syncpoint, SyncptManager},
};

const DEBUG_CLASS: DebugFlags = DebugFlags::Channel;

/// Hardware module ids, used to build execution contexts.
pub mod module {
    pub const GR2D: u32 = 1;
    pub const GR3D: u32 = 2;
}

const NUM_REGS: usize = 0x1000;

const GR2D_ADDR_REGS: &[u32] = &[
    0x1a, // UA_BASE_ADDR
    0x1b, // VA_BASE_ADDR
    0x26, // PAT_BASE_ADDR
    0x2b, // DSTA_BASE_ADDR
    0x2c, // DSTB_BASE_ADDR
    0x2d, // DSTC_BASE_ADDR
    0x31, // SRCA_BASE_ADDR
    0x32, // SRCB_BASE_ADDR
    0x47, // PATBASE_ADDR
    0x48, // SRC_BASE_ADDR_SB
    0x49, // DSTA_BASE_ADDR_SB
    0x4a, // DSTB_BASE_ADDR_SB
    0x4b, // UA_BASE_ADDR_SB
    0x4c, // VA_BASE_ADDR_SB
];

/// Register ranges holding addresses on the 3D engine, as `(first, count, stride)`.
const GR3D_ADDR_REGS: &[(u32, u32, u32)] = &[
    (0x100, 16, 2), // IDX_ATTRIBUTE
    (0x121, 1, 1),  // IDX_INDEX_BASE
    (0x415, 1, 1),  // QR_ZTAG_ADDR
    (0x417, 1, 1),  // QR_CTAG_ADDR
    (0x419, 1, 1),  // QR_CZ_ADDR
    (0x710, 16, 1), // TEX_TEX_ADDR
    (0x904, 1, 1),  // DW_MEMORY_OUTPUT_ADDRESS
    (0xe00, 16, 1), // GLOBAL_SURFADDR
    (0xe2a, 1, 1),  // GLOBAL_SPILLSURFADDR
    (0xe30, 16, 1), // GLOBAL_SURFOVERADDR
    (0xe50, 16, 1), // GLOBAL_SAMP01SURFADDR
    (0xe60, 16, 1), // GLOBAL_SAMP23SURFADDR
];

/// Register of the host1x class holding an address on every client.
const HOST1X_ADDR_REG: u32 = 0x2b;

/// Engine kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClientKind {
    /// The 2D engine.
    Gr2d,
    /// The 3D engine.
    Gr3d,
}

struct AddrRegs([u64; NUM_REGS / 64]);

impl AddrRegs {
    fn new() -> AddrRegs {
        AddrRegs([0; NUM_REGS / 64])
    }

    fn set(&mut self, reg: u32) {
        let reg = reg as usize;
        if reg < NUM_REGS {
            self.0[reg / 64] |= 1 << (reg % 64);
        }
    }

    fn test(&self, reg: u32) -> bool {
        let reg = reg as usize;
        reg < NUM_REGS && self.0[reg / 64] & 1 << (reg % 64) != 0
    }
}

/// An engine user space can submit jobs to.
pub struct Client {
    kind: ClientKind,
    class: u32,
    module: u32,
    channel: u32,
    syncpts: Vec<Arc<Syncpoint>>,
    addr_regs: AddrRegs,
}

impl Client {
    /// Creates a client of kind `kind` submitting through channel `channel`, allocating its
    /// syncpoint.
    pub fn new(kind: ClientKind, channel: u32, syncpts: &SyncptManager) -> Result<Arc<Client>> {
        let mut addr_regs = AddrRegs::new();
        let (class, module, name) = match kind {
            ClientKind::Gr2d => {
                GR2D_ADDR_REGS.iter().for_each(|r| addr_regs.set(*r));
                (class::GR2D, module::GR2D, "gr2d")
            }
            ClientKind::Gr3d => {
                for &(first, count, stride) in GR3D_ADDR_REGS {
                    (0..count).for_each(|i| addr_regs.set(first + i * stride));
                }
                (class::GR3D, module::GR3D, "gr3d")
            }
        };

        let sp = syncpts.alloc(name, false)?;
        mod_pr_debug!("client: {} on channel {} with syncpt {}", name, channel, sp.id());

        Ok(Arc::new(Client {
            kind,
            class,
            module,
            channel,
            syncpts: vec![sp],
            addr_regs,
        }))
    }

    /// Returns the engine kind.
    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    /// Returns the class jobs on this client run in.
    pub fn class(&self) -> u32 {
        self.class
    }

    /// Returns the hardware module id.
    pub fn module(&self) -> u32 {
        self.module
    }

    /// Returns the channel index.
    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// Returns the client's syncpoints.
    pub fn syncpts(&self) -> &[Arc<Syncpoint>] {
        &self.syncpts
    }

    /// Returns whether the client owns syncpoint `id`.
    pub fn owns_syncpt(&self, id: u32) -> bool {
        self.syncpts.iter().any(|sp| sp.id() == id)
    }

    /// Returns whether user streams of this client may switch to class `cls`.
    pub fn is_valid_class(&self, cls: u32) -> bool {
        cls == self.class || (self.kind == ClientKind::Gr2d && cls == class::GR2D_SB)
    }

    /// Returns whether register `offset` of class `cls` holds a memory address.
    pub fn is_addr_reg(&self, cls: u32, offset: u32) -> bool {
        match cls {
            class::HOST1X => offset == HOST1X_ADDR_REG,
            c if c == self.class => self.addr_regs.test(offset),
            class::GR2D_SB if self.kind == ClientKind::Gr2d => self.addr_regs.test(offset),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::sim::SimHost;

    #[test]
    fn address_registers() {
        let host = SimHost::new(4, true);
        let mgr = SyncptManager::new(host);
        let gr2d = Client::new(ClientKind::Gr2d, 0, &mgr).unwrap();
        let gr3d = Client::new(ClientKind::Gr3d, 1, &mgr).unwrap();

        assert!(gr2d.is_addr_reg(class::GR2D, 0x2b));
        assert!(gr2d.is_addr_reg(class::GR2D_SB, 0x4c));
        assert!(!gr2d.is_addr_reg(class::GR2D, 0x2e));
        assert!(gr2d.is_addr_reg(class::HOST1X, 0x2b));
        assert!(!gr2d.is_addr_reg(class::GR3D, 0x2b));

        assert!(gr3d.is_addr_reg(class::GR3D, 0x102));
        assert!(!gr3d.is_addr_reg(class::GR3D, 0x101));
        assert!(gr3d.is_addr_reg(class::GR3D, 0x71f));
        assert!(!gr3d.is_addr_reg(class::GR3D, 0x2000));

        assert!(gr2d.is_valid_class(class::GR2D_SB));
        assert!(!gr3d.is_valid_class(class::GR2D_SB));
        assert!(!gr2d.is_valid_class(class::HOST1X));

        assert!(gr2d.owns_syncpt(gr2d.syncpts()[0].id()));
        assert!(!gr2d.owns_syncpt(gr3d.syncpts()[0].id()));
    }
}
