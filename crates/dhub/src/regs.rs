//! Register layouts and offsets of the dHub block.
//!
//! All offsets are byte offsets from the base of the block and every register is 32 bits wide.

use bitos::{
    bitos,
    integer::{u2, u5, u20},
};
use static_assertions::const_assert_eq;

/// Semaphore hub, shared by all channels.
pub mod sema {
    /// Query window: 64 words, addressed by [`super::SemaQueryAddr`].
    pub const QUERY: u32 = 0x000;
    pub const QUERY_LEN: u32 = 0x100;
    /// Semaphore cell array.
    pub const CELLS: u32 = 0x100;
    pub const CELL_STRIDE: u32 = 0x14;
    pub const CELL_COUNT: u32 = 32;

    pub const CELL_CFG: u32 = 0x00;
    pub const CELL_INTR: u32 = 0x04;
    pub const CELL_MASK: u32 = 0x10;

    pub const PUSH: u32 = 0x380;
    pub const POP: u32 = 0x384;
    pub const EMPTY: u32 = 0x388;
    pub const FULL: u32 = 0x38C;
    pub const ALMOST_EMPTY: u32 = 0x390;
    pub const ALMOST_FULL: u32 = 0x394;
}

/// Host buffer organizer: the FIFO descriptors backing channel queues.
pub mod hbo {
    pub const BASE: u32 = 0x400;
    pub const FIFOS: u32 = BASE + 0x400;
    pub const FIFO_STRIDE: u32 = 0x10;
    pub const FIFO_COUNT: u32 = 32;

    pub const FIFO_CFG: u32 = 0x0;
    pub const FIFO_START: u32 = 0x4;
    pub const FIFO_CLEAR: u32 = 0x8;
    pub const FIFO_FLUSH: u32 = 0xC;

    pub const BUSY: u32 = BASE + 0x600;
}

/// Per-channel control and the global status registers.
pub mod channel {
    pub const CONTROLS: u32 = 0xB00;
    pub const STRIDE: u32 = 0x10;
    pub const COUNT: u32 = 16;

    pub const CFG: u32 = 0x0;
    pub const START: u32 = 0x4;
    pub const CLEAR: u32 = 0x8;
    pub const FLUSH: u32 = 0xC;

    pub const BUSY: u32 = 0xC00;
    pub const PENDING: u32 = 0xC04;
    pub const BUS_RST_EN: u32 = 0xC08;
    pub const BUS_RST_DONE: u32 = 0xC0C;
    pub const FLOW_CTL: u32 = 0xC10;
    pub const AXI_CMD_COL: u32 = 0xC14;
}

/// 2D command blocks and channel state query.
pub mod cmd2d {
    pub const BLOCKS: u32 = 0xD00;
    pub const STRIDE: u32 = 0x20;

    pub const MEM: u32 = 0x00;
    pub const DESC: u32 = 0x04;
    pub const START: u32 = 0x08;
    pub const CLEAR: u32 = 0x0C;
    pub const HDR: u32 = 0x10;

    pub const BUSY: u32 = 0xF00;
    pub const CH_ST: u32 = 0xF40;
    pub const CH_ST_END: u32 = CH_ST + 4 * super::channel::COUNT;
}

/// Size of the whole register block.
pub const BLOCK_LEN: u32 = 0x1000;

const_assert_eq!(sema::CELLS + sema::CELL_STRIDE * sema::CELL_COUNT, sema::PUSH);
const_assert_eq!(hbo::FIFOS + hbo::FIFO_STRIDE * hbo::FIFO_COUNT, hbo::BUSY);
const_assert_eq!(channel::CONTROLS + channel::STRIDE * channel::COUNT, channel::BUSY);
const_assert_eq!(cmd2d::BLOCKS + cmd2d::STRIDE * channel::COUNT, cmd2d::BUSY);
const_assert_eq!(cmd2d::CH_ST_END, 0xF80);

/// Semaphore status flags. Used for the per-CPU interrupt masks, the latched status and the live
/// condition of a cell.
#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SemaFlags {
    #[bits(0)]
    pub empty: bool,
    #[bits(1)]
    pub full: bool,
    #[bits(2)]
    pub almost_empty: bool,
    #[bits(3)]
    pub almost_full: bool,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy)]
pub struct SemaCfg {
    #[bits(0..16)]
    pub depth: u16,
}

impl Default for SemaCfg {
    fn default() -> Self {
        Self::from_bits(0).with_depth(0xF)
    }
}

/// Counter bypass. The pointers are still maintained but the counter is no longer exact.
#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SemaBypass {
    #[bits(0)]
    pub never_full: bool,
    #[bits(1)]
    pub never_empty: bool,
}

impl SemaBypass {
    pub fn any(&self) -> bool {
        self.never_full() || self.never_empty()
    }
}

#[bitos(1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Master {
    #[default]
    Producer = 0,
    Consumer = 1,
}

/// Address decode of the semaphore query window.
#[bitos(8)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SemaQueryAddr {
    #[bits(0..2)]
    pub byte: u2,
    #[bits(2..7)]
    pub id: u5,
    #[bits(7)]
    pub master: Master,
}

/// Response of a semaphore query: the counter and the producer write pointer or consumer read
/// pointer, depending on the side queried.
#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SemaQuery {
    #[bits(0..16)]
    pub count: u16,
    #[bits(16..32)]
    pub pointer: u16,
}

/// Value written to PUSH or POP.
#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SemaUpdate {
    #[bits(0..8)]
    pub id: u8,
    #[bits(8..16)]
    pub delta: u8,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FifoCfg {
    #[bits(0..20)]
    pub base: u20,
}

/// START, CLEAR and FLUSH registers all carry a single enable bit.
#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Enable {
    #[bits(0)]
    pub en: bool,
}

#[bitos(2)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mtu {
    #[default]
    B8 = 0,
    B32 = 1,
    B128 = 2,
    B1024 = 3,
}

impl Mtu {
    pub fn bytes(self) -> u32 {
        match self {
            Self::B8 => 8,
            Self::B32 => 32,
            Self::B128 => 128,
            Self::B1024 => 1024,
        }
    }
}

#[bitos(1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterruptPolicy {
    /// Raise as soon as the command finishes.
    #[default]
    CmdDone = 0,
    /// Hold until the channel is fully idle.
    ChIdle = 1,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ChannelCfg {
    #[bits(0..2)]
    pub mtu: Mtu,
    #[bits(2)]
    pub qos: bool,
    #[bits(3)]
    pub self_loop: bool,
    #[bits(4)]
    pub intr_ctl: InterruptPolicy,
}

#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowCtl {
    #[bits(0..8)]
    pub r_alpha: u8,
    #[bits(8..16)]
    pub w_alpha: u8,
}

/// Issued bus command counters.
#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct AxiCmdCol {
    #[bits(0..16)]
    pub r_cnt: u16,
    #[bits(16..32)]
    pub w_cnt: u16,
}

#[cfg(test)]
mod test {
    use super::*;
    use bitos::integer::UnsignedInt;

    #[test]
    fn query_address_decode() {
        let addr = SemaQueryAddr::from_bits(0x80 | (3 << 2));
        assert_eq!(addr.id().value(), 3);
        assert_eq!(addr.master(), Master::Consumer);
        assert_eq!(addr.byte().value(), 0);
    }

    #[test]
    fn push_word_layout() {
        let update = SemaUpdate::from_bits(0x0503);
        assert_eq!(update.id(), 3);
        assert_eq!(update.delta(), 5);
    }

    #[test]
    fn channel_cfg_layout() {
        let cfg = ChannelCfg::from_bits(0b1_1101);
        assert_eq!(cfg.mtu(), Mtu::B32);
        assert!(cfg.qos());
        assert!(cfg.self_loop());
        assert_eq!(cfg.intr_ctl(), InterruptPolicy::ChIdle);
        assert_eq!(cfg.mtu().bytes(), 32);
    }
}
