//! Transfer descriptors.
use crate::regs::Mtu;
use bitos::{
    bitos,
    integer::{UnsignedInt, u2, u5, u13},
};
use easyerr::Error;

#[bitos(1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SizeUnit {
    #[default]
    Bytes = 0,
    Mtu = 1,
}

#[bitos(1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SemOp {
    /// Check and update once for the whole command.
    #[default]
    PerCommand = 0,
    /// Check and update once per MTU sized sub-transfer.
    PerMtu = 1,
}

/// Header of a dHub command (`dHubCmdHDR`).
#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct CmdHeader {
    #[bits(0..16)]
    pub size: u16,
    #[bits(16)]
    pub size_unit: SizeUnit,
    #[bits(17)]
    pub sem_op: SemOp,
    #[bits(18..23)]
    pub chk_sem_id: u5,
    #[bits(23..28)]
    pub upd_sem_id: u5,
    #[bits(28)]
    pub interrupt: bool,
}

impl CmdHeader {
    /// Bits with no assigned field.
    pub const RESERVED: u32 = 0xE000_0000;

    /// Plain byte-sized header with no semaphore operations.
    pub fn bytes(size: u16) -> Self {
        Self::default().with_size(size)
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command transfers zero bytes")]
    ZeroSize,
}

/// A linear (1D) transfer: `dHubCmd`, a DRAM address followed by a header.
#[derive(Debug, Clone, Copy)]
pub struct Command {
    pub addr: u32,
    pub header: CmdHeader,
}

impl PartialEq for Command {
    fn eq(&self, other: &Self) -> bool {
        self.to_bits() == other.to_bits()
    }
}

impl Eq for Command {}

impl Command {
    pub fn new(addr: u32, header: CmdHeader) -> Self {
        Self { addr, header }
    }

    /// Decodes the 64-bit in-memory form: address in the low word, header in the high word.
    pub fn from_bits(bits: u64) -> Self {
        Self {
            addr: bits as u32,
            header: CmdHeader::from_bits((bits >> 32) as u32),
        }
    }

    pub fn to_bits(&self) -> u64 {
        ((self.header.to_bits() as u64) << 32) | self.addr as u64
    }

    pub fn validate(&self) -> Result<(), CommandError> {
        if self.header.size() == 0 {
            return Err(CommandError::ZeroSize);
        }

        Ok(())
    }

    /// Total length in bytes on a channel with the given MTU.
    pub fn byte_len(&self, mtu: Mtu) -> u32 {
        let size = self.header.size() as u32;
        match self.header.size_unit() {
            SizeUnit::Bytes => size,
            SizeUnit::Mtu => size * mtu.bytes(),
        }
    }

    /// Semaphore checked before executing, if any.
    pub fn check_sem(&self) -> Option<u8> {
        Some(self.header.chk_sem_id().value()).filter(|&id| id != 0)
    }

    /// Semaphore updated on completion, if any.
    pub fn update_sem(&self) -> Option<u8> {
        Some(self.header.upd_sem_id().value()).filter(|&id| id != 0)
    }
}

/// Descriptor word of a 2D command.
#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct Cmd2DDesc {
    #[bits(0..16)]
    pub stride: u16,
    #[bits(16..29)]
    pub num_lines: u13,
    #[bits(29..31)]
    pub hdr_loop: u2,
    #[bits(31)]
    pub interrupt: bool,
}

impl Cmd2DDesc {
    /// Number of header templates cycled through. An encoded zero means four.
    pub fn loop_len(&self) -> usize {
        match self.hdr_loop().value() {
            0 => 4,
            n => n as usize,
        }
    }

    pub fn lines(&self) -> u32 {
        self.num_lines().value() as u32
    }
}

/// A strided transfer, expanded into one linear command per line.
#[derive(Debug, Clone, Copy, Default)]
pub struct Command2D {
    pub addr: u32,
    pub desc: Cmd2DDesc,
    pub headers: [CmdHeader; 4],
}
