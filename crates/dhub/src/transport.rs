//! Register transport: how a driver reaches a register block.
use crate::error::FaultKind;
use easyerr::Error;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BusFault {
    #[error("register access at 0x{f0:04X} timed out")]
    Timeout(u32),
    #[error("register access at 0x{f0:04X} answered with an error response")]
    ErrorResponse(u32),
}

impl BusFault {
    pub fn new(offset: u32, kind: FaultKind) -> Self {
        match kind {
            FaultKind::Timeout => Self::Timeout(offset),
            FaultKind::ErrorResponse => Self::ErrorResponse(offset),
        }
    }

    pub fn offset(self) -> u32 {
        match self {
            Self::Timeout(offset) | Self::ErrorResponse(offset) => offset,
        }
    }

    pub fn kind(self) -> FaultKind {
        match self {
            Self::Timeout(_) => FaultKind::Timeout,
            Self::ErrorResponse(_) => FaultKind::ErrorResponse,
        }
    }
}

/// 32-bit register access at byte offsets.
pub trait RegisterTransport {
    fn read_register(&mut self, offset: u32) -> Result<u32, BusFault>;
    fn write_register(&mut self, offset: u32, value: u32) -> Result<(), BusFault>;
}

impl<T: RegisterTransport + ?Sized> RegisterTransport for &mut T {
    fn read_register(&mut self, offset: u32) -> Result<u32, BusFault> {
        (**self).read_register(offset)
    }

    fn write_register(&mut self, offset: u32, value: u32) -> Result<(), BusFault> {
        (**self).write_register(offset, value)
    }
}

/// In-memory register block. Unwritten registers read as zero.
#[derive(Debug, Default)]
pub struct RegisterFile {
    values: HashMap<u32, u32>,
    faults: HashMap<u32, FaultKind>,
    writes: Vec<(u32, u32)>,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values(values: impl IntoIterator<Item = (u32, u32)>) -> Self {
        Self {
            values: values.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Sets a register without logging a write.
    pub fn set(&mut self, offset: u32, value: u32) {
        self.values.insert(offset, value);
    }

    pub fn get(&self, offset: u32) -> u32 {
        self.values.get(&offset).copied().unwrap_or(0)
    }

    /// Makes every access to `offset` fail with `kind`.
    pub fn inject(&mut self, offset: u32, kind: FaultKind) {
        self.faults.insert(offset, kind);
    }

    pub fn heal(&mut self, offset: u32) {
        self.faults.remove(&offset);
    }

    /// Writes in the order they happened.
    pub fn writes(&self) -> &[(u32, u32)] {
        &self.writes
    }

    fn fault(&self, offset: u32) -> Result<(), BusFault> {
        match self.faults.get(&offset) {
            Some(&kind) => Err(BusFault::new(offset, kind)),
            None => Ok(()),
        }
    }
}

impl RegisterTransport for RegisterFile {
    fn read_register(&mut self, offset: u32) -> Result<u32, BusFault> {
        self.fault(offset)?;
        Ok(self.get(offset))
    }

    fn write_register(&mut self, offset: u32, value: u32) -> Result<(), BusFault> {
        self.fault(offset)?;
        self.values.insert(offset, value);
        self.writes.push((offset, value));
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn register_file() {
        let mut regs = RegisterFile::with_values([(0x10, 7)]);
        assert_eq!(regs.read_register(0x10), Ok(7));
        assert_eq!(regs.read_register(0x14), Ok(0));

        regs.write_register(0x14, 3).unwrap();
        regs.inject(0x18, FaultKind::Timeout);
        assert_eq!(regs.write_register(0x18, 1), Err(BusFault::Timeout(0x18)));
        assert_eq!(regs.writes(), &[(0x14, 3)]);

        regs.heal(0x18);
        assert_eq!(regs.read_register(0x18), Ok(0));
    }

    #[test]
    fn fault_kind_round_trip() {
        let fault = BusFault::new(0x40, FaultKind::ErrorResponse);
        assert_eq!(fault.kind(), FaultKind::ErrorResponse);
        assert_eq!(fault.offset(), 0x40);
    }
}
