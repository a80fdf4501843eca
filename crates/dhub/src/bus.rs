//! DRAM target and in-flight bus transactions.
use crate::{
    command::Command,
    error::{Access, FaultKind},
};

/// Flat DRAM behind the bus, with a fixed completion latency.
#[derive(Debug)]
pub struct Dram {
    data: Box<[u8]>,
    latency: u32,
}

impl Dram {
    pub fn new(len: u32, latency: u32) -> Self {
        Self {
            data: vec![0; len as usize].into_boxed_slice(),
            latency,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn latency(&self) -> u32 {
        self.latency
    }

    pub fn set_latency(&mut self, latency: u32) {
        self.latency = latency;
    }

    fn range(&self, addr: u32, len: usize) -> Option<std::ops::Range<usize>> {
        let start = addr as usize;
        let end = start.checked_add(len)?;
        (end <= self.data.len()).then_some(start..end)
    }

    pub fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), FaultKind> {
        let range = self
            .range(addr, buf.len())
            .ok_or(FaultKind::ErrorResponse)?;

        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    pub fn write(&mut self, addr: u32, bytes: &[u8]) -> Result<(), FaultKind> {
        let range = self
            .range(addr, bytes.len())
            .ok_or(FaultKind::ErrorResponse)?;

        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    /// Borrow of a DRAM region, if it is in range.
    pub fn slice(&self, addr: u32, len: usize) -> Option<&[u8]> {
        self.range(addr, len).map(|r| &self.data[r])
    }
}

/// A bus transaction issued by a channel and not yet completed.
#[derive(Debug)]
pub struct Transaction {
    /// Cycle at which the transaction completes.
    pub due: u64,
    pub addr: u32,
    pub len: usize,
    pub access: Access,
    /// Payload of a write.
    pub data: Vec<u8>,
    /// The target did not answer within the bus timeout.
    pub timed_out: bool,
    /// Data phase already performed, only the semaphore update is left.
    pub retired: bool,
    /// Semaphore to push once complete.
    pub update: Option<u8>,
    /// Set on the last transaction of a command.
    pub finishes: Option<Command>,
}
