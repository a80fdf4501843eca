//! Data FIFOs carved out of the shared on-chip SRAM.
use easyerr::Error;
use std::collections::VecDeque;

/// SRAM data bus width. FIFO bases and sizes are multiples of it.
pub const SRAM_WORD: u32 = 8;

#[derive(Debug, Error)]
pub enum FifoError {
    #[error("FIFO base 0x{f0:05X} is not aligned to the SRAM word")]
    Misaligned(u32),
    #[error("FIFO at 0x{base:05X} with {len} bytes does not fit in SRAM")]
    OutOfRange { base: u32, len: u32 },
    #[error("FIFO at 0x{base:05X} overlaps the FIFO at 0x{other:05X}")]
    Overlap { base: u32, other: u32 },
    #[error("FIFO size of {f0} bytes is not a non-zero multiple of the SRAM word")]
    BadLength(u32),
}

/// A byte FIFO. Owned by exactly one channel.
#[derive(Debug)]
pub struct Fifo {
    base: u32,
    capacity: usize,
    data: VecDeque<u8>,
    /// Bytes promised to in-flight read transactions.
    reserved: usize,
    enabled: bool,
}

impl Fifo {
    fn new(base: u32, capacity: u32) -> Self {
        Self {
            base,
            capacity: capacity as usize,
            data: VecDeque::with_capacity(capacity as usize),
            reserved: 0,
            enabled: true,
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Room left for new data, accounting for reservations.
    pub fn free(&self) -> usize {
        self.capacity - self.data.len() - self.reserved
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// Drops all content. Ignored unless the FIFO is stopped.
    pub fn clear(&mut self) -> bool {
        if self.enabled {
            tracing::warn!("ignoring clear of running FIFO at 0x{:05X}", self.base);
            return false;
        }

        self.data.clear();
        self.reserved = 0;
        true
    }

    /// Reserves room for `len` bytes to be delivered later through [`Fifo::fill`].
    pub fn reserve(&mut self, len: usize) -> bool {
        if !self.enabled || self.free() < len {
            return false;
        }

        self.reserved += len;
        true
    }

    /// Delivers previously reserved bytes.
    pub fn fill(&mut self, bytes: &[u8]) {
        let len = bytes.len().min(self.reserved);
        self.reserved -= len;
        self.data.extend(&bytes[..len]);
    }

    /// Pushes bytes from the device side. All or nothing.
    pub fn push(&mut self, bytes: &[u8]) -> bool {
        if !self.enabled || self.free() < bytes.len() {
            return false;
        }

        self.data.extend(bytes);
        true
    }

    /// Pops exactly `len` bytes, or nothing if fewer are available.
    pub fn pop(&mut self, len: usize) -> Option<Vec<u8>> {
        if !self.enabled || self.data.len() < len {
            return None;
        }

        Some(self.data.drain(..len).collect())
    }

    /// Pops up to `len` bytes.
    pub fn pop_partial(&mut self, len: usize) -> Vec<u8> {
        if !self.enabled {
            return Vec::new();
        }

        let len = len.min(self.data.len());
        self.data.drain(..len).collect()
    }
}

/// Allocator and register view of the FIFO descriptors in SRAM.
#[derive(Debug)]
pub struct FifoBank {
    sram_len: u32,
    regions: Vec<(u32, u32)>,
}

impl FifoBank {
    pub fn new(sram_len: u32) -> Self {
        Self {
            sram_len,
            regions: Vec::new(),
        }
    }

    fn check(&self, base: u32, len: u32, skip: Option<u32>) -> Result<(), FifoError> {
        if base % SRAM_WORD != 0 {
            return Err(FifoError::Misaligned(base));
        }

        if len == 0 || len % SRAM_WORD != 0 {
            return Err(FifoError::BadLength(len));
        }

        if base.checked_add(len).is_none_or(|end| end > self.sram_len) {
            return Err(FifoError::OutOfRange { base, len });
        }

        let overlap = self
            .regions
            .iter()
            .filter(|(other, _)| Some(*other) != skip)
            .find(|&&(other, other_len)| base < other + other_len && other < base + len);

        if let Some(&(other, _)) = overlap {
            return Err(FifoError::Overlap { base, other });
        }

        Ok(())
    }

    /// Carves a new FIFO out of SRAM.
    pub fn allocate(&mut self, base: u32, len: u32) -> Result<Fifo, FifoError> {
        self.check(base, len, None)?;
        self.regions.push((base, len));
        Ok(Fifo::new(base, len))
    }

    /// Moves an existing FIFO to a new base, keeping its size. Content is dropped.
    pub fn relocate(&mut self, fifo: &mut Fifo, base: u32) -> Result<(), FifoError> {
        let len = fifo.capacity as u32;
        self.check(base, len, Some(fifo.base))?;

        if let Some(region) = self.regions.iter_mut().find(|(b, _)| *b == fifo.base) {
            region.0 = base;
        }

        *fifo = Fifo {
            enabled: fifo.enabled,
            ..Fifo::new(base, len)
        };

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn allocation_checks() {
        let mut bank = FifoBank::new(0x1000);
        bank.allocate(0, 0x800).unwrap();

        assert!(matches!(
            bank.allocate(0x7F8, 0x10),
            Err(FifoError::Overlap { other: 0, .. })
        ));
        assert!(matches!(
            bank.allocate(0x804, 0x10),
            Err(FifoError::Misaligned(0x804))
        ));
        assert!(matches!(
            bank.allocate(0xC00, 0x800),
            Err(FifoError::OutOfRange { .. })
        ));
        assert!(matches!(
            bank.allocate(0x800, 0),
            Err(FifoError::BadLength(0))
        ));

        bank.allocate(0x800, 0x800).unwrap();
    }

    #[test]
    fn relocate_keeps_size() {
        let mut bank = FifoBank::new(0x1000);
        let mut fifo = bank.allocate(0, 0x400).unwrap();
        fifo.push(&[1, 2, 3]);

        bank.relocate(&mut fifo, 0x200).unwrap();
        assert_eq!(fifo.base(), 0x200);
        assert_eq!(fifo.capacity(), 0x400);
        assert!(fifo.is_empty());
    }

    #[test]
    fn reservations_hold_room() {
        let mut bank = FifoBank::new(0x100);
        let mut fifo = bank.allocate(0, 16).unwrap();

        assert!(fifo.reserve(10));
        assert!(!fifo.push(&[0; 8]));
        assert!(fifo.push(&[0; 6]));

        fifo.fill(&[1; 10]);
        assert_eq!(fifo.len(), 16);
        assert_eq!(fifo.free(), 0);
        assert_eq!(fifo.pop(6).unwrap(), vec![0; 6]);
        assert_eq!(fifo.pop_partial(100), vec![1; 10]);
    }

    #[test]
    fn clear_only_when_stopped() {
        let mut bank = FifoBank::new(0x100);
        let mut fifo = bank.allocate(0, 16).unwrap();
        fifo.push(&[7; 4]);

        assert!(!fifo.clear());
        assert_eq!(fifo.len(), 4);

        fifo.set_enabled(false);
        assert!(fifo.clear());
        assert!(fifo.is_empty());
    }
}
