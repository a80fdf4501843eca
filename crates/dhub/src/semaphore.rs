//! Semaphore hub.
//!
//! A bank of up to 32 counting semaphores shared by every channel and by the bridge. Each cell is
//! behind its own lock, so operations on one id are serialized while different ids proceed
//! independently.
use crate::{
    config::Thresholds,
    regs::{Master, SemaBypass, SemaCfg, SemaFlags, SemaQuery},
};
use easyerr::Error;
use std::sync::{Mutex, MutexGuard, PoisonError};
use strum::{FromRepr, VariantArray};

/// Number of CPUs with an interrupt line from the hub.
pub const CPUS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, VariantArray)]
#[repr(u8)]
pub enum Cpu {
    Cpu0 = 0,
    Cpu1 = 1,
    Cpu2 = 2,
}

/// Status flag kinds, in their bit order within [`SemaFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, VariantArray)]
#[repr(u8)]
pub enum Flag {
    Empty = 0,
    Full = 1,
    AlmostEmpty = 2,
    AlmostFull = 3,
}

impl Flag {
    fn mask(self) -> u32 {
        1 << self as u32
    }

    pub fn is_set(self, flags: SemaFlags) -> bool {
        flags.to_bits() & self.mask() != 0
    }
}

#[derive(Debug, Error)]
pub enum SemaphoreError {
    #[error("semaphore {f0} does not exist")]
    InvalidId(u8),
    #[error("popping {delta} from semaphore {id} would underflow")]
    Underflow { id: u8, delta: u32 },
    #[error("pushing {delta} to semaphore {id} would overflow")]
    Overflow { id: u8, delta: u32 },
    #[error("semaphore {f0} cannot have a depth of zero")]
    ZeroDepth(u8),
}

/// Expands the 8-bit delta field of PUSH/POP, where zero stands for 256.
pub fn expand_delta(raw: u8) -> u32 {
    if raw == 0 { 256 } else { raw as u32 }
}

#[derive(Debug, Clone)]
pub struct Semaphore {
    depth: u16,
    count: u32,
    wptr: u16,
    rptr: u16,
    /// Latched flags, cleared only by acknowledge.
    status: SemaFlags,
    masks: [SemaFlags; CPUS],
    bypass: SemaBypass,
}

impl Default for Semaphore {
    fn default() -> Self {
        Self {
            depth: SemaCfg::default().depth(),
            count: 0,
            wptr: 0,
            rptr: 0,
            status: SemaFlags::default(),
            masks: [SemaFlags::default(); CPUS],
            bypass: SemaBypass::default(),
        }
    }
}

fn advance(ptr: u16, delta: u32, depth: u16) -> u16 {
    ((ptr as u32 + delta) % depth.max(1) as u32) as u16
}

impl Semaphore {
    pub fn depth(&self) -> u16 {
        self.depth
    }

    pub fn count(&self) -> u16 {
        self.count as u16
    }

    /// Free entries left before the cell is full.
    pub fn room(&self) -> u32 {
        (self.depth as u32).saturating_sub(self.count)
    }

    fn flags(&self, thresholds: Thresholds) -> SemaFlags {
        let room = self.room();
        SemaFlags::default()
            .with_empty(self.count == 0)
            .with_full(room == 0)
            .with_almost_empty(self.count <= thresholds.almost_empty as u32)
            .with_almost_full(room <= thresholds.almost_full as u32)
    }

    fn produce(&mut self, delta: u32) -> bool {
        let depth = self.depth as u32;
        if self.count + delta > depth && !self.bypass.any() {
            return false;
        }

        self.count = (self.count + delta).min(depth);
        self.wptr = advance(self.wptr, delta, self.depth);
        true
    }

    fn consume(&mut self, delta: u32) -> bool {
        if delta > self.count && !self.bypass.any() {
            return false;
        }

        self.count = self.count.saturating_sub(delta);
        self.rptr = advance(self.rptr, delta, self.depth);
        true
    }

    fn reset(&mut self) {
        self.count = 0;
        self.wptr = 0;
        self.rptr = 0;
    }

    fn query(&self, master: Master) -> SemaQuery {
        let pointer = match master {
            Master::Producer => self.wptr,
            Master::Consumer => self.rptr,
        };

        SemaQuery::default()
            .with_count(self.count())
            .with_pointer(pointer)
    }
}

#[derive(Debug)]
pub struct SemaphoreHub {
    cells: Box<[Mutex<Semaphore>]>,
    thresholds: Thresholds,
}

impl SemaphoreHub {
    pub fn new(count: usize, thresholds: Thresholds) -> Self {
        Self {
            cells: (0..count).map(|_| Mutex::new(Semaphore::default())).collect(),
            thresholds,
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    fn cell(&self, id: u8) -> Result<MutexGuard<'_, Semaphore>, SemaphoreError> {
        self.cells
            .get(id as usize)
            .map(|cell| cell.lock().unwrap_or_else(PoisonError::into_inner))
            .ok_or(SemaphoreError::InvalidId(id))
    }

    /// Runs `op` on a cell and latches every flag that went from clear to set, all while holding
    /// the cell's lock.
    fn update<R>(&self, id: u8, op: impl FnOnce(&mut Semaphore) -> R) -> Result<R, SemaphoreError> {
        let mut cell = self.cell(id)?;
        let before = cell.flags(self.thresholds);
        let result = op(&mut cell);
        let after = cell.flags(self.thresholds);

        let raised = after.to_bits() & !before.to_bits();
        if raised != 0 {
            cell.status = SemaFlags::from_bits(cell.status.to_bits() | raised);
            for cpu in Cpu::VARIANTS {
                if cell.masks[*cpu as usize].to_bits() & raised != 0 {
                    tracing::debug!("semaphore {id} raised {raised:04b} towards {cpu:?}");
                }
            }
        }

        Ok(result)
    }

    /// Producer side: adds `delta` (0 meaning 256) to the counter.
    pub fn push(&self, id: u8, delta: u8) -> Result<(), SemaphoreError> {
        let delta = expand_delta(delta);
        if self.update(id, |cell| cell.produce(delta))? {
            Ok(())
        } else {
            Err(SemaphoreError::Overflow { id, delta })
        }
    }

    /// Consumer side: removes `delta` (0 meaning 256) from the counter.
    pub fn pop(&self, id: u8, delta: u8) -> Result<(), SemaphoreError> {
        let delta = expand_delta(delta);
        if self.update(id, |cell| cell.consume(delta))? {
            Ok(())
        } else {
            Err(SemaphoreError::Underflow { id, delta })
        }
    }

    /// Hardware producer update. Returns `false`, leaving the cell untouched, when there is no room.
    pub fn try_push(&self, id: u8, delta: u32) -> Result<bool, SemaphoreError> {
        self.update(id, |cell| cell.produce(delta))
    }

    /// Hardware consumer update. Returns `false`, leaving the cell untouched, when the counter is
    /// too low.
    pub fn try_pop(&self, id: u8, delta: u32) -> Result<bool, SemaphoreError> {
        self.update(id, |cell| cell.consume(delta))
    }

    /// Whether a producer update of `delta` would be accepted right now.
    pub fn can_push(&self, id: u8, delta: u32) -> Result<bool, SemaphoreError> {
        let cell = self.cell(id)?;
        Ok(cell.bypass.any() || cell.room() >= delta)
    }

    /// Whether a consumer update of `delta` would be accepted right now.
    pub fn can_pop(&self, id: u8, delta: u32) -> Result<bool, SemaphoreError> {
        let cell = self.cell(id)?;
        Ok(cell.bypass.any() || cell.count >= delta)
    }

    pub fn query(&self, id: u8, master: Master) -> Result<SemaQuery, SemaphoreError> {
        Ok(self.cell(id)?.query(master))
    }

    /// Consumer view of a cell: counter and read pointer.
    pub fn check(&self, id: u8) -> Result<SemaQuery, SemaphoreError> {
        self.query(id, Master::Consumer)
    }

    /// Free entries left in a cell.
    pub fn room(&self, id: u8) -> Result<u32, SemaphoreError> {
        Ok(self.cell(id)?.room())
    }

    pub fn depth(&self, id: u8) -> Result<u16, SemaphoreError> {
        Ok(self.cell(id)?.depth)
    }

    /// Writes the depth of a cell, which also resets its counter and pointers.
    pub fn configure(&self, id: u8, depth: u16) -> Result<(), SemaphoreError> {
        if depth == 0 {
            return Err(SemaphoreError::ZeroDepth(id));
        }

        self.update(id, |cell| {
            cell.depth = depth;
            cell.reset();
        })?;
        tracing::debug!("semaphore {id} configured with depth {depth}");

        Ok(())
    }

    /// Resets the counter and pointers of a cell, keeping its depth.
    pub fn reset(&self, id: u8) -> Result<(), SemaphoreError> {
        self.update(id, Semaphore::reset)
    }

    /// Live condition of a cell.
    pub fn flags(&self, id: u8) -> Result<SemaFlags, SemaphoreError> {
        Ok(self.cell(id)?.flags(self.thresholds))
    }

    /// Latched status of a cell.
    pub fn status(&self, id: u8) -> Result<SemaFlags, SemaphoreError> {
        Ok(self.cell(id)?.status)
    }

    pub fn acknowledge(&self, id: u8, flag: Flag) -> Result<(), SemaphoreError> {
        let mut cell = self.cell(id)?;
        cell.status = SemaFlags::from_bits(cell.status.to_bits() & !flag.mask());
        Ok(())
    }

    pub fn set_interrupt_mask(&self, id: u8, cpu: Cpu, mask: SemaFlags) -> Result<(), SemaphoreError> {
        self.cell(id)?.masks[cpu as usize] = mask;
        Ok(())
    }

    pub fn interrupt_mask(&self, id: u8, cpu: Cpu) -> Result<SemaFlags, SemaphoreError> {
        Ok(self.cell(id)?.masks[cpu as usize])
    }

    pub fn set_bypass(&self, id: u8, bypass: SemaBypass) -> Result<(), SemaphoreError> {
        self.cell(id)?.bypass = bypass;
        Ok(())
    }

    pub fn bypass(&self, id: u8) -> Result<SemaBypass, SemaphoreError> {
        Ok(self.cell(id)?.bypass)
    }

    /// Latched status of one flag kind across all cells, one bit per cell.
    pub fn status_bits(&self, flag: Flag) -> u32 {
        (0..self.cells.len() as u8)
            .filter(|&id| self.status(id).is_ok_and(|s| flag.is_set(s)))
            .fold(0, |acc, id| acc | (1 << id))
    }

    /// Write-one-to-clear on one flag kind across all cells.
    pub fn acknowledge_bits(&self, flag: Flag, bits: u32) {
        for id in 0..self.cells.len() as u8 {
            if bits & (1 << id) != 0 {
                // id is in range by construction
                let _ = self.acknowledge(id, flag);
            }
        }
    }

    /// Cells currently asserting the interrupt line of `cpu`, one bit per cell.
    pub fn pending(&self, cpu: Cpu) -> u32 {
        let mut bits = 0;
        for (id, cell) in self.cells.iter().enumerate() {
            let cell = cell.lock().unwrap_or_else(PoisonError::into_inner);
            if cell.status.to_bits() & cell.masks[cpu as usize].to_bits() != 0 {
                bits |= 1 << id;
            }
        }

        bits
    }

    /// Level of the interrupt line towards `cpu`.
    pub fn interrupt(&self, cpu: Cpu) -> bool {
        self.pending(cpu) != 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn hub() -> SemaphoreHub {
        SemaphoreHub::new(32, Thresholds::default())
    }

    #[test]
    fn push_pop_scenario() {
        let hub = hub();
        assert_eq!(hub.depth(3).unwrap(), 0xF);

        hub.push(3, 5).unwrap();
        let flags = hub.flags(3).unwrap();
        assert_eq!(hub.check(3).unwrap().count(), 5);
        assert!(!flags.empty());
        assert!(!flags.full());

        hub.pop(3, 5).unwrap();
        assert_eq!(hub.check(3).unwrap().count(), 0);
        assert!(hub.flags(3).unwrap().empty());
        assert!(hub.status(3).unwrap().empty());

        assert!(matches!(
            hub.pop(3, 1),
            Err(SemaphoreError::Underflow { id: 3, delta: 1 })
        ));
    }

    #[test]
    fn precheck_matches_update() {
        let hub = hub();
        hub.configure(4, 2).unwrap();
        assert!(hub.can_push(4, 2).unwrap());
        assert!(!hub.can_push(4, 3).unwrap());
        assert!(!hub.can_pop(4, 1).unwrap());

        hub.push(4, 2).unwrap();
        assert!(!hub.can_push(4, 1).unwrap());
        assert!(hub.can_pop(4, 2).unwrap());

        hub.set_bypass(4, SemaBypass::default().with_never_full(true))
            .unwrap();
        assert!(hub.can_push(4, 1).unwrap());
        assert!(hub.can_push(9, 1).is_ok());
        assert!(hub.can_pop(40, 1).is_err());
    }

    #[test]
    fn zero_delta_is_256() {
        let a = hub();
        let b = hub();
        a.configure(1, 1000).unwrap();
        b.configure(1, 1000).unwrap();

        a.push(1, 0).unwrap();
        b.try_push(1, 256).unwrap();
        assert_eq!(a.check(1).unwrap().count(), 256);
        assert_eq!(
            a.query(1, Master::Producer).unwrap().to_bits(),
            b.query(1, Master::Producer).unwrap().to_bits()
        );

        a.pop(1, 0).unwrap();
        assert_eq!(a.check(1).unwrap().count(), 0);
        assert_eq!(a.check(1).unwrap().pointer(), 256);
    }

    #[test]
    fn push_then_pop_restores_state() {
        let hub = hub();
        hub.push(4, 3).unwrap();
        let count = hub.check(4).unwrap().count();
        let flags = hub.flags(4).unwrap().to_bits();

        hub.push(4, 12).unwrap();
        assert!(hub.flags(4).unwrap().full());
        hub.pop(4, 12).unwrap();

        assert_eq!(hub.check(4).unwrap().count(), count);
        assert_eq!(hub.flags(4).unwrap().to_bits(), flags);
    }

    #[test]
    fn overflow_is_rejected_without_bypass() {
        let hub = hub();
        hub.configure(2, 4).unwrap();
        hub.push(2, 4).unwrap();
        assert!(matches!(
            hub.push(2, 1),
            Err(SemaphoreError::Overflow { id: 2, delta: 1 })
        ));
        assert!(!hub.try_push(2, 1).unwrap());
        assert_eq!(hub.check(2).unwrap().count(), 4);
    }

    #[test]
    fn bypass_saturates() {
        let hub = hub();
        hub.configure(6, 4).unwrap();
        hub.set_bypass(6, SemaBypass::default().with_never_empty(true))
            .unwrap();

        hub.pop(6, 2).unwrap();
        assert_eq!(hub.check(6).unwrap().count(), 0);
        assert_eq!(hub.check(6).unwrap().pointer(), 2);

        hub.set_bypass(6, SemaBypass::default().with_never_full(true))
            .unwrap();
        hub.push(6, 9).unwrap();
        assert_eq!(hub.check(6).unwrap().count(), 4);
        assert_eq!(hub.query(6, Master::Producer).unwrap().pointer(), 1);
    }

    #[test]
    fn invalid_id() {
        let hub = SemaphoreHub::new(8, Thresholds::default());
        assert!(matches!(hub.push(8, 1), Err(SemaphoreError::InvalidId(8))));
        assert!(matches!(hub.check(31), Err(SemaphoreError::InvalidId(31))));
    }

    #[test]
    fn configure_resets_counters() {
        let hub = hub();
        hub.push(5, 7).unwrap();
        hub.configure(5, 10).unwrap();
        assert_eq!(hub.check(5).unwrap().count(), 0);
        assert_eq!(hub.depth(5).unwrap(), 10);
        assert!(matches!(
            hub.configure(5, 0),
            Err(SemaphoreError::ZeroDepth(5))
        ));
    }

    #[test]
    fn almost_flags_follow_thresholds() {
        let hub = SemaphoreHub::new(
            4,
            Thresholds {
                almost_empty: 2,
                almost_full: 3,
            },
        );
        hub.configure(1, 10).unwrap();

        let flags = hub.flags(1).unwrap();
        assert!(flags.empty() && flags.almost_empty());

        hub.push(1, 2).unwrap();
        let flags = hub.flags(1).unwrap();
        assert!(!flags.empty() && flags.almost_empty());

        hub.push(1, 5).unwrap();
        let flags = hub.flags(1).unwrap();
        assert!(!flags.almost_empty() && flags.almost_full() && !flags.full());

        hub.push(1, 3).unwrap();
        let flags = hub.flags(1).unwrap();
        assert!(flags.full() && flags.almost_full());
    }

    #[test]
    fn status_is_latched_until_acknowledged() {
        let hub = hub();
        hub.configure(7, 2).unwrap();
        hub.set_interrupt_mask(7, Cpu::Cpu1, SemaFlags::default().with_full(true))
            .unwrap();

        hub.push(7, 2).unwrap();
        assert!(hub.interrupt(Cpu::Cpu1));
        assert!(!hub.interrupt(Cpu::Cpu0));
        assert_eq!(hub.pending(Cpu::Cpu1), 1 << 7);

        // draining does not clear the latch
        hub.pop(7, 2).unwrap();
        assert!(hub.status(7).unwrap().full());
        assert_eq!(hub.status_bits(Flag::Full), 1 << 7);

        hub.acknowledge_bits(Flag::Full, 1 << 7);
        assert!(!hub.status(7).unwrap().full());
        assert!(!hub.interrupt(Cpu::Cpu1));

        // empty is still latched and unaffected by the full acknowledge
        assert!(hub.status(7).unwrap().empty());
        hub.acknowledge(7, Flag::Empty).unwrap();
        assert!(!hub.status(7).unwrap().empty());
    }

    #[test]
    fn reconfigure_latches_empty() {
        let hub = hub();
        hub.configure(4, 2).unwrap();
        hub.push(4, 2).unwrap();
        hub.acknowledge(4, Flag::Empty).unwrap();
        assert!(!hub.status(4).unwrap().empty());

        hub.configure(4, 3).unwrap();
        assert!(hub.status(4).unwrap().empty());

        hub.acknowledge(4, Flag::Empty).unwrap();
        hub.push(4, 1).unwrap();
        hub.reset(4).unwrap();
        assert!(hub.status(4).unwrap().empty());
        assert_eq!(hub.depth(4).unwrap(), 3);
    }

    #[test]
    fn concurrent_updates_are_not_lost() {
        let hub = hub();
        hub.configure(9, 1000).unwrap();
        hub.push(9, 100).unwrap();

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        while !hub.try_push(9, 1).unwrap() {}
                        while !hub.try_pop(9, 1).unwrap() {}
                    }
                });
            }
        });

        let query = hub.check(9).unwrap();
        assert_eq!(query.count(), 100);
        assert_eq!(
            hub.query(9, Master::Producer).unwrap().pointer(),
            (100 + 4000) % 1000
        );
        assert_eq!(query.pointer(), 4000 % 1000);
    }
}
