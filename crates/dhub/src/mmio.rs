//! Register decode of the dHub block.
use crate::{
    Dhub,
    channel::{Channel, State},
    command::{CmdHeader, Cmd2DDesc},
    regs::{
        self, ChannelCfg, Enable, FifoCfg, FlowCtl, Master, SemaBypass, SemaCfg,
        SemaFlags, SemaQueryAddr, SemaUpdate, channel, cmd2d, hbo, sema,
    },
    semaphore::{Cpu, Flag, SemaphoreError},
    transport::{BusFault, RegisterTransport},
};
use bitos::integer::{UnsignedInt, u20};

/// A register of the dHub block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reg {
    Query { id: u8, master: Master },
    SemaCfg(u8),
    SemaIntr(u8, Cpu),
    SemaMask(u8),
    Push,
    Pop,
    Status(Flag),
    FifoCfg(u8),
    FifoStart(u8),
    FifoClear(u8),
    FifoFlush(u8),
    HboBusy,
    ChannelCfg(u8),
    ChannelStart(u8),
    ChannelClear(u8),
    ChannelFlush(u8),
    Busy,
    Pending,
    BusRstEn,
    BusRstDone,
    FlowCtl,
    AxiCmdCol,
    Mem2D(u8),
    Desc2D(u8),
    Start2D(u8),
    Clear2D(u8),
    Hdr2D(u8, u8),
    Busy2D,
    ChSt(u8),
}

impl Reg {
    /// Decodes a byte offset into the block. Only aligned words are mapped.
    pub fn find(offset: u32) -> Option<Self> {
        if offset % 4 != 0 || offset >= regs::BLOCK_LEN {
            return None;
        }

        let reg = match offset {
            sema::QUERY..sema::QUERY_LEN => {
                let addr = SemaQueryAddr::from_bits(offset as u8);
                Self::Query {
                    id: addr.id().value(),
                    master: addr.master(),
                }
            }
            sema::CELLS..sema::PUSH => {
                let rel = offset - sema::CELLS;
                let id = (rel / sema::CELL_STRIDE) as u8;
                match rel % sema::CELL_STRIDE {
                    sema::CELL_CFG => Self::SemaCfg(id),
                    sema::CELL_MASK => Self::SemaMask(id),
                    n => Self::SemaIntr(id, Cpu::from_repr(((n - sema::CELL_INTR) / 4) as u8)?),
                }
            }
            sema::PUSH => Self::Push,
            sema::POP => Self::Pop,
            sema::EMPTY => Self::Status(Flag::Empty),
            sema::FULL => Self::Status(Flag::Full),
            sema::ALMOST_EMPTY => Self::Status(Flag::AlmostEmpty),
            sema::ALMOST_FULL => Self::Status(Flag::AlmostFull),
            hbo::FIFOS..hbo::BUSY => {
                let rel = offset - hbo::FIFOS;
                let index = (rel / hbo::FIFO_STRIDE) as u8;
                match rel % hbo::FIFO_STRIDE {
                    hbo::FIFO_CFG => Self::FifoCfg(index),
                    hbo::FIFO_START => Self::FifoStart(index),
                    hbo::FIFO_CLEAR => Self::FifoClear(index),
                    _ => Self::FifoFlush(index),
                }
            }
            hbo::BUSY => Self::HboBusy,
            channel::CONTROLS..channel::BUSY => {
                let rel = offset - channel::CONTROLS;
                let index = (rel / channel::STRIDE) as u8;
                match rel % channel::STRIDE {
                    channel::CFG => Self::ChannelCfg(index),
                    channel::START => Self::ChannelStart(index),
                    channel::CLEAR => Self::ChannelClear(index),
                    _ => Self::ChannelFlush(index),
                }
            }
            channel::BUSY => Self::Busy,
            channel::PENDING => Self::Pending,
            channel::BUS_RST_EN => Self::BusRstEn,
            channel::BUS_RST_DONE => Self::BusRstDone,
            channel::FLOW_CTL => Self::FlowCtl,
            channel::AXI_CMD_COL => Self::AxiCmdCol,
            cmd2d::BLOCKS..cmd2d::BUSY => {
                let rel = offset - cmd2d::BLOCKS;
                let index = (rel / cmd2d::STRIDE) as u8;
                match rel % cmd2d::STRIDE {
                    cmd2d::MEM => Self::Mem2D(index),
                    cmd2d::DESC => Self::Desc2D(index),
                    cmd2d::START => Self::Start2D(index),
                    cmd2d::CLEAR => Self::Clear2D(index),
                    n => Self::Hdr2D(index, ((n - cmd2d::HDR) / 4) as u8),
                }
            }
            cmd2d::BUSY => Self::Busy2D,
            cmd2d::CH_ST..cmd2d::CH_ST_END => Self::ChSt(((offset - cmd2d::CH_ST) / 4) as u8),
            _ => return None,
        };

        Some(reg)
    }
}

/// Maps a semaphore result to a register access outcome. Bad ids are unmapped, every other error
/// is a rejected write.
fn semaphore_write(result: Result<(), SemaphoreError>) -> Option<()> {
    match result {
        Ok(()) => Some(()),
        Err(SemaphoreError::InvalidId(_)) => None,
        Err(e) => {
            tracing::warn!("semaphore register write rejected: {e}");
            Some(())
        }
    }
}

fn enabled(value: u32) -> bool {
    Enable::from_bits(value).en()
}

impl Dhub {
    fn channel_at(&self, index: u8) -> Option<&Channel> {
        self.channels.get(index as usize)
    }

    fn channel_at_mut(&mut self, index: u8) -> Option<&mut Channel> {
        self.channels.get_mut(index as usize)
    }

    /// HBO BUSY: both FIFOs of a channel read busy while it clears.
    fn hbo_busy(&self) -> u32 {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, c)| c.state() == State::Clearing)
            .fold(0, |acc, (i, _)| acc | (0b11 << (2 * i)))
    }

    fn read(&self, reg: Reg) -> Option<u32> {
        let sema = &self.sema;
        let value = match reg {
            Reg::Query { id, master } => sema.query(id, master).ok()?.to_bits(),
            Reg::SemaCfg(id) => SemaCfg::default().with_depth(sema.depth(id).ok()?).to_bits(),
            Reg::SemaIntr(id, cpu) => sema.interrupt_mask(id, cpu).ok()?.to_bits(),
            Reg::SemaMask(id) => sema.bypass(id).ok()?.to_bits(),
            Reg::Push | Reg::Pop => 0,
            Reg::Status(flag) => sema.status_bits(flag),
            Reg::FifoCfg(index) => {
                let channel = self.channel_at(index / 2)?;
                let base = if index % 2 == 0 {
                    self.queue_bases[channel.id() as usize]
                } else {
                    channel.fifo().base()
                };

                FifoCfg::default().with_base(u20::new(base)).to_bits()
            }
            Reg::FifoStart(index) => {
                let channel = self.channel_at(index / 2)?;
                let en = index % 2 == 0 || channel.fifo().is_enabled();
                Enable::default().with_en(en).to_bits()
            }
            Reg::FifoClear(index) | Reg::FifoFlush(index) => {
                self.channel_at(index / 2)?;
                0
            }
            Reg::HboBusy => self.hbo_busy(),
            Reg::ChannelCfg(index) => self.channel_at(index)?.cfg().to_bits(),
            Reg::ChannelStart(index) => {
                let running = self.channel_at(index)?.state() == State::Running;
                Enable::default().with_en(running).to_bits()
            }
            Reg::ChannelClear(index) => {
                let clearing = self.channel_at(index)?.state() == State::Clearing;
                Enable::default().with_en(clearing).to_bits()
            }
            Reg::ChannelFlush(index) => {
                let flushing = self.channel_at(index)?.is_flushing();
                Enable::default().with_en(flushing).to_bits()
            }
            Reg::Busy => self.busy(),
            Reg::Pending => self.pending(),
            Reg::BusRstEn => Enable::default().with_en(self.bus_reset).to_bits(),
            Reg::BusRstDone => Enable::default().with_en(self.bus_reset_done()).to_bits(),
            Reg::FlowCtl => self.flow_ctl.to_bits(),
            Reg::AxiCmdCol => self.axi.to_bits(),
            Reg::Mem2D(index) => self.channel_at(index)?.twod().shadow.addr,
            Reg::Desc2D(index) => self.channel_at(index)?.twod().shadow.desc.to_bits(),
            Reg::Start2D(index) => {
                let busy = self.channel_at(index)?.twod().is_busy();
                Enable::default().with_en(busy).to_bits()
            }
            Reg::Clear2D(index) => {
                self.channel_at(index)?;
                0
            }
            Reg::Hdr2D(index, hdr) => {
                self.channel_at(index)?.twod().shadow.headers[hdr as usize].to_bits()
            }
            Reg::Busy2D => self.twod_busy(),
            Reg::ChSt(index) => self.channel_at(index)?.status() as u32,
        };

        Some(value)
    }

    fn write(&mut self, reg: Reg, value: u32) -> Option<()> {
        let semaphores = self.sema.len();
        match reg {
            Reg::SemaCfg(id) => {
                semaphore_write(self.sema.configure(id, SemaCfg::from_bits(value).depth()))?
            }
            Reg::SemaIntr(id, cpu) => {
                semaphore_write(self.sema.set_interrupt_mask(id, cpu, SemaFlags::from_bits(value)))?
            }
            Reg::SemaMask(id) => {
                semaphore_write(self.sema.set_bypass(id, SemaBypass::from_bits(value)))?
            }
            Reg::Push => {
                let update = SemaUpdate::from_bits(value);
                semaphore_write(self.sema.push(update.id(), update.delta()))?
            }
            Reg::Pop => {
                let update = SemaUpdate::from_bits(value);
                semaphore_write(self.sema.pop(update.id(), update.delta()))?
            }
            Reg::Status(flag) => self.sema.acknowledge_bits(flag, value),
            Reg::FifoCfg(index) => {
                let base = FifoCfg::from_bits(value).base().value();
                let id = index / 2;
                if index % 2 == 0 {
                    *self.queue_bases.get_mut(id as usize)? = base;
                } else {
                    let channel = self.channels.get_mut(id as usize)?;
                    if let Err(e) = self.fifos.relocate(channel.fifo_mut(), base) {
                        tracing::warn!("data FIFO of channel {id} not moved: {e}");
                    }
                }
            }
            Reg::FifoStart(index) => {
                let channel = self.channel_at_mut(index / 2)?;
                if index % 2 == 1 {
                    channel.fifo_mut().set_enabled(enabled(value));
                }
            }
            Reg::FifoClear(index) => {
                let channel = self.channel_at_mut(index / 2)?;
                if index % 2 == 1 && enabled(value) {
                    channel.fifo_mut().clear();
                }
            }
            Reg::FifoFlush(index) => {
                self.channel_at(index / 2)?;
            }
            Reg::ChannelCfg(index) => self.channel_at_mut(index)?.set_cfg(ChannelCfg::from_bits(value)),
            Reg::ChannelStart(index) => {
                let channel = self.channel_at_mut(index)?;
                if enabled(value) {
                    channel.start();
                } else {
                    channel.pause();
                }
            }
            Reg::ChannelClear(index) => {
                let channel = self.channel_at_mut(index)?;
                if enabled(value) {
                    channel.clear();
                }
            }
            Reg::ChannelFlush(index) => {
                let channel = self.channel_at_mut(index)?;
                if enabled(value) {
                    channel.flush();
                }
            }
            Reg::BusRstEn => self.set_bus_reset(enabled(value)),
            Reg::FlowCtl => self.flow_ctl = FlowCtl::from_bits(value),
            Reg::Mem2D(index) => self.channel_at_mut(index)?.twod_mut().shadow.addr = value,
            Reg::Desc2D(index) => {
                self.channel_at_mut(index)?.twod_mut().shadow.desc = Cmd2DDesc::from_bits(value)
            }
            Reg::Hdr2D(index, hdr) => {
                self.channel_at_mut(index)?.twod_mut().shadow.headers[hdr as usize] =
                    CmdHeader::from_bits(value)
            }
            Reg::Start2D(index) => {
                let channel = self.channel_at_mut(index)?;
                if enabled(value) {
                    let cmd = channel.twod().shadow;
                    if let Err(e) = channel.submit_2d(&cmd, semaphores) {
                        tracing::warn!("2D command on channel {index} rejected: {e}");
                    }
                }
            }
            Reg::Clear2D(index) => {
                let channel = self.channel_at_mut(index)?;
                if enabled(value) {
                    channel.twod_mut().clear();
                }
            }
            Reg::Query { .. }
            | Reg::HboBusy
            | Reg::Busy
            | Reg::Pending
            | Reg::BusRstDone
            | Reg::AxiCmdCol
            | Reg::Busy2D
            | Reg::ChSt(_) => {
                tracing::warn!("ignoring write of 0x{value:08X} to read-only {reg:?}");
            }
        }

        Some(())
    }
}

impl RegisterTransport for Dhub {
    fn read_register(&mut self, offset: u32) -> Result<u32, BusFault> {
        let Some(reg) = Reg::find(offset) else {
            tracing::warn!("reading from unmapped dHub register 0x{offset:04X}");
            return Err(BusFault::ErrorResponse(offset));
        };

        let Some(value) = self.read(reg) else {
            tracing::warn!("reading from {reg:?}, which does not exist on this device");
            return Err(BusFault::ErrorResponse(offset));
        };

        tracing::debug!("read 0x{value:08X} from {reg:?}");
        Ok(value)
    }

    fn write_register(&mut self, offset: u32, value: u32) -> Result<(), BusFault> {
        let Some(reg) = Reg::find(offset) else {
            tracing::warn!("writing 0x{value:08X} to unmapped dHub register 0x{offset:04X}");
            return Err(BusFault::ErrorResponse(offset));
        };

        tracing::debug!("writing 0x{value:08X} to {reg:?}");
        self.write(reg, value).ok_or_else(|| {
            tracing::warn!("writing to {reg:?}, which does not exist on this device");
            BusFault::ErrorResponse(offset)
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{channel::Status, config::Config, error::FaultKind, regs::AxiCmdCol};

    fn hub() -> Dhub {
        Dhub::new(Config::default()).unwrap()
    }

    #[test]
    fn decode() {
        assert_eq!(
            Reg::find(0x80 | (3 << 2)),
            Some(Reg::Query {
                id: 3,
                master: Master::Consumer
            })
        );
        assert_eq!(Reg::find(0x100 + 2 * 0x14 + 0x8), Some(Reg::SemaIntr(2, Cpu::Cpu1)));
        assert_eq!(Reg::find(0x100 + 31 * 0x14 + 0x10), Some(Reg::SemaMask(31)));
        assert_eq!(Reg::find(0x38C), Some(Reg::Status(Flag::Full)));
        assert_eq!(Reg::find(0x800 + 5 * 0x10 + 0x4), Some(Reg::FifoStart(5)));
        assert_eq!(Reg::find(0xB00 + 3 * 0x10), Some(Reg::ChannelCfg(3)));
        assert_eq!(Reg::find(0xD00 + 2 * 0x20 + 0x1C), Some(Reg::Hdr2D(2, 3)));
        assert_eq!(Reg::find(0xF40 + 15 * 4), Some(Reg::ChSt(15)));

        assert_eq!(Reg::find(0x381), None);
        assert_eq!(Reg::find(0x398), None);
        assert_eq!(Reg::find(0x400), None);
        assert_eq!(Reg::find(0xF80), None);
        assert_eq!(Reg::find(0x1000), None);
    }

    #[test]
    fn push_then_query() {
        let mut hub = hub();
        hub.write_register(sema::PUSH, 0x0503).unwrap();
        assert_eq!(hub.semaphores().check(3).unwrap().count(), 5);

        let consumer = hub.read_register(0x80 | (3 << 2)).unwrap();
        assert_eq!(consumer & 0xFFFF, 5);
        assert_eq!(consumer >> 16, 0);

        let producer = hub.read_register(3 << 2).unwrap();
        assert_eq!(producer >> 16, 5);
    }

    #[test]
    fn status_is_write_one_to_clear() {
        let mut hub = hub();
        hub.write_register(sema::CELLS + 4 * sema::CELL_STRIDE, 2).unwrap();
        hub.write_register(sema::PUSH, 0x0204).unwrap();
        assert_eq!(hub.read_register(sema::FULL).unwrap(), 1 << 4);

        hub.write_register(sema::POP, 0x0104).unwrap();
        assert_eq!(hub.read_register(sema::FULL).unwrap(), 1 << 4);

        hub.write_register(sema::FULL, 1 << 4).unwrap();
        assert_eq!(hub.read_register(sema::FULL).unwrap(), 0);
    }

    #[test]
    fn interrupt_masks() {
        let mut hub = hub();
        let intr = sema::CELLS + 7 * sema::CELL_STRIDE + sema::CELL_INTR + 4 * Cpu::Cpu2 as u32;
        hub.write_register(intr, SemaFlags::default().with_full(true).to_bits())
            .unwrap();
        hub.write_register(sema::CELLS + 7 * sema::CELL_STRIDE, 1).unwrap();

        hub.write_register(sema::PUSH, 0x0107).unwrap();
        assert!(hub.interrupt(Cpu::Cpu2));
        assert!(!hub.interrupt(Cpu::Cpu0));

        hub.write_register(sema::FULL, 1 << 7).unwrap();
        assert!(!hub.interrupt(Cpu::Cpu2));
    }

    #[test]
    fn rejected_accesses() {
        let mut hub = hub();
        assert_eq!(hub.read_register(0x400), Err(BusFault::ErrorResponse(0x400)));
        assert_eq!(
            hub.write_register(0x382, 0),
            Err(BusFault::ErrorResponse(0x382))
        );

        // underflow is a rejected write but still a valid access
        assert_eq!(hub.write_register(sema::POP, 0x0101), Ok(()));
        assert_eq!(hub.semaphores().check(1).unwrap().count(), 0);

        let small = Config {
            channels: Config::default().channels[..4].to_vec(),
            ..Default::default()
        };
        let mut hub = Dhub::new(small).unwrap();
        let offset = channel::CONTROLS + 4 * channel::STRIDE;
        assert_eq!(hub.read_register(offset), Err(BusFault::ErrorResponse(offset)));
        assert_eq!(BusFault::ErrorResponse(offset).kind(), FaultKind::ErrorResponse);
    }

    #[test]
    fn program_channel_through_registers() {
        let mut hub = hub();
        hub.dram_mut().write(0x3000, &[9; 32]).unwrap();

        let block = cmd2d::BLOCKS + 2 * cmd2d::STRIDE;
        hub.write_register(channel::CONTROLS + 2 * channel::STRIDE, 0b01)
            .unwrap();
        hub.write_register(block + cmd2d::MEM, 0x3000).unwrap();
        hub.write_register(block + cmd2d::DESC, (1 << 16) | (1 << 29))
            .unwrap();
        hub.write_register(block + cmd2d::HDR, 32).unwrap();
        hub.write_register(block + cmd2d::START, 1).unwrap();

        assert_eq!(hub.read_register(cmd2d::CH_ST + 8).unwrap(), Status::Stopped as u32);
        hub.write_register(channel::CONTROLS + 2 * channel::STRIDE + channel::START, 1)
            .unwrap();
        hub.step();
        assert_eq!(hub.read_register(channel::BUSY).unwrap(), 1 << 2);
        assert_eq!(hub.read_register(channel::PENDING).unwrap(), 1 << 2);
        assert_eq!(hub.read_register(channel::BUS_RST_DONE).unwrap(), 0);

        assert!(hub.run_until_idle(100));
        assert_eq!(hub.read_register(cmd2d::CH_ST + 8).unwrap(), Status::Idle as u32);
        assert_eq!(hub.read_register(channel::BUSY).unwrap(), 0);
        assert_eq!(hub.read_register(channel::BUS_RST_DONE).unwrap(), 1);

        let axi = AxiCmdCol::from_bits(hub.read_register(channel::AXI_CMD_COL).unwrap());
        assert_eq!((axi.r_cnt(), axi.w_cnt()), (1, 0));
        assert_eq!(hub.channel(2).unwrap().fifo().len(), 32);
    }

    #[test]
    fn data_fifo_descriptor() {
        let mut hub = hub();
        let fifo = hbo::FIFOS + 5 * hbo::FIFO_STRIDE;
        assert_eq!(hub.read_register(fifo).unwrap(), 0x1000);

        hub.channel_mut(2).unwrap().fifo_mut().push(&[1; 8]);
        hub.write_register(fifo + hbo::FIFO_CLEAR, 1).unwrap();
        assert_eq!(hub.channel(2).unwrap().fifo().len(), 8);

        hub.write_register(fifo + hbo::FIFO_START, 0).unwrap();
        hub.write_register(fifo + hbo::FIFO_CLEAR, 1).unwrap();
        assert!(hub.channel(2).unwrap().fifo().is_empty());
        assert_eq!(hub.read_register(fifo + hbo::FIFO_START).unwrap(), 0);

        // moving onto channel 3's data FIFO is refused
        hub.write_register(fifo, 0x1800).unwrap();
        assert_eq!(hub.read_register(fifo).unwrap(), 0x1000);

        hub.write_register(fifo - hbo::FIFO_STRIDE, 0x4_0000).unwrap();
        assert_eq!(hub.read_register(fifo - hbo::FIFO_STRIDE).unwrap(), 0x4_0000);
    }
}
