//! Register-level driver for a dHub behind any [`RegisterTransport`].
use crate::{
    channel::Status,
    command::{Cmd2DDesc, Command, Command2D},
    regs::{
        ChannelCfg, Enable, Master, SemaBypass, SemaCfg, SemaFlags, SemaQuery, SemaQueryAddr,
        SemaUpdate, channel, cmd2d, sema,
    },
    semaphore::{Cpu, Flag},
    transport::{BusFault, RegisterTransport},
};
use bitos::integer::{u2, u5, u13};
use easyerr::{Error, ResultExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DriverError {
    #[error("semaphore {f0} does not exist")]
    InvalidSemaphore(u8),
    #[error("channel {f0} does not exist")]
    InvalidChannel(u8),
    #[error(transparent)]
    Bus { source: BusFault },
}

fn cell(id: u8) -> Result<u32, DriverError> {
    if id as u32 >= sema::CELL_COUNT {
        return Err(DriverError::InvalidSemaphore(id));
    }

    Ok(sema::CELLS + id as u32 * sema::CELL_STRIDE)
}

fn check_channel(ch: u8) -> Result<u32, DriverError> {
    if ch as u32 >= channel::COUNT {
        return Err(DriverError::InvalidChannel(ch));
    }

    Ok(ch as u32)
}

fn control(ch: u8) -> Result<u32, DriverError> {
    Ok(channel::CONTROLS + check_channel(ch)? * channel::STRIDE)
}

fn block(ch: u8) -> Result<u32, DriverError> {
    Ok(cmd2d::BLOCKS + check_channel(ch)? * cmd2d::STRIDE)
}

fn status_register(flag: Flag) -> u32 {
    match flag {
        Flag::Empty => sema::EMPTY,
        Flag::Full => sema::FULL,
        Flag::AlmostEmpty => sema::ALMOST_EMPTY,
        Flag::AlmostFull => sema::ALMOST_FULL,
    }
}

const ENABLE: u32 = 1;

/// Programs a dHub through its registers. Ids are checked before any register is touched.
#[derive(Debug)]
pub struct Driver<T> {
    transport: T,
}

impl<T: RegisterTransport> Driver<T> {
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn read(&mut self, offset: u32) -> Result<u32, DriverError> {
        self.transport.read_register(offset).context(DriverCtx::Bus)
    }

    fn write(&mut self, offset: u32, value: u32) -> Result<(), DriverError> {
        self.transport
            .write_register(offset, value)
            .context(DriverCtx::Bus)
    }

    /// Sets the depth of a cell, which also resets its counter.
    pub fn configure_semaphore(&mut self, id: u8, depth: u16) -> Result<(), DriverError> {
        let cfg = SemaCfg::default().with_depth(depth);
        self.write(cell(id)? + sema::CELL_CFG, cfg.to_bits())
    }

    pub fn push(&mut self, id: u8, delta: u8) -> Result<(), DriverError> {
        cell(id)?;
        let update = SemaUpdate::default().with_id(id).with_delta(delta);
        self.write(sema::PUSH, update.to_bits())
    }

    pub fn pop(&mut self, id: u8, delta: u8) -> Result<(), DriverError> {
        cell(id)?;
        let update = SemaUpdate::default().with_id(id).with_delta(delta);
        self.write(sema::POP, update.to_bits())
    }

    pub fn query(&mut self, id: u8, master: Master) -> Result<SemaQuery, DriverError> {
        cell(id)?;
        let addr = SemaQueryAddr::default()
            .with_id(u5::new(id))
            .with_master(master);

        let value = self.read(sema::QUERY + addr.to_bits() as u32)?;
        Ok(SemaQuery::from_bits(value))
    }

    pub fn set_interrupt_mask(
        &mut self,
        id: u8,
        cpu: Cpu,
        mask: SemaFlags,
    ) -> Result<(), DriverError> {
        let offset = cell(id)? + sema::CELL_INTR + 4 * cpu as u32;
        self.write(offset, mask.to_bits())
    }

    pub fn set_bypass(&mut self, id: u8, bypass: SemaBypass) -> Result<(), DriverError> {
        self.write(cell(id)? + sema::CELL_MASK, bypass.to_bits())
    }

    /// Latched status of one flag kind, one bit per cell.
    pub fn status(&mut self, flag: Flag) -> Result<u32, DriverError> {
        self.read(status_register(flag))
    }

    pub fn acknowledge(&mut self, flag: Flag, cells: u32) -> Result<(), DriverError> {
        self.write(status_register(flag), cells)
    }

    pub fn configure_channel(&mut self, ch: u8, cfg: ChannelCfg) -> Result<(), DriverError> {
        self.write(control(ch)? + channel::CFG, cfg.to_bits())
    }

    pub fn start_channel(&mut self, ch: u8) -> Result<(), DriverError> {
        self.write(control(ch)? + channel::START, ENABLE)
    }

    pub fn pause_channel(&mut self, ch: u8) -> Result<(), DriverError> {
        self.write(control(ch)? + channel::START, 0)
    }

    pub fn clear_channel(&mut self, ch: u8) -> Result<(), DriverError> {
        self.write(control(ch)? + channel::CLEAR, ENABLE)
    }

    pub fn flush_channel(&mut self, ch: u8) -> Result<(), DriverError> {
        self.write(control(ch)? + channel::FLUSH, ENABLE)
    }

    /// Submits a strided command through the channel's 2D block.
    pub fn submit_2d(&mut self, ch: u8, cmd: &Command2D) -> Result<(), DriverError> {
        let base = block(ch)?;
        self.write(base + cmd2d::MEM, cmd.addr)?;
        self.write(base + cmd2d::DESC, cmd.desc.to_bits())?;
        for (i, header) in cmd.headers.iter().enumerate() {
            self.write(base + cmd2d::HDR + 4 * i as u32, header.to_bits())?;
        }

        self.write(base + cmd2d::START, ENABLE)
    }

    /// Submits a linear command as a single line 2D command.
    pub fn submit(&mut self, ch: u8, cmd: Command) -> Result<(), DriverError> {
        let base = block(ch)?;
        let desc = Cmd2DDesc::default()
            .with_num_lines(u13::new(1))
            .with_hdr_loop(u2::new(1));

        self.write(base + cmd2d::MEM, cmd.addr)?;
        self.write(base + cmd2d::DESC, desc.to_bits())?;
        self.write(base + cmd2d::HDR, cmd.header.to_bits())?;
        self.write(base + cmd2d::START, ENABLE)
    }

    /// Consumes one completion interrupt of a channel, if one was raised.
    ///
    /// Completion interrupts are pushes on the cell with the channel's id. This pops one of them
    /// and clears the cell's latched full flag.
    pub fn poll_channel_done(&mut self, ch: u8) -> Result<bool, DriverError> {
        check_channel(ch)?;
        if self.query(ch, Master::Consumer)?.count() == 0 {
            return Ok(false);
        }

        self.pop(ch, 1)?;
        self.acknowledge(Flag::Full, 1 << ch)?;
        Ok(true)
    }

    pub fn busy(&mut self) -> Result<u32, DriverError> {
        self.read(channel::BUSY)
    }

    pub fn pending(&mut self) -> Result<u32, DriverError> {
        self.read(channel::PENDING)
    }

    /// State of a channel as reported by CH_ST. `None` for codes this model does not know.
    pub fn channel_state(&mut self, ch: u8) -> Result<Option<Status>, DriverError> {
        let value = self.read(cmd2d::CH_ST + 4 * check_channel(ch)?)?;
        Ok(Status::from_repr(value as u16))
    }

    pub fn set_bus_reset(&mut self, enabled: bool) -> Result<(), DriverError> {
        let value = Enable::default().with_en(enabled);
        self.write(channel::BUS_RST_EN, value.to_bits())
    }

    pub fn bus_reset_done(&mut self) -> Result<bool, DriverError> {
        Ok(Enable::from_bits(self.read(channel::BUS_RST_DONE)?).en())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        Dhub,
        command::CmdHeader,
        config::Config,
        error::FaultKind,
        regs::Mtu,
        transport::RegisterFile,
    };

    #[test]
    fn register_traffic() {
        let mut driver = Driver::new(RegisterFile::new());
        driver.push(3, 5).unwrap();
        driver.configure_channel(2, ChannelCfg::default().with_mtu(Mtu::B32)).unwrap();
        driver
            .submit(2, Command::new(0x1000, CmdHeader::bytes(128)))
            .unwrap();

        let writes = driver.transport().writes();
        assert_eq!(writes[0], (0x380, 0x0503));
        assert_eq!(writes[1], (0xB20, 0b01));
        assert_eq!(writes[2], (0xD40, 0x1000));
        assert_eq!(writes[3], (0xD44, (1 << 16) | (1 << 29)));
        assert_eq!(writes[4], (0xD50, 128));
        assert_eq!(writes[5], (0xD48, 1));
    }

    #[test]
    fn faults_propagate() {
        let mut regs = RegisterFile::new();
        regs.inject(channel::BUSY, FaultKind::Timeout);

        let mut driver = Driver::new(regs);
        assert_eq!(
            driver.busy(),
            Err(DriverError::Bus {
                source: BusFault::Timeout(channel::BUSY)
            })
        );
        assert_eq!(driver.pending(), Ok(0));
    }

    #[test]
    fn transfer_and_completion() {
        let mut hub = Dhub::new(Config::default()).unwrap();
        hub.dram_mut().write(0x800, &[0x11; 64]).unwrap();

        let mut driver = Driver::new(&mut hub);
        driver.configure_semaphore(2, 1).unwrap();
        driver
            .set_interrupt_mask(2, Cpu::Cpu0, SemaFlags::default().with_full(true))
            .unwrap();
        driver
            .configure_channel(2, ChannelCfg::default().with_mtu(Mtu::B32))
            .unwrap();
        driver
            .submit(
                2,
                Command::new(0x800, CmdHeader::bytes(64).with_interrupt(true)),
            )
            .unwrap();
        driver.start_channel(2).unwrap();
        assert_eq!(driver.channel_state(2), Ok(Some(Status::Idle)));
        assert!(!driver.poll_channel_done(2).unwrap());

        assert!(driver.transport_mut().run_until_idle(100));
        assert!(driver.transport().interrupt(Cpu::Cpu0));
        assert!(driver.poll_channel_done(2).unwrap());
        assert!(!driver.transport().interrupt(Cpu::Cpu0));
        assert!(!driver.poll_channel_done(2).unwrap());

        assert_eq!(driver.busy(), Ok(0));
        assert!(driver.bus_reset_done().unwrap());
        assert_eq!(hub.channel(2).unwrap().fifo().len(), 64);
    }

    #[test]
    fn out_of_range_ids_touch_nothing() {
        let mut hub = Dhub::new(Config::default()).unwrap();
        let mut driver = Driver::new(&mut hub);

        assert_eq!(driver.clear_channel(16), Err(DriverError::InvalidChannel(16)));
        assert_eq!(driver.start_channel(16), Err(DriverError::InvalidChannel(16)));
        assert_eq!(
            driver.submit(16, Command::new(0, CmdHeader::bytes(8))),
            Err(DriverError::InvalidChannel(16))
        );
        assert_eq!(driver.channel_state(16), Err(DriverError::InvalidChannel(16)));
        assert_eq!(driver.poll_channel_done(16), Err(DriverError::InvalidChannel(16)));

        assert_eq!(
            driver.configure_semaphore(32, 0x0503),
            Err(DriverError::InvalidSemaphore(32))
        );
        assert_eq!(
            driver.set_interrupt_mask(32, Cpu::Cpu0, SemaFlags::default().with_full(true)),
            Err(DriverError::InvalidSemaphore(32))
        );
        assert_eq!(
            driver.set_bypass(32, SemaBypass::default()),
            Err(DriverError::InvalidSemaphore(32))
        );
        assert!(matches!(
            driver.query(32, Master::Consumer),
            Err(DriverError::InvalidSemaphore(32))
        ));
        assert_eq!(driver.push(32, 1), Err(DriverError::InvalidSemaphore(32)));

        assert!(!hub.bus_reset());
        assert_eq!(hub.semaphores().query(3, Master::Consumer).unwrap().count(), 0);
        assert_eq!(hub.pending(), 0);
    }

    #[test]
    fn out_of_range_ids_write_no_registers() {
        let mut driver = Driver::new(RegisterFile::new());
        assert!(driver.flush_channel(200).is_err());
        assert!(driver.pop(255, 1).is_err());
        assert!(driver.transport().writes().is_empty());
    }

    #[test]
    fn clear_while_running_through_registers() {
        let mut hub = Dhub::new(Config::default()).unwrap();
        let mut driver = Driver::new(&mut hub);
        let gated = CmdHeader::bytes(8).with_chk_sem_id(u5::new(9));

        driver.submit(2, Command::new(0, gated)).unwrap();
        driver.start_channel(2).unwrap();
        driver.transport_mut().run(4);
        assert_eq!(driver.channel_state(2), Ok(Some(Status::Stalled)));

        driver.clear_channel(2).unwrap();
        assert_eq!(driver.channel_state(2), Ok(Some(Status::Stalled)));

        driver.pause_channel(2).unwrap();
        driver.clear_channel(2).unwrap();
        assert_eq!(driver.channel_state(2), Ok(Some(Status::Stopped)));
        assert_eq!(driver.busy(), Ok(0));
    }
}
