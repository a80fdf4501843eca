//! Model of the dHub, a semaphore-gated multi-channel DMA engine.
//!
//! The hub owns a [`SemaphoreHub`], up to sixteen [`Channel`]s with their data FIFOs, a DRAM
//! target and the [`ErrorReporter`] of its bus master. Time advances in cycles through
//! [`Dhub::step`]. In each cycle every running channel may issue one bus transaction and then
//! retires the transactions that are due.

pub mod bus;
pub mod channel;
pub mod command;
pub mod config;
pub mod driver;
pub mod error;
pub mod fifo;
pub mod mmio;
pub mod queue;
pub mod regs;
pub mod semaphore;
pub mod transport;
pub mod twod;

use crate::{
    bus::Dram,
    channel::{Channel, ChannelError, Cycle, Progress},
    command::{Command, Command2D},
    config::{Config, ConfigError, ConfigCtx},
    error::{Access, ErrorReporter},
    fifo::FifoBank,
    regs::{AxiCmdCol, FlowCtl},
    semaphore::{Cpu, SemaphoreHub},
};
use easyerr::ResultExt;
use std::sync::Arc;

pub use bitos;

/// The dHub device.
#[derive(Debug)]
pub struct Dhub {
    config: Config,
    sema: Arc<SemaphoreHub>,
    channels: Vec<Channel>,
    fifos: FifoBank,
    /// Bases written to the command queue FIFO descriptors. The queues themselves are not backed
    /// by SRAM.
    queue_bases: Vec<u32>,
    dram: Dram,
    errors: ErrorReporter,
    cycle: u64,
    bus_reset: bool,
    flow_ctl: FlowCtl,
    axi: AxiCmdCol,
}

impl Dhub {
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut fifos = FifoBank::new(config.sram_len);
        let mut channels = Vec::with_capacity(config.channels.len());
        for (id, channel) in config.channels.iter().enumerate() {
            let fifo = fifos
                .allocate(channel.fifo_base, channel.fifo_len)
                .context(ConfigCtx::Fifo)?;

            channels.push(Channel::new(id as u8, channel, fifo));
        }

        tracing::info!(
            "dHub with {} channels and {} semaphores",
            channels.len(),
            config.semaphores
        );

        Ok(Self {
            sema: Arc::new(SemaphoreHub::new(config.semaphores, config.thresholds)),
            queue_bases: vec![0; channels.len()],
            channels,
            fifos,
            dram: Dram::new(config.dram_len, config.dram_latency),
            errors: ErrorReporter::new(config.bus_timeout),
            cycle: 0,
            bus_reset: false,
            flow_ctl: FlowCtl::default(),
            axi: AxiCmdCol::default(),
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The semaphore hub, shared with any bridge or CPU model driving the device.
    pub fn semaphores(&self) -> &Arc<SemaphoreHub> {
        &self.sema
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    pub fn channel(&self, id: u8) -> Result<&Channel, ChannelError> {
        self.channels
            .get(id as usize)
            .ok_or(ChannelError::InvalidChannel(id))
    }

    pub fn channel_mut(&mut self, id: u8) -> Result<&mut Channel, ChannelError> {
        self.channels
            .get_mut(id as usize)
            .ok_or(ChannelError::InvalidChannel(id))
    }

    pub fn dram(&self) -> &Dram {
        &self.dram
    }

    pub fn dram_mut(&mut self) -> &mut Dram {
        &mut self.dram
    }

    pub fn errors(&self) -> &ErrorReporter {
        &self.errors
    }

    pub fn errors_mut(&mut self) -> &mut ErrorReporter {
        &mut self.errors
    }

    /// Cycles elapsed since construction.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn submit(&mut self, channel: u8, cmd: Command) -> Result<(), ChannelError> {
        let semaphores = self.sema.len();
        self.channel_mut(channel)?.submit(cmd, semaphores)
    }

    pub fn submit_2d(&mut self, channel: u8, cmd: &Command2D) -> Result<(), ChannelError> {
        let semaphores = self.sema.len();
        self.channel_mut(channel)?.submit_2d(cmd, semaphores)
    }

    pub fn start(&mut self, channel: u8) -> Result<(), ChannelError> {
        self.channel_mut(channel)?.start();
        Ok(())
    }

    pub fn pause(&mut self, channel: u8) -> Result<(), ChannelError> {
        self.channel_mut(channel)?.pause();
        Ok(())
    }

    pub fn clear(&mut self, channel: u8) -> Result<(), ChannelError> {
        self.channel_mut(channel)?.clear();
        Ok(())
    }

    pub fn flush(&mut self, channel: u8) -> Result<(), ChannelError> {
        self.channel_mut(channel)?.flush();
        Ok(())
    }

    fn bitmap(&self, f: impl Fn(&Channel) -> bool) -> u32 {
        self.channels
            .iter()
            .enumerate()
            .filter(|(_, c)| f(c))
            .fold(0, |acc, (i, _)| acc | (1 << i))
    }

    /// BUSY: one bit per channel executing a command.
    pub fn busy(&self) -> u32 {
        self.bitmap(Channel::busy)
    }

    /// PENDING: one bit per channel with outstanding bus transactions.
    pub fn pending(&self) -> u32 {
        self.bitmap(Channel::pending)
    }

    /// 2D BUSY: one bit per channel whose 2D engine is still expanding.
    pub fn twod_busy(&self) -> u32 {
        self.bitmap(|c| c.twod().is_busy())
    }

    /// Holds off new bus transactions while set.
    pub fn set_bus_reset(&mut self, enabled: bool) {
        if enabled != self.bus_reset {
            tracing::info!("bus reset {}", if enabled { "asserted" } else { "released" });
        }

        self.bus_reset = enabled;
    }

    pub fn bus_reset(&self) -> bool {
        self.bus_reset
    }

    /// No bus transaction is outstanding.
    pub fn bus_reset_done(&self) -> bool {
        self.pending() == 0
    }

    pub fn axi_cmd_col(&self) -> AxiCmdCol {
        self.axi
    }

    /// Level of the semaphore interrupt line towards `cpu`.
    pub fn interrupt(&self, cpu: Cpu) -> bool {
        self.sema.interrupt(cpu)
    }

    /// Advances the device by one cycle.
    pub fn step(&mut self) {
        let now = self.cycle;
        let cycle = Cycle {
            sema: &self.sema,
            now,
            latency: self.dram.latency(),
            timeout: self.errors.timeout(),
            bus_open: !self.bus_reset,
        };

        // QoS channels issue first so they win contested semaphore checks
        for qos in [true, false] {
            for channel in self.channels.iter_mut().filter(|c| c.cfg().qos() == qos) {
                match channel.issue(&cycle) {
                    Progress::Issued(Access::Read) => {
                        self.axi.set_r_cnt(self.axi.r_cnt().wrapping_add(1));
                    }
                    Progress::Issued(Access::Write) => {
                        self.axi.set_w_cnt(self.axi.w_cnt().wrapping_add(1));
                    }
                    Progress::Idle | Progress::Stalled(_) => (),
                }
            }
        }

        for channel in &mut self.channels {
            channel.complete(now, &self.sema, &mut self.dram, &mut self.errors);
        }

        self.cycle += 1;
    }

    pub fn run(&mut self, cycles: u64) {
        for _ in 0..cycles {
            self.step();
        }
    }

    /// No channel has work it could make progress on and nothing is in flight.
    pub fn is_idle(&self) -> bool {
        self.channels.iter().all(|c| {
            !c.pending()
                && c.interrupts_pending() == 0
                && (c.is_idle() || c.state() != channel::State::Running)
        })
    }

    /// Steps until idle or until `max` cycles have run. Returns whether the device went idle.
    pub fn run_until_idle(&mut self, max: u64) -> bool {
        for _ in 0..max {
            if self.is_idle() {
                return true;
            }

            self.step();
        }

        self.is_idle()
    }
}
