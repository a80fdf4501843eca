//! Channel controller.
//!
//! Each channel is an independent state machine that dequeues linear commands, gates them on
//! semaphores and splits them into MTU sized bus transactions. The only state it shares with other
//! channels is the [`SemaphoreHub`].
use crate::{
    bus::{Dram, Transaction},
    command::{Command, Command2D, CommandError, SemOp},
    config::{ChannelConfig, Direction},
    error::{Access, ErrorReporter, FaultKind},
    fifo::Fifo,
    queue::{CommandQueue, TwoDEngine},
    regs::{ChannelCfg, InterruptPolicy},
    semaphore::SemaphoreHub,
    twod::DescriptorError,
};
use easyerr::{Error, ResultExt};
use std::collections::VecDeque;
use strum::FromRepr;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("channel {f0} does not exist")]
    InvalidChannel(u8),
    #[error("command queue of channel {f0} is full")]
    QueueFull(u8),
    #[error("command references semaphore {f0}, which does not exist")]
    InvalidSemaphore(u8),
    #[error(transparent)]
    Command { source: CommandError },
    #[error(transparent)]
    Descriptor { source: DescriptorError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Stopped,
    Running,
    /// Stopped and waiting for outstanding transactions before clearing.
    Clearing,
}

/// Channel state code as reported by CH_ST.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr)]
#[repr(u16)]
pub enum Status {
    Stopped = 0,
    Idle = 1,
    Busy = 2,
    Stalled = 3,
    Clearing = 4,
}

/// Why a channel could not issue this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stall {
    /// Checked semaphore has nothing to consume.
    Semaphore(u8),
    /// Not enough room (read) or data (write) in the data FIFO.
    Fifo,
    /// Bus reset in progress.
    BusReset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Idle,
    Issued(Access),
    Stalled(Stall),
}

/// Shared context of one issue cycle.
#[derive(Debug)]
pub struct Cycle<'a> {
    pub sema: &'a SemaphoreHub,
    pub now: u64,
    pub latency: u32,
    pub timeout: u32,
    /// Cleared while a bus reset holds off new transactions.
    pub bus_open: bool,
}

#[derive(Debug)]
struct Active {
    cmd: Command,
    len: u32,
    issued: u32,
    /// Per-command check already passed.
    checked: bool,
}

fn acquire(sema: &SemaphoreHub, id: u8) -> bool {
    sema.try_pop(id, 1).unwrap_or_else(|e| {
        tracing::warn!("semaphore check failed: {e}");
        false
    })
}

#[derive(Debug)]
pub struct Channel {
    id: u8,
    direction: Direction,
    cfg: ChannelCfg,
    state: State,
    queue: CommandQueue,
    twod: TwoDEngine,
    fifo: Fifo,
    active: Option<Active>,
    outstanding: VecDeque<Transaction>,
    flushing: bool,
    stall: Option<Stall>,
    /// Interrupts held until the channel goes idle.
    deferred: u32,
    /// Interrupts waiting for room in the channel's semaphore cell.
    undelivered: u32,
    completed: u64,
}

impl Channel {
    pub fn new(id: u8, config: &ChannelConfig, fifo: Fifo) -> Self {
        Self {
            id,
            direction: config.direction,
            cfg: ChannelCfg::default(),
            state: State::Stopped,
            queue: CommandQueue::new(config.queue_depth),
            twod: TwoDEngine::default(),
            fifo,
            active: None,
            outstanding: VecDeque::new(),
            flushing: false,
            stall: None,
            deferred: 0,
            undelivered: 0,
            completed: 0,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn cfg(&self) -> ChannelCfg {
        self.cfg
    }

    pub fn set_cfg(&mut self, cfg: ChannelCfg) {
        tracing::debug!(
            "channel {} configured: mtu {} bytes, qos {}, self loop {}, {:?}",
            self.id,
            cfg.mtu().bytes(),
            cfg.qos(),
            cfg.self_loop(),
            cfg.intr_ctl()
        );
        self.cfg = cfg;
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    pub fn twod(&self) -> &TwoDEngine {
        &self.twod
    }

    pub fn twod_mut(&mut self) -> &mut TwoDEngine {
        &mut self.twod
    }

    pub fn fifo(&self) -> &Fifo {
        &self.fifo
    }

    pub fn fifo_mut(&mut self) -> &mut Fifo {
        &mut self.fifo
    }

    /// Commands completed since construction.
    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn stall(&self) -> Option<Stall> {
        self.stall
    }

    pub fn start(&mut self) {
        match self.state {
            State::Clearing => tracing::warn!("channel {} is clearing, start ignored", self.id),
            State::Running => (),
            State::Stopped => {
                tracing::info!("channel {} started", self.id);
                self.state = State::Running;
            }
        }
    }

    /// Stops dequeuing. Queued commands and in-flight transactions are kept.
    pub fn pause(&mut self) {
        if self.state == State::Running {
            tracing::info!("channel {} paused", self.id);
            self.state = State::Stopped;
            self.stall = None;
        }
    }

    /// Drops queued and in-progress commands. Ignored while running.
    pub fn clear(&mut self) {
        match self.state {
            State::Running => {
                tracing::warn!("channel {} is running, clear ignored", self.id);
            }
            State::Clearing => (),
            State::Stopped if self.outstanding.is_empty() => self.reset(),
            State::Stopped => {
                tracing::debug!(
                    "channel {} clearing after {} outstanding transactions",
                    self.id,
                    self.outstanding.len()
                );
                self.state = State::Clearing;
            }
        }
    }

    fn reset(&mut self) {
        self.queue.clear();
        self.twod.clear();
        self.active = None;
        self.flushing = false;
        self.stall = None;
        self.deferred = 0;
        self.state = State::Stopped;
        tracing::info!("channel {} cleared", self.id);
    }

    /// Lets a write channel commit whatever is buffered, even below one MTU.
    pub fn flush(&mut self) {
        match self.direction {
            Direction::Read => tracing::warn!("flush of read channel {} ignored", self.id),
            Direction::Write => self.flushing = !self.fifo.is_empty(),
        }
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing
    }

    fn admit(&self, cmd: &Command, semaphores: usize) -> Result<(), ChannelError> {
        cmd.validate().context(ChannelCtx::Command)?;
        for id in [cmd.check_sem(), cmd.update_sem()].into_iter().flatten() {
            if id as usize >= semaphores {
                return Err(ChannelError::InvalidSemaphore(id));
            }
        }

        Ok(())
    }

    /// Appends a linear command to the queue.
    pub fn submit(&mut self, cmd: Command, semaphores: usize) -> Result<(), ChannelError> {
        self.admit(&cmd, semaphores)?;
        self.queue
            .push(cmd)
            .map_err(|_| ChannelError::QueueFull(self.id))?;

        tracing::debug!("channel {} queued {:08X?}", self.id, cmd);
        Ok(())
    }

    /// Starts the 2D engine on a strided descriptor. Its lines enter the queue as room allows.
    pub fn submit_2d(&mut self, cmd: &Command2D, semaphores: usize) -> Result<(), ChannelError> {
        let used = cmd.desc.loop_len().min(cmd.desc.lines() as usize);
        for header in &cmd.headers[..used] {
            self.admit(&Command::new(cmd.addr, *header), semaphores)?;
        }

        self.twod.start(cmd).context(ChannelCtx::Descriptor)?;
        self.twod.feed(&mut self.queue);

        Ok(())
    }

    /// A command is being executed.
    pub fn busy(&self) -> bool {
        self.active.is_some()
            || self.outstanding.iter().any(|t| t.finishes.is_some())
            || self.flushing
    }

    /// Bus transactions are outstanding.
    pub fn pending(&self) -> bool {
        !self.outstanding.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty()
            && !self.twod.is_busy()
            && self.active.is_none()
            && self.outstanding.is_empty()
    }

    /// Interrupts raised but not yet pushed to the channel's semaphore.
    pub fn interrupts_pending(&self) -> u32 {
        self.deferred + self.undelivered
    }

    pub fn status(&self) -> Status {
        match self.state {
            State::Clearing => Status::Clearing,
            _ if self.stall.is_some() => Status::Stalled,
            _ if self.busy() => Status::Busy,
            State::Running => Status::Idle,
            State::Stopped => Status::Stopped,
        }
    }

    /// Issue phase of a cycle: starts the next command if needed and issues at most one
    /// transaction.
    pub fn issue(&mut self, cycle: &Cycle) -> Progress {
        self.twod.feed(&mut self.queue);
        let progress = self.try_issue(cycle);
        self.stall = match progress {
            Progress::Stalled(stall) => Some(stall),
            _ => None,
        };

        if self.flushing && self.fifo.is_empty() {
            tracing::debug!("channel {} flushed", self.id);
            self.flushing = false;
        }

        progress
    }

    fn try_issue(&mut self, cycle: &Cycle) -> Progress {
        if self.state != State::Running {
            return Progress::Idle;
        }

        if self.active.is_none() {
            let Some(cmd) = self.queue.pop() else {
                return Progress::Idle;
            };

            self.twod.feed(&mut self.queue);
            self.active = Some(Active {
                cmd,
                len: cmd.byte_len(self.cfg.mtu()),
                issued: 0,
                checked: false,
            });
        }

        if !cycle.bus_open {
            return Progress::Stalled(Stall::BusReset);
        }

        let Some(active) = self.active.as_mut() else {
            return Progress::Idle;
        };

        let cmd = active.cmd;
        let per_mtu = cmd.header.sem_op() == SemOp::PerMtu;
        if !per_mtu && !active.checked {
            if let Some(sem) = cmd.check_sem() {
                if !acquire(cycle.sema, sem) {
                    return Progress::Stalled(Stall::Semaphore(sem));
                }
            }

            active.checked = true;
        }

        if !self.fifo.is_enabled() {
            return Progress::Stalled(Stall::Fifo);
        }

        let mut chunk = (active.len - active.issued).min(self.cfg.mtu().bytes());
        match self.direction {
            Direction::Read => {
                if self.fifo.free() < chunk as usize {
                    return Progress::Stalled(Stall::Fifo);
                }
            }
            Direction::Write => {
                let buffered = self.fifo.len() as u32;
                if buffered < chunk {
                    if !self.flushing || buffered == 0 {
                        return Progress::Stalled(Stall::Fifo);
                    }

                    chunk = buffered;
                }
            }
        }

        if per_mtu {
            if let Some(sem) = cmd.check_sem() {
                if !acquire(cycle.sema, sem) {
                    return Progress::Stalled(Stall::Semaphore(sem));
                }
            }
        }

        let (access, data) = match self.direction {
            Direction::Read => {
                self.fifo.reserve(chunk as usize);
                (Access::Read, Vec::new())
            }
            Direction::Write => (
                Access::Write,
                self.fifo.pop(chunk as usize).unwrap_or_default(),
            ),
        };

        let addr = cmd.addr.wrapping_add(active.issued);
        active.issued += chunk;
        let last = active.issued >= active.len;

        self.outstanding.push_back(Transaction {
            due: cycle.now + cycle.latency.min(cycle.timeout) as u64,
            addr,
            len: chunk as usize,
            access,
            data,
            timed_out: cycle.latency > cycle.timeout,
            retired: false,
            update: if per_mtu || last {
                cmd.update_sem()
            } else {
                None
            },
            finishes: last.then_some(cmd),
        });

        if last {
            self.active = None;
        }

        Progress::Issued(access)
    }

    fn retire(fifo: &mut Fifo, txn: &Transaction, dram: &mut Dram, errors: &mut ErrorReporter) {
        let result = match txn.access {
            Access::Read => {
                let mut buf = vec![0; txn.len];
                let result = if txn.timed_out {
                    Err(FaultKind::Timeout)
                } else {
                    dram.read(txn.addr, &mut buf)
                };

                fifo.fill(&buf);
                result
            }
            Access::Write => {
                if txn.timed_out {
                    Err(FaultKind::Timeout)
                } else {
                    dram.write(txn.addr, &txn.data)
                }
            }
        };

        if let Err(kind) = result {
            errors.report(txn.addr, txn.access, kind);
        }
    }

    /// Completion phase of a cycle: retires due transactions in order, applies their semaphore
    /// updates and raises interrupts.
    pub fn complete(
        &mut self,
        now: u64,
        sema: &SemaphoreHub,
        dram: &mut Dram,
        errors: &mut ErrorReporter,
    ) {
        while let Some(txn) = self.outstanding.front_mut() {
            if txn.due > now {
                break;
            }

            if !txn.retired {
                Self::retire(&mut self.fifo, txn, dram, errors);
                txn.retired = true;
            }

            if let Some(sem) = txn.update {
                match sema.try_push(sem, 1) {
                    Ok(true) => (),
                    // completion holds until the semaphore has room
                    Ok(false) => break,
                    Err(e) => tracing::warn!("channel {} update dropped: {e}", self.id),
                }

                txn.update = None;
            }

            let finished = txn.finishes;
            self.outstanding.pop_front();
            if let Some(cmd) = finished {
                self.finish(cmd);
            }
        }

        if self.state == State::Clearing && self.outstanding.is_empty() {
            self.reset();
        }

        self.deliver_interrupts(sema);
    }

    fn finish(&mut self, cmd: Command) {
        self.completed += 1;
        tracing::debug!("channel {} finished {:08X?}", self.id, cmd);

        if self.cfg.self_loop() && self.queue.push(cmd).is_err() {
            tracing::warn!("channel {} queue full, self loop command dropped", self.id);
        }

        if cmd.header.interrupt() {
            match self.cfg.intr_ctl() {
                InterruptPolicy::CmdDone => self.undelivered += 1,
                InterruptPolicy::ChIdle => self.deferred += 1,
            }
        }
    }

    fn deliver_interrupts(&mut self, sema: &SemaphoreHub) {
        if self.deferred > 0 && self.is_idle() {
            self.undelivered += self.deferred;
            self.deferred = 0;
        }

        while self.undelivered > 0 {
            match sema.try_push(self.id, 1) {
                Ok(true) => {
                    tracing::debug!("channel {} interrupt", self.id);
                    self.undelivered -= 1;
                }
                Ok(false) => break,
                Err(e) => {
                    tracing::warn!("channel {} has no interrupt semaphore: {e}", self.id);
                    self.undelivered = 0;
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        command::{CmdHeader, SizeUnit},
        config::Thresholds,
        fifo::FifoBank,
        regs::Mtu,
    };
    use bitos::integer::u5;

    struct Rig {
        sema: SemaphoreHub,
        dram: Dram,
        errors: ErrorReporter,
        now: u64,
    }

    impl Rig {
        fn new() -> Self {
            Self {
                sema: SemaphoreHub::new(32, Thresholds::default()),
                dram: Dram::new(0x10000, 2),
                errors: ErrorReporter::new(256),
                now: 0,
            }
        }

        fn channel(&self, id: u8, direction: Direction, mtu: Mtu) -> Channel {
            let config = ChannelConfig {
                direction,
                queue_depth: 4,
                ..Default::default()
            };

            let fifo = FifoBank::new(0x1000).allocate(0, 0x100).unwrap();
            let mut channel = Channel::new(id, &config, fifo);
            channel.set_cfg(ChannelCfg::default().with_mtu(mtu));
            channel
        }

        fn step(&mut self, channel: &mut Channel) -> Progress {
            let cycle = Cycle {
                sema: &self.sema,
                now: self.now,
                latency: self.dram.latency(),
                timeout: self.errors.timeout(),
                bus_open: true,
            };

            let progress = channel.issue(&cycle);
            channel.complete(self.now, &self.sema, &mut self.dram, &mut self.errors);
            self.now += 1;
            progress
        }

        fn run(&mut self, channel: &mut Channel, cycles: u32) {
            for _ in 0..cycles {
                self.step(channel);
            }
        }
    }

    fn gated(size: u16, sem_op: SemOp, chk: u8, upd: u8) -> CmdHeader {
        CmdHeader::bytes(size)
            .with_sem_op(sem_op)
            .with_chk_sem_id(u5::new(chk))
            .with_upd_sem_id(u5::new(upd))
    }

    #[test]
    fn per_mtu_semaphore_operations() {
        let mut rig = Rig::new();
        let mut channel = rig.channel(2, Direction::Read, Mtu::B32);
        rig.sema.push(4, 2).unwrap();

        let cmd = Command::new(0x100, gated(64, SemOp::PerMtu, 4, 5));
        channel.submit(cmd, 32).unwrap();
        channel.start();
        rig.run(&mut channel, 10);

        assert_eq!(rig.sema.check(4).unwrap().count(), 0);
        assert_eq!(rig.sema.check(4).unwrap().pointer(), 2);
        assert_eq!(rig.sema.check(5).unwrap().count(), 2);
        assert_eq!(channel.completed(), 1);
        assert_eq!(channel.fifo().len(), 64);
    }

    #[test]
    fn per_command_semaphore_operations() {
        let mut rig = Rig::new();
        let mut channel = rig.channel(2, Direction::Read, Mtu::B32);
        rig.sema.push(4, 2).unwrap();

        let cmd = Command::new(0x100, gated(64, SemOp::PerCommand, 4, 5));
        channel.submit(cmd, 32).unwrap();
        channel.start();
        rig.run(&mut channel, 10);

        assert_eq!(rig.sema.check(4).unwrap().count(), 1);
        assert_eq!(rig.sema.check(5).unwrap().count(), 1);
    }

    #[test]
    fn unmet_check_stalls_until_satisfied() {
        let mut rig = Rig::new();
        let mut channel = rig.channel(2, Direction::Read, Mtu::B32);
        rig.sema.push(4, 1).unwrap();

        let cmd = Command::new(0x100, gated(64, SemOp::PerMtu, 4, 0));
        channel.submit(cmd, 32).unwrap();
        channel.start();
        rig.run(&mut channel, 10);

        assert_eq!(channel.stall(), Some(Stall::Semaphore(4)));
        assert_eq!(channel.status(), Status::Stalled);
        assert!(channel.busy());
        assert_eq!(channel.completed(), 0);

        rig.sema.push(4, 1).unwrap();
        rig.run(&mut channel, 10);
        assert_eq!(channel.completed(), 1);
        assert_eq!(channel.status(), Status::Idle);
    }

    #[test]
    fn clear_while_running_is_ignored() {
        let mut rig = Rig::new();
        let mut channel = rig.channel(2, Direction::Read, Mtu::B32);
        let blocked = Command::new(0x100, gated(8, SemOp::PerCommand, 9, 0));
        channel.submit(blocked, 32).unwrap();
        channel.submit(blocked, 32).unwrap();
        channel.start();
        rig.run(&mut channel, 3);

        channel.clear();
        assert_eq!(channel.state(), State::Running);
        assert_eq!(channel.queue().len(), 1);

        channel.pause();
        channel.clear();
        assert_eq!(channel.state(), State::Stopped);
        assert!(channel.queue().is_empty());
        assert!(!channel.busy());
    }

    #[test]
    fn clear_waits_for_outstanding_transactions() {
        let mut rig = Rig::new();
        rig.dram.set_latency(5);
        let mut channel = rig.channel(2, Direction::Read, Mtu::B8);
        channel
            .submit(Command::new(0x100, CmdHeader::bytes(32)), 32)
            .unwrap();
        channel.start();
        rig.run(&mut channel, 2);

        channel.pause();
        assert!(channel.pending());
        channel.clear();
        assert_eq!(channel.status(), Status::Clearing);

        rig.run(&mut channel, 10);
        assert_eq!(channel.state(), State::Stopped);
        assert!(!channel.pending());
        assert!(channel.is_idle());
    }

    #[test]
    fn interrupt_policy() {
        let mut rig = Rig::new();
        rig.sema.configure(2, 4).unwrap();
        let mut channel = rig.channel(2, Direction::Read, Mtu::B32);
        let cmd = Command::new(0x100, CmdHeader::bytes(32).with_interrupt(true));

        channel.submit(cmd, 32).unwrap();
        channel.submit(cmd, 32).unwrap();
        channel.start();
        rig.step(&mut channel);
        rig.step(&mut channel);
        rig.step(&mut channel);
        assert_eq!(rig.sema.check(2).unwrap().count(), 1);
        rig.run(&mut channel, 5);
        assert_eq!(rig.sema.check(2).unwrap().count(), 2);

        rig.sema.reset(2).unwrap();
        channel.set_cfg(channel.cfg().with_intr_ctl(InterruptPolicy::ChIdle));
        channel.submit(cmd, 32).unwrap();
        channel.submit(cmd, 32).unwrap();
        rig.run(&mut channel, 3);
        assert_eq!(channel.completed(), 3);
        assert_eq!(rig.sema.check(2).unwrap().count(), 0);

        rig.run(&mut channel, 5);
        assert_eq!(channel.completed(), 4);
        assert_eq!(rig.sema.check(2).unwrap().count(), 2);
    }

    #[test]
    fn interrupts_wait_for_semaphore_room() {
        let mut rig = Rig::new();
        rig.sema.configure(2, 1).unwrap();
        let mut channel = rig.channel(2, Direction::Read, Mtu::B32);
        let cmd = Command::new(0x100, CmdHeader::bytes(8).with_interrupt(true));

        channel.submit(cmd, 32).unwrap();
        channel.submit(cmd, 32).unwrap();
        channel.start();
        rig.run(&mut channel, 10);

        assert!(rig.sema.flags(2).unwrap().full());
        assert_eq!(channel.interrupts_pending(), 1);

        rig.sema.pop(2, 1).unwrap();
        rig.run(&mut channel, 1);
        assert_eq!(channel.interrupts_pending(), 0);
    }

    #[test]
    fn write_channel_flush_commits_partial_data() {
        let mut rig = Rig::new();
        let mut channel = rig.channel(3, Direction::Write, Mtu::B32);
        channel.fifo_mut().push(&[0xAB; 20]);

        channel
            .submit(Command::new(0x200, CmdHeader::bytes(20)), 32)
            .unwrap();
        channel.start();
        rig.run(&mut channel, 4);
        assert_eq!(channel.completed(), 1);
        assert_eq!(rig.dram.slice(0x200, 20).unwrap(), &[0xAB; 20]);

        // a 32 byte command with only 12 bytes buffered waits for more data
        channel.fifo_mut().push(&[0xCD; 12]);
        channel
            .submit(Command::new(0x300, CmdHeader::bytes(32)), 32)
            .unwrap();
        rig.run(&mut channel, 4);
        assert_eq!(channel.stall(), Some(Stall::Fifo));

        channel.flush();
        rig.run(&mut channel, 4);
        assert!(!channel.is_flushing());
        assert_eq!(rig.dram.slice(0x300, 12).unwrap(), &[0xCD; 12]);
        assert_eq!(channel.completed(), 1);

        channel.fifo_mut().push(&[0xEF; 20]);
        rig.run(&mut channel, 4);
        assert_eq!(channel.completed(), 2);
        assert_eq!(rig.dram.slice(0x30C, 20).unwrap(), &[0xEF; 20]);
    }

    #[test]
    fn flush_of_read_channel_is_a_no_op() {
        let rig = Rig::new();
        let mut channel = rig.channel(2, Direction::Read, Mtu::B32);
        channel.fifo_mut().push(&[1; 8]);
        channel.flush();
        assert!(!channel.is_flushing());
    }

    #[test]
    fn self_loop_requeues() {
        let mut rig = Rig::new();
        let mut channel = rig.channel(2, Direction::Read, Mtu::B32);
        channel.set_cfg(ChannelCfg::default().with_mtu(Mtu::B32).with_self_loop(true));
        channel
            .submit(Command::new(0x100, CmdHeader::bytes(8)), 32)
            .unwrap();
        channel.start();
        rig.run(&mut channel, 20);

        assert!(channel.completed() >= 3);
        assert_eq!(channel.queue().len() + channel.pending() as usize, 1);
    }

    #[test]
    fn size_in_mtus() {
        let mut rig = Rig::new();
        let mut channel = rig.channel(2, Direction::Read, Mtu::B8);
        let header = CmdHeader::bytes(4).with_size_unit(SizeUnit::Mtu);
        channel.submit(Command::new(0, header), 32).unwrap();
        channel.start();
        rig.run(&mut channel, 10);
        assert_eq!(channel.fifo().len(), 32);
    }

    #[test]
    fn submission_errors() {
        let rig = Rig::new();
        let mut channel = rig.channel(2, Direction::Read, Mtu::B32);

        assert!(matches!(
            channel.submit(Command::new(0, CmdHeader::default()), 32),
            Err(ChannelError::Command { .. })
        ));
        assert!(matches!(
            channel.submit(Command::new(0, gated(8, SemOp::PerCommand, 20, 0)), 16),
            Err(ChannelError::InvalidSemaphore(20))
        ));

        for _ in 0..4 {
            channel
                .submit(Command::new(0, CmdHeader::bytes(8)), 32)
                .unwrap();
        }
        assert!(matches!(
            channel.submit(Command::new(0, CmdHeader::bytes(8)), 32),
            Err(ChannelError::QueueFull(2))
        ));
    }

    #[test]
    fn read_faults_are_reported() {
        let mut rig = Rig::new();
        let mut channel = rig.channel(2, Direction::Read, Mtu::B32);
        channel
            .submit(Command::new(0xFFF0, CmdHeader::bytes(32)), 32)
            .unwrap();
        channel.start();
        rig.run(&mut channel, 10);

        let record = rig.errors.record().unwrap();
        assert_eq!(record.address, 0xFFF0);
        assert_eq!(record.kind, FaultKind::ErrorResponse);
        assert_eq!(record.access, Access::Read);
        assert_eq!(channel.completed(), 1);
        assert_eq!(channel.fifo().len(), 32);
    }
}
