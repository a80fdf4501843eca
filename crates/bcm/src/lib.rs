//! Bridge instruction interpreter.
//!
//! The bridge executes a stream of [`Ins`] out of its local instruction memory on behalf of a
//! peripheral. Each instruction becomes a device register access, a dHub command submission or a
//! semaphore operation. The interpreter steps in lockstep with the hub it drives.
mod exec;
pub mod ins;

use dhub::{
    Dhub, channel::ChannelError, error::ErrorReporter, semaphore::SemaphoreError,
    transport::RegisterTransport,
};
use easyerr::{Error, ResultExt};
use ins::{DecodeError, Ins};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Channel serving RCMD and RDAT.
    pub read_channel: u8,
    /// Channel serving WCMD and WDAT.
    pub write_channel: u8,
    /// Read channel whose data FIFO refills the instruction memory once execution reaches the
    /// end of the loaded program.
    pub program_channel: Option<u8>,
    /// Size of the instruction memory, in 64-bit words.
    pub tcm_len: usize,
    /// Timeout published by the bridge's error reporter. Informational only: whether a device
    /// access timed out is decided by the register transport, which answers with
    /// `BusFault::Timeout`.
    pub bus_timeout: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_channel: 0,
            write_channel: 1,
            program_channel: None,
            tcm_len: 512,
            bus_timeout: 256,
        }
    }
}

/// Why the bridge could not complete an instruction this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stall {
    /// A semaphore precondition is not met.
    Semaphore(u8),
    /// The command queue of the channel is full.
    QueueFull(u8),
    /// Not enough data (RDAT) or room (WDAT) in the data FIFO of the channel.
    Fifo(u8),
    /// Waiting for the program channel to deliver more instructions.
    Fetch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    Running,
    Stalled(Stall),
    /// Reached the end of the stream.
    Halted,
    /// Hit an invalid instruction at the given word address.
    Faulted(usize),
}

/// Outcome of a single [`Interpreter::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Executed(Ins),
    Stalled(Stall),
    Halted,
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("invalid instruction at word {pc}: {source}")]
    InvalidInstruction { pc: usize, source: DecodeError },
    #[error("bridge is faulted at word {f0}")]
    Faulted(usize),
    #[error(transparent)]
    Channel { source: ChannelError },
    #[error(transparent)]
    Semaphore { source: SemaphoreError },
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("program of {len} words does not fit in {capacity} words of instruction memory")]
    TooLong { len: usize, capacity: usize },
    #[error("program image of {f0} bytes is not a whole number of words")]
    Unaligned(usize),
}

#[derive(Debug)]
pub struct Interpreter {
    config: Config,
    tcm: Vec<u64>,
    pc: usize,
    state: State,
    errors: ErrorReporter,
    /// Device bus kept after a data move without `last`.
    holding_bus: bool,
    executed: u64,
}

impl Interpreter {
    pub fn new(config: Config) -> Self {
        Self {
            tcm: Vec::with_capacity(config.tcm_len),
            pc: 0,
            state: State::Halted,
            errors: ErrorReporter::new(config.bus_timeout),
            holding_bus: false,
            executed: 0,
            config,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Loads a program and starts executing it from its first word.
    pub fn load(&mut self, program: &[u64]) -> Result<(), LoadError> {
        if program.len() > self.config.tcm_len {
            return Err(LoadError::TooLong {
                len: program.len(),
                capacity: self.config.tcm_len,
            });
        }

        self.tcm.clear();
        self.tcm.extend_from_slice(program);
        self.pc = 0;
        self.state = State::Running;
        self.holding_bus = false;

        tracing::debug!("loaded {} instruction words", program.len());
        Ok(())
    }

    /// Loads a little-endian program image.
    pub fn load_bytes(&mut self, image: &[u8]) -> Result<(), LoadError> {
        if image.len() % 8 != 0 {
            return Err(LoadError::Unaligned(image.len()));
        }

        self.load(&ins::words(image))
    }

    /// Restarts execution at `pc`, clearing a fault.
    pub fn resume_at(&mut self, pc: usize) {
        tracing::debug!("resuming at word {pc}");
        self.pc = pc;
        self.state = State::Running;
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// The bridge's own fault latch (`BCMErrSt`), covering device accesses.
    pub fn errors(&self) -> &ErrorReporter {
        &self.errors
    }

    pub fn errors_mut(&mut self) -> &mut ErrorReporter {
        &mut self.errors
    }

    pub fn holds_bus(&self) -> bool {
        self.holding_bus
    }

    /// Instructions completed since construction.
    pub fn executed(&self) -> u64 {
        self.executed
    }

    pub fn is_halted(&self) -> bool {
        self.state == State::Halted
    }

    /// Moves whole words from the program channel's FIFO into instruction memory, keeping the
    /// words not yet executed. Returns whether anything arrived.
    fn refill(&mut self, hub: &mut Dhub, channel: u8) -> Result<bool, ExecError> {
        let fifo = hub
            .channel_mut(channel)
            .context(ExecCtx::Channel)?
            .fifo_mut();

        let tail = self.tcm.len().saturating_sub(self.pc);
        let room = self.config.tcm_len.saturating_sub(tail);
        let words = (fifo.len() / 8).min(room);
        if words == 0 {
            return Ok(false);
        }

        let bytes = fifo.pop_partial(words * 8);
        self.tcm.drain(..self.pc.min(self.tcm.len()));
        self.pc = 0;
        self.tcm.extend(ins::words(&bytes));

        tracing::trace!("fetched {words} words from channel {channel}");
        Ok(true)
    }

    /// Decodes the instruction at the program counter, refilling from the program channel when
    /// the loaded stream runs out.
    fn fetch(&mut self, hub: &mut Dhub) -> Result<Option<(Ins, usize)>, ExecError> {
        loop {
            let words = self.tcm.get(self.pc..).unwrap_or_default();
            match Ins::decode(words) {
                Ok(decoded) => return Ok(Some(decoded)),
                Err(DecodeError::Truncated) => {
                    let Some(channel) = self.config.program_channel else {
                        return Ok(None);
                    };

                    if !self.refill(hub, channel)? {
                        self.state = State::Stalled(Stall::Fetch);
                        return Ok(None);
                    }
                }
                Err(source) => {
                    self.state = State::Faulted(self.pc);
                    return Err(ExecError::InvalidInstruction {
                        pc: self.pc,
                        source,
                    });
                }
            }
        }
    }

    /// Executes at most one instruction.
    pub fn step(
        &mut self,
        hub: &mut Dhub,
        device: &mut impl RegisterTransport,
    ) -> Result<Step, ExecError> {
        match self.state {
            State::Halted => return Ok(Step::Halted),
            State::Faulted(pc) => return Err(ExecError::Faulted(pc)),
            State::Running | State::Stalled(_) => (),
        }

        // fetch
        let decoded = match self.fetch(hub) {
            Ok(decoded) => decoded,
            Err(ExecError::InvalidInstruction {
                pc,
                source: DecodeError::UnknownOpcode(tag),
            }) => {
                tracing::warn!("unrecognised opcode tag 0x{tag:X} at word {pc}, ending stream");
                self.state = State::Halted;
                return Ok(Step::Halted);
            }
            Err(e) => return Err(e),
        };

        let Some((ins, len)) = decoded else {
            if self.state == State::Stalled(Stall::Fetch) {
                return Ok(Step::Stalled(Stall::Fetch));
            }

            tracing::debug!("ran off the end of the program at word {}", self.pc);
            self.state = State::Halted;
            return Ok(Step::Halted);
        };

        // execute
        if let Some(stall) = self.exec(hub, device, ins)? {
            if self.state != State::Stalled(stall) {
                tracing::trace!("{ins} stalled on {stall:?}");
            }

            self.state = State::Stalled(stall);
            return Ok(Step::Stalled(stall));
        }

        if ins == Ins::Null {
            tracing::debug!("end of stream at word {}", self.pc);
            self.state = State::Halted;
            return Ok(Step::Halted);
        }

        self.pc += len;
        self.executed += 1;
        self.state = State::Running;
        Ok(Step::Executed(ins))
    }

    /// Runs the bridge and the hub together, one hub cycle per bridge step, until the bridge has
    /// halted and the hub is idle or `max` cycles have run. Returns whether it finished.
    pub fn run(
        &mut self,
        hub: &mut Dhub,
        device: &mut impl RegisterTransport,
        max: u64,
    ) -> Result<bool, ExecError> {
        for _ in 0..max {
            if self.is_halted() && hub.is_idle() {
                return Ok(true);
            }

            self.step(hub, device)?;
            hub.step();
        }

        Ok(self.is_halted() && hub.is_idle())
    }
}
