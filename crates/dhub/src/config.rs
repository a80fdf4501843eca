//! Device configuration.
use crate::{fifo::FifoError, regs};
use easyerr::Error;
use serde::Deserialize;

/// Fixed direction of a channel's data path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum Direction {
    /// DRAM to data FIFO.
    #[default]
    Read,
    /// Data FIFO to DRAM.
    Write,
}

/// Margins used to derive the almost-empty and almost-full flags of every semaphore cell.
///
/// A cell is almost empty when its count is at most `almost_empty`, and almost full when its free
/// room is at most `almost_full`. With both at zero the almost flags track empty and full exactly.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    pub almost_empty: u16,
    pub almost_full: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub direction: Direction,
    /// Capacity of the command queue, in commands.
    pub queue_depth: usize,
    /// SRAM byte offset of the data FIFO.
    pub fifo_base: u32,
    /// Size of the data FIFO in bytes.
    pub fifo_len: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            direction: Direction::Read,
            queue_depth: 32,
            fifo_base: 0,
            fifo_len: 0x800,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of semaphore cells.
    pub semaphores: usize,
    pub thresholds: Thresholds,
    pub channels: Vec<ChannelConfig>,
    /// Size of the on-chip SRAM holding the data FIFOs.
    pub sram_len: u32,
    /// Size of the DRAM target.
    pub dram_len: u32,
    /// Cycles between issuing a bus transaction and its completion.
    pub dram_latency: u32,
    /// Idle cycles after which an outstanding transaction is considered timed out.
    pub bus_timeout: u32,
}

impl Default for Config {
    /// Sixteen channels alternating read and write, each with a 2 KiB data FIFO.
    fn default() -> Self {
        let channels = (0..regs::channel::COUNT)
            .map(|i| ChannelConfig {
                direction: if i % 2 == 0 {
                    Direction::Read
                } else {
                    Direction::Write
                },
                fifo_base: i * 0x800,
                ..Default::default()
            })
            .collect();

        Self {
            semaphores: regs::sema::CELL_COUNT as usize,
            thresholds: Thresholds::default(),
            channels,
            sram_len: 0x8000,
            dram_len: 0x0010_0000,
            dram_latency: 4,
            bus_timeout: 256,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{f0} channels configured, at most 16 are supported")]
    TooManyChannels(usize),
    #[error("{f0} semaphores configured, between 1 and 32 are supported")]
    SemaphoreCount(usize),
    #[error("channel {f0} has a zero-capacity command queue")]
    EmptyQueue(usize),
    #[error("SRAM of {f0} bytes exceeds the 20-bit FIFO base range")]
    SramTooLarge(u32),
    #[error("bus timeout must be non-zero")]
    ZeroTimeout,
    #[error(transparent)]
    Fifo { source: FifoError },
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.channels.len() > regs::channel::COUNT as usize {
            return Err(ConfigError::TooManyChannels(self.channels.len()));
        }

        if self.semaphores == 0 || self.semaphores > regs::sema::CELL_COUNT as usize {
            return Err(ConfigError::SemaphoreCount(self.semaphores));
        }

        if let Some(index) = self.channels.iter().position(|c| c.queue_depth == 0) {
            return Err(ConfigError::EmptyQueue(index));
        }

        if self.sram_len > 1 << 20 {
            return Err(ConfigError::SramTooLarge(self.sram_len));
        }

        if self.bus_timeout == 0 {
            return Err(ConfigError::ZeroTimeout);
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.channels.len(), 16);
        assert_eq!(config.channels[2].direction, Direction::Read);
        assert_eq!(config.channels[3].direction, Direction::Write);
    }

    #[test]
    fn rejects_too_many_semaphores() {
        let config = Config {
            semaphores: 33,
            ..Default::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ConfigError::SemaphoreCount(33))
        ));
    }
}
