//! 2D engine: expands strided descriptors into linear commands.
use crate::command::{Command, Command2D};
use easyerr::Error;

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("2D descriptor has no lines")]
    NoLines,
    #[error("2D descriptor with {f0} lines has a zero stride")]
    ZeroStride(u32),
}

/// Lazily expands a 2D descriptor into exactly `num_lines` commands.
pub fn expand(cmd: &Command2D) -> Result<Lines, DescriptorError> {
    let lines = cmd.desc.lines();
    if lines == 0 {
        return Err(DescriptorError::NoLines);
    }

    if cmd.desc.stride() == 0 && lines > 1 {
        return Err(DescriptorError::ZeroStride(lines));
    }

    Ok(Lines {
        cmd: *cmd,
        next: 0,
        total: lines,
    })
}

/// Line sequence produced by [`expand`].
#[derive(Debug, Clone)]
pub struct Lines {
    cmd: Command2D,
    next: u32,
    total: u32,
}

impl Lines {
    /// Command for line `index`, without advancing.
    fn line(&self, index: u32) -> Command {
        let desc = self.cmd.desc;
        let mut header = self.cmd.headers[index as usize % desc.loop_len()];
        if desc.interrupt() && index + 1 == self.total {
            header.set_interrupt(true);
        }

        let addr = self
            .cmd
            .addr
            .wrapping_add(index.wrapping_mul(desc.stride() as u32));

        Command::new(addr, header)
    }

    /// Next line, without advancing.
    pub fn peek(&self) -> Option<Command> {
        (self.next < self.total).then(|| self.line(self.next))
    }
}

impl Iterator for Lines {
    type Item = Command;

    fn next(&mut self) -> Option<Self::Item> {
        let cmd = self.peek()?;
        self.next += 1;
        Some(cmd)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let left = (self.total - self.next) as usize;
        (left, Some(left))
    }
}

impl ExactSizeIterator for Lines {}
