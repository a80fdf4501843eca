//! Per-channel command queue.
use crate::{
    command::{Command, Command2D},
    twod::{self, DescriptorError, Lines},
};
use std::collections::VecDeque;

/// Bounded FIFO of linear commands, dequeued strictly in submission order.
#[derive(Debug)]
pub struct CommandQueue {
    entries: VecDeque<Command>,
    capacity: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Appends to the tail. Returns the command back if the queue is full.
    pub fn push(&mut self, cmd: Command) -> Result<(), Command> {
        if self.is_full() {
            return Err(cmd);
        }

        self.entries.push_back(cmd);
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Command> {
        self.entries.pop_front()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.entries.iter()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Shadow registers of a channel's 2D block and the expansion currently feeding its queue.
#[derive(Debug, Default)]
pub struct TwoDEngine {
    /// Descriptor as last written through the register block.
    pub shadow: Command2D,
    lines: Option<Lines>,
}

impl TwoDEngine {
    /// Starts expanding a descriptor, replacing any expansion in progress.
    pub fn start(&mut self, cmd: &Command2D) -> Result<(), DescriptorError> {
        if self.lines.is_some() {
            tracing::warn!("2D engine restarted before the previous descriptor finished");
        }

        self.lines = Some(twod::expand(cmd)?);
        Ok(())
    }

    pub fn is_busy(&self) -> bool {
        self.lines.is_some()
    }

    /// Lines not yet moved into the queue.
    pub fn remaining(&self) -> usize {
        self.lines.as_ref().map_or(0, ExactSizeIterator::len)
    }

    /// Drops the expansion in progress.
    pub fn clear(&mut self) {
        self.lines = None;
    }

    /// Moves as many lines as fit into the queue.
    pub fn feed(&mut self, queue: &mut CommandQueue) {
        let Some(lines) = &mut self.lines else {
            return;
        };

        while !queue.is_full() {
            let Some(line) = lines.next() else {
                break;
            };

            // cannot fail, the queue was checked above
            let _ = queue.push(line);
        }

        if lines.len() == 0 {
            self.lines = None;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::command::{CmdHeader, Cmd2DDesc};
    use bitos::integer::{u2, u13};

    #[test]
    fn bounded_fifo_order() {
        let mut queue = CommandQueue::new(2);
        let a = Command::new(0x10, CmdHeader::bytes(8));
        let b = Command::new(0x20, CmdHeader::bytes(8));
        let c = Command::new(0x30, CmdHeader::bytes(8));

        queue.push(a).unwrap();
        queue.push(b).unwrap();
        assert_eq!(queue.push(c), Err(c));

        assert_eq!(queue.pop(), Some(a));
        assert_eq!(queue.pop(), Some(b));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn engine_feeds_as_room_frees() {
        let cmd = Command2D {
            addr: 0,
            desc: Cmd2DDesc::default()
                .with_num_lines(u13::new(5))
                .with_stride(0x40)
                .with_hdr_loop(u2::new(1)),
            headers: [CmdHeader::bytes(0x40); 4],
        };

        let mut engine = TwoDEngine::default();
        let mut queue = CommandQueue::new(2);
        engine.start(&cmd).unwrap();

        engine.feed(&mut queue);
        assert_eq!(queue.len(), 2);
        assert_eq!(engine.remaining(), 3);

        queue.pop();
        queue.pop();
        engine.feed(&mut queue);
        queue.pop();
        queue.pop();
        engine.feed(&mut queue);

        assert!(!engine.is_busy());
        assert_eq!(queue.pop().map(|c| c.addr), Some(0x100));
    }
}
