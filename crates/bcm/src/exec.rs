use crate::{
    ExecCtx, ExecError, Interpreter, Stall,
    ins::{DataMove, Endian, Ins, SemaOps},
};
use dhub::{
    Dhub,
    channel::ChannelError,
    command::{CmdHeader, Command},
    error::Access,
    semaphore::{SemaphoreError, SemaphoreHub},
    transport::{BusFault, RegisterTransport},
};
use easyerr::ResultExt;
use std::sync::Arc;

fn unit_value(bytes: &[u8], endian: Endian) -> u32 {
    let mut word = [0; 4];
    match endian {
        Endian::Little => {
            word[..bytes.len()].copy_from_slice(bytes);
            u32::from_le_bytes(word)
        }
        Endian::Big => {
            word[4 - bytes.len()..].copy_from_slice(bytes);
            u32::from_be_bytes(word)
        }
    }
}

fn unit_bytes(value: u32, width: usize, endian: Endian) -> Vec<u8> {
    match endian {
        Endian::Little => value.to_le_bytes()[..width].to_vec(),
        Endian::Big => value.to_be_bytes()[4 - width..].to_vec(),
    }
}

type Check = fn(&SemaphoreHub, u8, u32) -> Result<bool, SemaphoreError>;

/// Precondition of a semaphore sub-operation. Id zero always passes.
fn ready(sema: &SemaphoreHub, id: u8, check: Check) -> Result<Option<Stall>, ExecError> {
    if id == 0 {
        return Ok(None);
    }

    let ok = check(sema, id, 1).context(ExecCtx::Semaphore)?;
    Ok((!ok).then_some(Stall::Semaphore(id)))
}

fn push(sema: &SemaphoreHub, id: u8) -> Result<(), ExecError> {
    if id != 0 {
        sema.push(id, 1).context(ExecCtx::Semaphore)?;
    }

    Ok(())
}

fn pop(sema: &SemaphoreHub, id: u8) -> Result<(), ExecError> {
    if id != 0 {
        sema.pop(id, 1).context(ExecCtx::Semaphore)?;
    }

    Ok(())
}

impl Interpreter {
    /// Executes a decoded instruction. Returns the stall reason if it could not complete, in
    /// which case nothing was changed.
    pub(crate) fn exec(
        &mut self,
        hub: &mut Dhub,
        device: &mut impl RegisterTransport,
        ins: Ins,
    ) -> Result<Option<Stall>, ExecError> {
        match ins {
            Ins::Cfgw { addr, data } => {
                self.cfgw(device, addr, data);
                Ok(None)
            }
            Ins::Ldfn {
                ddr_addr,
                size,
                channel,
                interrupt,
            } => {
                let header = CmdHeader::bytes(size).with_interrupt(interrupt);
                self.submit(hub, channel, Command::new(ddr_addr, header))
            }
            Ins::Rcmd(cmd) => {
                let channel = self.config.read_channel;
                self.submit(hub, channel, cmd)
            }
            Ins::Wcmd(cmd) => {
                let channel = self.config.write_channel;
                self.submit(hub, channel, cmd)
            }
            Ins::Rdat(mv) => self.rdat(hub, device, mv),
            Ins::Wdat(mv) => self.wdat(hub, device, mv),
            Ins::Sema(ops) => self.sema(hub.semaphores(), ops),
            Ins::Null => Ok(None),
        }
    }

    fn report(&mut self, fault: BusFault, access: Access) {
        self.errors.report(fault.offset(), access, fault.kind());
    }

    fn cfgw(&mut self, device: &mut impl RegisterTransport, addr: u32, data: u32) {
        tracing::debug!("CFGW 0x{data:08X} -> 0x{addr:08X}");
        if let Err(fault) = device.write_register(addr, data) {
            self.report(fault, Access::Write);
        }
    }

    fn submit(&mut self, hub: &mut Dhub, channel: u8, cmd: Command) -> Result<Option<Stall>, ExecError> {
        match hub.submit(channel, cmd) {
            Ok(()) => {
                tracing::debug!(
                    "submitted {} bytes at 0x{:08X} to channel {channel}",
                    cmd.header.size(),
                    cmd.addr
                );
                Ok(None)
            }
            Err(ChannelError::QueueFull(channel)) => Ok(Some(Stall::QueueFull(channel))),
            Err(source) => Err(ExecError::Channel { source }),
        }
    }

    fn rdat(
        &mut self,
        hub: &mut Dhub,
        device: &mut impl RegisterTransport,
        mv: DataMove,
    ) -> Result<Option<Stall>, ExecError> {
        let sema = Arc::clone(hub.semaphores());
        if let Some(stall) = ready(&sema, mv.c_upd, SemaphoreHub::can_pop)? {
            return Ok(Some(stall));
        }

        if let Some(stall) = ready(&sema, mv.p_upd, SemaphoreHub::can_push)? {
            return Ok(Some(stall));
        }

        let channel = self.config.read_channel;
        let fifo = hub.channel_mut(channel).context(ExecCtx::Channel)?.fifo_mut();
        let Some(data) = fifo.pop(mv.size as usize) else {
            return Ok(Some(Stall::Fifo(channel)));
        };

        for unit in data.chunks_exact(mv.mode.width()) {
            let value = unit_value(unit, mv.endian);
            if let Err(fault) = device.write_register(mv.dev_addr, value) {
                self.report(fault, Access::Write);
            }
        }

        pop(&sema, mv.c_upd)?;
        push(&sema, mv.p_upd)?;
        self.holding_bus = !mv.last;

        tracing::debug!("RDAT {} bytes -> 0x{:08X}", mv.size, mv.dev_addr);
        Ok(None)
    }

    fn wdat(
        &mut self,
        hub: &mut Dhub,
        device: &mut impl RegisterTransport,
        mv: DataMove,
    ) -> Result<Option<Stall>, ExecError> {
        let sema = Arc::clone(hub.semaphores());
        if let Some(stall) = ready(&sema, mv.c_upd, SemaphoreHub::can_pop)? {
            return Ok(Some(stall));
        }

        let channel = self.config.write_channel;
        let fifo = hub.channel_mut(channel).context(ExecCtx::Channel)?.fifo_mut();
        if !fifo.is_enabled() || fifo.free() < mv.size as usize {
            return Ok(Some(Stall::Fifo(channel)));
        }

        let width = mv.mode.width();
        let mut data = Vec::with_capacity(mv.size as usize);
        for _ in 0..mv.size as usize / width {
            let value = match device.read_register(mv.dev_addr) {
                Ok(value) => value,
                Err(fault) => {
                    self.report(fault, Access::Read);
                    0
                }
            };

            data.extend(unit_bytes(value, width, mv.endian));
        }

        fifo.push(&data);
        pop(&sema, mv.c_upd)?;
        self.holding_bus = !mv.last;

        tracing::debug!("WDAT {} bytes <- 0x{:08X}", mv.size, mv.dev_addr);
        Ok(None)
    }

    fn sema(&mut self, sema: &SemaphoreHub, ops: SemaOps) -> Result<Option<Stall>, ExecError> {
        // the consumer update pops after the producer update, so it can take the entry just
        // pushed to the same cell
        let c_upd = if ops.c_upd == ops.p_upd { 0 } else { ops.c_upd };
        let checks: [(u8, Check); 4] = [
            (ops.p_chk, SemaphoreHub::can_push),
            (ops.c_chk, SemaphoreHub::can_pop),
            (ops.p_upd, SemaphoreHub::can_push),
            (c_upd, SemaphoreHub::can_pop),
        ];

        for (id, check) in checks {
            if let Some(stall) = ready(sema, id, check)? {
                return Ok(Some(stall));
            }
        }

        push(sema, ops.p_upd)?;
        pop(sema, ops.c_upd)?;
        Ok(None)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unit_packing() {
        assert_eq!(unit_value(&[0x12, 0x34], Endian::Little), 0x3412);
        assert_eq!(unit_value(&[0x12, 0x34], Endian::Big), 0x1234);
        assert_eq!(unit_value(&[0xAB], Endian::Big), 0xAB);
        assert_eq!(unit_bytes(0x1234, 2, Endian::Little), vec![0x34, 0x12]);
        assert_eq!(unit_bytes(0x1234, 2, Endian::Big), vec![0x12, 0x34]);
        assert_eq!(
            unit_bytes(0xDEADBEEF, 4, Endian::Big),
            vec![0xDE, 0xAD, 0xBE, 0xEF]
        );
    }
}
