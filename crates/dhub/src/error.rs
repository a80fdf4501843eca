//! Bus fault latching.
use bitos::bitos;

#[bitos(1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FaultKind {
    #[default]
    Timeout = 0,
    ErrorResponse = 1,
}

#[bitos(1)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    #[default]
    Read = 0,
    Write = 1,
}

/// Error status register (`BCMErrSt`).
#[bitos(32)]
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrStatus {
    #[bits(0)]
    pub mode: FaultKind,
    #[bits(1)]
    pub op: Access,
    /// A record is latched and not yet acknowledged.
    #[bits(2)]
    pub latched: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorRecord {
    pub address: u32,
    pub access: Access,
    pub kind: FaultKind,
    pub acknowledged: bool,
}

/// Latches the first bus fault until it is acknowledged.
#[derive(Debug)]
pub struct ErrorReporter {
    record: Option<ErrorRecord>,
    /// Interrupt pulses not yet observed.
    pulses: u32,
    timeout: u32,
}

impl ErrorReporter {
    pub fn new(timeout: u32) -> Self {
        Self {
            record: None,
            pulses: 0,
            timeout,
        }
    }

    /// Idle cycles after which a bus transaction is reported as timed out.
    pub fn timeout(&self) -> u32 {
        self.timeout
    }

    /// Records a fault unless one is already latched. Returns whether it was accepted.
    pub fn report(&mut self, address: u32, access: Access, kind: FaultKind) -> bool {
        if self.is_latched() {
            tracing::debug!("dropping {kind:?} on {access:?} of 0x{address:08X}, fault already latched");
            return false;
        }

        tracing::warn!("bus fault: {kind:?} on {access:?} of 0x{address:08X}");
        self.record = Some(ErrorRecord {
            address,
            access,
            kind,
            acknowledged: false,
        });
        self.pulses += 1;

        true
    }

    pub fn acknowledge(&mut self) {
        if let Some(record) = &mut self.record {
            record.acknowledged = true;
        }
    }

    pub fn is_latched(&self) -> bool {
        self.record.is_some_and(|r| !r.acknowledged)
    }

    pub fn record(&self) -> Option<&ErrorRecord> {
        self.record.as_ref()
    }

    /// Consumes one interrupt pulse, if any was raised.
    pub fn take_interrupt(&mut self) -> bool {
        if self.pulses == 0 {
            return false;
        }

        self.pulses -= 1;
        true
    }

    pub fn status(&self) -> ErrStatus {
        match self.record {
            Some(record) => ErrStatus::default()
                .with_mode(record.kind)
                .with_op(record.access)
                .with_latched(!record.acknowledged),
            None => ErrStatus::default(),
        }
    }

    pub fn address(&self) -> u32 {
        self.record.map_or(0, |r| r.address)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn first_fault_wins() {
        let mut errors = ErrorReporter::new(256);
        assert!(errors.report(0x100, Access::Read, FaultKind::Timeout));
        assert!(!errors.report(0x200, Access::Write, FaultKind::ErrorResponse));

        let record = errors.record().unwrap();
        assert_eq!(record.address, 0x100);
        assert_eq!(record.kind, FaultKind::Timeout);

        assert!(errors.take_interrupt());
        assert!(!errors.take_interrupt());
    }

    #[test]
    fn acknowledge_rearms() {
        let mut errors = ErrorReporter::new(256);
        errors.report(0x100, Access::Read, FaultKind::Timeout);
        errors.acknowledge();
        assert!(!errors.is_latched());
        assert!(!errors.status().latched());

        assert!(errors.report(0x300, Access::Write, FaultKind::ErrorResponse));
        let status = errors.status();
        assert_eq!(status.mode(), FaultKind::ErrorResponse);
        assert_eq!(status.op(), Access::Write);
        assert!(status.latched());
        assert_eq!(errors.address(), 0x300);
        assert_eq!(status.to_bits() & 0b11, 0b11);
    }
}
