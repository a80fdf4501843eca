use bcm::{
    ExecError, Interpreter, Stall, State, Step,
    ins::{self, DecodeError, Ins, SemaOps},
};
use dhub::{
    Dhub,
    config::Config as HubConfig,
    error::{Access, FaultKind},
    regs::Master,
    transport::RegisterFile,
};
use libtest_mimic::{Arguments, Failed, Trial};

/// Fails the scenario with a message when the condition does not hold.
macro_rules! check {
    ($cond:expr, $($msg:tt)+) => {
        if !$cond {
            return Err(Failed::from(format!($($msg)+)));
        }
    };
}

struct Rig {
    hub: Dhub,
    device: RegisterFile,
    bridge: Interpreter,
}

impl Rig {
    fn new() -> Self {
        Self::with(HubConfig::default(), bcm::Config::default())
    }

    fn with(hub: HubConfig, bridge: bcm::Config) -> Self {
        Self {
            hub: Dhub::new(hub).unwrap(),
            device: RegisterFile::new(),
            bridge: Interpreter::new(bridge),
        }
    }

    fn load(&mut self, program: &str) {
        self.bridge.load(&ins::assemble(program).unwrap()).unwrap();
    }

    fn step(&mut self) -> Result<Step, ExecError> {
        let step = self.bridge.step(&mut self.hub, &mut self.device);
        self.hub.step();
        step
    }

    fn run(&mut self) -> Result<(), Failed> {
        match self.bridge.run(&mut self.hub, &mut self.device, 2000) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Failed::from(format!(
                "did not finish: bridge {:?} at word {}",
                self.bridge.state(),
                self.bridge.pc()
            ))),
            Err(e) => Err(Failed::from(format!("bridge error: {e}"))),
        }
    }

    fn count(&self, id: u8) -> u16 {
        self.hub
            .semaphores()
            .query(id, Master::Consumer)
            .unwrap()
            .count()
    }
}

fn stream_ends_on_null() -> Result<(), Failed> {
    let mut rig = Rig::new();
    rig.load(
        "
        sema pupd=3
        rcmd addr=0x1000 size=128 chk=0 upd=5
        null
        ",
    );

    let step = rig.step().unwrap();
    check!(
        step == Step::Executed(Ins::Sema(SemaOps {
            p_upd: 3,
            ..Default::default()
        })),
        "first step was {step:?}"
    );
    check!(rig.count(3) == 1, "semaphore 3 holds {}", rig.count(3));

    let step = rig.step().unwrap();
    check!(matches!(step, Step::Executed(Ins::Rcmd(_))), "second step was {step:?}");
    check!(
        rig.hub.channel(0).unwrap().queue().len() == 1,
        "RCMD was not queued on the read channel"
    );

    check!(rig.step().unwrap() == Step::Halted, "NULL did not halt");
    check!(rig.bridge.pc() == 3, "halted at word {}", rig.bridge.pc());
    check!(rig.bridge.executed() == 2, "executed {}", rig.bridge.executed());

    rig.hub.start(0).unwrap();
    check!(rig.hub.run_until_idle(500), "hub never went idle");
    check!(rig.count(5) == 1, "semaphore 5 holds {}", rig.count(5));
    check!(
        rig.hub.channel(0).unwrap().fifo().len() == 128,
        "read FIFO holds {} bytes",
        rig.hub.channel(0).unwrap().fifo().len()
    );

    Ok(())
}

fn read_data_reaches_the_device() -> Result<(), Failed> {
    let mut rig = Rig::new();
    rig.hub
        .dram_mut()
        .write(0x2000, &[0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08])
        .unwrap();
    rig.hub.start(0).unwrap();
    rig.load(
        "
        rcmd addr=0x2000 size=8 upd=2
        rdat dev=0x40 size=8 mode=dword endian=le last=1 cupd=2 pupd=4
        null
        ",
    );

    rig.step().unwrap();
    let step = rig.step().unwrap();
    check!(
        step == Step::Stalled(Stall::Semaphore(2)),
        "RDAT ran ahead of its data: {step:?}"
    );

    rig.run()?;
    check!(
        rig.device.writes() == [(0x40, 0x0403_0201), (0x40, 0x0807_0605)],
        "device saw {:X?}",
        rig.device.writes()
    );
    check!(rig.count(2) == 0, "consumer semaphore holds {}", rig.count(2));
    check!(rig.count(4) == 1, "producer semaphore holds {}", rig.count(4));
    check!(!rig.bridge.holds_bus(), "bus kept after last transfer");

    Ok(())
}

fn device_data_reaches_dram() -> Result<(), Failed> {
    let mut rig = Rig::new();
    rig.device.set(0x80, 0xCAFE_BABE);
    rig.hub.start(1).unwrap();
    rig.load(
        "
        wdat dev=0x80 size=8 mode=dword endian=be last=0
        wcmd addr=0x3000 size=8 upd=6
        null
        ",
    );

    rig.run()?;
    let written = rig.hub.dram().slice(0x3000, 8).unwrap();
    check!(
        written == [0xCA, 0xFE, 0xBA, 0xBE, 0xCA, 0xFE, 0xBA, 0xBE],
        "DRAM holds {written:X?}"
    );
    check!(rig.count(6) == 1, "completion semaphore holds {}", rig.count(6));
    check!(rig.bridge.holds_bus(), "bus released without last");

    Ok(())
}

fn sema_checks_before_updating() -> Result<(), Failed> {
    let mut rig = Rig::new();
    rig.load(
        "
        sema pupd=7 cchk=8
        null
        ",
    );

    for _ in 0..3 {
        let step = rig.step().unwrap();
        check!(
            step == Step::Stalled(Stall::Semaphore(8)),
            "unmet check did not stall: {step:?}"
        );
    }

    check!(rig.count(7) == 0, "update applied while stalled");
    check!(
        rig.bridge.state() == State::Stalled(Stall::Semaphore(8)),
        "state is {:?}",
        rig.bridge.state()
    );

    rig.hub.semaphores().push(8, 1).unwrap();
    rig.run()?;
    check!(rig.count(7) == 1, "producer update lost");
    check!(rig.count(8) == 1, "check consumed the semaphore");

    Ok(())
}

fn sema_updates_on_one_cell_chain() -> Result<(), Failed> {
    let mut rig = Rig::new();
    rig.load(
        "
        sema pupd=3 cupd=3
        null
        ",
    );

    let step = rig.step().unwrap();
    check!(
        matches!(step, Step::Executed(Ins::Sema(_))),
        "push then pop on an empty cell gave {step:?}"
    );
    check!(rig.count(3) == 0, "semaphore 3 holds {}", rig.count(3));

    let producer = rig.hub.semaphores().query(3, Master::Producer).unwrap();
    check!(producer.pointer() == 1, "write pointer is {}", producer.pointer());
    rig.run()?;

    Ok(())
}

fn full_queue_stalls() -> Result<(), Failed> {
    let mut config = HubConfig::default();
    config.channels[0].queue_depth = 1;

    let mut rig = Rig::with(config, bcm::Config::default());
    rig.load(
        "
        rcmd addr=0x0 size=8
        rcmd addr=0x8 size=8
        null
        ",
    );

    rig.step().unwrap();
    let step = rig.step().unwrap();
    check!(step == Step::Stalled(Stall::QueueFull(0)), "second RCMD gave {step:?}");

    rig.hub.start(0).unwrap();
    rig.run()?;
    check!(
        rig.hub.channel(0).unwrap().completed() == 2,
        "completed {} commands",
        rig.hub.channel(0).unwrap().completed()
    );

    Ok(())
}

fn invalid_instruction_faults() -> Result<(), Failed> {
    let mut rig = Rig::new();
    let mut program = ins::assemble("sema pupd=1").unwrap();
    program.push(0x6 | 1 << 30);
    program.extend(ins::assemble("sema pupd=2\nnull").unwrap());
    rig.bridge.load(&program).unwrap();

    rig.step().unwrap();
    let result = rig.step();
    check!(
        matches!(
            result,
            Err(ExecError::InvalidInstruction {
                pc: 1,
                source: DecodeError::Reserved { .. }
            })
        ),
        "reserved bits gave {result:?}"
    );
    check!(rig.bridge.state() == State::Faulted(1), "state is {:?}", rig.bridge.state());
    check!(
        matches!(rig.step(), Err(ExecError::Faulted(1))),
        "faulted bridge kept stepping"
    );

    rig.bridge.resume_at(2);
    rig.run()?;
    check!(rig.count(2) == 1, "did not resume after the fault");

    Ok(())
}

fn unknown_opcode_ends_stream() -> Result<(), Failed> {
    let mut rig = Rig::new();
    rig.bridge.load(&[0x7, 0xF]).unwrap();

    let step = rig.step();
    check!(matches!(step, Ok(Step::Halted)), "tag 0x7 gave {step:?}");
    check!(rig.bridge.is_halted(), "state is {:?}", rig.bridge.state());

    Ok(())
}

fn device_faults_latch() -> Result<(), Failed> {
    let mut rig = Rig::new();
    rig.device.inject(0x10, FaultKind::ErrorResponse);
    rig.device.inject(0x18, FaultKind::Timeout);
    rig.load(
        "
        cfgw addr=0x10 data=0x1
        cfgw addr=0x18 data=0x2
        cfgw addr=0x14 data=0x3
        null
        ",
    );

    rig.run()?;
    let errors = rig.bridge.errors();
    let record = errors.record().unwrap();
    check!(errors.timeout() == 256, "reporter publishes {}", errors.timeout());
    check!(record.address == 0x10, "latched 0x{:X}", record.address);
    check!(record.kind == FaultKind::ErrorResponse, "latched {:?}", record.kind);
    check!(record.access == Access::Write, "latched a {:?}", record.access);
    check!(rig.device.get(0x14) == 3, "execution stopped at the fault");
    check!(rig.bridge.errors_mut().take_interrupt(), "no interrupt pulse");
    check!(!rig.bridge.errors_mut().take_interrupt(), "second fault pulsed");

    Ok(())
}

fn program_channel_streams_functions() -> Result<(), Failed> {
    let bridge = bcm::Config {
        program_channel: Some(2),
        ..Default::default()
    };

    let mut rig = Rig::with(HubConfig::default(), bridge);
    let function = ins::assemble("sema pupd=9\nnull").unwrap();
    rig.hub
        .dram_mut()
        .write(0x4000, &ins::bytes(&function))
        .unwrap();
    rig.hub.start(2).unwrap();
    rig.load("ldfn addr=0x4000 size=16 ch=2 intr=0");

    rig.step().unwrap();
    let step = rig.step().unwrap();
    check!(step == Step::Stalled(Stall::Fetch), "expected a fetch stall, got {step:?}");

    rig.run()?;
    check!(rig.count(9) == 1, "streamed function did not run");

    Ok(())
}

fn main() {
    let args = Arguments::from_args();
    let scenarios: [(&str, fn() -> Result<(), Failed>); 10] = [
        ("stream_ends_on_null", stream_ends_on_null),
        ("read_data_reaches_the_device", read_data_reaches_the_device),
        ("device_data_reaches_dram", device_data_reaches_dram),
        ("sema_checks_before_updating", sema_checks_before_updating),
        ("sema_updates_on_one_cell_chain", sema_updates_on_one_cell_chain),
        ("full_queue_stalls", full_queue_stalls),
        ("invalid_instruction_faults", invalid_instruction_faults),
        ("unknown_opcode_ends_stream", unknown_opcode_ends_stream),
        ("device_faults_latch", device_faults_latch),
        ("program_channel_streams_functions", program_channel_streams_functions),
    ];

    let tests = scenarios
        .into_iter()
        .map(|(name, scenario)| {
            Trial::test(name, move || {
                match std::panic::catch_unwind(scenario) {
                    Ok(r) => r,
                    Err(e) => {
                        let mut msg = "<unknown panic>".to_owned();
                        if let Some(s) = e.downcast_ref::<String>() {
                            msg = s.clone();
                        } else if let Some(s) = e.downcast_ref::<&'static str>() {
                            msg = (*s).to_owned();
                        }

                        Err(Failed::from(msg))
                    }
                }
            })
        })
        .collect();

    libtest_mimic::run(&args, tests).exit();
}
