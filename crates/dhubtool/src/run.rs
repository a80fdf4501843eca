use crate::config::ToolConfig;
use bcm::Interpreter;
use bytesize::ByteSize;
use comfy_table::{
    Cell, CellAlignment, ContentArrangement, Table, modifiers::UTF8_ROUND_CORNERS,
    presets::UTF8_FULL,
};
use dhub::{Dhub, config::Direction, error::ErrorReporter, regs::Master, transport::RegisterFile};
use eyre_pretty::{Context, Result, eyre};

fn table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            header
                .iter()
                .map(|h| Cell::new(h).set_alignment(CellAlignment::Center)),
        );

    table
}

fn channel_table(hub: &Dhub) -> Table {
    let mut channels = table(&["Channel", "Direction", "State", "Queued", "FIFO", "Completed"]);
    for channel in hub.channels() {
        let direction = match channel.direction() {
            Direction::Read => "read",
            Direction::Write => "write",
        };

        channels.add_row(vec![
            Cell::new(channel.id()).set_alignment(CellAlignment::Center),
            Cell::new(direction),
            Cell::new(format!("{:?}", channel.status())),
            Cell::new(channel.queue().len()).set_alignment(CellAlignment::Right),
            Cell::new(format!(
                "{} / {}",
                ByteSize(channel.fifo().len() as u64).display(),
                ByteSize(channel.fifo().capacity() as u64).display()
            )),
            Cell::new(channel.completed()).set_alignment(CellAlignment::Right),
        ]);
    }

    channels
}

/// Cells that were touched: non-zero count or moved pointers.
fn semaphore_table(hub: &Dhub) -> Result<Table> {
    let mut cells = table(&["Semaphore", "Depth", "Count", "Read ptr", "Write ptr", "Flags"]);
    let sema = hub.semaphores();
    for id in 0..sema.len() as u8 {
        let consumer = sema.query(id, Master::Consumer)?;
        let producer = sema.query(id, Master::Producer)?;
        if consumer.count() == 0 && consumer.pointer() == 0 && producer.pointer() == 0 {
            continue;
        }

        let flags = sema.flags(id)?;
        let names = [
            (flags.empty(), "empty"),
            (flags.full(), "full"),
            (flags.almost_empty(), "almost empty"),
            (flags.almost_full(), "almost full"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then_some(name))
        .collect::<Vec<_>>()
        .join(", ");

        cells.add_row(vec![
            Cell::new(id).set_alignment(CellAlignment::Center),
            Cell::new(sema.depth(id)?).set_alignment(CellAlignment::Right),
            Cell::new(consumer.count()).set_alignment(CellAlignment::Right),
            Cell::new(consumer.pointer()).set_alignment(CellAlignment::Right),
            Cell::new(producer.pointer()).set_alignment(CellAlignment::Right),
            Cell::new(names),
        ]);
    }

    Ok(cells)
}

fn error_row(name: &str, errors: &ErrorReporter) -> Vec<Cell> {
    match errors.record() {
        Some(record) => vec![
            Cell::new(name),
            Cell::new(format!("{:?}", record.kind)),
            Cell::new(format!("{:?}", record.access)),
            Cell::new(format!("0x{:08X}", record.address)),
            Cell::new(if record.acknowledged { "no" } else { "yes" }),
        ],
        None => vec![Cell::new(name), Cell::new("-"), Cell::new("-"), Cell::new("-"), Cell::new("-")],
    }
}

/// Runs a program and prints the final device state. Returns whether it ran to completion.
pub fn run(program: &[u64], config: ToolConfig, cycles: u64) -> Result<bool> {
    let mut hub = Dhub::new(config.hub.clone()).context("building dHub")?;
    for image in &config.images {
        let bytes = config.image_bytes(image)?;
        hub.dram_mut()
            .write(image.addr, &bytes)
            .map_err(|kind| eyre!("DRAM image at 0x{:08X} does not fit: {kind:?}", image.addr))?;
    }

    let sema = hub.semaphores().clone();
    for preset in &config.semaphores {
        if let Some(depth) = preset.depth {
            sema.configure(preset.id, depth)?;
        }

        if preset.count != 0 {
            sema.push(preset.id, preset.count)?;
        }
    }

    let mut device = RegisterFile::with_values(config.registers.iter().copied());
    for &(addr, fault) in &config.faults {
        device.inject(addr, fault.into());
    }

    for channel in config.started_channels() {
        hub.start(channel)?;
    }

    let mut bridge = Interpreter::new(config.bridge.clone());
    bridge.load(program)?;

    tracing::info!("running {} words for at most {cycles} cycles", program.len());
    let finished = bridge.run(&mut hub, &mut device, cycles)?;
    if !finished {
        tracing::warn!(
            "stopped after {} cycles with the bridge {:?} at word {}",
            hub.cycle(),
            bridge.state(),
            bridge.pc()
        );
    }

    let mut summary = Table::new();
    summary
        .load_preset(comfy_table::presets::NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .add_row(vec![Cell::new("Cycles"), Cell::new(hub.cycle())])
        .add_row(vec![Cell::new("Bridge"), Cell::new(format!("{:?}", bridge.state()))])
        .add_row(vec![Cell::new("PC"), Cell::new(bridge.pc())])
        .add_row(vec![Cell::new("Executed"), Cell::new(bridge.executed())])
        .add_row(vec![
            Cell::new("Bus reads"),
            Cell::new(hub.axi_cmd_col().r_cnt()),
        ])
        .add_row(vec![
            Cell::new("Bus writes"),
            Cell::new(hub.axi_cmd_col().w_cnt()),
        ])
        .add_row(vec![
            Cell::new("Device writes"),
            Cell::new(device.writes().len()),
        ]);

    println!("{summary}");
    println!("{}", channel_table(&hub));
    println!("{}", semaphore_table(&hub)?);

    let mut errors = table(&["Reporter", "Kind", "Access", "Address", "Latched"]);
    errors.add_row(error_row("dHub", hub.errors()));
    errors.add_row(error_row("bridge", bridge.errors()));
    println!("{errors}");

    Ok(finished)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn demo_runs_to_completion() {
        let program = bcm::ins::assemble(include_str!("../../../demos/loopback.bcm")).unwrap();
        let config: ToolConfig = ron::from_str(include_str!("../../../demos/device.ron")).unwrap();
        assert!(run(&program, config, 10_000).unwrap());
    }
}
