mod config;
mod run;

use bcm::ins;
use clap::{Parser, Subcommand};
use eyre_pretty::{Context, Result, bail};
use std::{
    fmt::Write as _,
    path::{Path, PathBuf},
};

#[derive(Debug, Subcommand)]
enum Command {
    /// Assemble a bridge program
    ///
    /// One instruction per line, `#` starts a comment.
    Assemble {
        /// Path to the input .bcm file
        #[arg(short, long)]
        input: PathBuf,
        /// Path to the output binary image
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Disassemble a binary bridge program
    Disassemble {
        /// Path to the input binary image
        #[arg(short, long)]
        input: PathBuf,
    },
    /// Run a bridge program against a dHub model
    ///
    /// Supported inputs: .bcm, .bin
    Run {
        /// Path to the program
        #[arg(short, long)]
        input: PathBuf,
        /// Path to a RON device config
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Maximum number of cycles to run
        #[arg(long, default_value_t = 100_000)]
        cycles: u64,
    },
}

/// A CLI to assemble, inspect and run bridge programs against a dHub model.
#[derive(Parser, Debug)]
#[command(version)]
struct Args {
    /// Action to take
    #[command(subcommand)]
    command: Command,
}

fn setup_tracing() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or(EnvFilter::new("dhubtool=info,dhub=info,bcm=info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

fn read_program(input: &Path) -> Result<Vec<u64>> {
    let extension = input.extension().and_then(|ext| ext.to_str());
    if extension == Some("bcm") {
        let text = std::fs::read_to_string(input).context("reading program")?;
        return Ok(ins::assemble(&text)?);
    }

    let image = std::fs::read(input).context("reading program")?;
    if image.len() % 8 != 0 {
        bail!(
            "program image of {} bytes is not a whole number of words",
            image.len()
        );
    }

    Ok(ins::words(&image))
}

fn listing(words: &[u64]) -> String {
    let (decoded, error) = ins::disassemble(words);
    let mut out = String::new();
    for (pc, ins) in decoded {
        let len = ins.opcode().words();
        let raw = words[pc..pc + len]
            .iter()
            .map(|w| format!("{w:016X}"))
            .collect::<Vec<_>>()
            .join(" ");

        let _ = writeln!(out, "{pc:04X}  {raw:<33}  {ins}");
    }

    if let Some((pc, e)) = error {
        let _ = writeln!(out, "{pc:04X}  {:<33}  <{e}>", format!("{:016X}", words[pc]));
    }

    out
}

fn main() -> Result<()> {
    eyre_pretty::install()?;
    setup_tracing();

    let args = Args::parse();
    match args.command {
        Command::Assemble { input, output } => {
            let program = read_program(&input)?;
            std::fs::write(&output, ins::bytes(&program)).context("writing output file")?;
            tracing::info!("assembled {} words", program.len());

            Ok(())
        }
        Command::Disassemble { input } => {
            let program = read_program(&input)?;
            print!("{}", listing(&program));

            Ok(())
        }
        Command::Run {
            input,
            config,
            cycles,
        } => {
            let program = read_program(&input)?;
            let config = match config {
                Some(path) => config::ToolConfig::open(&path)?,
                None => config::ToolConfig::default(),
            };

            run::run(&program, config, cycles)?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn listing_shows_words_and_text() {
        let words = ins::assemble("sema pupd=3\ncfgw addr=0x10 data=0x1").unwrap();
        let text = listing(&words);
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("0000  0000000000000036"));
        assert!(lines[0].ends_with("sema pupd=3 pchk=0 cupd=0 cchk=0"));
        assert!(lines[1].starts_with("0001  0000000000000000 0000000100000010"));
        assert!(lines[1].ends_with("cfgw addr=0x10 data=0x1"));
    }

    #[test]
    fn listing_marks_bad_words() {
        let text = listing(&[0xF, 0x7]);
        assert!(text.lines().nth(1).unwrap().contains("unknown opcode"));
    }
}
