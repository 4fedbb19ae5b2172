use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::cli::config::LoaderArgs;
use crate::cli::console::ConsoleObserver;
use crate::core::{
    audit::{AuditLog, JsonTrace, Observers},
    executor::{RunOutcome, Script, ScriptExecutor},
    parser::{classify_line, normalize, ScriptLine},
    reader::{CardLink, PcscLink, ProtocolPreference},
    utils::format_hex_spaced,
};

#[derive(Parser)]
#[command(name = "pcsc-script-loader")]
#[command(about = "Script-driven APDU loader for PCSC smart card readers")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List available PCSC readers
    List {
        /// Show detailed information about readers
        #[arg(short = 'l', long)]
        detailed: bool,
    },

    /// Run one or more scripts in order against a card
    Run {
        /// Reader index (use 'list' to see available readers)
        reader: usize,

        /// Script files, run in the order given
        #[arg(required = true)]
        scripts: Vec<PathBuf>,

        #[command(flatten)]
        loader: LoaderArgs,
    },

    /// Classify script lines without touching a reader
    Check {
        /// Script files to check
        #[arg(required = true)]
        scripts: Vec<PathBuf>,
    },
}

pub fn run_cli() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let log_level = if cli.debug {
        log::LevelFilter::Debug
    } else if cli.verbose {
        log::LevelFilter::Info
    } else {
        log::LevelFilter::Warn
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    match cli.command {
        Commands::List { detailed } => cmd_list(detailed),
        Commands::Run {
            reader,
            scripts,
            loader,
        } => cmd_run(reader, &scripts, &loader),
        Commands::Check { scripts } => cmd_check(&scripts),
    }
}

fn cmd_list(detailed: bool) -> Result<()> {
    let mut link = PcscLink::new(pcsc::ShareMode::Shared, ProtocolPreference::Any)
        .context("Failed to initialize PCSC")?;

    let readers = match link.list_readers() {
        Ok(readers) => readers,
        Err(e) => {
            println!("No PCSC readers found. ({e})");
            return Ok(());
        }
    };

    println!("Available PCSC readers:");
    for (i, reader_info) in readers.iter().enumerate() {
        if detailed {
            println!("  [{}] {}", i, reader_info.name);
            println!(
                "      Status: {}",
                if reader_info.has_card {
                    "Card present"
                } else {
                    "No card"
                }
            );
            if let Some(ref atr) = reader_info.atr {
                println!("      ATR: {}", format_hex_spaced(atr));
            }
        } else if let Some(ref atr) = reader_info.atr {
            println!(
                "  [{}] {} [CARD - ATR: {}]",
                i,
                reader_info.name,
                format_hex_spaced(atr)
            );
        } else {
            println!("  [{}] {}", i, reader_info.name);
        }
    }

    Ok(())
}

fn cmd_run(reader_index: usize, scripts: &[PathBuf], args: &LoaderArgs) -> Result<()> {
    let config = args.resolve()?;

    let mut link = PcscLink::new(config.share_mode.into(), config.protocol)
        .context("Failed to initialize PCSC")?;

    link.enumerate().context("Failed to list readers")?;
    link.select(reader_index)
        .with_context(|| format!("Failed to select reader {reader_index}"))?;
    let reader_name = link.selected_reader().unwrap_or_default();

    let connected = if config.wait_for_card {
        println!("Waiting for card in {reader_name}...");
        link.wait_for_card(config.wait_timeout(), config.new_card_only)
    } else {
        link.connect()
    };
    connected.with_context(|| format!("Failed to connect to reader: {reader_name}"))?;

    println!("Connected to reader: {reader_name}");

    let audit_log = AuditLog::open(&config.log_path)
        .with_context(|| format!("Failed to open audit log: {}", config.log_path.display()))?;

    let mut observers = Observers::new();
    observers.add(ConsoleObserver::new(config.confirm_mismatch));
    observers.add(audit_log);
    if let Some(trace_path) = &config.trace_path {
        let trace = JsonTrace::open(trace_path)
            .with_context(|| format!("Failed to open trace file: {}", trace_path.display()))?;
        observers.add(trace);
    }

    let reports = ScriptExecutor::new(&mut link).run_stages(scripts, &mut observers);
    link.disconnect();

    for report in &reports {
        match &report.outcome {
            RunOutcome::Completed => {}
            RunOutcome::Halted(mismatch) => {
                bail!("Script {} halted: {mismatch}", report.script)
            }
            RunOutcome::Fatal(error) => bail!("Script {} failed: {error}", report.script),
        }
    }

    println!("Script execution completed.");
    println!("Scripts loaded: {}", reports.len());
    Ok(())
}

fn cmd_check(scripts: &[PathBuf]) -> Result<()> {
    for path in scripts {
        let script = Script::load(path)?;
        let (mut commands, mut resets, mut invalid) = (0, 0, 0);

        println!("Checking script: {}", script.name());
        for (index, raw) in script.lines().iter().enumerate() {
            let line_number = index + 1;
            match classify_line(raw) {
                ScriptLine::Skip => {}
                ScriptLine::Reset => {
                    resets += 1;
                    println!("  Line {line_number}: RESET");
                }
                ScriptLine::Command(command) => {
                    commands += 1;
                    match &command.expected_sw {
                        Some(expected) => println!(
                            "  Line {line_number}: COMMAND {} (expect {expected})",
                            command.command_hex
                        ),
                        None => println!("  Line {line_number}: COMMAND {}", command.command_hex),
                    }
                }
                ScriptLine::Invalid(reason) => {
                    invalid += 1;
                    println!("  Line {line_number}: INVALID {} ({reason})", normalize(raw));
                }
            }
        }
        println!("Summary: {commands} commands, {resets} resets, {invalid} invalid");
        println!();
    }

    Ok(())
}
