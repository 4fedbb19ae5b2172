use std::io::{self, BufRead, Write};

use crate::core::{
    audit::{fatal_line, loaded_banner, ExecutionStep, Mismatch, RunObserver},
    error::FatalError,
    executor::RunReport,
    utils::describe_status_hex,
};

/// Prints run progress to the terminal as it happens
pub struct ConsoleObserver {
    confirm_mismatch: bool,
}

impl ConsoleObserver {
    pub fn new(confirm_mismatch: bool) -> Self {
        Self { confirm_mismatch }
    }
}

impl RunObserver for ConsoleObserver {
    fn on_start(&mut self, script: &str) -> io::Result<()> {
        println!("Executing script: {script}");
        println!();
        Ok(())
    }

    fn on_step(&mut self, step: &ExecutionStep) -> io::Result<()> {
        let mut stdout = io::stdout().lock();
        for line in step.display_lines() {
            writeln!(stdout, "{line}")?;
        }
        stdout.flush()
    }

    fn on_mismatch(&mut self, mismatch: &Mismatch) -> io::Result<()> {
        eprintln!("{}", mismatch.message());
        if let Some(description) = describe_status_hex(&mismatch.actual) {
            eprintln!("  {}: {description}", mismatch.actual);
        }
        eprintln!("  Script stopped at line {}", mismatch.line_number);

        if self.confirm_mismatch {
            eprint!("Press Enter to acknowledge...");
            io::stderr().flush()?;
            let mut input = String::new();
            io::stdin().lock().read_line(&mut input)?;
        }
        Ok(())
    }

    fn on_fatal(&mut self, error: &FatalError) -> io::Result<()> {
        eprintln!("{}", fatal_line(error));
        Ok(())
    }

    fn on_finish(&mut self, report: &RunReport) -> io::Result<()> {
        println!("{}", report.summary_line());
        if report.outcome.is_completed() {
            println!("{}", loaded_banner(&report.script));
        }
        println!();
        Ok(())
    }
}
