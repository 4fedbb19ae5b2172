//! Step records and the sinks that receive them.
//!
//! The executor pushes every event to a [`RunObserver`] as it happens. The
//! audit log, the JSON trace and any display are observers.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::Duration;

use crate::core::error::FatalError;
use crate::core::executor::{RunOutcome, RunReport};
use crate::core::utils::format_hex_spaced;

const BANNER_RULE: &str = "#======================================================#";
const BANNER_START: &str = "#=========================START========================#";

/// What a recorded step did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StepKind {
    Command,
    Reset,
    Invalid,
}

/// Outcome of one non-skipped script line
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStep {
    pub timestamp: DateTime<Utc>,
    pub line_number: usize,
    pub line: String,
    pub kind: StepKind,
    /// Command portion sent to the card, commands only
    pub command_hex: Option<String>,
    /// Response body for commands, ATR for resets
    pub response_hex: Option<String>,
    pub status_word_hex: Option<String>,
    pub expected_sw: Option<String>,
    /// `None` when the line carried no expectation
    pub verified: Option<bool>,
    /// Failed reset cause or invalid-line reason
    pub note: Option<String>,
    pub elapsed: Duration,
}

impl ExecutionStep {
    /// The display lines for this step, ending with a blank separator
    pub fn display_lines(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(4);

        match self.kind {
            StepKind::Command => {
                let command = self.command_hex.as_deref().unwrap_or(&self.line);
                let sw = self.status_word_hex.as_deref().unwrap_or_default();
                lines.push(format!("CMD: {command}"));
                lines.push(format!(
                    "RES: [{}]",
                    self.response_hex.as_deref().unwrap_or_default()
                ));
                lines.push(match &self.expected_sw {
                    Some(expected) => format!("SW: {sw} Expected: {expected}"),
                    None => format!("SW: {sw}"),
                });
            }
            StepKind::Reset => {
                lines.push(format!("CMD: {}", self.line));
                lines.push(match &self.response_hex {
                    Some(atr) => format!(
                        "ATR: {}",
                        hex::decode(atr)
                            .map(|bytes| format_hex_spaced(&bytes))
                            .unwrap_or_else(|_| atr.clone())
                    ),
                    None => format!(
                        "ATR: unavailable ({})",
                        self.note.as_deref().unwrap_or("reset failed")
                    ),
                });
            }
            StepKind::Invalid => {
                lines.push(format!("CMD: {} [INVALID]", self.line));
            }
        }

        lines.push(String::new());
        lines
    }
}

/// A status word that did not match the script's expectation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Mismatch {
    pub line_number: usize,
    pub command_hex: String,
    pub actual: String,
    pub expected: String,
}

impl Mismatch {
    pub fn message(&self) -> String {
        format!("ERROR ! Response: {} Expected: {}", self.actual, self.expected)
    }
}

impl std::fmt::Display for Mismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "line {}: {} returned {}, expected {}",
            self.line_number, self.command_hex, self.actual, self.expected
        )
    }
}

/// Receiver of run events, called in script order.
///
/// A returned error aborts the run as fatal.
pub trait RunObserver {
    fn on_start(&mut self, _script: &str) -> io::Result<()> {
        Ok(())
    }

    fn on_step(&mut self, step: &ExecutionStep) -> io::Result<()>;

    /// Called right after the mismatching step, before the run stops
    fn on_mismatch(&mut self, _mismatch: &Mismatch) -> io::Result<()> {
        Ok(())
    }

    fn on_fatal(&mut self, _error: &FatalError) -> io::Result<()> {
        Ok(())
    }

    fn on_finish(&mut self, _report: &RunReport) -> io::Result<()> {
        Ok(())
    }
}

pub fn fatal_line(error: &FatalError) -> String {
    format!("ERROR: {error}")
}

/// Banner written after a script that ran to the end
pub fn loaded_banner(script: &str) -> String {
    format!("#========================= {script} Loaded =========================#")
}

/// Append-only text log of every run
pub struct AuditLog<W: Write> {
    out: W,
}

impl AuditLog<File> {
    /// Open `path` for appending, creating it if needed
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(file))
    }
}

impl<W: Write> AuditLog<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: Write> RunObserver for AuditLog<W> {
    fn on_start(&mut self, script: &str) -> io::Result<()> {
        writeln!(self.out, "{BANNER_RULE}")?;
        writeln!(self.out, "{BANNER_START}")?;
        writeln!(self.out, "{BANNER_RULE}")?;
        writeln!(self.out, "# Script: {script}")?;
        self.out.flush()
    }

    fn on_step(&mut self, step: &ExecutionStep) -> io::Result<()> {
        for line in step.display_lines() {
            writeln!(self.out, "{line}")?;
        }
        self.out.flush()
    }

    fn on_mismatch(&mut self, mismatch: &Mismatch) -> io::Result<()> {
        writeln!(self.out, "{}", mismatch.message())?;
        writeln!(self.out)?;
        self.out.flush()
    }

    fn on_fatal(&mut self, error: &FatalError) -> io::Result<()> {
        writeln!(self.out, "{}", fatal_line(error))?;
        self.out.flush()
    }

    fn on_finish(&mut self, report: &RunReport) -> io::Result<()> {
        writeln!(self.out, "{}", report.summary_line())?;
        if report.outcome.is_completed() {
            writeln!(self.out, "{}", loaded_banner(&report.script))?;
        }
        writeln!(self.out)?;
        self.out.flush()
    }
}

/// Pushes display lines to a callback, one line at a time
pub struct LineObserver<F: FnMut(&str)> {
    emit: F,
}

impl<F: FnMut(&str)> LineObserver<F> {
    pub fn new(emit: F) -> Self {
        Self { emit }
    }
}

impl<F: FnMut(&str)> RunObserver for LineObserver<F> {
    fn on_step(&mut self, step: &ExecutionStep) -> io::Result<()> {
        for line in step.display_lines() {
            (self.emit)(&line);
        }
        Ok(())
    }

    fn on_mismatch(&mut self, mismatch: &Mismatch) -> io::Result<()> {
        (self.emit)(&mismatch.message());
        Ok(())
    }

    fn on_fatal(&mut self, error: &FatalError) -> io::Result<()> {
        (self.emit)(&fatal_line(error));
        Ok(())
    }

    fn on_finish(&mut self, report: &RunReport) -> io::Result<()> {
        (self.emit)(&report.summary_line());
        if report.outcome.is_completed() {
            (self.emit)(&loaded_banner(&report.script));
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct TraceSummary<'a> {
    script: &'a str,
    outcome: &'a str,
    detail: Option<String>,
    steps: usize,
    transmissions: usize,
    elapsed: Duration,
}

/// JSON-lines trace: one object per step, then one summary object per run
pub struct JsonTrace<W: Write> {
    out: W,
}

impl JsonTrace<File> {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(file))
    }
}

impl<W: Write> JsonTrace<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    fn write_record<T: Serialize>(&mut self, record: &T) -> io::Result<()> {
        serde_json::to_writer(&mut self.out, record)?;
        writeln!(self.out)?;
        self.out.flush()
    }
}

impl<W: Write> RunObserver for JsonTrace<W> {
    fn on_step(&mut self, step: &ExecutionStep) -> io::Result<()> {
        self.write_record(step)
    }

    fn on_finish(&mut self, report: &RunReport) -> io::Result<()> {
        let detail = match &report.outcome {
            RunOutcome::Completed => None,
            RunOutcome::Halted(mismatch) => Some(mismatch.to_string()),
            RunOutcome::Fatal(error) => Some(error.to_string()),
        };

        self.write_record(&TraceSummary {
            script: &report.script,
            outcome: report.outcome.label(),
            detail,
            steps: report.steps,
            transmissions: report.transmissions,
            elapsed: report.elapsed,
        })
    }
}

/// Fans one event stream out to several observers in registration order
#[derive(Default)]
pub struct Observers<'a> {
    sinks: Vec<Box<dyn RunObserver + 'a>>,
}

impl<'a> Observers<'a> {
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    pub fn add(&mut self, observer: impl RunObserver + 'a) -> &mut Self {
        self.sinks.push(Box::new(observer));
        self
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Deliver to every sink, returning the first failure
    fn deliver(
        &mut self,
        mut event: impl FnMut(&mut dyn RunObserver) -> io::Result<()>,
    ) -> io::Result<()> {
        let mut first_error = None;
        for sink in &mut self.sinks {
            if let Err(e) = event(sink.as_mut()) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl RunObserver for Observers<'_> {
    fn on_start(&mut self, script: &str) -> io::Result<()> {
        self.deliver(|sink| sink.on_start(script))
    }

    fn on_step(&mut self, step: &ExecutionStep) -> io::Result<()> {
        self.deliver(|sink| sink.on_step(step))
    }

    fn on_mismatch(&mut self, mismatch: &Mismatch) -> io::Result<()> {
        self.deliver(|sink| sink.on_mismatch(mismatch))
    }

    fn on_fatal(&mut self, error: &FatalError) -> io::Result<()> {
        self.deliver(|sink| sink.on_fatal(error))
    }

    fn on_finish(&mut self, report: &RunReport) -> io::Result<()> {
        self.deliver(|sink| sink.on_finish(report))
    }
}
