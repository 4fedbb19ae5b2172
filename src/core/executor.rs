use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::core::audit::{ExecutionStep, Mismatch, RunObserver, StepKind};
use crate::core::error::FatalError;
use crate::core::parser::{classify_line, normalize, ParsedCommand, ScriptLine};
use crate::core::reader::CardLink;
use crate::core::utils::format_hex;
use crate::core::verifier::verify;

/// A loaded script, one entry per line of the source file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Script {
    name: String,
    lines: Vec<String>,
}

impl Script {
    /// Read a script file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FatalError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| FatalError::ScriptIo {
            path: path.to_path_buf(),
            source,
        })?;

        Ok(Self::from_text(path.display().to_string(), &text))
    }

    pub fn from_text(name: impl Into<String>, text: &str) -> Self {
        Self {
            name: name.into(),
            lines: text.lines().map(str::to_string).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }
}

/// How a run ended
#[derive(Debug)]
pub enum RunOutcome {
    /// Every line was processed
    Completed,
    /// A status word did not match its expectation
    Halted(Mismatch),
    /// The run was aborted by an I/O or transport failure
    Fatal(FatalError),
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RunOutcome::Completed => "completed",
            RunOutcome::Halted(_) => "halted",
            RunOutcome::Fatal(_) => "fatal",
        }
    }
}

/// Summary of one script run
#[derive(Debug)]
pub struct RunReport {
    pub script: String,
    pub outcome: RunOutcome,
    pub steps: usize,
    pub transmissions: usize,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn summary_line(&self) -> String {
        format!(
            "Script({}) Took {:.4} seconds",
            self.script,
            self.elapsed.as_secs_f64()
        )
    }
}

enum RunState {
    Running,
    Done,
    Halted(Mismatch),
    Fatal(FatalError),
}

#[derive(Default)]
struct Counters {
    steps: usize,
    transmissions: usize,
}

/// Runs scripts line by line against a card link.
///
/// Steps are pushed to the observer as they happen; nothing is retained
/// between runs.
pub struct ScriptExecutor<'a, L: CardLink + ?Sized> {
    link: &'a mut L,
}

impl<'a, L: CardLink + ?Sized> ScriptExecutor<'a, L> {
    pub fn new(link: &'a mut L) -> Self {
        Self { link }
    }

    /// Load and run a script file.
    ///
    /// An unreadable file is reported as a fatal run with no steps.
    pub fn run_file(&mut self, path: impl AsRef<Path>, observer: &mut dyn RunObserver) -> RunReport {
        let started = Instant::now();
        let path = path.as_ref();

        match Script::load(path) {
            Ok(script) => self.run(&script, observer),
            Err(error) => {
                log::error!("{error}");
                let name = path.display().to_string();
                if let Err(e) = observer.on_start(&name) {
                    log::error!("Failed to record run start: {e}");
                }
                finish(
                    name,
                    RunOutcome::Fatal(error),
                    Counters::default(),
                    started,
                    observer,
                )
            }
        }
    }

    /// Run scripts in order, stopping after the first one that does not complete
    pub fn run_stages(
        &mut self,
        paths: &[PathBuf],
        observer: &mut dyn RunObserver,
    ) -> Vec<RunReport> {
        let mut reports = Vec::with_capacity(paths.len());

        for path in paths {
            let report = self.run_file(path, observer);
            let completed = report.outcome.is_completed();
            reports.push(report);
            if !completed {
                break;
            }
        }

        reports
    }

    /// Run one script from its first line
    pub fn run(&mut self, script: &Script, observer: &mut dyn RunObserver) -> RunReport {
        let started = Instant::now();
        let mut counters = Counters::default();
        let mut lines = script.lines().iter().enumerate();

        log::info!("Running script: {}", script.name());

        let mut state = match observer.on_start(script.name()) {
            Ok(()) => RunState::Running,
            Err(e) => RunState::Fatal(FatalError::Audit(e)),
        };

        let outcome = loop {
            state = match state {
                RunState::Running => match lines.next() {
                    None => RunState::Done,
                    Some((index, raw)) => {
                        match self.process_line(index + 1, raw, observer, &mut counters) {
                            Ok(None) => RunState::Running,
                            Ok(Some(mismatch)) => RunState::Halted(mismatch),
                            Err(error) => RunState::Fatal(error),
                        }
                    }
                },
                RunState::Done => break RunOutcome::Completed,
                RunState::Halted(mismatch) => break RunOutcome::Halted(mismatch),
                RunState::Fatal(error) => break RunOutcome::Fatal(error),
            };
        };

        finish(script.name().to_string(), outcome, counters, started, observer)
    }

    /// Process one line; `Some` means the script must stop here
    fn process_line(
        &mut self,
        line_number: usize,
        raw: &str,
        observer: &mut dyn RunObserver,
        counters: &mut Counters,
    ) -> Result<Option<Mismatch>, FatalError> {
        let started = Instant::now();
        let line = normalize(raw);
        let line = line.as_str();

        let step = match classify_line(raw) {
            ScriptLine::Skip => return Ok(None),
            ScriptLine::Reset => self.reset(line_number, line, started),
            ScriptLine::Invalid(reason) => {
                log::warn!("Line {line_number} is invalid ({reason}): {line}");
                invalid_step(line_number, line, reason.to_string(), started)
            }
            ScriptLine::Command(command) => {
                return self.transmit(line_number, line, command, observer, counters, started)
            }
        };

        emit(observer, counters, &step)?;
        Ok(None)
    }

    fn reset(&mut self, line_number: usize, line: &str, started: Instant) -> ExecutionStep {
        log::info!("Resetting card");

        let (response_hex, note) = match self.link.reset().and_then(|()| self.link.atr()) {
            Ok(atr) => (Some(format_hex(&atr)), None),
            Err(e) => {
                log::warn!("Card reset failed on line {line_number}: {e}");
                (None, Some(e.to_string()))
            }
        };

        ExecutionStep {
            timestamp: Utc::now(),
            line_number,
            line: line.to_string(),
            kind: StepKind::Reset,
            command_hex: None,
            response_hex,
            status_word_hex: None,
            expected_sw: None,
            verified: None,
            note,
            elapsed: started.elapsed(),
        }
    }

    fn transmit(
        &mut self,
        line_number: usize,
        line: &str,
        command: ParsedCommand,
        observer: &mut dyn RunObserver,
        counters: &mut Counters,
        started: Instant,
    ) -> Result<Option<Mismatch>, FatalError> {
        let (response, sw) = self.link.transmit_raw(&command.apdu)?;
        counters.transmissions += 1;

        let status_word_hex = format_hex(&sw);
        let verified = command
            .expected_sw
            .as_deref()
            .map(|expected| verify(&status_word_hex, expected));

        let step = ExecutionStep {
            timestamp: Utc::now(),
            line_number,
            line: line.to_string(),
            kind: StepKind::Command,
            command_hex: Some(command.command_hex.clone()),
            response_hex: Some(format_hex(&response)),
            status_word_hex: Some(status_word_hex.clone()),
            expected_sw: command.expected_sw.clone(),
            verified,
            note: None,
            elapsed: started.elapsed(),
        };
        emit(observer, counters, &step)?;

        match (verified, command.expected_sw) {
            (Some(false), Some(expected)) => {
                let mismatch = Mismatch {
                    line_number,
                    command_hex: command.command_hex,
                    actual: status_word_hex,
                    expected,
                };
                log::error!("Status word mismatch on {mismatch}");
                observer.on_mismatch(&mismatch).map_err(FatalError::Audit)?;
                Ok(Some(mismatch))
            }
            _ => Ok(None),
        }
    }
}

fn invalid_step(line_number: usize, line: &str, note: String, started: Instant) -> ExecutionStep {
    ExecutionStep {
        timestamp: Utc::now(),
        line_number,
        line: line.to_string(),
        kind: StepKind::Invalid,
        command_hex: None,
        response_hex: None,
        status_word_hex: None,
        expected_sw: None,
        verified: None,
        note: Some(note),
        elapsed: started.elapsed(),
    }
}

fn emit(
    observer: &mut dyn RunObserver,
    counters: &mut Counters,
    step: &ExecutionStep,
) -> Result<(), FatalError> {
    counters.steps += 1;
    observer.on_step(step).map_err(FatalError::Audit)
}

fn finish(
    script: String,
    outcome: RunOutcome,
    counters: Counters,
    started: Instant,
    observer: &mut dyn RunObserver,
) -> RunReport {
    if let RunOutcome::Fatal(error) = &outcome {
        log::error!("Script {script} aborted: {error}");
        if let Err(e) = observer.on_fatal(error) {
            log::error!("Failed to record fatal error: {e}");
        }
    }

    let report = RunReport {
        script,
        outcome,
        steps: counters.steps,
        transmissions: counters.transmissions,
        elapsed: started.elapsed(),
    };

    if let Err(e) = observer.on_finish(&report) {
        log::error!("Failed to record run summary: {e}");
    }

    log::info!("{}", report.summary_line());
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::audit::LineObserver;
    use crate::core::error::LinkError;
    use crate::core::reader::TransportSession;
    use mockall::{mock, Sequence};

    mock! {
        Link {}

        impl CardLink for Link {
            fn enumerate(&mut self) -> Result<Vec<String>, LinkError>;
            fn select(&mut self, index: usize) -> Result<(), LinkError>;
            fn connect(&mut self) -> Result<(), LinkError>;
            fn disconnect(&mut self);
            fn reset(&mut self) -> Result<(), LinkError>;
            fn atr(&self) -> Result<Vec<u8>, LinkError>;
            fn transmit_raw(&mut self, apdu: &[u8]) -> Result<(Vec<u8>, [u8; 2]), LinkError>;
            fn wait_for_card(&mut self, timeout: Option<Duration>, new_card_only: bool) -> Result<(), LinkError>;
            fn session(&self) -> TransportSession;
        }
    }

    /// Collects steps and mismatches for inspection
    #[derive(Default)]
    struct Recorder {
        steps: Vec<ExecutionStep>,
        mismatches: Vec<Mismatch>,
        fatal: Vec<String>,
        starts: Vec<String>,
    }

    impl RunObserver for Recorder {
        fn on_start(&mut self, script: &str) -> std::io::Result<()> {
            self.starts.push(script.to_string());
            Ok(())
        }

        fn on_step(&mut self, step: &ExecutionStep) -> std::io::Result<()> {
            self.steps.push(step.clone());
            Ok(())
        }

        fn on_mismatch(&mut self, mismatch: &Mismatch) -> std::io::Result<()> {
            self.mismatches.push(mismatch.clone());
            Ok(())
        }

        fn on_fatal(&mut self, error: &FatalError) -> std::io::Result<()> {
            self.fatal.push(error.to_string());
            Ok(())
        }
    }

    fn run(link: &mut MockLink, text: &str) -> (RunReport, Recorder) {
        let mut recorder = Recorder::default();
        let script = Script::from_text("test.txt", text);
        let report = ScriptExecutor::new(link).run(&script, &mut recorder);
        (report, recorder)
    }

    #[test]
    fn test_matching_status_word_completes() {
        let mut link = MockLink::new();
        link.expect_transmit_raw()
            .withf(|apdu| hex::encode_upper(apdu) == "A0A40000023F00")
            .times(1)
            .returning(|_| Ok((Vec::new(), [0x90, 0x00])));

        let (report, recorder) = run(&mut link, "A0A40000023F00SW9000");

        assert!(report.outcome.is_completed());
        assert_eq!(report.steps, 1);
        assert_eq!(report.transmissions, 1);
        assert_eq!(recorder.steps[0].kind, StepKind::Command);
        assert_eq!(recorder.steps[0].verified, Some(true));
        assert_eq!(recorder.steps[0].response_hex.as_deref(), Some(""));
    }

    #[test]
    fn test_mismatch_halts_before_next_line() {
        let mut link = MockLink::new();
        link.expect_transmit_raw()
            .times(1)
            .returning(|_| Ok((Vec::new(), [0x6A, 0x82])));

        let (report, recorder) = run(&mut link, "A0A40000023F00SW9000\n00A4000002\n");

        match &report.outcome {
            RunOutcome::Halted(mismatch) => {
                assert_eq!(mismatch.actual, "6A82");
                assert_eq!(mismatch.expected, "9000");
                assert_eq!(mismatch.line_number, 1);
            }
            other => panic!("Expected halt, got {other:?}"),
        }
        assert_eq!(recorder.steps.len(), 1);
        assert_eq!(recorder.steps[0].verified, Some(false));
        assert_eq!(recorder.mismatches.len(), 1);
    }

    #[test]
    fn test_expectation_compared_case_insensitively() {
        let mut link = MockLink::new();
        link.expect_transmit_raw()
            .returning(|_| Ok((vec![0xde, 0xad], [0x6a, 0x82])));

        let (report, recorder) = run(&mut link, "00A4000002sw6a82");
        // lower-case marker is not a marker, so the line is invalid
        assert!(report.outcome.is_completed());
        assert_eq!(recorder.steps[0].kind, StepKind::Invalid);

        let (report, recorder) = run(&mut link, "00A4000002SW6a82");
        assert!(report.outcome.is_completed());
        assert_eq!(recorder.steps[0].verified, Some(true));
        assert_eq!(recorder.steps[0].response_hex.as_deref(), Some("DEAD"));
        assert_eq!(recorder.steps[0].status_word_hex.as_deref(), Some("6A82"));
    }

    #[test]
    fn test_no_expectation_always_continues() {
        let mut link = MockLink::new();
        link.expect_transmit_raw()
            .times(2)
            .returning(|_| Ok((Vec::new(), [0x6F, 0x00])));

        let (report, recorder) = run(&mut link, "00A4000002\n00B0000010\n");

        assert!(report.outcome.is_completed());
        assert_eq!(report.transmissions, 2);
        assert!(recorder.steps.iter().all(|s| s.verified.is_none()));
    }

    #[test]
    fn test_reset_then_command_in_order() {
        let mut link = MockLink::new();
        let mut seq = Sequence::new();
        link.expect_reset()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(()));
        link.expect_atr()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![0x3B, 0x9F, 0x96, 0x80]));
        link.expect_transmit_raw()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok((Vec::new(), [0x6A, 0x82])));

        let (report, recorder) = run(&mut link, "RESET\nA0A40000023F00\n");

        assert!(report.outcome.is_completed());
        assert_eq!(recorder.steps[0].kind, StepKind::Reset);
        assert_eq!(recorder.steps[0].response_hex.as_deref(), Some("3B9F9680"));
        assert_eq!(recorder.steps[1].kind, StepKind::Command);
    }

    #[test]
    fn test_failed_reset_does_not_halt() {
        let mut link = MockLink::new();
        link.expect_reset()
            .returning(|| Err(LinkError::NoCard("removed".to_string())));
        link.expect_atr().never();
        link.expect_transmit_raw()
            .times(1)
            .returning(|_| Ok((Vec::new(), [0x90, 0x00])));

        let (report, recorder) = run(&mut link, "rst\nA0A40000023F00SW9000");

        assert!(report.outcome.is_completed());
        assert_eq!(recorder.steps.len(), 2);
        assert!(recorder.steps[0].response_hex.is_none());
        assert_eq!(recorder.steps[0].note.as_deref(), Some("No card: removed"));
    }

    #[test]
    fn test_failed_atr_does_not_halt() {
        let mut link = MockLink::new();
        link.expect_reset().returning(|| Ok(()));
        link.expect_atr()
            .returning(|| Err(LinkError::Protocol("status unavailable".to_string())));

        let (report, recorder) = run(&mut link, "RESET\nRESET\n");

        assert!(report.outcome.is_completed());
        assert_eq!(recorder.steps.len(), 2);
    }

    #[test]
    fn test_invalid_and_comment_lines_never_transmit() {
        let mut link = MockLink::new();
        link.expect_transmit_raw().never();

        let (report, recorder) = run(
            &mut link,
            "# header\n\n// note\n/ note\nGARBAGE\nA0A4000\n00A40000ZZ\n",
        );

        assert!(report.outcome.is_completed());
        assert_eq!(report.transmissions, 0);
        assert_eq!(recorder.steps.len(), 3);
        assert!(recorder.steps.iter().all(|s| s.kind == StepKind::Invalid));
        assert_eq!(recorder.steps[0].line_number, 5);
    }

    #[test]
    fn test_transport_failure_is_fatal() {
        let mut link = MockLink::new();
        link.expect_transmit_raw()
            .times(1)
            .returning(|_| Err(LinkError::Protocol("card muted".to_string())));

        let (report, recorder) = run(&mut link, "A0A40000023F00\nA0A40000023F00\n");

        assert!(matches!(
            report.outcome,
            RunOutcome::Fatal(FatalError::Link(LinkError::Protocol(_)))
        ));
        assert!(recorder.steps.is_empty());
        assert_eq!(recorder.fatal, vec!["Protocol error: card muted"]);
    }

    #[test]
    fn test_missing_script_file_is_fatal_before_any_step() {
        let mut link = MockLink::new();
        link.expect_transmit_raw().never();
        let mut recorder = Recorder::default();

        let report = ScriptExecutor::new(&mut link)
            .run_file("does/not/exist.txt", &mut recorder);

        assert!(matches!(
            report.outcome,
            RunOutcome::Fatal(FatalError::ScriptIo { .. })
        ));
        assert_eq!(report.steps, 0);
        assert_eq!(recorder.starts, vec!["does/not/exist.txt"]);
        assert_eq!(recorder.fatal.len(), 1);
    }

    #[test]
    fn test_empty_expectation_halts_after_transmit() {
        let mut link = MockLink::new();
        link.expect_transmit_raw()
            .withf(|apdu| hex::encode_upper(apdu) == "A0A40000023F00")
            .times(1)
            .returning(|_| Ok((Vec::new(), [0x90, 0x00])));

        let (report, recorder) = run(&mut link, "A0A40000023F00SW
00A4000002
");

        match &report.outcome {
            RunOutcome::Halted(mismatch) => {
                assert_eq!(mismatch.actual, "9000");
                assert_eq!(mismatch.expected, "");
            }
            other => panic!("Expected halt, got {other:?}"),
        }
        assert_eq!(report.transmissions, 1);
        assert_eq!(recorder.steps.len(), 1);
        assert_eq!(recorder.steps[0].verified, Some(false));
    }

    #[test]
    fn test_recorded_lines_have_whitespace_stripped() {
        let mut link = MockLink::new();
        link.expect_reset().returning(|| Ok(()));
        link.expect_atr().returning(|| Ok(vec![0x3B, 0x00]));
        link.expect_transmit_raw().never();

        let (report, recorder) = run(&mut link, "  re set \nA0 A4 00 00 0\n");

        assert!(report.outcome.is_completed());
        assert_eq!(recorder.steps[0].line, "reset");
        assert_eq!(recorder.steps[1].kind, StepKind::Invalid);
        assert_eq!(recorder.steps[1].line, "A0A400000");
    }

    #[test]
    fn test_run_state_resets_between_runs() {
        let mut link = MockLink::new();
        let mut responses = vec![[0x90, 0x00], [0x6A, 0x82]];
        link.expect_transmit_raw()
            .times(2)
            .returning(move |_| Ok((Vec::new(), responses.pop().unwrap_or([0x90, 0x00]))));

        let (first, _) = run(&mut link, "A0A40000023F00SW9000\nA0A40000023F00SW9000");
        assert!(matches!(first.outcome, RunOutcome::Halted(_)));

        let (second, recorder) = run(&mut link, "A0A40000023F00SW9000");
        assert!(second.outcome.is_completed());
        assert_eq!(recorder.steps.len(), 1);
    }

    #[test]
    fn test_display_lines_follow_script_order() {
        let mut link = MockLink::new();
        link.expect_reset().returning(|| Ok(()));
        link.expect_atr().returning(|| Ok(vec![0x3B, 0x00]));
        link.expect_transmit_raw()
            .withf(|apdu| hex::encode_upper(apdu) == "A0A40000023F00")
            .returning(|_| Ok((Vec::new(), [0x90, 0x00])));

        let mut lines = Vec::new();
        {
            let mut observer = LineObserver::new(|line: &str| lines.push(line.to_string()));
            let script = Script::from_text("order.txt", "RESET\nA0A40000023F00SW9000\nXX\n");
            ScriptExecutor::new(&mut link).run(&script, &mut observer);
        }

        assert_eq!(
            &lines[..8],
            &[
                "CMD: RESET",
                "ATR: 3B 00",
                "",
                "CMD: A0A40000023F00",
                "RES: []",
                "SW: 9000 Expected: 9000",
                "",
                "CMD: XX [INVALID]",
            ]
        );
        assert!(lines.last().unwrap().contains("order.txt Loaded"));
    }
}
