//! Script line classification.
//!
//! A script line is one of: a comment or blank line (skipped), a reset
//! directive, an APDU command with an optional `SW<status>` expectation, or
//! an invalid line that is reported but never transmitted.

use serde::Serialize;

/// Marker separating the command bytes from the expected status word
pub const EXPECTATION_MARKER: &str = "SW";

/// Shortest accepted command: CLA INS P1 P2 plus one length byte
pub const MIN_COMMAND_DIGITS: usize = 10;

/// A command line split into its APDU and optional expected status word
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParsedCommand {
    pub command_hex: String,
    pub expected_sw: Option<String>,
    pub is_valid: bool,
    /// Decoded command bytes, empty when the line is invalid
    #[serde(skip)]
    pub apdu: Vec<u8>,
}

impl ParsedCommand {
    /// Whether the line carried an `SW` expectation
    pub fn has_expectation(&self) -> bool {
        self.expected_sw.is_some()
    }
}

/// Why a line could not be used as a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InvalidReason {
    OddLength,
    IllegalCharacter,
    TooShort,
}

impl std::fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            InvalidReason::OddLength => "odd number of hex digits",
            InvalidReason::IllegalCharacter => "illegal character",
            InvalidReason::TooShort => "command shorter than 5 bytes",
        };
        f.write_str(text)
    }
}

/// Classification of one script line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptLine {
    /// Comment or blank line, produces no step
    Skip,
    /// `RESET` / `RST` directive
    Reset,
    Command(ParsedCommand),
    Invalid(InvalidReason),
}

/// Strip every whitespace character from a raw line
pub fn normalize(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Classify a raw script line.
///
/// Comments win over directives, and directives win over command parsing.
pub fn classify_line(raw: &str) -> ScriptLine {
    let line = normalize(raw);

    if line.is_empty() || is_comment(&line) {
        return ScriptLine::Skip;
    }

    if is_reset(&line) {
        return ScriptLine::Reset;
    }

    match validate(&line) {
        Ok(()) => ScriptLine::Command(parse_command(&line)),
        Err(reason) => ScriptLine::Invalid(reason),
    }
}

/// Split a normalized command line at the first `SW` marker.
///
/// `is_valid` reflects [`validate`]; an invalid line still reports its split.
pub fn parse_command(line: &str) -> ParsedCommand {
    let (command_hex, expected_sw) = match line.find(EXPECTATION_MARKER) {
        Some(at) => (
            &line[..at],
            Some(line[at + EXPECTATION_MARKER.len()..].to_string()),
        ),
        None => (line, None),
    };

    let is_valid = validate(line).is_ok();
    let apdu = match hex::decode(command_hex) {
        Ok(bytes) if is_valid => bytes,
        _ => Vec::new(),
    };

    ParsedCommand {
        command_hex: command_hex.to_string(),
        expected_sw,
        is_valid,
        apdu,
    }
}

/// Check a normalized command line against the command grammar
pub fn validate(line: &str) -> Result<(), InvalidReason> {
    if line.len() % 2 != 0 {
        return Err(InvalidReason::OddLength);
    }

    if !line.chars().all(is_script_char) {
        return Err(InvalidReason::IllegalCharacter);
    }

    let command = match line.find(EXPECTATION_MARKER) {
        Some(at) => &line[..at],
        None => line,
    };

    // S and W are only legal as the marker itself or after it
    if !command.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(InvalidReason::IllegalCharacter);
    }

    if command.len() % 2 != 0 {
        return Err(InvalidReason::OddLength);
    }

    if command.len() < MIN_COMMAND_DIGITS {
        return Err(InvalidReason::TooShort);
    }

    Ok(())
}

fn is_script_char(c: char) -> bool {
    c.is_ascii_hexdigit() || c == 'S' || c == 'W'
}

fn is_comment(line: &str) -> bool {
    line.starts_with('#') || line.starts_with("//") || line.starts_with('/')
}

fn is_reset(line: &str) -> bool {
    let folded = line.to_lowercase();
    folded == "reset" || folded == "rst"
}
