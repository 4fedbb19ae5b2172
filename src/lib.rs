//! PCSC Script Loader - script-driven smart card personalization
//!
//! Reads APDU scripts, sends each command to a card over PCSC, checks the
//! returned status words against the `SW` expectations in the script, and
//! records every step to an audit log.

pub mod cli;
pub mod core;

// Re-export commonly used types
pub use crate::core::{
    audit::{AuditLog, ExecutionStep, JsonTrace, LineObserver, Mismatch, Observers, RunObserver, StepKind},
    error::{FatalError, LinkError},
    executor::{RunOutcome, RunReport, Script, ScriptExecutor},
    parser::{classify_line, ParsedCommand, ScriptLine},
    reader::{CardLink, PcscLink, TransportSession},
    verifier::verify,
};
