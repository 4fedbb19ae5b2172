use anyhow::{Context, Result};
use clap::Args;
use pcsc::ShareMode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::reader::ProtocolPreference;

pub const DEFAULT_LOG_PATH: &str = "logs.txt";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareModeArg {
    #[default]
    Shared,
    Exclusive,
    Direct,
}

impl std::str::FromStr for ShareModeArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "shared" => Ok(ShareModeArg::Shared),
            "exclusive" => Ok(ShareModeArg::Exclusive),
            "direct" => Ok(ShareModeArg::Direct),
            _ => Err(format!("Invalid share mode: {s}")),
        }
    }
}

impl From<ShareModeArg> for ShareMode {
    fn from(mode: ShareModeArg) -> Self {
        match mode {
            ShareModeArg::Shared => ShareMode::Shared,
            ShareModeArg::Exclusive => ShareMode::Exclusive,
            ShareModeArg::Direct => ShareMode::Direct,
        }
    }
}

/// Settings for a loader run.
///
/// Values come from an optional JSON file; command-line flags win.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub log_path: PathBuf,
    pub share_mode: ShareModeArg,
    pub protocol: ProtocolPreference,
    pub wait_for_card: bool,
    /// Seconds to wait for a card; absent means no limit
    pub wait_timeout_secs: Option<u64>,
    pub new_card_only: bool,
    pub confirm_mismatch: bool,
    pub trace_path: Option<PathBuf>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from(DEFAULT_LOG_PATH),
            share_mode: ShareModeArg::default(),
            protocol: ProtocolPreference::default(),
            wait_for_card: false,
            wait_timeout_secs: None,
            new_card_only: false,
            confirm_mismatch: false,
            trace_path: None,
        }
    }
}

impl LoaderConfig {
    /// Read a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to open config file: {}", path.display()))?;

        serde_json::from_str(&text)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    pub fn wait_timeout(&self) -> Option<Duration> {
        self.wait_timeout_secs.map(Duration::from_secs)
    }
}

/// Flags shared by commands that talk to a reader
#[derive(Args, Debug, Clone, Default)]
pub struct LoaderArgs {
    /// JSON config file providing defaults
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Audit log file (appended)
    #[arg(long)]
    pub log: Option<PathBuf>,

    /// Connection share mode
    #[arg(short, long)]
    pub mode: Option<ShareModeArg>,

    /// Card protocol (t0, t1, any)
    #[arg(short, long)]
    pub protocol: Option<ProtocolPreference>,

    /// Wait for a card to be inserted instead of connecting directly
    #[arg(short, long)]
    pub wait: bool,

    /// Seconds to wait for a card
    #[arg(long)]
    pub wait_timeout: Option<u64>,

    /// Only accept a newly inserted card when waiting
    #[arg(long)]
    pub new_card_only: bool,

    /// Block on a status word mismatch until Enter is pressed
    #[arg(long)]
    pub confirm_mismatch: bool,

    /// Also write a JSON-lines trace of every step
    #[arg(long)]
    pub trace: Option<PathBuf>,
}

impl LoaderArgs {
    /// Build the effective config: defaults, then the config file, then flags
    pub fn resolve(&self) -> Result<LoaderConfig> {
        let mut config = match &self.config {
            Some(path) => LoaderConfig::load(path)?,
            None => LoaderConfig::default(),
        };

        if let Some(log) = &self.log {
            config.log_path = log.clone();
        }
        if let Some(mode) = self.mode {
            config.share_mode = mode;
        }
        if let Some(protocol) = self.protocol {
            config.protocol = protocol;
        }
        if self.wait || self.wait_timeout.is_some() {
            config.wait_for_card = true;
        }
        if let Some(secs) = self.wait_timeout {
            config.wait_timeout_secs = Some(secs);
        }
        config.new_card_only |= self.new_card_only;
        config.confirm_mismatch |= self.confirm_mismatch;
        if let Some(trace) = &self.trace {
            config.trace_path = Some(trace.clone());
        }

        log::debug!("Effective config: {config:?}");
        Ok(config)
    }
}
