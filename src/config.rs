//! Process configuration: CLI parsing plus a `serde_json5`-loaded file.
//!
//! Covers the tunable negotiation/session timeouts, the per-process session
//! cap, and the logging level.

use clap::Parser;
use serde::Deserialize;
use std::{fs::read_to_string, time::Duration};

fn secs(v: u64) -> Duration {
    Duration::from_secs(v)
}

/// OOB negotiation stage deadlines (spec §5 timeout table).
#[derive(Deserialize, Debug, Clone, Copy)]
pub struct NegotiationTimeouts {
    #[serde(default = "NegotiationTimeouts::capability_secs")]
    pub capability_secs: u64,
    #[serde(default = "NegotiationTimeouts::configuration_secs")]
    pub configuration_secs: u64,
    #[serde(default = "NegotiationTimeouts::start_secs")]
    pub start_secs: u64,
}

impl NegotiationTimeouts {
    fn capability_secs() -> u64 {
        5
    }

    fn configuration_secs() -> u64 {
        5
    }

    fn start_secs() -> u64 {
        10
    }

    pub fn to_engine(self) -> engine::negotiation::NegotiationTimeouts {
        engine::negotiation::NegotiationTimeouts {
            capability: secs(self.capability_secs),
            configuration: secs(self.configuration_secs),
            start: secs(self.start_secs),
        }
    }
}

impl Default for NegotiationTimeouts {
    fn default() -> Self {
        Self {
            capability_secs: Self::capability_secs(),
            configuration_secs: Self::configuration_secs(),
            start_secs: Self::start_secs(),
        }
    }
}

/// Session-level timeouts (spec §5): OOB disconnect-before-closed,
/// stop-drain, adapter no-data, and fusion drift.
#[derive(Deserialize, Debug, Clone, Copy)]
pub struct SessionTimeoutsConfig {
    #[serde(default)]
    pub negotiation: NegotiationTimeouts,
    #[serde(default = "SessionTimeoutsConfig::oob_disconnect_secs")]
    pub oob_disconnect_secs: u64,
    #[serde(default = "SessionTimeoutsConfig::stop_drain_secs")]
    pub stop_drain_secs: u64,
    #[serde(default = "SessionTimeoutsConfig::adapter_no_data_secs")]
    pub adapter_no_data_secs: u64,
    #[serde(default = "SessionTimeoutsConfig::fusion_drift_secs")]
    pub fusion_drift_secs: u64,
}

impl SessionTimeoutsConfig {
    fn oob_disconnect_secs() -> u64 {
        30
    }

    fn stop_drain_secs() -> u64 {
        3
    }

    fn adapter_no_data_secs() -> u64 {
        2
    }

    fn fusion_drift_secs() -> u64 {
        5
    }

    pub fn to_engine(self) -> engine::SessionTimeouts {
        engine::SessionTimeouts {
            negotiation: self.negotiation.to_engine(),
            oob_disconnect: secs(self.oob_disconnect_secs),
            stop_drain: secs(self.stop_drain_secs),
            adapter_no_data: secs(self.adapter_no_data_secs),
            fusion_drift: secs(self.fusion_drift_secs),
        }
    }
}

impl Default for SessionTimeoutsConfig {
    fn default() -> Self {
        Self {
            negotiation: NegotiationTimeouts::default(),
            oob_disconnect_secs: Self::oob_disconnect_secs(),
            stop_drain_secs: Self::stop_drain_secs(),
            adapter_no_data_secs: Self::adapter_no_data_secs(),
            fusion_drift_secs: Self::fusion_drift_secs(),
        }
    }
}

/// Process-wide limits (spec §4.1).
#[derive(Deserialize, Debug, Clone, Copy)]
pub struct Limits {
    /// Per-process cap on live sessions; exceeding it fails
    /// `create_session` with `ResourceExhausted`.
    #[serde(default = "Limits::max_sessions")]
    pub max_sessions: usize,
}

impl Limits {
    fn max_sessions() -> usize {
        256
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self { max_sessions: Self::max_sessions() }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default)]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct Log {
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default)]
pub struct Config {
    #[serde(default)]
    pub timeouts: SessionTimeoutsConfig,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub log: Log,
}

#[derive(Parser)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
    author = env!("CARGO_PKG_AUTHORS")
)]
struct Cli {
    /// Path to a json5 configuration file; defaults are used for anything
    /// it omits (or if no path is given at all).
    #[arg(long)]
    config: Option<String>,
}

impl Config {
    /// Parses CLI args, reads the configuration file if `--config` was
    /// given, and falls back to field defaults for anything absent.
    pub fn load() -> anyhow::Result<Self> {
        let cfg_str = match Cli::parse().config {
            Some(path) => read_to_string(path)?,
            None => String::new(),
        };

        if cfg_str.trim().is_empty() {
            return Ok(Self::default());
        }

        Ok(serde_json5::from_str(&cfg_str)?)
    }
}
