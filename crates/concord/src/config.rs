// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::bus::fallback::DEFAULT_SIGNAL_KEY;
use crate::bus::{NativeSource, TransportOptions};
use crate::error::validate_name;
use crate::session::DEFAULT_SESSION_KEY;
use crate::store::SignalStore;

/// Which transports the agent may use.
///
/// - `Auto`: NATS when `--nats-url` is set, otherwise (or if it is
///   unreachable) the directory-store fallback.
/// - `Native`: NATS only; the bus is disabled if it cannot connect.
/// - `Fallback`: directory-store signals only.
/// - `None`: no bus. Session commands still update storage.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    #[default]
    Auto,
    Native,
    Fallback,
    None,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Native => f.write_str("native"),
            Self::Fallback => f.write_str("fallback"),
            Self::None => f.write_str("none"),
        }
    }
}

impl std::str::FromStr for TransportMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "native" => Ok(Self::Native),
            "fallback" => Ok(Self::Fallback),
            "none" => Ok(Self::None),
            other => anyhow::bail!("invalid transport: {other}"),
        }
    }
}

/// Cross-agent session and round coordination.
#[derive(Debug, Parser)]
#[command(name = "concord", version, about)]
pub struct Config {
    #[command(flatten)]
    pub agent: AgentConfig,

    /// Log format (json or text).
    #[arg(long, env = "CONCORD_LOG_FORMAT", default_value = "json", global = true)]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "CONCORD_LOG_LEVEL", default_value = "info", global = true)]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Args)]
pub struct AgentConfig {
    /// Transport selection (auto, native, fallback, none).
    #[arg(long, env = "CONCORD_TRANSPORT", default_value = "auto", global = true)]
    pub transport: String,

    /// NATS server URL for the native transport.
    #[arg(long, env = "CONCORD_NATS_URL", global = true)]
    pub nats_url: Option<String>,

    /// NATS auth token.
    #[arg(long, env = "CONCORD_NATS_TOKEN", global = true)]
    pub nats_token: Option<String>,

    /// NATS subject carrying every envelope.
    #[arg(long, env = "CONCORD_SUBJECT", default_value = "concord.bus", global = true)]
    pub subject: String,

    /// NATS connect timeout in milliseconds.
    #[arg(long, env = "CONCORD_CONNECT_TIMEOUT_MS", default_value = "2000", global = true)]
    pub connect_timeout_ms: u64,

    /// Directory holding durable keys and the fallback change journal.
    #[arg(long, env = "CONCORD_STORE_DIR", default_value = ".concord", global = true)]
    pub store_dir: PathBuf,

    /// Directory holding round lock files [default: <store-dir>/locks].
    #[arg(long, env = "CONCORD_LOCK_DIR", global = true)]
    pub lock_dir: Option<PathBuf>,

    /// Store key used as the fallback signal.
    #[arg(long, env = "CONCORD_SIGNAL_KEY", default_value = DEFAULT_SIGNAL_KEY, global = true)]
    pub signal_key: String,

    /// Store key holding the session token.
    #[arg(long, env = "CONCORD_SESSION_KEY", default_value = DEFAULT_SESSION_KEY, global = true)]
    pub session_key: String,

    /// Directory store poll interval in milliseconds.
    #[arg(long, env = "CONCORD_POLL_MS", default_value = "250", global = true)]
    pub poll_ms: u64,

    /// How long change-journal entries (and the values in them) are kept.
    #[arg(long, env = "CONCORD_JOURNAL_RETENTION_MS", default_value = "5000", global = true)]
    pub journal_retention_ms: u64,

    /// How long a follower waits for the leader's snapshot (unset = forever).
    #[arg(long, env = "CONCORD_ROUND_DEADLINE_MS", global = true)]
    pub round_deadline_ms: Option<u64>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Store a session token and tell the other agents.
    Login {
        token: String,
    },
    /// Clear the session token and tell the other agents.
    Logout {
        #[arg(long, default_value = "user")]
        reason: String,
    },
    /// Run a long-lived agent that applies broadcasts and optionally leads rounds.
    Watch(WatchArgs),
}

#[derive(Debug, Clone, Args)]
pub struct WatchArgs {
    /// Trigger a round at this interval in milliseconds.
    #[arg(long, env = "CONCORD_ROUND_EVERY_MS")]
    pub round_every_ms: Option<u64>,

    /// Lock name shared by every agent taking part in the round.
    #[arg(long, env = "CONCORD_ROUND_NAME", default_value = "sync")]
    pub round_name: String,

    /// Command the leader runs; its trimmed stdout is the new entry (after --).
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        self.agent.validate()?;

        if let Command::Watch(ref watch) = self.command {
            watch.validate()?;
        }
        Ok(())
    }
}

impl AgentConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        let mode = self.transport_mode()?;
        if mode == TransportMode::Native && self.nats_url.is_none() {
            anyhow::bail!("--transport native requires --nats-url");
        }
        if self.poll_ms == 0 {
            anyhow::bail!("--poll-ms must be greater than zero");
        }
        if self.journal_retention_ms < self.poll_ms {
            anyhow::bail!("--journal-retention-ms must be at least --poll-ms");
        }
        validate_name(&self.signal_key)?;
        validate_name(&self.session_key)?;
        Ok(())
    }

    pub fn transport_mode(&self) -> anyhow::Result<TransportMode> {
        self.transport.parse()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms)
    }

    pub fn journal_retention(&self) -> Duration {
        Duration::from_millis(self.journal_retention_ms)
    }

    pub fn round_deadline(&self) -> Option<Duration> {
        self.round_deadline_ms.map(Duration::from_millis)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir.clone().unwrap_or_else(|| self.store_dir.join("locks"))
    }

    /// Transport inputs for this mode, with `store` as the fallback carrier.
    pub fn transport_options(&self, store: Arc<dyn SignalStore>) -> anyhow::Result<TransportOptions> {
        let mode = self.transport_mode()?;
        let mut options = TransportOptions::new().signal_key(self.signal_key.clone());

        if matches!(mode, TransportMode::Auto | TransportMode::Native) {
            if let Some(ref url) = self.nats_url {
                options = options.native(NativeSource::Nats {
                    url: url.clone(),
                    token: self.nats_token.clone(),
                    subject: self.subject.clone(),
                    connect_timeout: self.connect_timeout(),
                });
            }
        }
        if matches!(mode, TransportMode::Auto | TransportMode::Fallback) {
            options = options.fallback(store);
        }
        Ok(options)
    }
}

impl WatchArgs {
    pub fn validate(&self) -> anyhow::Result<()> {
        match (self.round_every_ms, self.command.is_empty()) {
            (Some(0), _) => anyhow::bail!("--round-every-ms must be greater than zero"),
            (Some(_), true) => anyhow::bail!("--round-every-ms requires a command"),
            (None, false) => anyhow::bail!("a round command requires --round-every-ms"),
            _ => {}
        }
        validate_name(&self.round_name)?;
        Ok(())
    }

    pub fn round_every(&self) -> Option<Duration> {
        self.round_every_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
