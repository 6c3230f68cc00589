//! Config schema types for the gateway host.

use std::{collections::BTreeMap, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// Default gateway port.
pub const DEFAULT_PORT: u16 = 18790;

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    pub server: ServerConfig,
    pub supervisor: SupervisorSettings,
    pub gateway: GatewaySettings,
    /// Per-channel sections keyed by channel id (`telegram`, `slack`, …).
    ///
    /// The shape inside a section belongs to the channel plugin. The only
    /// convention the core relies on is `enabled` and an optional
    /// `accounts.<accountId>` map whose entries inherit top-level keys.
    pub channels: BTreeMap<String, serde_json::Value>,
}

impl SwitchboardConfig {
    /// Raw section for a channel, if configured.
    #[must_use]
    pub fn channel_section(&self, channel_id: &str) -> Option<&serde_json::Value> {
        self.channels.get(channel_id)
    }
}

/// Where the gateway listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// `0` asks the supervisor to allocate a free port at spawn time.
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: DEFAULT_PORT,
        }
    }
}

/// Knobs for the process supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Gateway binary. Bare names are looked up on `PATH`; unset means the
    /// current executable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,
    /// Arguments passed to the gateway binary.
    pub args: Vec<String>,
    /// Extra environment for the child.
    pub env: BTreeMap<String, String>,
    /// How long to wait for the gateway port to accept connections.
    /// Unset picks a platform default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub startup_timeout_ms: Option<u64>,
    /// Graceful termination window before the process tree is killed.
    pub stop_grace_ms: u64,
    /// How long to confirm death after a tree kill.
    pub kill_confirm_ms: u64,
    /// How long orphan recovery waits for a killed orphan to disappear.
    pub orphan_confirm_ms: u64,
    /// Interval between liveness checks while waiting.
    pub poll_interval_ms: u64,
    /// Characters of child stderr kept for diagnostics.
    pub tail_capacity: usize,
    /// Stop the child when it fails to become ready.
    pub kill_on_startup_failure: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            binary: None,
            args: vec!["gateway".into(), "run".into()],
            env: BTreeMap::new(),
            startup_timeout_ms: None,
            stop_grace_ms: 5_000,
            kill_confirm_ms: 2_000,
            orphan_confirm_ms: 1_500,
            poll_interval_ms: 100,
            tail_capacity: 8_192,
            kill_on_startup_failure: true,
        }
    }
}

impl SupervisorSettings {
    /// Startup timeout, longer on Windows where fresh processes are slow to
    /// come up after hibernation and antivirus scanning.
    #[must_use]
    pub fn startup_timeout(&self) -> Duration {
        let default_ms = if cfg!(windows) {
            60_000
        } else {
            15_000
        };
        Duration::from_millis(self.startup_timeout_ms.unwrap_or(default_ms))
    }

    #[must_use]
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    #[must_use]
    pub fn kill_confirm(&self) -> Duration {
        Duration::from_millis(self.kill_confirm_ms)
    }

    #[must_use]
    pub fn orphan_confirm(&self) -> Duration {
        Duration::from_millis(self.orphan_confirm_ms)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// Knobs for the in-process gateway (account lifecycle, probes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// How long a stopping account may take before its task is aborted.
    pub account_stop_grace_ms: u64,
    /// How long a start waits for the adapter before treating a still
    /// running `start_account` as a serving account.
    pub account_start_settle_ms: u64,
    /// Default timeout for status probes.
    pub probe_timeout_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            account_stop_grace_ms: 5_000,
            account_start_settle_ms: 2_000,
            probe_timeout_ms: 10_000,
        }
    }
}

impl GatewaySettings {
    #[must_use]
    pub fn account_stop_grace(&self) -> Duration {
        Duration::from_millis(self.account_stop_grace_ms)
    }

    #[must_use]
    pub fn account_start_settle(&self) -> Duration {
        Duration::from_millis(self.account_start_settle_ms)
    }

    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }
}
