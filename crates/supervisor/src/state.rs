use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What observers see of the gateway child.
///
/// Serialized as `{kind, port, logsDir, token, url?, details?}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum GatewayState {
    #[serde(rename_all = "camelCase")]
    Starting {
        port: u16,
        logs_dir: PathBuf,
        token: String,
    },
    #[serde(rename_all = "camelCase")]
    Ready {
        port: u16,
        logs_dir: PathBuf,
        url: String,
        token: String,
    },
    #[serde(rename_all = "camelCase")]
    Failed {
        port: u16,
        logs_dir: PathBuf,
        details: String,
        token: String,
    },
}

impl GatewayState {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Starting { .. } => "starting",
            Self::Ready { .. } => "ready",
            Self::Failed { .. } => "failed",
        }
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        match self {
            Self::Starting { port, .. } | Self::Ready { port, .. } | Self::Failed { port, .. } => {
                *port
            },
        }
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }
}

/// Lifecycle phase of the supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Idle,
    Spawning,
    Running,
    Stopping,
}
