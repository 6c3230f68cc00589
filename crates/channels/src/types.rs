//! Value types exchanged between the gateway core and channel adapters.

use {
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
    switchboard_common::unix_now,
};

pub use switchboard_config::Severity;

/// Lifecycle state of one channel account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelAccountState {
    Disabled,
    Unconfigured,
    #[default]
    Stopped,
    Starting,
    Running,
    Error,
}

impl ChannelAccountState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::Unconfigured => "unconfigured",
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error => "error",
        }
    }

    /// A gateway-start call is outstanding.
    #[must_use]
    pub fn is_live(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl std::fmt::Display for ChannelAccountState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Derive the consolidated state from enablement, configuration
/// completeness and the last live state.
///
/// Live states (`starting`, `running`, `error`) survive as long as the
/// account stays enabled and configured; everything else settles on
/// `stopped`.
#[must_use]
pub fn derive_account_state(
    enabled: bool,
    configured: bool,
    live: Option<ChannelAccountState>,
) -> ChannelAccountState {
    if !enabled {
        return ChannelAccountState::Disabled;
    }
    if !configured {
        return ChannelAccountState::Unconfigured;
    }
    match live {
        Some(
            state @ (ChannelAccountState::Starting
            | ChannelAccountState::Running
            | ChannelAccountState::Error),
        ) => state,
        _ => ChannelAccountState::Stopped,
    }
}

/// Who the bot is on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfIdentity {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Runtime status of one account.
///
/// Readers receive it behind an `Arc`; writers build a new value and
/// replace the old one, so a reader never observes a half-applied update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelAccountSnapshot {
    pub channel: String,
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub state: ChannelAccountState,
    pub enabled: bool,
    pub configured: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connected: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_identity: Option<SelfIdentity>,
    #[serde(default)]
    pub summary: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_start_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stop_at: Option<i64>,
    pub updated_at: i64,
}

impl ChannelAccountSnapshot {
    #[must_use]
    pub fn new(channel: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            account_id: account_id.into(),
            name: None,
            state: ChannelAccountState::Stopped,
            enabled: true,
            configured: true,
            connected: None,
            self_identity: None,
            summary: Map::new(),
            last_error: None,
            last_start_at: None,
            last_stop_at: None,
            updated_at: unix_now(),
        }
    }

    /// Copy with a new state, stamped now.
    #[must_use]
    pub fn with_state(&self, state: ChannelAccountState) -> Self {
        let mut next = self.clone();
        next.state = state;
        next.updated_at = unix_now();
        next
    }
}

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectoryEntryKind {
    User,
    Group,
    Channel,
}

/// A resolved peer or group identity. Never persisted by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDirectoryEntry {
    pub kind: DirectoryEntryKind,
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ChannelDirectoryEntry {
    #[must_use]
    pub fn new(kind: DirectoryEntryKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            name: None,
            handle: None,
            metadata: Map::new(),
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// One account's merged configuration as seen by its channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedAccount {
    pub channel: String,
    pub account_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub enabled: bool,
    /// Channel-specific settings; top-level channel keys merged under the
    /// account's own overrides.
    pub config: Value,
}

/// How a channel physically sends outbound content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// The adapter calls the backend API itself.
    Direct,
    /// Content is routed through the generic gateway path.
    Gateway,
    /// Both are available.
    Hybrid,
}

/// Which built-in chunker a channel wants for long text.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkMode {
    #[default]
    Text,
    Markdown,
}

/// Provider acknowledgement for one physical send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReceipt {
    pub channel: String,
    pub message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub meta: Map<String, Value>,
}

impl DeliveryReceipt {
    #[must_use]
    pub fn new(channel: impl Into<String>, message_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            message_id: message_id.into(),
            chat_id: None,
            meta: Map::new(),
        }
    }
}

/// One line of the health report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusIssue {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub label: String,
    pub detail: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
}

impl StatusIssue {
    #[must_use]
    pub fn new(
        channel: impl Into<String>,
        severity: Severity,
        label: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            account_id: None,
            label: label.into(),
            detail: detail.into(),
            severity,
            fix: None,
        }
    }

    #[must_use]
    pub fn for_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    #[must_use]
    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    use super::ChannelAccountState::*;

    #[rstest]
    #[case(false, true, Some(Running), Disabled)]
    #[case(true, false, Some(Running), Unconfigured)]
    #[case(true, true, None, Stopped)]
    #[case(true, true, Some(Disabled), Stopped)]
    #[case(true, true, Some(Starting), Starting)]
    #[case(true, true, Some(Running), Running)]
    #[case(true, true, Some(Error), Error)]
    fn state_derivation(
        #[case] enabled: bool,
        #[case] configured: bool,
        #[case] live: Option<ChannelAccountState>,
        #[case] expected: ChannelAccountState,
    ) {
        assert_eq!(derive_account_state(enabled, configured, live), expected);
    }

    #[test]
    fn snapshot_serializes_camel_case() {
        let mut snap = ChannelAccountSnapshot::new("telegram", "default");
        snap.last_error = Some("token revoked".into());
        snap.state = Error;
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["state"], "error");
        assert_eq!(json["accountId"], "default");
        assert_eq!(json["lastError"], "token revoked");
        assert!(json["summary"].as_object().unwrap().is_empty());
    }

    #[test]
    fn with_state_leaves_original_untouched() {
        let snap = ChannelAccountSnapshot::new("slack", "work");
        let next = snap.with_state(Running);
        assert_eq!(snap.state, Stopped);
        assert_eq!(next.state, Running);
        assert_eq!(next.account_id, "work");
    }
}
