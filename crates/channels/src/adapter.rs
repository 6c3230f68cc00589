//! Capability groups a channel plugin may implement.
//!
//! Each group is its own trait. A plugin holds an `Option<Arc<dyn _>>` per
//! group, so a backend implements exactly the subset it supports and the
//! caller branches on presence before every call. Optional methods inside a
//! group default to [`Error::Unsupported`] or a neutral value.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    serde_json::{Map, Value},
    switchboard_common::{
        types::{ChatType, MediaAttachment, PollPayload},
        unix_now,
    },
    switchboard_config::SwitchboardConfig,
    tokio::sync::watch,
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use crate::{
    Error, Result, config_section, gating,
    gating::DmPolicy,
    types::{
        ChannelAccountSnapshot, ChannelAccountState, ChannelDirectoryEntry, ChunkMode,
        DeliveryMode, DeliveryReceipt, DirectoryEntryKind, ResolvedAccount, StatusIssue,
        derive_account_state,
    },
};

// ── Setup ───────────────────────────────────────────────────────────────────

/// Input collected by an onboarding flow for one account.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSetupInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub use_env: bool,
    /// Channel-specific fields.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Account onboarding: id assignment, naming and config merging.
///
/// `apply_*` methods return the channel's updated config section; the
/// caller decides whether to persist it.
pub trait ChannelSetupAdapter: Send + Sync {
    fn resolve_account_id(&self, _cfg: &SwitchboardConfig, input_id: Option<&str>) -> String {
        config_section::normalize_account_id(input_id)
    }

    fn apply_account_name(
        &self,
        cfg: &SwitchboardConfig,
        account_id: &str,
        name: &str,
    ) -> Result<Value>;

    fn apply_account_config(
        &self,
        cfg: &SwitchboardConfig,
        account_id: &str,
        input: &ChannelSetupInput,
    ) -> Result<Value>;

    /// Returns a human-readable rejection, or `None` when the input is usable.
    fn validate_input(
        &self,
        _cfg: &SwitchboardConfig,
        _account_id: &str,
        _input: &ChannelSetupInput,
    ) -> Option<String> {
        None
    }
}

// ── Config ──────────────────────────────────────────────────────────────────

/// Per-account config resolution.
#[async_trait]
pub trait ChannelConfigAdapter: Send + Sync {
    fn list_account_ids(&self, cfg: &SwitchboardConfig) -> Vec<String>;

    fn default_account_id(&self, cfg: &SwitchboardConfig) -> String {
        self.list_account_ids(cfg)
            .into_iter()
            .next()
            .unwrap_or_else(|| config_section::DEFAULT_ACCOUNT_ID.to_string())
    }

    fn resolve_account(&self, cfg: &SwitchboardConfig, account_id: &str)
    -> Result<ResolvedAccount>;

    fn is_enabled(&self, account: &ResolvedAccount, _cfg: &SwitchboardConfig) -> bool {
        account.enabled
    }

    /// May touch the filesystem or environment (credential files).
    async fn is_configured(
        &self,
        account: &ResolvedAccount,
        cfg: &SwitchboardConfig,
    ) -> Result<bool>;

    fn describe_account(&self, account: &ResolvedAccount) -> Map<String, Value> {
        let mut out = Map::new();
        out.insert("accountId".into(), Value::String(account.account_id.clone()));
        if let Some(name) = &account.name {
            out.insert("name".into(), Value::String(name.clone()));
        }
        out.insert("enabled".into(), Value::Bool(account.enabled));
        out
    }

    fn resolve_allow_from(&self, account: &ResolvedAccount) -> Vec<String> {
        config_section::allow_from(&account.config)
    }

    fn format_allow_from(&self, entries: &[String]) -> Vec<String> {
        gating::normalize_allow_from(entries)
    }
}

// ── Group ───────────────────────────────────────────────────────────────────

/// The group conversation a decision is made for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupContext {
    pub account_id: String,
    pub group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_name: Option<String>,
    #[serde(default)]
    pub chat_type: ChatType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_id: Option<String>,
}

/// Tool allow/deny override for one group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupToolPolicy {
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub deny: Vec<String>,
}

pub trait ChannelGroupAdapter: Send + Sync {
    fn resolve_require_mention(&self, _cfg: &SwitchboardConfig, _ctx: &GroupContext) -> Option<bool> {
        None
    }

    fn resolve_group_intro_hint(
        &self,
        _cfg: &SwitchboardConfig,
        _ctx: &GroupContext,
    ) -> Option<String> {
        None
    }

    fn resolve_tool_policy(
        &self,
        _cfg: &SwitchboardConfig,
        _ctx: &GroupContext,
    ) -> Option<GroupToolPolicy> {
        None
    }
}

// ── Outbound ────────────────────────────────────────────────────────────────

/// Fallback chunk size when a channel does not declare one.
pub const DEFAULT_TEXT_CHUNK_LIMIT: usize = 4000;

/// Everything a send call needs besides the content.
#[derive(Debug, Clone)]
pub struct OutboundContext {
    pub cfg: Arc<SwitchboardConfig>,
    pub account: ResolvedAccount,
    /// Resolved destination.
    pub to: String,
    pub reply_to_id: Option<String>,
    pub thread_id: Option<String>,
    pub silent: bool,
}

impl OutboundContext {
    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.account.account_id
    }
}

/// Send messages to a channel.
#[async_trait]
pub trait ChannelOutboundAdapter: Send + Sync {
    fn delivery_mode(&self) -> DeliveryMode;

    /// Max characters per physical text message. `0` disables chunking.
    fn text_chunk_limit(&self) -> usize {
        DEFAULT_TEXT_CHUNK_LIMIT
    }

    fn chunk_mode(&self) -> ChunkMode {
        ChunkMode::Text
    }

    /// Channel-specific chunker. `None` selects the generic one for
    /// [`Self::chunk_mode`].
    fn chunk_text(&self, _text: &str, _limit: usize) -> Option<Vec<String>> {
        None
    }

    /// Max poll options. `None` means polls are not limited by the channel.
    fn poll_max_options(&self) -> Option<usize> {
        None
    }

    /// Map a logical destination onto a concrete one.
    fn resolve_target(
        &self,
        to: Option<&str>,
        allow_from: &[String],
        _account_id: &str,
    ) -> Result<String> {
        gating::resolve_target(to, allow_from)
    }

    async fn send_text(&self, ctx: &OutboundContext, text: &str) -> Result<DeliveryReceipt>;

    async fn send_media(
        &self,
        _ctx: &OutboundContext,
        _caption: Option<&str>,
        _media: &MediaAttachment,
    ) -> Result<DeliveryReceipt> {
        Err(Error::unsupported("send_media"))
    }

    async fn send_poll(&self, _ctx: &OutboundContext, _poll: &PollPayload) -> Result<DeliveryReceipt> {
        Err(Error::unsupported("send_poll"))
    }
}

// ── Status ──────────────────────────────────────────────────────────────────

/// Outcome of a live reachability probe.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub ok: bool,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl ProbeResult {
    #[must_use]
    pub fn ok(elapsed_ms: u64) -> Self {
        Self {
            ok: true,
            elapsed_ms,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn failed(elapsed_ms: u64, detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            elapsed_ms,
            detail: Some(detail.into()),
            data: Map::new(),
        }
    }
}

/// Health and status reporting.
#[async_trait]
pub trait ChannelStatusAdapter: Send + Sync {
    fn build_account_summary(
        &self,
        _account: &ResolvedAccount,
        _snapshot: &ChannelAccountSnapshot,
    ) -> Map<String, Value> {
        Map::new()
    }

    /// Probe the backend. Implementations should respect `timeout`; the
    /// caller enforces it as well.
    async fn probe_account(
        &self,
        _cfg: &SwitchboardConfig,
        _account: &ResolvedAccount,
        _timeout: Duration,
    ) -> Result<ProbeResult> {
        Err(Error::unsupported("probe_account"))
    }

    /// Deeper security/config consistency checks.
    async fn audit_account(
        &self,
        _cfg: &SwitchboardConfig,
        _account: &ResolvedAccount,
        _timeout: Duration,
    ) -> Result<Vec<StatusIssue>> {
        Err(Error::unsupported("audit_account"))
    }

    fn resolve_account_state(
        &self,
        enabled: bool,
        configured: bool,
        snapshot: Option<&ChannelAccountSnapshot>,
    ) -> ChannelAccountState {
        derive_account_state(enabled, configured, snapshot.map(|s| s.state))
    }

    fn collect_status_issues(&self, _snapshots: &[Arc<ChannelAccountSnapshot>]) -> Vec<StatusIssue> {
        Vec::new()
    }
}

// ── Gateway ─────────────────────────────────────────────────────────────────

/// Shared, replace-only view of one account's status.
///
/// Readers get an `Arc` to an immutable snapshot. Writers always install a
/// fresh value; the previous snapshot stays valid for anyone holding it.
#[derive(Debug, Clone)]
pub struct AccountStatusHandle {
    tx: Arc<watch::Sender<Arc<ChannelAccountSnapshot>>>,
}

impl AccountStatusHandle {
    #[must_use]
    pub fn new(initial: ChannelAccountSnapshot) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx: Arc::new(tx) }
    }

    #[must_use]
    pub fn get(&self) -> Arc<ChannelAccountSnapshot> {
        Arc::clone(&self.tx.borrow())
    }

    /// Replace the snapshot.
    pub fn set(&self, mut snapshot: ChannelAccountSnapshot) {
        snapshot.updated_at = unix_now();
        self.tx.send_replace(Arc::new(snapshot));
    }

    /// Build the next snapshot from the current one and install it.
    ///
    /// The read-modify-replace runs under the channel's write lock, so
    /// concurrent updates never drop each other.
    pub fn update(&self, f: impl FnOnce(&mut ChannelAccountSnapshot)) -> Arc<ChannelAccountSnapshot> {
        let mut installed = None;
        self.tx.send_modify(|current| {
            let mut next = ChannelAccountSnapshot::clone(&**current);
            f(&mut next);
            next.updated_at = unix_now();
            let next = Arc::new(next);
            installed = Some(Arc::clone(&next));
            *current = next;
        });
        installed.unwrap_or_else(|| self.get())
    }

    /// Install the snapshot `f` derives from the current one, if any.
    ///
    /// Runs under the same lock as [`Self::update`]; returns whether a new
    /// snapshot was installed.
    pub fn replace_if(
        &self,
        f: impl FnOnce(&ChannelAccountSnapshot) -> Option<ChannelAccountSnapshot>,
    ) -> bool {
        self.tx.send_if_modified(|current| match f(current) {
            Some(mut next) => {
                next.updated_at = unix_now();
                *current = Arc::new(next);
                true
            },
            None => false,
        })
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<ChannelAccountSnapshot>> {
        self.tx.subscribe()
    }
}

/// Log sink handed to adapters so their messages carry account context.
pub trait ChannelLogSink: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
    fn debug(&self, _message: &str) {}
}

/// [`ChannelLogSink`] that forwards to `tracing`.
#[derive(Debug, Clone)]
pub struct TracingLogSink {
    channel: String,
    account_id: String,
}

impl TracingLogSink {
    #[must_use]
    pub fn new(channel: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            account_id: account_id.into(),
        }
    }
}

impl ChannelLogSink for TracingLogSink {
    fn info(&self, message: &str) {
        info!(channel = %self.channel, account_id = %self.account_id, "{message}");
    }

    fn warn(&self, message: &str) {
        warn!(channel = %self.channel, account_id = %self.account_id, "{message}");
    }

    fn error(&self, message: &str) {
        error!(channel = %self.channel, account_id = %self.account_id, "{message}");
    }

    fn debug(&self, message: &str) {
        debug!(channel = %self.channel, account_id = %self.account_id, "{message}");
    }
}

/// Context passed to [`ChannelGatewayAdapter::start_account`].
#[derive(Clone)]
pub struct GatewayContext {
    pub cfg: Arc<SwitchboardConfig>,
    pub account: ResolvedAccount,
    /// Fires when the account is being stopped. Long-running work spawned by
    /// the adapter must observe it.
    pub cancel: CancellationToken,
    pub status: AccountStatusHandle,
    pub log: Option<Arc<dyn ChannelLogSink>>,
}

impl GatewayContext {
    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.account.account_id
    }

    /// Report a runtime failure after start: the account moves to `error`
    /// and its cancellation token fires.
    pub fn fail(&self, err: impl std::fmt::Display) {
        let message = err.to_string();
        if let Some(log) = &self.log {
            log.error(&message);
        }
        self.status.update(|snap| {
            snap.state = ChannelAccountState::Error;
            snap.connected = Some(false);
            snap.last_error = Some(message);
        });
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for GatewayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayContext")
            .field("account", &self.account)
            .field("cancelled", &self.cancel.is_cancelled())
            .field("log", &self.log.is_some())
            .finish_non_exhaustive()
    }
}

/// First step of a device-pairing login.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrLoginStart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qr_data_url: Option<String>,
    pub message: String,
}

/// Result of waiting for a device-pairing login to complete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QrLoginWait {
    pub connected: bool,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogoutResult {
    /// Local credentials were removed.
    pub cleared: bool,
    /// The backend session was invalidated.
    pub logged_out: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Account connection lifecycle.
#[async_trait]
pub trait ChannelGatewayAdapter: Send + Sync {
    /// Connect the account. Returns once it is up; background work must be
    /// tied to `ctx.cancel`.
    async fn start_account(&self, ctx: GatewayContext) -> Result<()>;

    /// Called after the cancellation token fired.
    async fn stop_account(&self, _ctx: GatewayContext) -> Result<()> {
        Ok(())
    }

    async fn login_with_qr_start(
        &self,
        _cfg: &SwitchboardConfig,
        _account_id: &str,
        _force: bool,
        _timeout: Duration,
    ) -> Result<QrLoginStart> {
        Err(Error::unsupported("login_with_qr_start"))
    }

    async fn login_with_qr_wait(
        &self,
        _cfg: &SwitchboardConfig,
        _account_id: &str,
        _timeout: Duration,
    ) -> Result<QrLoginWait> {
        Err(Error::unsupported("login_with_qr_wait"))
    }

    async fn logout_account(
        &self,
        _cfg: &SwitchboardConfig,
        _account: &ResolvedAccount,
    ) -> Result<LogoutResult> {
        Err(Error::unsupported("logout_account"))
    }
}

// ── Auth ────────────────────────────────────────────────────────────────────

#[async_trait]
pub trait ChannelAuthAdapter: Send + Sync {
    /// Run the interactive login flow.
    async fn login(&self, cfg: &SwitchboardConfig, account_id: Option<&str>, verbose: bool)
    -> Result<()>;
}

// ── Heartbeat ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatReadiness {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecipients {
    pub recipients: Vec<String>,
    /// Where the list came from (`flag`, `allowFrom`, `all`, …).
    pub source: String,
}

/// Scheduled check-in support.
#[async_trait]
pub trait ChannelHeartbeatAdapter: Send + Sync {
    async fn check_ready(
        &self,
        cfg: &SwitchboardConfig,
        account_id: &str,
    ) -> Result<HeartbeatReadiness>;

    fn resolve_recipients(
        &self,
        cfg: &SwitchboardConfig,
        account_id: &str,
        to: Option<&str>,
        all: bool,
    ) -> HeartbeatRecipients;
}

// ── Directory / Resolver ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryQuery {
    pub account_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Required by group member listing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
}

impl DirectoryQuery {
    #[must_use]
    pub fn for_account(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            ..Default::default()
        }
    }
}

/// Peer and group lookup. The `_live` variants query the backend; the
/// others may answer from config or a cache.
#[async_trait]
pub trait ChannelDirectoryAdapter: Send + Sync {
    async fn self_entry(
        &self,
        _cfg: &SwitchboardConfig,
        _account_id: &str,
    ) -> Result<Option<ChannelDirectoryEntry>> {
        Err(Error::unsupported("self_entry"))
    }

    async fn list_peers(
        &self,
        _cfg: &SwitchboardConfig,
        _query: &DirectoryQuery,
    ) -> Result<Vec<ChannelDirectoryEntry>> {
        Err(Error::unsupported("list_peers"))
    }

    async fn list_peers_live(
        &self,
        _cfg: &SwitchboardConfig,
        _query: &DirectoryQuery,
    ) -> Result<Vec<ChannelDirectoryEntry>> {
        Err(Error::unsupported("list_peers_live"))
    }

    async fn list_groups(
        &self,
        _cfg: &SwitchboardConfig,
        _query: &DirectoryQuery,
    ) -> Result<Vec<ChannelDirectoryEntry>> {
        Err(Error::unsupported("list_groups"))
    }

    async fn list_groups_live(
        &self,
        _cfg: &SwitchboardConfig,
        _query: &DirectoryQuery,
    ) -> Result<Vec<ChannelDirectoryEntry>> {
        Err(Error::unsupported("list_groups_live"))
    }

    async fn list_group_members(
        &self,
        _cfg: &SwitchboardConfig,
        _query: &DirectoryQuery,
    ) -> Result<Vec<ChannelDirectoryEntry>> {
        Err(Error::unsupported("list_group_members"))
    }
}

/// Result of resolving one free-text input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedTarget {
    pub input: String,
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ResolvedTarget {
    #[must_use]
    pub fn unresolved(input: impl Into<String>, note: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            resolved: false,
            id: None,
            name: None,
            note: Some(note.into()),
        }
    }
}

#[async_trait]
pub trait ChannelResolverAdapter: Send + Sync {
    async fn resolve_targets(
        &self,
        cfg: &SwitchboardConfig,
        account_id: &str,
        inputs: &[String],
        kind: DirectoryEntryKind,
    ) -> Result<Vec<ResolvedTarget>>;
}

// ── Elevated / Command / Security / Pairing ─────────────────────────────────

pub trait ChannelElevatedAdapter: Send + Sync {
    /// Allow-list used for privileged commands when none is configured.
    fn allow_from_fallback(&self, cfg: &SwitchboardConfig, account_id: &str) -> Option<Vec<String>>;
}

/// Slash-command gating flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCommandAdapter {
    pub enforce_owner_for_commands: bool,
    pub skip_when_config_empty: bool,
}

/// Resolved DM access rules for one account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DmPolicyResolution {
    pub policy: DmPolicy,
    #[serde(default)]
    pub allow_from: Vec<String>,
    /// Config path that controls the policy, for fix hints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approve_hint: Option<String>,
}

#[async_trait]
pub trait ChannelSecurityAdapter: Send + Sync {
    fn resolve_dm_policy(
        &self,
        cfg: &SwitchboardConfig,
        account: &ResolvedAccount,
    ) -> Option<DmPolicyResolution>;

    async fn collect_warnings(
        &self,
        _cfg: &SwitchboardConfig,
        _account: &ResolvedAccount,
    ) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

#[async_trait]
pub trait ChannelPairingAdapter: Send + Sync {
    /// Label for the id users pair with ("phone number", "user id", …).
    fn id_label(&self) -> &str;

    fn normalize_allow_entry(&self, entry: &str) -> String {
        entry.trim().to_string()
    }

    /// Tell a newly approved sender they can talk to the bot now.
    async fn notify_approval(&self, _cfg: &SwitchboardConfig, _id: &str) -> Result<()> {
        Ok(())
    }
}
