//! Capability-checked dispatch into optional adapter groups.
//!
//! Every call returns `Ok(None)` when the channel lacks the group (or the
//! adapter reports the method as unsupported). That is a routing decision,
//! never an error.

use std::time::{Duration, Instant};

use {
    serde::Serialize,
    serde_json::Value,
    switchboard_channels::{
        ChannelCommandAdapter, ChannelDirectoryEntry, ChannelSetupInput, DirectoryEntryKind,
        DirectoryQuery, DmPolicyResolution, GroupContext, GroupToolPolicy, HeartbeatReadiness,
        HeartbeatRecipients, LogoutResult, ProbeResult, QrLoginStart, QrLoginWait,
        ResolvedTarget, StatusIssue,
    },
    tokio::time::timeout,
    tracing::{debug, info, warn},
};

use crate::{Error, Result, accounts::ChannelManager};

/// Map "method not implemented" onto "capability absent".
fn absent_if_unsupported<T>(result: switchboard_channels::Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_unsupported() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Updated config produced by a setup flow.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupOutcome {
    pub account_id: String,
    /// New `channels.<id>` section.
    pub section: Value,
}

/// Group-chat behavior for one conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupBehavior {
    pub require_mention: Option<bool>,
    pub intro_hint: Option<String>,
    pub tool_policy: Option<GroupToolPolicy>,
}

/// Which directory listing to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryListing {
    Peers,
    Groups,
    GroupMembers,
}

impl ChannelManager {
    /// Validate and merge a setup input. The result is not persisted.
    pub fn apply_setup(
        &self,
        channel: &str,
        account_id: Option<&str>,
        input: &ChannelSetupInput,
    ) -> Result<Option<SetupOutcome>> {
        let plugin = self.plugin(channel)?;
        let Some(setup) = plugin.setup.as_ref() else {
            return Ok(None);
        };
        let cfg = self.config();
        let account_id = setup.resolve_account_id(&cfg, account_id);
        if let Some(problem) = setup.validate_input(&cfg, &account_id, input) {
            return Err(switchboard_channels::Error::invalid_input(problem).into());
        }

        let mut section = setup.apply_account_config(&cfg, &account_id, input)?;
        if let Some(name) = input.name.as_deref() {
            let mut staged = (*cfg).clone();
            staged.channels.insert(plugin.id().to_string(), section);
            section = setup.apply_account_name(&staged, &account_id, name)?;
        }
        info!(channel = plugin.id(), account_id, "applied channel setup");
        Ok(Some(SetupOutcome {
            account_id,
            section,
        }))
    }

    pub async fn directory_self(
        &self,
        channel: &str,
        account_id: &str,
    ) -> Result<Option<ChannelDirectoryEntry>> {
        let plugin = self.plugin(channel)?;
        let Some(directory) = plugin.directory.as_ref() else {
            return Ok(None);
        };
        Ok(absent_if_unsupported(directory.self_entry(&self.config(), account_id).await)?.flatten())
    }

    /// List peers, groups or group members. `live` queries the backend and
    /// falls back to the cached variant when the live one is unsupported.
    pub async fn directory_list(
        &self,
        channel: &str,
        listing: DirectoryListing,
        query: &DirectoryQuery,
        live: bool,
    ) -> Result<Option<Vec<ChannelDirectoryEntry>>> {
        let plugin = self.plugin(channel)?;
        let Some(directory) = plugin.directory.as_ref() else {
            return Ok(None);
        };
        let cfg = self.config();

        if listing == DirectoryListing::GroupMembers && query.group_id.is_none() {
            return Err(switchboard_channels::Error::invalid_input("group_id is required").into());
        }

        if live {
            let result = match listing {
                DirectoryListing::Peers => directory.list_peers_live(&cfg, query).await,
                DirectoryListing::Groups => directory.list_groups_live(&cfg, query).await,
                DirectoryListing::GroupMembers => directory.list_group_members(&cfg, query).await,
            };
            if let Some(entries) = absent_if_unsupported(result)? {
                return Ok(Some(entries));
            }
            debug!(channel, ?listing, "live directory listing unsupported, using cached");
        }

        let result = match listing {
            DirectoryListing::Peers => directory.list_peers(&cfg, query).await,
            DirectoryListing::Groups => directory.list_groups(&cfg, query).await,
            DirectoryListing::GroupMembers => directory.list_group_members(&cfg, query).await,
        };
        absent_if_unsupported(result)
    }

    pub async fn resolve_targets(
        &self,
        channel: &str,
        account_id: &str,
        inputs: &[String],
        kind: DirectoryEntryKind,
    ) -> Result<Option<Vec<ResolvedTarget>>> {
        let plugin = self.plugin(channel)?;
        let Some(resolver) = plugin.resolver.as_ref() else {
            return Ok(None);
        };
        absent_if_unsupported(
            resolver
                .resolve_targets(&self.config(), account_id, inputs, kind)
                .await,
        )
    }

    pub async fn heartbeat_ready(
        &self,
        channel: &str,
        account_id: &str,
    ) -> Result<Option<HeartbeatReadiness>> {
        let plugin = self.plugin(channel)?;
        let Some(heartbeat) = plugin.heartbeat.as_ref() else {
            return Ok(None);
        };
        absent_if_unsupported(heartbeat.check_ready(&self.config(), account_id).await)
    }

    pub fn heartbeat_recipients(
        &self,
        channel: &str,
        account_id: &str,
        to: Option<&str>,
        all: bool,
    ) -> Result<Option<HeartbeatRecipients>> {
        let plugin = self.plugin(channel)?;
        Ok(plugin
            .heartbeat
            .as_ref()
            .map(|h| h.resolve_recipients(&self.config(), account_id, to, all)))
    }

    pub fn group_behavior(&self, channel: &str, ctx: &GroupContext) -> Result<Option<GroupBehavior>> {
        let plugin = self.plugin(channel)?;
        let Some(group) = plugin.group.as_ref() else {
            return Ok(None);
        };
        let cfg = self.config();
        Ok(Some(GroupBehavior {
            require_mention: group.resolve_require_mention(&cfg, ctx),
            intro_hint: group.resolve_group_intro_hint(&cfg, ctx),
            tool_policy: group.resolve_tool_policy(&cfg, ctx),
        }))
    }

    pub fn dm_policy(&self, channel: &str, account_id: &str) -> Result<Option<DmPolicyResolution>> {
        let plugin = self.plugin(channel)?;
        let Some(security) = plugin.security.as_ref() else {
            return Ok(None);
        };
        let account = self.resolve_account(&plugin, Some(account_id))?;
        Ok(security.resolve_dm_policy(&self.config(), &account))
    }

    pub async fn security_warnings(
        &self,
        channel: &str,
        account_id: &str,
    ) -> Result<Option<Vec<String>>> {
        let plugin = self.plugin(channel)?;
        let Some(security) = plugin.security.as_ref() else {
            return Ok(None);
        };
        let account = self.resolve_account(&plugin, Some(account_id))?;
        absent_if_unsupported(security.collect_warnings(&self.config(), &account).await)
    }

    pub fn normalize_pairing_entry(&self, channel: &str, entry: &str) -> Result<Option<String>> {
        let plugin = self.plugin(channel)?;
        Ok(plugin
            .pairing
            .as_ref()
            .map(|p| p.normalize_allow_entry(entry)))
    }

    pub async fn notify_pairing_approval(&self, channel: &str, id: &str) -> Result<Option<()>> {
        let plugin = self.plugin(channel)?;
        let Some(pairing) = plugin.pairing.as_ref() else {
            return Ok(None);
        };
        let id = pairing.normalize_allow_entry(id);
        absent_if_unsupported(pairing.notify_approval(&self.config(), &id).await)
    }

    /// Allow-list for privileged commands: the Elevated fallback, if any.
    pub fn elevated_allow_from(&self, channel: &str, account_id: &str) -> Result<Option<Vec<String>>> {
        let plugin = self.plugin(channel)?;
        Ok(plugin
            .elevated
            .as_ref()
            .and_then(|e| e.allow_from_fallback(&self.config(), account_id)))
    }

    pub fn command_flags(&self, channel: &str) -> Result<Option<ChannelCommandAdapter>> {
        Ok(self.plugin(channel)?.commands)
    }

    pub async fn auth_login(
        &self,
        channel: &str,
        account_id: Option<&str>,
        verbose: bool,
    ) -> Result<Option<()>> {
        let plugin = self.plugin(channel)?;
        let Some(auth) = plugin.auth.as_ref() else {
            return Ok(None);
        };
        absent_if_unsupported(auth.login(&self.config(), account_id, verbose).await)
    }

    pub async fn qr_login_start(
        &self,
        channel: &str,
        account_id: &str,
        force: bool,
        wait: Duration,
    ) -> Result<Option<QrLoginStart>> {
        let plugin = self.plugin(channel)?;
        let Some(gateway) = plugin.gateway.as_ref() else {
            return Ok(None);
        };
        absent_if_unsupported(
            gateway
                .login_with_qr_start(&self.config(), account_id, force, wait)
                .await,
        )
    }

    pub async fn qr_login_wait(
        &self,
        channel: &str,
        account_id: &str,
        wait: Duration,
    ) -> Result<Option<QrLoginWait>> {
        let plugin = self.plugin(channel)?;
        let Some(gateway) = plugin.gateway.as_ref() else {
            return Ok(None);
        };
        absent_if_unsupported(
            gateway
                .login_with_qr_wait(&self.config(), account_id, wait)
                .await,
        )
    }

    /// Stop the account, then log it out of the backend.
    pub async fn logout(&self, channel: &str, account_id: &str) -> Result<Option<LogoutResult>> {
        let plugin = self.plugin(channel)?;
        let Some(gateway) = plugin.gateway.as_ref() else {
            return Ok(None);
        };
        let account = self.resolve_account(&plugin, Some(account_id))?;
        if self.snapshot(plugin.id(), account_id).is_some() {
            self.stop_account(plugin.id(), account_id).await?;
        }
        let result = absent_if_unsupported(gateway.logout_account(&self.config(), &account).await)?;
        if let Some(outcome) = &result {
            info!(channel, account_id, cleared = outcome.cleared, logged_out = outcome.logged_out, "account logged out");
        }
        Ok(result)
    }

    /// Probe reachability under `limit` (default: `gateway.probe_timeout_ms`).
    /// A timeout is reported as a failed probe, not an error.
    pub async fn probe_account(
        &self,
        channel: &str,
        account_id: &str,
        limit: Option<Duration>,
    ) -> Result<Option<ProbeResult>> {
        let plugin = self.plugin(channel)?;
        let Some(status) = plugin.status.as_ref() else {
            return Ok(None);
        };
        let cfg = self.config();
        let limit = limit.unwrap_or_else(|| cfg.gateway.probe_timeout());
        let account = self.resolve_account(&plugin, Some(account_id))?;

        let started = Instant::now();
        match timeout(limit, status.probe_account(&cfg, &account, limit)).await {
            Ok(result) => absent_if_unsupported(result),
            Err(_) => {
                warn!(channel, account_id, timeout_ms = limit.as_millis() as u64, "probe timed out");
                Ok(Some(ProbeResult::failed(
                    started.elapsed().as_millis() as u64,
                    format!("probe timed out after {}ms", limit.as_millis()),
                )))
            },
        }
    }

    pub async fn audit_account(
        &self,
        channel: &str,
        account_id: &str,
        limit: Option<Duration>,
    ) -> Result<Option<Vec<StatusIssue>>> {
        let plugin = self.plugin(channel)?;
        let Some(status) = plugin.status.as_ref() else {
            return Ok(None);
        };
        let cfg = self.config();
        let limit = limit.unwrap_or_else(|| cfg.gateway.probe_timeout());
        let account = self.resolve_account(&plugin, Some(account_id))?;
        match timeout(limit, status.audit_account(&cfg, &account, limit)).await {
            Ok(result) => absent_if_unsupported(result),
            Err(_) => Err(Error::Channel(switchboard_channels::Error::unavailable(format!(
                "audit timed out after {}ms",
                limit.as_millis()
            )))),
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        async_trait::async_trait,
        serde_json::json,
        std::sync::Arc,
        switchboard_channels::{
            ChannelDirectoryAdapter, ChannelPlugin, ChannelRegistry, ChannelSetupAdapter,
            ChannelStatusAdapter, ResolvedAccount, config_section,
        },
        switchboard_config::SwitchboardConfig,
    };

    struct CachedDirectory;

    #[async_trait]
    impl ChannelDirectoryAdapter for CachedDirectory {
        async fn list_peers(
            &self,
            _cfg: &SwitchboardConfig,
            _query: &DirectoryQuery,
        ) -> switchboard_channels::Result<Vec<ChannelDirectoryEntry>> {
            Ok(vec![ChannelDirectoryEntry::new(DirectoryEntryKind::User, "alice")])
        }
    }

    struct SlowStatus;

    #[async_trait]
    impl ChannelStatusAdapter for SlowStatus {
        async fn probe_account(
            &self,
            _cfg: &SwitchboardConfig,
            _account: &ResolvedAccount,
            _timeout: Duration,
        ) -> switchboard_channels::Result<ProbeResult> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(ProbeResult::ok(0))
        }
    }

    struct NamedSetup;

    impl ChannelSetupAdapter for NamedSetup {
        fn apply_account_name(
            &self,
            cfg: &SwitchboardConfig,
            account_id: &str,
            name: &str,
        ) -> switchboard_channels::Result<Value> {
            Ok(config_section::set_account_field(cfg, "irc", account_id, "name", json!(name)))
        }

        fn apply_account_config(
            &self,
            cfg: &SwitchboardConfig,
            account_id: &str,
            input: &ChannelSetupInput,
        ) -> switchboard_channels::Result<Value> {
            let server = input.url.clone().unwrap_or_default();
            Ok(config_section::set_account_field(cfg, "irc", account_id, "server", json!(server)))
        }

        fn validate_input(
            &self,
            _cfg: &SwitchboardConfig,
            _account_id: &str,
            input: &ChannelSetupInput,
        ) -> Option<String> {
            input.url.is_none().then(|| "server url is required".to_string())
        }
    }

    fn manager() -> ChannelManager {
        let mut registry = ChannelRegistry::new();
        registry.register(
            ChannelPlugin::new("irc", "IRC")
                .with_directory(Arc::new(CachedDirectory))
                .with_status(Arc::new(SlowStatus))
                .with_setup(Arc::new(NamedSetup)),
        );
        registry.register(ChannelPlugin::new("bare", "Bare"));
        let mut cfg = SwitchboardConfig::default();
        cfg.channels.insert("irc".into(), json!({}));
        cfg.channels.insert("bare".into(), json!({}));
        ChannelManager::new(registry, cfg)
    }

    #[tokio::test]
    async fn absent_groups_are_none() {
        let manager = manager();
        let query = DirectoryQuery::for_account("default");
        assert!(
            manager
                .directory_list("bare", DirectoryListing::Peers, &query, false)
                .await
                .unwrap()
                .is_none()
        );
        assert!(manager.probe_account("bare", "default", None).await.unwrap().is_none());
        assert!(manager.auth_login("bare", None, false).await.unwrap().is_none());
        assert!(manager.command_flags("bare").unwrap().is_none());
        assert!(matches!(
            manager.command_flags("nope"),
            Err(Error::Channel(switchboard_channels::Error::UnknownChannel { .. }))
        ));
    }

    #[tokio::test]
    async fn live_listing_falls_back_to_cached() {
        let manager = manager();
        let query = DirectoryQuery::for_account("default");
        let peers = manager
            .directory_list("irc", DirectoryListing::Peers, &query, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(peers[0].id, "alice");
        // Groups are not implemented at all.
        assert!(
            manager
                .directory_list("irc", DirectoryListing::Groups, &query, true)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn probe_timeout_is_a_failed_probe() {
        let manager = manager();
        let probe = manager
            .probe_account("irc", "default", Some(Duration::from_millis(100)))
            .await
            .unwrap()
            .unwrap();
        assert!(!probe.ok);
        assert!(probe.detail.unwrap().contains("timed out"));
    }

    #[test]
    fn setup_validates_then_applies_name() {
        let manager = manager();
        let err = manager
            .apply_setup("irc", Some("Work"), &ChannelSetupInput::default())
            .unwrap_err();
        assert!(err.to_string().contains("server url is required"));

        let input = ChannelSetupInput {
            name: Some("Work IRC".into()),
            url: Some("irc.libera.chat".into()),
            ..Default::default()
        };
        let outcome = manager.apply_setup("irc", Some("Work"), &input).unwrap().unwrap();
        assert_eq!(outcome.account_id, "work");
        assert_eq!(outcome.section["accounts"]["work"]["server"], "irc.libera.chat");
        assert_eq!(outcome.section["accounts"]["work"]["name"], "Work IRC");
        assert!(manager.apply_setup("bare", None, &input).unwrap().is_none());
    }
}
