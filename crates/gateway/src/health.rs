//! Aggregated channel health.

use std::sync::Arc;

use {
    serde::Serialize,
    switchboard_channels::{
        ChannelAccountSnapshot, ChannelAccountState, Severity, StatusIssue, gating::DmPolicy,
    },
    tracing::warn,
};

use crate::accounts::ChannelManager;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub ok: bool,
    pub issues: Vec<StatusIssue>,
    pub accounts: Vec<Arc<ChannelAccountSnapshot>>,
}

impl HealthReport {
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.issues.iter().filter(|i| i.severity == severity).count()
    }
}

/// Collect issues over every known account. With `probe`, accounts that
/// are running and whose channel has a Status group are probed live.
pub async fn health_report(manager: &ChannelManager, probe: bool) -> HealthReport {
    let accounts = manager.snapshots();
    let mut issues = Vec::new();

    for snap in &accounts {
        issues.extend(builtin_issues(snap));
    }

    for plugin in manager.registry().iter() {
        let channel = plugin.id();
        let own: Vec<Arc<ChannelAccountSnapshot>> = accounts
            .iter()
            .filter(|s| s.channel == channel)
            .cloned()
            .collect();

        if let Some(status) = plugin.status.as_ref() {
            issues.extend(status.collect_status_issues(&own));
        }

        for snap in own.iter().filter(|s| s.enabled) {
            let account_id = snap.account_id.as_str();

            match manager.dm_policy(channel, account_id) {
                Ok(Some(resolution)) if resolution.policy == DmPolicy::Open => {
                    let mut issue = StatusIssue::new(
                        channel,
                        Severity::Warning,
                        "open DMs",
                        "anyone can message this account directly",
                    )
                    .for_account(account_id);
                    if let Some(path) = resolution.policy_path {
                        issue = issue.with_fix(format!("set {path} to \"allowlist\" or \"pairing\""));
                    }
                    issues.push(issue);
                },
                Ok(_) => {},
                Err(e) => warn!(channel, account_id, error = %e, "dm policy resolution failed"),
            }

            match manager.security_warnings(channel, account_id).await {
                Ok(Some(warnings)) => issues.extend(warnings.into_iter().map(|w| {
                    StatusIssue::new(channel, Severity::Warning, "security", w).for_account(account_id)
                })),
                Ok(None) => {},
                Err(e) => warn!(channel, account_id, error = %e, "security warnings failed"),
            }

            if probe && snap.state == ChannelAccountState::Running {
                match manager.probe_account(channel, account_id, None).await {
                    Ok(Some(result)) if !result.ok => issues.push(
                        StatusIssue::new(
                            channel,
                            Severity::Error,
                            "probe failed",
                            result.detail.unwrap_or_else(|| "backend unreachable".into()),
                        )
                        .for_account(account_id),
                    ),
                    Ok(_) => {},
                    Err(e) => issues.push(
                        StatusIssue::new(channel, Severity::Error, "probe failed", e.to_string())
                            .for_account(account_id),
                    ),
                }
            }
        }
    }

    let ok = !issues.iter().any(|i| i.severity == Severity::Error);
    HealthReport {
        ok,
        issues,
        accounts,
    }
}

fn builtin_issues(snap: &ChannelAccountSnapshot) -> Option<StatusIssue> {
    match snap.state {
        ChannelAccountState::Error => Some(
            StatusIssue::new(
                &snap.channel,
                Severity::Error,
                "account error",
                snap.last_error
                    .clone()
                    .unwrap_or_else(|| "start failed".into()),
            )
            .for_account(&snap.account_id)
            .with_fix(format!(
                "fix the config of channels.{} or restart the account",
                snap.channel
            )),
        ),
        ChannelAccountState::Unconfigured if snap.enabled => Some(
            StatusIssue::new(
                &snap.channel,
                Severity::Warning,
                "not configured",
                "account is enabled but missing required settings",
            )
            .for_account(&snap.account_id)
            .with_fix(format!("complete channels.{} in the config file", snap.channel)),
        ),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        async_trait::async_trait,
        serde_json::json,
        std::time::Duration,
        switchboard_channels::{
            ChannelGatewayAdapter, ChannelPlugin, ChannelRegistry, ChannelSecurityAdapter,
            ChannelStatusAdapter, DmPolicyResolution, GatewayContext, ProbeResult,
            ResolvedAccount, config_section::SectionConfigAdapter,
        },
        switchboard_config::SwitchboardConfig,
    };

    struct Up;

    #[async_trait]
    impl ChannelGatewayAdapter for Up {
        async fn start_account(&self, _ctx: GatewayContext) -> switchboard_channels::Result<()> {
            Ok(())
        }
    }

    struct Unreachable;

    #[async_trait]
    impl ChannelStatusAdapter for Unreachable {
        async fn probe_account(
            &self,
            _cfg: &SwitchboardConfig,
            _account: &ResolvedAccount,
            _timeout: Duration,
        ) -> switchboard_channels::Result<ProbeResult> {
            Ok(ProbeResult::failed(3, "connection refused"))
        }
    }

    struct OpenDms;

    #[async_trait]
    impl ChannelSecurityAdapter for OpenDms {
        fn resolve_dm_policy(
            &self,
            _cfg: &SwitchboardConfig,
            account: &ResolvedAccount,
        ) -> Option<DmPolicyResolution> {
            Some(DmPolicyResolution {
                policy: DmPolicy::Open,
                allow_from: Vec::new(),
                policy_path: Some(format!("channels.irc.accounts.{}.dm_policy", account.account_id)),
                approve_hint: None,
            })
        }

        async fn collect_warnings(
            &self,
            _cfg: &SwitchboardConfig,
            _account: &ResolvedAccount,
        ) -> switchboard_channels::Result<Vec<String>> {
            Ok(vec!["token stored in plain text".into()])
        }
    }

    fn manager() -> ChannelManager {
        let mut registry = ChannelRegistry::new();
        registry.register(
            ChannelPlugin::new("irc", "IRC")
                .with_gateway(Arc::new(Up))
                .with_status(Arc::new(Unreachable))
                .with_security(Arc::new(OpenDms)),
        );
        registry.register(
            ChannelPlugin::new("slack", "Slack")
                .with_config(Arc::new(SectionConfigAdapter::new("slack").with_required(&["token"]))),
        );
        let mut cfg = SwitchboardConfig::default();
        cfg.channels
            .insert("irc".into(), json!({ "accounts": { "main": {} } }));
        cfg.channels.insert("slack".into(), json!({}));
        ChannelManager::new(registry, cfg)
    }

    #[tokio::test]
    async fn report_collects_builtin_security_and_probe_issues() {
        let manager = manager();
        manager.refresh().await;
        manager.start_all().await;

        let report = health_report(&manager, true).await;
        assert!(!report.ok);
        let labels: Vec<_> = report.issues.iter().map(|i| i.label.as_str()).collect();
        assert!(labels.contains(&"not configured"), "{labels:?}");
        assert!(labels.contains(&"open DMs"));
        assert!(labels.contains(&"security"));
        assert!(labels.contains(&"probe failed"));
        assert_eq!(report.count(Severity::Error), 1);
        assert_eq!(report.accounts.len(), 2);
    }

    #[tokio::test]
    async fn report_without_probe_skips_backends() {
        let manager = manager();
        manager.refresh().await;
        manager.start_all().await;

        let report = health_report(&manager, false).await;
        assert!(report.ok);
        assert!(report.issues.iter().all(|i| i.label != "probe failed"));
    }
}
