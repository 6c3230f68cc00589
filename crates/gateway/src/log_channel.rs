//! Built-in `log` channel: writes outbound messages to the tracing log.
//!
//! Useful as a smoke test of the gateway and as the reference for what a
//! minimal backend implements. Enable it with a `[channels.log]` section.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    serde_json::{Map, Value, json},
    switchboard_channels::{
        ChannelAccountSnapshot, ChannelCapabilities, ChannelGatewayAdapter,
        ChannelOutboundAdapter, ChannelPlugin, ChannelStatusAdapter, DeliveryMode, DeliveryReceipt,
        GatewayContext, OutboundContext, ProbeResult, ResolvedAccount, Result, SelfIdentity,
    },
    switchboard_config::SwitchboardConfig,
    switchboard_common::types::{ChatType, MediaAttachment, PollPayload},
    tracing::info,
};

pub const LOG_CHANNEL_ID: &str = "log";

const DEFAULT_TARGET: &str = "stdout";

struct LogGateway;

#[async_trait]
impl ChannelGatewayAdapter for LogGateway {
    async fn start_account(&self, ctx: GatewayContext) -> Result<()> {
        let account_id = ctx.account_id().to_string();
        ctx.status.update(|snap| {
            snap.connected = Some(true);
            snap.self_identity = Some(SelfIdentity {
                id: format!("log:{account_id}"),
                display_name: ctx.account.name.clone(),
            });
        });
        if let Some(log) = &ctx.log {
            log.info("log channel ready");
        }

        let cancel = ctx.cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            info!(account_id, "log channel account shut down");
        });
        Ok(())
    }
}

struct LogOutbound;

#[async_trait]
impl ChannelOutboundAdapter for LogOutbound {
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::Direct
    }

    fn text_chunk_limit(&self) -> usize {
        0
    }

    fn resolve_target(&self, to: Option<&str>, _allow_from: &[String], _account_id: &str) -> Result<String> {
        Ok(to
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .unwrap_or(DEFAULT_TARGET)
            .to_string())
    }

    async fn send_text(&self, ctx: &OutboundContext, text: &str) -> Result<DeliveryReceipt> {
        info!(account_id = ctx.account_id(), to = %ctx.to, silent = ctx.silent, text, "outbound message");
        Ok(receipt(ctx))
    }

    async fn send_media(
        &self,
        ctx: &OutboundContext,
        caption: Option<&str>,
        media: &MediaAttachment,
    ) -> Result<DeliveryReceipt> {
        info!(
            account_id = ctx.account_id(),
            to = %ctx.to,
            url = %media.url,
            mime_type = %media.mime_type,
            caption = caption.unwrap_or_default(),
            "outbound media"
        );
        Ok(receipt(ctx))
    }

    async fn send_poll(&self, ctx: &OutboundContext, poll: &PollPayload) -> Result<DeliveryReceipt> {
        info!(
            account_id = ctx.account_id(),
            to = %ctx.to,
            question = %poll.question,
            options = ?poll.options,
            "outbound poll"
        );
        Ok(receipt(ctx))
    }
}

fn receipt(ctx: &OutboundContext) -> DeliveryReceipt {
    let mut receipt = DeliveryReceipt::new(LOG_CHANNEL_ID, uuid::Uuid::new_v4().to_string());
    receipt.chat_id = Some(ctx.to.clone());
    receipt
}

struct LogStatus;

#[async_trait]
impl ChannelStatusAdapter for LogStatus {
    fn build_account_summary(
        &self,
        account: &ResolvedAccount,
        _snapshot: &ChannelAccountSnapshot,
    ) -> Map<String, Value> {
        let mut summary = Map::new();
        summary.insert("sink".into(), json!("tracing"));
        summary.insert("accountId".into(), json!(account.account_id));
        summary
    }

    /// The sink is in-process, so it is always reachable.
    async fn probe_account(
        &self,
        _cfg: &SwitchboardConfig,
        _account: &ResolvedAccount,
        _timeout: Duration,
    ) -> Result<ProbeResult> {
        Ok(ProbeResult::ok(0))
    }
}

/// The built-in `log` channel plugin.
#[must_use]
pub fn log_channel_plugin() -> ChannelPlugin {
    ChannelPlugin::new(LOG_CHANNEL_ID, "Log")
        .with_blurb("Writes outbound messages to the gateway log.")
        .with_capabilities(ChannelCapabilities {
            chat_types: vec![ChatType::Dm],
            media: true,
            polls: true,
            ..Default::default()
        })
        .with_gateway(Arc::new(LogGateway))
        .with_outbound(Arc::new(LogOutbound))
        .with_status(Arc::new(LogStatus))
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            ChannelManager,
            delivery::{DeliveryPipeline, DeliveryStatus, DeliveryTarget},
        },
        switchboard_channels::{ChannelAccountState, ChannelRegistry},
        switchboard_common::types::ReplyPayload,
    };

    fn manager() -> Arc<ChannelManager> {
        let mut registry = ChannelRegistry::new();
        registry.register(log_channel_plugin());
        let mut cfg = SwitchboardConfig::default();
        cfg.channels.insert(LOG_CHANNEL_ID.into(), json!({}));
        Arc::new(ChannelManager::new(registry, cfg))
    }

    #[tokio::test]
    async fn log_account_runs_until_stopped() {
        let manager = manager();
        manager.refresh().await;
        manager.start_all().await;

        let snap = manager.snapshot(LOG_CHANNEL_ID, "default").unwrap();
        assert_eq!(snap.state, ChannelAccountState::Running);
        assert_eq!(snap.connected, Some(true));
        assert_eq!(snap.summary["sink"], "tracing");

        let snap = manager.stop_account(LOG_CHANNEL_ID, "default").await.unwrap();
        assert_eq!(snap.state, ChannelAccountState::Stopped);
        assert_eq!(snap.connected, Some(false));
    }

    #[tokio::test]
    async fn log_channel_accepts_any_target() {
        let pipeline = DeliveryPipeline::new(manager());
        let target = DeliveryTarget {
            channel: LOG_CHANNEL_ID.into(),
            account_id: None,
            to: None,
        };
        let report = pipeline
            .deliver(&target, &ReplyPayload::text("hello"))
            .await
            .unwrap();
        assert_eq!(report.status, DeliveryStatus::Delivered);
        assert_eq!(report.to, DEFAULT_TARGET);
    }
}
