#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Cross-crate scenarios: registry, manager, delivery and dispatch together.

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use {
    async_trait::async_trait,
    serde_json::json,
    switchboard_channels::{
        ChannelAccountState, ChannelGatewayAdapter, ChannelPlugin, ChannelRegistry,
        ChannelStatusAdapter, DirectoryQuery, GatewayContext, Result,
    },
    switchboard_common::types::ReplyPayload,
    switchboard_config::SwitchboardConfig,
    switchboard_gateway::{
        ChannelManager, DeliveryPipeline, DeliveryTarget, Error, dispatch::DirectoryListing,
        log_channel::log_channel_plugin,
    },
};

struct Rejecting;

#[async_trait]
impl ChannelGatewayAdapter for Rejecting {
    async fn start_account(&self, _ctx: GatewayContext) -> Result<()> {
        Err(switchboard_channels::Error::unavailable("invalid bot token"))
    }
}

#[derive(Default)]
struct Counting {
    starts: AtomicUsize,
}

#[async_trait]
impl ChannelGatewayAdapter for Counting {
    async fn start_account(&self, ctx: GatewayContext) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.status.update(|snap| snap.connected = Some(true));
        Ok(())
    }
}

/// Status group that only builds summaries.
struct SummaryOnly;

#[async_trait]
impl ChannelStatusAdapter for SummaryOnly {}

fn config() -> SwitchboardConfig {
    let mut cfg = SwitchboardConfig::default();
    cfg.channels
        .insert("broken".into(), json!({ "token": "bad" }));
    cfg.channels.insert(
        "chat".into(),
        json!({ "accounts": { "home": {}, "work": { "enabled": false } } }),
    );
    cfg.channels.insert("log".into(), json!({}));
    cfg
}

#[tokio::test]
async fn one_rejected_start_does_not_block_other_channels() {
    let counting = Arc::new(Counting::default());
    let mut registry = ChannelRegistry::new();
    registry.register(ChannelPlugin::new("broken", "Broken").with_gateway(Arc::new(Rejecting)));
    registry.register(ChannelPlugin::new("chat", "Chat").with_gateway(Arc::clone(&counting) as _));
    let manager = ChannelManager::new(registry, config());

    manager.refresh().await;
    manager.start_all().await;

    let broken = manager.snapshot("broken", "default").unwrap();
    assert_eq!(broken.state, ChannelAccountState::Error);
    assert!(broken.last_error.as_deref().unwrap().contains("invalid bot token"));

    let home = manager.snapshot("chat", "home").unwrap();
    assert_eq!(home.state, ChannelAccountState::Running);
    assert_eq!(home.connected, Some(true));
    assert_eq!(
        manager.snapshot("chat", "work").unwrap().state,
        ChannelAccountState::Disabled
    );

    // A second sweep leaves the failed account alone and does not restart
    // the running one.
    manager.start_all().await;
    assert_eq!(counting.starts.load(Ordering::SeqCst), 1);
    assert_eq!(
        manager.snapshot("broken", "default").unwrap().state,
        ChannelAccountState::Error
    );

    manager.stop_all().await;
    assert!(
        manager
            .snapshots()
            .iter()
            .all(|s| !s.state.is_live())
    );
}

#[tokio::test]
async fn delivery_without_outbound_is_a_routing_error() {
    let counting = Arc::new(Counting::default());
    let mut registry = ChannelRegistry::new();
    registry.register(ChannelPlugin::new("chat", "Chat").with_gateway(Arc::clone(&counting) as _));
    registry.register(log_channel_plugin());
    let manager = Arc::new(ChannelManager::new(registry, config()));
    manager.refresh().await;

    let pipeline = DeliveryPipeline::new(Arc::clone(&manager));
    let err = pipeline
        .deliver(
            &DeliveryTarget::new("chat", "alice").with_account("home"),
            &ReplyPayload::text("hi"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Routing { .. }));
    assert_eq!(counting.starts.load(Ordering::SeqCst), 0);

    let report = pipeline
        .deliver(&DeliveryTarget::new("log", "ops"), &ReplyPayload::text("hi"))
        .await
        .unwrap();
    assert_eq!(report.outcomes.len(), 1);
}

#[tokio::test]
async fn absent_capabilities_dispatch_to_none() {
    let mut registry = ChannelRegistry::new();
    registry.register(log_channel_plugin());
    let manager = ChannelManager::new(registry, config());
    manager.refresh().await;

    let query = DirectoryQuery::for_account("default");
    assert!(
        manager
            .directory_list("log", DirectoryListing::Peers, &query, true)
            .await
            .unwrap()
            .is_none()
    );
    assert!(manager.dm_policy("log", "default").unwrap().is_none());
    assert!(
        manager
            .qr_login_start("log", "default", false, Duration::from_secs(1))
            .await
            .unwrap()
            .is_none()
    );
    let probe = manager
        .probe_account("log", "default", None)
        .await
        .unwrap()
        .unwrap();
    assert!(probe.ok);
}

#[tokio::test]
async fn status_group_without_probe_dispatches_to_none() {
    let mut registry = ChannelRegistry::new();
    registry.register(ChannelPlugin::new("chat", "Chat").with_status(Arc::new(SummaryOnly)));
    registry.register(ChannelPlugin::new("bare", "Bare"));
    let mut cfg = config();
    cfg.channels.insert("bare".into(), json!({}));
    let manager = ChannelManager::new(registry, cfg);
    manager.refresh().await;

    assert!(
        manager
            .probe_account("chat", "home", None)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        manager
            .probe_account("bare", "default", None)
            .await
            .unwrap()
            .is_none()
    );
}
