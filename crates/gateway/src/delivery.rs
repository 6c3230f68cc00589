//! Outbound delivery: one logical reply to one or more physical sends.
//!
//! Routing problems (unknown channel, no Outbound group, rejected target,
//! oversized poll, empty reply) fail the whole delivery before any send.
//! Text is sent exactly as given, whitespace included. Once sending
//! starts, each physical send is recorded separately and nothing is rolled
//! back.

use std::{collections::BTreeMap, sync::Arc};

use {
    futures::future::join_all,
    serde::Serialize,
    switchboard_channels::{
        ChannelOutboundAdapter, ChannelPlugin, DeliveryMode, DeliveryReceipt, OutboundContext,
        chunk::chunk_by_mode,
    },
    switchboard_common::types::{MediaAttachment, ReplyPayload},
    tracing::{debug, info, warn},
};

use crate::{
    Error, Result,
    accounts::{ChannelManager, config_adapter},
};

/// Where a reply goes. `account_id` defaults to the channel's default
/// account; `to` defaults to the single allow-listed peer, if any.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryTarget {
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
}

impl DeliveryTarget {
    #[must_use]
    pub fn new(channel: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            account_id: None,
            to: Some(to.into()),
        }
    }

    #[must_use]
    pub fn with_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SendKind {
    Text,
    Media,
    Poll,
}

/// Result of one physical send.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOutcome {
    pub kind: SendKind,
    /// Position among sends of the same kind.
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receipt: Option<DeliveryReceipt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendOutcome {
    fn from_result(
        kind: SendKind,
        index: usize,
        result: switchboard_channels::Result<DeliveryReceipt>,
    ) -> Self {
        match result {
            Ok(receipt) => Self {
                kind,
                index,
                receipt: Some(receipt),
                error: None,
            },
            Err(e) => Self {
                kind,
                index,
                receipt: None,
                error: Some(e.to_string()),
            },
        }
    }

    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Delivered,
    Partial,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryReport {
    pub channel: String,
    pub account_id: String,
    pub to: String,
    pub outcomes: Vec<SendOutcome>,
    pub status: DeliveryStatus,
}

impl DeliveryReport {
    fn new(channel: &str, account_id: &str, to: &str, outcomes: Vec<SendOutcome>) -> Self {
        let sent = outcomes.iter().filter(|o| o.is_ok()).count();
        let status = if sent == outcomes.len() {
            DeliveryStatus::Delivered
        } else if sent == 0 {
            DeliveryStatus::Failed
        } else {
            DeliveryStatus::Partial
        };
        Self {
            channel: channel.to_string(),
            account_id: account_id.to_string(),
            to: to.to_string(),
            outcomes,
            status,
        }
    }
}

const SKIPPED_AFTER_FAILURE: &str = "skipped after an earlier chunk failed";

/// Routes reply payloads through channel Outbound groups.
#[derive(Clone)]
pub struct DeliveryPipeline {
    manager: Arc<ChannelManager>,
}

impl DeliveryPipeline {
    #[must_use]
    pub fn new(manager: Arc<ChannelManager>) -> Self {
        Self { manager }
    }

    /// Deliver one reply to one destination.
    pub async fn deliver(
        &self,
        target: &DeliveryTarget,
        payload: &ReplyPayload,
    ) -> Result<DeliveryReport> {
        let plugin = self
            .manager
            .plugin(&target.channel)
            .map_err(|_| Error::routing(format!("unknown channel: {}", target.channel)))?;
        let Some(outbound) = plugin.outbound.clone() else {
            return Err(Error::routing(format!(
                "channel {} cannot send messages",
                plugin.id()
            )));
        };

        let account = self
            .manager
            .resolve_account(&plugin, target.account_id.as_deref())?;
        if !account.enabled {
            return Err(Error::routing(format!(
                "account {} of {} is disabled",
                account.account_id,
                plugin.id()
            )));
        }
        let allow_from = config_adapter(&plugin).resolve_allow_from(&account);
        let to = outbound.resolve_target(target.to.as_deref(), &allow_from, &account.account_id)?;

        if let Some(poll) = &payload.poll
            && let Some(max) = outbound.poll_max_options()
            && poll.options.len() > max
        {
            return Err(Error::PollTooLarge {
                channel: plugin.id().to_string(),
                options: poll.options.len(),
                max,
            });
        }

        if payload.text.is_empty() && payload.media.is_empty() && payload.poll.is_none() {
            return Err(Error::EmptyReply {
                channel: plugin.id().to_string(),
            });
        }

        let ctx = OutboundContext {
            cfg: self.manager.config(),
            account,
            to,
            reply_to_id: payload.reply_to_id.clone(),
            thread_id: payload.thread_id.clone(),
            silent: payload.silent,
        };
        debug!(
            channel = plugin.id(),
            account_id = ctx.account_id(),
            to = %ctx.to,
            media = payload.media.len(),
            poll = payload.poll.is_some(),
            "delivering reply"
        );

        let mut outcomes = Vec::new();
        let limit = outbound.text_chunk_limit();
        let text = payload.text.as_str();
        let caption_fits = !text.is_empty() && (limit == 0 || text.chars().count() <= limit);

        // Short text rides along as the caption of the first attachment.
        let caption = if !payload.media.is_empty() && caption_fits {
            Some(text)
        } else {
            if !text.is_empty() {
                let chunks = split_text(outbound.as_ref(), text);
                outcomes.extend(send_chunks(outbound.as_ref(), &ctx, &chunks).await);
            }
            None
        };

        for (index, media) in payload.media.iter().enumerate() {
            let caption = if index == 0 { caption } else { None };
            let result = send_one_media(&plugin, outbound.as_ref(), &ctx, caption, media).await;
            outcomes.push(SendOutcome::from_result(SendKind::Media, index, result));
        }

        if let Some(poll) = &payload.poll {
            let result = outbound.send_poll(&ctx, poll).await;
            outcomes.push(SendOutcome::from_result(SendKind::Poll, 0, result));
        }

        let report = DeliveryReport::new(plugin.id(), ctx.account_id(), &ctx.to, outcomes);
        match report.status {
            DeliveryStatus::Delivered => info!(
                channel = plugin.id(),
                account_id = ctx.account_id(),
                sends = report.outcomes.len(),
                "reply delivered"
            ),
            status => warn!(
                channel = plugin.id(),
                account_id = ctx.account_id(),
                ?status,
                failed = report.outcomes.iter().filter(|o| !o.is_ok()).count(),
                "reply not fully delivered"
            ),
        }
        Ok(report)
    }

    /// Deliver many replies. Destinations run concurrently; replies for the
    /// same destination are sent strictly in the given order. Results keep
    /// the input order.
    pub async fn deliver_batch(
        &self,
        items: Vec<(DeliveryTarget, ReplyPayload)>,
    ) -> Vec<Result<DeliveryReport>> {
        let mut groups: BTreeMap<DeliveryTarget, Vec<(usize, ReplyPayload)>> = BTreeMap::new();
        let total = items.len();
        for (position, (target, payload)) in items.into_iter().enumerate() {
            let key = DeliveryTarget {
                channel: target.channel.trim().to_lowercase(),
                ..target
            };
            groups.entry(key).or_default().push((position, payload));
        }

        let runs = groups.into_iter().map(|(target, replies)| async move {
            let mut results = Vec::with_capacity(replies.len());
            for (position, payload) in replies {
                results.push((position, self.deliver(&target, &payload).await));
            }
            results
        });

        let mut ordered: Vec<Option<Result<DeliveryReport>>> = (0..total).map(|_| None).collect();
        for (position, result) in join_all(runs).await.into_iter().flatten() {
            if let Some(slot) = ordered.get_mut(position) {
                *slot = Some(result);
            }
        }
        ordered.into_iter().flatten().collect()
    }
}

fn split_text(outbound: &dyn ChannelOutboundAdapter, text: &str) -> Vec<String> {
    let limit = outbound.text_chunk_limit();
    if limit == 0 {
        return vec![text.to_string()];
    }
    outbound
        .chunk_text(text, limit)
        .unwrap_or_else(|| chunk_by_mode(text, limit, outbound.chunk_mode()))
}

/// Send chunks in order. After the first failure the rest are not sent,
/// so a reader never sees later parts without the earlier ones.
async fn send_chunks(
    outbound: &dyn ChannelOutboundAdapter,
    ctx: &OutboundContext,
    chunks: &[String],
) -> Vec<SendOutcome> {
    let mut outcomes = Vec::with_capacity(chunks.len());
    let mut failed = false;
    for (index, chunk) in chunks.iter().enumerate() {
        if failed {
            outcomes.push(SendOutcome {
                kind: SendKind::Text,
                index,
                receipt: None,
                error: Some(SKIPPED_AFTER_FAILURE.into()),
            });
            continue;
        }
        let outcome = SendOutcome::from_result(SendKind::Text, index, outbound.send_text(ctx, chunk).await);
        if let Some(error) = &outcome.error {
            warn!(account_id = ctx.account_id(), index, error = %error, "text chunk failed");
            failed = true;
        }
        outcomes.push(outcome);
    }
    outcomes
}

async fn send_one_media(
    plugin: &ChannelPlugin,
    outbound: &dyn ChannelOutboundAdapter,
    ctx: &OutboundContext,
    caption: Option<&str>,
    media: &MediaAttachment,
) -> switchboard_channels::Result<DeliveryReceipt> {
    match outbound.delivery_mode() {
        DeliveryMode::Direct => outbound.send_media(ctx, caption, media).await,
        DeliveryMode::Gateway | DeliveryMode::Hybrid if plugin.capabilities.media => {
            outbound.send_media(ctx, caption, media).await
        },
        DeliveryMode::Gateway | DeliveryMode::Hybrid => {
            let text = match caption {
                Some(caption) => format!("{caption}\n{}", media.url),
                None => media.url.clone(),
            };
            outbound.send_text(ctx, &text).await
        },
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        async_trait::async_trait,
        rstest::rstest,
        serde_json::json,
        std::{
            sync::{
                Mutex,
                atomic::{AtomicUsize, Ordering},
            },
            time::Duration,
        },
        switchboard_channels::{ChannelCapabilities, ChannelRegistry, ChunkMode},
        switchboard_common::types::PollPayload,
        switchboard_config::SwitchboardConfig,
    };

    #[derive(Default)]
    struct Recorder {
        sends: Mutex<Vec<(SendKind, String, String)>>,
        calls: AtomicUsize,
    }

    impl Recorder {
        fn sends(&self) -> Vec<(SendKind, String, String)> {
            self.sends.lock().unwrap().clone()
        }
    }

    struct FakeOutbound {
        mode: DeliveryMode,
        limit: usize,
        poll_max: Option<usize>,
        fail_call: Option<usize>,
        slow_prefix: Option<&'static str>,
        recorder: Arc<Recorder>,
    }

    impl FakeOutbound {
        fn new(recorder: &Arc<Recorder>) -> Self {
            Self {
                mode: DeliveryMode::Direct,
                limit: 0,
                poll_max: None,
                fail_call: None,
                slow_prefix: None,
                recorder: Arc::clone(recorder),
            }
        }

        async fn record(
            &self,
            ctx: &OutboundContext,
            kind: SendKind,
            body: String,
        ) -> switchboard_channels::Result<DeliveryReceipt> {
            let call = self.recorder.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_call == Some(call) {
                return Err(switchboard_channels::Error::unavailable("backend rejected send"));
            }
            if let Some(prefix) = self.slow_prefix
                && body.starts_with(prefix)
            {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.recorder
                .sends
                .lock()
                .unwrap()
                .push((kind, ctx.to.clone(), body));
            Ok(DeliveryReceipt::new("fake", call.to_string()))
        }
    }

    #[async_trait]
    impl ChannelOutboundAdapter for FakeOutbound {
        fn delivery_mode(&self) -> DeliveryMode {
            self.mode
        }

        fn text_chunk_limit(&self) -> usize {
            self.limit
        }

        fn chunk_mode(&self) -> ChunkMode {
            ChunkMode::Text
        }

        fn poll_max_options(&self) -> Option<usize> {
            self.poll_max
        }

        async fn send_text(
            &self,
            ctx: &OutboundContext,
            text: &str,
        ) -> switchboard_channels::Result<DeliveryReceipt> {
            self.record(ctx, SendKind::Text, text.to_string()).await
        }

        async fn send_media(
            &self,
            ctx: &OutboundContext,
            caption: Option<&str>,
            media: &MediaAttachment,
        ) -> switchboard_channels::Result<DeliveryReceipt> {
            let body = format!("{}|{}", caption.unwrap_or_default(), media.url);
            self.record(ctx, SendKind::Media, body).await
        }

        async fn send_poll(
            &self,
            ctx: &OutboundContext,
            poll: &PollPayload,
        ) -> switchboard_channels::Result<DeliveryReceipt> {
            self.record(ctx, SendKind::Poll, poll.question.clone()).await
        }
    }

    fn pipeline(outbound: FakeOutbound, media: bool) -> DeliveryPipeline {
        let mut registry = ChannelRegistry::new();
        registry.register(
            ChannelPlugin::new("fake", "Fake")
                .with_outbound(Arc::new(outbound))
                .with_capabilities(ChannelCapabilities {
                    media,
                    ..Default::default()
                }),
        );
        registry.register(ChannelPlugin::new("mute", "Mute"));
        let mut cfg = SwitchboardConfig::default();
        cfg.channels.insert(
            "fake".into(),
            json!({ "allow_from": ["alice", "bob", "carol"] }),
        );
        cfg.channels.insert("mute".into(), json!({}));
        DeliveryPipeline::new(Arc::new(ChannelManager::new(registry, cfg)))
    }

    fn poll(options: usize) -> PollPayload {
        PollPayload {
            question: "lunch?".into(),
            options: (0..options).map(|i| format!("option {i}")).collect(),
            max_selections: None,
        }
    }

    #[rstest]
    #[case::unknown_channel(DeliveryTarget::new("nope", "alice"))]
    #[case::no_outbound(DeliveryTarget::new("mute", "alice"))]
    #[tokio::test]
    async fn routing_errors_happen_before_any_send(#[case] target: DeliveryTarget) {
        let recorder = Arc::new(Recorder::default());
        let pipeline = pipeline(FakeOutbound::new(&recorder), true);
        let err = pipeline
            .deliver(&target, &ReplyPayload::text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Routing { .. }), "{err}");
        assert!(recorder.sends().is_empty());
    }

    #[tokio::test]
    async fn rejected_target_fails_fast() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = pipeline(FakeOutbound::new(&recorder), true);
        let err = pipeline
            .deliver(&DeliveryTarget::new("fake", "mallory"), &ReplyPayload::text("hi"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Channel(switchboard_channels::Error::TargetNotAllowed { .. })
        ));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversized_poll_is_rejected_not_truncated() {
        let recorder = Arc::new(Recorder::default());
        let mut outbound = FakeOutbound::new(&recorder);
        outbound.poll_max = Some(3);
        let pipeline = pipeline(outbound, true);

        let payload = ReplyPayload::text("vote").with_poll(poll(4));
        let err = pipeline
            .deliver(&DeliveryTarget::new("fake", "alice"), &payload)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PollTooLarge { options: 4, max: 3, .. }));
        assert!(recorder.sends().is_empty());

        let payload = ReplyPayload::text("vote").with_poll(poll(3));
        let report = pipeline
            .deliver(&DeliveryTarget::new("fake", "alice"), &payload)
            .await
            .unwrap();
        assert_eq!(report.status, DeliveryStatus::Delivered);
        assert_eq!(report.outcomes.len(), 2);
    }

    #[tokio::test]
    async fn long_text_is_chunked_in_order() {
        let recorder = Arc::new(Recorder::default());
        let mut outbound = FakeOutbound::new(&recorder);
        outbound.limit = 12;
        let pipeline = pipeline(outbound, true);

        let text = "first line\nsecond line\nthird line";
        let report = pipeline
            .deliver(&DeliveryTarget::new("fake", "bob"), &ReplyPayload::text(text))
            .await
            .unwrap();
        assert_eq!(report.status, DeliveryStatus::Delivered);
        let bodies: Vec<String> = recorder.sends().into_iter().map(|(_, _, b)| b).collect();
        assert!(bodies.len() > 1);
        assert!(bodies.iter().all(|b| b.chars().count() <= 12));
        assert_eq!(bodies.concat(), text);
    }

    #[tokio::test]
    async fn failed_chunk_skips_the_rest_and_reports_partial() {
        let recorder = Arc::new(Recorder::default());
        let mut outbound = FakeOutbound::new(&recorder);
        outbound.limit = 5;
        outbound.fail_call = Some(1);
        let pipeline = pipeline(outbound, true);

        let report = pipeline
            .deliver(&DeliveryTarget::new("fake", "bob"), &ReplyPayload::text("aaaa bbbb cccc"))
            .await
            .unwrap();
        assert_eq!(report.status, DeliveryStatus::Partial);
        assert_eq!(report.outcomes.len(), 3);
        assert!(report.outcomes[0].is_ok());
        assert!(!report.outcomes[1].is_ok());
        assert_eq!(report.outcomes[2].error.as_deref(), Some(SKIPPED_AFTER_FAILURE));
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 2);
    }

    #[rstest]
    #[case::unlimited(0)]
    #[case::chunked(4)]
    #[tokio::test]
    async fn text_is_sent_exactly_as_given(#[case] limit: usize) {
        let recorder = Arc::new(Recorder::default());
        let mut outbound = FakeOutbound::new(&recorder);
        outbound.limit = limit;
        let pipeline = pipeline(outbound, true);

        for text in ["héllo wörld ✓ 日本語\n", "   \n\n"] {
            recorder.sends.lock().unwrap().clear();
            let report = pipeline
                .deliver(&DeliveryTarget::new("fake", "bob"), &ReplyPayload::text(text))
                .await
                .unwrap();
            assert_eq!(report.status, DeliveryStatus::Delivered);
            assert!(!report.outcomes.is_empty());
            let bodies: Vec<String> = recorder.sends().into_iter().map(|(_, _, b)| b).collect();
            assert_eq!(bodies.concat(), text);
        }
    }

    #[tokio::test]
    async fn empty_reply_is_rejected() {
        let recorder = Arc::new(Recorder::default());
        let pipeline = pipeline(FakeOutbound::new(&recorder), true);
        let err = pipeline
            .deliver(&DeliveryTarget::new("fake", "bob"), &ReplyPayload::text(""))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EmptyReply { .. }), "{err}");
        assert_eq!(recorder.calls.load(Ordering::SeqCst), 0);
    }

    #[rstest]
    #[case::direct(DeliveryMode::Direct, false, SendKind::Media, "look|https://x/cat.png")]
    #[case::gateway_with_media(DeliveryMode::Gateway, true, SendKind::Media, "look|https://x/cat.png")]
    #[case::gateway_text_fallback(DeliveryMode::Gateway, false, SendKind::Text, "look\nhttps://x/cat.png")]
    #[case::hybrid_text_fallback(DeliveryMode::Hybrid, false, SendKind::Text, "look\nhttps://x/cat.png")]
    #[tokio::test]
    async fn media_follows_delivery_mode(
        #[case] mode: DeliveryMode,
        #[case] media: bool,
        #[case] kind: SendKind,
        #[case] body: &str,
    ) {
        let recorder = Arc::new(Recorder::default());
        let mut outbound = FakeOutbound::new(&recorder);
        outbound.mode = mode;
        let pipeline = pipeline(outbound, media);

        let payload = ReplyPayload::text("look")
            .with_media(MediaAttachment::new("https://x/cat.png", "image/png"));
        let report = pipeline
            .deliver(&DeliveryTarget::new("fake", "alice"), &payload)
            .await
            .unwrap();
        assert_eq!(report.status, DeliveryStatus::Delivered);
        assert_eq!(recorder.sends(), vec![(kind, "alice".to_string(), body.to_string())]);
    }

    #[tokio::test]
    async fn batch_keeps_per_destination_order() {
        let recorder = Arc::new(Recorder::default());
        let mut outbound = FakeOutbound::new(&recorder);
        outbound.slow_prefix = Some("slow");
        let pipeline = pipeline(outbound, true);

        let items = vec![
            (DeliveryTarget::new("fake", "alice"), ReplyPayload::text("slow 1")),
            (DeliveryTarget::new("fake", "bob"), ReplyPayload::text("fast")),
            (DeliveryTarget::new("fake", "alice"), ReplyPayload::text("quick 2")),
            (DeliveryTarget::new("mute", "alice"), ReplyPayload::text("nowhere")),
        ];
        let results = pipeline.deliver_batch(items).await;
        assert_eq!(results.len(), 4);
        assert!(results[..3].iter().all(Result::is_ok));
        assert!(matches!(results[3], Err(Error::Routing { .. })));
        assert_eq!(results[1].as_ref().unwrap().to, "bob");

        let to_alice: Vec<String> = recorder
            .sends()
            .into_iter()
            .filter(|(_, to, _)| to == "alice")
            .map(|(_, _, body)| body)
            .collect();
        assert_eq!(to_alice, vec!["slow 1", "quick 2"]);
    }
}
