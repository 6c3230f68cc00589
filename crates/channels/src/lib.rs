//! Channel adapter contract.
//!
//! Each chat backend (Telegram, Slack, WhatsApp, IRC, ...) is a
//! [`ChannelPlugin`] holding whichever capability groups it supports:
//! setup, config, group policy, outbound delivery, status, gateway
//! lifecycle, auth, heartbeat, directory, resolver, and the access-control
//! groups.

pub mod adapter;
pub mod chunk;
pub mod config_section;
pub mod error;
pub mod gating;
pub mod plugin;
pub mod registry;
pub mod types;

pub use {
    adapter::{
        AccountStatusHandle, ChannelAuthAdapter, ChannelCommandAdapter, ChannelConfigAdapter,
        ChannelDirectoryAdapter, ChannelElevatedAdapter, ChannelGatewayAdapter, ChannelGroupAdapter,
        ChannelHeartbeatAdapter, ChannelLogSink, ChannelOutboundAdapter, ChannelPairingAdapter,
        ChannelResolverAdapter, ChannelSecurityAdapter, ChannelSetupAdapter, ChannelSetupInput,
        ChannelStatusAdapter, DirectoryQuery, DmPolicyResolution, GatewayContext, GroupContext,
        GroupToolPolicy, HeartbeatReadiness, HeartbeatRecipients, LogoutResult, OutboundContext,
        ProbeResult, QrLoginStart, QrLoginWait, ResolvedTarget, TracingLogSink,
    },
    error::{Error, Result},
    plugin::{ChannelCapabilities, ChannelMeta, ChannelPlugin},
    registry::ChannelRegistry,
    types::{
        ChannelAccountSnapshot, ChannelAccountState, ChannelDirectoryEntry, ChunkMode,
        DeliveryMode, DeliveryReceipt, DirectoryEntryKind, ResolvedAccount, SelfIdentity,
        Severity, StatusIssue,
    },
};
