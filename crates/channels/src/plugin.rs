use std::sync::Arc;

use {
    serde::{Deserialize, Serialize},
    switchboard_common::types::ChatType,
};

use crate::adapter::{
    ChannelAuthAdapter, ChannelCommandAdapter, ChannelConfigAdapter, ChannelDirectoryAdapter,
    ChannelElevatedAdapter, ChannelGatewayAdapter, ChannelGroupAdapter, ChannelHeartbeatAdapter,
    ChannelOutboundAdapter, ChannelPairingAdapter, ChannelResolverAdapter, ChannelSecurityAdapter,
    ChannelSetupAdapter, ChannelStatusAdapter,
};

/// Identity of a chat backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMeta {
    /// Channel identifier (e.g. "telegram", "slack").
    pub id: String,
    /// Human-readable channel name.
    pub label: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub blurb: String,
    /// Alternative ids accepted by the registry.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

/// What the backend can carry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelCapabilities {
    pub chat_types: Vec<ChatType>,
    pub media: bool,
    pub polls: bool,
    pub reactions: bool,
    pub threads: bool,
    pub native_commands: bool,
}

/// A chat backend and the capability groups it implements.
///
/// Every group is optional. An absent group means the backend does not
/// support that behavior; callers check presence before dispatching.
#[derive(Clone)]
pub struct ChannelPlugin {
    pub meta: ChannelMeta,
    pub capabilities: ChannelCapabilities,
    pub setup: Option<Arc<dyn ChannelSetupAdapter>>,
    pub config: Option<Arc<dyn ChannelConfigAdapter>>,
    pub group: Option<Arc<dyn ChannelGroupAdapter>>,
    pub outbound: Option<Arc<dyn ChannelOutboundAdapter>>,
    pub status: Option<Arc<dyn ChannelStatusAdapter>>,
    pub gateway: Option<Arc<dyn ChannelGatewayAdapter>>,
    pub auth: Option<Arc<dyn ChannelAuthAdapter>>,
    pub heartbeat: Option<Arc<dyn ChannelHeartbeatAdapter>>,
    pub directory: Option<Arc<dyn ChannelDirectoryAdapter>>,
    pub resolver: Option<Arc<dyn ChannelResolverAdapter>>,
    pub elevated: Option<Arc<dyn ChannelElevatedAdapter>>,
    pub commands: Option<ChannelCommandAdapter>,
    pub security: Option<Arc<dyn ChannelSecurityAdapter>>,
    pub pairing: Option<Arc<dyn ChannelPairingAdapter>>,
}

impl ChannelPlugin {
    /// A plugin with no capability groups.
    #[must_use]
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            meta: ChannelMeta {
                id: id.into(),
                label: label.into(),
                blurb: String::new(),
                aliases: Vec::new(),
            },
            capabilities: ChannelCapabilities::default(),
            setup: None,
            config: None,
            group: None,
            outbound: None,
            status: None,
            gateway: None,
            auth: None,
            heartbeat: None,
            directory: None,
            resolver: None,
            elevated: None,
            commands: None,
            security: None,
            pairing: None,
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.meta.id
    }

    #[must_use]
    pub fn with_blurb(mut self, blurb: impl Into<String>) -> Self {
        self.meta.blurb = blurb.into();
        self
    }

    #[must_use]
    pub fn with_aliases(mut self, aliases: &[&str]) -> Self {
        self.meta.aliases = aliases.iter().map(|a| (*a).to_string()).collect();
        self
    }

    #[must_use]
    pub fn with_capabilities(mut self, capabilities: ChannelCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    #[must_use]
    pub fn with_setup(mut self, adapter: Arc<dyn ChannelSetupAdapter>) -> Self {
        self.setup = Some(adapter);
        self
    }

    #[must_use]
    pub fn with_config(mut self, adapter: Arc<dyn ChannelConfigAdapter>) -> Self {
        self.config = Some(adapter);
        self
    }

    #[must_use]
    pub fn with_group(mut self, adapter: Arc<dyn ChannelGroupAdapter>) -> Self {
        self.group = Some(adapter);
        self
    }

    #[must_use]
    pub fn with_outbound(mut self, adapter: Arc<dyn ChannelOutboundAdapter>) -> Self {
        self.outbound = Some(adapter);
        self
    }

    #[must_use]
    pub fn with_status(mut self, adapter: Arc<dyn ChannelStatusAdapter>) -> Self {
        self.status = Some(adapter);
        self
    }

    #[must_use]
    pub fn with_gateway(mut self, adapter: Arc<dyn ChannelGatewayAdapter>) -> Self {
        self.gateway = Some(adapter);
        self
    }

    #[must_use]
    pub fn with_auth(mut self, adapter: Arc<dyn ChannelAuthAdapter>) -> Self {
        self.auth = Some(adapter);
        self
    }

    #[must_use]
    pub fn with_heartbeat(mut self, adapter: Arc<dyn ChannelHeartbeatAdapter>) -> Self {
        self.heartbeat = Some(adapter);
        self
    }

    #[must_use]
    pub fn with_directory(mut self, adapter: Arc<dyn ChannelDirectoryAdapter>) -> Self {
        self.directory = Some(adapter);
        self
    }

    #[must_use]
    pub fn with_resolver(mut self, adapter: Arc<dyn ChannelResolverAdapter>) -> Self {
        self.resolver = Some(adapter);
        self
    }

    #[must_use]
    pub fn with_elevated(mut self, adapter: Arc<dyn ChannelElevatedAdapter>) -> Self {
        self.elevated = Some(adapter);
        self
    }

    #[must_use]
    pub fn with_commands(mut self, flags: ChannelCommandAdapter) -> Self {
        self.commands = Some(flags);
        self
    }

    #[must_use]
    pub fn with_security(mut self, adapter: Arc<dyn ChannelSecurityAdapter>) -> Self {
        self.security = Some(adapter);
        self
    }

    #[must_use]
    pub fn with_pairing(mut self, adapter: Arc<dyn ChannelPairingAdapter>) -> Self {
        self.pairing = Some(adapter);
        self
    }

    /// Names of the capability groups this plugin implements.
    #[must_use]
    pub fn adapter_groups(&self) -> Vec<&'static str> {
        [
            ("setup", self.setup.is_some()),
            ("config", self.config.is_some()),
            ("group", self.group.is_some()),
            ("outbound", self.outbound.is_some()),
            ("status", self.status.is_some()),
            ("gateway", self.gateway.is_some()),
            ("auth", self.auth.is_some()),
            ("heartbeat", self.heartbeat.is_some()),
            ("directory", self.directory.is_some()),
            ("resolver", self.resolver.is_some()),
            ("elevated", self.elevated.is_some()),
            ("commands", self.commands.is_some()),
            ("security", self.security.is_some()),
            ("pairing", self.pairing.is_some()),
        ]
        .into_iter()
        .filter_map(|(name, present)| present.then_some(name))
        .collect()
    }
}

impl std::fmt::Debug for ChannelPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPlugin")
            .field("meta", &self.meta)
            .field("capabilities", &self.capabilities)
            .field("groups", &self.adapter_groups())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::config_section::SectionConfigAdapter};

    #[test]
    fn empty_plugin_has_no_groups() {
        let plugin = ChannelPlugin::new("irc", "IRC");
        assert!(plugin.adapter_groups().is_empty());
        assert_eq!(plugin.id(), "irc");
    }

    #[test]
    fn builders_register_groups() {
        let plugin = ChannelPlugin::new("irc", "IRC")
            .with_aliases(&["libera"])
            .with_config(Arc::new(SectionConfigAdapter::new("irc")))
            .with_commands(ChannelCommandAdapter {
                enforce_owner_for_commands: true,
                skip_when_config_empty: false,
            });
        assert_eq!(plugin.adapter_groups(), vec!["config", "commands"]);
        assert_eq!(plugin.meta.aliases, vec!["libera"]);
        let debug = format!("{plugin:?}");
        assert!(debug.contains("commands"));
    }
}
