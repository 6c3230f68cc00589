use std::{collections::BTreeMap, sync::Arc};

use tracing::{debug, warn};

use crate::plugin::ChannelPlugin;

/// Registry of all loaded channel plugins.
#[derive(Debug, Default, Clone)]
pub struct ChannelRegistry {
    plugins: BTreeMap<String, Arc<ChannelPlugin>>,
    aliases: BTreeMap<String, String>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin. A later plugin with the same id replaces the
    /// earlier one.
    pub fn register(&mut self, plugin: ChannelPlugin) {
        let id = plugin.id().to_lowercase();
        for alias in &plugin.meta.aliases {
            let alias = alias.to_lowercase();
            if alias != id {
                self.aliases.insert(alias, id.clone());
            }
        }
        if self.plugins.contains_key(&id) {
            warn!(channel = %id, "replacing already registered channel plugin");
        }
        debug!(channel = %id, groups = ?plugin.adapter_groups(), "registered channel plugin");
        self.plugins.insert(id, Arc::new(plugin));
    }

    /// Look up a plugin by id or alias, case-insensitively.
    pub fn get(&self, id: &str) -> Option<Arc<ChannelPlugin>> {
        let key = id.trim().to_lowercase();
        let key = self.aliases.get(&key).unwrap_or(&key);
        self.plugins.get(key).cloned()
    }

    pub fn list(&self) -> Vec<&str> {
        self.plugins.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ChannelPlugin>> {
        self.plugins.values()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_by_id_and_alias() {
        let mut registry = ChannelRegistry::new();
        registry.register(ChannelPlugin::new("Telegram", "Telegram").with_aliases(&["tg"]));
        registry.register(ChannelPlugin::new("slack", "Slack"));

        assert_eq!(registry.list(), vec!["slack", "telegram"]);
        assert!(registry.get("telegram").is_some());
        assert_eq!(registry.get("TG").unwrap().meta.label, "Telegram");
        assert!(registry.get("discord").is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn re_register_replaces() {
        let mut registry = ChannelRegistry::new();
        registry.register(ChannelPlugin::new("irc", "IRC"));
        registry.register(ChannelPlugin::new("irc", "IRC v2"));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("irc").unwrap().meta.label, "IRC v2");
    }
}
