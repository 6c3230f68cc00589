//! Generic reading of `channels.<id>` config sections.
//!
//! Layout convention:
//!
//! ```toml
//! [channels.telegram]
//! enabled = true
//! allow_from = ["alice"]
//!
//! [channels.telegram.accounts.work]
//! token = "..."
//! ```
//!
//! Top-level keys act as defaults for every account. A section without an
//! `accounts` table is a single `default` account.

use {
    async_trait::async_trait,
    serde_json::{Map, Value},
    switchboard_config::SwitchboardConfig,
};

use crate::{Error, Result, adapter::ChannelConfigAdapter, types::ResolvedAccount};

pub const DEFAULT_ACCOUNT_ID: &str = "default";

/// Lowercase, map anything outside `[a-z0-9_-]` to `-`; blank means default.
#[must_use]
pub fn normalize_account_id(input: Option<&str>) -> String {
    let raw = input.map(str::trim).unwrap_or_default();
    if raw.is_empty() {
        return DEFAULT_ACCOUNT_ID.to_string();
    }
    raw.chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn section<'a>(cfg: &'a SwitchboardConfig, channel: &str) -> Option<&'a Map<String, Value>> {
    cfg.channel_section(channel).and_then(Value::as_object)
}

fn accounts(section: &Map<String, Value>) -> Option<&Map<String, Value>> {
    section.get("accounts").and_then(Value::as_object)
}

/// `enabled` defaults to true when absent.
#[must_use]
pub fn is_enabled_flag(value: &Value) -> bool {
    value.get("enabled").and_then(Value::as_bool).unwrap_or(true)
}

#[must_use]
pub fn is_section_enabled(cfg: &SwitchboardConfig, channel: &str) -> bool {
    cfg.channel_section(channel).is_some_and(is_enabled_flag)
}

/// Account ids configured for `channel`, sorted.
#[must_use]
pub fn list_account_ids(cfg: &SwitchboardConfig, channel: &str) -> Vec<String> {
    let Some(section) = section(cfg, channel) else {
        return Vec::new();
    };
    match accounts(section) {
        Some(map) if !map.is_empty() => {
            let mut ids: Vec<String> = map.keys().cloned().collect();
            ids.sort();
            ids
        },
        _ => vec![DEFAULT_ACCOUNT_ID.to_string()],
    }
}

/// Merge the section defaults under the account's overrides.
pub fn resolve_account(
    cfg: &SwitchboardConfig,
    channel: &str,
    account_id: &str,
) -> Result<ResolvedAccount> {
    let section = section(cfg, channel).ok_or_else(|| Error::unknown_account(account_id))?;

    let mut merged: Map<String, Value> = section
        .iter()
        .filter(|(k, _)| k.as_str() != "accounts")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    match accounts(section).filter(|m| !m.is_empty()) {
        Some(map) => {
            let overrides = map
                .get(account_id)
                .ok_or_else(|| Error::unknown_account(account_id))?;
            let overrides = overrides.as_object().ok_or_else(|| {
                Error::invalid_input(format!("channels.{channel}.accounts.{account_id} is not a table"))
            })?;
            for (k, v) in overrides {
                merged.insert(k.clone(), v.clone());
            }
        },
        None if account_id != DEFAULT_ACCOUNT_ID => return Err(Error::unknown_account(account_id)),
        None => {},
    }

    let config = Value::Object(merged);
    let enabled = is_section_enabled(cfg, channel) && is_enabled_flag(&config);
    let name = config
        .get("name")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(ResolvedAccount {
        channel: channel.to_string(),
        account_id: account_id.to_string(),
        name,
        enabled,
        config,
    })
}

/// `allow_from` / `allowFrom` entries; numbers are accepted as ids.
#[must_use]
pub fn allow_from(config: &Value) -> Vec<String> {
    let list = config
        .get("allow_from")
        .or_else(|| config.get("allowFrom"))
        .and_then(Value::as_array);
    list.map(|items| {
        items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.clone()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .collect()
    })
    .unwrap_or_default()
}

/// Return `channels.<channel>` with `key` set for `account_id`.
///
/// Writes top-level for the default account of a section without an
/// `accounts` table, otherwise under `accounts.<account_id>`.
#[must_use]
pub fn set_account_field(
    cfg: &SwitchboardConfig,
    channel: &str,
    account_id: &str,
    key: &str,
    value: Value,
) -> Value {
    let mut section = section(cfg, channel).cloned().unwrap_or_default();
    let has_accounts = accounts(&section).is_some_and(|m| !m.is_empty());

    if !has_accounts && account_id == DEFAULT_ACCOUNT_ID {
        section.insert(key.to_string(), value);
        return Value::Object(section);
    }

    let accounts = section
        .entry("accounts")
        .or_insert_with(|| Value::Object(Map::new()));
    if !accounts.is_object() {
        *accounts = Value::Object(Map::new());
    }
    if let Value::Object(accounts) = accounts {
        let entry = accounts
            .entry(account_id.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(entry) = entry {
            entry.insert(key.to_string(), value);
        }
    }
    Value::Object(section)
}

/// Config adapter driven purely by the section layout.
///
/// Used for plugins that ship no Config group. An account counts as
/// configured when every key in `required` is present and non-empty.
#[derive(Debug, Clone)]
pub struct SectionConfigAdapter {
    channel: String,
    required: Vec<String>,
}

impl SectionConfigAdapter {
    #[must_use]
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            required: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_required(mut self, keys: &[&str]) -> Self {
        self.required = keys.iter().map(|k| (*k).to_string()).collect();
        self
    }
}

#[async_trait]
impl ChannelConfigAdapter for SectionConfigAdapter {
    fn list_account_ids(&self, cfg: &SwitchboardConfig) -> Vec<String> {
        list_account_ids(cfg, &self.channel)
    }

    fn resolve_account(&self, cfg: &SwitchboardConfig, account_id: &str) -> Result<ResolvedAccount> {
        resolve_account(cfg, &self.channel, account_id)
    }

    async fn is_configured(
        &self,
        account: &ResolvedAccount,
        _cfg: &SwitchboardConfig,
    ) -> Result<bool> {
        Ok(self.required.iter().all(|key| match account.config.get(key) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.trim().is_empty(),
            Some(_) => true,
        }))
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest, serde_json::json};

    fn cfg_with(channel: &str, section: Value) -> SwitchboardConfig {
        let mut cfg = SwitchboardConfig::default();
        cfg.channels.insert(channel.into(), section);
        cfg
    }

    #[rstest]
    #[case(None, "default")]
    #[case(Some("  "), "default")]
    #[case(Some("Work"), "work")]
    #[case(Some("my bot!"), "my-bot-")]
    #[case(Some("team_a-1"), "team_a-1")]
    fn account_id_normalization(#[case] input: Option<&str>, #[case] expected: &str) {
        assert_eq!(normalize_account_id(input), expected);
    }

    #[test]
    fn single_account_section() {
        let cfg = cfg_with("irc", json!({ "server": "irc.libera.chat", "allow_from": ["#rust"] }));
        assert_eq!(list_account_ids(&cfg, "irc"), vec!["default"]);
        let account = resolve_account(&cfg, "irc", "default").unwrap();
        assert!(account.enabled);
        assert_eq!(account.config["server"], "irc.libera.chat");
        assert!(matches!(
            resolve_account(&cfg, "irc", "other"),
            Err(Error::UnknownAccount { .. })
        ));
    }

    #[test]
    fn accounts_inherit_section_defaults() {
        let cfg = cfg_with(
            "telegram",
            json!({
                "allowFrom": [42],
                "accounts": {
                    "work": { "token": "w", "name": "Work bot" },
                    "home": { "token": "h", "enabled": false, "allowFrom": ["bob"] }
                }
            }),
        );
        assert_eq!(list_account_ids(&cfg, "telegram"), vec!["home", "work"]);

        let work = resolve_account(&cfg, "telegram", "work").unwrap();
        assert_eq!(work.name.as_deref(), Some("Work bot"));
        assert_eq!(allow_from(&work.config), vec!["42"]);
        assert!(work.config.get("accounts").is_none());

        let home = resolve_account(&cfg, "telegram", "home").unwrap();
        assert!(!home.enabled);
        assert_eq!(allow_from(&home.config), vec!["bob"]);
    }

    #[test]
    fn disabled_section_disables_accounts() {
        let cfg = cfg_with("slack", json!({ "enabled": false, "accounts": { "a": {} } }));
        assert!(!resolve_account(&cfg, "slack", "a").unwrap().enabled);
        assert!(list_account_ids(&SwitchboardConfig::default(), "slack").is_empty());
    }

    #[test]
    fn set_field_top_level_or_account() {
        let cfg = cfg_with("irc", json!({ "server": "s" }));
        let updated = set_account_field(&cfg, "irc", "default", "name", json!("Main"));
        assert_eq!(updated["name"], "Main");

        let updated = set_account_field(&cfg, "irc", "second", "name", json!("Alt"));
        assert_eq!(updated["accounts"]["second"]["name"], "Alt");
        assert_eq!(updated["server"], "s");
    }

    #[tokio::test]
    async fn section_adapter_checks_required_keys() {
        let cfg = cfg_with("matrix", json!({ "accounts": { "a": { "token": "" }, "b": { "token": "x" } } }));
        let adapter = SectionConfigAdapter::new("matrix").with_required(&["token"]);
        let a = adapter.resolve_account(&cfg, "a").unwrap();
        let b = adapter.resolve_account(&cfg, "b").unwrap();
        assert!(!adapter.is_configured(&a, &cfg).await.unwrap());
        assert!(adapter.is_configured(&b, &cfg).await.unwrap());
        assert_eq!(adapter.default_account_id(&cfg), "a");
    }
}
