use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Check if a peer is allowed to interact with the bot.
///
/// An empty allowlist means everyone is allowed (open policy).
/// Entries are matched case-insensitively against the peer ID.
/// Supports exact match and glob-style `*` wildcards.
pub fn is_allowed(peer_id: &str, allowlist: &[String]) -> bool {
    if allowlist.is_empty() {
        return true;
    }
    let peer_lower = peer_id.to_lowercase();
    allowlist.iter().any(|pattern| {
        let pat = pattern.trim().to_lowercase();
        if pat.contains('*') {
            glob_match(&pat, &peer_lower)
        } else {
            pat == peer_lower
        }
    })
}

/// Simple glob matching supporting `*` as a wildcard for any sequence of chars.
fn glob_match(pattern: &str, text: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == text;
    }

    let mut pos = 0;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        match text[pos..].find(part) {
            Some(idx) => {
                // First segment must match at start
                if i == 0 && idx != 0 {
                    return false;
                }
                pos += idx + part.len();
            },
            None => return false,
        }
    }
    // Last segment must match at end (unless pattern ends with *)
    if !parts.last().unwrap_or(&"").is_empty() {
        text.ends_with(parts.last().unwrap_or(&""))
    } else {
        true
    }
}

/// Trim entries, drop blanks and duplicates, keep order.
#[must_use]
pub fn normalize_allow_from(entries: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(entries.len());
    for entry in entries {
        let entry = entry.trim();
        if entry.is_empty() || out.iter().any(|e| e.eq_ignore_ascii_case(entry)) {
            continue;
        }
        out.push(entry.to_string());
    }
    out
}

/// Resolve a logical "to" against an allow-list.
///
/// With no explicit target, a single concrete allow-list entry is used as
/// the implicit destination. A target that no entry matches is rejected.
pub fn resolve_target(to: Option<&str>, allow_from: &[String]) -> Result<String> {
    let allow_from = normalize_allow_from(allow_from);
    let target = match to.map(str::trim).filter(|t| !t.is_empty()) {
        Some(t) => t.to_string(),
        None => match allow_from.as_slice() {
            [only] if !only.contains('*') => only.clone(),
            _ => return Err(Error::invalid_input("missing delivery target")),
        },
    };

    if is_allowed(&target, &allow_from) {
        Ok(target)
    } else {
        Err(Error::target_not_allowed(target))
    }
}

/// Mention activation mode for group chats.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MentionMode {
    /// Bot must be @mentioned to respond.
    #[default]
    Mention,
    /// Bot responds to all messages.
    Always,
    /// Bot does not respond in groups.
    None,
}

/// DM access policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    /// Anyone can DM the bot.
    Open,
    /// Only users on the allowlist.
    #[default]
    Allowlist,
    /// Unknown senders must complete pairing before they are answered.
    Pairing,
    /// DMs disabled.
    Disabled,
}

/// Group access policy.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// Bot responds in all groups.
    #[default]
    Open,
    /// Only in groups on the allowlist.
    Allowlist,
    /// Groups disabled.
    Disabled,
}
