//! Configuration sanity checks.
//!
//! Catches settings that parse but cannot work, such as channel sections
//! that are not tables or supervisor windows of zero length.

use std::path::PathBuf;

use crate::schema::SwitchboardConfig;

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Info => write!(f, "info"),
        }
    }
}

/// A single validation diagnostic.
#[derive(Debug, Clone, serde::Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Dotted path, e.g. "supervisor.stop_grace_ms"
    pub path: String,
    pub message: String,
}

/// Result of validating a configuration.
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub diagnostics: Vec<Diagnostic>,
    pub config_path: Option<PathBuf>,
}

impl ValidationResult {
    /// Returns `true` if any diagnostic is an error.
    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    /// Count diagnostics by severity.
    #[must_use]
    pub fn count(&self, severity: Severity) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity == severity)
            .count()
    }

    fn push(&mut self, severity: Severity, path: impl Into<String>, message: impl Into<String>) {
        self.diagnostics.push(Diagnostic {
            severity,
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Validate a loaded config.
#[must_use]
pub fn validate(config: &SwitchboardConfig) -> ValidationResult {
    let mut result = ValidationResult::default();

    if config.server.bind.trim().is_empty() {
        result.push(Severity::Error, "server.bind", "bind address is empty");
    }
    if config.server.port == 0 {
        result.push(
            Severity::Info,
            "server.port",
            "port 0: a free port is allocated on every start",
        );
    }

    let sup = &config.supervisor;
    if sup.stop_grace_ms == 0 {
        result.push(
            Severity::Warning,
            "supervisor.stop_grace_ms",
            "zero grace window: the gateway is always force-killed on stop",
        );
    }
    if sup.startup_timeout_ms == Some(0) {
        result.push(
            Severity::Error,
            "supervisor.startup_timeout_ms",
            "startup timeout of 0 can never succeed",
        );
    }
    if sup.tail_capacity == 0 {
        result.push(
            Severity::Warning,
            "supervisor.tail_capacity",
            "stderr tail disabled: startup failures carry no diagnostics",
        );
    }

    for (id, section) in &config.channels {
        let path = format!("channels.{id}");
        let Some(obj) = section.as_object() else {
            result.push(Severity::Error, path, "channel section must be a table");
            continue;
        };
        if let Some(accounts) = obj.get("accounts")
            && !accounts.is_object()
        {
            result.push(
                Severity::Error,
                format!("{path}.accounts"),
                "accounts must be a table keyed by account id",
            );
        }
        if let Some(enabled) = obj.get("enabled")
            && !enabled.is_boolean()
        {
            result.push(Severity::Warning, format!("{path}.enabled"), "expected a boolean");
        }
    }

    result
}
