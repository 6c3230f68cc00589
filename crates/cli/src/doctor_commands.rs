//! `switchboard doctor`: config validation, supervisor state and channel
//! health.
//!
//! Prints a report with `[ok]`, `[warn]`, `[fail]` or `[info]` per item and
//! exits non-zero when anything failed.

use std::path::Path;

use {
    anyhow::Result,
    switchboard_channels::StatusIssue,
    switchboard_config::{Severity, SwitchboardConfig, validate},
    switchboard_gateway::{ChannelManager, health_report},
    switchboard_supervisor::{PidStore, ProcessOps, SystemProcessOps, lock_path, resolve_binary},
};

use crate::gateway_commands::{build_registry, config_path, load_config_at};

// ── ANSI helpers ────────────────────────────────────────────────────────────

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Ok,
    Warn,
    Fail,
    Info,
}

impl Status {
    fn label(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warn => "warn",
            Self::Fail => "fail",
            Self::Info => "info",
        }
    }

    fn color(self) -> &'static str {
        match self {
            Self::Ok => GREEN,
            Self::Warn => YELLOW,
            Self::Fail => RED,
            Self::Info => CYAN,
        }
    }

    fn from_severity(severity: Severity) -> Self {
        match severity {
            Severity::Error => Self::Fail,
            Severity::Warning => Self::Warn,
            Severity::Info => Self::Info,
        }
    }
}

struct CheckItem {
    status: Status,
    message: String,
}

struct Section {
    title: String,
    items: Vec<CheckItem>,
}

impl Section {
    fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            items: Vec::new(),
        }
    }

    fn push(&mut self, status: Status, message: impl Into<String>) {
        self.items.push(CheckItem {
            status,
            message: message.into(),
        });
    }
}

fn print_report(sections: &[Section]) -> (usize, usize) {
    let mut errors = 0usize;
    let mut warnings = 0usize;

    for section in sections {
        eprintln!("{BOLD}{}{RESET}", section.title);
        for item in &section.items {
            let color = item.status.color();
            let label = item.status.label();
            eprintln!("  [{color}{label}{RESET}]  {}", item.message);
            match item.status {
                Status::Fail => errors += 1,
                Status::Warn => warnings += 1,
                _ => {},
            }
        }
        eprintln!();
    }

    (errors, warnings)
}

// ── Entry point ─────────────────────────────────────────────────────────────

pub async fn handle_doctor(probe: bool) -> Result<()> {
    let config_path = config_path();
    let state_dir = switchboard_config::state_dir();

    eprintln!("{BOLD}switchboard doctor{RESET}");
    eprintln!("{BOLD}=================={RESET}\n");

    let mut sections = Vec::new();
    let (config, config_section) = check_config(&config_path);
    sections.push(config_section);
    sections.push(check_directories(&state_dir, &switchboard_config::logs_dir()));
    sections.push(check_supervisor(
        &config,
        &config_path,
        &state_dir,
        &SystemProcessOps,
    ));
    sections.push(check_channels(config, probe).await);

    let (errors, warnings) = print_report(&sections);
    eprintln!("{BOLD}Summary:{RESET} {errors} error(s), {warnings} warning(s)");

    if errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}

// ── Config ──────────────────────────────────────────────────────────────────

fn check_config(path: &Path) -> (SwitchboardConfig, Section) {
    let mut section = Section::new(format!("Config ({})", path.display()));

    if !path.exists() {
        section.push(Status::Info, "no config file (using defaults)");
    }
    let config = match load_config_at(path) {
        Ok(config) => config,
        Err(e) => {
            section.push(Status::Fail, format!("{e:#}"));
            return (SwitchboardConfig::default(), section);
        },
    };
    if path.exists() {
        section.push(Status::Ok, "parsed");
    }

    let result = validate(&config);
    if result.diagnostics.is_empty() {
        section.push(Status::Ok, "no problems found");
    }
    for d in &result.diagnostics {
        section.push(
            Status::from_severity(d.severity),
            format!("{}: {}", d.path, d.message),
        );
    }

    (config, section)
}

// ── Directories ─────────────────────────────────────────────────────────────

fn check_directories(state_dir: &Path, logs_dir: &Path) -> Section {
    let mut section = Section::new("Directories");

    for (label, dir) in [("State directory", state_dir), ("Logs directory", logs_dir)] {
        if dir.is_dir() {
            section.push(Status::Ok, format!("{label}: {}", dir.display()));
            check_writable(&mut section, dir, label);
        } else {
            section.push(
                Status::Info,
                format!("{label} missing (created on first start): {}", dir.display()),
            );
        }
    }

    section
}

fn check_writable(section: &mut Section, dir: &Path, label: &str) {
    let probe = dir.join(".switchboard-doctor-probe");
    match std::fs::write(&probe, b"probe") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
        },
        Err(e) => {
            section.push(Status::Fail, format!("{label} is not writable: {e}"));
        },
    }
}

// ── Supervisor ──────────────────────────────────────────────────────────────

fn check_supervisor(
    config: &SwitchboardConfig,
    config_path: &Path,
    state_dir: &Path,
    ops: &dyn ProcessOps,
) -> Section {
    let mut section = Section::new("Supervisor");

    match resolve_binary(config.supervisor.binary.as_deref()) {
        Ok(path) => section.push(Status::Ok, format!("gateway binary: {}", path.display())),
        Err(e) => section.push(Status::Fail, e.to_string()),
    }

    let pids = PidStore::new(state_dir);
    match pids.read() {
        None if pids.path().exists() => {
            section.push(Status::Warn, format!("malformed pid record at {}", pids.path().display()));
        },
        None => section.push(Status::Ok, "no gateway recorded"),
        Some(pid) if ops.is_alive(pid) => {
            section.push(Status::Info, format!("gateway running with pid {pid}"));
        },
        Some(pid) => section.push(
            Status::Warn,
            format!("pid record names exited process {pid} (cleared on next start)"),
        ),
    }

    let lock = lock_path(config_path);
    if lock.exists() {
        section.push(Status::Info, format!("lock present: {}", lock.display()));
    } else {
        section.push(Status::Ok, format!("no lock at {}", lock.display()));
    }

    section
}

// ── Channels ────────────────────────────────────────────────────────────────

fn push_issue(section: &mut Section, issue: &StatusIssue) {
    let scope = match &issue.account_id {
        Some(account_id) => format!("{}/{account_id}", issue.channel),
        None => issue.channel.clone(),
    };
    let mut message = format!("{scope}: {}: {}", issue.label, issue.detail);
    if let Some(fix) = &issue.fix {
        message.push_str(&format!(" (fix: {fix})"));
    }
    section.push(Status::from_severity(issue.severity), message);
}

async fn check_channels(config: SwitchboardConfig, probe: bool) -> Section {
    let mut section = Section::new("Channels");
    let manager = ChannelManager::new(build_registry(), config);
    let accounts = manager.refresh().await;
    if probe {
        manager.start_all().await;
    }

    let report = health_report(&manager, probe).await;
    if probe {
        manager.stop_all().await;
    }

    if accounts.is_empty() {
        section.push(Status::Info, "no channel accounts configured");
    }
    for snap in &accounts {
        section.push(
            Status::Info,
            format!("{}/{}: {:?}", snap.channel, snap.account_id, snap.state).to_lowercase(),
        );
    }
    for issue in &report.issues {
        push_issue(&mut section, issue);
    }
    if report.ok && !accounts.is_empty() {
        section.push(Status::Ok, "no channel errors");
    }

    section
}

#[cfg(test)]
mod tests {
    use {super::*, std::io};

    struct Alive(bool);

    impl ProcessOps for Alive {
        fn is_alive(&self, _pid: u32) -> bool {
            self.0
        }

        fn terminate(&self, _pid: u32) -> io::Result<()> {
            Ok(())
        }

        fn kill_tree(&self, _pid: u32) -> io::Result<()> {
            Ok(())
        }
    }

    fn statuses(section: &Section) -> Vec<Status> {
        section.items.iter().map(|i| i.status).collect()
    }

    #[test]
    fn print_report_counts_errors_and_warnings() {
        let mut section = Section::new("test");
        section.push(Status::Ok, "fine");
        section.push(Status::Warn, "caution");
        section.push(Status::Warn, "caution2");
        section.push(Status::Fail, "broken");
        section.push(Status::Info, "note");

        let (errors, warnings) = print_report(&[section]);
        assert_eq!(errors, 1);
        assert_eq!(warnings, 2);
    }

    #[test]
    fn missing_config_is_informational() {
        let dir = tempfile::tempdir().unwrap();
        let (_, section) = check_config(&dir.path().join("switchboard.toml"));
        assert!(!statuses(&section).contains(&Status::Fail));
        assert_eq!(section.items[0].status, Status::Info);
    }

    #[test]
    fn unparsable_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();
        let (config, section) = check_config(&path);
        assert!(statuses(&section).contains(&Status::Fail));
        assert_eq!(config.server.port, SwitchboardConfig::default().server.port);
    }

    #[test]
    fn directories_report_writability() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        let section = check_directories(dir.path(), &logs);
        assert_eq!(statuses(&section), vec![Status::Ok, Status::Info]);
    }

    #[test]
    fn exited_gateway_record_warns() {
        let dir = tempfile::tempdir().unwrap();
        PidStore::new(dir.path()).write(5150).unwrap();
        let config = SwitchboardConfig::default();
        let config_path = dir.path().join("switchboard.toml");

        let dead = check_supervisor(&config, &config_path, dir.path(), &Alive(false));
        assert!(dead.items.iter().any(|i| i.status == Status::Warn && i.message.contains("5150")));

        let live = check_supervisor(&config, &config_path, dir.path(), &Alive(true));
        assert!(live.items.iter().any(|i| i.message.contains("running with pid 5150")));
    }

    #[tokio::test]
    async fn channels_without_config_are_informational() {
        let section = check_channels(SwitchboardConfig::default(), false).await;
        assert_eq!(statuses(&section), vec![Status::Info]);
    }

    #[tokio::test]
    async fn configured_log_channel_is_listed() {
        let mut config = SwitchboardConfig::default();
        config
            .channels
            .insert("log".into(), serde_json::json!({ "enabled": true }));
        let section = check_channels(config, true).await;
        assert!(
            section
                .items
                .iter()
                .any(|i| i.message.starts_with("log/default")),
            "{:?}",
            section.items.iter().map(|i| &i.message).collect::<Vec<_>>()
        );
        assert!(!statuses(&section).contains(&Status::Fail));
    }
}
