use std::{
    path::{Path, PathBuf},
    sync::RwLock,
};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::SwitchboardConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "switchboard.toml",
    "switchboard.yaml",
    "switchboard.yml",
    "switchboard.json",
];

static CONFIG_DIR_OVERRIDE: RwLock<Option<PathBuf>> = RwLock::new(None);
static DATA_DIR_OVERRIDE: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Override the config directory (CLI `--config-dir`).
pub fn set_config_dir(dir: PathBuf) {
    if let Ok(mut guard) = CONFIG_DIR_OVERRIDE.write() {
        *guard = Some(dir);
    }
}

pub fn clear_config_dir() {
    if let Ok(mut guard) = CONFIG_DIR_OVERRIDE.write() {
        *guard = None;
    }
}

/// Override the data directory (CLI `--data-dir`).
pub fn set_data_dir(dir: PathBuf) {
    if let Ok(mut guard) = DATA_DIR_OVERRIDE.write() {
        *guard = Some(dir);
    }
}

pub fn clear_data_dir() {
    if let Ok(mut guard) = DATA_DIR_OVERRIDE.write() {
        *guard = None;
    }
}

fn override_of(lock: &RwLock<Option<PathBuf>>) -> Option<PathBuf> {
    lock.read().ok().and_then(|guard| guard.clone())
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("", "", "switchboard")
}

/// Returns the config directory: the override, else `~/.config/switchboard/`.
pub fn config_dir() -> Option<PathBuf> {
    override_of(&CONFIG_DIR_OVERRIDE).or_else(|| project_dirs().map(|d| d.config_dir().to_path_buf()))
}

/// Returns the data directory: the override, else the platform data dir.
pub fn data_dir() -> PathBuf {
    override_of(&DATA_DIR_OVERRIDE)
        .or_else(|| project_dirs().map(|d| d.data_dir().to_path_buf()))
        .unwrap_or_else(|| PathBuf::from(".switchboard"))
}

/// Directory holding runtime state such as `gateway.pid`.
pub fn state_dir() -> PathBuf {
    data_dir()
}

/// Directory the gateway child writes its logs to.
pub fn logs_dir() -> PathBuf {
    state_dir().join("logs")
}

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<SwitchboardConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Load the config file as a JSON value, after env substitution.
pub fn load_config_value(path: &Path) -> anyhow::Result<serde_json::Value> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config_value(&raw, path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./switchboard.{toml,yaml,yml,json}` (project-local)
/// 2. `<config dir>/switchboard.{toml,yaml,yml,json}`
///
/// Returns `SwitchboardConfig::default()` if no config file is found or it
/// fails to parse.
pub fn discover_and_load() -> SwitchboardConfig {
    if let Some(path) = find_config_file() {
        debug!(path = %path.display(), "loading config");
        match load_config(&path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            },
        }
    } else {
        debug!("no config file found, using defaults");
    }
    SwitchboardConfig::default()
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    // An explicit config dir wins over the working directory.
    if let Some(dir) = override_of(&CONFIG_DIR_OVERRIDE) {
        return first_existing(&dir);
    }

    first_existing(Path::new(".")).or_else(|| project_dirs().and_then(|d| first_existing(d.config_dir())))
}

fn first_existing(dir: &Path) -> Option<PathBuf> {
    CONFIG_FILENAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
}

/// Returns the path of an existing config file, or the default TOML path.
///
/// The result is absolute when the current directory is known, since the
/// singleton lock is keyed by this path.
pub fn find_or_default_config_path() -> PathBuf {
    let path = find_config_file().unwrap_or_else(|| {
        config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("switchboard.toml")
    });
    std::path::absolute(&path).unwrap_or(path)
}

/// Serialize `config` to TOML and write it to the config path.
///
/// Creates parent directories if needed. Returns the path written to.
pub fn save_config(config: &SwitchboardConfig) -> anyhow::Result<PathBuf> {
    let path = find_or_default_config_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str =
        toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("serialize config: {e}"))?;
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, toml_str)?;
    std::fs::rename(&tmp, &path)?;
    debug!(path = %path.display(), "saved config");
    Ok(path)
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<SwitchboardConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

fn parse_config_value(raw: &str, path: &Path) -> anyhow::Result<serde_json::Value> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => {
            let v: toml::Value = toml::from_str(raw)?;
            Ok(serde_json::to_value(v)?)
        },
        "yaml" | "yml" => {
            let v: serde_yaml::Value = serde_yaml::from_str(raw)?;
            Ok(serde_json::to_value(v)?)
        },
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.toml");
        std::fs::write(&path, "[server]\nport = 4000\n").unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.server.port, 4000);
    }

    #[test]
    fn load_yaml_and_json_files() {
        let dir = tempfile::tempdir().unwrap();

        let yaml = dir.path().join("switchboard.yaml");
        std::fs::write(&yaml, "server:\n  bind: 0.0.0.0\n").unwrap();
        assert_eq!(load_config(&yaml).unwrap().server.bind, "0.0.0.0");

        let json = dir.path().join("switchboard.json");
        std::fs::write(&json, r#"{"channels":{"irc":{"enabled":false}}}"#).unwrap();
        let cfg = load_config(&json).unwrap();
        assert_eq!(cfg.channels["irc"]["enabled"], false);
    }

    #[test]
    fn unsupported_extension_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.ini");
        std::fs::write(&path, "port=1").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn load_config_value_converts_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("switchboard.toml");
        std::fs::write(&path, "[channels.slack]\nenabled = true\n").unwrap();
        let value = load_config_value(&path).unwrap();
        assert_eq!(value["channels"]["slack"]["enabled"], true);
    }

    #[test]
    fn first_existing_respects_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("switchboard.json"), "{}").unwrap();
        std::fs::write(dir.path().join("switchboard.toml"), "").unwrap();
        let found = first_existing(dir.path()).unwrap();
        assert!(found.ends_with("switchboard.toml"));
    }
}
