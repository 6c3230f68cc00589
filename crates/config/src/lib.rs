//! Configuration loading, validation, env substitution, and directory resolution.
//!
//! Config files: `switchboard.toml`, `switchboard.yaml`, or `switchboard.json`
//! Searched in `./` then `~/.config/switchboard/`.
//!
//! Supports `${ENV_VAR}` and `${ENV_VAR:-default}` substitution in all string values.

pub mod env_subst;
pub mod loader;
pub mod schema;
pub mod validate;

pub use {
    loader::{
        clear_config_dir, clear_data_dir, config_dir, data_dir, discover_and_load,
        find_config_file, find_or_default_config_path, load_config, load_config_value, logs_dir,
        save_config, set_config_dir, set_data_dir, state_dir,
    },
    schema::{GatewaySettings, ServerConfig, SupervisorSettings, SwitchboardConfig},
    validate::{Diagnostic, Severity, ValidationResult, validate},
};
