//! `switchboard gateway run`: the supervised child.
//!
//! Reads its port, token, config path and state dir from the environment
//! the supervisor sets, takes the per-config lock, starts every configured
//! channel account and serves the health endpoints until SIGTERM or Ctrl-C.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use {
    anyhow::{Context, Result},
    clap::Subcommand,
    switchboard_channels::ChannelRegistry,
    switchboard_config::SwitchboardConfig,
    switchboard_gateway::{
        ChannelManager, log_channel::log_channel_plugin,
        server::{AppState, serve},
    },
    switchboard_supervisor::{
        ENV_CONFIG_PATH, ENV_GATEWAY_PORT, ENV_GATEWAY_TOKEN, ENV_STATE_DIR, GatewayLock,
        SystemProcessOps,
    },
    tokio::net::TcpListener,
    tokio_util::sync::CancellationToken,
    tracing::{info, warn},
};

#[derive(Subcommand)]
pub enum GatewayAction {
    /// Run the gateway in the foreground.
    Run {
        /// Address to bind to (overrides config value).
        #[arg(long)]
        bind: Option<String>,
        /// Port to listen on (overrides config and environment).
        #[arg(long)]
        port: Option<u16>,
    },
}

pub async fn handle_gateway(action: GatewayAction) -> Result<()> {
    match action {
        GatewayAction::Run { bind, port } => run(bind, port).await,
    }
}

/// Every channel this binary ships with.
pub(crate) fn build_registry() -> ChannelRegistry {
    let mut registry = ChannelRegistry::new();
    registry.register(log_channel_plugin());
    registry
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// The config path handed down by the supervisor, else discovery.
pub(crate) fn config_path() -> PathBuf {
    env_value(ENV_CONFIG_PATH)
        .map(PathBuf::from)
        .unwrap_or_else(switchboard_config::find_or_default_config_path)
}

/// Load `path`, falling back to defaults when it does not exist.
pub(crate) fn load_config_at(path: &Path) -> Result<SwitchboardConfig> {
    if path.exists() {
        switchboard_config::load_config(path)
            .with_context(|| format!("loading config {}", path.display()))
    } else {
        Ok(SwitchboardConfig::default())
    }
}

async fn run(bind: Option<String>, port: Option<u16>) -> Result<()> {
    if let Some(dir) = env_value(ENV_STATE_DIR) {
        switchboard_config::set_data_dir(PathBuf::from(dir));
    }
    let config_path = config_path();
    let config = load_config_at(&config_path)?;

    let env_port = match env_value(ENV_GATEWAY_PORT) {
        Some(raw) => Some(
            raw.trim()
                .parse::<u16>()
                .with_context(|| format!("invalid {ENV_GATEWAY_PORT}: {raw}"))?,
        ),
        None => None,
    };
    let bind = bind.unwrap_or_else(|| config.server.bind.clone());
    let port = port.or(env_port).unwrap_or(config.server.port);
    let token = env_value(ENV_GATEWAY_TOKEN);

    let lock = GatewayLock::acquire(&config_path, &SystemProcessOps)?;
    info!(
        config = %config_path.display(),
        lock = %lock.path().display(),
        pid = std::process::id(),
        "gateway lock acquired"
    );

    let listener = TcpListener::bind((bind.as_str(), port))
        .await
        .with_context(|| format!("binding {bind}:{port}"))?;

    let manager = Arc::new(ChannelManager::new(build_registry(), config));
    manager.refresh().await;
    // Accounts come up while the server is already answering.
    let starter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move {
            let started = manager.start_all().await;
            info!(accounts = started.len(), "channel accounts started");
        })
    };

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        crate::shutdown_signal().await;
        signal.cancel();
    });

    let served = serve(listener, AppState::new(Arc::clone(&manager), token), shutdown).await;
    if let Err(ref e) = served {
        warn!(error = %e, "gateway server failed");
    }

    starter.abort();
    manager.stop_all().await;
    drop(lock);
    info!("gateway stopped");
    served.map_err(Into::into)
}
