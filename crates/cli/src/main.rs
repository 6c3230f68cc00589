mod doctor_commands;
mod gateway_commands;
mod supervise_commands;

use {
    clap::{Parser, Subcommand},
    tracing::{debug, info, warn},
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

#[derive(Parser)]
#[command(name = "switchboard", about = "Switchboard, personal agent gateway host", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Custom config directory (overrides default ~/.config/switchboard/).
    #[arg(long, global = true, env = "SWITCHBOARD_CONFIG_DIR")]
    config_dir: Option<std::path::PathBuf>,
    /// Custom data directory; pid file and logs live here.
    #[arg(long, global = true, env = "SWITCHBOARD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway under supervision and wait for Ctrl-C.
    Start,
    /// Stop the gateway recorded in the pid file.
    Stop,
    /// Show the pid record, liveness and lock path.
    Status,
    /// Check config and channel health.
    Doctor {
        /// Probe running accounts live.
        #[arg(long, default_value_t = false)]
        probe: bool,
    },
    /// Gateway process commands.
    Gateway {
        #[command(subcommand)]
        action: gateway_commands::GatewayAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_ansi(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    }
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received interrupt"),
        () = terminate => info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    init_telemetry(&cli);
    debug!(version = env!("CARGO_PKG_VERSION"), "switchboard starting");

    if let Some(ref dir) = cli.config_dir {
        switchboard_config::set_config_dir(dir.clone());
    }
    if let Some(ref dir) = cli.data_dir {
        switchboard_config::set_data_dir(dir.clone());
    }

    match cli.command {
        Commands::Start => supervise_commands::handle_start().await,
        Commands::Stop => supervise_commands::handle_stop().await,
        Commands::Status => supervise_commands::handle_status(),
        Commands::Doctor { probe } => doctor_commands::handle_doctor(probe).await,
        Commands::Gateway { action } => gateway_commands::handle_gateway(action).await,
    }
}
