//! `switchboard start|stop|status`: the supervising side.

use std::path::Path;

use {
    anyhow::{Result, bail},
    serde_json::json,
    switchboard_supervisor::{
        GatewayState, OrphanRecovery, PidStore, ProcessOps, Supervisor, SupervisorOptions,
        SystemProcessOps, lock_path,
    },
    tokio::sync::watch,
    tracing::{info, warn},
};

use crate::gateway_commands::{config_path, load_config_at};

fn supervisor() -> Result<Supervisor> {
    let config_path = config_path();
    let config = load_config_at(&config_path)?;
    let state_dir = switchboard_config::state_dir();
    let logs_dir = switchboard_config::logs_dir();
    let opts = SupervisorOptions::from_config(&config, config_path, state_dir, logs_dir);
    Ok(Supervisor::new(opts))
}

fn print_state(state: &GatewayState) {
    match serde_json::to_string(state) {
        Ok(line) => println!("{line}"),
        Err(e) => warn!(error = %e, "failed to encode gateway state"),
    }
}

/// Resolve once the published state is `failed`.
async fn wait_failed(mut states: watch::Receiver<Option<GatewayState>>) {
    while states.changed().await.is_ok() {
        if matches!(*states.borrow_and_update(), Some(GatewayState::Failed { .. })) {
            return;
        }
    }
    std::future::pending::<()>().await;
}

pub async fn handle_start() -> Result<()> {
    let supervisor = supervisor()?;
    let _guard = supervisor.exit_guard();

    match supervisor.recover_orphan().await? {
        OrphanRecovery::Nothing => {},
        OrphanRecovery::ClearedDead { pid } => info!(pid, "cleared pid record of exited gateway"),
        OrphanRecovery::Killed { pid, confirmed } => {
            info!(pid, confirmed, "recovered orphaned gateway");
        },
    }
    supervisor.remove_stale_lock()?;

    let mut states = supervisor.subscribe();
    let printer = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let current = states.borrow_and_update().clone();
            if let Some(state) = current {
                print_state(&state);
            }
        }
    });

    let failures = supervisor.subscribe();
    let state = supervisor.start().await?;
    if let GatewayState::Failed { details, .. } = &state {
        printer.abort();
        print_state(&state);
        bail!("gateway failed to start:\n{details}");
    }

    tokio::select! {
        () = crate::shutdown_signal() => {},
        () = wait_failed(failures) => warn!("gateway exited, shutting down"),
    }

    let outcome = supervisor.stop().await?;
    info!(?outcome, "gateway stopped");
    printer.abort();
    Ok(())
}

pub async fn handle_stop() -> Result<()> {
    let supervisor = supervisor()?;
    let outcome = supervisor.stop().await?;
    println!("{}", json!({ "outcome": format!("{outcome:?}").to_lowercase() }));
    Ok(())
}

pub fn handle_status() -> Result<()> {
    let report = status_report(
        &switchboard_config::state_dir(),
        &config_path(),
        &SystemProcessOps,
    );
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn status_report(state_dir: &Path, config_path: &Path, ops: &dyn ProcessOps) -> serde_json::Value {
    let pids = PidStore::new(state_dir);
    let pid = pids.read();
    let lock = lock_path(config_path);
    let lock_present = lock.exists();
    json!({
        "pid": pid,
        "alive": pid.is_some_and(|p| ops.is_alive(p)),
        "pidFile": pids.path(),
        "config": config_path,
        "lock": {
            "path": lock,
            "present": lock_present,
        },
    })
}
