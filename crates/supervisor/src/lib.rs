//! Gateway child-process supervision: spawn, readiness probing, shutdown
//! escalation, orphan recovery and the per-config gateway lock.

pub mod error;
pub mod lock;
pub mod net;
pub mod pid;
pub mod process;
pub mod state;
pub mod supervisor;
pub mod tail;

pub use {
    error::{Error, Result},
    lock::{GatewayLock, lock_path, remove_stale_lock},
    pid::PidStore,
    process::{ProcessOps, SystemProcessOps},
    state::{GatewayState, Phase},
    supervisor::{
        ENV_CONFIG_PATH, ENV_GATEWAY_BIN, ENV_GATEWAY_PORT, ENV_GATEWAY_TOKEN, ENV_STATE_DIR,
        ExitGuard, OrphanRecovery, StopOutcome, Supervisor, SupervisorOptions, resolve_binary,
    },
};
