//! Spawn, probe, stop and recover the gateway child process.
//!
//! A single [`Supervisor`] owns at most one child. Its lifecycle runs
//! `idle → spawning → running → stopping → idle`; start and stop are
//! serialized, and the tracked child is swapped as a whole so the exit
//! listener of an old child can never clear the record of a newer one.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    process::Stdio,
    sync::{Arc, Mutex as StdMutex, PoisonError},
    time::Duration,
};

use {
    switchboard_config::SwitchboardConfig,
    tokio::{
        fs::OpenOptions,
        io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
        process::{Child, Command},
        sync::{Mutex, watch},
        task::JoinHandle,
        time::{Instant, sleep, timeout},
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    Error, Result,
    lock,
    net::{PortProbe, allocate_port, wait_for_port},
    pid::PidStore,
    process::{ProcessOps, SystemProcessOps},
    state::{GatewayState, Phase},
    tail::TailBuffer,
};

pub const ENV_GATEWAY_PORT: &str = "SWITCHBOARD_GATEWAY_PORT";
pub const ENV_GATEWAY_TOKEN: &str = "SWITCHBOARD_GATEWAY_TOKEN";
pub const ENV_CONFIG_PATH: &str = "SWITCHBOARD_CONFIG_PATH";
pub const ENV_STATE_DIR: &str = "SWITCHBOARD_STATE_DIR";
pub const ENV_GATEWAY_BIN: &str = "SWITCHBOARD_GATEWAY_BIN";

/// Tracing target for forwarded child output.
pub const CHILD_LOG_TARGET: &str = "gateway_child";
pub const CHILD_LOG_FILE: &str = "gateway.log";

/// How long to let the output forwarders drain after the child died.
const OUTPUT_DRAIN: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Explicit gateway binary; see [`resolve_binary`].
    pub binary: Option<PathBuf>,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub config_path: PathBuf,
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub host: String,
    /// `0` allocates a free port per spawn.
    pub port: u16,
    /// Bearer token handed to the child; generated when unset.
    pub token: Option<String>,
    pub startup_timeout: Duration,
    pub stop_grace: Duration,
    pub kill_confirm: Duration,
    pub orphan_confirm: Duration,
    pub poll_interval: Duration,
    pub tail_capacity: usize,
    pub kill_on_startup_failure: bool,
}

impl SupervisorOptions {
    /// Options with the default timings.
    #[must_use]
    pub fn new(config_path: PathBuf, state_dir: PathBuf, logs_dir: PathBuf) -> Self {
        Self::from_config(&SwitchboardConfig::default(), config_path, state_dir, logs_dir)
    }

    #[must_use]
    pub fn from_config(
        cfg: &SwitchboardConfig,
        config_path: PathBuf,
        state_dir: PathBuf,
        logs_dir: PathBuf,
    ) -> Self {
        let settings = &cfg.supervisor;
        Self {
            binary: settings.binary.clone(),
            args: settings.args.clone(),
            env: settings.env.clone(),
            config_path,
            state_dir,
            logs_dir,
            host: cfg.server.bind.clone(),
            port: cfg.server.port,
            token: None,
            startup_timeout: settings.startup_timeout(),
            stop_grace: settings.stop_grace(),
            kill_confirm: settings.kill_confirm(),
            orphan_confirm: settings.orphan_confirm(),
            poll_interval: settings.poll_interval(),
            tail_capacity: settings.tail_capacity,
            kill_on_startup_failure: settings.kill_on_startup_failure,
        }
    }

    /// Where to connect when probing: wildcard binds are probed on loopback.
    #[must_use]
    pub fn probe_host(&self) -> &str {
        match self.host.as_str() {
            "0.0.0.0" | "" => "127.0.0.1",
            "::" => "::1",
            host => host,
        }
    }
}

/// How a stop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    /// Exited within the grace window after the termination signal.
    Graceful,
    /// Needed the tree kill.
    Killed,
    /// Still alive after the tree kill; the record was cleared anyway.
    Unconfirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrphanRecovery {
    /// No usable pid record.
    Nothing,
    /// The recorded process was already gone.
    ClearedDead { pid: u32 },
    Killed { pid: u32, confirmed: bool },
}

/// Find the gateway binary: `explicit`, then `$SWITCHBOARD_GATEWAY_BIN`,
/// then the current executable. Bare names are looked up on `PATH`.
pub fn resolve_binary(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return resolve_named(path);
    }
    if let Ok(value) = std::env::var(ENV_GATEWAY_BIN)
        && !value.trim().is_empty()
    {
        return resolve_named(Path::new(value.trim()));
    }
    std::env::current_exe().map_err(|_| Error::BinaryNotFound {
        name: "current executable".into(),
    })
}

fn resolve_named(path: &Path) -> Result<PathBuf> {
    let not_found = || Error::BinaryNotFound {
        name: path.display().to_string(),
    };
    if path.is_absolute() || path.components().count() > 1 {
        return if path.exists() {
            Ok(path.to_path_buf())
        } else {
            Err(not_found())
        };
    }
    which::which(path).map_err(|_| not_found())
}

struct TrackedChild {
    pid: u32,
    /// Fires when the exit listener observed the child's exit.
    exited: CancellationToken,
}

struct Shared {
    ops: Arc<dyn ProcessOps>,
    pids: PidStore,
    tracked: StdMutex<Option<Arc<TrackedChild>>>,
    phase: StdMutex<Phase>,
    state: watch::Sender<Option<GatewayState>>,
    tail: StdMutex<TailBuffer>,
}

impl Shared {
    fn tracked(&self) -> Option<Arc<TrackedChild>> {
        self.tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget the tracked child if it is still `pid`.
    fn untrack(&self, pid: u32) -> bool {
        let mut tracked = self.tracked.lock().unwrap_or_else(PoisonError::into_inner);
        if tracked.as_ref().is_some_and(|c| c.pid == pid) {
            *tracked = None;
            true
        } else {
            false
        }
    }

    fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, next: Phase) {
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        if *phase != next {
            debug!(from = ?*phase, to = ?next, "supervisor phase");
            *phase = next;
        }
    }

    fn publish(&self, state: GatewayState) {
        info!(kind = state.kind(), port = state.port(), "gateway state");
        self.state.send_replace(Some(state));
    }

    fn clear_pid_record(&self) {
        if let Err(e) = self.pids.clear() {
            warn!(path = %self.pids.path().display(), error = %e, "failed to clear pid record");
        }
    }

    fn tail(&self) -> String {
        self.tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contents()
            .to_string()
    }
}

/// Owns the gateway child process.
pub struct Supervisor {
    opts: SupervisorOptions,
    shared: Arc<Shared>,
    lifecycle: Mutex<()>,
}

impl Supervisor {
    #[must_use]
    pub fn new(opts: SupervisorOptions) -> Self {
        Self::with_process_ops(opts, Arc::new(SystemProcessOps))
    }

    #[must_use]
    pub fn with_process_ops(opts: SupervisorOptions, ops: Arc<dyn ProcessOps>) -> Self {
        let (state, _) = watch::channel(None);
        let shared = Shared {
            ops,
            pids: PidStore::new(&opts.state_dir),
            tracked: StdMutex::new(None),
            phase: StdMutex::new(Phase::Idle),
            state,
            tail: StdMutex::new(TailBuffer::new(opts.tail_capacity)),
        };
        Self {
            opts,
            shared: Arc::new(shared),
            lifecycle: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn options(&self) -> &SupervisorOptions {
        &self.opts
    }

    #[must_use]
    pub fn pid_store(&self) -> &PidStore {
        &self.shared.pids
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Option<GatewayState>> {
        self.shared.state.subscribe()
    }

    #[must_use]
    pub fn state(&self) -> Option<GatewayState> {
        self.shared.state.borrow().clone()
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    #[must_use]
    pub fn tracked_pid(&self) -> Option<u32> {
        self.shared.tracked().map(|c| c.pid)
    }

    /// Captured end of the child's stderr.
    #[must_use]
    pub fn tail(&self) -> String {
        self.shared.tail()
    }

    /// Spawn the gateway and wait until its port accepts connections.
    ///
    /// A no-op returning the current state while the tracked child is alive.
    /// Fails with [`Error::AlreadyRunning`] when the pid record names another
    /// live process. A child that never opens its port yields
    /// [`GatewayState::Failed`], not an error.
    pub async fn start(&self) -> Result<GatewayState> {
        let _lifecycle = self.lifecycle.lock().await;

        if let Some(child) = self.shared.tracked()
            && !child.exited.is_cancelled()
            && self.shared.ops.is_alive(child.pid)
            && let Some(state) = self.state()
        {
            debug!(pid = child.pid, "gateway already running");
            return Ok(state);
        }

        if let Some(pid) = self.shared.pids.read()
            && self.tracked_pid() != Some(pid)
            && self.shared.ops.is_alive(pid)
        {
            return Err(Error::AlreadyRunning { pid });
        }

        self.shared.set_phase(Phase::Spawning);
        let result = self.spawn_and_probe().await;
        if result.is_err() {
            self.shared.set_phase(Phase::Idle);
        }
        result
    }

    async fn spawn_and_probe(&self) -> Result<GatewayState> {
        let binary = resolve_binary(self.opts.binary.as_deref())?;
        let host = self.opts.probe_host().to_string();
        let port = match self.opts.port {
            0 => allocate_port(&host).await?,
            port => port,
        };
        let token = self
            .opts
            .token
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let logs_dir = self.opts.logs_dir.clone();

        self.shared
            .tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.shared.publish(GatewayState::Starting {
            port,
            logs_dir: logs_dir.clone(),
            token: token.clone(),
        });

        if let Err(e) = std::fs::create_dir_all(&logs_dir) {
            warn!(path = %logs_dir.display(), error = %e, "cannot create logs dir");
        }

        let mut cmd = Command::new(&binary);
        cmd.args(&self.opts.args)
            .envs(&self.opts.env)
            .env(ENV_GATEWAY_PORT, port.to_string())
            .env(ENV_GATEWAY_TOKEN, &token)
            .env(ENV_CONFIG_PATH, &self.opts.config_path)
            .env(ENV_STATE_DIR, &self.opts.state_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false);
        // Own process group, so the tree can be signalled as a unit.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| Error::Spawn {
            binary: binary.clone(),
            source,
        })?;
        let Some(pid) = child.id() else {
            return Err(Error::message("gateway exited before reporting a pid"));
        };
        info!(pid, port, binary = %binary.display(), args = ?self.opts.args, "spawned gateway");

        if let Err(e) = self.shared.pids.write(pid) {
            warn!(pid, error = %e, "failed to write pid record");
        }
        let exited = CancellationToken::new();
        *self
            .shared
            .tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(TrackedChild {
            pid,
            exited: exited.clone(),
        }));

        let stderr_task = self.forward_output(&mut child, pid);
        watch_exit(Arc::clone(&self.shared), child, pid, exited.clone());

        let probe = wait_for_port(
            &host,
            port,
            self.opts.startup_timeout,
            self.opts.poll_interval,
            &exited,
        )
        .await;

        if probe == PortProbe::Open {
            self.shared.set_phase(Phase::Running);
            let state = GatewayState::Ready {
                port,
                logs_dir,
                url: format_url(&host, port),
                token,
            };
            self.shared.publish(state.clone());
            return Ok(state);
        }

        let reason = match probe {
            PortProbe::Aborted => "gateway exited during startup".to_string(),
            _ => format!(
                "gateway did not accept connections on port {port} within {}ms",
                self.opts.startup_timeout.as_millis()
            ),
        };
        warn!(pid, port, reason = %reason, "gateway failed to start");

        if self.opts.kill_on_startup_failure {
            self.shared.set_phase(Phase::Stopping);
            self.stop_pid(pid).await;
            self.shared.untrack(pid);
            self.shared.clear_pid_record();
            self.shared.set_phase(Phase::Idle);
        } else if exited.is_cancelled() {
            self.shared.set_phase(Phase::Idle);
        } else {
            self.shared.set_phase(Phase::Running);
        }
        if (exited.is_cancelled() || self.opts.kill_on_startup_failure)
            && let Some(task) = stderr_task
        {
            let _ = timeout(OUTPUT_DRAIN, task).await;
        }

        let state = GatewayState::Failed {
            port,
            logs_dir: logs_dir.clone(),
            details: self.failure_details(&reason, &binary),
            token,
        };
        self.shared.publish(state.clone());
        Ok(state)
    }

    fn failure_details(&self, reason: &str, binary: &Path) -> String {
        let mut details = format!(
            "{reason}\nbinary: {}\nargs: {}\nlogs: {}",
            binary.display(),
            self.opts.args.join(" "),
            self.opts.logs_dir.display(),
        );
        let tail = self.shared.tail();
        if !tail.is_empty() {
            details.push_str("\n--- stderr ---\n");
            details.push_str(tail.trim_end());
        }
        details
    }

    /// Forward stdout/stderr to tracing and the gateway log file. Returns the
    /// stderr forwarder so callers can let it drain.
    fn forward_output(&self, child: &mut Child, pid: u32) -> Option<JoinHandle<()>> {
        let log_path = self.opts.logs_dir.join(CHILD_LOG_FILE);
        if let Some(stdout) = child.stdout.take() {
            let log_path = log_path.clone();
            tokio::spawn(forward_lines(stdout, log_path, move |line| {
                debug!(target: CHILD_LOG_TARGET, pid, "{line}");
            }));
        }
        let stderr = child.stderr.take()?;
        let shared = Arc::clone(&self.shared);
        Some(tokio::spawn(forward_lines(stderr, log_path, move |line| {
            warn!(target: CHILD_LOG_TARGET, pid, "{line}");
            shared
                .tail
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push_line(line);
        })))
    }

    /// Stop the gateway: terminate, wait `stop_grace`, kill the tree once,
    /// wait `kill_confirm`. The pid record is cleared whatever happens.
    ///
    /// Without a tracked child, the pid from the record is stopped instead.
    pub async fn stop(&self) -> Result<StopOutcome> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(pid) = self.tracked_pid().or_else(|| self.shared.pids.read()) else {
            return Ok(StopOutcome::NotRunning);
        };

        self.shared.set_phase(Phase::Stopping);
        let outcome = self.stop_pid(pid).await;
        self.shared.untrack(pid);
        self.shared.clear_pid_record();
        self.shared.set_phase(Phase::Idle);
        info!(pid, ?outcome, "gateway stopped");
        Ok(outcome)
    }

    async fn stop_pid(&self, pid: u32) -> StopOutcome {
        let ops = &self.shared.ops;
        if !ops.is_alive(pid) {
            return StopOutcome::NotRunning;
        }
        if let Err(e) = ops.terminate(pid) {
            warn!(pid, error = %e, "failed to signal gateway");
        }
        if self.wait_exit(pid, self.opts.stop_grace).await {
            return StopOutcome::Graceful;
        }

        warn!(pid, grace = ?self.opts.stop_grace, "gateway ignored termination, killing process tree");
        if let Err(e) = ops.kill_tree(pid) {
            warn!(pid, error = %e, "failed to kill gateway process tree");
        }
        if self.wait_exit(pid, self.opts.kill_confirm).await {
            StopOutcome::Killed
        } else {
            warn!(pid, "gateway still alive after kill");
            StopOutcome::Unconfirmed
        }
    }

    /// Poll until `pid` is gone or `limit` elapses.
    async fn wait_exit(&self, pid: u32, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if !self.shared.ops.is_alive(pid) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(self.opts.poll_interval.min(deadline - now)).await;
        }
    }

    /// Kill a gateway left behind by an unclean exit of a previous
    /// supervisor. Never blocks startup beyond `orphan_confirm`.
    pub async fn recover_orphan(&self) -> Result<OrphanRecovery> {
        let _lifecycle = self.lifecycle.lock().await;
        let Some(pid) = self.shared.pids.read() else {
            return Ok(OrphanRecovery::Nothing);
        };
        if self.tracked_pid() == Some(pid) {
            return Ok(OrphanRecovery::Nothing);
        }

        if pid == std::process::id() || !self.shared.ops.is_alive(pid) {
            info!(pid, "clearing pid record of exited gateway");
            self.shared.pids.clear()?;
            return Ok(OrphanRecovery::ClearedDead { pid });
        }

        warn!(pid, "killing orphaned gateway");
        if let Err(e) = self.shared.ops.kill_tree(pid) {
            warn!(pid, error = %e, "failed to kill orphaned gateway");
        }
        let confirmed = self.wait_exit(pid, self.opts.orphan_confirm).await;
        if !confirmed {
            warn!(pid, "orphan kill unconfirmed, continuing startup");
        }
        self.shared.clear_pid_record();
        Ok(OrphanRecovery::Killed { pid, confirmed })
    }

    /// Delete the lock of this config. Call after [`Self::recover_orphan`].
    pub fn remove_stale_lock(&self) -> Result<bool> {
        lock::remove_stale_lock(&self.opts.config_path)
    }

    /// A guard that force-kills the tracked child tree when dropped. Hold it
    /// for the lifetime of the host process.
    #[must_use]
    pub fn exit_guard(&self) -> ExitGuard {
        ExitGuard {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Last-resort cleanup: kills the tracked child synchronously on drop.
pub struct ExitGuard {
    shared: Arc<Shared>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let tracked = self
            .shared
            .tracked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(child) = tracked {
            if let Err(e) = self.shared.ops.kill_tree(child.pid) {
                warn!(pid = child.pid, error = %e, "exit guard failed to kill gateway");
            }
            self.shared.clear_pid_record();
        }
    }
}

fn format_url(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("http://[{host}]:{port}")
    } else {
        format!("http://{host}:{port}")
    }
}

/// Reap the child. Only a listener whose pid is still the tracked one may
/// clear the handle and the pid record.
fn watch_exit(shared: Arc<Shared>, mut child: Child, pid: u32, exited: CancellationToken) {
    tokio::spawn(async move {
        let status = child.wait().await;
        exited.cancel();
        if !shared.untrack(pid) {
            debug!(pid, "exit of untracked gateway ignored");
            return;
        }
        shared.clear_pid_record();

        let phase = shared.phase();
        match &status {
            Ok(status) => info!(pid, %status, "gateway exited"),
            Err(e) => warn!(pid, error = %e, "failed to wait for gateway"),
        }
        if phase == Phase::Running {
            let current = shared.state.borrow().clone();
            if let Some(GatewayState::Ready {
                port,
                logs_dir,
                token,
                ..
            }) = current
            {
                let details = match status {
                    Ok(status) => format!("gateway exited unexpectedly ({status})"),
                    Err(e) => format!("gateway exited unexpectedly ({e})"),
                };
                shared.publish(GatewayState::Failed {
                    port,
                    logs_dir,
                    details,
                    token,
                });
            }
            shared.set_phase(Phase::Idle);
        }
    });
}

async fn forward_lines<R, F>(reader: R, log_path: PathBuf, mut on_line: F)
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut log_file = match OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
    {
        Ok(file) => Some(file),
        Err(e) => {
            debug!(path = %log_path.display(), error = %e, "gateway log file unavailable");
            None
        },
    };
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        on_line(&line);
        if let Some(file) = log_file.as_mut() {
            let mut entry = line.into_bytes();
            entry.push(b'\n');
            if file.write_all(&entry).await.is_err() {
                log_file = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {super::*, rstest::rstest};

    #[rstest]
    #[case("0.0.0.0", "127.0.0.1")]
    #[case("", "127.0.0.1")]
    #[case("::", "::1")]
    #[case("192.168.1.4", "192.168.1.4")]
    fn wildcard_binds_probe_loopback(#[case] bind: &str, #[case] probe: &str) {
        let mut opts = SupervisorOptions::new("c.toml".into(), "s".into(), "l".into());
        opts.host = bind.into();
        assert_eq!(opts.probe_host(), probe);
    }

    #[test]
    fn urls_bracket_ipv6() {
        assert_eq!(format_url("127.0.0.1", 80), "http://127.0.0.1:80");
        assert_eq!(format_url("::1", 80), "http://[::1]:80");
    }

    #[test]
    fn options_follow_config() {
        let mut cfg = SwitchboardConfig::default();
        cfg.supervisor.stop_grace_ms = 250;
        cfg.server.port = 0;
        let opts = SupervisorOptions::from_config(&cfg, "c.toml".into(), "s".into(), "l".into());
        assert_eq!(opts.stop_grace, Duration::from_millis(250));
        assert_eq!(opts.port, 0);
        assert_eq!(opts.args, vec!["gateway", "run"]);
        assert!(opts.kill_on_startup_failure);
    }

    #[test]
    fn binary_resolution() {
        assert!(matches!(
            resolve_binary(Some(Path::new("/definitely/not/here"))),
            Err(Error::BinaryNotFound { .. })
        ));
        assert!(matches!(
            resolve_binary(Some(Path::new("no-such-switchboard-binary"))),
            Err(Error::BinaryNotFound { .. })
        ));
        #[cfg(unix)]
        assert!(resolve_binary(Some(Path::new("sh"))).unwrap().is_absolute());
    }
}
