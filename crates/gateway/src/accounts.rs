//! Account registry and lifecycle state machine.
//!
//! Every configured `(channel, account)` pair gets a slot holding its status
//! handle and, while live, the task running the adapter's `start_account`.
//! Start and stop of one account are serialized by the slot's lifecycle
//! mutex; different accounts run fully independently.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{
        Arc, Mutex as StdMutex, PoisonError, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use {
    futures::future::join_all,
    serde::Serialize,
    serde_json::Value,
    switchboard_channels::{
        AccountStatusHandle, ChannelAccountSnapshot, ChannelAccountState, ChannelConfigAdapter,
        ChannelGatewayAdapter, ChannelPlugin, ChannelRegistry, GatewayContext, ResolvedAccount,
        TracingLogSink, config_section::SectionConfigAdapter, types::derive_account_state,
    },
    switchboard_common::unix_now,
    switchboard_config::SwitchboardConfig,
    tokio::{
        sync::{Mutex, broadcast, oneshot},
        task::JoinHandle,
        time::timeout,
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{Error, Result};

const EVENT_CAPACITY: usize = 256;

/// Identifies one account of one channel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountKey {
    pub channel: String,
    pub account_id: String,
}

impl AccountKey {
    #[must_use]
    pub fn new(channel: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            account_id: account_id.into(),
        }
    }
}

/// Broadcast on every state change.
#[derive(Debug, Clone)]
pub struct AccountEvent {
    pub previous: ChannelAccountState,
    pub snapshot: Arc<ChannelAccountSnapshot>,
}

/// The Config group of `plugin`, or the generic section reader.
#[must_use]
pub fn config_adapter(plugin: &ChannelPlugin) -> Arc<dyn ChannelConfigAdapter> {
    plugin
        .config
        .clone()
        .unwrap_or_else(|| Arc::new(SectionConfigAdapter::new(plugin.id())))
}

struct AccountRuntime {
    ctx: GatewayContext,
    task: JoinHandle<()>,
}

struct AccountSlot {
    status: AccountStatusHandle,
    lifecycle: Mutex<Option<AccountRuntime>>,
    /// Bumped by every start and stop; a start task only reports back while
    /// its generation is current.
    generation: AtomicU64,
    /// Last seen account config, to detect edits.
    fingerprint: StdMutex<Option<Value>>,
}

impl AccountSlot {
    fn new(key: &AccountKey) -> Self {
        Self {
            status: AccountStatusHandle::new(ChannelAccountSnapshot::new(
                &key.channel,
                &key.account_id,
            )),
            lifecycle: Mutex::new(None),
            generation: AtomicU64::new(0),
            fingerprint: StdMutex::new(None),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }
}

struct AccountView {
    account: ResolvedAccount,
    enabled: bool,
    configured: bool,
    problem: Option<String>,
}

/// Owns all channel accounts of one gateway.
pub struct ChannelManager {
    registry: ChannelRegistry,
    config: RwLock<Arc<SwitchboardConfig>>,
    slots: RwLock<BTreeMap<AccountKey, Arc<AccountSlot>>>,
    events: broadcast::Sender<AccountEvent>,
}

impl ChannelManager {
    #[must_use]
    pub fn new(registry: ChannelRegistry, config: SwitchboardConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry,
            config: RwLock::new(Arc::new(config)),
            slots: RwLock::new(BTreeMap::new()),
            events,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> Arc<SwitchboardConfig> {
        Arc::clone(&self.config.read().unwrap_or_else(PoisonError::into_inner))
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<AccountEvent> {
        self.events.subscribe()
    }

    pub fn plugin(&self, channel: &str) -> Result<Arc<ChannelPlugin>> {
        self.registry
            .get(channel)
            .ok_or_else(|| switchboard_channels::Error::unknown_channel(channel).into())
    }

    /// Resolve an account, falling back to the channel's default account.
    pub fn resolve_account(
        &self,
        plugin: &ChannelPlugin,
        account_id: Option<&str>,
    ) -> Result<ResolvedAccount> {
        let cfg = self.config();
        let adapter = config_adapter(plugin);
        let account_id = match account_id {
            Some(id) => id.to_string(),
            None => adapter.default_account_id(&cfg),
        };
        Ok(adapter.resolve_account(&cfg, &account_id)?)
    }

    #[must_use]
    pub fn account_keys(&self) -> Vec<AccountKey> {
        self.read_slots().keys().cloned().collect()
    }

    #[must_use]
    pub fn snapshots(&self) -> Vec<Arc<ChannelAccountSnapshot>> {
        self.read_slots().values().map(|s| s.status.get()).collect()
    }

    #[must_use]
    pub fn snapshot(&self, channel: &str, account_id: &str) -> Option<Arc<ChannelAccountSnapshot>> {
        self.read_slots()
            .get(&AccountKey::new(channel, account_id))
            .map(|s| s.status.get())
    }

    /// Watch one account's snapshot.
    pub fn watch_account(
        &self,
        channel: &str,
        account_id: &str,
    ) -> Result<tokio::sync::watch::Receiver<Arc<ChannelAccountSnapshot>>> {
        Ok(self.slot_for(channel, account_id)?.status.subscribe())
    }

    /// Swap in a new config and re-derive every account.
    pub async fn reload(&self, config: SwitchboardConfig) -> Vec<Arc<ChannelAccountSnapshot>> {
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
        self.refresh().await
    }

    /// Enumerate accounts of every registered channel and re-derive idle
    /// states. Accounts that stopped being runnable are stopped; accounts
    /// gone from config are stopped and dropped. Nothing is started.
    pub async fn refresh(&self) -> Vec<Arc<ChannelAccountSnapshot>> {
        let cfg = self.config();
        let mut seen = BTreeSet::new();

        for plugin in self.registry.iter() {
            let adapter = config_adapter(plugin);
            for account_id in adapter.list_account_ids(&cfg) {
                let key = AccountKey::new(plugin.id(), &account_id);
                seen.insert(key.clone());
                let view = match inspect(adapter.as_ref(), &cfg, &account_id).await {
                    Ok(view) => view,
                    Err(e) => {
                        warn!(channel = plugin.id(), account_id, error = %e, "failed to resolve channel account");
                        continue;
                    },
                };
                let slot = self.ensure_slot(&key);
                self.reconcile(plugin, &slot, view).await;
            }
        }

        let removed: Vec<AccountKey> = self
            .read_slots()
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();
        for key in removed {
            if let Err(e) = self.stop_account(&key.channel, &key.account_id).await {
                warn!(channel = %key.channel, account_id = %key.account_id, error = %e, "failed to stop removed account");
            }
            self.write_slots().remove(&key);
            info!(channel = %key.channel, account_id = %key.account_id, "channel account removed from config");
        }

        self.snapshots()
    }

    async fn reconcile(&self, plugin: &ChannelPlugin, slot: &Arc<AccountSlot>, view: AccountView) {
        let changed = {
            let mut fingerprint = slot.fingerprint.lock().unwrap_or_else(PoisonError::into_inner);
            let changed = fingerprint
                .as_ref()
                .is_some_and(|previous| previous != &view.account.config);
            *fingerprint = Some(view.account.config.clone());
            changed
        };
        let runnable = view.enabled && view.configured;

        let live = slot.lifecycle.lock().await.is_some();
        if live && !runnable {
            info!(
                channel = plugin.id(),
                account_id = %view.account.account_id,
                enabled = view.enabled,
                configured = view.configured,
                "account no longer runnable, stopping"
            );
            if let Err(e) = self
                .stop_account(plugin.id(), &view.account.account_id)
                .await
            {
                warn!(channel = plugin.id(), error = %e, "failed to stop account");
            }
        }

        let status = plugin.status.clone();
        let previous = slot.status.get().state;
        let snapshot = slot.status.update(|snap| {
            // An edited config is the only thing besides an explicit start
            // that clears an error.
            if snap.state == ChannelAccountState::Error && changed {
                snap.state = ChannelAccountState::Stopped;
                snap.last_error = None;
            }
            snap.state = match &status {
                Some(status) => {
                    status.resolve_account_state(view.enabled, view.configured, Some(&*snap))
                },
                None => derive_account_state(view.enabled, view.configured, Some(snap.state)),
            };
            snap.enabled = view.enabled;
            snap.configured = view.configured;
            snap.name = view.account.name.clone();
            if let Some(problem) = &view.problem {
                snap.last_error = Some(problem.clone());
            }
            if let Some(status) = &status {
                snap.summary = status.build_account_summary(&view.account, &*snap);
            }
        });
        emit(&self.events, previous, snapshot);
    }

    /// Start every stopped account of channels that have a Gateway group.
    ///
    /// Accounts in `error` are left alone until restarted explicitly. One
    /// account failing never keeps the others from starting.
    pub async fn start_all(&self) -> Vec<Arc<ChannelAccountSnapshot>> {
        let keys: Vec<AccountKey> = self
            .read_slots()
            .iter()
            .filter(|(key, slot)| {
                slot.status.get().state == ChannelAccountState::Stopped
                    && self
                        .registry
                        .get(&key.channel)
                        .is_some_and(|p| p.gateway.is_some())
            })
            .map(|(key, _)| key.clone())
            .collect();

        let starts = keys.iter().map(|key| async move {
            (key, self.start_account(&key.channel, &key.account_id).await)
        });
        for (key, result) in join_all(starts).await {
            if let Err(e) = result {
                warn!(channel = %key.channel, account_id = %key.account_id, error = %e, "failed to start account");
            }
        }
        self.snapshots()
    }

    /// Start one account.
    ///
    /// Returns `Ok(None)` when the channel has no Gateway group. A no-op when
    /// the account is already starting or running. Waits until the adapter's
    /// `start_account` settles or the settle window passes; an adapter still
    /// running after the window is serving and the account is `running`. A
    /// later `Err` from it moves the account to `error`.
    pub async fn start_account(
        &self,
        channel: &str,
        account_id: &str,
    ) -> Result<Option<Arc<ChannelAccountSnapshot>>> {
        let plugin = self.plugin(channel)?;
        let Some(gateway) = plugin.gateway.clone() else {
            debug!(channel, account_id, "channel has no gateway adapter, nothing to start");
            return Ok(None);
        };
        let cfg = self.config();
        let settle = cfg.gateway.account_start_settle();
        let view = inspect(config_adapter(&plugin).as_ref(), &cfg, account_id).await?;
        let key = AccountKey::new(plugin.id(), account_id);
        let slot = self.ensure_slot(&key);

        let (settled, generation, cancel) = {
            let mut runtime = slot.lifecycle.lock().await;
            let current = slot.status.get();
            if let Some(rt) = runtime.as_ref()
                && current.state.is_live()
                && !rt.ctx.cancel.is_cancelled()
            {
                debug!(channel, account_id, state = %current.state, "account already live");
                return Ok(Some(current));
            }
            if let Some(stale) = runtime.take() {
                stale.ctx.cancel.cancel();
                stale.task.abort();
            }

            if !view.enabled || !view.configured {
                let state = derive_account_state(view.enabled, view.configured, None);
                let snapshot = slot.status.update(|snap| {
                    snap.state = state;
                    snap.enabled = view.enabled;
                    snap.configured = view.configured;
                });
                emit(&self.events, current.state, Arc::clone(&snapshot));
                return Ok(Some(snapshot));
            }

            let generation = slot.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let starting = slot.status.update(|snap| {
                snap.state = ChannelAccountState::Starting;
                snap.enabled = true;
                snap.configured = true;
                snap.name = view.account.name.clone();
                snap.last_error = None;
                snap.last_start_at = Some(unix_now());
            });
            emit(&self.events, current.state, starting);
            info!(channel, account_id, generation, "starting channel account");

            let ctx = GatewayContext {
                cfg,
                account: view.account,
                cancel: CancellationToken::new(),
                status: slot.status.clone(),
                log: Some(Arc::new(TracingLogSink::new(plugin.id(), account_id))),
            };
            let (done_tx, done_rx) = oneshot::channel();
            let task = tokio::spawn(run_start(
                gateway,
                ctx.clone(),
                Arc::clone(&slot),
                generation,
                self.events.clone(),
                done_tx,
            ));
            let cancel = ctx.cancel.clone();
            *runtime = Some(AccountRuntime { ctx, task });
            (done_rx, generation, cancel)
        };

        match timeout(settle, settled).await {
            Ok(Ok(())) => {},
            // A concurrent stop aborted the start task.
            Ok(Err(_)) => debug!(channel, account_id, "start superseded by stop"),
            Err(_) => {
                let previous = slot.status.get().state;
                let serving = slot.status.replace_if(|snap| {
                    (slot.is_current(generation)
                        && snap.state == ChannelAccountState::Starting
                        && !cancel.is_cancelled())
                    .then(|| snap.with_state(ChannelAccountState::Running))
                });
                if serving {
                    info!(channel, account_id, "channel account serving");
                    emit(&self.events, previous, slot.status.get());
                }
            },
        }
        Ok(Some(slot.status.get()))
    }

    /// Stop one account: cancel its token, give the start task and the
    /// adapter's `stop_account` a bounded grace each, then mark it stopped.
    pub async fn stop_account(
        &self,
        channel: &str,
        account_id: &str,
    ) -> Result<Arc<ChannelAccountSnapshot>> {
        let slot = self.slot_for(channel, account_id)?;
        let gateway: Option<Arc<dyn ChannelGatewayAdapter>> =
            self.registry.get(channel).and_then(|p| p.gateway.clone());
        let grace = self.config().gateway.account_stop_grace();

        let mut runtime = slot.lifecycle.lock().await;
        let previous = slot.status.get().state;
        slot.generation.fetch_add(1, Ordering::SeqCst);

        let Some(rt) = runtime.take() else {
            if previous.is_live() || previous == ChannelAccountState::Error {
                let snapshot = slot.status.update(|snap| {
                    snap.state = ChannelAccountState::Stopped;
                    snap.last_stop_at = Some(unix_now());
                });
                emit(&self.events, previous, Arc::clone(&snapshot));
                return Ok(snapshot);
            }
            return Ok(slot.status.get());
        };

        info!(channel, account_id, "stopping channel account");
        rt.ctx.cancel.cancel();

        let mut task = rt.task;
        if timeout(grace, &mut task).await.is_err() {
            warn!(
                channel,
                account_id,
                grace_ms = grace.as_millis() as u64,
                "start task ignored cancellation, aborting"
            );
            task.abort();
        }

        if let Some(gateway) = gateway {
            match timeout(grace, gateway.stop_account(rt.ctx.clone())).await {
                Ok(Ok(())) => {},
                Ok(Err(e)) => warn!(channel, account_id, error = %e, "adapter stop_account failed"),
                Err(_) => warn!(channel, account_id, "adapter stop_account timed out"),
            }
        }

        let snapshot = slot.status.update(|snap| {
            snap.state = ChannelAccountState::Stopped;
            if snap.connected.is_some() {
                snap.connected = Some(false);
            }
            snap.last_stop_at = Some(unix_now());
        });
        emit(&self.events, previous, Arc::clone(&snapshot));
        info!(channel, account_id, "channel account stopped");
        Ok(snapshot)
    }

    /// Stop then start; the only way out of `error` besides a config edit.
    pub async fn restart_account(
        &self,
        channel: &str,
        account_id: &str,
    ) -> Result<Option<Arc<ChannelAccountSnapshot>>> {
        self.stop_account(channel, account_id).await?;
        self.start_account(channel, account_id).await
    }

    /// Stop every account concurrently.
    pub async fn stop_all(&self) {
        let keys = self.account_keys();
        let stops = keys
            .iter()
            .map(|key| async move { (key, self.stop_account(&key.channel, &key.account_id).await) });
        for (key, result) in join_all(stops).await {
            if let Err(e) = result {
                warn!(channel = %key.channel, account_id = %key.account_id, error = %e, "failed to stop account");
            }
        }
    }

    fn read_slots(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, BTreeMap<AccountKey, Arc<AccountSlot>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slots(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, BTreeMap<AccountKey, Arc<AccountSlot>>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_slot(&self, key: &AccountKey) -> Arc<AccountSlot> {
        Arc::clone(
            self.write_slots()
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AccountSlot::new(key))),
        )
    }

    fn slot_for(&self, channel: &str, account_id: &str) -> Result<Arc<AccountSlot>> {
        let key = AccountKey::new(channel, account_id);
        self.read_slots().get(&key).cloned().ok_or_else(|| {
            Error::Channel(switchboard_channels::Error::unknown_account(account_id))
        })
    }
}

async fn inspect(
    adapter: &dyn ChannelConfigAdapter,
    cfg: &SwitchboardConfig,
    account_id: &str,
) -> Result<AccountView> {
    let account = adapter.resolve_account(cfg, account_id)?;
    let enabled = adapter.is_enabled(&account, cfg);
    let (configured, problem) = match adapter.is_configured(&account, cfg).await {
        Ok(configured) => (configured, None),
        Err(e) => {
            warn!(channel = %account.channel, account_id, error = %e, "configuration check failed");
            (false, Some(e.to_string()))
        },
    };
    Ok(AccountView {
        account,
        enabled,
        configured,
        problem,
    })
}

async fn run_start(
    gateway: Arc<dyn ChannelGatewayAdapter>,
    ctx: GatewayContext,
    slot: Arc<AccountSlot>,
    generation: u64,
    events: broadcast::Sender<AccountEvent>,
    done: oneshot::Sender<()>,
) {
    let result = gateway.start_account(ctx.clone()).await;
    let previous = slot.status.get().state;

    let installed = match &result {
        Ok(()) => slot.status.replace_if(|snap| {
            (slot.is_current(generation)
                && snap.state == ChannelAccountState::Starting
                && !ctx.cancel.is_cancelled())
            .then(|| snap.with_state(ChannelAccountState::Running))
        }),
        Err(e) => {
            ctx.cancel.cancel();
            slot.status.replace_if(|snap| {
                (slot.is_current(generation) && snap.state.is_live()).then(|| {
                    let mut next = snap.with_state(ChannelAccountState::Error);
                    next.last_error = Some(e.to_string());
                    next.connected = Some(false);
                    next
                })
            })
        },
    };

    let channel = ctx.account.channel.as_str();
    let account_id = ctx.account_id();
    match result {
        Ok(()) if installed => info!(channel, account_id, "channel account running"),
        Ok(()) => debug!(channel, account_id, "start task finished after lifecycle moved on"),
        Err(e) => warn!(channel, account_id, error = %e, "channel account failed to start"),
    }
    if installed {
        emit(&events, previous, slot.status.get());
    }
    let _ = done.send(());
}

fn emit(
    events: &broadcast::Sender<AccountEvent>,
    previous: ChannelAccountState,
    snapshot: Arc<ChannelAccountSnapshot>,
) {
    if previous == snapshot.state {
        return;
    }
    debug!(
        channel = %snapshot.channel,
        account_id = %snapshot.account_id,
        from = %previous,
        to = %snapshot.state,
        "account state changed"
    );
    // No subscribers is fine.
    let _ = events.send(AccountEvent { previous, snapshot });
}
