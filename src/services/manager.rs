//! Service supervisor.
//!
//! [`ServiceManager`] sits above the worker supervisor: it owns the service
//! configs, metadata and error history, starts each running service in its own
//! worker, and decides after every crash whether a delayed restart is allowed.
//!
//! State lives behind one short `parking_lot` mutex that is never held across
//! an await. Worker callbacks run on the worker supervisor's task, so they only
//! touch that state, emit broadcasts and spawn restart timers.

use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::discovery;
use super::policy::RestartPolicy;
use super::types::{merge_export, ServiceConfig, ServiceMeta, ServiceStatus};
use crate::commbus::{BroadcastSink, CommandEnvelope};
use crate::types::{Error, ErrorReport, Result, ServiceId, SupervisorConfig, WorkerId};
use crate::worker::{WorkerKind, WorkerStartup};
use crate::workers::{SpawnRequest, WorkerCallbacks, WorkerMessage, WorkersManager};

/// Channel carrying config updates of one service.
pub fn update_channel(id: &ServiceId) -> String {
    format!("manager.service.{id}.update")
}

#[derive(Clone)]
pub struct ServiceManager {
    inner: Arc<Inner>,
}

struct Inner {
    workers: WorkersManager,
    broadcasts: Arc<dyn BroadcastSink>,
    config: SupervisorConfig,
    policy: RestartPolicy,
    state: Mutex<State>,
    /// Signalled whenever a start attempt finishes.
    start_settled: Notify,
}

#[derive(Default)]
struct State {
    services: BTreeMap<ServiceId, ServiceConfig>,
    meta: HashMap<ServiceId, ServiceMeta>,
    /// Most recent first.
    errors: HashMap<ServiceId, VecDeque<ErrorReport>>,
    /// Worker currently associated with each running service.
    workers: HashMap<ServiceId, WorkerId>,
    starting: HashSet<ServiceId>,
    timers: HashMap<ServiceId, CancellationToken>,
    /// Set by `shutdown`; no service starts afterwards.
    closing: bool,
}

impl State {
    fn config(&self, id: &ServiceId) -> Result<&ServiceConfig> {
        self.services
            .get(id)
            .ok_or_else(|| Error::ServiceNotFound(id.clone()))
    }

    fn config_mut(&mut self, id: &ServiceId) -> Result<&mut ServiceConfig> {
        self.services
            .get_mut(id)
            .ok_or_else(|| Error::ServiceNotFound(id.clone()))
    }

    fn command_payload(&self, id: &ServiceId) -> Result<Value> {
        let config = self.config(id)?;
        Ok(json!({
            "service": id,
            "meta": self.meta.get(id).cloned().unwrap_or_default(),
            "info": config,
        }))
    }
}

impl ServiceManager {
    pub fn new(
        workers: WorkersManager,
        broadcasts: Arc<dyn BroadcastSink>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                workers,
                broadcasts,
                policy: RestartPolicy::from_config(&config),
                config,
                state: Mutex::new(State::default()),
                start_settled: Notify::new(),
            }),
        }
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    pub fn workers(&self) -> &WorkersManager {
        &self.inner.workers
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn service(&self, id: &ServiceId) -> Result<ServiceConfig> {
        self.inner.state.lock().config(id).cloned()
    }

    pub fn meta(&self, id: &ServiceId) -> Result<ServiceMeta> {
        let state = self.inner.state.lock();
        state.config(id)?;
        state
            .meta
            .get(id)
            .cloned()
            .ok_or_else(|| Error::MetaNotFound(id.clone()))
    }

    /// Every service, config merged with metadata, keyed by id.
    pub fn list(&self) -> Value {
        let state = self.inner.state.lock();
        let list: Map<String, Value> = state
            .services
            .iter()
            .map(|(id, config)| (id.to_string(), merge_export(config, state.meta.get(id))))
            .collect();
        Value::Object(list)
    }

    pub fn status(&self, id: &ServiceId) -> Result<ServiceStatus> {
        let state = self.inner.state.lock();
        let config = state.config(id)?;
        Ok(if state.starting.contains(id) {
            ServiceStatus::Starting
        } else if config.run {
            ServiceStatus::Running
        } else if state.timers.contains_key(id) {
            ServiceStatus::RestartScheduled
        } else {
            ServiceStatus::Stopped
        })
    }

    /// Worker currently running the service.
    pub fn worker_of(&self, id: &ServiceId) -> Option<WorkerId> {
        self.inner.state.lock().workers.get(id).copied()
    }

    /// Recorded errors, nested causes flattened.
    pub fn errors(&self, id: &ServiceId) -> Result<Vec<ErrorReport>> {
        let state = self.inner.state.lock();
        state.config(id)?;
        let Some(records) = state.errors.get(id) else {
            return Ok(Vec::new());
        };
        Ok(records
            .iter()
            .flat_map(|record| {
                if record.nested.is_empty() {
                    vec![record.clone()]
                } else {
                    record.nested.clone()
                }
            })
            .collect())
    }

    pub fn clear_errors(&self, id: &ServiceId) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            state.config_mut(id)?.errors = 0;
            state.errors.remove(id);
        }
        self.publish(id);
        Ok(())
    }

    // =========================================================================
    // Discovery
    // =========================================================================

    /// Rescan every services dir and return the merged list.
    ///
    /// New definitions are added, re-appearing ones are un-deleted, and
    /// definitions whose file vanished are dropped, or only flagged `deleted`
    /// while their service still runs.
    pub fn update_list(&self) -> Result<Value> {
        let mut found = Vec::new();
        for dir in &self.inner.config.services_dirs {
            found.extend(discovery::scan_dir(&dir.dir)?);
        }

        let known: Vec<(ServiceId, PathBuf)> = {
            let mut state = self.inner.state.lock();
            for discovered in found {
                let id = discovered.id;
                state.meta.insert(id.clone(), discovered.meta);
                match state.services.get_mut(&id) {
                    Some(config) => config.deleted = false,
                    None => {
                        tracing::info!(service = %id, "service discovered");
                        let config = ServiceConfig::new(id.clone(), &discovered.dir);
                        state.services.insert(id, config);
                    }
                }
            }
            state
                .services
                .iter()
                .map(|(id, config)| (id.clone(), config.file_path.clone()))
                .collect()
        };

        let vanished: Vec<ServiceId> = known
            .into_iter()
            .filter(|(_, path)| !path.is_file())
            .map(|(id, _)| id)
            .collect();

        if !vanished.is_empty() {
            let mut state = self.inner.state.lock();
            for id in vanished {
                let active = state.starting.contains(&id)
                    || state.services.get(&id).is_some_and(|config| config.run);
                if active {
                    if let Some(config) = state.services.get_mut(&id) {
                        config.deleted = true;
                    }
                } else {
                    tracing::info!(service = %id, "service definition removed");
                    state.services.remove(&id);
                    state.meta.remove(&id);
                    state.errors.remove(&id);
                    if let Some(timer) = state.timers.remove(&id) {
                        timer.cancel();
                    }
                }
            }
        }

        Ok(self.list())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start a service in a new worker.
    pub async fn start(&self, id: &ServiceId) -> Result<ServiceConfig> {
        let (startup, isolated) = {
            let mut state = self.inner.state.lock();
            if state.closing {
                return Err(Error::ShuttingDown);
            }
            if state.starting.contains(id) {
                return Err(Error::ServiceRunning(id.clone()));
            }
            let config = state.config_mut(id)?;
            if config.run {
                return Err(Error::ServiceRunning(id.clone()));
            }
            config.auto_reload = false;
            let startup = startup_for(config, WorkerKind::Worker);
            let isolated = state.meta.get(id).is_some_and(|meta| meta.isolated);
            // An explicit start supersedes a pending restart.
            if let Some(timer) = state.timers.remove(id) {
                timer.cancel();
            }
            state.starting.insert(id.clone());
            (startup, isolated)
        };

        let outcome = self.launch(id, startup, isolated).await;
        let started = {
            let mut state = self.inner.state.lock();
            state.starting.remove(id);
            match outcome {
                Ok(worker) if state.workers.get(id) == Some(&worker) => {
                    state.config_mut(id).map(|config| {
                        config.run = true;
                        config.started_at = Some(Utc::now());
                        config.clone()
                    })
                }
                // The worker exited while the service was starting.
                Ok(_) => Err(Error::WorkerExited),
                Err(err) => Err(err),
            }
        };
        self.inner.start_settled.notify_waiters();

        match &started {
            Ok(_) => {
                tracing::info!(service = %id, "service started");
                self.publish(id);
            }
            Err(err) => tracing::warn!(service = %id, error = %err, "service start failed"),
        }
        started
    }

    async fn launch(
        &self,
        id: &ServiceId,
        startup: WorkerStartup,
        isolated: bool,
    ) -> Result<WorkerId> {
        let request = SpawnRequest::new(startup.to_value()?, self.worker_callbacks(id.clone()))
            .isolated(isolated);
        let worker = self.inner.workers.spawn(request).await?;
        self.inner
            .state
            .lock()
            .workers
            .insert(id.clone(), worker);

        let started = async {
            let payload = self.inner.state.lock().command_payload(id)?;
            let command = WorkerMessage::request("serviceStart", payload);
            self.inner.workers.request(worker, command).await
        }
        .await;

        if let Err(err) = started {
            // Neither the half-started worker nor its association may survive.
            // The worker can be gone already, its exit seen before the insert.
            if let Err(stop_err) = self.inner.workers.terminate(worker).await {
                tracing::warn!(service = %id, error = %stop_err, "failed to stop worker");
            }
            let mut state = self.inner.state.lock();
            if state.workers.get(id) == Some(&worker) {
                state.workers.remove(id);
            }
            return Err(err);
        }
        Ok(worker)
    }

    /// Stop a running service, or cancel its pending restart.
    pub async fn stop(&self, id: &ServiceId) -> Result<ServiceConfig> {
        let worker = {
            let mut state = self.inner.state.lock();
            let running = state.config(id)?.run;
            if !running {
                if let Some(timer) = state.timers.remove(id) {
                    timer.cancel();
                    tracing::info!(service = %id, "pending restart cancelled");
                    return state.config(id).cloned();
                }
                return Err(Error::ServiceNotRunning(id.clone()));
            }
            state.config_mut(id)?.auto_reload = false;
            state.workers.get(id).copied()
        };

        if let Some(worker) = worker {
            self.inner.workers.terminate(worker).await?;
            // The exit callback may still be in flight; settle the state now.
            let mut state = self.inner.state.lock();
            if state.workers.get(id) == Some(&worker) {
                state.workers.remove(id);
            }
            if let Some(config) = state.services.get_mut(id) {
                config.run = false;
            }
        }
        tracing::info!(service = %id, "service stopped");
        self.publish(id);
        self.service(id)
    }

    /// Run the service's check in a throwaway worker.
    ///
    /// Failures are recorded in the service's error history but never
    /// trigger a restart.
    pub async fn check(&self, id: &ServiceId) -> Result<Value> {
        let (startup, payload) = {
            let state = self.inner.state.lock();
            let config = state.config(id)?;
            (startup_for(config, WorkerKind::Check), state.command_payload(id)?)
        };

        let weak = Arc::downgrade(&self.inner);
        let service = id.clone();
        let callbacks = WorkerCallbacks::new(
            move |_, report| {
                if let Some(manager) = Self::from_weak(&weak) {
                    manager.record_error(&service, report);
                }
            },
            |_| {},
        );

        let worker = self
            .inner
            .workers
            .spawn(SpawnRequest::new(startup.to_value()?, callbacks))
            .await?;
        let outcome = self
            .inner
            .workers
            .request(worker, WorkerMessage::request("serviceCheck", payload))
            .await;
        if let Err(err) = self.inner.workers.terminate(worker).await {
            tracing::warn!(service = %id, error = %err, "failed to stop check worker");
        }

        outcome?;
        Ok(json!({}))
    }

    /// Forward a command into the worker of the service named by `data.service`.
    pub async fn submaster(&self, envelope: CommandEnvelope) -> Result<Value> {
        let id = envelope
            .data
            .get("service")
            .and_then(Value::as_str)
            .and_then(|service| ServiceId::try_from(service).ok())
            .ok_or(Error::SubmasterCommandNotFound)?;

        let worker = {
            let state = self.inner.state.lock();
            state.config(&id)?;
            state
                .workers
                .get(&id)
                .copied()
                .ok_or_else(|| Error::ServiceNotRunning(id.clone()))?
        };

        self.inner
            .workers
            .request(
                worker,
                WorkerMessage::request(envelope.command, envelope.data),
            )
            .await
    }

    /// Start every service whose metadata asks for it.
    pub async fn start_autostart(&self) {
        if !self.inner.config.auto_start {
            tracing::debug!("autostart disabled");
            return;
        }
        let ids: Vec<ServiceId> = {
            let state = self.inner.state.lock();
            state
                .services
                .keys()
                .filter(|id| state.meta.get(*id).is_some_and(|meta| meta.auto_start))
                .cloned()
                .collect()
        };
        for id in ids {
            if let Err(err) = self.start(&id).await {
                self.record_error(&id, err.to_report());
            }
        }
    }

    /// Cancel pending restarts and stop every running service.
    ///
    /// Starts still in flight are waited for and then stopped; later starts
    /// fail with `SHUTTING_DOWN`.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            state.closing = true;
            for (_, timer) in state.timers.drain() {
                timer.cancel();
            }
        }

        loop {
            let settled = self.inner.start_settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();
            if self.inner.state.lock().starting.is_empty() {
                break;
            }
            settled.await;
        }

        let running: Vec<ServiceId> = {
            let state = self.inner.state.lock();
            state
                .services
                .values()
                .filter(|config| config.run)
                .map(|config| config.id.clone())
                .collect()
        };
        for id in running {
            if let Err(err) = self.stop(&id).await {
                tracing::warn!(service = %id, error = %err, "service stop failed during shutdown");
            }
        }
        tracing::info!("service manager shut down");
    }

    // =========================================================================
    // Worker callbacks
    // =========================================================================

    fn worker_callbacks(&self, id: ServiceId) -> WorkerCallbacks {
        let on_error = Arc::downgrade(&self.inner);
        let on_exit = Arc::downgrade(&self.inner);
        let service = id.clone();
        WorkerCallbacks::new(
            move |_, report| {
                if let Some(manager) = Self::from_weak(&on_error) {
                    manager.on_worker_error(&service, report);
                }
            },
            move |worker| {
                if let Some(manager) = Self::from_weak(&on_exit) {
                    manager.on_worker_exit(&id, worker);
                }
            },
        )
    }

    fn on_worker_error(&self, id: &ServiceId, report: ErrorReport) {
        {
            let mut state = self.inner.state.lock();
            let meta_allows = state.meta.get(id).is_some_and(|meta| meta.auto_reload);
            let reload = self.inner.policy.evaluate(meta_allows, &report);
            if let Some(config) = state.services.get_mut(id) {
                config.auto_reload = reload;
            }
        }
        self.record_error(id, report);
    }

    fn on_worker_exit(&self, id: &ServiceId, worker: WorkerId) {
        let schedule = {
            let mut state = self.inner.state.lock();
            match state.workers.get(id) {
                Some(current) if *current != worker => {
                    tracing::debug!(service = %id, worker_id = %worker, "exit of replaced worker ignored");
                    return;
                }
                Some(_) => {
                    state.workers.remove(id);
                }
                None => {}
            }
            let Some(config) = state.services.get_mut(id) else {
                return;
            };
            config.run = false;
            let schedule = config.auto_reload && !state.timers.contains_key(id);
            if schedule {
                let token = CancellationToken::new();
                state.timers.insert(id.clone(), token.clone());
                Some(token)
            } else {
                None
            }
        };

        tracing::info!(service = %id, worker_id = %worker, restart = schedule.is_some(), "service worker exited");
        self.publish(id);

        if let Some(token) = schedule {
            self.spawn_restart(id.clone(), token);
        }
    }

    fn spawn_restart(&self, id: ServiceId, token: CancellationToken) {
        let weak = Arc::downgrade(&self.inner);
        let delay = self.inner.policy.delay();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(manager) = Self::from_weak(&weak) else {
                return;
            };
            {
                let mut state = manager.inner.state.lock();
                if token.is_cancelled() {
                    return;
                }
                state.timers.remove(&id);
                let skip = state.starting.contains(&id)
                    || state.services.get(&id).map_or(true, |config| config.run);
                if skip {
                    return;
                }
            }
            tracing::info!(service = %id, "restarting service");
            if let Err(err) = manager.start(&id).await {
                tracing::warn!(service = %id, error = %err, "service restart failed");
            }
        });
    }

    /// Record an error against a service and broadcast the change.
    pub fn record_error(&self, id: &ServiceId, report: ErrorReport) {
        if self.inner.config.print_errors {
            tracing::error!(service = %id, code = %report.code, "service error: {report}");
        }
        {
            let mut state = self.inner.state.lock();
            let Some(config) = state.services.get_mut(id) else {
                return;
            };
            let store = config.errors <= self.inner.config.max_recorded_errors;
            config.errors = config.errors.saturating_add(1);
            if store {
                state.errors.entry(id.clone()).or_default().push_front(report);
            }
        }
        self.publish(id);
    }

    fn publish(&self, id: &ServiceId) {
        let snapshot = self.inner.state.lock().services.get(id).cloned();
        let Some(config) = snapshot else {
            return;
        };
        match serde_json::to_value(&config) {
            Ok(data) => self.inner.broadcasts.emit(&update_channel(id), data),
            Err(err) => tracing::warn!(service = %id, error = %err, "service update not serializable"),
        }
    }
}

impl std::fmt::Debug for ServiceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceManager").finish_non_exhaustive()
    }
}

/// Startup payload of a service worker: a process override replaces the
/// default process definition, otherwise the config overlay applies.
fn startup_for(config: &ServiceConfig, kind: WorkerKind) -> WorkerStartup {
    let startup = WorkerStartup::new(config.id.clone(), kind);
    if config.process_path.is_file() {
        startup.with_process_file(config.process_path.clone())
    } else if config.config_path.is_file() {
        startup.with_conf_file(config.config_path.clone())
    } else {
        startup
    }
}
