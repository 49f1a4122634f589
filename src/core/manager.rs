//! Lifecycle manager - Create, stop and reconcile simulator instances

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::engine::{AircraftSummary, EngineCatalog, LaunchContext};
use super::error::ManagerError;
use super::instance::{Instance, InstanceDescriptor, InstanceId, InstanceState};
use super::monitor::SharedResourceMonitor;
use super::ports::PortAllocator;
use super::process::{Observation, ProcessSupervisor};
use super::registry::InstanceRegistry;
use super::resource::SystemResources;
use super::settings::Settings;
use crate::persistence::Database;
use crate::platform;

/// Per-engine entry of the status report
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub available: bool,
    pub instance_count: usize,
}

/// Telemetry port range and how much of it is free
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct PortStatus {
    pub start: u16,
    pub end: u16,
    pub available: usize,
}

/// Snapshot returned by `system_status`
#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub system: &'static str,
    pub engines: BTreeMap<String, EngineStatus>,
    pub instances: Vec<InstanceDescriptor>,
    pub ports: PortStatus,
    pub resources: SystemResources,
    pub memory_percent: f32,
}

/// What one reconciliation pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub failed: usize,
    /// Stops left unfinished by a cancelled request
    pub stopped: usize,
    pub skipped: usize,
    pub purged: usize,
}

/// Owns every instance and drives it through its lifecycle
///
/// Registry and allocator are never locked across an await. Operations on
/// one instance are serialized by that instance's op lock, so a stop issued
/// while the instance is still starting waits for the create to finish.
pub struct LifecycleManager {
    settings: Settings,
    catalog: EngineCatalog,
    ports: PortAllocator,
    registry: InstanceRegistry,
    supervisor: ProcessSupervisor,
    monitor: SharedResourceMonitor,
    instances_dir: PathBuf,
    max_instances: usize,
    /// Serializes the cap check, port allocation and registration
    admission: Mutex<()>,
    op_locks: Mutex<HashMap<InstanceId, Arc<AsyncMutex<()>>>>,
    /// Consecutive polls that could not observe an instance
    misses: Mutex<HashMap<InstanceId, u32>>,
}

impl LifecycleManager {
    /// Build a manager, restoring persisted records when a database is given
    pub fn new(mut settings: Settings, database: Option<Arc<Database>>) -> Result<Self> {
        settings.validate();
        let instances_dir = settings.get_instances_directory();
        std::fs::create_dir_all(&instances_dir).with_context(|| {
            format!(
                "Failed to create instances directory {}",
                instances_dir.display()
            )
        })?;

        let catalog = EngineCatalog::new(&settings.engines, settings.router.clone());
        let ports = PortAllocator::new(settings.port_range_start, settings.port_range_end);
        let manager = Self {
            catalog,
            ports,
            registry: InstanceRegistry::new(database),
            supervisor: ProcessSupervisor::new(settings.startup_window()),
            monitor: SharedResourceMonitor::new(settings.monitor_interval()),
            instances_dir,
            max_instances: settings.effective_max_instances(),
            admission: Mutex::new(()),
            op_locks: Mutex::new(HashMap::new()),
            misses: Mutex::new(HashMap::new()),
            settings,
        };
        manager.restore()?;

        info!(
            "Lifecycle manager ready: ports {}-{}, max {} instances, engines [{}]",
            manager.settings.port_range_start,
            manager.settings.port_range_end,
            manager.max_instances,
            manager
                .catalog
                .engine_types()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(manager)
    }

    /// Load persisted records from a previous run
    ///
    /// Nothing from a previous run is supervised any more, so live records
    /// are failed. Their PIDs are not signalled since they may have been
    /// reused.
    fn restore(&self) -> Result<()> {
        let Some(db) = self.registry.database().cloned() else {
            return Ok(());
        };
        if let Err(e) = db.cleanup_history(self.settings.history_retention_days) {
            warn!("Failed to clean up instance history: {}", e);
        }

        let records = db
            .load_all_instances()
            .context("Failed to load persisted instances")?;
        let mut orphaned = 0;
        for mut instance in records {
            if instance.state.is_active() {
                warn!(
                    "Instance {} was {} when the manager last exited, marking failed",
                    instance.id, instance.state
                );
                instance.abandon("manager restarted");
                self.registry
                    .record_event(instance.id, "failed", Some("manager restarted"));
                orphaned += 1;
            }
            self.op_locks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(instance.id, Arc::default());
            self.registry.insert(instance);
        }
        if !self.registry.is_empty() {
            info!(
                "Restored {} instance records ({} orphaned)",
                self.registry.len(),
                orphaned
            );
        }
        Ok(())
    }

    fn admission(&self) -> MutexGuard<'_, ()> {
        self.admission.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Every registered instance has an op lock; `None` means it is gone
    fn op_lock(&self, id: InstanceId) -> Option<Arc<AsyncMutex<()>>> {
        self.op_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    fn forget(&self, id: InstanceId) {
        self.op_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        self.misses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    fn record_miss(&self, id: InstanceId) -> u32 {
        let mut misses = self.misses.lock().unwrap_or_else(|e| e.into_inner());
        let count = misses.entry(id).or_insert(0);
        *count += 1;
        *count
    }

    fn clear_misses(&self, id: InstanceId) {
        self.misses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Start an engine/router pair for the requested aircraft
    ///
    /// Returns the instance once both processes survived the startup window.
    /// A spawn failure leaves a `Failed` record behind for inspection.
    pub async fn create(&self, engine: &str, aircraft: &str) -> Result<Instance, ManagerError> {
        let (engine_type, engine_settings, aircraft_spec) = self.catalog.lookup(engine, aircraft)?;

        let id = InstanceId::new();
        let workdir = self.instances_dir.join(id.to_string());

        // Held until the instance is Running or Failed
        let op_lock = Arc::new(AsyncMutex::new(()));
        let _op_guard: OwnedMutexGuard<()> = Arc::clone(&op_lock).lock_owned().await;

        let port = {
            let _admission = self.admission();
            let live = self.registry.count_where(|i| i.state.is_active());
            if live >= self.max_instances {
                return Err(ManagerError::ResourceExhausted(format!(
                    "instance limit of {} reached",
                    self.max_instances
                )));
            }
            let port = self
                .ports
                .allocate()
                .map_err(|e| ManagerError::ResourceExhausted(e.to_string()))?;

            self.op_locks
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id, op_lock);
            self.registry.insert(Instance::with_id(
                id,
                engine_type,
                aircraft_spec.name.clone(),
                port,
                &workdir,
            ));
            port
        };
        let details = format!("{} {} on port {}", engine_type, aircraft_spec.name, port);
        self.registry.record_event(id, "created", Some(&details));
        info!("Instance {}: starting {}", id, details);

        if let Err(e) = tokio::fs::create_dir_all(&workdir).await {
            let reason = format!(
                "failed to create working directory {}: {}",
                workdir.display(),
                e
            );
            return Err(self.fail_startup(id, port, reason));
        }

        let ctx = LaunchContext {
            instance_id: id,
            port,
            slot: self.ports.slot(port),
            aircraft: aircraft_spec,
            workdir: &workdir,
        };
        let (engine_spec, router_spec) = self.catalog.plan_launch(engine_settings, &ctx);

        let (pid_engine, pid_router) = match self
            .supervisor
            .start_pair(id, &engine_spec, &router_spec, self.settings.grace_period())
            .await
        {
            Ok(pids) => pids,
            Err(e) => return Err(self.fail_startup(id, port, e.to_string())),
        };

        let running = self.registry.update_state(id, |i| {
            i.mark_running(pid_engine, pid_router)?;
            Ok(i.clone())
        });
        match running {
            Ok(instance) => {
                self.registry.record_event(
                    id,
                    "running",
                    Some(&format!("engine PID {}, router PID {}", pid_engine, pid_router)),
                );
                info!(
                    "Instance {} running on port {} (engine PID {}, router PID {})",
                    id, port, pid_engine, pid_router
                );
                Ok(instance)
            }
            Err(e) => {
                error!("Instance {} could not be marked running: {}", id, e);
                self.supervisor
                    .stop_pair(id, self.settings.grace_period())
                    .await;
                self.ports.release(port);
                Err(e)
            }
        }
    }

    fn fail_startup(&self, id: InstanceId, port: u16, reason: String) -> ManagerError {
        error!("Instance {} failed to start: {}", id, reason);
        if let Err(e) = self.registry.update_state(id, |i| i.mark_failed(reason.as_str())) {
            warn!("Instance {}: {}", id, e);
        }
        self.ports.release(port);
        self.registry.record_event(id, "failed", Some(&reason));
        ManagerError::SpawnFailed { id, reason }
    }

    /// Stop an instance, waiting at most the grace period per process
    ///
    /// Stopping a terminal instance is a successful no-op.
    pub async fn stop(&self, id: InstanceId) -> Result<Instance, ManagerError> {
        let lock = self.op_lock(id).ok_or(ManagerError::NotFound(id))?;
        let _guard = lock.lock().await;

        let current = self.registry.get(id).ok_or(ManagerError::NotFound(id))?;
        match current.state {
            InstanceState::Stopped | InstanceState::Failed => {
                debug!("Instance {} already {}", id, current.state);
                return Ok(current);
            }
            InstanceState::Starting => {
                // Only reachable when the creating request was dropped mid-start
                self.fail_live(&current, "startup interrupted".to_string())
                    .await;
                return self.registry.get(id).ok_or(ManagerError::NotFound(id));
            }
            InstanceState::Running => {
                self.registry.update_state(id, |i| i.mark_stopping())?;
                self.registry.record_event(id, "stopping", None);
            }
            InstanceState::Stopping => {
                info!("Instance {}: finishing an interrupted stop", id);
            }
        }

        info!("Stopping instance {}", id);
        self.finish_stop(&current).await
    }

    /// Terminate the pair of a `Stopping` instance, then release its port
    async fn finish_stop(&self, instance: &Instance) -> Result<Instance, ManagerError> {
        let id = instance.id;
        self.teardown(instance).await;

        let stopped = self.registry.update_state(id, |i| {
            i.mark_stopped()?;
            Ok(i.clone())
        })?;
        self.ports.release(stopped.port);
        self.clear_misses(id);
        self.registry.record_event(id, "stopped", None);
        info!("Instance {} stopped, port {} released", id, stopped.port);
        Ok(stopped)
    }

    /// Stop whatever is left of an instance's processes
    ///
    /// A cancelled stop drops the handles, which kills only the two session
    /// leaders. Anything else left in their groups is swept by recorded PID.
    async fn teardown(&self, instance: &Instance) {
        let stopped = self
            .supervisor
            .stop_pair(instance.id, self.settings.grace_period())
            .await;
        if stopped.is_none() {
            debug!("Instance {}: no processes held, sweeping groups", instance.id);
            for pid in [instance.pid_router, instance.pid_engine].into_iter().flatten() {
                platform::sweep_group(pid);
            }
        }
    }

    /// Tear down whatever is left of a live instance and record the failure
    async fn fail_live(&self, instance: &Instance, reason: String) {
        let id = instance.id;
        self.teardown(instance).await;
        match self.registry.update_state(id, |i| i.mark_failed(reason.as_str())) {
            Ok(()) => {
                self.ports.release(instance.port);
                self.clear_misses(id);
                self.registry.record_event(id, "failed", Some(&reason));
                error!("Instance {} failed: {}", id, reason);
            }
            Err(e) => warn!("Instance {}: {}", id, e),
        }
    }

    pub fn get(&self, id: InstanceId) -> Result<Instance, ManagerError> {
        self.registry.get(id).ok_or(ManagerError::NotFound(id))
    }

    /// Every known instance, oldest first
    pub fn list(&self) -> Vec<Instance> {
        self.registry.list()
    }

    pub fn describe(&self, instance: &Instance) -> InstanceDescriptor {
        instance.descriptor(&self.settings.public_host)
    }

    /// Delete a terminal record and its working directory
    pub async fn remove(&self, id: InstanceId) -> Result<Instance, ManagerError> {
        let current = self.registry.get(id).ok_or(ManagerError::NotFound(id))?;
        if current.state.is_active() {
            return Err(ManagerError::StillActive {
                id,
                state: current.state,
            });
        }
        let removed = self.registry.remove(id).ok_or(ManagerError::NotFound(id))?;
        self.forget(id);
        self.registry.record_event(id, "removed", None);
        remove_working_dir(&removed.working_dir).await;
        info!("Removed instance {}", id);
        Ok(removed)
    }

    pub fn list_engines(&self) -> BTreeMap<String, Vec<AircraftSummary>> {
        self.catalog.list()
    }

    pub fn system_status(&self) -> SystemStatus {
        let instances = self.registry.list();
        let live = instances.iter().filter(|i| i.state.is_active()).count();
        let engines = self
            .catalog
            .engine_types()
            .map(|engine| {
                let instance_count = instances
                    .iter()
                    .filter(|i| i.engine_type == engine && i.state.is_active())
                    .count();
                let status = EngineStatus {
                    available: live < self.max_instances && self.catalog.is_installed(engine),
                    instance_count,
                };
                (engine.to_string(), status)
            })
            .collect();

        let (start, end) = self.ports.range();
        let resources = self.monitor.get_system_resources();
        SystemStatus {
            system: "online",
            engines,
            instances: instances.iter().map(|i| self.describe(i)).collect(),
            ports: PortStatus {
                start,
                end,
                available: self.ports.available(),
            },
            memory_percent: resources.memory_percent(),
            resources,
        }
    }

    /// One liveness pass over every instance plus retention purge
    ///
    /// Instances with an operation in flight are skipped and picked up on the
    /// next pass. A `Stopping` record nobody is working on belongs to a stop
    /// whose request went away, and the stop is finished here.
    pub async fn reconcile_once(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let snapshot = self.registry.list();

        let pids: Vec<u32> = snapshot
            .iter()
            .filter(|i| i.state == InstanceState::Running)
            .flat_map(|i| [i.pid_engine, i.pid_router])
            .flatten()
            .collect();
        self.monitor.refresh(&pids);

        for instance in snapshot
            .iter()
            .filter(|i| {
                matches!(
                    i.state,
                    InstanceState::Starting | InstanceState::Running | InstanceState::Stopping
                )
            })
        {
            let id = instance.id;
            let Some(lock) = self.op_lock(id) else {
                continue;
            };
            let Ok(_guard) = lock.try_lock_owned() else {
                debug!("Instance {} busy, skipping this pass", id);
                report.skipped += 1;
                continue;
            };
            let Some(current) = self.registry.get(id) else {
                continue;
            };
            report.checked += 1;

            match current.state {
                InstanceState::Running => match self.supervisor.observe(id) {
                    Observation::Alive => {
                        self.clear_misses(id);
                        if let (Some(pe), Some(pr)) = (current.pid_engine, current.pid_router) {
                            let usage = self.monitor.get_pair_usage(pe, pr);
                            if let Some(u) = &usage {
                                trace!(
                                    "Instance {}: cpu {}, memory {}",
                                    id,
                                    u.cpu_string(),
                                    u.memory_string()
                                );
                            }
                            self.registry.set_resources(id, usage);
                        }
                    }
                    Observation::Exited { process, exit } => {
                        let reason = format!("{} exited unexpectedly ({})", process, exit);
                        self.fail_live(&current, reason).await;
                        report.failed += 1;
                    }
                    Observation::Unobservable(detail) => {
                        let misses = self.record_miss(id);
                        let threshold = self.settings.observation_failure_threshold;
                        warn!(
                            "Instance {}: liveness poll failed ({}/{}): {}",
                            id, misses, threshold, detail
                        );
                        if misses >= threshold {
                            let reason = format!("lost track of processes: {}", detail);
                            self.fail_live(&current, reason).await;
                            report.failed += 1;
                        }
                    }
                },
                // Nobody holds the op lock, so the create was abandoned
                InstanceState::Starting => {
                    self.fail_live(&current, "startup interrupted".to_string())
                        .await;
                    report.failed += 1;
                }
                InstanceState::Stopping => {
                    warn!("Instance {}: stop was interrupted, finishing it", id);
                    match self.finish_stop(&current).await {
                        Ok(_) => report.stopped += 1,
                        Err(e) => warn!("Instance {}: {}", id, e),
                    }
                }
                _ => {}
            }
        }

        report.purged = self.purge_expired().await;
        report
    }

    /// Drop terminal records older than the retention window
    pub async fn purge_expired(&self) -> usize {
        let retention = chrono::Duration::from_std(self.settings.retention())
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let now = Utc::now();
        let expired: Vec<InstanceId> = self
            .registry
            .list()
            .into_iter()
            .filter(|i| i.is_expired(retention, now))
            .map(|i| i.id)
            .collect();

        let mut purged = 0;
        for id in expired {
            if let Some(instance) = self.registry.remove(id) {
                self.forget(id);
                remove_working_dir(&instance.working_dir).await;
                debug!("Purged instance {} ({})", id, instance.state);
                purged += 1;
            }
        }
        if purged > 0 {
            info!("Purged {} expired instance records", purged);
        }
        purged
    }

    /// Periodic reconciliation until cancelled
    pub async fn run_reconciler(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.settings.reconcile_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Reconciler started (every {:?})",
            self.settings.reconcile_interval()
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.reconcile_once().await;
                    if report.failed > 0 || report.stopped > 0 || report.purged > 0 {
                        debug!("Reconcile pass: {:?}", report);
                    }
                }
            }
        }
        info!("Reconciler stopped");
    }

    /// Stop every live instance, used on shutdown
    pub async fn stop_all(&self) -> usize {
        let live: Vec<InstanceId> = self
            .registry
            .list()
            .into_iter()
            .filter(|i| i.state.is_active())
            .map(|i| i.id)
            .collect();
        if live.is_empty() {
            return 0;
        }

        info!("Stopping {} instances", live.len());
        let mut stopped = 0;
        for id in live {
            match self.stop(id).await {
                Ok(_) => stopped += 1,
                Err(e) => error!("Failed to stop instance {}: {}", id, e),
            }
        }
        stopped
    }

    pub fn live_count(&self) -> usize {
        self.registry.count_where(|i| i.state.is_active())
    }

    pub fn supervised_count(&self) -> usize {
        self.supervisor.running_count()
    }

    pub fn is_port_allocated(&self, port: u16) -> bool {
        self.ports.is_allocated(port)
    }
}

async fn remove_working_dir(dir: &std::path::Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => debug!("Removed {}", dir.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to clean up {}: {}", dir.display(), e),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::core::{EngineSettings, RouterSettings};
    use crate::platform;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::time::Duration;

    fn sleep_args() -> Vec<String> {
        vec!["30".to_string()]
    }

    fn test_settings(dir: &Path, start: u16, end: u16) -> Settings {
        let mut engine = EngineSettings::px4(dir);
        engine.command = "sleep".to_string();
        engine.args = sleep_args();
        engine.env = BTreeMap::new();
        engine.working_dir = None;
        engine.requires = Vec::new();

        Settings {
            port_range_start: start,
            port_range_end: end,
            grace_period_secs: 1,
            retention_secs: 60,
            startup_window_ms: 100,
            data_directory: Some(dir.to_path_buf()),
            persist: false,
            engines: vec![engine],
            router: RouterSettings {
                command: "sleep".to_string(),
                args: sleep_args(),
                env: BTreeMap::new(),
            },
            ..Default::default()
        }
    }

    fn manager(dir: &Path, start: u16, end: u16) -> LifecycleManager {
        LifecycleManager::new(test_settings(dir, start, end), None).unwrap()
    }

    #[tokio::test]
    async fn create_stop_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 14550, 14552);

        let inst = mgr.create("px4", "x500").await.unwrap();
        assert_eq!(inst.state, InstanceState::Running);
        assert!((14550..=14552).contains(&inst.port));
        assert!(inst.pid_engine.is_some() && inst.pid_router.is_some());
        assert!(inst.working_dir.join("engine.log").exists());

        let fetched = mgr.get(inst.id).unwrap();
        assert_eq!(fetched.state, InstanceState::Running);

        let stopped = mgr.stop(inst.id).await.unwrap();
        assert_eq!(stopped.state, InstanceState::Stopped);
        assert!(!mgr.is_port_allocated(inst.port));
        assert!(!platform::is_process_running(inst.pid_engine.unwrap()));
        assert_eq!(mgr.get(inst.id).unwrap().state, InstanceState::Stopped);

        // Port is handed out again
        let again = mgr.create("PX4", "x500").await.unwrap();
        assert_eq!(again.port, inst.port);
        mgr.stop_all().await;
    }

    #[tokio::test]
    async fn unknown_engine_or_aircraft_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 14550, 14552);

        let err = mgr.create("gazebo-classic", "x500").await.unwrap_err();
        assert!(matches!(err, ManagerError::UnknownEngine(_)));
        assert!(err.is_validation());

        let err = mgr.create("px4", "zeppelin").await.unwrap_err();
        assert!(matches!(err, ManagerError::UnknownAircraft { .. }));
        assert!(mgr.list().is_empty());
    }

    #[tokio::test]
    async fn saturated_range_leaves_registry_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 14550, 14551);

        mgr.create("px4", "iris").await.unwrap();
        mgr.create("px4", "iris").await.unwrap();
        let err = mgr.create("px4", "iris").await.unwrap_err();
        assert!(matches!(err, ManagerError::ResourceExhausted(_)));
        assert_eq!(mgr.list().len(), 2);
        assert_eq!(mgr.stop_all().await, 2);
    }

    #[tokio::test]
    async fn instance_cap_applies_before_port_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path(), 14550, 14559);
        settings.max_instances = 1;
        let mgr = LifecycleManager::new(settings, None).unwrap();

        mgr.create("px4", "iris").await.unwrap();
        let err = mgr.create("px4", "iris").await.unwrap_err();
        assert!(err.to_string().contains("instance limit"), "{}", err);
        assert!(!mgr.system_status().engines["px4"].available);
        mgr.stop_all().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn create_storm_hands_out_distinct_ports() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = Arc::new(manager(dir.path(), 14550, 14552));

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let mgr = Arc::clone(&mgr);
                tokio::spawn(async move { mgr.create("px4", "x500").await })
            })
            .collect();

        let mut ports = Vec::new();
        let mut exhausted = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(inst) => ports.push(inst.port),
                Err(ManagerError::ResourceExhausted(_)) => exhausted += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        ports.sort_unstable();
        assert_eq!(ports, vec![14550, 14551, 14552]);
        assert_eq!(exhausted, 2);
        assert_eq!(mgr.list().len(), 3);
        mgr.stop_all().await;
    }

    #[tokio::test]
    async fn stop_unknown_and_repeated_stop() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 14550, 14552);

        let missing = InstanceId::new();
        assert!(matches!(
            mgr.stop(missing).await,
            Err(ManagerError::NotFound(id)) if id == missing
        ));

        let inst = mgr.create("px4", "rover").await.unwrap();
        let first = mgr.stop(inst.id).await.unwrap();
        let second = mgr.stop(inst.id).await.unwrap();
        assert_eq!(first.state, InstanceState::Stopped);
        assert_eq!(second.state, InstanceState::Stopped);
        assert_eq!(first.stopped_at, second.stopped_at);
    }

    #[tokio::test]
    async fn reconcile_detects_killed_engine() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 14550, 14550);

        let inst = mgr.create("px4", "x500").await.unwrap();
        platform::kill_group(inst.pid_engine.unwrap()).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let report = mgr.reconcile_once().await;
        assert_eq!(report.failed, 1);

        let failed = mgr.get(inst.id).unwrap();
        assert_eq!(failed.state, InstanceState::Failed);
        let reason = failed.last_error.unwrap();
        assert!(reason.contains("engine"), "{}", reason);
        assert!(reason.contains("signal 9"), "{}", reason);
        assert!(!mgr.is_port_allocated(inst.port));
        assert_eq!(mgr.supervised_count(), 0);
        assert!(!platform::is_process_running(inst.pid_router.unwrap()));

        // The single port is usable again
        let next = mgr.create("px4", "x500").await.unwrap();
        assert_eq!(next.port, inst.port);
        mgr.stop_all().await;
    }

    #[tokio::test]
    async fn unobservable_instance_fails_after_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 14550, 14550);
        let threshold = mgr.settings().observation_failure_threshold;
        assert!(threshold > 1);

        let inst = mgr.create("px4", "x500").await.unwrap();
        // Supervisor loses its handles while the record still says Running
        mgr.supervisor
            .stop_pair(inst.id, Duration::from_secs(1))
            .await
            .unwrap();

        for _ in 1..threshold {
            let report = mgr.reconcile_once().await;
            assert_eq!(report.failed, 0);
            assert_eq!(mgr.get(inst.id).unwrap().state, InstanceState::Running);
            assert!(mgr.is_port_allocated(inst.port));
        }

        let report = mgr.reconcile_once().await;
        assert_eq!(report.failed, 1);
        let failed = mgr.get(inst.id).unwrap();
        assert_eq!(failed.state, InstanceState::Failed);
        let reason = failed.last_error.unwrap();
        assert!(reason.contains("lost track"), "{}", reason);
        assert!(!mgr.is_port_allocated(inst.port));
        assert_eq!(mgr.live_count(), 0);
    }

    #[tokio::test]
    async fn successful_poll_resets_misses() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 14550, 14552);
        let inst = mgr.create("px4", "iris").await.unwrap();

        for _ in 1..mgr.settings().observation_failure_threshold {
            mgr.record_miss(inst.id);
        }
        let report = mgr.reconcile_once().await;
        assert_eq!(report.failed, 0);
        assert_eq!(mgr.get(inst.id).unwrap().state, InstanceState::Running);
        // Counting starts over after the healthy poll
        assert_eq!(mgr.record_miss(inst.id), 1);
        mgr.stop_all().await;
    }

    #[tokio::test]
    async fn interrupted_stop_is_finished_by_reconcile() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path(), 14550, 14550);
        settings.grace_period_secs = 2;
        settings.engines[0].command = "sh".to_string();
        settings.engines[0].args = vec!["-c".to_string(), "trap '' TERM; sleep 30".to_string()];
        let mgr = Arc::new(LifecycleManager::new(settings, None).unwrap());

        let inst = mgr.create("px4", "x500").await.unwrap();
        let stopping = {
            let mgr = Arc::clone(&mgr);
            let id = inst.id;
            tokio::spawn(async move { mgr.stop(id).await })
        };
        // The engine ignores SIGTERM, so the stop sits in its grace period
        tokio::time::sleep(Duration::from_millis(300)).await;
        stopping.abort();
        assert!(stopping.await.unwrap_err().is_cancelled());
        assert_eq!(mgr.get(inst.id).unwrap().state, InstanceState::Stopping);
        assert!(mgr.is_port_allocated(inst.port));

        let report = mgr.reconcile_once().await;
        assert_eq!(report.stopped, 1);
        assert_eq!(report.failed, 0);
        let stopped = mgr.get(inst.id).unwrap();
        assert_eq!(stopped.state, InstanceState::Stopped);
        assert!(stopped.stopped_at.is_some());
        assert!(!mgr.is_port_allocated(inst.port));
        assert_eq!(mgr.live_count(), 0);

        let next = mgr.create("px4", "x500").await.unwrap();
        assert_eq!(next.port, inst.port);
        mgr.stop_all().await;
    }

    #[tokio::test]
    async fn healthy_instances_survive_reconcile() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 14550, 14552);
        let inst = mgr.create("px4", "solo").await.unwrap();

        let report = mgr.reconcile_once().await;
        assert_eq!(report.checked, 1);
        assert_eq!(report.failed, 0);
        assert_eq!(mgr.get(inst.id).unwrap().state, InstanceState::Running);
        mgr.stop_all().await;
    }

    #[tokio::test]
    async fn spawn_failure_keeps_failed_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path(), 14550, 14552);
        settings.router.command = "sh".to_string();
        settings.router.args = vec!["-c".to_string(), "echo 'bind failed' >&2; exit 1".to_string()];
        let mgr = LifecycleManager::new(settings, None).unwrap();

        let err = mgr.create("px4", "x500").await.unwrap_err();
        let ManagerError::SpawnFailed { id, reason } = err else {
            panic!("unexpected error {:?}", err);
        };
        assert!(reason.contains("bind failed"), "{}", reason);

        let record = mgr.get(id).unwrap();
        assert_eq!(record.state, InstanceState::Failed);
        assert_eq!(record.last_error.as_deref(), Some(reason.as_str()));
        assert!(!mgr.is_port_allocated(record.port));
        assert_eq!(mgr.supervised_count(), 0);
        assert_eq!(mgr.live_count(), 0);
    }

    #[tokio::test]
    async fn stop_waits_for_create() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path(), 14550, 14552);
        settings.startup_window_ms = 400;
        let mgr = Arc::new(LifecycleManager::new(settings, None).unwrap());

        let creating = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.create("px4", "plane").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let pending = mgr.list();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].state, InstanceState::Starting);

        let stopped = mgr.stop(pending[0].id).await.unwrap();
        assert_eq!(stopped.state, InstanceState::Stopped);
        assert!(stopped.started_at.is_some());

        let created = creating.await.unwrap().unwrap();
        assert_eq!(created.state, InstanceState::Running);
        assert_eq!(mgr.live_count(), 0);
    }

    #[tokio::test]
    async fn reconcile_skips_busy_instances() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path(), 14550, 14552);
        settings.startup_window_ms = 400;
        let mgr = Arc::new(LifecycleManager::new(settings, None).unwrap());

        let creating = {
            let mgr = Arc::clone(&mgr);
            tokio::spawn(async move { mgr.create("px4", "iris").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let report = mgr.reconcile_once().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);

        let created = creating.await.unwrap().unwrap();
        assert_eq!(created.state, InstanceState::Running);
        mgr.stop_all().await;
    }

    #[tokio::test]
    async fn expired_records_are_purged() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = test_settings(dir.path(), 14550, 14552);
        settings.retention_secs = 0;
        let mgr = LifecycleManager::new(settings, None).unwrap();

        let inst = mgr.create("px4", "x500").await.unwrap();
        mgr.stop(inst.id).await.unwrap();
        assert!(inst.working_dir.exists());

        let report = mgr.reconcile_once().await;
        assert_eq!(report.purged, 1);
        assert!(matches!(mgr.get(inst.id), Err(ManagerError::NotFound(_))));
        assert!(!inst.working_dir.exists());
    }

    #[tokio::test]
    async fn remove_requires_terminal_state() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 14550, 14552);

        let inst = mgr.create("px4", "x500").await.unwrap();
        let err = mgr.remove(inst.id).await.unwrap_err();
        assert!(matches!(err, ManagerError::StillActive { state: InstanceState::Running, .. }));

        mgr.stop(inst.id).await.unwrap();
        let removed = mgr.remove(inst.id).await.unwrap();
        assert_eq!(removed.id, inst.id);
        assert!(!inst.working_dir.exists());
        assert!(matches!(mgr.remove(inst.id).await, Err(ManagerError::NotFound(_))));
    }

    #[tokio::test]
    async fn stop_after_remove_leaves_no_lock_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 14550, 14552);

        let inst = mgr.create("px4", "x500").await.unwrap();
        mgr.stop(inst.id).await.unwrap();
        mgr.remove(inst.id).await.unwrap();

        assert!(matches!(
            mgr.stop(inst.id).await,
            Err(ManagerError::NotFound(id)) if id == inst.id
        ));
        assert!(!mgr.op_locks.lock().unwrap().contains_key(&inst.id));
        assert!(mgr.op_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn restore_fails_orphaned_records() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(Database::open_in_memory().unwrap());
        db.initialize().unwrap();

        let mut orphan = Instance::new(
            crate::core::EngineType::Px4,
            "x500",
            14550,
            dir.path().join("orphan"),
        );
        orphan.mark_running(999_999, 999_998).unwrap();
        db.save_instance(&orphan).unwrap();

        let mgr = LifecycleManager::new(test_settings(dir.path(), 14550, 14552), Some(Arc::clone(&db)))
            .unwrap();
        let restored = mgr.get(orphan.id).unwrap();
        assert_eq!(restored.state, InstanceState::Failed);
        assert_eq!(restored.last_error.as_deref(), Some("manager restarted"));
        assert!(!mgr.is_port_allocated(14550));
        assert_eq!(db.load_all_instances().unwrap()[0].state, InstanceState::Failed);

        // Restored records can be stopped (a no-op) and removed like any other
        let again = mgr.stop(orphan.id).await.unwrap();
        assert_eq!(again.state, InstanceState::Failed);
        mgr.remove(orphan.id).await.unwrap();
        assert!(mgr.list().is_empty());
    }

    #[tokio::test]
    async fn status_reports_engines_and_instances() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(dir.path(), 14550, 14552);
        let inst = mgr.create("px4", "x500").await.unwrap();

        let status = mgr.system_status();
        assert_eq!(status.system, "online");
        let px4 = &status.engines["px4"];
        assert!(px4.available);
        assert_eq!(px4.instance_count, 1);
        assert_eq!(status.instances.len(), 1);
        assert_eq!(status.instances[0].id, inst.id);
        assert_eq!(
            status.ports,
            PortStatus {
                start: 14550,
                end: 14552,
                available: 2,
            }
        );
        assert!((0.0..=100.0).contains(&status.memory_percent));

        let engines = mgr.list_engines();
        assert_eq!(engines["px4"].len(), 5);
        mgr.stop_all().await;
    }

    #[tokio::test]
    async fn reconciler_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = Arc::new(manager(dir.path(), 14550, 14552));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&mgr).run_reconciler(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
