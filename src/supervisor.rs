use crate::audit::{AuditEvent, AuditLogger, Decision};
use crate::config::{normalize_url, Config, ProcessConfig};
use crate::discovery::{BinaryLocator, BinarySource, DiscoveryError, LocatedBinary};
use crate::error::{ErrorCode, GatewayError};
use crate::inspector::{ProcessInspector, Signal};
use crate::validate::{validate_compute_capacity, validate_identifier, validate_path, PathKind, PathPolicy};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Compute capacity given to a worker when the caller does not choose one
pub const DEFAULT_WORKER_CAPACITY: u32 = 10;

/// Which process a handle refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Coordinator,
    Worker,
}

impl Role {
    /// Environment variable that overrides binary discovery for this role
    pub fn binary_env_var(&self) -> &'static str {
        match self {
            Role::Coordinator => "COORDINATOR_BIN",
            Role::Worker => "WORKER_BIN",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Coordinator => write!(f, "coordinator"),
            Role::Worker => write!(f, "worker"),
        }
    }
}

/// How a managed process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExitInfo {
    pub code: Option<i32>,
}

/// A process spawned by this gateway
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pub role: Role,
    /// Worker id; `None` for the coordinator
    pub id: Option<String>,
    pub pid: u32,
    pub binary: PathBuf,
    pub started_at: DateTime<Utc>,
    pub compute_capacity: Option<u32>,
    generation: u64,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl ProcessHandle {
    /// Handles are only created for processes this gateway spawned
    pub fn managed(&self) -> bool {
        true
    }

    /// Exit status if the process has been reaped
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_info().is_some()
    }
}

/// Tracked process handles, shared by clone.
///
/// Every method takes its lock for a single synchronous step, so a handle is
/// never observed half-updated by a task interleaved at an `.await`.
#[derive(Debug, Clone, Default)]
pub struct SupervisorState {
    coordinator: Arc<Mutex<Option<ProcessHandle>>>,
    workers: Arc<DashMap<String, ProcessHandle>>,
    generation: Arc<AtomicU64>,
}

impl SupervisorState {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn coordinator(&self) -> Option<ProcessHandle> {
        self.coordinator.lock().clone()
    }

    /// Install `handle` unless a live coordinator is already tracked.
    /// Returns the live handle on conflict.
    fn install_coordinator(&self, handle: ProcessHandle) -> Result<(), ProcessHandle> {
        let mut slot = self.coordinator.lock();
        if let Some(existing) = slot.as_ref() {
            if !existing.has_exited() {
                return Err(existing.clone());
            }
        }
        *slot = Some(handle);
        Ok(())
    }

    fn take_coordinator(&self) -> Option<ProcessHandle> {
        self.coordinator.lock().take()
    }

    /// Clear the coordinator slot if it still holds `generation`
    fn clear_coordinator_if(&self, generation: u64) -> bool {
        let mut slot = self.coordinator.lock();
        if slot.as_ref().map(|h| h.generation) == Some(generation) {
            *slot = None;
            return true;
        }
        false
    }

    pub fn worker(&self, id: &str) -> Option<ProcessHandle> {
        self.workers.get(id).map(|h| h.value().clone())
    }

    /// Clone out every tracked worker, ordered by id
    pub fn workers(&self) -> Vec<ProcessHandle> {
        let mut handles: Vec<ProcessHandle> = self.workers.iter().map(|e| e.value().clone()).collect();
        handles.sort_by(|a, b| a.id.cmp(&b.id));
        handles
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn install_worker(&self, id: &str, handle: ProcessHandle) -> Result<(), ProcessHandle> {
        use dashmap::mapref::entry::Entry;
        match self.workers.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().has_exited() {
                    return Err(entry.get().clone());
                }
                entry.insert(handle);
                Ok(())
            }
            Entry::Vacant(entry) => {
                entry.insert(handle);
                Ok(())
            }
        }
    }

    fn remove_worker(&self, id: &str) -> Option<ProcessHandle> {
        self.workers.remove(id).map(|(_, h)| h)
    }

    fn remove_worker_if(&self, id: &str, generation: u64) -> bool {
        self.workers.remove_if(id, |_, h| h.generation == generation).is_some()
    }

    /// Drop every worker handle, returning what was tracked
    fn clear_workers(&self) -> Vec<ProcessHandle> {
        let ids: Vec<String> = self.workers.iter().map(|e| e.key().clone()).collect();
        ids.iter().filter_map(|id| self.remove_worker(id)).collect()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    BinaryNotFound(#[from] DiscoveryError),

    #[error("The {role} is already running (pid {pid})")]
    AlreadyRunning { role: Role, pid: u32 },

    #[error("The {role} is already running externally (pid {}). Stop it first or use the running instance.", join_pids(.pids))]
    AlreadyRunningExternally { role: Role, pids: Vec<u32> },

    #[error("Worker '{id}' is already running (pid {pid})")]
    WorkerAlreadyRunning { id: String, pid: u32 },

    #[error("Failed to start the {role} from {}: {source}", .path.display())]
    Spawn {
        role: Role,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("The {role} exited immediately after starting (exit code {}). Check the gateway log for its output.", .code.map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string()))]
    ExitedImmediately { role: Role, code: Option<i32> },

    #[error("{0}")]
    InvalidArgument(String),

    #[error("Worker '{0}' is not tracked by this gateway")]
    UnknownWorker(String),

    #[error("Could not inspect running processes: {0}")]
    Inspect(#[source] std::io::Error),

    #[error("Could not signal pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn join_pids(pids: &[u32]) -> String {
    pids.iter().map(u32::to_string).collect::<Vec<_>>().join(", ")
}

impl SupervisorError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SupervisorError::AlreadyRunning { .. }
            | SupervisorError::AlreadyRunningExternally { .. }
            | SupervisorError::WorkerAlreadyRunning { .. }
            | SupervisorError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            SupervisorError::UnknownWorker(_) => ErrorCode::NotFound,
            _ => ErrorCode::Internal,
        }
    }

    pub fn status_code(&self) -> hyper::StatusCode {
        self.code().status_code()
    }
}

impl From<GatewayError> for SupervisorError {
    fn from(e: GatewayError) -> Self {
        SupervisorError::InvalidArgument(e.to_string())
    }
}

/// Supervisor failures are operator-facing, so their text is passed through
/// unredacted.
impl From<SupervisorError> for GatewayError {
    fn from(e: SupervisorError) -> Self {
        let message = e.to_string();
        match e.code() {
            ErrorCode::InvalidArgument => GatewayError::InvalidArgument(message),
            ErrorCode::NotFound => GatewayError::NotFound(message),
            _ => GatewayError::Internal(message),
        }
    }
}

/// Result of a successful start
#[derive(Debug, Clone, Serialize)]
pub struct StartedProcess {
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    pub pid: u32,
    pub binary: PathBuf,
    pub source: BinarySource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_capacity: Option<u32>,
}

/// Result of a stop request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StopOutcome {
    NotRunning,
    Stopped {
        pids: Vec<u32>,
        managed: bool,
        /// A forceful kill was needed
        forced: bool,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStatus {
    pub running: bool,
    pub managed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub external_pids: Vec<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub pid: u32,
    pub running: bool,
    pub managed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compute_capacity: Option<u32>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Arguments for starting a worker
#[derive(Debug, Clone, Default)]
pub struct WorkerLaunch {
    pub elf_path: String,
    pub input_path: String,
    pub compute_capacity: Option<f64>,
    pub worker_id: Option<String>,
}

/// Everything the supervisor needs besides its collaborators
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub process: ProcessConfig,
    /// Passed to spawned workers, scheme included
    pub coordinator_url: String,
    pub max_compute_capacity: u32,
    pub path_policy: PathPolicy,
    pub coordinator_locator: BinaryLocator,
    pub worker_locator: BinaryLocator,
}

impl SupervisorSettings {
    pub fn from_config(config: &Config) -> Self {
        let processes = &config.processes;
        Self {
            process: processes.clone(),
            coordinator_url: normalize_url(&config.coordinator.url),
            max_compute_capacity: config.limits.max_compute_capacity,
            path_policy: PathPolicy {
                allowed_input_roots: config.limits.allowed_input_roots.clone(),
                base_dir: std::env::current_dir().ok(),
            },
            coordinator_locator: BinaryLocator::from_env(
                processes.coordinator_bin.clone(),
                processes.repo_root.clone(),
            ),
            worker_locator: BinaryLocator::from_env(
                processes.worker_bin.clone(),
                processes.repo_root.clone(),
            ),
        }
    }
}

/// Starts, observes and stops the coordinator and worker processes.
///
/// Managed processes are ones this instance spawned; anything else with a
/// matching executable name is external and is only found through the
/// [`ProcessInspector`].
pub struct ProcessSupervisor {
    settings: SupervisorSettings,
    state: SupervisorState,
    inspector: Arc<dyn ProcessInspector>,
    audit: AuditLogger,
}

impl ProcessSupervisor {
    pub fn new(
        settings: SupervisorSettings,
        state: SupervisorState,
        inspector: Arc<dyn ProcessInspector>,
        audit: AuditLogger,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            state,
            inspector,
            audit,
        })
    }

    pub fn state(&self) -> &SupervisorState {
        &self.state
    }

    fn name(&self, role: Role) -> &str {
        match role {
            Role::Coordinator => &self.settings.process.coordinator_name,
            Role::Worker => &self.settings.process.worker_name,
        }
    }

    async fn locate(&self, role: Role) -> Result<LocatedBinary, SupervisorError> {
        let locator = match role {
            Role::Coordinator => self.settings.coordinator_locator.clone(),
            Role::Worker => self.settings.worker_locator.clone(),
        };
        let name = self.name(role).to_string();
        let found = tokio::task::spawn_blocking(move || locator.locate(role, &name)).await??;
        Ok(found)
    }

    fn working_dir(&self, role: Role, binary: &Path) -> Option<PathBuf> {
        let locator = match role {
            Role::Coordinator => &self.settings.coordinator_locator,
            Role::Worker => &self.settings.worker_locator,
        };
        locator
            .repo_root()
            .map(Path::to_path_buf)
            .or_else(|| binary.parent().map(Path::to_path_buf))
    }

    /// PIDs of coordinator processes other than `exclude`
    async fn external_coordinator_pids(&self, exclude: Option<u32>) -> Result<Vec<u32>, SupervisorError> {
        let mut pids = self
            .inspector
            .find_pids(self.name(Role::Coordinator))
            .await
            .map_err(SupervisorError::Inspect)?;
        if let Some(own) = exclude {
            pids.retain(|&p| p != own);
        }
        Ok(pids)
    }

    /// PIDs of untracked worker processes started with `--worker-id <id>`
    async fn external_worker_pids(&self, worker_id: &str) -> Result<Vec<u32>, SupervisorError> {
        let mut pids = self
            .inspector
            .find_pids_with_arg(self.name(Role::Worker), "--worker-id", worker_id)
            .await
            .map_err(SupervisorError::Inspect)?;
        let managed: Vec<u32> = self.state.workers().iter().map(|h| h.pid).collect();
        pids.retain(|p| !managed.contains(p));
        Ok(pids)
    }

    async fn handle_alive(&self, handle: &ProcessHandle) -> bool {
        !handle.has_exited() && self.inspector.is_alive(handle.pid).await
    }

    fn audit_start_failed(&self, role: Role, worker_id: Option<&str>, err: &SupervisorError) {
        let mut event = AuditEvent::new("process.start_failed")
            .decision(Decision::Failed)
            .reason(err.to_string())
            .field("role", role.to_string());
        if let Some(id) = worker_id {
            event = event.field("worker_id", id);
        }
        self.audit.record(event);
    }

    /// Start a managed coordinator
    pub async fn start_coordinator(&self) -> Result<StartedProcess, SupervisorError> {
        let result = self.try_start_coordinator().await;
        if let Err(e) = &result {
            self.audit_start_failed(Role::Coordinator, None, e);
        }
        result
    }

    async fn try_start_coordinator(&self) -> Result<StartedProcess, SupervisorError> {
        if let Some(handle) = self.state.coordinator() {
            if self.handle_alive(&handle).await {
                return Err(SupervisorError::AlreadyRunning {
                    role: Role::Coordinator,
                    pid: handle.pid,
                });
            }
            self.state.clear_coordinator_if(handle.generation);
        }

        let external = self.external_coordinator_pids(None).await?;
        if !external.is_empty() {
            return Err(SupervisorError::AlreadyRunningExternally {
                role: Role::Coordinator,
                pids: external,
            });
        }

        let binary = self.locate(Role::Coordinator).await?;
        let mut cmd = Command::new(&binary.path);
        cmd.args(&self.settings.process.coordinator_args);
        if let Some(dir) = self.working_dir(Role::Coordinator, &binary.path) {
            cmd.current_dir(dir);
        }

        let handle = self.spawn(Role::Coordinator, None, &binary, cmd, None)?;
        if let Err(existing) = self.state.install_coordinator(handle.clone()) {
            // Lost a race with a concurrent start; the newcomer goes away
            warn!(pid = handle.pid, existing = existing.pid, "Coordinator started concurrently, stopping duplicate");
            let _ = self.inspector.terminate(handle.pid, Signal::Forceful).await;
            return Err(SupervisorError::AlreadyRunning {
                role: Role::Coordinator,
                pid: existing.pid,
            });
        }

        if let Some(exit) = wait_exit(handle.exit_rx.clone(), self.settings.process.startup_grace()).await {
            self.state.clear_coordinator_if(handle.generation);
            return Err(SupervisorError::ExitedImmediately {
                role: Role::Coordinator,
                code: exit.code,
            });
        }

        self.audit_started(&handle);
        Ok(StartedProcess {
            role: Role::Coordinator,
            worker_id: None,
            pid: handle.pid,
            binary: binary.path,
            source: binary.source,
            compute_capacity: None,
        })
    }

    /// Stop the coordinator, managed or external
    pub async fn stop_coordinator(&self) -> Result<StopOutcome, SupervisorError> {
        if let Some(handle) = self.state.take_coordinator() {
            if !handle.has_exited() {
                let outcome = self.stop_managed(handle).await?;
                // Workers without a coordinator are not useful
                self.state.clear_workers();
                return Ok(outcome);
            }
        }

        let pids = self.external_coordinator_pids(None).await?;
        if pids.is_empty() {
            debug!("Stop requested but no coordinator is running");
            return Ok(StopOutcome::NotRunning);
        }
        let outcome = self.stop_external(Role::Coordinator, None, pids).await?;
        self.state.clear_workers();
        Ok(outcome)
    }

    /// Whether a coordinator is running, and whether this gateway owns it.
    ///
    /// Clears all worker handles when none is running.
    pub async fn coordinator_status(&self) -> Result<CoordinatorStatus, SupervisorError> {
        let mut tracked = self.state.coordinator();
        if let Some(handle) = &tracked {
            if !self.handle_alive(handle).await {
                self.state.clear_coordinator_if(handle.generation);
                tracked = None;
            }
        }

        let external_pids = self
            .external_coordinator_pids(tracked.as_ref().map(|h| h.pid))
            .await?;
        let running = tracked.is_some() || !external_pids.is_empty();

        if !running {
            let dropped = self.state.clear_workers();
            if !dropped.is_empty() {
                info!(count = dropped.len(), "Coordinator not running, cleared worker handles");
            }
        }

        Ok(CoordinatorStatus {
            running,
            managed: tracked.is_some(),
            pid: tracked.as_ref().map(|h| h.pid).or_else(|| external_pids.first().copied()),
            external_pids,
            started_at: tracked.as_ref().map(|h| h.started_at),
            binary: tracked.map(|h| h.binary),
        })
    }

    /// Start a managed worker
    pub async fn start_worker(&self, launch: WorkerLaunch) -> Result<StartedProcess, SupervisorError> {
        let worker_id = launch.worker_id.clone();
        let result = self.try_start_worker(launch).await;
        if let Err(e) = &result {
            self.audit_start_failed(Role::Worker, worker_id.as_deref(), e);
        }
        result
    }

    async fn try_start_worker(&self, launch: WorkerLaunch) -> Result<StartedProcess, SupervisorError> {
        let policy = &self.settings.path_policy;
        if launch.elf_path.trim().is_empty() {
            return Err(SupervisorError::InvalidArgument("elf_path is required".to_string()));
        }
        if launch.input_path.trim().is_empty() {
            return Err(SupervisorError::InvalidArgument("input_path is required".to_string()));
        }
        validate_path(&launch.elf_path, PathKind::Elf, policy)?;
        validate_path(&launch.input_path, PathKind::Input, policy)?;

        let compute_capacity = match launch.compute_capacity {
            Some(value) => validate_compute_capacity(value, self.settings.max_compute_capacity)?,
            None => DEFAULT_WORKER_CAPACITY,
        };

        let worker_id = match launch.worker_id.filter(|id| !id.is_empty()) {
            Some(id) => {
                validate_identifier("worker id", &id)?;
                id
            }
            None => generate_worker_id(),
        };

        let elf = PathBuf::from(&launch.elf_path);
        let elf_is_file = tokio::fs::metadata(&elf).await.map(|m| m.is_file()).unwrap_or(false);
        if !elf_is_file {
            return Err(SupervisorError::InvalidArgument(format!(
                "ELF file not found: {}",
                launch.elf_path
            )));
        }

        // The worker reads a directory of inputs, not a single file
        let inputs_folder = Path::new(&launch.input_path)
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let folder_is_dir = tokio::fs::metadata(&inputs_folder)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !folder_is_dir {
            return Err(SupervisorError::InvalidArgument(format!(
                "Input directory not found: {}",
                inputs_folder.display()
            )));
        }

        if let Some(existing) = self.state.worker(&worker_id) {
            if self.handle_alive(&existing).await {
                return Err(SupervisorError::WorkerAlreadyRunning {
                    id: worker_id,
                    pid: existing.pid,
                });
            }
        }

        let binary = self.locate(Role::Worker).await?;
        let mut cmd = Command::new(&binary.path);
        cmd.arg("--coordinator-url")
            .arg(normalize_url(&self.settings.coordinator_url))
            .arg("--elf")
            .arg(&elf)
            .arg("--inputs-folder")
            .arg(&inputs_folder)
            .arg("--compute-capacity")
            .arg(compute_capacity.to_string())
            .arg("--worker-id")
            .arg(&worker_id)
            .args(&self.settings.process.worker_args);
        if let Some(dir) = self.working_dir(Role::Worker, &binary.path) {
            cmd.current_dir(dir);
        }

        let handle = self.spawn(Role::Worker, Some(worker_id.clone()), &binary, cmd, Some(compute_capacity))?;
        if let Err(existing) = self.state.install_worker(&worker_id, handle.clone()) {
            warn!(worker_id = %worker_id, pid = handle.pid, "Worker started concurrently, stopping duplicate");
            let _ = self.inspector.terminate(handle.pid, Signal::Forceful).await;
            return Err(SupervisorError::WorkerAlreadyRunning {
                id: worker_id,
                pid: existing.pid,
            });
        }

        if let Some(exit) = wait_exit(handle.exit_rx.clone(), self.settings.process.startup_grace()).await {
            self.state.remove_worker_if(&worker_id, handle.generation);
            return Err(SupervisorError::ExitedImmediately {
                role: Role::Worker,
                code: exit.code,
            });
        }

        self.audit_started(&handle);
        Ok(StartedProcess {
            role: Role::Worker,
            worker_id: Some(worker_id),
            pid: handle.pid,
            binary: binary.path,
            source: binary.source,
            compute_capacity: Some(compute_capacity),
        })
    }

    /// Stop a worker by id. Untracked ids are looked up among running
    /// worker processes by their `--worker-id` argument.
    pub async fn stop_worker(&self, worker_id: &str) -> Result<StopOutcome, SupervisorError> {
        validate_identifier("worker id", worker_id)?;
        if let Some(handle) = self.state.remove_worker(worker_id) {
            if !handle.has_exited() {
                return self.stop_managed(handle).await;
            }
        }

        let pids = self.external_worker_pids(worker_id).await?;
        if pids.is_empty() {
            debug!(worker_id, "Stop requested but no such worker is running");
            return Ok(StopOutcome::NotRunning);
        }
        self.stop_external(Role::Worker, Some(worker_id), pids).await
    }

    /// Status of every tracked worker, with liveness re-checked against the OS
    pub async fn worker_status(&self) -> Result<Vec<WorkerStatus>, SupervisorError> {
        let coordinator = self.coordinator_status().await?;
        if !coordinator.running {
            return Ok(Vec::new());
        }

        let mut statuses = Vec::new();
        for handle in self.state.workers() {
            let running = self.handle_alive(&handle).await;
            statuses.push(WorkerStatus {
                worker_id: handle.id.clone().unwrap_or_default(),
                pid: handle.pid,
                running,
                managed: handle.managed(),
                compute_capacity: handle.compute_capacity,
                started_at: handle.started_at,
                exit_code: handle.exit_info().and_then(|e| e.code),
            });
        }
        Ok(statuses)
    }

    /// Status of one tracked worker
    pub async fn worker_status_by_id(&self, worker_id: &str) -> Result<WorkerStatus, SupervisorError> {
        validate_identifier("worker id", worker_id)?;
        self.worker_status()
            .await?
            .into_iter()
            .find(|w| w.worker_id == worker_id)
            .ok_or_else(|| SupervisorError::UnknownWorker(worker_id.to_string()))
    }

    /// Stop every managed process and wait for each to go away
    pub async fn stop_all_managed(&self) {
        let mut handles = self.state.clear_workers();
        if let Some(coordinator) = self.state.take_coordinator() {
            handles.push(coordinator);
        }
        handles.retain(|h| !h.has_exited());
        if handles.is_empty() {
            return;
        }

        info!(count = handles.len(), "Stopping managed processes");
        let grace = self.settings.process.stop_grace();
        let mut tasks = JoinSet::new();
        for handle in handles {
            let inspector = Arc::clone(&self.inspector);
            tasks.spawn(async move {
                if let Err(e) = inspector.terminate(handle.pid, Signal::Graceful).await {
                    warn!(pid = handle.pid, error = %e, "Failed to signal managed process");
                }
                if wait_exit(handle.exit_rx.clone(), grace).await.is_none() {
                    warn!(pid = handle.pid, role = %handle.role, "Grace period exceeded, killing");
                    let _ = inspector.terminate(handle.pid, Signal::Forceful).await;
                }
            });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Spawn `cmd` and begin tracking it. Output is forwarded to the log and
    /// a watcher task clears the handle when the process exits.
    fn spawn(
        &self,
        role: Role,
        worker_id: Option<String>,
        binary: &LocatedBinary,
        mut cmd: Command,
        compute_capacity: Option<u32>,
    ) -> Result<ProcessHandle, SupervisorError> {
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        info!(role = %role, worker_id = ?worker_id, binary = %binary.path.display(), "Starting process");
        let mut child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            role,
            path: binary.path.clone(),
            source,
        })?;
        let pid = spawned_pid(child.id(), role, &binary.path)?;
        info!(role = %role, worker_id = ?worker_id, pid, "Process spawned");

        let label = worker_id.clone().unwrap_or_else(|| role.to_string());
        if let Some(stdout) = child.stdout.take() {
            forward_output(stdout, role, label.clone(), "stdout");
        }
        if let Some(stderr) = child.stderr.take() {
            forward_output(stderr, role, label, "stderr");
        }

        let (exit_tx, exit_rx) = watch::channel(None);
        let generation = self.state.next_generation();
        let handle = ProcessHandle {
            role,
            id: worker_id.clone(),
            pid,
            binary: binary.path.clone(),
            started_at: Utc::now(),
            compute_capacity,
            generation,
            exit_rx,
        };

        let state = self.state.clone();
        tokio::spawn(watch_exit(child, role, worker_id, generation, exit_tx, state));
        Ok(handle)
    }

    /// Terminate a managed process. The handle is already dropped from the
    /// state; escalation to a forceful kill happens in the background.
    async fn stop_managed(&self, handle: ProcessHandle) -> Result<StopOutcome, SupervisorError> {
        let pid = handle.pid;
        info!(role = %handle.role, worker_id = ?handle.id, pid, "Sending graceful stop to managed process");

        let signalled = self
            .inspector
            .terminate(pid, Signal::Graceful)
            .await
            .map_err(|source| SupervisorError::Signal { pid, source })?;
        if !signalled {
            return Ok(StopOutcome::NotRunning);
        }

        let inspector = Arc::clone(&self.inspector);
        let grace = self.settings.process.stop_grace();
        let exit_rx = handle.exit_rx.clone();
        let role = handle.role;
        tokio::spawn(async move {
            if wait_exit(exit_rx, grace).await.is_none() {
                warn!(role = %role, pid, grace_ms = grace.as_millis() as u64, "Grace period exceeded, killing");
                if let Err(e) = inspector.terminate(pid, Signal::Forceful).await {
                    error!(role = %role, pid, error = %e, "Failed to kill process");
                }
            }
        });

        self.audit_stopped(handle.role, handle.id.as_deref(), &[pid], true, false);
        Ok(StopOutcome::Stopped {
            pids: vec![pid],
            managed: true,
            forced: false,
        })
    }

    /// Graceful stop, wait, re-check, then kill whatever is still there
    async fn stop_external(
        &self,
        role: Role,
        worker_id: Option<&str>,
        pids: Vec<u32>,
    ) -> Result<StopOutcome, SupervisorError> {
        info!(role = %role, worker_id = ?worker_id, pids = ?pids, "Stopping external process");
        let mut signalled = Vec::new();
        for &pid in &pids {
            match self.inspector.terminate(pid, Signal::Graceful).await {
                Ok(true) => signalled.push(pid),
                Ok(false) => debug!(pid, "Process already gone"),
                Err(source) => return Err(SupervisorError::Signal { pid, source }),
            }
        }
        if signalled.is_empty() {
            return Ok(StopOutcome::NotRunning);
        }

        tokio::time::sleep(self.settings.process.stop_grace()).await;

        let remaining: Vec<u32> = self
            .inspector
            .find_pids(self.name(role))
            .await
            .map_err(SupervisorError::Inspect)?
            .into_iter()
            .filter(|p| signalled.contains(p))
            .collect();

        for &pid in &remaining {
            warn!(role = %role, pid, "Process survived graceful stop, killing");
            if let Err(source) = self.inspector.terminate(pid, Signal::Forceful).await {
                return Err(SupervisorError::Signal { pid, source });
            }
        }

        let forced = !remaining.is_empty();
        self.audit_stopped(role, worker_id, &signalled, false, forced);
        Ok(StopOutcome::Stopped {
            pids: signalled,
            managed: false,
            forced,
        })
    }

    fn audit_started(&self, handle: &ProcessHandle) {
        let mut event = AuditEvent::new("process.start")
            .decision(Decision::Succeeded)
            .field("role", handle.role.to_string())
            .field("pid", handle.pid)
            .field("binary", handle.binary.display().to_string());
        if let Some(id) = &handle.id {
            event = event.field("worker_id", id.as_str());
        }
        self.audit.record(event);
    }

    fn audit_stopped(&self, role: Role, worker_id: Option<&str>, pids: &[u32], managed: bool, forced: bool) {
        let mut event = AuditEvent::new("process.stop")
            .decision(Decision::Succeeded)
            .field("role", role.to_string())
            .field("pids", pids.to_vec())
            .field("managed", managed)
            .field("forced", forced);
        if let Some(id) = worker_id {
            event = event.field("worker_id", id);
        }
        self.audit.record(event);
    }
}

/// A child without a pid has already been reaped, so there is nothing to track
fn spawned_pid(pid: Option<u32>, role: Role, path: &Path) -> Result<u32, SupervisorError> {
    pid.filter(|&pid| pid != 0).ok_or_else(|| SupervisorError::Spawn {
        role,
        path: path.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::Other, "process exited before its pid was read"),
    })
}

/// `worker-` followed by eight hex digits
pub fn generate_worker_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("worker-{}", &id[..8])
}

/// Wait up to `limit` for the process behind `exit_rx` to exit
async fn wait_exit(mut exit_rx: watch::Receiver<Option<ExitInfo>>, limit: Duration) -> Option<ExitInfo> {
    match tokio::time::timeout(limit, exit_rx.wait_for(Option::is_some)).await {
        Ok(Ok(exit)) => *exit,
        _ => None,
    }
}

async fn watch_exit(
    mut child: Child,
    role: Role,
    worker_id: Option<String>,
    generation: u64,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    state: SupervisorState,
) {
    let exit = match child.wait().await {
        Ok(status) => {
            info!(role = %role, worker_id = ?worker_id, ?status, "Process exited");
            ExitInfo { code: status.code() }
        }
        Err(e) => {
            warn!(role = %role, worker_id = ?worker_id, error = %e, "Error waiting for process");
            ExitInfo { code: None }
        }
    };
    exit_tx.send_replace(Some(exit));

    let cleared = match &worker_id {
        Some(id) => state.remove_worker_if(id, generation),
        None => state.clear_coordinator_if(generation),
    };
    if cleared {
        debug!(role = %role, worker_id = ?worker_id, "Cleared handle of exited process");
    }
}

fn forward_output<R>(reader: R, role: Role, label: String, stream: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            info!(target: "proofgate::child", role = %role, process = %label, stream, "{}", line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::testing::CapturedAudit;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::io;

    /// Inspector with a scripted process table
    #[derive(Default)]
    struct FakeInspector {
        table: Mutex<HashMap<String, Vec<u32>>>,
        signals: Mutex<Vec<(u32, Signal)>>,
        argv: Mutex<HashMap<u32, Vec<String>>>,
        /// PIDs that ignore the graceful signal
        stubborn: Vec<u32>,
    }

    impl FakeInspector {
        fn with_process(name: &str, pid: u32) -> Self {
            let inspector = Self::default();
            inspector.table.lock().insert(name.to_string(), vec![pid]);
            inspector
        }

        fn with_worker(pid: u32, worker_id: &str) -> Self {
            let inspector = Self::with_process("proof-worker", pid);
            inspector.argv.lock().insert(
                pid,
                ["proof-worker", "--worker-id", worker_id]
                    .iter()
                    .map(|a| a.to_string())
                    .collect(),
            );
            inspector
        }

        fn remove(&self, pid: u32) -> bool {
            let mut table = self.table.lock();
            let mut found = false;
            for pids in table.values_mut() {
                let before = pids.len();
                pids.retain(|&p| p != pid);
                found |= pids.len() != before;
            }
            found
        }

        fn signals(&self) -> Vec<(u32, Signal)> {
            self.signals.lock().clone()
        }
    }

    #[async_trait]
    impl ProcessInspector for FakeInspector {
        async fn find_pids(&self, name: &str) -> io::Result<Vec<u32>> {
            Ok(self.table.lock().get(name).cloned().unwrap_or_default())
        }

        async fn is_alive(&self, pid: u32) -> bool {
            self.table.lock().values().any(|pids| pids.contains(&pid))
        }

        async fn terminate(&self, pid: u32, signal: Signal) -> io::Result<bool> {
            self.signals.lock().push((pid, signal));
            if signal == Signal::Graceful && self.stubborn.contains(&pid) {
                return Ok(self.is_alive(pid).await);
            }
            Ok(self.remove(pid))
        }

        async fn command_line(&self, pid: u32) -> io::Result<Option<Vec<String>>> {
            Ok(self.argv.lock().get(&pid).cloned())
        }
    }

    fn settings() -> SupervisorSettings {
        SupervisorSettings {
            process: ProcessConfig {
                startup_grace_ms: 50,
                stop_grace_ms: 10,
                ..Default::default()
            },
            coordinator_url: "http://127.0.0.1:50051".to_string(),
            max_compute_capacity: 100,
            path_policy: PathPolicy::default(),
            coordinator_locator: BinaryLocator::default(),
            worker_locator: BinaryLocator::default(),
        }
    }

    fn supervisor(inspector: Arc<FakeInspector>) -> Arc<ProcessSupervisor> {
        ProcessSupervisor::new(settings(), SupervisorState::new(), inspector, AuditLogger::disabled())
    }

    #[tokio::test]
    async fn test_start_rejected_when_external_coordinator_running() {
        let inspector = Arc::new(FakeInspector::with_process("proof-coordinator", 4242));
        let sup = supervisor(Arc::clone(&inspector));

        let err = sup.start_coordinator().await.unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunningExternally { ref pids, .. } if pids == &vec![4242]));
        assert_eq!(err.status_code(), hyper::StatusCode::BAD_REQUEST);
        assert!(err.to_string().contains("already running externally"));

        let status = sup.coordinator_status().await.unwrap();
        assert!(status.running);
        assert!(!status.managed);
        assert_eq!(status.pid, Some(4242));
        assert!(inspector.signals().is_empty());
    }

    #[tokio::test]
    async fn test_stop_external_twice_is_idempotent() {
        let inspector = Arc::new(FakeInspector::with_process("proof-coordinator", 4242));
        let sup = supervisor(Arc::clone(&inspector));

        let first = sup.stop_coordinator().await.unwrap();
        assert_eq!(
            first,
            StopOutcome::Stopped {
                pids: vec![4242],
                managed: false,
                forced: false
            }
        );
        assert_eq!(inspector.signals(), vec![(4242, Signal::Graceful)]);

        let second = sup.stop_coordinator().await.unwrap();
        assert_eq!(second, StopOutcome::NotRunning);
        assert_eq!(inspector.signals().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_external_escalates_when_still_present() {
        let inspector = Arc::new(FakeInspector {
            stubborn: vec![77],
            ..FakeInspector::with_process("proof-coordinator", 77)
        });
        let sup = supervisor(Arc::clone(&inspector));

        let outcome = sup.stop_coordinator().await.unwrap();
        assert_eq!(
            outcome,
            StopOutcome::Stopped {
                pids: vec![77],
                managed: false,
                forced: true
            }
        );
        assert_eq!(
            inspector.signals(),
            vec![(77, Signal::Graceful), (77, Signal::Forceful)]
        );
    }

    #[tokio::test]
    async fn test_status_not_running() {
        let sup = supervisor(Arc::new(FakeInspector::default()));
        let status = sup.coordinator_status().await.unwrap();
        assert!(!status.running);
        assert!(!status.managed);
        assert!(status.pid.is_none());
        assert!(sup.worker_status().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_binary_reports_build_command() {
        let sup = supervisor(Arc::new(FakeInspector::default()));
        let err = sup.start_coordinator().await.unwrap_err();
        assert!(matches!(err, SupervisorError::BinaryNotFound(_)));
        assert_eq!(err.status_code(), hyper::StatusCode::INTERNAL_SERVER_ERROR);
        assert!(err.to_string().contains("cargo build --release --bin proof-coordinator"));
    }

    #[tokio::test]
    async fn test_worker_requires_paths() {
        let sup = supervisor(Arc::new(FakeInspector::default()));
        let err = sup
            .start_worker(WorkerLaunch {
                input_path: "/data/in.bin".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("elf_path"));
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn test_worker_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let elf = dir.path().join("program.elf");
        std::fs::write(&elf, b"\x7fELF").unwrap();
        let sup = supervisor(Arc::new(FakeInspector::default()));

        let err = sup
            .start_worker(WorkerLaunch {
                elf_path: dir.path().join("missing.elf").display().to_string(),
                input_path: dir.path().join("in.bin").display().to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ELF file not found"));

        let err = sup
            .start_worker(WorkerLaunch {
                elf_path: elf.display().to_string(),
                input_path: dir.path().join("nodir/in.bin").display().to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Input directory not found"));
    }

    #[tokio::test]
    async fn test_worker_capacity_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let elf = dir.path().join("program.elf");
        std::fs::write(&elf, b"\x7fELF").unwrap();
        let sup = supervisor(Arc::new(FakeInspector::default()));

        for capacity in [0.0, -3.0, 101.0, 2.5] {
            let err = sup
                .start_worker(WorkerLaunch {
                    elf_path: elf.display().to_string(),
                    input_path: dir.path().join("in.bin").display().to_string(),
                    compute_capacity: Some(capacity),
                    ..Default::default()
                })
                .await
                .unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidArgument, "{capacity}");
        }

        // Valid input gets as far as binary discovery
        let err = sup
            .start_worker(WorkerLaunch {
                elf_path: elf.display().to_string(),
                input_path: dir.path().join("in.bin").display().to_string(),
                compute_capacity: Some(100.0),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::BinaryNotFound(_)));
    }

    #[tokio::test]
    async fn test_stop_unknown_worker() {
        let sup = supervisor(Arc::new(FakeInspector::default()));
        assert_eq!(sup.stop_worker("worker-1").await.unwrap(), StopOutcome::NotRunning);
        assert!(sup.stop_worker("bad id!").await.is_err());
        assert!(matches!(
            sup.worker_status_by_id("worker-1").await,
            Err(SupervisorError::UnknownWorker(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_external_worker_by_id() {
        let (captured, _guard) = CapturedAudit::install();
        let inspector = Arc::new(FakeInspector::with_worker(5150, "w-ext"));
        let sup = ProcessSupervisor::new(
            settings(),
            SupervisorState::new(),
            Arc::clone(&inspector) as Arc<dyn ProcessInspector>,
            AuditLogger::new(true),
        );

        // A different id leaves it alone
        assert_eq!(sup.stop_worker("w-other").await.unwrap(), StopOutcome::NotRunning);
        assert!(inspector.signals().is_empty());

        let outcome = sup.stop_worker("w-ext").await.unwrap();
        assert_eq!(
            outcome,
            StopOutcome::Stopped {
                pids: vec![5150],
                managed: false,
                forced: false
            }
        );
        assert_eq!(inspector.signals(), vec![(5150, Signal::Graceful)]);
        assert_eq!(sup.stop_worker("w-ext").await.unwrap(), StopOutcome::NotRunning);

        let stops = captured.named("process.stop");
        assert_eq!(stops.len(), 1);
        assert_eq!(stops[0]["role"], "worker");
        assert_eq!(stops[0]["worker_id"], "w-ext");
        assert_eq!(stops[0]["managed"], false);
        assert_eq!(stops[0]["pids"][0], 5150);
    }

    #[tokio::test]
    async fn test_stubborn_external_worker_is_killed() {
        let mut inspector = FakeInspector::with_worker(6160, "w-ext");
        inspector.stubborn = vec![6160];
        let inspector = Arc::new(inspector);
        let sup = supervisor(Arc::clone(&inspector));

        let outcome = sup.stop_worker("w-ext").await.unwrap();
        assert!(matches!(outcome, StopOutcome::Stopped { forced: true, .. }), "{outcome:?}");
        assert_eq!(
            inspector.signals(),
            vec![(6160, Signal::Graceful), (6160, Signal::Forceful)]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_outcomes_are_audited() {
        let (captured, _guard) = CapturedAudit::install();
        let mut settings = settings();
        settings.process.coordinator_args = vec!["1".to_string()];
        settings.coordinator_locator = BinaryLocator {
            override_path: Some(PathBuf::from("/bin/sleep")),
            ..Default::default()
        };
        let sup = ProcessSupervisor::new(
            settings,
            SupervisorState::new(),
            Arc::new(FakeInspector::default()),
            AuditLogger::new(true),
        );

        let started = sup.start_coordinator().await.unwrap();
        let starts = captured.named("process.start");
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0]["role"], "coordinator");
        assert_eq!(starts[0]["pid"], started.pid);
        assert_eq!(starts[0]["decision"], "succeeded");

        // Workers have no binary here
        let dir = tempfile::tempdir().unwrap();
        let elf = dir.path().join("program.elf");
        std::fs::write(&elf, b"\x7fELF").unwrap();
        sup.start_worker(WorkerLaunch {
            elf_path: elf.display().to_string(),
            input_path: dir.path().join("in.bin").display().to_string(),
            worker_id: Some("w-audit".to_string()),
            ..Default::default()
        })
        .await
        .unwrap_err();

        let failed = captured.named("process.start_failed");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0]["role"], "worker");
        assert_eq!(failed[0]["worker_id"], "w-audit");
        assert!(failed[0]["reason"].as_str().unwrap().contains("cargo build"));
    }

    #[test]
    fn test_missing_pid_is_a_spawn_error() {
        let path = Path::new("/opt/bin/proof-worker");
        for pid in [None, Some(0)] {
            let err = spawned_pid(pid, Role::Worker, path).unwrap_err();
            assert!(matches!(err, SupervisorError::Spawn { role: Role::Worker, .. }), "{err:?}");
        }
        assert_eq!(spawned_pid(Some(42), Role::Worker, path).unwrap(), 42);
    }

    #[test]
    fn test_generated_worker_id() {
        let id = generate_worker_id();
        assert!(id.starts_with("worker-"));
        assert_eq!(id.len(), "worker-".len() + 8);
        assert!(crate::validate::validate_identifier("worker id", &id).is_ok());
    }

    #[test]
    fn test_state_generation_guards_clear() {
        let state = SupervisorState::new();
        let (_tx, rx) = watch::channel(None);
        let handle = ProcessHandle {
            role: Role::Coordinator,
            id: None,
            pid: 10,
            binary: PathBuf::from("/bin/true"),
            started_at: Utc::now(),
            compute_capacity: None,
            generation: state.next_generation(),
            exit_rx: rx,
        };
        let generation = handle.generation;
        state.install_coordinator(handle).unwrap();

        // A watcher from an older spawn must not clear a newer handle
        assert!(!state.clear_coordinator_if(generation - 1));
        assert!(state.coordinator().is_some());
        assert!(state.clear_coordinator_if(generation));
        assert!(state.coordinator().is_none());
    }

    #[test]
    fn test_install_rejects_live_duplicate() {
        let state = SupervisorState::new();
        let make = |pid| {
            let (tx, rx) = watch::channel(None);
            (
                ProcessHandle {
                    role: Role::Worker,
                    id: Some("w1".to_string()),
                    pid,
                    binary: PathBuf::from("/bin/true"),
                    started_at: Utc::now(),
                    compute_capacity: Some(10),
                    generation: state.next_generation(),
                    exit_rx: rx,
                },
                tx,
            )
        };

        let (first, first_tx) = make(1);
        let (second, _second_tx) = make(2);
        state.install_worker("w1", first).unwrap();
        assert_eq!(state.install_worker("w1", second.clone()).unwrap_err().pid, 1);

        // Once the first has exited its slot can be reused
        first_tx.send_replace(Some(ExitInfo { code: Some(0) }));
        state.install_worker("w1", second).unwrap();
        assert_eq!(state.worker("w1").unwrap().pid, 2);
    }
}
