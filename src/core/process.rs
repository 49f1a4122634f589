//! Process supervision - Spawning, observing and terminating engine/router pairs

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};

use super::engine::resolve_executable;
use super::error::SpawnError;
use super::instance::InstanceId;
use crate::platform;

/// Poll period while waiting out the startup window
const STARTUP_POLL: Duration = Duration::from_millis(50);
/// How long to wait for a SIGKILLed process to be reaped
const KILL_WAIT: Duration = Duration::from_secs(5);
/// Lines of the process log included in startup failures
const LOG_TAIL_LINES: usize = 15;

/// Everything needed to launch one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Short label used in logs and errors
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: PathBuf,
    /// stdout/stderr destination, discarded when unset
    pub log_file: Option<PathBuf>,
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

impl From<ExitStatus> for ExitInfo {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {}", code),
            (None, Some(sig)) => write!(f, "killed by signal {}", sig),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Result of a terminate request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    /// Process was gone before we signalled it
    AlreadyExited(ExitInfo),
    /// Exited within the grace period after SIGTERM
    Graceful(ExitInfo),
    /// Needed SIGKILL; exit status unknown if reaping timed out
    Killed(Option<ExitInfo>),
}

impl std::fmt::Display for TerminateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyExited(e) => write!(f, "already exited ({})", e),
            Self::Graceful(e) => write!(f, "stopped gracefully ({})", e),
            Self::Killed(Some(e)) => write!(f, "force killed ({})", e),
            Self::Killed(None) => f.write_str("force killed, not yet reaped"),
        }
    }
}

/// One supervised OS process
#[derive(Debug)]
pub struct ProcessHandle {
    name: String,
    pid: u32,
    child: Child,
    log_file: Option<PathBuf>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Non-blocking exit check; `None` while the process is alive
    pub fn wait_exit(&mut self) -> std::io::Result<Option<ExitInfo>> {
        Ok(self.child.try_wait()?.map(ExitInfo::from))
    }

    pub fn is_alive(&mut self) -> std::io::Result<bool> {
        Ok(self.wait_exit()?.is_none())
    }
}

/// Engine and router processes of one instance
#[derive(Debug)]
struct ProcessPair {
    engine: ProcessHandle,
    router: ProcessHandle,
}

/// What a liveness poll saw for an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    Alive,
    /// One of the pair is gone
    Exited { process: String, exit: ExitInfo },
    /// Could not tell; transient, retried on the next poll
    Unobservable(String),
}

/// Spawns and supervises engine/router pairs
///
/// Owns every child handle. Reports observations only; turning them into
/// state transitions is the lifecycle manager's job.
pub struct ProcessSupervisor {
    pairs: Mutex<HashMap<InstanceId, ProcessPair>>,
    startup_window: Duration,
}

impl ProcessSupervisor {
    pub fn new(startup_window: Duration) -> Self {
        Self {
            pairs: Mutex::new(HashMap::new()),
            startup_window,
        }
    }

    fn pairs(&self) -> MutexGuard<'_, HashMap<InstanceId, ProcessPair>> {
        self.pairs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Spawn a single process and wait out the startup window
    pub async fn spawn(&self, spec: &ProcessSpec) -> Result<ProcessHandle, SpawnError> {
        if !spec.working_dir.is_dir() {
            return Err(SpawnError::WorkingDirMissing(spec.working_dir.clone()));
        }
        let executable = resolve_executable(&spec.command, Some(&spec.working_dir))
            .ok_or_else(|| SpawnError::ExecutableNotFound(spec.command.clone()))?;

        let io_err = |source| SpawnError::Io {
            process: spec.name.clone(),
            source,
        };

        let (stdout, stderr) = match &spec.log_file {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(io_err)?;
                let err_file = file.try_clone().map_err(io_err)?;
                (Stdio::from(file), Stdio::from(err_file))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        let mut cmd = Command::new(&executable);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true);
        platform::detach_command(&mut cmd);

        info!(
            "Spawning {}: {} {}",
            spec.name,
            executable.display(),
            spec.args.join(" ")
        );
        let child = cmd.spawn().map_err(io_err)?;
        let pid = child.id().ok_or_else(|| SpawnError::EarlyExit {
            process: spec.name.clone(),
            status: "reaped before start".to_string(),
            detail: String::new(),
        })?;
        debug!("Spawned {} with PID {}", spec.name, pid);

        let mut handle = ProcessHandle {
            name: spec.name.clone(),
            pid,
            child,
            log_file: spec.log_file.clone(),
        };

        // Readiness: the process must survive the startup window. A router
        // that cannot bind its port exits immediately.
        let deadline = Instant::now() + self.startup_window;
        loop {
            if let Some(exit) = handle.wait_exit().map_err(io_err)? {
                return Err(early_exit(&handle, exit).await);
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            sleep(STARTUP_POLL.min(deadline - now)).await;
        }

        Ok(handle)
    }

    /// Bring up engine then router for an instance
    ///
    /// On any failure the already-started half is torn down, so nothing is
    /// left running and no handle is retained.
    pub async fn start_pair(
        &self,
        id: InstanceId,
        engine: &ProcessSpec,
        router: &ProcessSpec,
        grace: Duration,
    ) -> Result<(u32, u32), SpawnError> {
        let mut engine_handle = self.spawn(engine).await?;

        let mut router_handle = match self.spawn(router).await {
            Ok(handle) => handle,
            Err(e) => {
                let outcome = terminate(&mut engine_handle, grace).await;
                debug!("Instance {}: engine {} after router failure", id, outcome);
                return Err(e);
            }
        };

        // The engine may have died while the router was starting
        let engine_exit = engine_handle.wait_exit().map_err(|source| SpawnError::Io {
            process: engine.name.clone(),
            source,
        })?;
        if let Some(exit) = engine_exit {
            let err = early_exit(&engine_handle, exit).await;
            terminate(&mut router_handle, grace).await;
            return Err(err);
        }

        let pids = (engine_handle.pid(), router_handle.pid());
        self.pairs().insert(
            id,
            ProcessPair {
                engine: engine_handle,
                router: router_handle,
            },
        );
        Ok(pids)
    }

    /// Non-blocking liveness poll of both processes
    pub fn observe(&self, id: InstanceId) -> Observation {
        let mut pairs = self.pairs();
        let Some(pair) = pairs.get_mut(&id) else {
            return Observation::Unobservable("no process handle held".to_string());
        };

        for handle in [&mut pair.engine, &mut pair.router] {
            match handle.wait_exit() {
                Ok(None) => {}
                Ok(Some(exit)) => {
                    return Observation::Exited {
                        process: handle.name.clone(),
                        exit,
                    }
                }
                Err(e) => {
                    return Observation::Unobservable(format!(
                        "failed to poll {} (PID {}): {}",
                        handle.name, handle.pid, e
                    ))
                }
            }
        }
        Observation::Alive
    }

    /// Terminate both processes of an instance, router first
    ///
    /// Returns `None` when no handles are held for the instance.
    pub async fn stop_pair(
        &self,
        id: InstanceId,
        grace: Duration,
    ) -> Option<(TerminateOutcome, TerminateOutcome)> {
        // Take ownership so no lock is held while waiting on the OS
        let mut pair = self.pairs().remove(&id)?;
        let router = terminate(&mut pair.router, grace).await;
        let engine = terminate(&mut pair.engine, grace).await;
        info!("Instance {}: router {}, engine {}", id, router, engine);
        Some((engine, router))
    }

    /// Number of supervised pairs
    pub fn running_count(&self) -> usize {
        self.pairs().len()
    }
}

/// SIGTERM the process group, escalate to SIGKILL after `grace`
pub async fn terminate(handle: &mut ProcessHandle, grace: Duration) -> TerminateOutcome {
    match handle.wait_exit() {
        Ok(Some(exit)) => {
            platform::sweep_group(handle.pid);
            return TerminateOutcome::AlreadyExited(exit);
        }
        Ok(None) => {}
        Err(e) => warn!("Failed to poll {} before terminating: {}", handle.name, e),
    }

    if let Err(e) = platform::terminate_group(handle.pid) {
        warn!("Graceful termination of {} failed: {}", handle.name, e);
    }

    match timeout(grace, handle.child.wait()).await {
        Ok(Ok(status)) => {
            platform::sweep_group(handle.pid);
            return TerminateOutcome::Graceful(status.into());
        }
        Ok(Err(e)) => warn!("Waiting on {} failed: {}", handle.name, e),
        Err(_) => warn!(
            "{} (PID {}) ignored SIGTERM for {:?}, forcing kill",
            handle.name, handle.pid, grace
        ),
    }

    if let Err(e) = platform::kill_group(handle.pid) {
        warn!("Group kill of {} failed: {}", handle.name, e);
    }
    if let Err(e) = handle.child.start_kill() {
        debug!("Direct kill of {} failed: {}", handle.name, e);
    }
    match timeout(KILL_WAIT, handle.child.wait()).await {
        Ok(Ok(status)) => TerminateOutcome::Killed(Some(status.into())),
        _ => TerminateOutcome::Killed(None),
    }
}

async fn early_exit(handle: &ProcessHandle, exit: ExitInfo) -> SpawnError {
    platform::sweep_group(handle.pid);
    let tail = match &handle.log_file {
        Some(path) => log_tail(path).await,
        None => String::new(),
    };
    SpawnError::EarlyExit {
        process: handle.name.clone(),
        status: exit.to_string(),
        detail: if tail.is_empty() {
            String::new()
        } else {
            format!(": {}", tail)
        },
    }
}

/// Last few lines of a process log
async fn log_tail(path: &std::path::Path) -> String {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => {
            let lines: Vec<&str> = contents.lines().filter(|l| !l.trim().is_empty()).collect();
            let start = lines.len().saturating_sub(LOG_TAIL_LINES);
            lines[start..].join(" | ")
        }
        Err(e) => {
            debug!("Could not read log {}: {}", path.display(), e);
            String::new()
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn spec(name: &str, command: &str, args: &[&str], dir: &std::path::Path) -> ProcessSpec {
        ProcessSpec {
            name: name.to_string(),
            command: command.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: Vec::new(),
            working_dir: dir.to_path_buf(),
            log_file: Some(dir.join(format!("{}.log", name))),
        }
    }

    fn supervisor() -> ProcessSupervisor {
        ProcessSupervisor::new(Duration::from_millis(100))
    }

    #[tokio::test]
    async fn spawn_and_terminate_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor();
        let mut handle = sup
            .spawn(&spec("engine", "sleep", &["30"], dir.path()))
            .await
            .unwrap();
        assert!(handle.is_alive().unwrap());
        assert!(platform::is_process_running(handle.pid()));

        let outcome = terminate(&mut handle, Duration::from_secs(2)).await;
        match outcome {
            TerminateOutcome::Graceful(exit) => assert_eq!(exit.signal, Some(libc::SIGTERM)),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert!(!handle.is_alive().unwrap());
    }

    #[tokio::test]
    async fn terminate_escalates_to_kill() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor();
        let mut handle = sup
            .spawn(&spec("stubborn", "sh", &["-c", "trap '' TERM; sleep 30"], dir.path()))
            .await
            .unwrap();

        let outcome = terminate(&mut handle, Duration::from_millis(200)).await;
        assert!(matches!(outcome, TerminateOutcome::Killed(_)), "{:?}", outcome);
        assert!(!handle.is_alive().unwrap());
    }

    #[tokio::test]
    async fn terminate_reports_already_exited() {
        let dir = tempfile::tempdir().unwrap();
        let sup = ProcessSupervisor::new(Duration::ZERO);
        let mut handle = sup
            .spawn(&spec("short", "sh", &["-c", "sleep 0.1"], dir.path()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(400)).await;

        let outcome = terminate(&mut handle, Duration::from_secs(1)).await;
        assert_eq!(
            outcome,
            TerminateOutcome::AlreadyExited(ExitInfo {
                code: Some(0),
                signal: None
            })
        );
    }

    #[tokio::test]
    async fn missing_executable_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = supervisor()
            .spawn(&spec("engine", "no-such-simulator-binary", &[], dir.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnError::ExecutableNotFound(ref c) if c == "no-such-simulator-binary"));
    }

    #[tokio::test]
    async fn missing_working_dir_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let gone = dir.path().join("not-there");
        let err = supervisor()
            .spawn(&spec("engine", "sleep", &["1"], &gone))
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnError::WorkingDirMissing(p) if p == gone));
    }

    #[tokio::test]
    async fn early_exit_includes_log_tail() {
        let dir = tempfile::tempdir().unwrap();
        let err = supervisor()
            .spawn(&spec(
                "router",
                "sh",
                &["-c", "echo 'bind: address already in use' >&2; exit 3"],
                dir.path(),
            ))
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("exit code 3"), "{}", message);
        assert!(message.contains("address already in use"), "{}", message);
    }

    #[tokio::test]
    async fn pair_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor();
        let id = InstanceId::new();
        let (pe, pr) = sup
            .start_pair(
                id,
                &spec("engine", "sleep", &["30"], dir.path()),
                &spec("router", "sleep", &["30"], dir.path()),
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_ne!(pe, pr);
        assert_eq!(sup.observe(id), Observation::Alive);
        assert_eq!(sup.running_count(), 1);

        let (engine, router) = sup.stop_pair(id, Duration::from_secs(2)).await.unwrap();
        assert!(matches!(engine, TerminateOutcome::Graceful(_)));
        assert!(matches!(router, TerminateOutcome::Graceful(_)));
        assert_eq!(sup.running_count(), 0);
        assert!(sup.stop_pair(id, Duration::from_secs(1)).await.is_none());
    }

    #[tokio::test]
    async fn observe_detects_external_kill() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor();
        let id = InstanceId::new();
        let (pid_engine, _) = sup
            .start_pair(
                id,
                &spec("engine", "sleep", &["30"], dir.path()),
                &spec("router", "sleep", &["30"], dir.path()),
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        platform::kill_group(pid_engine).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        match sup.observe(id) {
            Observation::Exited { process, exit } => {
                assert_eq!(process, "engine");
                assert_eq!(exit.signal, Some(libc::SIGKILL));
            }
            other => panic!("unexpected observation {:?}", other),
        }
        sup.stop_pair(id, Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn router_failure_tears_down_engine() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor();
        let id = InstanceId::new();
        let err = sup
            .start_pair(
                id,
                &spec("engine", "sleep", &["30"], dir.path()),
                &spec("router", "sh", &["-c", "exit 1"], dir.path()),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SpawnError::EarlyExit { ref process, .. } if process == "router"));
        assert_eq!(sup.running_count(), 0);
        assert_eq!(sup.observe(id), Observation::Unobservable("no process handle held".to_string()));
    }
}
