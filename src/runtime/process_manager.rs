// src/runtime/process_manager.rs
//! Process manager for worker processes
//!
//! Two interchangeable launch strategies:
//! - Fork (duplicate): the child inherits the parent's loaded environment
//! - Spawn (clean): the child re-executes a binary and rebuilds everything
//!   from the serialized [`WorkerBootstrap`]
//!
//! The pool only sees [`WorkerHandle`]s and [`WorkerChannel`]s.

use crate::runtime::protocol::{encode, WorkerBootstrap};
use crate::utils::errors::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

#[cfg(unix)]
use crate::runtime::worker::WorkerEnvironment;

/// How worker processes are created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaunchStrategy {
    /// Fork where available, spawn otherwise
    Auto,
    Fork,
    Spawn,
}

impl LaunchStrategy {
    /// Resolve `Auto` for the current platform
    pub fn resolve(self) -> LaunchStrategy {
        match self {
            LaunchStrategy::Auto if cfg!(unix) => LaunchStrategy::Fork,
            LaunchStrategy::Auto => LaunchStrategy::Spawn,
            other => other,
        }
    }
}

/// Lifecycle of a worker, owned by the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Idle,
    Busy,
    Crashed,
    Terminating,
}

/// Byte channel to a worker's protocol endpoint
pub struct WorkerChannel {
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

/// The OS process backing a worker
pub enum WorkerProcess {
    #[cfg(unix)]
    Forked {
        pid: nix::unistd::Pid,
        reaped: bool,
    },
    Spawned(Child),
}

impl WorkerProcess {
    pub fn pid(&self) -> Option<u32> {
        match self {
            #[cfg(unix)]
            WorkerProcess::Forked { pid, .. } => Some(pid.as_raw() as u32),
            WorkerProcess::Spawned(child) => child.id(),
        }
    }

    /// Non-blocking liveness check; reaps the process once it has exited
    pub fn is_alive(&mut self) -> bool {
        match self {
            #[cfg(unix)]
            WorkerProcess::Forked { pid, reaped } => {
                use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};

                if *reaped {
                    return false;
                }
                match waitpid(*pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) => true,
                    Ok(status) => {
                        debug!("Worker process {} exited: {:?}", pid, status);
                        *reaped = true;
                        false
                    }
                    Err(e) => {
                        debug!("waitpid({}) failed: {}", pid, e);
                        *reaped = true;
                        false
                    }
                }
            }
            WorkerProcess::Spawned(child) => matches!(child.try_wait(), Ok(None)),
        }
    }

    /// Ask the process to exit, then kill it once `grace` runs out
    ///
    /// A zero grace period kills immediately.
    pub async fn terminate(&mut self, grace: Duration) -> Result<()> {
        if !self.is_alive() {
            return Ok(());
        }

        if !grace.is_zero() {
            self.signal_term()?;
            let deadline = Instant::now() + grace;
            while Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(10)).await;
                if !self.is_alive() {
                    return Ok(());
                }
            }
            debug!("Worker {:?} ignored SIGTERM, killing", self.pid());
        }

        self.kill().await
    }

    #[cfg(unix)]
    fn signal_term(&mut self) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid() else {
            return Ok(());
        };
        match kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
            Err(e) => Err(EngineError::RuntimeError(format!(
                "Failed to send SIGTERM to {}: {}",
                pid, e
            ))),
        }
    }

    #[cfg(not(unix))]
    fn signal_term(&mut self) -> Result<()> {
        Ok(())
    }

    async fn kill(&mut self) -> Result<()> {
        match self {
            #[cfg(unix)]
            WorkerProcess::Forked { pid, .. } => {
                use nix::sys::signal::{kill, Signal};

                let pid = *pid;
                match kill(pid, Signal::SIGKILL) {
                    Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                    Err(e) => {
                        return Err(EngineError::RuntimeError(format!(
                            "Failed to send SIGKILL to {}: {}",
                            pid, e
                        )))
                    }
                }
                // Reap so the child does not linger as a zombie
                for _ in 0..100 {
                    if !self.is_alive() {
                        return Ok(());
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                warn!("Worker process {} not reaped after SIGKILL", pid);
                Ok(())
            }
            WorkerProcess::Spawned(child) => {
                if let Err(e) = child.start_kill() {
                    debug!("start_kill failed: {}", e);
                }
                child
                    .wait()
                    .await
                    .map_err(|e| EngineError::RuntimeError(format!("Failed to reap worker: {}", e)))?;
                Ok(())
            }
        }
    }
}

/// Forked children are not covered by `kill_on_drop`
#[cfg(unix)]
impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if let WorkerProcess::Forked { pid, reaped: false } = self {
            use nix::sys::signal::{kill, Signal};
            use nix::sys::wait::{waitpid, WaitPidFlag};

            let _ = kill(*pid, Signal::SIGKILL);
            let _ = waitpid(*pid, Some(WaitPidFlag::WNOHANG));
        }
    }
}

/// Pool-side handle to one worker
pub struct WorkerHandle {
    pub id: usize,
    pub process: WorkerProcess,
    pub state: WorkerState,

    /// Line index of the job in flight
    pub current_job: Option<usize>,

    pub started_at: Instant,

    /// When the current job was dispatched
    pub busy_since: Option<Instant>,

    pub jobs_completed: u64,
}

impl WorkerHandle {
    pub fn new(id: usize, process: WorkerProcess) -> Self {
        Self {
            id,
            process,
            state: WorkerState::Starting,
            current_job: None,
            started_at: Instant::now(),
            busy_since: None,
            jobs_completed: 0,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn assign(&mut self, line_index: usize) {
        self.state = WorkerState::Busy;
        self.current_job = Some(line_index);
        self.busy_since = Some(Instant::now());
    }

    /// Back to idle after a completed job; returns the job's line index
    pub fn release(&mut self) -> Option<usize> {
        self.state = WorkerState::Idle;
        self.busy_since = None;
        self.jobs_completed += 1;
        self.current_job.take()
    }

    pub fn busy_for(&self) -> Option<Duration> {
        self.busy_since.map(|since| since.elapsed())
    }

    /// Take the worker out of service as `Crashed` or `Terminating`;
    /// returns the in-flight line and how long it had been running
    pub fn retire(&mut self, state: WorkerState) -> Option<(usize, Duration)> {
        debug_assert!(matches!(state, WorkerState::Crashed | WorkerState::Terminating));
        self.state = state;
        let elapsed = self.busy_for().unwrap_or_default();
        self.busy_since = None;
        self.current_job.take().map(|line| (line, elapsed))
    }
}

/// Creates worker processes
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    fn strategy(&self) -> LaunchStrategy;

    async fn launch(&self, bootstrap: &WorkerBootstrap) -> Result<(WorkerProcess, WorkerChannel)>;
}

/// Clean-strategy launcher: runs `program args...` with the bootstrap on stdin
#[derive(Debug, Clone)]
pub struct SpawnLauncher {
    program: PathBuf,
    args: Vec<String>,
    env_vars: Vec<(String, String)>,
}

impl SpawnLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env_vars: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    /// Re-execute the current binary's `worker` subcommand
    pub fn current_exe() -> Result<Self> {
        let program = std::env::current_exe().map_err(|e| {
            EngineError::ProcessSpawnFailed(format!("cannot locate current executable: {}", e))
        })?;
        Ok(Self::new(program).arg("worker"))
    }
}

#[async_trait]
impl ProcessLauncher for SpawnLauncher {
    fn strategy(&self) -> LaunchStrategy {
        LaunchStrategy::Spawn
    }

    async fn launch(&self, bootstrap: &WorkerBootstrap) -> Result<(WorkerProcess, WorkerChannel)> {
        debug!("Spawning worker {} via {:?}", bootstrap.worker_id, self.program);

        let mut command = Command::new(&self.program);
        command.args(&self.args);
        for (key, value) in &self.env_vars {
            command.env(key, value);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            EngineError::ProcessSpawnFailed(format!("Failed to spawn {:?}: {}", self.program, e))
        })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::ProcessSpawnFailed("Failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EngineError::ProcessSpawnFailed("Failed to capture stdout".into()))?;

        let mut line = encode(bootstrap)?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).await.map_err(|e| {
            EngineError::ProcessSpawnFailed(format!("Failed to send bootstrap: {}", e))
        })?;
        stdin.flush().await?;

        debug!("Worker {} spawned with PID {:?}", bootstrap.worker_id, child.id());

        Ok((
            WorkerProcess::Spawned(child),
            WorkerChannel {
                reader: Box::new(stdout),
                writer: Box::new(stdin),
            },
        ))
    }
}

/// Duplicate-strategy launcher: forks the current process
///
/// Forking happens on a fresh OS thread so the child never starts life on a
/// thread owned by the parent's async runtime. Only that thread survives in
/// the child; it serves jobs over a socketpair and exits without unwinding.
///
/// The parent is multi-threaded when it forks. A lock held by another parent
/// thread at that instant (the stderr writer, an allocator arena) stays
/// locked forever in the child, which then hangs on first use. Such a worker
/// never reports ready or never completes its line, so the startup and line
/// timeouts catch it. Use [`SpawnLauncher`] where that risk is unacceptable.
#[cfg(unix)]
pub struct ForkLauncher {
    environment: Arc<WorkerEnvironment>,
}

#[cfg(unix)]
impl ForkLauncher {
    pub fn new(environment: Arc<WorkerEnvironment>) -> Self {
        Self { environment }
    }
}

#[cfg(unix)]
#[async_trait]
impl ProcessLauncher for ForkLauncher {
    fn strategy(&self) -> LaunchStrategy {
        LaunchStrategy::Fork
    }

    async fn launch(&self, bootstrap: &WorkerBootstrap) -> Result<(WorkerProcess, WorkerChannel)> {
        use nix::unistd::{fork, ForkResult};
        use std::os::unix::io::AsRawFd;
        use std::os::unix::net::UnixStream;

        let (parent_end, child_end) = UnixStream::pair()?;
        let parent_fd = parent_end.as_raw_fd();

        let environment = self.environment.clone();
        let child_bootstrap = bootstrap.clone();
        let (tx, rx) = tokio::sync::oneshot::channel();

        std::thread::Builder::new()
            .name(format!("fork-worker-{}", bootstrap.worker_id))
            .spawn(move || {
                // SAFETY: the child only runs the worker loop on this thread and
                // leaves through `_exit`, never returning into the parent's stack.
                match unsafe { fork() } {
                    Ok(ForkResult::Child) => {
                        unsafe {
                            libc::close(parent_fd);
                        }
                        let code = match crate::runtime::worker::serve_forked(
                            environment,
                            &child_bootstrap,
                            child_end,
                        ) {
                            Ok(()) => 0,
                            Err(e) => {
                                eprintln!("worker {} failed: {}", child_bootstrap.worker_id, e);
                                1
                            }
                        };
                        unsafe { libc::_exit(code) }
                    }
                    Ok(ForkResult::Parent { child }) => {
                        drop(child_end);
                        let _ = tx.send(Ok(child));
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| EngineError::ProcessSpawnFailed(format!("Failed to start fork thread: {}", e)))?;

        let pid = rx
            .await
            .map_err(|_| EngineError::ProcessSpawnFailed("fork thread exited early".into()))?
            .map_err(|e| EngineError::ProcessSpawnFailed(format!("fork failed: {}", e)))?;

        debug!("Worker {} forked with PID {}", bootstrap.worker_id, pid);

        parent_end.set_nonblocking(true)?;
        let stream = tokio::net::UnixStream::from_std(parent_end)?;
        let (reader, writer) = stream.into_split();

        Ok((
            WorkerProcess::Forked { pid, reaped: false },
            WorkerChannel {
                reader: Box::new(reader),
                writer: Box::new(writer),
            },
        ))
    }
}

/// Starts, checks and stops workers through one launcher
pub struct ProcessManager {
    launcher: Arc<dyn ProcessLauncher>,
}

impl ProcessManager {
    pub fn new(launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self { launcher }
    }

    pub fn strategy(&self) -> LaunchStrategy {
        self.launcher.strategy()
    }

    /// Create a worker process
    ///
    /// Failure here means the pool cannot reach its target concurrency and
    /// is not retried.
    pub async fn start(&self, bootstrap: &WorkerBootstrap) -> Result<(WorkerHandle, WorkerChannel)> {
        let (process, channel) = self.launcher.launch(bootstrap).await?;
        info!(
            worker_id = bootstrap.worker_id,
            pid = ?process.pid(),
            strategy = ?self.launcher.strategy(),
            "worker process started"
        );
        Ok((WorkerHandle::new(bootstrap.worker_id, process), channel))
    }

    pub fn is_alive(&self, handle: &mut WorkerHandle) -> bool {
        handle.process.is_alive()
    }

    /// Stop the process behind `handle`; lifecycle state is left to the pool
    pub async fn terminate(&self, handle: &mut WorkerHandle, grace: Duration) -> Result<()> {
        debug!(worker_id = handle.id, pid = ?handle.pid(), "terminating worker");
        handle.process.terminate(grace).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::job::FlowReference;

    fn bootstrap() -> WorkerBootstrap {
        WorkerBootstrap {
            worker_id: 0,
            run_id: "run".to_string(),
            flow: FlowReference::new("echo"),
            hooks: Default::default(),
            connections: Default::default(),
            limits: Default::default(),
            collection: "c".to_string(),
            log_filter: "info".to_string(),
        }
    }

    #[test]
    fn test_strategy_resolution() {
        assert_eq!(LaunchStrategy::Spawn.resolve(), LaunchStrategy::Spawn);
        #[cfg(unix)]
        assert_eq!(LaunchStrategy::Auto.resolve(), LaunchStrategy::Fork);
    }

    #[tokio::test]
    async fn test_handle_transitions() {
        let child = Command::new("sleep").arg("5").spawn().unwrap();
        let mut handle = WorkerHandle::new(1, WorkerProcess::Spawned(child));
        assert_eq!(handle.state, WorkerState::Starting);

        handle.assign(4);
        assert_eq!(handle.state, WorkerState::Busy);
        assert!(handle.busy_for().is_some());

        assert_eq!(handle.release(), Some(4));
        assert_eq!(handle.state, WorkerState::Idle);
        assert_eq!(handle.jobs_completed, 1);

        handle.assign(5);
        let (line, _) = handle.retire(WorkerState::Crashed).unwrap();
        assert_eq!(line, 5);
        assert_eq!(handle.state, WorkerState::Crashed);
        assert_eq!(handle.current_job, None);
        assert!(handle.busy_for().is_none());
        assert_eq!(handle.retire(WorkerState::Terminating), None);
        assert_eq!(handle.state, WorkerState::Terminating);

        handle.process.terminate(Duration::ZERO).await.unwrap();
        assert!(!handle.process.is_alive());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_with_grace() {
        let manager = ProcessManager::new(Arc::new(SpawnLauncher::new("sleep").arg("30")));
        let (mut handle, _channel) = manager.start(&bootstrap()).await.unwrap();
        assert!(manager.is_alive(&mut handle));

        manager
            .terminate(&mut handle, Duration::from_millis(500))
            .await
            .unwrap();
        assert!(!manager.is_alive(&mut handle));
        // Only the pool moves a worker out of service
        assert_eq!(handle.state, WorkerState::Starting);
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let manager = ProcessManager::new(Arc::new(SpawnLauncher::new(
            "/nonexistent/flowrun-worker",
        )));
        let err = manager.start(&bootstrap()).await.err().unwrap();
        assert!(matches!(err, EngineError::ProcessSpawnFailed(_)));
    }
}
