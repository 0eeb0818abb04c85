//! Supervision of the single engine process
//!
//! [`ProcessSupervisor`] owns at most one child process. All mutation of the
//! slot goes through `start`/`stop`, which are serialized; a per-process
//! watcher task owns the `Child`, reaps it, clears the slot and reports the
//! exit. Output lines are forwarded as [`SupervisorEvent::Log`].

use crate::backend::LaunchSpec;
use crate::{Result, RuntimeError};

use async_trait::async_trait;
use chrono::Utc;
use modelhost_core::{LaunchConfig, LogLine, LogStream, ProcessInfo};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Supervisor timing
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Time between SIGTERM and SIGKILL
    pub stop_grace: Duration,

    /// An exit within this window after spawn is reported as `SpawnFailed`
    pub spawn_check: Duration,

    /// How long to wait for the kernel to reap a killed process
    pub kill_timeout: Duration,

    /// Capacity of the supervisor event channel
    pub event_buffer: usize,
}

impl SupervisorConfig {
    pub fn from_launch(launch: &LaunchConfig) -> Self {
        Self {
            stop_grace: launch.stop_grace(),
            spawn_check: launch.spawn_check(),
            ..Self::default()
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(10),
            spawn_check: Duration::from_millis(300),
            kill_timeout: Duration::from_secs(5),
            event_buffer: 1024,
        }
    }
}

/// How a supervised process ended
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessExit {
    pub pid: u32,
    pub code: Option<i32>,
    pub signal: Option<i32>,
    /// True when the exit was requested through `stop`
    pub expected: bool,
}

impl ProcessExit {
    pub fn describe(&self) -> String {
        match (self.code, self.signal) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(signal)) => format!("signal {}", signal),
            (None, None) => "unknown status".to_string(),
        }
    }
}

/// Notifications emitted by the supervisor
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// The process survived the spawn check and now occupies the slot
    Started(ProcessInfo),
    /// A started process exited; the slot is already empty
    Exited(ProcessExit),
    Log(LogLine),
}

/// Control surface of the engine supervisor
#[async_trait]
pub trait EngineSupervisor: Send + Sync {
    /// Start the engine; fails with `AlreadyRunning` if the slot is occupied
    async fn start(&self, spec: &LaunchSpec) -> Result<ProcessInfo>;

    /// Stop the engine and wait for it to exit; `false` when nothing was running
    async fn stop(&self) -> Result<bool>;

    /// Stop the engine only if `pid` still occupies the slot
    async fn stop_pid(&self, pid: u32) -> Result<bool>;

    /// The process currently in the slot
    fn current(&self) -> Option<ProcessInfo>;

    fn is_alive(&self, pid: u32) -> bool {
        self.current().map(|p| p.pid == pid).unwrap_or(false)
    }

    /// The most recent exit of a started process
    ///
    /// Lets a subscriber that lagged behind the event channel recover an
    /// `Exited` notification it never received.
    fn last_exit(&self) -> Option<ProcessExit>;

    fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent>;
}

struct Slot {
    info: ProcessInfo,
    /// Set once the spawn check passed and `Started` was published
    announced: bool,
    stopping: bool,
    kill_tx: Option<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

type SharedSlot = Arc<Mutex<Option<Slot>>>;

fn lock(slot: &SharedSlot) -> MutexGuard<'_, Option<Slot>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Supervisor backed by a real child process
pub struct ProcessSupervisor {
    config: SupervisorConfig,
    slot: SharedSlot,
    last_exit: Arc<Mutex<Option<ProcessExit>>>,
    events: broadcast::Sender<SupervisorEvent>,
    ops: tokio::sync::Mutex<()>,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            config,
            slot: Arc::new(Mutex::new(None)),
            last_exit: Arc::new(Mutex::new(None)),
            events,
            ops: tokio::sync::Mutex::new(()),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Stop the slot's process, or only `only` when given
    ///
    /// The pid check and the stop happen under the ops lock, so a process
    /// started after the check is never the one stopped.
    async fn stop_matching(&self, only: Option<u32>) -> Result<bool> {
        let _ops = self.ops.lock().await;

        let (pid, mut exit_rx, kill_tx) = {
            let mut slot = lock(&self.slot);
            match slot.as_mut() {
                Some(s) if only.map_or(true, |pid| pid == s.info.pid) => {
                    s.stopping = true;
                    (s.info.pid, s.exit_rx.clone(), s.kill_tx.take())
                }
                _ => return Ok(false),
            }
        };

        info!("Stopping engine process {}", pid);
        signal_group(pid, false);

        if Self::wait_exit(&mut exit_rx, self.config.stop_grace).await.is_some() {
            info!("Engine {} stopped gracefully", pid);
            return Ok(true);
        }

        warn!(
            "Engine {} ignored SIGTERM for {:?}, forcing kill",
            pid, self.config.stop_grace
        );
        signal_group(pid, true);
        if let Some(kill_tx) = kill_tx {
            let _ = kill_tx.send(());
        }

        match Self::wait_exit(&mut exit_rx, self.config.kill_timeout).await {
            Some(_) => Ok(true),
            None => {
                error!("Engine {} did not exit after SIGKILL", pid);
                Err(RuntimeError::Timeout(format!(
                    "engine {} still running {:?} after kill",
                    pid, self.config.kill_timeout
                )))
            }
        }
    }

    async fn wait_exit(
        exit_rx: &mut watch::Receiver<Option<ProcessExit>>,
        limit: Duration,
    ) -> Option<ProcessExit> {
        match timeout(limit, exit_rx.wait_for(|exit| exit.is_some())).await {
            Ok(Ok(exit)) => exit.clone(),
            // The watcher is gone, so the process has been reaped
            Ok(Err(_)) => Some(ProcessExit {
                pid: 0,
                code: None,
                signal: None,
                expected: true,
            }),
            Err(_) => None,
        }
    }
}

#[async_trait]
impl EngineSupervisor for ProcessSupervisor {
    async fn start(&self, spec: &LaunchSpec) -> Result<ProcessInfo> {
        let _ops = self.ops.lock().await;

        let occupied = lock(&self.slot).as_ref().map(|s| s.info.pid);
        if let Some(pid) = occupied {
            return Err(RuntimeError::AlreadyRunning(pid));
        }
        if spec.program.trim().is_empty() {
            return Err(RuntimeError::SpawnFailed("empty engine command".to_string()));
        }

        info!("Starting engine: {}", spec.command_line());

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group so engine workers are signalled with the parent
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| {
            RuntimeError::SpawnFailed(format!("failed to spawn {}: {}", spec.program, e))
        })?;

        let pid = match child.id() {
            Some(pid) => pid,
            None => {
                return Err(RuntimeError::SpawnFailed(
                    "process exited before its pid could be read".to_string(),
                ))
            }
        };

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, pid, LogStream::Stdout, self.events.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, pid, LogStream::Stderr, self.events.clone()));
        }

        let info = ProcessInfo {
            pid,
            backend: spec.backend,
            model_path: spec.model_path.clone(),
            port: spec.port,
            served_model_name: spec.served_model_name.clone(),
            recipe_id: spec.recipe_id.clone(),
            started_at: Utc::now(),
        };

        let (exit_tx, mut exit_rx) = watch::channel(None);
        let (kill_tx, kill_rx) = oneshot::channel();
        *lock(&self.slot) = Some(Slot {
            info: info.clone(),
            announced: false,
            stopping: false,
            kill_tx: Some(kill_tx),
            exit_rx: exit_rx.clone(),
        });
        tokio::spawn(watch_process(
            child,
            pid,
            kill_rx,
            exit_tx,
            self.slot.clone(),
            self.last_exit.clone(),
            self.events.clone(),
        ));

        if let Some(exit) = Self::wait_exit(&mut exit_rx, self.config.spawn_check).await {
            warn!("Engine {} exited during startup ({})", pid, exit.describe());
            return Err(RuntimeError::SpawnFailed(format!(
                "engine exited during startup ({})",
                exit.describe()
            )));
        }

        let mut slot = lock(&self.slot);
        match slot.as_mut() {
            Some(s) if s.info.pid == pid => {
                s.announced = true;
                let _ = self.events.send(SupervisorEvent::Started(info.clone()));
                info!("Engine started with pid {} on port {}", pid, info.port);
                Ok(info)
            }
            _ => Err(RuntimeError::SpawnFailed(
                "engine exited during startup".to_string(),
            )),
        }
    }

    async fn stop(&self) -> Result<bool> {
        self.stop_matching(None).await
    }

    async fn stop_pid(&self, pid: u32) -> Result<bool> {
        self.stop_matching(Some(pid)).await
    }

    fn last_exit(&self) -> Option<ProcessExit> {
        self.last_exit
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn current(&self) -> Option<ProcessInfo> {
        lock(&self.slot)
            .as_ref()
            .filter(|s| s.announced)
            .map(|s| s.info.clone())
    }

    fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }
}

impl Drop for ProcessSupervisor {
    fn drop(&mut self) {
        if let Some(slot) = lock(&self.slot).as_ref() {
            warn!(
                "ProcessSupervisor dropped with running engine {}, killing it",
                slot.info.pid
            );
            signal_group(slot.info.pid, true);
        }
    }
}

/// Reap the child, free the slot and report the exit
async fn watch_process(
    mut child: Child,
    pid: u32,
    kill_rx: oneshot::Receiver<()>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    slot: SharedSlot,
    last_exit: Arc<Mutex<Option<ProcessExit>>>,
    events: broadcast::Sender<SupervisorEvent>,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        request = kill_rx => {
            if request.is_ok() {
                if let Err(e) = child.start_kill() {
                    debug!("start_kill for engine {} failed: {}", pid, e);
                }
            }
            child.wait().await
        }
    };

    let (code, signal) = match status {
        Ok(status) => (status.code(), exit_signal(&status)),
        Err(e) => {
            error!("Failed to wait for engine {}: {}", pid, e);
            (None, None)
        }
    };

    let exit = {
        let mut guard = lock(&slot);
        let (expected, announced) = match guard.as_ref() {
            Some(s) if s.info.pid == pid => (s.stopping, s.announced),
            _ => (true, false),
        };
        if guard.as_ref().map(|s| s.info.pid) == Some(pid) {
            *guard = None;
        }

        let exit = ProcessExit {
            pid,
            code,
            signal,
            expected,
        };
        if announced {
            if expected {
                info!("Engine {} exited ({})", pid, exit.describe());
            } else {
                warn!("Engine {} exited unexpectedly ({})", pid, exit.describe());
            }
            *last_exit.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
                Some(exit.clone());
            // Published under the slot lock so it cannot overtake `Started`
            let _ = events.send(SupervisorEvent::Exited(exit.clone()));
        }
        exit
    };

    let _ = exit_tx.send(Some(exit));
}

async fn forward_lines<R>(
    reader: R,
    pid: u32,
    stream: LogStream,
    events: broadcast::Sender<SupervisorEvent>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let _ = events.send(SupervisorEvent::Log(LogLine { pid, stream, line }));
            }
            Ok(None) => break,
            Err(e) => {
                debug!("Stopped reading engine {} output: {}", pid, e);
                break;
            }
        }
    }
}

#[cfg(unix)]
fn exit_signal(status: &std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &std::process::ExitStatus) -> Option<i32> {
    None
}

/// Signal the engine's process group, falling back to the pid alone
#[cfg(unix)]
fn signal_group(pid: u32, force: bool) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let sig = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    let target = Pid::from_raw(pid as i32);
    if let Err(e) = signal::killpg(target, sig) {
        debug!("killpg({}, {}) failed: {}, signalling pid", pid, sig, e);
        if let Err(e) = signal::kill(target, sig) {
            warn!("Failed to send {} to engine {}: {}", sig, pid, e);
        }
    } else {
        debug!("Sent {} to engine process group {}", sig, pid);
    }
}

/// Without signals the watcher's kill request is the only lever
#[cfg(not(unix))]
fn signal_group(_pid: u32, _force: bool) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use modelhost_core::Backend;
    use std::collections::HashMap;

    fn spec(program: &str, args: &[&str]) -> LaunchSpec {
        LaunchSpec {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: HashMap::new(),
            backend: Backend::Vllm,
            model_path: "/models/test".to_string(),
            port: 18000,
            served_model_name: "test".to_string(),
            health_path: "/health".to_string(),
            recipe_id: None,
        }
    }

    fn fast_config() -> SupervisorConfig {
        SupervisorConfig {
            stop_grace: Duration::from_secs(2),
            spawn_check: Duration::from_millis(100),
            kill_timeout: Duration::from_secs(5),
            event_buffer: 64,
        }
    }

    async fn next_exit(rx: &mut broadcast::Receiver<SupervisorEvent>) -> ProcessExit {
        timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(SupervisorEvent::Exited(exit)) = rx.recv().await {
                    return exit;
                }
            }
        })
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_stop_single_slot() {
        let supervisor = ProcessSupervisor::new(fast_config());
        let mut events = supervisor.subscribe();

        assert!(supervisor.current().is_none());
        assert!(!supervisor.stop().await.unwrap());

        let info = supervisor.start(&spec("sleep", &["30"])).await.unwrap();
        assert_eq!(supervisor.current().map(|p| p.pid), Some(info.pid));
        assert!(supervisor.is_alive(info.pid));
        assert_eq!(info.model_path, "/models/test");

        let err = supervisor.start(&spec("sleep", &["30"])).await.unwrap_err();
        assert!(matches!(err, RuntimeError::AlreadyRunning(pid) if pid == info.pid));

        assert!(supervisor.stop().await.unwrap());
        assert!(supervisor.current().is_none());
        assert!(!supervisor.is_alive(info.pid));

        let exit = next_exit(&mut events).await;
        assert_eq!(exit.pid, info.pid);
        assert!(exit.expected);

        // Stopping again is a no-op
        assert!(!supervisor.stop().await.unwrap());
    }

    #[tokio::test]
    async fn test_spawn_failure_missing_binary() {
        let supervisor = ProcessSupervisor::new(fast_config());
        let err = supervisor
            .start(&spec("/nonexistent/modelhost-engine", &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::SpawnFailed(_)));
        assert!(supervisor.current().is_none());
    }

    #[tokio::test]
    async fn test_immediate_exit_is_spawn_failure() {
        let supervisor = ProcessSupervisor::new(fast_config());
        let err = supervisor
            .start(&spec("sh", &["-c", "exit 3"]))
            .await
            .unwrap_err();
        match err {
            RuntimeError::SpawnFailed(msg) => assert!(msg.contains("exit code 3"), "{}", msg),
            other => panic!("unexpected error: {}", other),
        }
        assert!(supervisor.current().is_none());

        // The slot is free again
        let info = supervisor.start(&spec("sleep", &["30"])).await.unwrap();
        assert!(supervisor.is_alive(info.pid));
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_exit_is_reported() {
        let supervisor = ProcessSupervisor::new(fast_config());
        let mut events = supervisor.subscribe();

        let info = supervisor
            .start(&spec("sh", &["-c", "sleep 0.5; exit 1"]))
            .await
            .unwrap();

        let exit = next_exit(&mut events).await;
        assert_eq!(exit.pid, info.pid);
        assert_eq!(exit.code, Some(1));
        assert!(!exit.expected);
        assert!(supervisor.current().is_none());
    }

    #[tokio::test]
    async fn test_last_exit_survives_lagging_subscriber() {
        let mut config = fast_config();
        config.event_buffer = 4;
        let supervisor = ProcessSupervisor::new(config);
        let mut events = supervisor.subscribe();
        assert!(supervisor.last_exit().is_none());

        // Far more output than the channel holds, then a crash
        let info = supervisor
            .start(&spec("sh", &["-c", "sleep 0.3; seq 1 200; exit 2"]))
            .await
            .unwrap();
        timeout(Duration::from_secs(10), async {
            while supervisor.current().is_some() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(
            events.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        let exit = supervisor.last_exit().unwrap();
        assert_eq!(exit.pid, info.pid);
        assert_eq!(exit.code, Some(2));
        assert!(!exit.expected);
    }

    #[tokio::test]
    async fn test_stop_pid_ignores_other_process() {
        let supervisor = ProcessSupervisor::new(fast_config());
        let info = supervisor.start(&spec("sleep", &["30"])).await.unwrap();

        assert!(!supervisor.stop_pid(info.pid + 1).await.unwrap());
        assert!(supervisor.is_alive(info.pid));

        assert!(supervisor.stop_pid(info.pid).await.unwrap());
        assert!(!supervisor.is_alive(info.pid));
        assert!(supervisor.last_exit().map_or(false, |exit| exit.expected));
    }

    #[tokio::test]
    async fn test_output_is_forwarded() {
        let supervisor = ProcessSupervisor::new(fast_config());
        let mut events = supervisor.subscribe();

        supervisor
            .start(&spec("sh", &["-c", "echo engine-online; echo oops >&2; sleep 30"]))
            .await
            .unwrap();

        let mut seen = Vec::new();
        timeout(Duration::from_secs(5), async {
            while seen.len() < 2 {
                if let Ok(SupervisorEvent::Log(line)) = events.recv().await {
                    seen.push((line.stream, line.line));
                }
            }
        })
        .await
        .unwrap();

        assert!(seen.contains(&(LogStream::Stdout, "engine-online".to_string())));
        assert!(seen.contains(&(LogStream::Stderr, "oops".to_string())));
        supervisor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let mut config = fast_config();
        config.stop_grace = Duration::from_millis(300);
        let supervisor = ProcessSupervisor::new(config);

        supervisor
            .start(&spec("sh", &["-c", "trap '' TERM; sleep 30"]))
            .await
            .unwrap();

        let started = std::time::Instant::now();
        assert!(supervisor.stop().await.unwrap());
        assert!(supervisor.current().is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
