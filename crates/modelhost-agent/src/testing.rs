//! Fakes shared by the agent's tests

use async_trait::async_trait;
use chrono::Utc;
use modelhost_core::{Backend, InMemoryRecipeStore, LogLine, LogStream, ProcessInfo, Recipe};
use modelhost_runtime::{
    EngineSupervisor, LaunchSpec, ProbeTarget, ProcessExit, ReadinessOutcome, ReadinessProbe,
    RuntimeError, SupervisorEvent,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// In-memory stand-in for the process supervisor
pub(crate) struct FakeSupervisor {
    slot: Mutex<Option<ProcessInfo>>,
    next_pid: AtomicU32,
    fail_start: Mutex<Option<String>>,
    start_delay: Duration,
    /// Set if a start ever found the slot occupied
    overlapped: AtomicBool,
    last_exit: Mutex<Option<ProcessExit>>,
    events: broadcast::Sender<SupervisorEvent>,
}

impl FakeSupervisor {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            next_pid: AtomicU32::new(100),
            fail_start: Mutex::new(None),
            start_delay: Duration::from_millis(5),
            overlapped: AtomicBool::new(false),
            last_exit: Mutex::new(None),
            events: broadcast::channel(64).0,
        }
    }

    /// The next start fails with `SpawnFailed(message)`
    pub(crate) fn failing(message: &str) -> Self {
        let supervisor = Self::new();
        *supervisor.fail_start.lock().unwrap() = Some(message.to_string());
        supervisor
    }

    pub(crate) fn overlapped(&self) -> bool {
        self.overlapped.load(Ordering::SeqCst)
    }

    /// Simulate the engine dying on its own
    pub(crate) fn crash(&self) -> ProcessExit {
        let info = self.slot.lock().unwrap().take().unwrap();
        let exit = ProcessExit {
            pid: info.pid,
            code: Some(1),
            signal: None,
            expected: false,
        };
        self.report_exit(exit.clone());
        exit
    }

    /// Emit `count` output lines from the current engine
    pub(crate) fn chatter(&self, count: usize) {
        let pid = self.current().map_or(0, |p| p.pid);
        for i in 0..count {
            let _ = self.events.send(SupervisorEvent::Log(LogLine {
                pid,
                stream: LogStream::Stderr,
                line: format!("Traceback line {}", i),
            }));
        }
    }

    fn report_exit(&self, exit: ProcessExit) {
        *self.last_exit.lock().unwrap() = Some(exit.clone());
        let _ = self.events.send(SupervisorEvent::Exited(exit));
    }
}

#[async_trait]
impl EngineSupervisor for FakeSupervisor {
    async fn start(&self, spec: &LaunchSpec) -> modelhost_runtime::Result<ProcessInfo> {
        tokio::time::sleep(self.start_delay).await;
        if let Some(message) = self.fail_start.lock().unwrap().take() {
            return Err(RuntimeError::SpawnFailed(message));
        }

        let mut slot = self.slot.lock().unwrap();
        if let Some(existing) = slot.as_ref() {
            self.overlapped.store(true, Ordering::SeqCst);
            return Err(RuntimeError::AlreadyRunning(existing.pid));
        }
        let info = ProcessInfo {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            backend: spec.backend,
            model_path: spec.model_path.clone(),
            port: spec.port,
            served_model_name: spec.served_model_name.clone(),
            recipe_id: spec.recipe_id.clone(),
            started_at: Utc::now(),
        };
        *slot = Some(info.clone());
        let _ = self.events.send(SupervisorEvent::Started(info.clone()));
        Ok(info)
    }

    async fn stop(&self) -> modelhost_runtime::Result<bool> {
        let taken = self.slot.lock().unwrap().take();
        if let Some(info) = &taken {
            self.report_exit(ProcessExit {
                pid: info.pid,
                code: None,
                signal: Some(15),
                expected: true,
            });
        }
        Ok(taken.is_some())
    }

    async fn stop_pid(&self, pid: u32) -> modelhost_runtime::Result<bool> {
        if !self.is_alive(pid) {
            return Ok(false);
        }
        self.stop().await
    }

    fn last_exit(&self) -> Option<ProcessExit> {
        self.last_exit.lock().unwrap().clone()
    }

    fn current(&self) -> Option<ProcessInfo> {
        self.slot.lock().unwrap().clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }
}

/// Becomes ready after a per-port delay; `None` never becomes ready
#[derive(Default)]
pub(crate) struct FakeProbe {
    ready_after: HashMap<u16, Option<Duration>>,
}

impl FakeProbe {
    pub(crate) fn never_ready(ports: &[u16]) -> Self {
        Self {
            ready_after: ports.iter().map(|p| (*p, None)).collect(),
        }
    }
}

#[async_trait]
impl ReadinessProbe for FakeProbe {
    async fn wait_ready(
        &self,
        target: &ProbeTarget,
        alive: &(dyn Fn() -> bool + Send + Sync),
        cancel: &CancellationToken,
    ) -> ReadinessOutcome {
        let ready_after = self
            .ready_after
            .get(&target.port)
            .copied()
            .unwrap_or(Some(Duration::from_millis(20)));
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return ReadinessOutcome::Cancelled;
            }
            if !alive() {
                return ReadinessOutcome::Crashed;
            }
            if ready_after.map_or(false, |after| started.elapsed() >= after) {
                return ReadinessOutcome::Ready;
            }
            if started.elapsed() >= target.timeout {
                return ReadinessOutcome::Timeout;
            }
            tokio::select! {
                _ = cancel.cancelled() => return ReadinessOutcome::Cancelled,
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
    }
}

/// `recipe-a`, `recipe-b` and `recipe-c` on ports 8001..=8003
pub(crate) fn recipes() -> InMemoryRecipeStore {
    let recipe = |id: &str, port: u16| {
        let mut recipe = Recipe::new(id, format!("/models/{}", id), Backend::Vllm);
        recipe.port = Some(port);
        recipe
    };
    InMemoryRecipeStore::new(vec![
        recipe("recipe-a", 8001),
        recipe("recipe-b", 8002),
        recipe("recipe-c", 8003),
    ])
    .unwrap()
}
