//! Launch orchestration
//!
//! A launch walks `preempting -> evicting -> launching -> waiting` and ends in
//! `ready`, `cancelled` or `error`. At most one session is active. A new
//! request cancels the active session under the state lock and its driver
//! waits for the superseded driver to finish before touching the supervisor,
//! so two sessions never advance at the same time. Concurrent requests are
//! ordered by that lock; the last to acquire it wins.
//!
//! Every transition is published as a `launch_progress` event while the state
//! lock is held, which makes the published order the transition order.

use crate::bus::EventBus;

use modelhost_core::{
    BackendsConfig, EventPayload, LaunchConfig, LaunchSession, LaunchStage, RecipeId, RecipeStore,
    SessionId,
};
use modelhost_runtime::{
    EngineSupervisor, LaunchSpec, ProbeTarget, ProcessExit, ReadinessOutcome, ReadinessProbe,
    RuntimeError,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Orchestrator timing
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub readiness_timeout: Duration,
    /// How long a terminal session stays visible before it is cleared
    pub terminal_grace: Duration,
    /// Upper bound on waiting for the active driver during shutdown
    pub shutdown_timeout: Duration,
}

impl From<&LaunchConfig> for OrchestratorSettings {
    fn from(launch: &LaunchConfig) -> Self {
        Self {
            readiness_timeout: launch.readiness_timeout(),
            terminal_grace: launch.terminal_grace(),
            shutdown_timeout: launch.stop_grace() * 2,
        }
    }
}

struct ActiveLaunch {
    session: LaunchSession,
    cancel: CancellationToken,
    /// Engine pid spawned by this session
    pid: Option<u32>,
}

#[derive(Default)]
struct State {
    active: Option<ActiveLaunch>,
    /// Driver of the most recent session; outlives the session's grace period
    driver: Option<JoinHandle<()>>,
}

struct Inner {
    recipes: Arc<dyn RecipeStore>,
    backends: BackendsConfig,
    supervisor: Arc<dyn EngineSupervisor>,
    prober: Arc<dyn ReadinessProbe>,
    bus: EventBus,
    settings: OrchestratorSettings,
    state: Mutex<State>,
}

/// Sequences launches of recipes onto the single engine slot
#[derive(Clone)]
pub struct LaunchOrchestrator {
    inner: Arc<Inner>,
}

impl LaunchOrchestrator {
    pub fn new(
        recipes: Arc<dyn RecipeStore>,
        backends: BackendsConfig,
        supervisor: Arc<dyn EngineSupervisor>,
        prober: Arc<dyn ReadinessProbe>,
        bus: EventBus,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                recipes,
                backends,
                supervisor,
                prober,
                bus,
                settings,
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Begin launching `recipe_id`, preempting any in-flight launch
    ///
    /// Returns the new session in its `preempting` stage; the rest of the
    /// launch runs in the background and is reported on the bus.
    pub async fn request_launch(&self, recipe_id: &RecipeId) -> modelhost_core::Result<LaunchSession> {
        let recipe = self.inner.recipes.get(recipe_id).await?;
        recipe.validate()?;
        let spec = LaunchSpec::from_recipe(&recipe, self.inner.backends.get(recipe.backend));
        info!("Launch requested for {}: {}", recipe_id, spec.command_line());

        Ok(self.inner.begin(recipe_id.clone(), spec))
    }

    /// Cancel the active launch, optionally only if it is for `recipe_id`
    ///
    /// Returns false when there is nothing in flight to cancel.
    pub fn cancel_launch(&self, recipe_id: Option<&RecipeId>) -> bool {
        self.inner.cancel(recipe_id)
    }

    /// Cancel any in-flight launch and stop the engine
    pub async fn evict(&self) -> modelhost_core::Result<bool> {
        if self.inner.cancel(None) {
            info!("Eviction cancelled the in-flight launch");
        }
        Ok(self.inner.supervisor.stop().await?)
    }

    /// The active session, if any
    pub fn current(&self) -> Option<LaunchSession> {
        self.inner
            .lock()
            .active
            .as_ref()
            .map(|active| active.session.clone())
    }

    /// React to an engine exit reported by the supervisor
    ///
    /// An unexpected exit of the process owned by the current session moves
    /// that session to `error`, including a session that already reached
    /// `ready`.
    pub fn on_process_exit(&self, exit: &ProcessExit) {
        if exit.expected {
            return;
        }

        let mut state = self.inner.lock();
        let Some(active) = state.active.as_mut() else {
            return;
        };
        if active.pid != Some(exit.pid)
            || matches!(
                active.session.stage,
                LaunchStage::Cancelled | LaunchStage::Error
            )
        {
            return;
        }

        warn!(
            "Engine pid {} for {} exited unexpectedly ({})",
            exit.pid,
            active.session.recipe_id,
            exit.describe()
        );
        let crashed = RuntimeError::ProcessCrashed(format!(
            "engine pid {} exited unexpectedly ({})",
            exit.pid,
            exit.describe()
        ));
        active.session.advance(LaunchStage::Error, crashed.to_string());
        self.inner
            .bus
            .publish(EventPayload::LaunchProgress(active.session.clone()));
        let id = active.session.id.clone();
        drop(state);
        self.inner.schedule_clear(id);
    }

    /// Cancel any in-flight launch and wait for its driver to finish
    pub async fn shutdown(&self) {
        self.inner.cancel(None);
        let driver = self.inner.lock().driver.take();
        if let Some(driver) = driver {
            match tokio::time::timeout(self.inner.settings.shutdown_timeout, driver).await {
                Ok(Ok(())) => debug!("Launch driver finished"),
                Ok(Err(e)) => warn!("Launch driver failed: {}", e),
                Err(_) => warn!("Launch driver did not finish before shutdown"),
            }
        }
    }
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn begin(self: &Arc<Self>, recipe_id: RecipeId, spec: LaunchSpec) -> LaunchSession {
        let mut state = self.lock();

        if let Some(active) = state.active.as_mut() {
            if !active.session.is_terminal() {
                active.cancel.cancel();
                active.session.advance(
                    LaunchStage::Cancelled,
                    format!("Superseded by launch of {}", recipe_id),
                );
                info!(
                    "Launch {} for {} superseded by {}",
                    active.session.id, active.session.recipe_id, recipe_id
                );
                self.bus
                    .publish(EventPayload::LaunchProgress(active.session.clone()));
            }
        }

        let session = LaunchSession::new(recipe_id);
        self.bus
            .publish(EventPayload::LaunchProgress(session.clone()));

        let cancel = CancellationToken::new();
        let previous = state.driver.take();
        let driver = tokio::spawn(self.clone().drive(
            session.id.clone(),
            spec,
            cancel.clone(),
            previous,
        ));

        state.active = Some(ActiveLaunch {
            session: session.clone(),
            cancel,
            pid: None,
        });
        state.driver = Some(driver);
        session
    }

    async fn drive(
        self: Arc<Self>,
        id: SessionId,
        spec: LaunchSpec,
        cancel: CancellationToken,
        previous: Option<JoinHandle<()>>,
    ) {
        // Preempting: the superseded driver must release the engine first
        if let Some(previous) = previous {
            if let Err(e) = previous.await {
                warn!("Superseded launch driver failed: {}", e);
            }
        }
        if cancel.is_cancelled() {
            return;
        }

        if !self.transition(&id, LaunchStage::Evicting, "Stopping the current engine") {
            return;
        }
        match self.supervisor.stop().await {
            Ok(true) => debug!("Evicted the previous engine"),
            Ok(false) => debug!("No engine to evict"),
            Err(e) => {
                self.transition(
                    &id,
                    LaunchStage::Error,
                    format!("Failed to stop the current engine: {}", e),
                );
                return;
            }
        }

        if !self.transition(
            &id,
            LaunchStage::Launching,
            format!("Starting {} for {}", spec.backend, spec.served_model_name),
        ) {
            return;
        }
        let process = match self.supervisor.start(&spec).await {
            Ok(process) => process,
            Err(e) => {
                self.transition(&id, LaunchStage::Error, e.to_string());
                return;
            }
        };
        let pid = process.pid;
        self.record_pid(&id, pid);

        // A spawn already issued runs to completion, then gets cleaned up
        if cancel.is_cancelled()
            || !self.transition(
                &id,
                LaunchStage::Waiting,
                format!("Waiting for the engine to become healthy on port {}", process.port),
            )
        {
            self.stop_abandoned(pid).await;
            return;
        }

        let target = ProbeTarget {
            port: process.port,
            health_path: spec.health_path.clone(),
            timeout: self.settings.readiness_timeout,
        };
        let supervisor = self.supervisor.clone();
        let alive = move || supervisor.is_alive(pid);

        match self.prober.wait_ready(&target, &alive, &cancel).await {
            ReadinessOutcome::Ready => {
                self.transition(
                    &id,
                    LaunchStage::Ready,
                    format!("Serving {} on port {}", process.served_model_name, process.port),
                );
            }
            ReadinessOutcome::Timeout => {
                // The process is left running for inspection
                let err = RuntimeError::ReadinessTimeout(format!(
                    "engine did not become healthy within {}s",
                    target.timeout.as_secs()
                ));
                self.transition(&id, LaunchStage::Error, err.to_string());
            }
            ReadinessOutcome::Crashed => {
                let err = RuntimeError::ProcessCrashed(format!(
                    "engine pid {} exited before becoming healthy",
                    pid
                ));
                self.transition(&id, LaunchStage::Error, err.to_string());
            }
            ReadinessOutcome::Cancelled => self.stop_abandoned(pid).await,
        }
    }

    /// Advance the session if it is still current and in flight
    fn transition(
        self: &Arc<Self>,
        id: &SessionId,
        stage: LaunchStage,
        message: impl Into<String>,
    ) -> bool {
        let mut state = self.lock();
        let active = match state.active.as_mut() {
            Some(active) if &active.session.id == id && !active.session.is_terminal() => active,
            _ => {
                debug!("Launch {} no longer current, skipping {}", id, stage);
                return false;
            }
        };

        active.session.advance(stage, message);
        info!(
            "Launch {} for {}: {} ({})",
            id, active.session.recipe_id, stage, active.session.message
        );
        self.bus
            .publish(EventPayload::LaunchProgress(active.session.clone()));
        drop(state);

        if stage.is_terminal() {
            self.schedule_clear(id.clone());
        }
        true
    }

    fn cancel(self: &Arc<Self>, recipe_id: Option<&RecipeId>) -> bool {
        let mut state = self.lock();
        let active = match state.active.as_mut() {
            Some(active)
                if !active.session.is_terminal()
                    && recipe_id.map_or(true, |r| r == &active.session.recipe_id) =>
            {
                active
            }
            _ => return false,
        };

        active.cancel.cancel();
        active
            .session
            .advance(LaunchStage::Cancelled, "Launch cancelled");
        info!(
            "Launch {} for {} cancelled",
            active.session.id, active.session.recipe_id
        );
        self.bus
            .publish(EventPayload::LaunchProgress(active.session.clone()));
        let id = active.session.id.clone();
        drop(state);

        self.schedule_clear(id);
        true
    }

    fn record_pid(&self, id: &SessionId, pid: u32) {
        let mut state = self.lock();
        if let Some(active) = state.active.as_mut().filter(|a| &a.session.id == id) {
            active.pid = Some(pid);
        }
    }

    /// Stop `pid` if it still occupies the slot
    async fn stop_abandoned(&self, pid: u32) {
        match self.supervisor.stop_pid(pid).await {
            Ok(true) => info!("Stopped engine pid {} of a cancelled launch", pid),
            Ok(false) => debug!("Engine pid {} of a cancelled launch already gone", pid),
            Err(e) => warn!("Failed to stop engine pid {}: {}", pid, e),
        }
    }

    fn schedule_clear(self: &Arc<Self>, id: SessionId) {
        let inner = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(inner.settings.terminal_grace).await;
            let mut state = inner.lock();
            let expired = state
                .active
                .as_ref()
                .map_or(false, |a| a.session.id == id && a.session.is_terminal());
            if expired {
                debug!("Clearing terminal launch {}", id);
                state.active = None;
            }
        });
    }
}
