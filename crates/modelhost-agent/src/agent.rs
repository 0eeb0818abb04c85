//! Core agent implementation

use crate::api::{router, ApiState};
use crate::bus::EventBus;
use crate::orchestrator::{LaunchOrchestrator, OrchestratorSettings};
use crate::telemetry::{self, SharedAggregator};
use crate::Result;

use modelhost_core::{Config, GpuConfig, InMemoryRecipeStore, RecipeStore, YamlRecipeStore};
use modelhost_gpu::{GpuMonitor, GpuSampler, MockSampler, NvidiaSmiSampler};
use modelhost_runtime::{
    EngineSupervisor, HttpReadinessProber, MetricsScraper, ProcessSupervisor, ReadinessProbe,
    SupervisorConfig,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long in-flight HTTP connections (SSE streams included) get to finish
const SERVER_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// The modelhost controller
pub struct Agent {
    config: Config,
    state: ApiState,
    monitor: Option<Arc<GpuMonitor>>,
    scraper: Option<MetricsScraper>,
    yaml_recipes: Option<Arc<YamlRecipeStore>>,
    cancel: CancellationToken,
    services: Vec<ServiceHandle>,
    server: Option<ServerHandle>,
}

/// Handle to a running background task
struct ServiceHandle {
    name: &'static str,
    handle: JoinHandle<()>,
}

struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Agent {
    /// Start the telemetry loops and the HTTP server
    ///
    /// Returns the address the server is bound to.
    pub async fn start(&mut self) -> Result<SocketAddr> {
        info!("Starting modelhost agent");

        // Subscribers connecting before the first change still see a status
        telemetry::publish_status(&self.state.bus, self.state.supervisor.as_ref());

        self.services.push(ServiceHandle {
            name: "supervisor-bridge",
            handle: telemetry::spawn_supervisor_bridge(
                self.state.supervisor.clone(),
                self.state.orchestrator.clone(),
                self.state.aggregator.clone(),
                self.state.bus.clone(),
                self.cancel.clone(),
            ),
        });

        if let Some(monitor) = &self.monitor {
            self.services.push(ServiceHandle {
                name: "gpu-sampler",
                handle: telemetry::spawn_gpu_loop(
                    monitor.clone(),
                    self.state.bus.clone(),
                    self.config.gpu.sample_interval(),
                    self.cancel.clone(),
                ),
            });
        }

        if let Some(scraper) = &self.scraper {
            self.services.push(ServiceHandle {
                name: "metrics-scraper",
                handle: telemetry::spawn_metrics_loop(
                    self.state.supervisor.clone(),
                    scraper.clone(),
                    self.state.aggregator.clone(),
                    self.state.bus.clone(),
                    self.config.metrics.scrape_interval(),
                    self.cancel.clone(),
                ),
            });
        }

        #[cfg(unix)]
        if let Some(store) = &self.yaml_recipes {
            self.services.push(ServiceHandle {
                name: "recipe-reloader",
                handle: spawn_recipe_reloader(store.clone(), self.cancel.clone()),
            });
        }

        let addr = self.start_server().await?;
        info!("Modelhost agent listening on http://{}", addr);
        Ok(addr)
    }

    /// Stop serving, cancel any launch and, if configured, the engine
    pub async fn stop(&mut self) -> Result<()> {
        info!("Stopping modelhost agent");

        if let Some(server) = self.server.take() {
            let _ = server.shutdown_tx.send(());
            let mut handle = server.handle;
            if tokio::time::timeout(SERVER_DRAIN_TIMEOUT, &mut handle)
                .await
                .is_err()
            {
                debug!("HTTP connections still open on {}, aborting", server.addr);
                handle.abort();
            }
        }

        self.state.orchestrator.shutdown().await;

        if self.config.server.evict_on_shutdown {
            match self.state.supervisor.stop().await {
                Ok(true) => info!("Stopped the engine"),
                Ok(false) => debug!("No engine running"),
                Err(e) => error!("Failed to stop the engine: {}", e),
            }
        }

        self.cancel.cancel();
        for service in self.services.drain(..) {
            if let Err(e) = service.handle.await {
                warn!("Service {} ended abnormally: {}", service.name, e);
            }
        }

        info!("Modelhost agent stopped");
        Ok(())
    }

    /// Run the agent until SIGINT or SIGTERM
    pub async fn run(&mut self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Run the agent until `shutdown` completes
    pub async fn run_until<F>(&mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.stop().await
    }

    /// Get the agent configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn bus(&self) -> &EventBus {
        &self.state.bus
    }

    pub fn orchestrator(&self) -> &LaunchOrchestrator {
        &self.state.orchestrator
    }

    /// Address of the running HTTP server
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(|server| server.addr)
    }

    async fn start_server(&mut self) -> Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(self.config.server.bind_addr).await?;
        let addr = listener.local_addr()?;
        let app = router(self.state.clone(), self.config.server.cors_enabled);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(e) = server.await {
                error!("HTTP server error: {}", e);
            }
        });

        self.server = Some(ServerHandle {
            addr,
            shutdown_tx,
            handle,
        });
        Ok(addr)
    }
}

/// Resolves on Ctrl+C, SIGINT or SIGTERM
pub async fn shutdown_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C signal");
        }
        _ = wait_for_termination() => {
            info!("Received termination signal");
        }
    }
}

/// Wait for termination signals (SIGTERM, SIGINT)
#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigterm, mut sigint) =
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to install signal handlers: {}", e);
                return std::future::pending().await;
            }
        };

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigint.recv() => {
            info!("Received SIGINT");
        }
    }
}

/// Wait for termination signals (Windows)
#[cfg(not(unix))]
async fn wait_for_termination() {
    // On Windows, we only handle Ctrl+C
    let _ = signal::ctrl_c().await;
}

/// Re-read the recipe file on SIGHUP
#[cfg(unix)]
fn spawn_recipe_reloader(store: Arc<YamlRecipeStore>, cancel: CancellationToken) -> JoinHandle<()> {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(hangup) => hangup,
            Err(e) => {
                warn!("SIGHUP recipe reload unavailable: {}", e);
                return;
            }
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = hangup.recv() => match store.reload() {
                    Ok(count) => info!("Reloaded {} recipes from {}", count, store.path().display()),
                    Err(e) => warn!("Recipe reload failed, keeping previous set: {}", e),
                },
            }
        }
    })
}

fn default_sampler(gpu: &GpuConfig) -> Arc<dyn GpuSampler> {
    if gpu.mock {
        Arc::new(MockSampler::new(1))
    } else {
        Arc::new(NvidiaSmiSampler::new(
            gpu.nvidia_smi_path.clone(),
            gpu.query_timeout(),
        ))
    }
}

/// Builder for creating agents
///
/// Anything not supplied is built from the configuration.
pub struct AgentBuilder {
    config: Option<Config>,
    supervisor: Option<Arc<dyn EngineSupervisor>>,
    prober: Option<Arc<dyn ReadinessProbe>>,
    sampler: Option<Arc<dyn GpuSampler>>,
    recipes: Option<Arc<dyn RecipeStore>>,
}

impl AgentBuilder {
    /// Create a new agent builder
    pub fn new() -> Self {
        Self {
            config: None,
            supervisor: None,
            prober: None,
            sampler: None,
            recipes: None,
        }
    }

    /// Set the agent configuration
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_supervisor(mut self, supervisor: Arc<dyn EngineSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn with_prober(mut self, prober: Arc<dyn ReadinessProbe>) -> Self {
        self.prober = Some(prober);
        self
    }

    pub fn with_sampler(mut self, sampler: Arc<dyn GpuSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub fn with_recipes(mut self, recipes: Arc<dyn RecipeStore>) -> Self {
        self.recipes = Some(recipes);
        self
    }

    /// Build the agent
    pub async fn build(self) -> Result<Agent> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let bus = EventBus::new(config.events.subscriber_buffer);

        let supervisor = self.supervisor.unwrap_or_else(|| {
            Arc::new(ProcessSupervisor::new(SupervisorConfig::from_launch(
                &config.launch,
            )))
        });

        let prober = match self.prober {
            Some(prober) => prober,
            None => Arc::new(HttpReadinessProber::new(
                config.launch.readiness_poll_interval(),
            )?),
        };

        let mut yaml_recipes = None;
        let recipes: Arc<dyn RecipeStore> = match (self.recipes, &config.recipes.path) {
            (Some(recipes), _) => recipes,
            (None, Some(path)) => {
                let store = Arc::new(YamlRecipeStore::open(path)?);
                yaml_recipes = Some(store.clone());
                store
            }
            (None, None) => {
                warn!("No recipe file configured, launches will fail with not found");
                Arc::new(InMemoryRecipeStore::default())
            }
        };

        let monitor = if config.gpu.enabled {
            let sampler = self
                .sampler
                .unwrap_or_else(|| default_sampler(&config.gpu));
            Some(Arc::new(GpuMonitor::new(sampler)))
        } else {
            None
        };

        let scraper = if config.metrics.enabled {
            Some(MetricsScraper::new(config.metrics.scrape_timeout())?)
        } else {
            None
        };

        let orchestrator = LaunchOrchestrator::new(
            recipes.clone(),
            config.backends.clone(),
            supervisor.clone(),
            prober.clone(),
            bus.clone(),
            OrchestratorSettings::from(&config.launch),
        );

        let state = ApiState {
            bus,
            orchestrator,
            supervisor,
            prober,
            recipes,
            aggregator: SharedAggregator::new(),
            backends: config.backends.clone(),
            keep_alive: config.events.keep_alive(),
            wait_ready_default: config.launch.wait_ready_default(),
            wait_ready_max: config.launch.readiness_timeout(),
        };

        Ok(Agent {
            config,
            state,
            monitor,
            scraper,
            yaml_recipes,
            cancel: CancellationToken::new(),
            services: Vec::new(),
            server: None,
        })
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}
