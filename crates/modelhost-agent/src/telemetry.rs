//! Background publishers
//!
//! One task per input source feeds the bus: the GPU sampling loop, the engine
//! metrics loop and the bridge that turns supervisor notifications into
//! `status` and `log` events.

use crate::bus::EventBus;
use crate::orchestrator::LaunchOrchestrator;

use modelhost_core::{EventPayload, LifetimeMetrics, PeakMetrics, StatusSnapshot};
use modelhost_gpu::GpuMonitor;
use modelhost_runtime::{
    EngineSupervisor, MetricsAggregator, MetricsScraper, MetricsTracker, SupervisorEvent,
};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Peak and lifetime figures shared between the metrics loop and the API
#[derive(Clone, Default)]
pub struct SharedAggregator(Arc<Mutex<MetricsAggregator>>);

impl SharedAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MetricsAggregator> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn peak(&self) -> PeakMetrics {
        self.lock().peak()
    }

    pub fn lifetime(&self) -> LifetimeMetrics {
        self.lock().lifetime(Instant::now())
    }
}

/// Publish the supervisor's current process as a `status` event
pub fn publish_status(bus: &EventBus, supervisor: &dyn EngineSupervisor) {
    bus.publish(EventPayload::Status(StatusSnapshot::from_process(
        supervisor.current(),
    )));
}

fn ticker(period: Duration) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Sample GPUs every `period` and publish a `gpu` event per sample
///
/// Sampler failures republish the previous sample; the loop only ends on
/// cancellation.
pub fn spawn_gpu_loop(
    monitor: Arc<GpuMonitor>,
    bus: EventBus,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!(
            "GPU sampling every {:?} via {}",
            period,
            monitor.sampler_name()
        );
        let mut interval = ticker(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let gpus = monitor.sample().await;
                    bus.publish(EventPayload::Gpu(gpus));
                }
            }
        }
        debug!("GPU sampling loop stopped");
    })
}

/// Scrape the engine's metrics every `period` while a process is supervised
pub fn spawn_metrics_loop(
    supervisor: Arc<dyn EngineSupervisor>,
    scraper: MetricsScraper,
    aggregator: SharedAggregator,
    bus: EventBus,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tracker = MetricsTracker::new();
        let mut tracked_pid: Option<u32> = None;
        let mut interval = ticker(period);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            let Some(process) = supervisor.current() else {
                tracked_pid = None;
                continue;
            };
            if tracked_pid != Some(process.pid) {
                tracker.reset();
                tracked_pid = Some(process.pid);
            }

            match scraper.scrape(process.port, process.backend).await {
                Ok(counters) => {
                    let snapshot = tracker.update(counters, Instant::now());
                    aggregator.lock().record(&snapshot);
                    bus.publish(EventPayload::Metrics(snapshot));
                }
                Err(e) => debug!("Metrics scrape of pid {} failed: {}", process.pid, e),
            }
        }
        debug!("Metrics loop stopped");
    })
}

/// Forward supervisor notifications onto the bus
///
/// Starts and exits publish `status`; output lines publish `log`. An
/// unexpected exit is also handed to the orchestrator, including one that
/// fell in a range the bridge lagged over.
pub fn spawn_supervisor_bridge(
    supervisor: Arc<dyn EngineSupervisor>,
    orchestrator: LaunchOrchestrator,
    aggregator: SharedAggregator,
    bus: EventBus,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut events = supervisor.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Ok(SupervisorEvent::Started(process)) => {
                    info!(
                        "Engine pid {} serving {} on port {}",
                        process.pid, process.served_model_name, process.port
                    );
                    aggregator.lock().record_launch(Instant::now());
                    publish_status(&bus, supervisor.as_ref());
                }
                Ok(SupervisorEvent::Exited(exit)) => {
                    aggregator.lock().record_stop(Instant::now());
                    publish_status(&bus, supervisor.as_ref());
                    orchestrator.on_process_exit(&exit);
                }
                Ok(SupervisorEvent::Log(line)) => {
                    bus.publish(EventPayload::Log(line));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Supervisor bridge lagged by {} events, resyncing status", skipped);
                    publish_status(&bus, supervisor.as_ref());
                    // The skipped range may have held an exit; replaying one
                    // already handled is a no-op
                    if let Some(exit) = supervisor.last_exit() {
                        orchestrator.on_process_exit(&exit);
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
        debug!("Supervisor bridge stopped");
    })
}
