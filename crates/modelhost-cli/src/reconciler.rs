//! Client-side state reconciliation
//!
//! A watcher keeps two independent tasks: a stream reader that follows
//! `GET /events` and reconnects with capped, jittered exponential backoff,
//! and a poller that fetches the snapshot endpoints whenever nothing has
//! been heard for a while. They share only the time of the last update and
//! report through one channel.

use crate::client::ModelhostClient;
use anyhow::Result;
use modelhost_core::{Event, GpuSnapshot, LaunchSession, MetricsSnapshot, StatusSnapshot};
use rand::Rng;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Timing knobs for a watcher
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    /// Fraction of each delay added or removed at random
    pub backoff_jitter: f64,
    /// Consecutive failed connects before the reader stops for good
    pub max_attempts: u32,
    pub poll_check_interval: Duration,
    pub stale_after: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(30),
            backoff_jitter: 0.2,
            max_attempts: 8,
            poll_check_interval: Duration::from_secs(2),
            stale_after: Duration::from_secs(5),
        }
    }
}

/// Exponential reconnect delays
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
    max_attempts: u32,
    attempts: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration, jitter: f64, max_attempts: u32) -> Self {
        Self {
            base,
            cap,
            jitter: jitter.clamp(0.0, 1.0),
            max_attempts,
            attempts: 0,
        }
    }

    /// Failures recorded since the last reset
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Record a failure; `None` once the attempt budget is spent
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;

        let exponent = (self.attempts - 1).min(16);
        let delay = self.base.saturating_mul(1 << exponent).min(self.cap);
        if self.jitter == 0.0 {
            return Some(delay);
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        Some(delay.mul_f64(factor))
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
    }
}

/// Time of the most recent update, shared by the reader and the poller
#[derive(Debug)]
pub struct Freshness {
    origin: Instant,
    /// Milliseconds since `origin`; negative until the first update
    last_ms: AtomicI64,
}

impl Freshness {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicI64::new(-1),
        }
    }

    pub fn touch(&self) {
        let elapsed = self.origin.elapsed().as_millis() as i64;
        self.last_ms.store(elapsed, Ordering::Release);
    }

    /// How long since the last update; `None` if there never was one
    pub fn idle_for(&self) -> Option<Duration> {
        let last = self.last_ms.load(Ordering::Acquire);
        if last < 0 {
            return None;
        }
        let now = self.origin.elapsed().as_millis() as i64;
        Some(Duration::from_millis(now.saturating_sub(last).max(0) as u64))
    }

    pub fn is_stale(&self, threshold: Duration) -> bool {
        self.idle_for().map_or(true, |idle| idle >= threshold)
    }
}

impl Default for Freshness {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection state of the stream reader
#[derive(Debug, Clone, PartialEq)]
pub enum StreamState {
    Connecting,
    Live,
    Reconnecting { attempt: u32, delay: Duration },
    /// The reader stopped; the watcher relies on polling alone
    GaveUp,
}

/// Everything fetched by one poll
#[derive(Debug, Clone, PartialEq)]
pub struct PolledState {
    pub status: StatusSnapshot,
    pub gpus: Vec<GpuSnapshot>,
    pub metrics: Option<MetricsSnapshot>,
    pub launch: Option<LaunchSession>,
}

/// Message to the renderer
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Event(Event),
    Polled(PolledState),
    Stream(StreamState),
}

/// A running watcher
pub struct Reconciler {
    updates: mpsc::Receiver<Update>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Reconciler {
    pub fn spawn(client: ModelhostClient, config: ReconcilerConfig) -> Self {
        let (tx, updates) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        let freshness = Arc::new(Freshness::new());

        let reader = tokio::spawn(run_reader(
            client.clone(),
            config.clone(),
            freshness.clone(),
            tx.clone(),
            cancel.clone(),
        ));
        let poller = tokio::spawn(run_poller(client, config, freshness, tx, cancel.clone()));

        Self {
            updates,
            cancel,
            tasks: vec![reader, poller],
        }
    }

    pub async fn recv(&mut self) -> Option<Update> {
        self.updates.recv().await
    }

    pub async fn shutdown(self) {
        let Self {
            updates,
            cancel,
            tasks,
        } = self;
        cancel.cancel();
        // Unblocks a task stuck on a full channel
        drop(updates);
        for task in tasks {
            let _ = task.await;
        }
    }
}

async fn run_reader(
    client: ModelhostClient,
    config: ReconcilerConfig,
    freshness: Arc<Freshness>,
    tx: mpsc::Sender<Update>,
    cancel: CancellationToken,
) {
    let mut backoff = Backoff::new(
        config.backoff_base,
        config.backoff_cap,
        config.backoff_jitter,
        config.max_attempts,
    );

    loop {
        if tx.send(Update::Stream(StreamState::Connecting)).await.is_err() {
            return;
        }

        let connected = tokio::select! {
            _ = cancel.cancelled() => return,
            result = client.events() => result,
        };

        match connected {
            Ok(mut stream) => {
                debug!("Event stream connected to {}", client.endpoint());
                if tx.send(Update::Stream(StreamState::Live)).await.is_err() {
                    return;
                }
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = stream.next() => next,
                    };
                    match next {
                        Ok(Some(event)) => {
                            backoff.reset();
                            freshness.touch();
                            if tx.send(Update::Event(event)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {
                            info!("Event stream closed by the controller");
                            break;
                        }
                        Err(e) => {
                            warn!("Event stream interrupted: {}", e);
                            break;
                        }
                    }
                }
            }
            Err(e) => debug!("Event stream connect failed: {:#}", e),
        }

        let Some(delay) = backoff.next_delay() else {
            warn!(
                "Giving up on the event stream after {} attempts; polling only",
                backoff.attempts()
            );
            let _ = tx.send(Update::Stream(StreamState::GaveUp)).await;
            return;
        };
        let reconnecting = StreamState::Reconnecting {
            attempt: backoff.attempts(),
            delay,
        };
        if tx.send(Update::Stream(reconnecting)).await.is_err() {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_poller(
    client: ModelhostClient,
    config: ReconcilerConfig,
    freshness: Arc<Freshness>,
    tx: mpsc::Sender<Update>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(config.poll_check_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {}
        }
        if !freshness.is_stale(config.stale_after) {
            continue;
        }

        match poll_once(&client).await {
            Ok(state) => {
                freshness.touch();
                if tx.send(Update::Polled(state)).await.is_err() {
                    return;
                }
            }
            Err(e) => debug!("Snapshot poll failed: {:#}", e),
        }
    }
}

/// Fetch every snapshot endpoint concurrently
pub async fn poll_once(client: &ModelhostClient) -> Result<PolledState> {
    let (status, gpus, metrics, launch) = tokio::try_join!(
        client.status(),
        client.gpus(),
        client.metrics(),
        client.current_launch(),
    )?;
    Ok(PolledState {
        status,
        gpus,
        metrics,
        launch,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{client, serve, sse_frame};
    use axum::response::sse::Sse;
    use axum::routing::get;
    use axum::{Json, Router};
    use futures::StreamExt;
    use modelhost_core::{EventPayload, RecipeId};
    use std::convert::Infallible;

    fn fast_config() -> ReconcilerConfig {
        ReconcilerConfig {
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(20),
            backoff_jitter: 0.0,
            max_attempts: 2,
            poll_check_interval: Duration::from_millis(20),
            stale_after: Duration::from_millis(100),
        }
    }

    fn snapshot_routes() -> Router {
        Router::new()
            .route("/status", get(|| async { Json(StatusSnapshot::default()) }))
            .route("/gpus", get(|| async { Json(Vec::<GpuSnapshot>::new()) }))
            .route("/metrics", get(|| async { Json(serde_json::Value::Null) }))
            .route(
                "/launch",
                get(|| async { Json(LaunchSession::new(RecipeId::new("a"))) }),
            )
    }

    async fn next_matching(
        reconciler: &mut Reconciler,
        pred: impl Fn(&Update) -> bool,
    ) -> Vec<Update> {
        let mut seen = Vec::new();
        let found = tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(update) = reconciler.recv().await {
                let done = pred(&update);
                seen.push(update);
                if done {
                    return;
                }
            }
        })
        .await;
        assert!(found.is_ok(), "no matching update in {:?}", seen);
        seen
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.0, 8);
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30, 30]);
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn test_backoff_jitter_bounds() {
        for _ in 0..200 {
            let mut backoff =
                Backoff::new(Duration::from_secs(1), Duration::from_secs(30), 0.2, 8);
            let first = backoff.next_delay().unwrap();
            assert!(first >= Duration::from_millis(800), "{:?}", first);
            assert!(first <= Duration::from_millis(1200), "{:?}", first);
        }
    }

    #[test]
    fn test_freshness() {
        let freshness = Freshness::new();
        assert_eq!(freshness.idle_for(), None);
        assert!(freshness.is_stale(Duration::from_secs(5)));

        freshness.touch();
        assert!(!freshness.is_stale(Duration::from_secs(5)));
        assert!(freshness.is_stale(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_stream_events_flow_through() {
        let status = Event::new(1, EventPayload::Status(StatusSnapshot::default()));
        let served = status.clone();
        let router = snapshot_routes().route(
            "/events",
            get(move || {
                let frame = sse_frame(&served);
                async move {
                    let frames = futures::stream::iter(vec![Ok::<_, Infallible>(frame)])
                        .chain(futures::stream::pending());
                    Sse::new(frames)
                }
            }),
        );
        let addr = serve(router).await;

        let mut reconciler = Reconciler::spawn(client(addr), fast_config());
        let seen = next_matching(&mut reconciler, |u| matches!(u, Update::Event(_))).await;
        assert!(seen.contains(&Update::Stream(StreamState::Live)));
        assert_eq!(seen.last(), Some(&Update::Event(status)));

        reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_falls_back_to_polling_when_stream_is_gone() {
        // No /events route: every connect fails with 404
        let addr = serve(snapshot_routes()).await;

        let mut reconciler = Reconciler::spawn(client(addr), fast_config());
        let seen = next_matching(&mut reconciler, |u| {
            *u == Update::Stream(StreamState::GaveUp)
        })
        .await;
        let reconnects = seen
            .iter()
            .filter(|u| matches!(u, Update::Stream(StreamState::Reconnecting { .. })))
            .count();
        assert_eq!(reconnects, 2);

        // Polls keep arriving after the reader is gone
        let seen = next_matching(&mut reconciler, |u| matches!(u, Update::Polled(_))).await;
        let Some(Update::Polled(state)) = seen.last() else {
            panic!("expected a poll");
        };
        assert!(!state.status.running);
        assert_eq!(state.metrics, None);
        assert_eq!(
            state.launch.as_ref().map(|s| s.recipe_id.clone()),
            Some(RecipeId::new("a"))
        );

        reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_fresh_stream_suppresses_polling() {
        let served = Event::new(1, EventPayload::Status(StatusSnapshot::default()));
        let router = snapshot_routes().route(
            "/events",
            get(move || {
                let served = served.clone();
                async move {
                    // A new event every 20ms keeps the watcher fresh
                    let frames = futures::stream::unfold(served, |event| async move {
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        let frame = sse_frame(&event);
                        Some((Ok::<_, Infallible>(frame), event))
                    });
                    Sse::new(frames)
                }
            }),
        );
        let addr = serve(router).await;

        let mut reconciler = Reconciler::spawn(client(addr), fast_config());
        // The first tick finds the watcher stale and polls once
        next_matching(&mut reconciler, |u| matches!(u, Update::Event(_))).await;

        let mut polls = 0;
        let window = tokio::time::sleep(Duration::from_millis(500));
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => break,
                update = reconciler.recv() => {
                    if matches!(update, Some(Update::Polled(_))) {
                        polls += 1;
                    }
                }
            }
        }
        assert!(polls <= 1, "polled {} times while the stream was live", polls);

        reconciler.shutdown().await;
    }
}
