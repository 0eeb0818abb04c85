//! Engine metrics: scraping, rate derivation and aggregation
//!
//! Both engines expose Prometheus text on `/metrics`. Gauges are read as-is;
//! throughput and time-to-first-token are derived from counter deltas between
//! consecutive scrapes of the same process.

use crate::{Result, RuntimeError};

use chrono::Utc;
use modelhost_core::{Backend, LifetimeMetrics, MetricsSnapshot, PeakMetrics};
use reqwest::Client;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Parse Prometheus text exposition into `name -> value`
///
/// Samples of the same metric with different label sets are summed.
pub fn parse_prometheus(text: &str) -> HashMap<String, f64> {
    let mut values: HashMap<String, f64> = HashMap::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // name{labels} value [timestamp]
        let (name, rest) = match line.find('{') {
            Some(open) => match line[open..].find('}') {
                Some(close) => (&line[..open], &line[open + close + 1..]),
                None => continue,
            },
            None => match line.split_once(char::is_whitespace) {
                Some((name, rest)) => (name, rest),
                None => continue,
            },
        };

        let value = match rest.split_whitespace().next().map(str::parse::<f64>) {
            Some(Ok(value)) if value.is_finite() => value,
            _ => continue,
        };

        *values.entry(name.to_string()).or_insert(0.0) += value;
    }

    values
}

/// Raw engine counters from one scrape
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineCounters {
    pub running: f64,
    pub pending: f64,
    pub prompt_tokens_total: f64,
    pub generation_tokens_total: f64,
    /// Fraction 0-1
    pub kv_cache_usage: Option<f64>,
    pub ttft_sum_seconds: f64,
    pub ttft_count: f64,
}

impl EngineCounters {
    pub fn from_prometheus(backend: Backend, values: &HashMap<String, f64>) -> Self {
        let get = |name: &str| values.get(name).copied();
        let first = |names: &[&str]| names.iter().find_map(|n| get(n)).unwrap_or(0.0);

        match backend {
            Backend::Vllm => Self {
                running: first(&["vllm:num_requests_running"]),
                pending: first(&["vllm:num_requests_waiting"]),
                prompt_tokens_total: first(&["vllm:prompt_tokens_total"]),
                generation_tokens_total: first(&["vllm:generation_tokens_total"]),
                // Renamed in newer vLLM releases
                kv_cache_usage: get("vllm:kv_cache_usage_perc")
                    .or_else(|| get("vllm:gpu_cache_usage_perc")),
                ttft_sum_seconds: first(&["vllm:time_to_first_token_seconds_sum"]),
                ttft_count: first(&["vllm:time_to_first_token_seconds_count"]),
            },
            Backend::Sglang => Self {
                running: first(&["sglang:num_running_reqs"]),
                pending: first(&["sglang:num_queue_reqs"]),
                prompt_tokens_total: first(&["sglang:prompt_tokens_total"]),
                generation_tokens_total: first(&["sglang:generation_tokens_total"]),
                kv_cache_usage: get("sglang:token_usage"),
                ttft_sum_seconds: first(&["sglang:time_to_first_token_seconds_sum"]),
                ttft_count: first(&["sglang:time_to_first_token_seconds_count"]),
            },
        }
    }
}

/// HTTP scraper for the engine's `/metrics` endpoint
#[derive(Debug, Clone)]
pub struct MetricsScraper {
    client: Client,
}

impl MetricsScraper {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            RuntimeError::Configuration(format!("Failed to create HTTP client: {}", e))
        })?;
        Ok(Self { client })
    }

    pub async fn scrape(&self, port: u16, backend: Backend) -> Result<EngineCounters> {
        let url = format!("http://127.0.0.1:{}/metrics", port);
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(RuntimeError::InvalidResponse(format!(
                "{} returned {}",
                url,
                response.status()
            )));
        }
        let body = response.text().await?;
        let values = parse_prometheus(&body);
        debug!("Scraped {} metric families from {}", values.len(), url);

        if !values.keys().any(|k| k.starts_with(backend.metrics_prefix())) {
            return Err(RuntimeError::InvalidResponse(format!(
                "no {} metrics at {}",
                backend, url
            )));
        }

        Ok(EngineCounters::from_prometheus(backend, &values))
    }
}

/// Turns successive counter scrapes of one process into snapshots
#[derive(Debug, Default)]
pub struct MetricsTracker {
    previous: Option<(Instant, EngineCounters)>,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget the previous scrape, e.g. when a new process starts
    pub fn reset(&mut self) {
        self.previous = None;
    }

    pub fn update(&mut self, counters: EngineCounters, now: Instant) -> MetricsSnapshot {
        let mut snapshot = MetricsSnapshot {
            running_requests: counters.running.max(0.0).round() as u32,
            pending_requests: counters.pending.max(0.0).round() as u32,
            kv_cache_usage_pct: counters.kv_cache_usage.map(|u| u * 100.0),
            prompt_tokens_total: counters.prompt_tokens_total.max(0.0) as u64,
            generation_tokens_total: counters.generation_tokens_total.max(0.0) as u64,
            timestamp: Some(Utc::now()),
            ..MetricsSnapshot::default()
        };

        if let Some((at, prev)) = &self.previous {
            let dt = now.duration_since(*at).as_secs_f64();
            if dt > 0.0 {
                snapshot.prompt_tokens_per_sec =
                    rate(prev.prompt_tokens_total, counters.prompt_tokens_total, dt);
                snapshot.generation_tokens_per_sec =
                    rate(prev.generation_tokens_total, counters.generation_tokens_total, dt);
            }
            let count = counters.ttft_count - prev.ttft_count;
            let sum = counters.ttft_sum_seconds - prev.ttft_sum_seconds;
            if count > 0.0 && sum >= 0.0 {
                snapshot.ttft_ms = Some(sum / count * 1000.0);
            }
        }

        self.previous = Some((now, counters));
        snapshot
    }
}

/// Counter delta per second; a counter that went backwards was reset
fn rate(previous: f64, current: f64, dt: f64) -> f64 {
    if current >= previous {
        (current - previous) / dt
    } else {
        0.0
    }
}

/// Peak and lifetime figures across every supervised process
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    peak: PeakMetrics,
    lifetime: LifetimeMetrics,
    last_prompt_total: Option<u64>,
    last_generation_total: Option<u64>,
    running_since: Option<Instant>,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new engine process started; its counters begin from zero
    pub fn record_launch(&mut self, now: Instant) {
        self.close_uptime(now);
        self.lifetime.launches += 1;
        self.last_prompt_total = None;
        self.last_generation_total = None;
        self.running_since = Some(now);
    }

    /// The engine process exited or was stopped
    pub fn record_stop(&mut self, now: Instant) {
        self.close_uptime(now);
    }

    pub fn record(&mut self, snapshot: &MetricsSnapshot) {
        let peak = &mut self.peak;
        let mut changed = false;
        if snapshot.generation_tokens_per_sec > peak.generation_tokens_per_sec {
            peak.generation_tokens_per_sec = snapshot.generation_tokens_per_sec;
            changed = true;
        }
        if snapshot.prompt_tokens_per_sec > peak.prompt_tokens_per_sec {
            peak.prompt_tokens_per_sec = snapshot.prompt_tokens_per_sec;
            changed = true;
        }
        if snapshot.running_requests > peak.running_requests {
            peak.running_requests = snapshot.running_requests;
            changed = true;
        }
        if let Some(ttft) = snapshot.ttft_ms {
            if peak.min_ttft_ms.map_or(true, |min| ttft < min) {
                peak.min_ttft_ms = Some(ttft);
                changed = true;
            }
        }
        if changed {
            peak.updated_at = Some(Utc::now());
        }

        self.lifetime.prompt_tokens += delta(
            &mut self.last_prompt_total,
            snapshot.prompt_tokens_total,
        );
        self.lifetime.generation_tokens += delta(
            &mut self.last_generation_total,
            snapshot.generation_tokens_total,
        );
    }

    pub fn peak(&self) -> PeakMetrics {
        self.peak.clone()
    }

    pub fn lifetime(&self, now: Instant) -> LifetimeMetrics {
        let mut lifetime = self.lifetime.clone();
        if let Some(since) = self.running_since {
            lifetime.uptime_secs += now.duration_since(since).as_secs();
        }
        lifetime
    }

    fn close_uptime(&mut self, now: Instant) {
        if let Some(since) = self.running_since.take() {
            self.lifetime.uptime_secs += now.duration_since(since).as_secs();
        }
    }
}

/// Tokens added since the last observation, treating a drop as a counter reset
fn delta(last: &mut Option<u64>, current: u64) -> u64 {
    let added = match *last {
        Some(previous) if current >= previous => current - previous,
        _ => current,
    };
    *last = Some(current);
    added
}

#[cfg(test)]
mod tests {
    use super::*;

    const VLLM_METRICS: &str = r#"
# HELP vllm:num_requests_running Number of requests currently running on GPU.
# TYPE vllm:num_requests_running gauge
vllm:num_requests_running{model_name="llama"} 3.0
vllm:num_requests_waiting{model_name="llama"} 1.0
vllm:gpu_cache_usage_perc{model_name="llama"} 0.42
# TYPE vllm:prompt_tokens_total counter
vllm:prompt_tokens_total{model_name="llama"} 1000.0
vllm:generation_tokens_total{model_name="llama"} 5000.0
vllm:time_to_first_token_seconds_sum{model_name="llama"} 2.0
vllm:time_to_first_token_seconds_count{model_name="llama"} 10.0
vllm:time_to_first_token_seconds_bucket{le="0.1",model_name="llama"} 4.0
process_cpu_seconds_total 12.5
"#;

    #[test]
    fn test_parse_prometheus() {
        let values = parse_prometheus(VLLM_METRICS);
        assert_eq!(values["vllm:num_requests_running"], 3.0);
        assert_eq!(values["vllm:gpu_cache_usage_perc"], 0.42);
        assert_eq!(values["process_cpu_seconds_total"], 12.5);

        // Label sets of the same name are summed
        let values = parse_prometheus("x{a=\"1\"} 2\nx{a=\"2\"} 3\nbroken{ 1\ny NaN\n");
        assert_eq!(values["x"], 5.0);
        assert!(!values.contains_key("y"));
    }

    #[test]
    fn test_vllm_counters() {
        let counters =
            EngineCounters::from_prometheus(Backend::Vllm, &parse_prometheus(VLLM_METRICS));
        assert_eq!(counters.running, 3.0);
        assert_eq!(counters.pending, 1.0);
        assert_eq!(counters.kv_cache_usage, Some(0.42));
        assert_eq!(counters.generation_tokens_total, 5000.0);
    }

    #[test]
    fn test_sglang_counters() {
        let text = "sglang:num_running_reqs 2\nsglang:num_queue_reqs 0\nsglang:token_usage 0.1\n\
                    sglang:prompt_tokens_total 10\nsglang:generation_tokens_total 20\n";
        let counters = EngineCounters::from_prometheus(Backend::Sglang, &parse_prometheus(text));
        assert_eq!(counters.running, 2.0);
        assert_eq!(counters.kv_cache_usage, Some(0.1));
        assert_eq!(counters.prompt_tokens_total, 10.0);
    }

    #[test]
    fn test_tracker_rates() {
        let mut tracker = MetricsTracker::new();
        let t0 = Instant::now();

        let first = tracker.update(
            EngineCounters {
                prompt_tokens_total: 100.0,
                generation_tokens_total: 1000.0,
                ttft_sum_seconds: 1.0,
                ttft_count: 5.0,
                kv_cache_usage: Some(0.5),
                ..Default::default()
            },
            t0,
        );
        assert_eq!(first.generation_tokens_per_sec, 0.0);
        assert_eq!(first.ttft_ms, None);
        assert_eq!(first.kv_cache_usage_pct, Some(50.0));

        let second = tracker.update(
            EngineCounters {
                prompt_tokens_total: 300.0,
                generation_tokens_total: 1500.0,
                ttft_sum_seconds: 1.5,
                ttft_count: 10.0,
                ..Default::default()
            },
            t0 + Duration::from_secs(2),
        );
        assert_eq!(second.prompt_tokens_per_sec, 100.0);
        assert_eq!(second.generation_tokens_per_sec, 250.0);
        assert!((second.ttft_ms.unwrap() - 100.0).abs() < 1e-9);
        assert_eq!(second.generation_tokens_total, 1500);
    }

    #[test]
    fn test_aggregator_counter_reset() {
        let mut agg = MetricsAggregator::new();
        let t0 = Instant::now();
        agg.record_launch(t0);

        let snapshot = |gen: u64, tps: f64| MetricsSnapshot {
            generation_tokens_total: gen,
            generation_tokens_per_sec: tps,
            ..MetricsSnapshot::default()
        };

        agg.record(&snapshot(100, 10.0));
        agg.record(&snapshot(250, 40.0));
        // New process, counters restart
        agg.record_stop(t0 + Duration::from_secs(10));
        agg.record_launch(t0 + Duration::from_secs(20));
        agg.record(&snapshot(30, 5.0));

        let lifetime = agg.lifetime(t0 + Duration::from_secs(25));
        assert_eq!(lifetime.generation_tokens, 280);
        assert_eq!(lifetime.launches, 2);
        assert_eq!(lifetime.uptime_secs, 15);
        assert_eq!(agg.peak().generation_tokens_per_sec, 40.0);
    }

    #[test]
    fn test_aggregator_min_ttft() {
        let mut agg = MetricsAggregator::new();
        for ttft in [Some(80.0), None, Some(40.0), Some(60.0)] {
            agg.record(&MetricsSnapshot {
                ttft_ms: ttft,
                ..MetricsSnapshot::default()
            });
        }
        assert_eq!(agg.peak().min_ttft_ms, Some(40.0));
    }
}
