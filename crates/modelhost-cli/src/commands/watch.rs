//! Live dashboard fed by the client reconciler

use crate::client::ModelhostClient;
use crate::output::{colorize_status, format_percentage, render_table, OutputFormat};
use crate::reconciler::{Reconciler, ReconcilerConfig, StreamState, Update};
use anyhow::Result;
use chrono::{DateTime, Utc};
use colored::*;
use modelhost_core::{
    EventPayload, GpuSnapshot, LaunchSession, LogLine, MetricsSnapshot, StatusSnapshot,
};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::Write;

const LOG_LINES: usize = 8;

/// Everything the dashboard shows
#[derive(Debug, Clone, Serialize)]
pub struct Dashboard {
    pub status: StatusSnapshot,
    pub gpus: Vec<GpuSnapshot>,
    pub metrics: Option<MetricsSnapshot>,
    pub launch: Option<LaunchSession>,
    pub logs: VecDeque<LogLine>,
    pub stream: String,
    /// Highest event sequence seen on the stream
    pub last_seq: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for Dashboard {
    fn default() -> Self {
        Self {
            status: StatusSnapshot::default(),
            gpus: Vec::new(),
            metrics: None,
            launch: None,
            logs: VecDeque::with_capacity(LOG_LINES),
            stream: "connecting".to_string(),
            last_seq: 0,
            updated_at: None,
        }
    }
}

impl Dashboard {
    /// Fold one update in; returns whether anything visible changed
    pub fn apply(&mut self, update: Update) -> bool {
        match update {
            Update::Stream(state) => {
                let label = stream_label(&state);
                if label == self.stream {
                    return false;
                }
                self.stream = label;
                return true;
            }
            Update::Polled(state) => {
                self.set_status(state.status);
                self.gpus = state.gpus;
                self.metrics = state.metrics;
                self.launch = state.launch;
            }
            Update::Event(event) => {
                self.last_seq = self.last_seq.max(event.seq);
                match event.payload {
                    EventPayload::Status(status) => self.set_status(status),
                    EventPayload::Gpu(gpus) => self.gpus = gpus,
                    EventPayload::Metrics(metrics) => {
                        if self.status.running {
                            self.metrics = Some(metrics);
                        }
                    }
                    EventPayload::LaunchProgress(session) => self.launch = Some(session),
                    EventPayload::Log(line) => {
                        if self.logs.len() == LOG_LINES {
                            self.logs.pop_front();
                        }
                        self.logs.push_back(line);
                    }
                }
            }
        }
        self.updated_at = Some(Utc::now());
        true
    }

    fn set_status(&mut self, status: StatusSnapshot) {
        // Engine metrics outlive their process in the snapshot store
        if !status.running {
            self.metrics = None;
        }
        self.status = status;
    }

    pub fn render(&self, endpoint: &str) -> String {
        let mut out = String::new();
        let updated = self
            .updated_at
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        let _ = writeln!(
            out,
            "{} {}   stream: {}   updated: {}",
            "modelhost".bold(),
            endpoint.dimmed(),
            colorize_status(&self.stream),
            updated
        );

        let _ = writeln!(out, "\n{}", "Engine".bold());
        let _ = writeln!(out, "{}", render_table(std::slice::from_ref(&self.status)));

        let _ = writeln!(out, "\n{}", "GPUs".bold());
        if self.gpus.is_empty() {
            let _ = writeln!(out, "{}", "No GPU telemetry".dimmed());
        } else {
            let _ = writeln!(out, "{}", render_table(&self.gpus));
        }

        if let Some(metrics) = &self.metrics {
            let _ = writeln!(out, "\n{}", "Throughput".bold());
            let _ = writeln!(out, "{}", render_table(std::slice::from_ref(metrics)));
        }

        if let Some(session) = &self.launch {
            let progress = session
                .progress
                .map(|p| format!(" {}", format_percentage(p as f64)))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "\n{} {} {}{} {}",
                "Launch".bold(),
                session.recipe_id,
                colorize_status(session.stage.as_str()),
                progress,
                session.message.dimmed()
            );
        }

        if !self.logs.is_empty() {
            let _ = writeln!(out, "\n{}", "Logs".bold());
            for log in &self.logs {
                let _ = writeln!(out, "  {}", log.line);
            }
        }
        out
    }
}

fn stream_label(state: &StreamState) -> String {
    match state {
        StreamState::Connecting => "connecting".to_string(),
        StreamState::Live => "live".to_string(),
        StreamState::Reconnecting { attempt, delay } => {
            format!("reconnecting (attempt {}, {:.1}s)", attempt, delay.as_secs_f64())
        }
        StreamState::GaveUp => "polling".to_string(),
    }
}

/// Run the dashboard until Ctrl-C
pub async fn watch(client: &ModelhostClient, output_format: OutputFormat) -> Result<()> {
    let mut reconciler = Reconciler::spawn(client.clone(), ReconcilerConfig::default());
    let mut dashboard = Dashboard::default();

    loop {
        let update = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            update = reconciler.recv() => update,
        };
        let Some(update) = update else {
            break;
        };
        if !dashboard.apply(update) {
            continue;
        }

        match output_format {
            OutputFormat::Table | OutputFormat::Text => {
                // Clear screen and move cursor to top
                print!("\x1B[2J\x1B[1;1H{}", dashboard.render(client.endpoint()));
            }
            OutputFormat::Json => println!("{}", serde_json::to_string(&dashboard)?),
            OutputFormat::Yaml => print!("---\n{}", serde_yaml::to_string(&dashboard)?),
        }
    }

    reconciler.shutdown().await;
    Ok(())
}
