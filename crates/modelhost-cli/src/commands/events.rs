//! Raw event tail

use crate::client::ModelhostClient;
use crate::output::{colorize_status, OutputFormat};
use anyhow::Result;
use colored::*;
use modelhost_core::{Event, EventCategory, EventPayload};

/// Print events as they arrive until interrupted, the stream ends or
/// `count` events were printed
pub async fn tail_events(
    client: &ModelhostClient,
    categories: Vec<EventCategory>,
    count: Option<usize>,
    output_format: OutputFormat,
) -> Result<()> {
    let mut stream = client.events().await?;
    let mut printed = 0;

    loop {
        let next = tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            next = stream.next() => next?,
        };
        let Some(event) = next else {
            return Ok(());
        };
        if !categories.is_empty() && !categories.contains(&event.category()) {
            continue;
        }

        print_event(&event, output_format)?;
        printed += 1;
        if count.is_some_and(|count| printed >= count) {
            return Ok(());
        }
    }
}

fn print_event(event: &Event, output_format: OutputFormat) -> Result<()> {
    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string(event)?),
        OutputFormat::Yaml => print!("---\n{}", serde_yaml::to_string(event)?),
        OutputFormat::Table => println!(
            "{} {:>6} {:<15} {}",
            event.timestamp.format("%H:%M:%S%.3f").to_string().dimmed(),
            event.seq,
            event.category().as_str().cyan(),
            summarize(event)
        ),
        OutputFormat::Text => println!(
            "{} {} {} {}",
            event.timestamp.to_rfc3339(),
            event.seq,
            event.category(),
            summarize(event)
        ),
    }
    Ok(())
}

/// One-line description of an event's payload
pub fn summarize(event: &Event) -> String {
    match &event.payload {
        EventPayload::Status(status) => match &status.process {
            Some(p) => format!(
                "{} pid={} {} on port {}",
                colorize_status("running"),
                p.pid,
                p.served_model_name,
                p.port
            ),
            None => colorize_status("idle").to_string(),
        },
        EventPayload::Gpu(gpus) => gpus
            .iter()
            .map(|g| {
                format!(
                    "gpu{} {:.0}% {}/{} MB",
                    g.index, g.utilization_pct, g.memory_used_mb, g.memory_total_mb
                )
            })
            .collect::<Vec<_>>()
            .join(", "),
        EventPayload::Metrics(m) => format!(
            "running={} pending={} gen={:.1} tok/s prompt={:.1} tok/s",
            m.running_requests,
            m.pending_requests,
            m.generation_tokens_per_sec,
            m.prompt_tokens_per_sec
        ),
        EventPayload::LaunchProgress(session) => format!(
            "{} {}: {}",
            session.recipe_id,
            colorize_status(session.stage.as_str()),
            session.message
        ),
        EventPayload::Log(log) => format!("[{}] {}", log.pid, log.line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelhost_core::{GpuSnapshot, LogLine, LogStream, StatusSnapshot};

    #[test]
    fn test_summaries() {
        colored::control::set_override(false);

        let idle = Event::new(1, EventPayload::Status(StatusSnapshot::default()));
        assert_eq!(summarize(&idle), "idle");

        let gpu = Event::new(
            2,
            EventPayload::Gpu(vec![GpuSnapshot {
                index: 0,
                name: "GPU".to_string(),
                memory_used_mb: 1024,
                memory_total_mb: 8192,
                utilization_pct: 12.4,
                temp_c: None,
                power_draw_w: None,
            }]),
        );
        assert_eq!(summarize(&gpu), "gpu0 12% 1024/8192 MB");

        let log = Event::new(
            3,
            EventPayload::Log(LogLine {
                pid: 9,
                stream: LogStream::Stderr,
                line: "INFO started".to_string(),
            }),
        );
        assert_eq!(summarize(&log), "[9] INFO started");
    }
}
