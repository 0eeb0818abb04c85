//! Event bus statistics

use crate::client::ModelhostClient;
use crate::output::{OutputFormat, OutputFormatter};
use anyhow::Result;
use std::time::Duration;

/// Show `GET /events/stats`, optionally refreshing every `refresh` seconds
pub async fn show_stats(
    client: &ModelhostClient,
    refresh: Option<u64>,
    output_format: OutputFormat,
) -> Result<()> {
    let formatter = OutputFormatter::new(output_format);

    loop {
        formatter.print_progress("Fetching event bus statistics");
        let stats = client.event_stats().await;
        formatter.clear_progress();
        let stats = stats?;

        formatter.print_stats(&[
            ("Subscribers".to_string(), stats.subscribers.to_string()),
            ("Published".to_string(), stats.published.to_string()),
            ("Dropped".to_string(), stats.dropped.to_string()),
            (
                "Snapshot categories".to_string(),
                stats.snapshot_categories.join(", "),
            ),
        ])?;

        let Some(interval) = refresh else {
            return Ok(());
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            _ = tokio::time::sleep(Duration::from_secs(interval)) => {}
        }
        if output_format.is_interactive() {
            // Clear screen and move cursor to top
            print!("\x1B[2J\x1B[1;1H");
        }
    }
}
