//! Read-only snapshot commands

use crate::client::ModelhostClient;
use crate::output::{OutputFormat, OutputFormatter};
use anyhow::Result;

pub async fn show_status(client: &ModelhostClient, output_format: OutputFormat) -> Result<()> {
    let formatter = OutputFormatter::new(output_format);
    let status = client.status().await?;
    formatter.print_item(&status)
}

pub async fn list_gpus(client: &ModelhostClient, output_format: OutputFormat) -> Result<()> {
    let formatter = OutputFormatter::new(output_format);
    let gpus = client.gpus().await?;
    formatter.print_list(&gpus)
}

pub async fn list_recipes(client: &ModelhostClient, output_format: OutputFormat) -> Result<()> {
    let formatter = OutputFormatter::new(output_format);
    let recipes = client.recipes().await?;
    formatter.print_list(&recipes)
}

/// Current engine metrics, or the peak/lifetime aggregates
pub async fn show_metrics(
    client: &ModelhostClient,
    peak: bool,
    lifetime: bool,
    output_format: OutputFormat,
) -> Result<()> {
    let formatter = OutputFormatter::new(output_format);

    if peak {
        return formatter.print_item(&client.peak_metrics().await?);
    }
    if lifetime {
        return formatter.print_item(&client.lifetime_metrics().await?);
    }

    match client.metrics().await? {
        Some(metrics) => formatter.print_item(&metrics),
        None if output_format.is_interactive() => formatter.print_info("No engine running"),
        None => formatter.print_value(&serde_json::Value::Null),
    }
}
