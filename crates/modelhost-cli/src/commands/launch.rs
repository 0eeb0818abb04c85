//! Launch control commands

use crate::client::ModelhostClient;
use crate::output::{colorize_status, format_percentage, OutputFormat, OutputFormatter};
use anyhow::{bail, Result};
use modelhost_core::{Event, EventPayload, LaunchSession, LaunchStage, RecipeId, SessionId};
use std::time::Duration;
use tracing::debug;

/// Start a launch, optionally following it to a terminal stage
pub async fn launch(
    client: &ModelhostClient,
    recipe: String,
    follow: bool,
    output_format: OutputFormat,
) -> Result<()> {
    let formatter = OutputFormatter::new(output_format);
    let recipe = RecipeId::new(recipe);

    if !follow {
        let session = client.launch(&recipe).await?;
        return formatter.print_item(&session);
    }

    // Subscribe first so no transition slips between the request and the stream
    let mut stream = client.events().await?;
    let session = client.launch(&recipe).await?;
    print_stage(&formatter, &session)?;

    let mut last_stage = session.stage;
    while let Some(event) = stream.next().await? {
        let Some(update) = session_update(&event, &session.id) else {
            continue;
        };
        if update.stage == last_stage {
            continue;
        }
        last_stage = update.stage;
        print_stage(&formatter, update)?;

        match update.stage {
            LaunchStage::Ready => return Ok(()),
            LaunchStage::Error => bail!("Launch of {} failed: {}", recipe, update.message),
            LaunchStage::Cancelled => bail!("Launch of {} was cancelled: {}", recipe, update.message),
            _ => {}
        }
    }

    bail!("Event stream closed before the launch of {} finished", recipe)
}

/// The launch progress for `id` carried by `event`, if any
fn session_update<'a>(event: &'a Event, id: &SessionId) -> Option<&'a LaunchSession> {
    match &event.payload {
        EventPayload::LaunchProgress(session) if &session.id == id => Some(session),
        _ => None,
    }
}

fn print_stage(formatter: &OutputFormatter, session: &LaunchSession) -> Result<()> {
    match formatter.format() {
        OutputFormat::Json => println!("{}", serde_json::to_string(session)?),
        OutputFormat::Yaml => print!("---\n{}", serde_yaml::to_string(session)?),
        OutputFormat::Table | OutputFormat::Text => {
            let progress = session
                .progress
                .map(|p| format_percentage(p as f64))
                .unwrap_or_default();
            println!(
                "[{:>10}] {:>6} {}",
                colorize_status(session.stage.as_str()),
                progress,
                session.message
            );
        }
    }
    Ok(())
}

/// Cancel the named launch, or whatever launch is in flight
pub async fn cancel(
    client: &ModelhostClient,
    recipe: Option<String>,
    output_format: OutputFormat,
) -> Result<()> {
    let formatter = OutputFormatter::new(output_format);

    let recipe = match recipe {
        Some(recipe) => RecipeId::new(recipe),
        None => match client.current_launch().await? {
            Some(session) if !session.is_terminal() => session.recipe_id,
            _ => return formatter.print_info("No launch in progress"),
        },
    };

    debug!("Cancelling launch of {}", recipe);
    if client.cancel(&recipe).await? {
        formatter.print_success(&format!("Cancelled launch of {}", recipe))
    } else {
        formatter.print_warning(&format!("No in-flight launch of {} to cancel", recipe))
    }
}

pub async fn evict(client: &ModelhostClient, output_format: OutputFormat) -> Result<()> {
    let formatter = OutputFormatter::new(output_format);
    if client.evict().await? {
        formatter.print_success("Engine stopped")
    } else {
        formatter.print_info("No engine was running")
    }
}

/// Block until the engine is healthy; fails when it is not
pub async fn wait_ready(
    client: &ModelhostClient,
    timeout: Option<u64>,
    output_format: OutputFormat,
) -> Result<()> {
    let formatter = OutputFormatter::new(output_format);
    formatter.print_progress("Waiting for the engine");
    let result = client.wait_ready(timeout.map(Duration::from_secs)).await;
    formatter.clear_progress();

    let result = result?;
    if result.ready {
        return formatter.print_success("Engine is ready");
    }
    bail!(
        "Engine not ready: {}",
        result.reason.as_deref().unwrap_or("unknown reason")
    )
}
