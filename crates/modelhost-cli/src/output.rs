//! Output formatting for the modelhost CLI

use anyhow::Result;
use clap::ValueEnum;
use colored::*;
use comfy_table::{presets::UTF8_FULL, Attribute, Cell, Color, ContentArrangement, Table};
use modelhost_core::{
    GpuSnapshot, LaunchSession, LifetimeMetrics, MetricsSnapshot, PeakMetrics, Recipe,
    StatusSnapshot,
};
use serde::Serialize;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
    /// YAML format
    Yaml,
    /// Compact text format
    Text,
}

impl OutputFormat {
    /// Whether output is meant for a terminal rather than a program
    pub fn is_interactive(&self) -> bool {
        matches!(self, OutputFormat::Table | OutputFormat::Text)
    }
}

/// A value with a table shape: one row per item, or labelled fields for one item
pub trait Formattable: Sized {
    const COLUMNS: &'static [&'static str];

    fn row(&self) -> Vec<String>;

    /// Labelled fields; extra detail that does not fit a table row goes here
    fn fields(&self) -> Vec<(String, String)> {
        labelled(self)
    }
}

/// Columns paired with the item's row
fn labelled<T: Formattable>(item: &T) -> Vec<(String, String)> {
    T::COLUMNS.iter().map(|c| c.to_string()).zip(item.row()).collect()
}

/// Output formatter
pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// One item: labelled fields on a terminal, the whole value otherwise
    pub fn print_item<T>(&self, item: &T) -> Result<()>
    where
        T: Serialize + Formattable,
    {
        if self.format.is_interactive() {
            self.print_fields(item);
            Ok(())
        } else {
            self.print_value(item)
        }
    }

    /// Many items: a table, blank-line separated fields in text mode, or
    /// the serialized list
    pub fn print_list<T>(&self, items: &[T]) -> Result<()>
    where
        T: Serialize + Formattable,
    {
        match self.format {
            OutputFormat::Json | OutputFormat::Yaml => return self.print_value(items),
            _ if items.is_empty() => println!("{}", "Nothing to show".dimmed()),
            OutputFormat::Table => println!("{}", render_table(items)),
            OutputFormat::Text => {
                let mut first = true;
                for item in items {
                    if !std::mem::take(&mut first) {
                        println!();
                    }
                    self.print_fields(item);
                }
            }
        }
        Ok(())
    }

    fn print_fields<T: Formattable>(&self, item: &T) {
        let fields = item.fields();
        let width = fields.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
        for (key, value) in fields {
            let key = format!("{:width$}", key, width = width);
            if self.format == OutputFormat::Table {
                println!("{}  {}", key.bold().cyan(), value);
            } else {
                println!("{}  {}", key, value);
            }
        }
    }

    /// Print any serializable value; interactive formats fall back to JSON
    pub fn print_value<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        match self.format {
            OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
            _ => println!("{}", serde_json::to_string_pretty(value)?),
        }
        Ok(())
    }

    pub fn print_success(&self, message: &str) -> Result<()> {
        self.print_message("success", message, |m| {
            println!("{} {}", "✓".green().bold(), m.green())
        })
    }

    pub fn print_error(&self, message: &str) -> Result<()> {
        self.print_message("error", message, |m| {
            eprintln!("{} {}", "✗".red().bold(), m.red())
        })
    }

    pub fn print_warning(&self, message: &str) -> Result<()> {
        self.print_message("warning", message, |m| {
            eprintln!("{} {}", "⚠".yellow().bold(), m.yellow())
        })
    }

    pub fn print_info(&self, message: &str) -> Result<()> {
        self.print_message("info", message, |m| {
            println!("{} {}", "ℹ".blue().bold(), m.blue())
        })
    }

    fn print_message(&self, status: &str, message: &str, styled: impl Fn(&str)) -> Result<()> {
        match self.format {
            OutputFormat::Json => {
                let result = serde_json::json!({ "status": status, "message": message });
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            OutputFormat::Yaml => {
                println!("status: {}", status);
                println!("message: {}", message);
            }
            OutputFormat::Table | OutputFormat::Text => styled(message),
        }
        Ok(())
    }

    /// Print ordered name/value statistics
    pub fn print_stats(&self, stats: &[(String, String)]) -> Result<()> {
        match self.format {
            OutputFormat::Json | OutputFormat::Yaml => {
                let map: serde_json::Map<String, serde_json::Value> = stats
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                    .collect();
                self.print_value(&map)?;
            }
            OutputFormat::Table => {
                let mut table = styled_table(&["Metric", "Value"]);
                for (key, value) in stats {
                    table.add_row(vec![key, value]);
                }
                println!("{}", table);
            }
            OutputFormat::Text => {
                for (key, value) in stats {
                    println!("{}: {}", key, value);
                }
            }
        }
        Ok(())
    }

    /// Print a progress message (only for interactive formats)
    pub fn print_progress(&self, message: &str) {
        if self.format.is_interactive() {
            eprint!("{} {}...\r", "⏳".yellow(), message);
        }
    }

    pub fn clear_progress(&self) {
        if self.format.is_interactive() {
            eprint!("\r{}\r", " ".repeat(80));
        }
    }
}

fn styled_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(
        headers
            .iter()
            .map(|h| Cell::new(h).add_attribute(Attribute::Bold).fg(Color::Cyan))
            .collect::<Vec<_>>(),
    );
    table
}

/// Render items as a table
pub fn render_table<T: Formattable>(items: &[T]) -> Table {
    let mut table = styled_table(T::COLUMNS);
    for item in items {
        table.add_row(item.row());
    }
    table
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

fn opt_f64(value: Option<f64>, suffix: &str) -> String {
    value
        .map(|v| format!("{:.1}{}", v, suffix))
        .unwrap_or_else(|| "-".to_string())
}

impl Formattable for Recipe {
    const COLUMNS: &'static [&'static str] = &["ID", "Name", "Backend", "Port", "Model"];

    fn row(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.name.clone(),
            self.backend.to_string(),
            opt(self.port),
            self.model_path.clone(),
        ]
    }

    fn fields(&self) -> Vec<(String, String)> {
        let mut pairs = labelled(self);
        pairs.extend([
            ("Served As".to_string(), self.served_model_name().to_string()),
            ("Tensor Parallel".to_string(), opt(self.tensor_parallel_size)),
            ("Max Model Len".to_string(), opt(self.max_model_len)),
        ]);
        pairs
    }
}

impl Formattable for GpuSnapshot {
    const COLUMNS: &'static [&'static str] =
        &["GPU", "Name", "Memory", "Util", "Temp", "Power"];

    fn row(&self) -> Vec<String> {
        vec![
            self.index.to_string(),
            self.name.clone(),
            format!(
                "{} / {} ({:.0}%)",
                format_mib(self.memory_used_mb),
                format_mib(self.memory_total_mb),
                self.memory_used_pct()
            ),
            format!("{:.0}%", self.utilization_pct),
            opt_f64(self.temp_c, "°C"),
            opt_f64(self.power_draw_w, " W"),
        ]
    }
}

impl Formattable for StatusSnapshot {
    const COLUMNS: &'static [&'static str] =
        &["State", "PID", "Backend", "Model", "Port", "Uptime"];

    fn row(&self) -> Vec<String> {
        match &self.process {
            Some(p) => {
                let uptime = (chrono::Utc::now() - p.started_at).num_seconds().max(0) as u64;
                vec![
                    "running".to_string(),
                    p.pid.to_string(),
                    p.backend.to_string(),
                    p.served_model_name.clone(),
                    p.port.to_string(),
                    format_duration(uptime),
                ]
            }
            None => {
                let mut row = vec!["idle".to_string()];
                row.extend(std::iter::repeat("-".to_string()).take(5));
                row
            }
        }
    }

    fn fields(&self) -> Vec<(String, String)> {
        let mut pairs = labelled(self);
        if let Some(p) = &self.process {
            pairs.push(("Model Path".to_string(), p.model_path.clone()));
            pairs.push(("Recipe".to_string(), opt(p.recipe_id.as_ref())));
        }
        pairs
    }
}

impl Formattable for LaunchSession {
    const COLUMNS: &'static [&'static str] =
        &["Session", "Recipe", "Stage", "Progress", "Message"];

    fn row(&self) -> Vec<String> {
        vec![
            self.id.to_string(),
            self.recipe_id.to_string(),
            self.stage.to_string(),
            self.progress
                .map(|p| format_percentage(p as f64))
                .unwrap_or_else(|| "-".to_string()),
            self.message.clone(),
        ]
    }

    fn fields(&self) -> Vec<(String, String)> {
        let mut pairs = labelled(self);
        pairs.push(("Started".to_string(), self.started_at.to_rfc3339()));
        pairs.push(("Updated".to_string(), self.updated_at.to_rfc3339()));
        pairs
    }
}

impl Formattable for MetricsSnapshot {
    const COLUMNS: &'static [&'static str] = &[
        "Running",
        "Pending",
        "Prompt tok/s",
        "Gen tok/s",
        "KV cache",
        "TTFT",
    ];

    fn row(&self) -> Vec<String> {
        vec![
            self.running_requests.to_string(),
            self.pending_requests.to_string(),
            format!("{:.1}", self.prompt_tokens_per_sec),
            format!("{:.1}", self.generation_tokens_per_sec),
            opt_f64(self.kv_cache_usage_pct, "%"),
            opt_f64(self.ttft_ms, " ms"),
        ]
    }

    fn fields(&self) -> Vec<(String, String)> {
        let mut pairs = labelled(self);
        pairs.push((
            "Prompt tokens".to_string(),
            self.prompt_tokens_total.to_string(),
        ));
        pairs.push((
            "Generation tokens".to_string(),
            self.generation_tokens_total.to_string(),
        ));
        pairs
    }
}

impl Formattable for PeakMetrics {
    const COLUMNS: &'static [&'static str] = &["Gen tok/s", "Prompt tok/s", "Running", "Best TTFT"];

    fn row(&self) -> Vec<String> {
        vec![
            format!("{:.1}", self.generation_tokens_per_sec),
            format!("{:.1}", self.prompt_tokens_per_sec),
            self.running_requests.to_string(),
            opt_f64(self.min_ttft_ms, " ms"),
        ]
    }
}

impl Formattable for LifetimeMetrics {
    const COLUMNS: &'static [&'static str] = &[
        "Prompt tokens",
        "Generation tokens",
        "Launches",
        "Engine uptime",
        "Since",
    ];

    fn row(&self) -> Vec<String> {
        vec![
            self.prompt_tokens.to_string(),
            self.generation_tokens.to_string(),
            self.launches.to_string(),
            format_duration(self.uptime_secs),
            self.since.to_rfc3339(),
        ]
    }
}

/// Compact uptime: the two most significant units
pub fn format_duration(seconds: u64) -> String {
    let (d, h, m, s) = (seconds / 86_400, seconds / 3_600 % 24, seconds / 60 % 60, seconds % 60);
    match (d, h, m) {
        (0, 0, 0) => format!("{}s", s),
        (0, 0, _) => format!("{}m {}s", m, s),
        (0, _, _) => format!("{}h {}m", h, m),
        _ => format!("{}d {}h", d, h),
    }
}

/// GPU memory as nvidia-smi reports it (MiB), scaled to GiB from 1024 MiB up
pub fn format_mib(mib: u64) -> String {
    if mib < 1024 {
        format!("{} MiB", mib)
    } else {
        format!("{:.1} GiB", mib as f64 / 1024.0)
    }
}

/// Format a 0-1 fraction as a percentage
pub fn format_percentage(value: f64) -> String {
    format!("{:.1}%", value * 100.0)
}

pub fn colorize_status(status: &str) -> ColoredString {
    match status.to_lowercase().as_str() {
        "ready" | "running" | "live" | "ok" => status.green(),
        "error" | "offline" => status.red(),
        "preempting" | "evicting" | "launching" | "waiting" | "polling" | "reconnecting" => {
            status.yellow()
        }
        "idle" | "cancelled" => status.dimmed(),
        _ => status.normal(),
    }
}
