//! Output formatting for CLI

use clap::ValueEnum;
use colored::Colorize;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use stepwise_runner::{Report, ScenarioStatus};
use stepwise_common::StepStatus;

/// Output format
#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Trait for items that can be displayed in a table
pub trait TableDisplay {
    fn headers() -> Vec<&'static str>;
    fn row(&self) -> Vec<String>;
}

fn table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Print a list of items
pub fn print_list<T: Serialize + TableDisplay>(items: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if items.is_empty() {
                println!("No items found.");
                return;
            }
            let mut table = table();
            table.set_header(T::headers());
            for item in items {
                table.add_row(item.row());
            }
            println!("{table}");
        }
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(items).unwrap_or_default());
        }
    }
}

fn step_marker(status: StepStatus) -> String {
    match status {
        StepStatus::Passed => "✓".green().to_string(),
        StepStatus::Failed => "✗".red().to_string(),
        StepStatus::Skipped => "-".dimmed().to_string(),
        StepStatus::Pending => "?".yellow().to_string(),
    }
}

fn scenario_label(status: ScenarioStatus, cancelled: bool) -> String {
    if cancelled {
        return "cancelled".yellow().to_string();
    }
    match status {
        ScenarioStatus::Passed => "passed".green().to_string(),
        ScenarioStatus::Failed => "failed".red().to_string(),
        ScenarioStatus::Pending => "pending".yellow().to_string(),
        ScenarioStatus::Skipped => "skipped".dimmed().to_string(),
    }
}

/// Print a run report
pub fn print_report(report: &Report, format: OutputFormat) {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
        return;
    }

    let title = if report.dry_run { "Check" } else { "Feature" };
    println!("{}: {}", title.bold(), report.feature);
    if let Some(source) = &report.source {
        println!("  {}", source.display().to_string().dimmed());
    }

    for scenario in &report.scenarios {
        println!();
        println!(
            "  {} [{}]",
            scenario.name.bold(),
            scenario_label(scenario.status, scenario.cancelled)
        );
        for outcome in &scenario.outcomes {
            println!("    {} {} {}", step_marker(outcome.status), outcome.keyword, outcome.text);
            if let Some(error) = &outcome.error {
                println!("        {}", error.to_string().red());
            }
        }
    }

    let summary = &report.summary;
    let mut table = table();
    table.set_header(vec!["Scenarios", "Passed", "Failed", "Pending", "Skipped", "Steps", "Duration"]);
    table.add_row(vec![
        summary.scenarios.to_string(),
        summary.passed.to_string(),
        summary.failed.to_string(),
        summary.pending.to_string(),
        summary.skipped.to_string(),
        summary.steps().to_string(),
        format!("{} ms", report.duration_ms),
    ]);
    println!();
    println!("{table}");
}

/// Print success message
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

/// Print error message
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red(), message);
}

/// Print warning message
pub fn print_warning(message: &str) {
    println!("{} {}", "!".yellow(), message);
}
