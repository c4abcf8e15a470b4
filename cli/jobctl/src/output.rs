//! Output formatting for CLI commands.

use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON format.
    Json,
}

/// Print data in the specified format.
pub fn print_output<T: Serialize + Tabled>(data: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("{}", "No items found.".dimmed());
            } else {
                let table = Table::new(data).to_string();
                println!("{}", table);
            }
        }
        OutputFormat::Json => println!("{}", format_json(data, "[]")),
    }
}

/// Print a single item in the specified format.
pub fn print_single<T: Serialize>(data: &T, _format: OutputFormat) {
    println!("{}", format_json(data, "{}"));
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "Info:".blue().bold(), message);
}

#[derive(Debug, Serialize)]
pub struct ReceiptNextStep {
    pub label: &'static str,
    pub cmd: String,
}

/// What the CLI reports after the server accepted a mutation.
pub struct Receipt<'a> {
    pub message: String,
    /// `accepted` while the job runs, or the job's terminal status.
    pub status: &'a str,
    pub kind: &'a str,
    pub job_id: String,
    pub resource: Option<serde_json::Value>,
    pub next: &'a [ReceiptNextStep],
}

pub fn receipt_value(receipt: &Receipt<'_>) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    out.insert("kind".to_string(), serde_json::json!(receipt.kind));
    out.insert("status".to_string(), serde_json::json!(receipt.status));
    out.insert("job_id".to_string(), serde_json::json!(receipt.job_id));
    out.insert(
        "next".to_string(),
        serde_json::to_value(receipt.next).unwrap_or_else(|_| serde_json::json!([])),
    );
    if let Some(resource) = &receipt.resource {
        out.insert("resource".to_string(), resource.clone());
    }
    serde_json::json!({ "receipt": out })
}

pub fn print_receipt(format: OutputFormat, receipt: Receipt<'_>) {
    match format {
        OutputFormat::Table => {
            print_success(&receipt.message);
            for step in receipt.next {
                print_info(&format!("{}: {}", step.label, step.cmd));
            }
        }
        OutputFormat::Json => print_single(&receipt_value(&receipt), OutputFormat::Json),
    }
}

fn format_json<T: Serialize + ?Sized>(data: &T, fallback: &str) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|_| fallback.to_string())
}

/// Truncate long text for table cells.
pub fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut out: String = text.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
