//! Output formatting for CLI commands.

use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON format.
    Json,
}

/// Print rows in the specified format.
pub fn print_output<T: Serialize + Tabled>(data: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("{}", "No items found.".dimmed());
            } else {
                println!("{}", Table::new(data));
            }
        }
        OutputFormat::Json => println!("{}", format_json(data, "[]")),
    }
}

/// Print a success message, or the given value as JSON.
pub fn print_result<T: Serialize>(message: &str, value: &T, format: OutputFormat) {
    match format {
        OutputFormat::Table => print_success(message),
        OutputFormat::Json => println!("{}", format_json(value, "{}")),
    }
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "Info:".blue().bold(), message);
}

fn format_json<T: Serialize + ?Sized>(data: &T, fallback: &str) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|_| fallback.to_string())
}
