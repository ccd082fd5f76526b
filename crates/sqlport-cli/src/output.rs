//! Output formatting for CLI
//!
//! Provides consistent output formatting across all commands:
//! - Human-readable default output
//! - JSON output (--json flag)
//! - Quiet mode for scripting (--quiet flag)

use sqlport_core::{ChangeEvent, Notification, Row, Value};

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Human-readable output (default)
    Human,
    /// JSON output
    Json,
    /// Quiet mode - minimal output
    Quiet,
}

impl OutputFormat {
    /// Create format from CLI flags
    pub fn from_flags(json: bool, quiet: bool) -> Self {
        if quiet {
            OutputFormat::Quiet
        } else if json {
            OutputFormat::Json
        } else {
            OutputFormat::Human
        }
    }
}

/// Output helper for consistent formatting
pub struct Output {
    /// The output format
    pub format: OutputFormat,
}

impl Output {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Check if output is JSON
    pub fn is_json(&self) -> bool {
        matches!(self.format, OutputFormat::Json)
    }

    /// Print the column header before the first row
    pub fn print_header(&self, row: &Row) {
        if self.format == OutputFormat::Human {
            println!("{}", row.columns().join(" | "));
            println!("{}", "-".repeat(row.columns().join(" | ").len().max(3)));
        }
    }

    /// Print one result row as it arrives
    ///
    /// JSON output is not printed here; see [`Output::print_rows_json`].
    pub fn print_row(&self, row: &Row) {
        match self.format {
            OutputFormat::Human => {
                let cells: Vec<String> = row.values().iter().map(render_cell).collect();
                println!("{}", cells.join(" | "));
            }
            OutputFormat::Quiet => {
                if let Some(first) = row.get_index(0) {
                    println!("{}", render_cell(first));
                }
            }
            OutputFormat::Json => {}
        }
    }

    /// Print collected rows as a JSON array
    pub fn print_rows_json(&self, rows: &[serde_json::Value]) {
        println!(
            "{}",
            serde_json::to_string_pretty(rows).unwrap_or_else(|_| "[]".to_string())
        );
    }

    /// Print the row count footer
    pub fn print_row_count(&self, count: usize) {
        if self.format == OutputFormat::Human {
            if count == 0 {
                println!("No rows.");
            } else {
                println!("\n{} row(s)", count);
            }
        }
    }

    /// Print a change notification
    pub fn print_notification(&self, notification: &Notification) {
        match (self.format, notification) {
            (OutputFormat::Human, Notification::Change(event)) => {
                println!("{}", describe_change(event));
            }
            (OutputFormat::Human, Notification::Reset) => println!("reset"),
            (OutputFormat::Json, Notification::Change(event)) => {
                println!(
                    "{}",
                    serde_json::json!({
                        "type": "change",
                        "change_kind": event.change_kind,
                        "code": event.change_kind.code(),
                        "database_name": event.database_name,
                        "table_name": event.table_name,
                        "row_id": event.row_id
                    })
                );
            }
            (OutputFormat::Json, Notification::Reset) => {
                println!("{}", serde_json::json!({"type": "reset"}));
            }
            (OutputFormat::Quiet, Notification::Change(event)) => println!("{}", event.row_id),
            (OutputFormat::Quiet, Notification::Reset) => {}
        }
    }

    /// Print a success message
    pub fn success(&self, message: &str) {
        match self.format {
            OutputFormat::Human => println!("✓ {}", message),
            OutputFormat::Json => {
                println!(
                    "{}",
                    serde_json::json!({"status": "success", "message": message})
                );
            }
            OutputFormat::Quiet => {}
        }
    }

    /// Check if we should prompt for confirmation
    pub fn should_prompt(&self) -> bool {
        self.format == OutputFormat::Human
    }
}

/// Render one cell for human output
fn render_cell(value: &Value) -> String {
    match value {
        Value::Text(text) => truncate(text, 40),
        other => other.to_string(),
    }
}

fn describe_change(event: &ChangeEvent) -> String {
    let kind = match event.change_kind {
        sqlport_core::ChangeKind::Insert => "insert",
        sqlport_core::ChangeKind::Update => "update",
        sqlport_core::ChangeKind::Delete => "delete",
    };
    format!(
        "{:<6} {}.{} rowid={}",
        kind,
        event.database_name.as_deref().unwrap_or("?"),
        event.table_name.as_deref().unwrap_or("?"),
        event.row_id
    )
}

/// Truncate a string to max length, adding "..." if truncated
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len - 3).collect();
        format!("{}...", kept)
    }
}
