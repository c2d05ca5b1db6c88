//! comfy-table helpers for artifact listings.

use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use console::style;

use crate::worker::spec::validate::{ArtifactSet, ValidationReport};

/// Render tickets as a table.
pub fn tickets_table(set: &ArtifactSet) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["ID", "Title", "Status", "Blocked by", "Blocks"]);
    for ticket in &set.tickets {
        table.add_row(vec![
            ticket.id.clone(),
            ticket.title.clone(),
            format!("{:?}", ticket.status),
            ticket.dependencies.blocked_by.join(", "),
            ticket.dependencies.blocks.join(", "),
        ]);
    }
    table
}

/// Render tasks as a table.
pub fn tasks_table(set: &ArtifactSet) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["ID", "Title", "Status", "Requirements", "Blocked by"]);
    for task in &set.tasks {
        table.add_row(vec![
            task.id.clone(),
            task.title.clone(),
            format!("{:?}", task.status),
            task.requirements.join(", "),
            task.dependencies.blocked_by.join(", "),
        ]);
    }
    table
}

/// Render the dependency graph as indented text edges.
pub fn graph_lines(set: &ArtifactSet) -> Vec<String> {
    let mut lines = Vec::new();
    for ticket in &set.tickets {
        lines.push(ticket.id.clone());
        for dep in &ticket.dependencies.blocked_by {
            lines.push(format!("  <- blocked by {dep}"));
        }
    }
    for task in &set.tasks {
        lines.push(task.id.clone());
        for dep in &task.dependencies.blocked_by {
            lines.push(format!("  <- blocked by {dep}"));
        }
    }
    lines
}

/// Render a validation report with colored severity markers.
pub fn render_report(report: &ValidationReport) -> String {
    let mut out = String::new();
    for error in &report.errors {
        out.push_str(&format!("{} {}\n", style("error:").red().bold(), error.message));
    }
    for warning in &report.warnings {
        out.push_str(&format!(
            "{} {}\n",
            style("warning:").yellow().bold(),
            warning.message
        ));
    }
    if report.is_valid() {
        out.push_str(&format!("{}\n", style("all invariants hold").green()));
    }
    out
}
