//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::collections::BTreeMap;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::ValidationResult;
use crate::engine::{RunResult, RunStatus};
use crate::graph::{ResolvedOrder, ResourceRegistry};
use crate::planner::{OperationType, Plan};
use crate::state::{ResourceStatus, StackState};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan operation row for table display.
#[derive(Tabled)]
struct PlanRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Operation")]
    operation: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Resource outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Operation")]
    operation: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Error")]
    error: String,
}

/// Graph row for table display.
#[derive(Tabled)]
struct GraphRow {
    #[tabled(rename = "Tier")]
    tier: usize,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Depends on")]
    depends_on: String,
}

/// State resource row for table display.
#[derive(Tabled)]
struct StateRow {
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "ID")]
    id: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&PlanJson::from(plan)).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!(
                "{} No changes required - resources match the stack.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = write!(output, "\nPlan\n");
        let _ = write!(
            output,
            "   Declarations hash: {}\n\n",
            Self::truncate(&plan.config_hash, 8)
        );

        let rows: Vec<PlanRow> = plan
            .operations
            .iter()
            .enumerate()
            .filter(|(_, op)| op.operation != OperationType::NoOp)
            .map(|(i, op)| PlanRow {
                index: i + 1,
                operation: Self::format_operation(op.operation, op.replace),
                resource: op.resource_name.clone(),
                kind: op.kind.clone(),
                reason: Self::truncate(&op.reason, 48),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for op in plan.operations.iter().filter(|op| !op.details.is_empty()) {
                let _ = writeln!(output, "\n  {}:", op.resource_name.bold());
                for detail in &op.details {
                    let old = detail
                        .old_value
                        .as_ref()
                        .map_or_else(|| String::from("(none)"), ToString::to_string);
                    let new = match (&detail.new_value, detail.known) {
                        (_, false) => String::from("(known after apply)"),
                        (Some(value), true) => value.to_string(),
                        (None, true) => String::from("(removed)"),
                    };
                    let _ = writeln!(output, "    {}: {} -> {}", detail.field, old.red(), new.green());
                }
            }
        }

        let summary = plan.summary();
        let _ = write!(
            output,
            "\nPlan: {} to create, {} to update, {} to delete, {} unchanged\n",
            summary.creates.to_string().green(),
            summary.updates.to_string().yellow(),
            summary.deletes.to_string().red(),
            summary.unchanged
        );

        output
    }

    /// Formats the result of an apply or destroy run.
    #[must_use]
    pub fn format_run(&self, result: &RunResult) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(&RunJson::from(result)).unwrap_or_default(),
            OutputFormat::Text => {
                let status = match result.status {
                    RunStatus::Succeeded => format!("{} {} succeeded", "✓".green(), result.mode),
                    RunStatus::PartialFailure => {
                        format!("{} {} finished with failures", "✗".red(), result.mode)
                    }
                    RunStatus::Aborted => format!("{} {} aborted", "⚠".yellow(), result.mode),
                };

                let mut output = format!("{status}\n\n");
                let rows: Vec<OutcomeRow> = result
                    .resources
                    .iter()
                    .map(|(name, outcome)| OutcomeRow {
                        resource: name.clone(),
                        operation: Self::format_operation(outcome.operation, false),
                        status: Self::format_status(outcome.status),
                        error: outcome
                            .error
                            .as_deref()
                            .map(|e| Self::truncate(e, 60))
                            .unwrap_or_default(),
                    })
                    .collect();
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');

                let _ = writeln!(output, "\n   Provider calls: {}", result.executed.len());
                if !result.exported_outputs.is_empty() {
                    output.push_str("\nOutputs:\n");
                    for (name, value) in &result.exported_outputs {
                        let _ = writeln!(output, "   {name} = {}", Self::format_value(value));
                    }
                }

                output
            }
        }
    }

    /// Formats the resource graph.
    #[must_use]
    pub fn format_graph(&self, registry: &ResourceRegistry, order: &ResolvedOrder) -> String {
        let rows: Vec<GraphRow> = order
            .tiers
            .iter()
            .enumerate()
            .flat_map(|(tier, names)| names.iter().map(move |name| (tier, name)))
            .map(|(tier, name)| GraphRow {
                tier,
                resource: name.clone(),
                kind: registry.get(name).map(|s| s.kind.clone()).unwrap_or_default(),
                depends_on: order
                    .dependencies
                    .get(name)
                    .map(|deps| deps.iter().cloned().collect::<Vec<_>>().join(", "))
                    .unwrap_or_default(),
            })
            .collect();

        match self.format {
            OutputFormat::Json => {
                let json: Vec<serde_json::Value> = rows
                    .iter()
                    .map(|row| {
                        serde_json::json!({
                            "tier": row.tier,
                            "resource": row.resource,
                            "kind": row.kind,
                            "depends_on": order.dependencies.get(&row.resource),
                        })
                    })
                    .collect();
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = format!(
                    "\nResource graph ({} resources, {} tiers)\n\n",
                    registry.len(),
                    order.tiers.len()
                );
                output.push_str(&Table::new(rows).to_string());
                output.push('\n');
                output
            }
        }
    }

    /// Formats stack state.
    #[must_use]
    pub fn format_state(&self, state: &StackState) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                let mut output = String::new();

                let _ = write!(output, "\nState: {}\n\n", state.stack);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);
                let _ = writeln!(output, "   Resources: {}\n", state.resources.len());

                if !state.resources.is_empty() {
                    let rows: Vec<StateRow> = state
                        .resources
                        .values()
                        .map(|r| StateRow {
                            resource: r.name.clone(),
                            kind: r.kind.clone(),
                            status: Self::format_status(r.status),
                            id: r
                                .external_id
                                .as_deref()
                                .map(|id| Self::truncate(id, 24))
                                .unwrap_or_default(),
                        })
                        .collect();
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats exported outputs.
    #[must_use]
    pub fn format_outputs(&self, outputs: &BTreeMap<String, serde_json::Value>) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(outputs).unwrap_or_default(),
            OutputFormat::Text => {
                if outputs.is_empty() {
                    return String::from("No outputs recorded.\n");
                }
                let mut output = String::new();
                for (name, value) in outputs {
                    let _ = writeln!(output, "{name} = {}", Self::format_value(value));
                }
                output
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::json!({
                "valid": result.is_valid(),
                "errors": result
                    .errors
                    .iter()
                    .map(|e| serde_json::json!({"field": e.field, "message": e.message}))
                    .collect::<Vec<_>>(),
                "warnings": result.warnings,
            })
            .to_string(),
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Stack file is valid\n", "✓".green())
                } else {
                    format!(
                        "{} Stack file has {} error(s):\n",
                        "✗".red(),
                        result.error_count()
                    )
                };
                for error in &result.errors {
                    let _ = writeln!(output, "   - {}: {}", error.field, error.message);
                }
                if show_warnings && !result.warnings.is_empty() {
                    let _ = write!(output, "\n{} Warnings:\n", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats an operation type with color.
    fn format_operation(operation: OperationType, replace: bool) -> String {
        match operation {
            OperationType::Create => "+create".green().to_string(),
            OperationType::Update if replace => "-/+replace".yellow().to_string(),
            OperationType::Update => "~update".yellow().to_string(),
            OperationType::Delete => "-delete".red().to_string(),
            OperationType::NoOp => "noop".dimmed().to_string(),
        }
    }

    /// Formats a resource status with color.
    fn format_status(status: ResourceStatus) -> String {
        match status {
            ResourceStatus::Ready => "ready".green().to_string(),
            ResourceStatus::Deleted => "deleted".green().to_string(),
            ResourceStatus::Failed => "failed".red().to_string(),
            ResourceStatus::Blocked => "blocked".red().to_string(),
            ResourceStatus::Pending => "pending".dimmed().to_string(),
            other => other.to_string().yellow().to_string(),
        }
    }

    fn format_value(value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Truncates a string to a maximum number of characters.
    fn truncate(s: &str, max_len: usize) -> String {
        if s.chars().count() <= max_len {
            s.to_string()
        } else {
            let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
            format!("{kept}...")
        }
    }
}

// JSON serialization helpers

#[derive(serde::Serialize)]
struct PlanJson {
    config_hash: String,
    creates: usize,
    updates: usize,
    deletes: usize,
    unchanged: usize,
    operations: Vec<OperationJson>,
}

#[derive(serde::Serialize)]
struct OperationJson {
    operation: OperationType,
    resource: String,
    kind: String,
    reason: String,
    replace: bool,
    depends_on: Vec<usize>,
}

impl From<&Plan> for PlanJson {
    fn from(plan: &Plan) -> Self {
        let summary = plan.summary();
        Self {
            config_hash: plan.config_hash.clone(),
            creates: summary.creates,
            updates: summary.updates,
            deletes: summary.deletes,
            unchanged: summary.unchanged,
            operations: plan
                .operations
                .iter()
                .map(|op| OperationJson {
                    operation: op.operation,
                    resource: op.resource_name.clone(),
                    kind: op.kind.clone(),
                    reason: op.reason.clone(),
                    replace: op.replace,
                    depends_on: op.dependencies.clone(),
                })
                .collect(),
        }
    }
}

#[derive(serde::Serialize)]
struct RunJson<'a> {
    mode: crate::engine::RunMode,
    status: RunStatus,
    resources: BTreeMap<&'a str, OutcomeJson<'a>>,
    outputs: &'a BTreeMap<String, serde_json::Value>,
    provider_calls: usize,
}

#[derive(serde::Serialize)]
struct OutcomeJson<'a> {
    operation: OperationType,
    status: ResourceStatus,
    error: Option<&'a str>,
}

impl<'a> From<&'a RunResult> for RunJson<'a> {
    fn from(result: &'a RunResult) -> Self {
        Self {
            mode: result.mode,
            status: result.status,
            resources: result
                .resources
                .iter()
                .map(|(name, outcome)| {
                    (
                        name.as_str(),
                        OutcomeJson {
                            operation: outcome.operation,
                            status: outcome.status,
                            error: outcome.error.as_deref(),
                        },
                    )
                })
                .collect(),
            outputs: &result.exported_outputs,
            provider_calls: result.executed.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truncate_counts_chars() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("ééééééééééé", 6), "ééé...");
    }

    #[test]
    fn test_empty_plan_text() {
        let formatter = OutputFormatter::new(OutputFormat::Text);
        let output = formatter.format_plan(&Plan::empty("abc"), false);
        assert!(output.contains("No changes required"));
    }

    #[test]
    fn test_outputs_json() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let mut outputs = BTreeMap::new();
        outputs.insert(String::from("endpoint"), json!("https://10.0.0.4:6443"));

        let parsed: serde_json::Value =
            serde_json::from_str(&formatter.format_outputs(&outputs)).unwrap();
        assert_eq!(parsed["endpoint"], "https://10.0.0.4:6443");
    }
}
