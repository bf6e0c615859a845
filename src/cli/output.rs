//! Output formatting for CLI commands.
//!
//! This module provides formatting utilities for displaying
//! information to the user in various formats.

use colored::Colorize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{ConfigHasher, ValidationResult};
use crate::planner::{Action, Change, ExecutionPlan, ResourceOutcome, StepOp};
use crate::reconciler::{DriftReport, ReconciliationResult};
use crate::state::{LockInfo, RunHistoryEntry, StateSnapshot};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    /// Output format.
    format: OutputFormat,
}

/// Plan step row for table display.
#[derive(Tabled)]
struct PlanStepRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Wave")]
    wave: usize,
    #[tabled(rename = "Step")]
    op: String,
    #[tabled(rename = "Resource")]
    address: String,
    #[tabled(rename = "After")]
    after: String,
}

/// Outcome row for table display.
#[derive(Tabled)]
struct OutcomeRow {
    #[tabled(rename = "Resource")]
    address: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

/// State record row for table display.
#[derive(Tabled)]
struct RecordRow {
    #[tabled(rename = "Resource")]
    address: String,
    #[tabled(rename = "Provider")]
    provider: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Deposed")]
    deposed: usize,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns the selected output format.
    #[must_use]
    pub const fn format(&self) -> OutputFormat {
        self.format
    }

    /// Formats an execution plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &ExecutionPlan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(plan).unwrap_or_default(),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &ExecutionPlan, detailed: bool) -> String {
        if plan.is_empty() {
            return format!(
                "{} No changes. Infrastructure matches the declaration.\n",
                "✓".green()
            );
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nExecution plan");
        let _ = writeln!(
            output,
            "   Declaration hash: {}\n",
            ConfigHasher::new().short_hash(&plan.config_hash)
        );

        let rows: Vec<PlanStepRow> = plan
            .steps
            .iter()
            .filter(|s| s.op != StepOp::NoOp)
            .map(|s| PlanStepRow {
                index: s.index,
                wave: s.wave,
                op: Self::format_op(&s.op),
                address: s.address.to_string(),
                after: s
                    .depends_on
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for change in plan.changes.changes.iter().filter(|c| c.is_change()) {
                Self::write_change(&mut output, change);
            }
        }

        let _ = write!(
            output,
            "\nPlan: {} to add, {} to change, {} to destroy\n",
            (plan.changes.count(Action::Create) + plan.changes.count(Action::Replace))
                .to_string()
                .green(),
            plan.changes.count(Action::Update).to_string().yellow(),
            (plan.changes.count(Action::Destroy) + plan.changes.count(Action::Replace))
                .to_string()
                .red()
        );
        output
    }

    fn write_change(output: &mut String, change: &Change) {
        let header = match (change.action, change.replace_order, &change.deposed) {
            (Action::Destroy, _, Some(deposed)) => {
                format!("{} {} (deposed {})", "-".red(), change.address, deposed.id)
            }
            (Action::Replace, Some(order), _) => {
                format!("{} {} ({order})", "-/+".magenta(), change.address)
            }
            (Action::Create, ..) => format!("{} {}", "+".green(), change.address),
            (Action::Update, ..) => format!("{} {}", "~".yellow(), change.address),
            _ => format!("{} {}", "-".red(), change.address),
        };
        let _ = writeln!(output, "\n  {header}");

        for field in &change.field_changes {
            let before = field
                .before
                .as_ref()
                .map_or_else(|| String::from("(none)"), ToString::to_string);
            let after = field
                .after
                .as_ref()
                .map_or_else(|| String::from("(none)"), ToString::to_string);
            let marker = if field.forces_replacement {
                " # forces replacement".red().to_string()
            } else {
                String::new()
            };
            let _ = writeln!(output, "      {}: {before} -> {after}{marker}", field.field);
        }
    }

    /// Formats the result of an apply or destroy run.
    #[must_use]
    pub fn format_result(&self, run: &ReconciliationResult) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(run).unwrap_or_default(),
            OutputFormat::Text => {
                let status = if run.success {
                    format!("{} Apply complete", "✓".green())
                } else {
                    format!("{} Apply finished with errors", "✗".red())
                };

                let rows: Vec<OutcomeRow> = run
                    .result
                    .outcomes
                    .iter()
                    .map(|(address, outcome)| {
                        let (label, detail) = match outcome {
                            ResourceOutcome::Applied => ("applied".green().to_string(), String::new()),
                            ResourceOutcome::Failed { reason } => ("failed".red().to_string(), reason.clone()),
                            ResourceOutcome::Skipped { blocking } => {
                                ("skipped".yellow().to_string(), format!("blocked by {blocking}"))
                            }
                            ResourceOutcome::Cancelled => ("cancelled".dimmed().to_string(), String::new()),
                        };
                        OutcomeRow {
                            address: address.to_string(),
                            outcome: label,
                            detail,
                        }
                    })
                    .collect();

                let mut output = format!("{status}: {}\n\n", run.result);
                if !rows.is_empty() {
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }
                for pending in &run.result.pending_deposed {
                    let _ = writeln!(
                        output,
                        "{} deposed object {} of {} left in place, the next apply destroys it",
                        "⚠".yellow(),
                        pending.id,
                        pending.address
                    );
                }
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report).unwrap_or_default(),
            OutputFormat::Text => {
                if report.is_converged() {
                    format!("{} No drift detected - state is converged.\n", "✓".green())
                } else {
                    format!("{} Drift detected:\n\n{report}\n", "⚠".yellow())
                }
            }
        }
    }

    /// Formats a validation result.
    #[must_use]
    pub fn format_validation(&self, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "valid": result.is_valid(),
                    "errors": result.errors.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "warnings": result.warnings,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = if result.is_valid() {
                    format!("{} Declaration is valid.\n", "✓".green())
                } else {
                    format!("{} Declaration has {} error(s):\n", "✗".red(), result.error_count())
                };
                for issue in &result.errors {
                    let _ = writeln!(output, "   - {issue}");
                }
                if show_warnings && result.warning_count() > 0 {
                    let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                output
            }
        }
    }

    /// Formats recorded resources.
    #[must_use]
    pub fn format_records(&self, state: &StateSnapshot) -> String {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(state).unwrap_or_default(),
            OutputFormat::Text => {
                if state.is_empty() {
                    return String::from("   No resources recorded.\n");
                }
                let rows: Vec<RecordRow> = state
                    .values()
                    .map(|r| RecordRow {
                        address: r.address.to_string(),
                        provider: r.provider.clone(),
                        id: Self::truncate(&r.id, 36),
                        deposed: r.deposed.len(),
                        updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                    })
                    .collect();
                format!("{}\n", Table::new(rows))
            }
        }
    }

    /// Formats lock status and recent history.
    #[must_use]
    pub fn format_state_summary(
        &self,
        backend: &str,
        records: usize,
        lock: Option<&LockInfo>,
        history: &[RunHistoryEntry],
    ) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({
                    "backend": backend,
                    "resources": records,
                    "lock": lock,
                    "history": history,
                });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\nState ({backend})\n");
                let _ = writeln!(output, "   Resources: {records}");
                match lock {
                    Some(lock) if !lock.is_expired() => {
                        let _ = writeln!(output, "   Lock: {}", lock.to_string().yellow());
                    }
                    _ => {
                        let _ = writeln!(output, "   Lock: {}", "unlocked".green());
                    }
                }

                if !history.is_empty() {
                    let _ = writeln!(output, "\n   Recent runs ({}):", history.len());
                    for entry in history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({} applied, {} failed, {} skipped)",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.applied.len(),
                            entry.failed.len(),
                            entry.skipped.len()
                        );
                    }
                }
                output
            }
        }
    }

    /// Formats a step operation with color.
    fn format_op(op: &StepOp) -> String {
        match op {
            StepOp::Create => "+create".green().to_string(),
            StepOp::Update => "~update".yellow().to_string(),
            StepOp::Delete => "-delete".red().to_string(),
            StepOp::DeleteDeposed { id } => format!("{} {}", "-deposed".red(), Self::truncate(id, 12)),
            StepOp::NoOp => "noop".dimmed().to_string(),
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

    /// Formats a success message.
    #[must_use]
    pub fn success(&self, message: &str) -> String {
        self.message("success", &"✓".green().to_string(), message)
    }

    /// Formats an error message.
    #[must_use]
    pub fn error(&self, message: &str) -> String {
        self.message("error", &"✗".red().to_string(), message)
    }

    /// Formats a warning message.
    #[must_use]
    pub fn warning(&self, message: &str) -> String {
        self.message("warning", &"⚠".yellow().to_string(), message)
    }

    fn message(&self, status: &str, symbol: &str, message: &str) -> String {
        match self.format {
            OutputFormat::Json => {
                let json = serde_json::json!({ "status": status, "message": message });
                serde_json::to_string_pretty(&json).unwrap_or_default()
            }
            OutputFormat::Text => format!("{symbol} {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigValidator, DeclarationFile};

    #[test]
    fn test_truncate_counts_characters() {
        assert_eq!(OutputFormatter::truncate("short", 10), "short");
        assert_eq!(OutputFormatter::truncate("abcdefghijkl", 8), "abcde...");
        assert_eq!(OutputFormatter::truncate("ééééééé", 5), "éé...");
    }

    #[test]
    fn test_json_messages() {
        let formatter = OutputFormatter::new(OutputFormat::Json);
        let value: serde_json::Value =
            serde_json::from_str(&formatter.error("boom")).expect("valid json");
        assert_eq!(value["status"], "error");
        assert_eq!(value["message"], "boom");
    }

    #[test]
    fn test_validation_text_lists_errors() {
        let declaration: DeclarationFile = serde_yaml::from_str(
            "project:\n  name: Bad_Name\nresources:\n  - kind: queue\n    name: a\n",
        )
        .expect("valid yaml");
        let result = ConfigValidator::new().collect(&declaration);

        let text = OutputFormatter::new(OutputFormat::Text).format_validation(&result, true);
        assert!(text.contains("error(s)"));
        assert!(text.contains("project.name"));
    }
}
