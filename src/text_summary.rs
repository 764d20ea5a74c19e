//! Text summary builder for CLI output.
//!
//! Formats an [`Outcome`] as human-readable lines for text mode.

use crate::model::Outcome;

/// Pre-formatted lines for text output.
pub(crate) struct TextSummary {
    pub lines: Vec<String>,
}

pub(crate) fn build_text_summary(outcome: &Outcome) -> TextSummary {
    let mut lines = Vec::new();

    lines.push(format!("Status: {}", outcome.final_status));
    lines.push(format!("Note: {}", outcome.note));
    lines.push(format!("Target: {}", outcome.target_id));
    if let Some(job) = outcome.job_id.as_deref() {
        lines.push(format!("Job: {job}"));
    }
    if let Some(id) = outcome.execution_id {
        lines.push(format!("Execution: {id}"));
    }
    if let Some(id) = outcome.blocking_execution_id {
        lines.push(format!("Blocking execution: {id}"));
    }
    if let Some(raw) = outcome.raw_status.as_ref() {
        lines.push(format!("Raw status: {raw}"));
    }
    if let Some(at) = outcome.target_reloaded_at.as_deref() {
        lines.push(format!("Target reloaded (UTC): {at}"));
    }
    lines.push(format!("Finished (UTC): {}", outcome.timestamp_utc));

    TextSummary { lines }
}
