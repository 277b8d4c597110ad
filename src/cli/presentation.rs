//! CLI presentation: text and JSON rendering of history, events and reports.

use crate::error::{ApiError, StorageError};
use crate::events::TaskEvent;
use crate::history::{HistoryEntry, PurgeReport};
use crate::queue::{TaskProgress, TaskState};
use comfy_table::presets::UTF8_BORDERS_ONLY;
use comfy_table::Table;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_history(entries: &[HistoryEntry], format: &str) -> Result<String, ApiError> {
    if format == "json" {
        return serde_json::to_string_pretty(entries)
            .map_err(|e| ApiError::Storage(StorageError::from(e)));
    }
    if entries.is_empty() {
        return Ok("No history entries.".to_string());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_BORDERS_ONLY);
    table.set_header(vec!["Recorded", "Task", "State", "Size", "Prompt", "Images"]);
    for entry in entries {
        let state = match (&entry.state, &entry.reason) {
            (TaskState::Failed, Some(reason)) => format!("failed: {}", reason),
            (state, _) => state.to_string(),
        };
        table.add_row(vec![
            entry.recorded_at.format(TIME_FORMAT).to_string(),
            short_task_id(&entry.task_id.to_string()),
            state,
            format!("{} {}", entry.resolution, entry.aspect),
            entry.prompt_preview.clone(),
            entry
                .artifacts
                .iter()
                .map(|a| a.short())
                .collect::<Vec<_>>()
                .join(" "),
        ]);
    }
    Ok(table.to_string())
}

pub fn format_entry(entry: &HistoryEntry, format: &str) -> Result<String, ApiError> {
    if format == "json" {
        return serde_json::to_string_pretty(entry)
            .map_err(|e| ApiError::Storage(StorageError::from(e)));
    }
    let mut out = String::new();
    out.push_str(&format!("Task:       {}\n", entry.task_id));
    out.push_str(&format!("State:      {}\n", entry.state));
    if let Some(reason) = &entry.reason {
        out.push_str(&format!("Reason:     {}\n", reason));
    }
    out.push_str(&format!(
        "Created:    {}\n",
        entry.created_at.format(TIME_FORMAT)
    ));
    out.push_str(&format!(
        "Recorded:   {}\n",
        entry.recorded_at.format(TIME_FORMAT)
    ));
    out.push_str(&format!("Attempts:   {}\n", entry.attempts));
    if let Some(ms) = entry.elapsed_ms {
        out.push_str(&format!("Elapsed:    {}\n", format_elapsed_ms(ms)));
    }
    out.push_str(&format!(
        "Output:     {} {}\n",
        entry.resolution, entry.aspect
    ));
    let prompt = if entry.prompt.is_empty() {
        &entry.prompt_preview
    } else {
        &entry.prompt
    };
    out.push_str(&format!("Prompt:     {}\n", prompt));
    for input in &entry.inputs {
        out.push_str(&format!("Input:      {}\n", input));
    }
    for artifact in &entry.artifacts {
        out.push_str(&format!("Artifact:   {}\n", artifact));
    }
    Ok(out.trim_end().to_string())
}

/// One progress line for a task event.
pub fn format_event_line(event: &TaskEvent) -> String {
    let mut line = format!(
        "[{}] {}",
        event.at.format("%H:%M:%S"),
        if event.removed { "removed" } else { event.state.as_str() }
    );
    if event.attempt > 0 && !event.removed {
        line.push_str(&format!(" (attempt {})", event.attempt));
    }
    if let Some(reason) = &event.reason {
        line.push_str(&format!(": {}", reason));
    }
    if let (true, Some(ms)) = (event.state.is_terminal(), event.elapsed_ms) {
        line.push_str(&format!(" in {}", format_elapsed_ms(ms)));
    }
    for artifact in &event.artifacts {
        line.push_str(&format!("\n  {}", artifact));
    }
    line
}

/// Periodic line for a task still in flight.
pub fn format_progress_line(progress: &TaskProgress) -> String {
    let elapsed = progress
        .elapsed
        .map(|d| format_elapsed_ms(d.as_millis() as u64))
        .unwrap_or_else(|| "queued".to_string());
    format!(
        "  {} ~{:.0}% ({})",
        progress.state,
        progress.fraction * 100.0,
        elapsed
    )
}

fn format_elapsed_ms(ms: u64) -> String {
    if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms / 1000) % 60)
    }
}

pub fn format_purge_report(report: &PurgeReport) -> String {
    if !report.entry_removed {
        return "No history entry for that task.".to_string();
    }
    let mut out = "History entry removed.".to_string();
    if !report.artifacts_removed.is_empty() {
        out.push_str(&format!(
            "\nDeleted {} image(s).",
            report.artifacts_removed.len()
        ));
    }
    if !report.artifacts_kept.is_empty() {
        out.push_str(&format!(
            "\nKept {} image(s) still used by other entries.",
            report.artifacts_kept.len()
        ));
    }
    out
}

fn short_task_id(id: &str) -> String {
    id.chars().take(8).collect()
}
