//! Error taxonomy and categorization (spec §7).
//!
//! Workers report failures as JSON-encoded payloads
//! (`error_type`/`category`/`error_class`/`error_message`/`traceback`).
//! This module turns that payload, plus the job that produced it, into a
//! `CategorizedError` with actionable guidance, the way a build reporter
//! would want to render it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::JobId;
use crate::worker::WorkerId;

/// The three fault kinds spec §7 distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Faults attributable to the input artifact itself.
    User,
    /// Missing external tools, templates, or environment variables.
    Configuration,
    /// Worker timeouts, no-workers-available, unknown job type, cache I/O.
    Infrastructure,
}

/// A fully categorized, actionable error, ready to hand to a build
/// reporter or to persist as `Job::error` / `IssueRow::payload`.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("{category}: {message}")]
pub struct CategorizedError {
    pub error_type: ErrorKind,
    pub category: String,
    pub message: String,
    pub actionable_guidance: String,
    pub file_path: String,
    pub job_id: Option<JobId>,
    pub worker_id: Option<WorkerId>,
    pub correlation_id: Option<String>,
    /// Heuristically-extracted structured fields (cell number, error
    /// class, line number, code snippet) so downstream UIs need not
    /// re-parse the traceback.
    pub details: BTreeMap<String, Value>,
}

impl CategorizedError {
    /// Mark this error as having been reported from a cache hit rather
    /// than a live execution (spec §4.H step 1).
    pub fn tagged_from_cache(mut self) -> Self {
        self.details
            .insert("from_cache".to_string(), Value::Bool(true));
        self
    }

    pub fn fatal_no_workers(job_type: &str) -> Self {
        CategorizedError {
            error_type: ErrorKind::Infrastructure,
            category: "no_workers".to_string(),
            message: format!("no healthy workers available for job type '{job_type}'"),
            actionable_guidance: format!(
                "start {job_type} workers before submitting jobs; workers register within 10s of starting"
            ),
            file_path: String::new(),
            job_id: None,
            worker_id: None,
            correlation_id: None,
            details: BTreeMap::new(),
        }
    }

    pub fn unknown_job_type(service_name: &str) -> Self {
        CategorizedError {
            error_type: ErrorKind::Infrastructure,
            category: "unknown_job_type".to_string(),
            message: format!("unknown service: {service_name}"),
            actionable_guidance: "this is an invalid operation; check the service name mapping"
                .to_string(),
            file_path: String::new(),
            job_id: None,
            worker_id: None,
            correlation_id: None,
            details: BTreeMap::new(),
        }
    }
}

/// Structured detail payload a worker reports on job failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerErrorPayload {
    pub error_type: Option<String>,
    pub category: Option<String>,
    pub error_class: Option<String>,
    pub error_message: Option<String>,
    pub traceback: Option<String>,
}

/// Categorize a job failure into a `CategorizedError`.
///
/// `error_message` is either a JSON-encoded `WorkerErrorPayload` or a
/// plain-text message; both are accepted. ANSI escape sequences are
/// stripped recursively before storage or display.
pub fn categorize_job_error(
    job_type: &str,
    input_file: &str,
    error_message: &str,
    job_id: Option<JobId>,
    correlation_id: Option<String>,
) -> CategorizedError {
    let cleaned = strip_ansi(error_message);
    let parsed: WorkerErrorPayload = serde_json::from_str(&cleaned).unwrap_or(WorkerErrorPayload {
        error_message: Some(cleaned.clone()),
        ..Default::default()
    });

    let message = parsed
        .error_message
        .clone()
        .unwrap_or_else(|| "unknown error".to_string());
    let message = strip_ansi(&message);
    let error_class = parsed.error_class.clone().unwrap_or_default();
    let traceback = parsed.traceback.clone().unwrap_or_default();

    let details = extract_details(&message, &traceback);

    let (error_type, category, guidance) = match job_type {
        "notebook" => categorize_notebook_error(&message, &error_class, &details),
        "plantuml" => (
            ErrorKind::User,
            "plantuml_syntax".to_string(),
            "fix the PlantUML diagram syntax".to_string(),
        ),
        "drawio" => (
            ErrorKind::User,
            "drawio_syntax".to_string(),
            "fix the drawio diagram source".to_string(),
        ),
        other => {
            return CategorizedError {
                error_type: ErrorKind::Infrastructure,
                category: "unknown_job_type".to_string(),
                message: format!("unknown job type: {other}"),
                actionable_guidance: "this is likely a bug in job forge; please report it"
                    .to_string(),
                file_path: input_file.to_string(),
                job_id,
                worker_id: None,
                correlation_id,
                details: BTreeMap::new(),
            };
        }
    };

    CategorizedError {
        error_type,
        category,
        message,
        actionable_guidance: guidance,
        file_path: input_file.to_string(),
        job_id,
        worker_id: None,
        correlation_id,
        details,
    }
}

fn categorize_notebook_error(
    message: &str,
    error_class: &str,
    details: &BTreeMap<String, Value>,
) -> (ErrorKind, String, String) {
    let in_cell = details
        .get("cell_number")
        .map(|v| format!(" in cell #{v}"))
        .unwrap_or_default();

    if ["SyntaxError", "NameError", "IndentationError", "TypeError"]
        .iter()
        .any(|needle| message.contains(needle) || error_class.contains(needle))
    {
        let class = if error_class.is_empty() {
            "error"
        } else {
            error_class
        };
        (
            ErrorKind::User,
            "notebook_compilation".to_string(),
            format!("fix the {class}{in_cell} in your notebook"),
        )
    } else if message.contains("FileNotFoundError") && message.to_lowercase().contains("template")
    {
        (
            ErrorKind::Configuration,
            "missing_template".to_string(),
            "ensure the template directory contains the expected templates".to_string(),
        )
    } else if message.contains("TimeoutError") || message.to_lowercase().contains("worker") {
        (
            ErrorKind::Infrastructure,
            "worker_timeout".to_string(),
            "the worker timed out; check worker logs".to_string(),
        )
    } else if message.contains("ModuleNotFoundError") || message.contains("ImportError") {
        (
            ErrorKind::User,
            "missing_module".to_string(),
            "install the missing module or check your imports".to_string(),
        )
    } else {
        (
            ErrorKind::User,
            "notebook_processing".to_string(),
            "check the notebook for errors; rerun with verbose logging for detail".to_string(),
        )
    }
}

/// Heuristically extract cell number, line number, and error class from a
/// traceback or error message.
fn extract_details(message: &str, traceback: &str) -> BTreeMap<String, Value> {
    let mut details = BTreeMap::new();
    let haystack = format!("{message}\n{traceback}");

    if let Some(cell) = extract_after_any(&haystack, &["cell #", "cell ", "Cell["]) {
        if let Ok(n) = cell.trim_end_matches(']').parse::<u64>() {
            details.insert("cell_number".to_string(), Value::from(n));
        }
    }

    if let Some(line) = extract_after_any(&haystack, &["line "]) {
        if let Ok(n) = line.parse::<u64>() {
            details.insert("line_number".to_string(), Value::from(n));
        }
    }

    details
}

/// Grab the run of ascii digits immediately following the first matching
/// marker string.
fn extract_after_any(haystack: &str, markers: &[&str]) -> Option<String> {
    for marker in markers {
        if let Some(idx) = haystack.find(marker) {
            let rest = &haystack[idx + marker.len()..];
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if !digits.is_empty() {
                return Some(digits);
            }
        }
    }
    None
}

/// Strip ANSI CSI escape sequences (`ESC [ ... final-byte`) from a string.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for next in chars.by_ref() {
                if ('@'..='~').contains(&next) {
                    break;
                }
            }
            continue;
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_ansi_removes_color_codes() {
        let input = "\u{1b}[31merror\u{1b}[0m: bad";
        assert_eq!(strip_ansi(input), "error: bad");
    }

    #[test]
    fn strip_ansi_passthrough_plain_text() {
        assert_eq!(strip_ansi("plain text"), "plain text");
    }

    #[test]
    fn categorize_syntax_error_is_user_fault() {
        let err = categorize_job_error(
            "notebook",
            "/w/in.ipynb",
            r#"{"error_class": "SyntaxError", "error_message": "SyntaxError: invalid syntax in cell #3"}"#,
            Some(7),
            Some("corr-1".to_string()),
        );
        assert_eq!(err.error_type, ErrorKind::User);
        assert_eq!(err.category, "notebook_compilation");
        assert_eq!(err.details.get("cell_number"), Some(&Value::from(3u64)));
    }

    #[test]
    fn categorize_unknown_job_type_is_infrastructure() {
        let err = categorize_job_error("mystery", "/w/in", "boom", None, None);
        assert_eq!(err.error_type, ErrorKind::Infrastructure);
        assert_eq!(err.category, "unknown_job_type");
    }

    #[test]
    fn fatal_no_workers_is_infrastructure() {
        let err = CategorizedError::fatal_no_workers("notebook");
        assert_eq!(err.error_type, ErrorKind::Infrastructure);
        assert_eq!(err.category, "no_workers");
    }
}
