//! Reflection over completed runs, and rendering learned strategies back
//! into prompts.
//!
//! Reflection is pattern matching over the ledger of a successful run: each
//! known category has a detector that yields a confidence, and the best match
//! at or above the threshold becomes a [`Strategy`].

use codeward_core::{Strategy, StrategyBook, ToolCall, ToolOutcome};
use std::collections::BTreeMap;

pub const LIST_BEFORE_READ: &str = "list_before_read";
pub const SEARCH_BEFORE_READ: &str = "search_before_read";
pub const READ_BEFORE_WRITE: &str = "read_before_write";
pub const VERIFY_AFTER_WRITE: &str = "verify_after_write";
pub const RETRY_AFTER_FAILURE: &str = "retry_after_failure";

const READ_TOOLS: [&str; 1] = ["read_file"];
const WRITE_TOOLS: [&str; 2] = ["write_file", "delete_file"];

fn path_of(call: &ToolCall) -> Option<&str> {
    call.arguments.get("path").and_then(|p| p.as_str())
}

fn is_read(call: &ToolCall) -> bool {
    READ_TOOLS.contains(&call.name.as_str())
}

fn is_write(call: &ToolCall) -> bool {
    WRITE_TOOLS.contains(&call.name.as_str())
}

/// Whether a read follows the first call named `tool`.
fn read_after(calls: &[&ToolCall], tool: &str) -> bool {
    calls
        .iter()
        .position(|c| c.name == tool)
        .is_some_and(|i| calls[i + 1..].iter().any(|c| is_read(c)))
}

fn detect_read_before_write(calls: &[&ToolCall]) -> f32 {
    let mut best: f32 = 0.0;
    for (i, write) in calls.iter().enumerate().filter(|(_, c)| is_write(c)) {
        let earlier = &calls[..i];
        let same_path = path_of(write).is_some_and(|p| earlier.iter().any(|c| is_read(c) && path_of(c) == Some(p)));
        if same_path {
            best = best.max(0.9);
        } else if earlier.iter().any(|c| is_read(c)) {
            best = best.max(0.5);
        }
    }
    best
}

fn detect_verify_after_write(calls: &[&ToolCall]) -> f32 {
    let mut best: f32 = 0.0;
    for (i, write) in calls.iter().enumerate().filter(|(_, c)| c.name == "write_file") {
        let later = &calls[i + 1..];
        let reread = path_of(write).is_some_and(|p| later.iter().any(|c| is_read(c) && path_of(c) == Some(p)));
        if reread {
            best = best.max(0.85);
        } else if later.iter().any(|c| c.name == "run_command") {
            best = best.max(0.75);
        }
    }
    best
}

fn detect_retry_after_failure(calls: &[&ToolCall]) -> f32 {
    let retried = calls.iter().enumerate().any(|(i, call)| {
        matches!(call.outcome, ToolOutcome::Failed { .. })
            && calls[i + 1..]
                .iter()
                .any(|c| c.name == call.name && c.outcome.is_success())
    });
    if retried { 0.7 } else { 0.0 }
}

fn advice(category: &str) -> &'static str {
    match category {
        LIST_BEFORE_READ => "List the directory before reading files to confirm which paths exist.",
        SEARCH_BEFORE_READ => "Search for the relevant symbol or text first, then read only the files that match.",
        READ_BEFORE_WRITE => "Read a file before modifying it so the change preserves existing content.",
        VERIFY_AFTER_WRITE => "After writing a file, read it back or run a check to verify the change.",
        _ => "When a tool call fails, correct the arguments and retry instead of abandoning the step.",
    }
}

/// Reflect over a run's tool calls. Returns the most confident strategy at
/// or above `min_confidence`, or `None` for unsuccessful runs.
pub fn reflect(calls: &[ToolCall], run_succeeded: bool, min_confidence: f32) -> Option<Strategy> {
    if !run_succeeded || !calls.iter().any(|c| c.outcome.is_success()) {
        return None;
    }
    let all: Vec<&ToolCall> = calls.iter().collect();
    let succeeded: Vec<&ToolCall> = calls.iter().filter(|c| c.outcome.is_success()).collect();

    let candidates = [
        (READ_BEFORE_WRITE, detect_read_before_write(&succeeded)),
        (VERIFY_AFTER_WRITE, detect_verify_after_write(&succeeded)),
        (SEARCH_BEFORE_READ, if read_after(&succeeded, "search") { 0.75 } else { 0.0 }),
        (LIST_BEFORE_READ, if read_after(&succeeded, "list_files") { 0.65 } else { 0.0 }),
        (RETRY_AFTER_FAILURE, detect_retry_after_failure(&all)),
    ];
    let (category, confidence) = candidates
        .into_iter()
        .fold((RETRY_AFTER_FAILURE, 0.0_f32), |best, c| if c.1 > best.1 { c } else { best });

    if confidence < min_confidence {
        tracing::debug!(category, confidence, "No strategy above threshold");
        return None;
    }
    tracing::debug!(category, confidence, "Reflected strategy");
    Some(Strategy::new(category, advice(category)))
}

/// Render at most `cap` strategies grouped by category. Least useful ones
/// are left out first.
pub fn render_strategies(book: &StrategyBook, cap: usize) -> Option<String> {
    let top = book.top(cap);
    if top.is_empty() {
        return None;
    }
    let mut by_category: BTreeMap<&str, Vec<&Strategy>> = BTreeMap::new();
    for strategy in top {
        by_category.entry(strategy.category.as_str()).or_default().push(strategy);
    }
    let mut out = String::from("## Learned strategies\n");
    for (category, strategies) in by_category {
        out.push_str(&format!("\n### {category}\n"));
        for s in strategies {
            out.push_str(&format!("- [{}] {} (helpful {}, harmful {})\n", s.id, s.text, s.helpful, s.harmful));
        }
    }
    Some(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeward_core::{StrategyTag, ToolCallLedger};

    fn ledger(calls: &[(&str, serde_json::Value, ToolOutcome)]) -> Vec<ToolCall> {
        let mut ledger = ToolCallLedger::default();
        for (i, (name, args, outcome)) in calls.iter().enumerate() {
            let id = format!("c{i}");
            ledger.issue(&id, name, args.clone());
            ledger.resolve(&id, outcome.clone());
        }
        ledger.iter().cloned().collect()
    }

    fn failed() -> ToolOutcome {
        ToolOutcome::Failed {
            message: "boom".into(),
            recoverable: true,
        }
    }

    #[test]
    fn read_then_write_same_file() {
        let calls = ledger(&[
            ("read_file", serde_json::json!({"path": "src/lib.rs"}), ToolOutcome::Succeeded),
            ("write_file", serde_json::json!({"path": "src/lib.rs", "content": "x"}), ToolOutcome::Succeeded),
        ]);
        let strategy = reflect(&calls, true, 0.6).unwrap();
        assert_eq!(strategy.category, READ_BEFORE_WRITE);
    }

    #[test]
    fn list_then_read() {
        let calls = ledger(&[
            ("list_files", serde_json::json!({"path": "."}), ToolOutcome::Succeeded),
            ("read_file", serde_json::json!({"path": "README.md"}), ToolOutcome::Succeeded),
        ]);
        assert_eq!(reflect(&calls, true, 0.6).unwrap().category, LIST_BEFORE_READ);
        assert!(reflect(&calls, true, 0.7).is_none());
    }

    #[test]
    fn retry_after_failure_detected() {
        let calls = ledger(&[
            ("run_command", serde_json::json!({"command": "cargo tset"}), failed()),
            ("run_command", serde_json::json!({"command": "cargo test"}), ToolOutcome::Succeeded),
        ]);
        assert_eq!(reflect(&calls, true, 0.6).unwrap().category, RETRY_AFTER_FAILURE);
    }

    #[test]
    fn failed_runs_teach_nothing() {
        let calls = ledger(&[
            ("list_files", serde_json::json!({"path": "."}), ToolOutcome::Succeeded),
            ("read_file", serde_json::json!({"path": "README.md"}), ToolOutcome::Succeeded),
        ]);
        assert!(reflect(&calls, false, 0.1).is_none());
        assert!(reflect(&[], true, 0.1).is_none());
    }

    #[test]
    fn rendering_is_bounded_and_grouped() {
        let mut book = StrategyBook::new();
        let keep = book.add(Strategy::new(READ_BEFORE_WRITE, advice(READ_BEFORE_WRITE)));
        let drop = book.add(Strategy::new(LIST_BEFORE_READ, advice(LIST_BEFORE_READ)));
        let also = book.add(Strategy::new(VERIFY_AFTER_WRITE, advice(VERIFY_AFTER_WRITE)));
        book.tag(&keep, StrategyTag::Helpful);
        book.tag(&also, StrategyTag::Helpful);
        book.tag(&drop, StrategyTag::Harmful);

        let rendered = render_strategies(&book, 2).unwrap();
        assert!(rendered.contains("### read_before_write"));
        assert!(rendered.contains("### verify_after_write"));
        assert!(!rendered.contains("list_before_read"));
        assert_eq!(book.len(), 3);
        assert!(render_strategies(&StrategyBook::new(), 5).is_none());
    }
}
