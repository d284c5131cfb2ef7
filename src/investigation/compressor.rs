//! Priority-based compression of tool history for the oracle's context.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::evidence::{EvidenceRules, ToolOutcome};
use super::extractor::KUBECTL_TOOL;
use crate::config::CompressionConfig;

const ERROR_BONUS: u32 = 50;
const DIRECT_EVIDENCE_BONUS: u32 = 30;
const DISCOVERY_BONUS: u32 = 20;
const RECENCY_MAX: u32 = 25;
const LONG_BONUS: u32 = 10;
const VERY_LONG_BONUS: u32 = 5;

const DIRECT_EVIDENCE_MARKERS: &[&str] = &["logs", "events", "describe"];
const DISCOVERY_MARKERS: &[&str] = &["get", "list", "search", "top", "api-resources"];

/// One scored history entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressedResult {
    pub tool_name: String,
    pub args: String,
    pub content: String,
    pub priority: u32,
    pub is_error: bool,
    pub timestamp: DateTime<Utc>,
}

impl CompressedResult {
    fn label(&self) -> String {
        if self.args.is_empty() {
            self.tool_name.clone()
        } else {
            format!("{} {}", self.tool_name, self.args)
        }
    }
}

/// Compressed view over a tool history; `detailed` and `summarized` are each
/// in chronological order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompressedHistory {
    pub detailed: Vec<CompressedResult>,
    pub summarized: Vec<CompressedResult>,
    pub text: String,
}

/// Keeps the highest-priority results in full and summarizes the rest.
#[derive(Debug, Clone)]
pub struct HistoryCompressor {
    keep_detailed: usize,
    max_summary_chars: usize,
    rules: EvidenceRules,
}

impl Default for HistoryCompressor {
    fn default() -> Self {
        Self::new(CompressionConfig::default(), EvidenceRules::default())
    }
}

impl HistoryCompressor {
    pub fn new(config: CompressionConfig, rules: EvidenceRules) -> Self {
        Self {
            keep_detailed: config.keep_detailed,
            max_summary_chars: config.max_summary_chars,
            rules,
        }
    }

    /// Whether `history` is long enough to need compression.
    pub fn needs_compression(&self, history: &[ToolOutcome]) -> bool {
        history.len() > self.keep_detailed
    }

    /// Compress `history` (oldest first).
    pub fn compress(&self, history: &[ToolOutcome]) -> CompressedHistory {
        let total = history.len();
        let mut scored: Vec<(usize, CompressedResult)> = history
            .iter()
            .enumerate()
            .map(|(index, outcome)| (index, self.score(outcome, index, total)))
            .collect();

        if total <= self.keep_detailed {
            let detailed: Vec<CompressedResult> = scored.into_iter().map(|(_, r)| r).collect();
            let text = detailed
                .iter()
                .enumerate()
                .map(|(i, r)| format!("--- Result {} : {} ---\n{}", i + 1, r.label(), r.content))
                .collect::<Vec<_>>()
                .join("\n\n");
            return CompressedHistory {
                detailed,
                summarized: Vec::new(),
                text,
            };
        }

        // Highest priority first; among equals, the more recent entry wins.
        scored.sort_by(|(ia, a), (ib, b)| b.priority.cmp(&a.priority).then(ib.cmp(ia)));
        let mut summarized = scored.split_off(self.keep_detailed);
        let mut detailed = scored;
        detailed.sort_by_key(|(index, _)| *index);
        summarized.sort_by_key(|(index, _)| *index);

        let detailed: Vec<CompressedResult> = detailed.into_iter().map(|(_, r)| r).collect();
        let summarized: Vec<CompressedResult> = summarized.into_iter().map(|(_, r)| r).collect();

        let mut text = String::from("## Key tool results\n");
        for r in &detailed {
            text.push_str(&format!("\n--- {} (priority {}) ---\n{}\n", r.label(), r.priority, r.content));
        }
        text.push_str("\n## Earlier tool results (summarized)\n");
        for r in &summarized {
            text.push_str(&format!("- {}: {}\n", r.label(), self.summarize(&r.content)));
        }

        CompressedHistory {
            detailed,
            summarized,
            text,
        }
    }

    fn score(&self, outcome: &ToolOutcome, index: usize, total: usize) -> CompressedResult {
        let content = if outcome.result.trim().is_empty() {
            outcome.error_message.clone().unwrap_or_default()
        } else {
            outcome.result.clone()
        };
        let is_error = outcome.is_error() || self.rules.is_error(&content);

        let mut priority = 0;
        if is_error {
            priority += ERROR_BONUS;
        }
        let verb = tool_verb(&outcome.tool, &outcome.args);
        if DIRECT_EVIDENCE_MARKERS.iter().any(|m| verb.contains(m)) {
            priority += DIRECT_EVIDENCE_BONUS;
        } else if DISCOVERY_MARKERS.iter().any(|m| verb.contains(m)) {
            priority += DISCOVERY_BONUS;
        }
        priority += RECENCY_MAX * (index as u32 + 1) / total.max(1) as u32;

        let length = content.chars().count();
        if length > 500 {
            priority += LONG_BONUS;
        }
        if length > 1000 {
            priority += VERY_LONG_BONUS;
        }

        CompressedResult {
            tool_name: outcome.tool.clone(),
            args: outcome.args.clone(),
            content,
            priority,
            is_error,
            timestamp: outcome.timestamp,
        }
    }

    fn summarize(&self, content: &str) -> String {
        let first_line = content.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");
        first_line.chars().take(self.max_summary_chars).collect()
    }
}

/// The operation a call performs: the kubectl subcommand, or the tool name.
fn tool_verb(tool: &str, args: &str) -> String {
    if tool.eq_ignore_ascii_case(KUBECTL_TOOL) {
        args.split_whitespace()
            .find(|w| !w.starts_with('-'))
            .unwrap_or_default()
            .to_lowercase()
    } else {
        tool.to_lowercase()
    }
}
