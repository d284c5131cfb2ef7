//! Tool outcomes and the lexical rules that judge them.
//!
//! Whether a result is "useful" is decided by an open-ended list of domain
//! patterns. The built-in list covers common Kubernetes failure vocabulary;
//! deployments extend it through `EVIDENCE_PATTERNS`.

use chrono::{DateTime, Utc};
use regex::{Regex, RegexSet};
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use super::builtin_regex;
use super::extractor::ExtractedCommand;
use crate::error::ToolError;

/// Result classification of one tool execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
    Empty,
    Partial,
    Skipped,
}

impl ToolStatus {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolStatus::Success => "success",
            ToolStatus::Error => "error",
            ToolStatus::Empty => "empty",
            ToolStatus::Partial => "partial",
            ToolStatus::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for ToolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry of an investigation's tool history. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub tool: String,
    pub args: String,
    pub result: String,
    pub status: ToolStatus,
    pub timestamp: DateTime<Utc>,
    pub useful: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternatives: Vec<String>,
}

impl ToolOutcome {
    /// Outcome for a call that was never executed.
    pub fn skipped(command: &ExtractedCommand, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        Self {
            tool: command.tool.clone(),
            args: command.args.clone(),
            result: String::new(),
            status: ToolStatus::Skipped,
            timestamp: Utc::now(),
            useful: false,
            error_message: Some(reason),
            alternatives: Vec::new(),
        }
    }

    /// Whether the call was attempted and failed.
    pub fn is_error(&self) -> bool {
        self.status == ToolStatus::Error
    }

    /// Whether the call actually ran.
    pub fn was_executed(&self) -> bool {
        self.status != ToolStatus::Skipped
    }

    /// `TOOL args` label used in prompts and summaries.
    pub fn label(&self) -> String {
        if self.args.is_empty() {
            self.tool.clone()
        } else {
            format!("{} {}", self.tool, self.args)
        }
    }
}

const DEFAULT_EVIDENCE: &[&str] = &[
    r"(?i)\b(crashloopbackoff|oomkilled|imagepullbackoff|errimagepull|evicted|notready|pending|backoff)\b",
    r"(?i)\bexit code\b|\bexitcode\b|\brestart(s|ed| count)\b",
    r"(?i)\b(reason|message|status|conditions?|events?|warning)\s*:",
    r"(?i)\b(running|ready|completed|terminated|succeeded)\b",
    r"(?i)\b(connection refused|timed out|timeout|deadline exceeded|unreachable)\b",
    r"(?i)\b(memory|cpu)\b.*\b(limit|request|usage|pressure)\b",
    r"(?i)\b(replicas?|desired|available|unavailable)\b",
    r"(?i)\b(error|failed|failure|exception|panic|fatal)\b",
];

static ERROR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    builtin_regex(
        r"(?i)\b(error|errors|failed|failure|exception|panic|fatal|forbidden|unauthorized|refused|not found|timed out|crashloopbackoff|oomkilled)\b",
    )
});

static ERROR_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| builtin_regex(r"(?i)^\s*(error( from server)?\b|fatal:|unable to\b)"));

static PARTIAL_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    builtin_regex(r"(?i)\b(truncated|partial results?|output limited|and \d+ more)\b")
});

/// Configurable set of evidence-bearing patterns.
#[derive(Debug, Clone)]
pub struct EvidenceRules {
    evidence: RegexSet,
    patterns: Vec<String>,
}

impl Default for EvidenceRules {
    fn default() -> Self {
        let patterns: Vec<String> = DEFAULT_EVIDENCE.iter().map(|p| p.to_string()).collect();
        let evidence = RegexSet::new(&patterns)
            .unwrap_or_else(|e| panic!("invalid built-in evidence pattern: {e}"));
        Self { evidence, patterns }
    }
}

impl EvidenceRules {
    /// Built-in rules plus `extra` patterns.
    pub fn with_patterns<S: AsRef<str>>(extra: &[S]) -> Result<Self, regex::Error> {
        let mut patterns: Vec<String> = DEFAULT_EVIDENCE.iter().map(|p| p.to_string()).collect();
        patterns.extend(extra.iter().map(|p| p.as_ref().to_string()));
        let evidence = RegexSet::new(&patterns)?;
        Ok(Self { evidence, patterns })
    }

    /// Number of active patterns.
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Always false; the built-in patterns cannot be removed.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether `text` carries diagnostic evidence.
    pub fn is_evidence(&self, text: &str) -> bool {
        self.evidence.is_match(text)
    }

    /// Whether `text` reads like an error or failure.
    pub fn is_error(&self, text: &str) -> bool {
        ERROR_PATTERN.is_match(text)
    }

    /// Turn a runner result into a recorded outcome.
    pub fn classify(
        &self,
        command: &ExtractedCommand,
        result: Result<String, ToolError>,
    ) -> ToolOutcome {
        let (result, status, error_message) = match result {
            Err(e) => (String::new(), ToolStatus::Error, Some(e.to_string())),
            Ok(output) if output.trim().is_empty() => (output, ToolStatus::Empty, None),
            Ok(output) if ERROR_PREFIX.is_match(&output) => {
                let first_line = output.lines().next().unwrap_or_default().trim().to_string();
                (output, ToolStatus::Error, Some(first_line))
            }
            Ok(output) if PARTIAL_MARKER.is_match(&output) => (output, ToolStatus::Partial, None),
            Ok(output) => (output, ToolStatus::Success, None),
        };

        let useful = matches!(status, ToolStatus::Success | ToolStatus::Partial)
            && self.is_evidence(&result);
        let alternatives = if status == ToolStatus::Error {
            suggest_alternatives(command)
        } else {
            Vec::new()
        };

        ToolOutcome {
            tool: command.tool.clone(),
            args: command.args.clone(),
            result,
            status,
            timestamp: Utc::now(),
            useful,
            error_message,
            alternatives,
        }
    }
}

/// Follow-up calls worth trying when `command` failed.
fn suggest_alternatives(command: &ExtractedCommand) -> Vec<String> {
    if command.tool != "RUN_KUBECTL" {
        return Vec::new();
    }

    let mut words = command.args.split_whitespace();
    let verb = words.next().unwrap_or_default();
    let rest: Vec<&str> = words.collect();
    let target = rest.iter().find(|w| !w.starts_with('-')).copied();

    match (verb, target) {
        ("logs", Some(pod)) => vec![
            format!("RUN_KUBECTL logs {} --previous", rest.join(" ")),
            format!("RUN_KUBECTL describe pod {}", pod),
        ],
        ("describe", Some(kind)) | ("get", Some(kind)) => {
            vec![format!("RUN_KUBECTL get {} -A", kind)]
        }
        ("top", _) => vec!["RUN_KUBECTL get --raw /apis/metrics.k8s.io/v1beta1/nodes".to_string()],
        _ => vec!["RUN_KUBECTL get events -A --sort-by=.lastTimestamp".to_string()],
    }
}
