//! Intent classification for user utterances.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::builtin_regex;

/// Intent category of a user message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Action,
    Query,
    Casual,
    Knowledge,
    Troubleshooting,
    Unknown,
}

impl RequestKind {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestKind::Action => "action",
            RequestKind::Query => "query",
            RequestKind::Casual => "casual",
            RequestKind::Knowledge => "knowledge",
            RequestKind::Troubleshooting => "troubleshooting",
            RequestKind::Unknown => "unknown",
        }
    }

    /// Whether the request warrants the tool-driven investigation loop.
    pub fn needs_investigation(&self) -> bool {
        !matches!(self, RequestKind::Casual | RequestKind::Knowledge)
    }
}

impl std::fmt::Display for RequestKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

const CASUAL_FORMS: &[&str] = &[
    "hi",
    "hello",
    "hey",
    "hey there",
    "hi there",
    "yo",
    "sup",
    "good morning",
    "good afternoon",
    "good evening",
    "thanks",
    "thank you",
    "thanks a lot",
    "thx",
    "ty",
    "ok",
    "okay",
    "cool",
    "great",
    "nice",
    "awesome",
    "perfect",
    "got it",
    "sounds good",
    "bye",
    "goodbye",
    "cheers",
];

static ACTION: LazyLock<Regex> = LazyLock::new(|| {
    builtin_regex(
        r"^(show|list|get|describe|check|scale|restart|delete|apply|create|run|exec|rollout|deploy|display|fetch|view|tail|watch|drain|cordon|uncordon|patch|edit|label|annotate|expose|top)\b|\blogs? (for|of|from)\b",
    )
});

static TROUBLESHOOTING: LazyLock<Regex> = LazyLock::new(|| {
    builtin_regex(
        r"\bwhy (is|are|does|do|did|was|were)\b|\bwhat'?s wrong\b|\bwhat is wrong\b|\bnot (working|ready|starting|running)\b|\b(fail(s|ed|ing|ure|ures)?|errors?|crash(es|ed|ing)?|crashloop\w*|oom\w*|broken|stuck|unhealthy|evicted|troubleshoot\w*|debug\w*|restarting)\b",
    )
});

static KNOWLEDGE: LazyLock<Regex> = LazyLock::new(|| {
    builtin_regex(
        r"^(what (is|are) (a|an|the)\b|what'?s (a|an|the)\b|what are\b|how (does|do)\b|explain\b|tell me about\b|define\b)|\bdifference between\b",
    )
});

static QUERY: LazyLock<Regex> = LazyLock::new(|| {
    builtin_regex(r"\bhow many\b|^(is|are) there\b|\bdo we have\b|\bdoes .+ exist\b|\bexists?\b")
});

/// Classify a user utterance. Total: every input maps to one kind.
pub fn classify_request(message: &str) -> RequestKind {
    let text = message.trim().to_lowercase();
    if text.is_empty() {
        return RequestKind::Unknown;
    }

    let bare = text.trim_end_matches(['!', '.', '?', ',', ' ']);
    if CASUAL_FORMS.contains(&bare) {
        return RequestKind::Casual;
    }
    if ACTION.is_match(&text) {
        return RequestKind::Action;
    }
    if TROUBLESHOOTING.is_match(&text) {
        return RequestKind::Troubleshooting;
    }
    if KNOWLEDGE.is_match(&text) {
        return RequestKind::Knowledge;
    }
    if QUERY.is_match(&text) {
        return RequestKind::Query;
    }
    RequestKind::Unknown
}
