//! Confidence extraction and assessment.
//!
//! An explicit `Confidence: X` marker always wins. Without one, the literal
//! upper-case word `HIGH` appearing together with the word "confidence" is
//! read as an implicit HIGH. That heuristic is loose (it fires on text that
//! merely discusses confidence) and is kept as-is rather than extended.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::builtin_regex;
use super::state::{Hypothesis, HypothesisStatus, InvestigationState};

/// Confidence stated or implied by model output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
    Unknown,
}

impl ConfidenceLevel {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLevel::High => "HIGH",
            ConfidenceLevel::Medium => "MEDIUM",
            ConfidenceLevel::Low => "LOW",
            ConfidenceLevel::Unknown => "UNKNOWN",
        }
    }

    /// Numeric score: 90, 60, 30 or 0.
    pub fn score(&self) -> u8 {
        match self {
            ConfidenceLevel::High => 90,
            ConfidenceLevel::Medium => 60,
            ConfidenceLevel::Low => 30,
            ConfidenceLevel::Unknown => 0,
        }
    }

    /// High or medium: enough to stop on a stated root cause.
    pub fn is_decisive(&self) -> bool {
        matches!(self, ConfidenceLevel::High | ConfidenceLevel::Medium)
    }

    fn from_score(score: u8) -> Self {
        match score {
            70..=u8::MAX => ConfidenceLevel::High,
            40..=69 => ConfidenceLevel::Medium,
            _ => ConfidenceLevel::Low,
        }
    }
}

impl std::fmt::Display for ConfidenceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ConfidenceLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "HIGH" => Ok(ConfidenceLevel::High),
            "MEDIUM" => Ok(ConfidenceLevel::Medium),
            "LOW" => Ok(ConfidenceLevel::Low),
            "UNKNOWN" => Ok(ConfidenceLevel::Unknown),
            _ => Err(format!("Unknown confidence level: {}", s)),
        }
    }
}

static EXPLICIT: LazyLock<Regex> = LazyLock::new(|| {
    builtin_regex(r"(?i)confidence(?:[ \t]+level)?[*_]*[ \t]*[:=][ \t]*[*_]*[ \t]*(high|medium|low)\b")
});

static IMPLICIT_HIGH: LazyLock<Regex> = LazyLock::new(|| builtin_regex(r"\bHIGH\b"));

static CONFIDENCE_WORD: LazyLock<Regex> = LazyLock::new(|| builtin_regex(r"(?i)\bconfidence\b"));

static ROOT_CAUSE: LazyLock<Regex> = LazyLock::new(|| {
    builtin_regex(r"(?im)^[ \t>*_\-]*root[ _\-]?cause[*_]*[ \t]*:[*_]*[ \t]*(.+)$")
});

static HYPOTHESIS_LINE: LazyLock<Regex> = LazyLock::new(|| {
    builtin_regex(r"(?im)^[ \t>*_\-]*(?:\d+[.)][ \t]*)?hypothesis(?:[ \t]*#?\d+)?[*_]*[ \t]*:[*_]*[ \t]*(.+)$")
});

/// Confidence level in `text`, explicit marker first.
pub fn extract_confidence(text: &str) -> ConfidenceLevel {
    if let Some(caps) = EXPLICIT.captures(text) {
        if let Some(level) = caps.get(1).and_then(|m| m.as_str().parse().ok()) {
            return level;
        }
    }
    if IMPLICIT_HIGH.is_match(text) && CONFIDENCE_WORD.is_match(text) {
        return ConfidenceLevel::High;
    }
    ConfidenceLevel::Unknown
}

/// Structured facts pulled from one model response.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseMetadata {
    pub confidence: ConfidenceLevel,
    pub score: u8,
    pub root_cause: Option<String>,
    /// The root cause as a confirmed hypothesis, when present
    pub hypotheses: Vec<Hypothesis>,
    /// `Hypothesis:` lines proposed in the response
    pub proposed: Vec<String>,
}

fn clean_line(raw: &str) -> String {
    raw.trim().trim_matches(['*', '_']).trim().to_string()
}

/// Confidence, score, root cause and hypotheses stated in `text`.
pub fn extract_metadata(text: &str) -> ResponseMetadata {
    let confidence = extract_confidence(text);
    let root_cause = ROOT_CAUSE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| clean_line(m.as_str()))
        .filter(|cause| !cause.is_empty());

    let hypotheses = root_cause
        .iter()
        .map(|cause| Hypothesis::confirmed(cause.clone()))
        .collect();

    let proposed = HYPOTHESIS_LINE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|m| clean_line(m.as_str()))
        .filter(|h| !h.is_empty())
        .collect();

    ResponseMetadata {
        confidence,
        score: confidence.score(),
        root_cause,
        hypotheses,
        proposed,
    }
}

/// Confidence assessment recomputed each iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceAssessment {
    pub level: ConfidenceLevel,
    pub score: u8,
    pub factors: Vec<String>,
    pub explanation: String,
}

/// Assess confidence from the latest response and the evidence gathered.
///
/// An explicit level in `text` sets the level and score. Otherwise the score
/// is derived from confirmed hypotheses, useful results and the failure ratio.
pub fn assess(state: &InvestigationState, text: &str) -> ConfidenceAssessment {
    let metadata = extract_metadata(text);
    let confirmed = state.hypotheses_with(HypothesisStatus::Confirmed).len();
    let useful = state.useful_results();
    let executed = state.executed_results();
    let failed = state.failed_results();

    let mut factors = Vec::new();
    if confirmed > 0 {
        factors.push(format!("{} confirmed hypothesis(es)", confirmed));
    }
    if useful > 0 {
        factors.push(format!("{} useful tool result(s)", useful));
    }
    let failure_ratio = if executed == 0 {
        0.0
    } else {
        failed as f64 / executed as f64
    };
    if failed > 0 {
        factors.push(format!("{} of {} tool call(s) failed", failed, executed));
    }
    if metadata.root_cause.is_some() {
        factors.push("root cause stated".to_string());
    }

    let (level, score) = if metadata.confidence != ConfidenceLevel::Unknown {
        factors.insert(0, format!("explicit confidence marker: {}", metadata.confidence));
        (metadata.confidence, metadata.confidence.score())
    } else {
        let mut score = 20i32;
        score += confirmed.min(2) as i32 * 25;
        score += useful.min(5) as i32 * 5;
        score -= (failure_ratio * 20.0).round() as i32;
        if metadata.root_cause.is_some() {
            score += 10;
        }
        let score = score.clamp(0, 100) as u8;
        (ConfidenceLevel::from_score(score), score)
    };

    let explanation = if factors.is_empty() {
        format!("{} confidence ({}/100): no supporting evidence yet", level, score)
    } else {
        format!("{} confidence ({}/100): {}", level, score, factors.join("; "))
    };

    ConfidenceAssessment {
        level,
        score,
        factors,
        explanation,
    }
}
