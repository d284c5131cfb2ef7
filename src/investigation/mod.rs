//! Investigation control plane.
//!
//! Pure analysers (intent classification, command extraction, confidence,
//! evidence rules, history compression), the per-tool circuit breakers, the
//! investigation state machine, and the [`Investigator`] loop that composes
//! them over an [`crate::llm::LlmOracle`] and a [`ToolRunner`].

mod circuit_breaker;
mod classifier;
mod compressor;
mod confidence;
mod evidence;
mod extractor;
mod investigator;
mod prompts;
mod state;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreakerRegistry, CircuitState, ExecutionGate};
pub use classifier::{classify_request, RequestKind};
pub use compressor::{CompressedHistory, CompressedResult, HistoryCompressor};
pub use confidence::{
    assess, extract_confidence, extract_metadata, ConfidenceAssessment, ConfidenceLevel,
    ResponseMetadata,
};
pub use evidence::{EvidenceRules, ToolOutcome, ToolStatus};
pub use extractor::{extract_commands, CommandExtractor, ExtractedCommand, Grammar, KUBECTL_TOOL};
pub use investigator::{Investigator, ToolRunner};
pub use prompts::{CONCLUDE_PROMPT, DIRECT_ANSWER_PROMPT, INVESTIGATION_PROMPT};
pub use state::{
    resource_kind, BudgetBonus, Conclusion, Hypothesis, HypothesisStatus, InvestigationPhase,
    InvestigationReport, InvestigationState, InvestigationStateMachine, IterationVerdict,
    TerminationReason,
};

use regex::Regex;

/// Compile a pattern that ships with the crate.
///
/// # Panics
///
/// Panics if `pattern` is invalid. Every caller passes a literal covered by
/// the unit tests.
pub(crate) fn builtin_regex(pattern: &str) -> Regex {
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid built-in pattern {pattern:?}: {e}"))
}
