//! Investigation aggregate: phases, iteration budget, hypotheses and
//! productivity tracking.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use super::classifier::RequestKind;
use super::confidence::ConfidenceAssessment;
use super::evidence::{ToolOutcome, ToolStatus};
use super::extractor::{ExtractedCommand, KUBECTL_TOOL};
use crate::config::InvestigationConfig;

/// Ordered investigation phases. Never regresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationPhase {
    Initializing,
    Gathering,
    Investigating,
    Confirming,
    Concluding,
}

impl InvestigationPhase {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestigationPhase::Initializing => "initializing",
            InvestigationPhase::Gathering => "gathering",
            InvestigationPhase::Investigating => "investigating",
            InvestigationPhase::Confirming => "confirming",
            InvestigationPhase::Concluding => "concluding",
        }
    }
}

impl std::fmt::Display for InvestigationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lifecycle of a hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypothesisStatus {
    Investigating,
    Confirmed,
    Refuted,
    Inconclusive,
}

/// Candidate explanation tracked across iterations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub likelihood: Option<f32>,
    pub evidence_for: Vec<String>,
    pub evidence_against: Vec<String>,
    /// Union of supporting and refuting evidence, in arrival order
    pub evidence: Vec<String>,
    pub tools_to_validate: Vec<String>,
    pub status: HypothesisStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Hypothesis {
    /// New hypothesis under investigation.
    pub fn new(description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            likelihood: None,
            evidence_for: Vec::new(),
            evidence_against: Vec::new(),
            evidence: Vec::new(),
            tools_to_validate: Vec::new(),
            status: HypothesisStatus::Investigating,
            created_at: now,
            updated_at: now,
        }
    }

    /// Hypothesis recorded directly as confirmed.
    pub fn confirmed(description: impl Into<String>) -> Self {
        let mut hypothesis = Self::new(description);
        hypothesis.status = HypothesisStatus::Confirmed;
        hypothesis
    }

    /// Set likelihood, clamped to 0..=1.
    pub fn with_likelihood(mut self, likelihood: f32) -> Self {
        self.likelihood = Some(likelihood.clamp(0.0, 1.0));
        self
    }

    /// Set the tools that would validate this hypothesis.
    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools_to_validate = tools;
        self
    }

    fn add_evidence(&mut self, evidence: &str, supports: bool) {
        if supports {
            self.evidence_for.push(evidence.to_string());
        } else {
            self.evidence_against.push(evidence.to_string());
        }
        self.evidence.push(evidence.to_string());
        self.updated_at = Utc::now();
    }
}

/// Reasons the iteration budget grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetBonus {
    NewHypothesis,
    PartialEvidence,
    NewResourceType,
}

impl BudgetBonus {
    /// Iterations earned.
    pub fn amount(&self) -> u32 {
        match self {
            BudgetBonus::NewHypothesis => 2,
            BudgetBonus::PartialEvidence => 1,
            BudgetBonus::NewResourceType => 1,
        }
    }
}

/// Why an investigation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Root cause stated with high or medium confidence
    RootCauseFound,
    /// Oracle answered without requesting tools
    FinalAnswer,
    /// Iteration budget used up
    BudgetExhausted,
    /// Too many consecutive unproductive iterations
    Unproductive,
    /// Total investigation timeout
    TimedOut,
    /// Casual or knowledge request answered in one call
    DirectAnswer,
    /// The oracle could not be reached
    OracleFailed,
}

impl TerminationReason {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::RootCauseFound => "root_cause_found",
            TerminationReason::FinalAnswer => "final_answer",
            TerminationReason::BudgetExhausted => "budget_exhausted",
            TerminationReason::Unproductive => "unproductive",
            TerminationReason::TimedOut => "timed_out",
            TerminationReason::DirectAnswer => "direct_answer",
            TerminationReason::OracleFailed => "oracle_failed",
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of closing an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationVerdict {
    Productive { useful: usize },
    Unproductive { consecutive: u32 },
    /// Unproductive limit reached
    ForceConclude,
}

/// The aggregate root of one investigation.
#[derive(Debug, Clone, Serialize)]
pub struct InvestigationState {
    pub id: String,
    pub query: String,
    pub started_at: DateTime<Utc>,
    pub iteration: u32,
    pub max_iterations: u32,
    pub tool_history: Vec<ToolOutcome>,
    pub hypotheses: Vec<Hypothesis>,
    pub consecutive_unproductive: u32,
    pub unproductive_iterations: u32,
    pub failed_tools: HashMap<String, u32>,
    pub executed_signatures: HashSet<String>,
    pub scratchpad_notes: Vec<String>,
    pub phase: InvestigationPhase,
    pub detected_symptoms: Vec<String>,
    pub plan: Option<String>,
    pub investigated_resources: HashSet<String>,
}

impl InvestigationState {
    /// Hypotheses with the given status.
    pub fn hypotheses_with(&self, status: HypothesisStatus) -> Vec<&Hypothesis> {
        self.hypotheses.iter().filter(|h| h.status == status).collect()
    }

    /// Number of useful results collected so far.
    pub fn useful_results(&self) -> usize {
        self.tool_history.iter().filter(|o| o.useful).count()
    }

    /// Number of executed calls that failed.
    pub fn failed_results(&self) -> usize {
        self.tool_history.iter().filter(|o| o.is_error()).count()
    }

    /// Number of calls that actually ran.
    pub fn executed_results(&self) -> usize {
        self.tool_history.iter().filter(|o| o.was_executed()).count()
    }
}

/// Everything the orchestrator decides at the end of a run.
#[derive(Debug, Clone)]
pub struct Conclusion {
    pub kind: RequestKind,
    pub assessment: ConfidenceAssessment,
    pub root_cause: Option<String>,
    pub termination: TerminationReason,
    pub answer: String,
}

/// Final record of a concluded investigation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationReport {
    pub id: String,
    pub query: String,
    pub kind: RequestKind,
    pub started_at: DateTime<Utc>,
    pub concluded_at: DateTime<Utc>,
    pub total_iterations: u32,
    pub max_iterations: u32,
    pub tool_history: Vec<ToolOutcome>,
    pub confirmed_hypotheses: Vec<Hypothesis>,
    pub refuted_hypotheses: Vec<Hypothesis>,
    pub assessment: ConfidenceAssessment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
    pub termination: TerminationReason,
    pub answer: String,
}

/// Single owner of an [`InvestigationState`].
#[derive(Debug)]
pub struct InvestigationStateMachine {
    state: InvestigationState,
    config: InvestigationConfig,
    iteration_start: usize,
}

impl InvestigationStateMachine {
    /// Start a fresh investigation of `query`.
    pub fn new(query: impl Into<String>, config: InvestigationConfig) -> Self {
        let state = InvestigationState {
            id: Uuid::new_v4().to_string(),
            query: query.into(),
            started_at: Utc::now(),
            iteration: 0,
            max_iterations: config.base_iterations.min(config.max_iterations),
            tool_history: Vec::new(),
            hypotheses: Vec::new(),
            consecutive_unproductive: 0,
            unproductive_iterations: 0,
            failed_tools: HashMap::new(),
            executed_signatures: HashSet::new(),
            scratchpad_notes: Vec::new(),
            phase: InvestigationPhase::Initializing,
            detected_symptoms: Vec::new(),
            plan: None,
            investigated_resources: HashSet::new(),
        };
        debug!(investigation_id = %state.id, budget = state.max_iterations, "Investigation created");

        Self {
            state,
            config,
            iteration_start: 0,
        }
    }

    /// Read-only view of the aggregate.
    pub fn state(&self) -> &InvestigationState {
        &self.state
    }

    /// Current phase.
    pub fn phase(&self) -> InvestigationPhase {
        self.state.phase
    }

    /// Move forward to `phase`. Returns false (and changes nothing) for a regression.
    pub fn advance_to(&mut self, phase: InvestigationPhase) -> bool {
        if phase < self.state.phase {
            debug!(from = %self.state.phase, to = %phase, "Ignoring phase regression");
            return false;
        }
        if phase != self.state.phase {
            debug!(from = %self.state.phase, to = %phase, "Investigation phase advanced");
            self.state.phase = phase;
        }
        true
    }

    /// Iterations left in the current budget.
    pub fn budget_remaining(&self) -> u32 {
        self.state.max_iterations.saturating_sub(self.state.iteration)
    }

    /// Start the next iteration, or `None` when the budget is spent.
    pub fn begin_iteration(&mut self) -> Option<u32> {
        if self.budget_remaining() == 0 {
            return None;
        }
        self.state.iteration += 1;
        self.iteration_start = self.state.tool_history.len();
        self.advance_to(InvestigationPhase::Gathering);
        Some(self.state.iteration)
    }

    /// Grow the budget, never past the configured cap. Returns the new budget.
    pub fn earn(&mut self, bonus: BudgetBonus) -> u32 {
        let before = self.state.max_iterations;
        self.state.max_iterations = (before + bonus.amount()).min(self.config.max_iterations);
        if self.state.max_iterations != before {
            debug!(?bonus, budget = self.state.max_iterations, "Iteration budget extended");
        }
        self.state.max_iterations
    }

    /// Reserve `command` for execution. False if the same signature already ran.
    pub fn claim_execution(&mut self, command: &ExtractedCommand) -> bool {
        self.state.executed_signatures.insert(command.signature())
    }

    /// Append an outcome to the history and credit any bonus it earns.
    pub fn record_outcome(&mut self, outcome: ToolOutcome) {
        if outcome.is_error() {
            *self.state.failed_tools.entry(outcome.tool.clone()).or_insert(0) += 1;
        }
        if outcome.status == ToolStatus::Partial {
            self.earn(BudgetBonus::PartialEvidence);
        }
        if outcome.was_executed() {
            if let Some(kind) = resource_kind(&outcome.tool, &outcome.args) {
                let first = self.state.investigated_resources.is_empty();
                if self.state.investigated_resources.insert(kind) && !first {
                    self.earn(BudgetBonus::NewResourceType);
                }
            }
        }
        self.state.tool_history.push(outcome);
    }

    /// Close the current iteration and update productivity counters.
    pub fn finish_iteration(&mut self) -> IterationVerdict {
        let useful = self.state.tool_history[self.iteration_start..]
            .iter()
            .filter(|o| o.useful)
            .count();

        if useful >= self.config.min_useful_results {
            self.state.consecutive_unproductive = 0;
            return IterationVerdict::Productive { useful };
        }

        self.state.consecutive_unproductive += 1;
        self.state.unproductive_iterations += 1;
        debug!(
            iteration = self.state.iteration,
            useful,
            consecutive = self.state.consecutive_unproductive,
            "Unproductive iteration"
        );
        if self.state.consecutive_unproductive >= self.config.unproductive_limit {
            IterationVerdict::ForceConclude
        } else {
            IterationVerdict::Unproductive {
                consecutive: self.state.consecutive_unproductive,
            }
        }
    }

    /// Termination signal from budget or productivity, if any.
    pub fn should_conclude(&self) -> Option<TerminationReason> {
        if self.state.consecutive_unproductive >= self.config.unproductive_limit {
            Some(TerminationReason::Unproductive)
        } else if self.budget_remaining() == 0 {
            Some(TerminationReason::BudgetExhausted)
        } else {
            None
        }
    }

    /// Track a hypothesis. A repeated description returns the existing id.
    pub fn propose_hypothesis(&mut self, hypothesis: Hypothesis) -> String {
        let key = hypothesis.description.trim().to_lowercase();
        if let Some(existing) = self
            .state
            .hypotheses
            .iter()
            .find(|h| h.description.trim().to_lowercase() == key)
        {
            return existing.id.clone();
        }

        let id = hypothesis.id.clone();
        info!(hypothesis = %hypothesis.description, "New hypothesis");
        self.state.hypotheses.push(hypothesis);
        self.earn(BudgetBonus::NewHypothesis);
        self.advance_to(InvestigationPhase::Investigating);
        id
    }

    /// Attach evidence to a hypothesis. Supporting evidence for an open
    /// hypothesis counts as partial evidence.
    pub fn attach_evidence(&mut self, hypothesis_id: &str, evidence: &str, supports: bool) -> bool {
        let Some(hypothesis) = self.hypothesis_mut(hypothesis_id) else {
            return false;
        };
        let open = hypothesis.status == HypothesisStatus::Investigating;
        hypothesis.add_evidence(evidence, supports);
        if supports && open {
            self.earn(BudgetBonus::PartialEvidence);
        }
        true
    }

    /// Change a hypothesis status.
    pub fn set_hypothesis_status(&mut self, hypothesis_id: &str, status: HypothesisStatus) -> bool {
        let Some(hypothesis) = self.hypothesis_mut(hypothesis_id) else {
            return false;
        };
        hypothesis.status = status;
        hypothesis.updated_at = Utc::now();
        if status == HypothesisStatus::Confirmed {
            self.advance_to(InvestigationPhase::Confirming);
        }
        true
    }

    fn hypothesis_mut(&mut self, hypothesis_id: &str) -> Option<&mut Hypothesis> {
        self.state.hypotheses.iter_mut().find(|h| h.id == hypothesis_id)
    }

    /// Free-form working note.
    pub fn add_note(&mut self, note: impl Into<String>) {
        self.state.scratchpad_notes.push(note.into());
    }

    /// Record a symptom once.
    pub fn add_symptom(&mut self, symptom: impl Into<String>) {
        let symptom = symptom.into();
        if !self.state.detected_symptoms.contains(&symptom) {
            self.state.detected_symptoms.push(symptom);
        }
    }

    /// Set or replace the investigation plan.
    pub fn set_plan(&mut self, plan: impl Into<String>) {
        self.state.plan = Some(plan.into());
    }

    /// Finish the investigation and produce its report.
    pub fn conclude(mut self, conclusion: Conclusion) -> InvestigationReport {
        self.advance_to(InvestigationPhase::Concluding);
        let state = self.state;
        info!(
            investigation_id = %state.id,
            iterations = state.iteration,
            tools = state.tool_history.len(),
            termination = %conclusion.termination,
            confidence = %conclusion.assessment.level,
            "Investigation concluded"
        );

        let (confirmed, rest): (Vec<_>, Vec<_>) = state
            .hypotheses
            .into_iter()
            .partition(|h| h.status == HypothesisStatus::Confirmed);
        let refuted = rest
            .into_iter()
            .filter(|h| h.status == HypothesisStatus::Refuted)
            .collect();

        InvestigationReport {
            id: state.id,
            query: state.query,
            kind: conclusion.kind,
            started_at: state.started_at,
            concluded_at: Utc::now(),
            total_iterations: state.iteration,
            max_iterations: state.max_iterations,
            tool_history: state.tool_history,
            confirmed_hypotheses: confirmed,
            refuted_hypotheses: refuted,
            assessment: conclusion.assessment,
            root_cause: conclusion.root_cause,
            termination: conclusion.termination,
            answer: conclusion.answer,
        }
    }
}

/// kubectl flags whose value is the next word unless written `--flag=value`.
const VALUE_FLAGS: &[&str] = &[
    "-n",
    "--namespace",
    "-l",
    "--selector",
    "-o",
    "--output",
    "-c",
    "--container",
    "-f",
    "--filename",
    "--context",
    "--cluster",
    "--user",
    "--kubeconfig",
    "--field-selector",
    "--sort-by",
];

fn positional_args(args: &str) -> impl Iterator<Item = &str> + '_ {
    let mut words = args.split_whitespace();
    std::iter::from_fn(move || loop {
        let word = words.next()?;
        if !word.starts_with('-') {
            return Some(word);
        }
        if VALUE_FLAGS.contains(&word) {
            words.next();
        }
    })
}

/// Kubernetes resource kind a call inspects, singular and lower-cased.
pub fn resource_kind(tool: &str, args: &str) -> Option<String> {
    if !tool.eq_ignore_ascii_case(KUBECTL_TOOL) {
        return None;
    }

    let mut words = positional_args(args);
    let kind = match words.next()? {
        "logs" | "exec" => "pod",
        "events" => "event",
        "get" | "describe" | "top" | "explain" | "edit" | "delete" => words.next()?,
        _ => return None,
    };

    let kind = kind.split(['/', '.']).next()?.to_lowercase();
    let singular = if let Some(stem) = kind.strip_suffix("sses") {
        format!("{stem}ss")
    } else if kind.ends_with('s') && !kind.ends_with("ss") && kind.len() > 3 {
        kind[..kind.len() - 1].to_string()
    } else {
        kind
    };
    (!singular.is_empty()).then_some(singular)
}
