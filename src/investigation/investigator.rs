//! The investigation loop: oracle turn, command extraction, gated tool
//! execution, hypothesis tracking and termination.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info, warn};

use super::circuit_breaker::{BreakerSnapshot, CircuitBreakerRegistry, ExecutionGate};
use super::classifier::{classify_request, RequestKind};
use super::compressor::HistoryCompressor;
use super::confidence::{assess, extract_metadata};
use super::evidence::{EvidenceRules, ToolOutcome};
use super::extractor::{CommandExtractor, ExtractedCommand};
use super::prompts::{
    tool_results_message, CONCLUDE_PROMPT, DIRECT_ANSWER_PROMPT, INVESTIGATION_PROMPT,
};
use super::state::{
    Conclusion, Hypothesis, HypothesisStatus, InvestigationReport, InvestigationStateMachine,
    IterationVerdict, TerminationReason,
};
use crate::config::{BreakerConfig, CompressionConfig, Config, InvestigationConfig};
use crate::error::{AppError, AppResult, LlmError, LlmResult, ToolError};
use crate::llm::{LlmOracle, Message};
use crate::storage::ReportStore;

/// Executes tool calls against the cluster.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Run `command` and return its raw output.
    async fn run(&self, command: &ExtractedCommand) -> Result<String, ToolError>;
}

/// How one iteration ended.
enum Step {
    Continue,
    Done(TerminationReason),
}

/// Runs investigations over an oracle and a tool runner.
///
/// Breaker state is shared by every investigation this instance runs, so a
/// tool that keeps failing stays gated across user requests.
pub struct Investigator {
    oracle: Arc<dyn LlmOracle>,
    runner: Arc<dyn ToolRunner>,
    store: Option<Arc<dyn ReportStore>>,
    config: InvestigationConfig,
    extractor: CommandExtractor,
    rules: EvidenceRules,
    compressor: HistoryCompressor,
    breakers: Mutex<CircuitBreakerRegistry>,
}

impl Investigator {
    /// Build from explicit settings. Fails on an invalid extra evidence pattern.
    pub fn new(
        config: InvestigationConfig,
        compression: CompressionConfig,
        breaker: BreakerConfig,
        oracle: Arc<dyn LlmOracle>,
        runner: Arc<dyn ToolRunner>,
    ) -> AppResult<Self> {
        let rules =
            EvidenceRules::with_patterns(&config.evidence_patterns).map_err(|e| AppError::Config {
                message: format!("Invalid EVIDENCE_PATTERNS entry: {}", e),
            })?;

        Ok(Self {
            oracle,
            runner,
            store: None,
            extractor: CommandExtractor::new(),
            compressor: HistoryCompressor::new(compression, rules.clone()),
            rules,
            breakers: Mutex::new(CircuitBreakerRegistry::new(breaker)),
            config,
        })
    }

    /// Build from the application config.
    pub fn from_config(
        config: &Config,
        oracle: Arc<dyn LlmOracle>,
        runner: Arc<dyn ToolRunner>,
    ) -> AppResult<Self> {
        Self::new(
            config.investigation.clone(),
            config.compression.clone(),
            config.breaker.clone(),
            oracle,
            runner,
        )
    }

    /// Persist every concluded report to `store`.
    pub fn with_store(mut self, store: Arc<dyn ReportStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Breaker state for `tool`, if it has ever failed.
    pub async fn breaker_snapshot(&self, tool: &str) -> Option<BreakerSnapshot> {
        self.breakers.lock().await.snapshot(tool)
    }

    /// Close every breaker.
    pub async fn reset_breakers(&self) {
        self.breakers.lock().await.reset_all();
    }

    /// Answer or investigate `query` and return the concluded report.
    pub async fn investigate(&self, query: &str) -> InvestigationReport {
        let kind = classify_request(query);
        let mut machine = InvestigationStateMachine::new(query, self.config.clone());
        info!(
            investigation_id = %machine.state().id,
            kind = %kind,
            "Investigation started"
        );

        let (termination, answer) = if kind.needs_investigation() {
            let mut last_response = String::new();
            let deadline = Instant::now() + self.config.total_timeout();
            let driven =
                timeout_at(deadline, self.drive(&mut machine, query, &mut last_response)).await;
            match driven {
                Ok(termination) => (termination, last_response),
                Err(_) => {
                    warn!(
                        timeout_ms = self.config.total_timeout_ms,
                        "Investigation timed out"
                    );
                    (TerminationReason::TimedOut, last_response)
                }
            }
        } else {
            self.direct_answer(query).await
        };

        let report = self.conclude(machine, kind, termination, answer);
        self.persist(&report).await;
        report
    }

    async fn direct_answer(&self, query: &str) -> (TerminationReason, String) {
        let messages = [Message::system(DIRECT_ANSWER_PROMPT), Message::user(query)];
        match self.ask(&messages).await {
            Ok(answer) => (TerminationReason::DirectAnswer, answer),
            Err(e) => (TerminationReason::OracleFailed, unavailable_answer(&e)),
        }
    }

    async fn drive(
        &self,
        machine: &mut InvestigationStateMachine,
        query: &str,
        last_response: &mut String,
    ) -> TerminationReason {
        let termination = loop {
            let Some(iteration) = machine.begin_iteration() else {
                break TerminationReason::BudgetExhausted;
            };
            debug!(iteration, budget = machine.state().max_iterations, "Iteration started");

            let deadline = Instant::now() + self.config.iteration_timeout();
            match timeout_at(deadline, self.iterate(machine, query, last_response)).await {
                Ok(Step::Done(reason)) => return reason,
                Ok(Step::Continue) => {}
                Err(_) => {
                    warn!(iteration, "Iteration timed out");
                    machine.add_note(format!("Iteration {} timed out", iteration));
                }
            }

            if machine.finish_iteration() == IterationVerdict::ForceConclude {
                break TerminationReason::Unproductive;
            }
            if let Some(reason) = machine.should_conclude() {
                break reason;
            }
        };

        self.wrap_up(machine, query, last_response).await;
        termination
    }

    async fn iterate(
        &self,
        machine: &mut InvestigationStateMachine,
        query: &str,
        last_response: &mut String,
    ) -> Step {
        let messages =
            self.build_messages(machine, INVESTIGATION_PROMPT, query, last_response, None);
        let response = match self.ask(&messages).await {
            Ok(response) => response,
            Err(LlmError::Timeout { timeout_ms }) => {
                machine.add_note(format!("Oracle timed out after {}ms", timeout_ms));
                return Step::Continue;
            }
            Err(e) => {
                if last_response.is_empty() {
                    *last_response = unavailable_answer(&e);
                }
                return Step::Done(TerminationReason::OracleFailed);
            }
        };
        *last_response = response.clone();

        let metadata = extract_metadata(&response);
        if machine.state().plan.is_none() {
            if let Some(plan) = first_paragraph(&response) {
                machine.set_plan(plan);
            }
        }
        for description in &metadata.proposed {
            machine.propose_hypothesis(Hypothesis::new(description.clone()));
        }

        if metadata.confidence.is_decisive() {
            if let Some(cause) = &metadata.root_cause {
                let id = machine.propose_hypothesis(Hypothesis::new(cause.clone()));
                machine.set_hypothesis_status(&id, HypothesisStatus::Confirmed);
                return Step::Done(TerminationReason::RootCauseFound);
            }
        }

        let commands = self.extractor.extract(&response);
        if commands.is_empty() {
            return Step::Done(TerminationReason::FinalAnswer);
        }

        let start = machine.state().tool_history.len();
        for command in commands {
            self.execute(machine, command).await;
        }
        self.track_evidence(machine, start);
        Step::Continue
    }

    async fn execute(&self, machine: &mut InvestigationStateMachine, command: ExtractedCommand) {
        if machine.state().executed_signatures.contains(&command.signature()) {
            debug!(command = %command, "Skipping duplicate tool call");
            machine.record_outcome(ToolOutcome::skipped(
                &command,
                "already executed in this investigation",
            ));
            return;
        }

        if let ExecutionGate::Blocked { reason, .. } =
            self.breakers.lock().await.can_execute(&command.tool)
        {
            debug!(command = %command, reason = %reason, "Tool call blocked");
            machine.record_outcome(ToolOutcome::skipped(&command, reason));
            return;
        }

        machine.claim_execution(&command);
        let result = match timeout(self.config.tool_timeout(), self.runner.run(&command)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout {
                tool: command.tool.clone(),
                timeout_ms: self.config.tool_timeout_ms,
            }),
        };

        let outcome = self.rules.classify(&command, result);
        {
            let mut breakers = self.breakers.lock().await;
            if outcome.is_error() {
                breakers.record_failure(&command.tool);
            } else {
                breakers.record_success(&command.tool);
            }
        }
        debug!(
            command = %command,
            status = %outcome.status,
            useful = outcome.useful,
            "Tool call finished"
        );
        machine.record_outcome(outcome);
    }

    /// Record symptoms from this round's useful results and attach them to
    /// the newest open hypothesis.
    fn track_evidence(&self, machine: &mut InvestigationStateMachine, start: usize) {
        let useful: Vec<(String, Option<String>)> = machine.state().tool_history[start..]
            .iter()
            .filter(|o| o.useful)
            .map(|o| {
                let symptom = o
                    .result
                    .lines()
                    .map(str::trim)
                    .find(|line| self.rules.is_error(line))
                    .map(str::to_string);
                (o.label(), symptom)
            })
            .collect();
        if useful.is_empty() {
            return;
        }

        for symptom in useful.iter().filter_map(|(_, s)| s.clone()) {
            machine.add_symptom(symptom);
        }

        let open = machine
            .state()
            .hypotheses_with(HypothesisStatus::Investigating)
            .last()
            .map(|h| h.id.clone());
        if let Some(id) = open {
            let labels: Vec<&str> = useful.iter().map(|(label, _)| label.as_str()).collect();
            machine.attach_evidence(&id, &labels.join(", "), true);
        }
    }

    /// Ask for a final answer once tools are off the table.
    async fn wrap_up(
        &self,
        machine: &mut InvestigationStateMachine,
        query: &str,
        last_response: &mut String,
    ) {
        let messages = self.build_messages(
            machine,
            INVESTIGATION_PROMPT,
            query,
            last_response,
            Some(CONCLUDE_PROMPT),
        );
        match self.ask(&messages).await {
            Ok(answer) => *last_response = answer,
            Err(e) => warn!(error = %e, "Final answer request failed, keeping last response"),
        }
    }

    fn build_messages(
        &self,
        machine: &InvestigationStateMachine,
        system: &str,
        query: &str,
        last_response: &str,
        closing: Option<&str>,
    ) -> Vec<Message> {
        let mut messages = vec![Message::system(system), Message::user(query)];
        let history = &machine.state().tool_history;
        if !last_response.is_empty() {
            messages.push(Message::assistant(last_response));
        }
        if !history.is_empty() {
            let compressed = self.compressor.compress(history);
            messages.push(Message::user(tool_results_message(
                &compressed.text,
                machine.budget_remaining(),
            )));
        }
        if let Some(closing) = closing {
            messages.push(Message::user(closing));
        }
        messages
    }

    async fn ask(&self, messages: &[Message]) -> LlmResult<String> {
        let timeout_ms = self.config.llm_timeout_ms;
        match timeout(self.config.llm_timeout(), self.oracle.complete(messages)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms, "Oracle call timed out");
                Err(LlmError::Timeout { timeout_ms })
            }
        }
    }

    fn conclude(
        &self,
        machine: InvestigationStateMachine,
        kind: RequestKind,
        termination: TerminationReason,
        answer: String,
    ) -> InvestigationReport {
        let assessment = assess(machine.state(), &answer);
        let root_cause = extract_metadata(&answer).root_cause.or_else(|| {
            machine
                .state()
                .hypotheses_with(HypothesisStatus::Confirmed)
                .first()
                .map(|h| h.description.clone())
        });

        machine.conclude(Conclusion {
            kind,
            assessment,
            root_cause,
            termination,
            answer,
        })
    }

    async fn persist(&self, report: &InvestigationReport) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save_report(report).await {
                warn!(report_id = %report.id, error = %e, "Failed to persist report");
            }
        }
    }
}

fn unavailable_answer(error: &LlmError) -> String {
    format!("The assistant is unavailable right now: {}", error)
}

fn first_paragraph(text: &str) -> Option<String> {
    text.split("\n\n")
        .map(str::trim)
        .find(|p| !p.is_empty())
        .map(|p| p.to_string())
}
