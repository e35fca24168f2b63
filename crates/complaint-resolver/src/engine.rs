//! Pipeline Engine — drives one state machine per complaint.
//!
//! ```text
//! submit ──▶ registry (watch::Receiver per workflow)
//!    │
//!    └──▶ tokio task ── semaphore permit ── overall budget ──▶ drive()
//!                                                │
//!            INTAKE → CONTEXT → CLASSIFY → PRIORITIZE → DRAFT ⇄ VALIDATE → ROUTE
//!                                                │
//!                                            finish(): record resolution under the
//!                                            customer lock, flush audit, DONE
//! ```
//!
//! Every transition publishes a fresh [`WorkflowSnapshot`]; `get_status`
//! reads the latest one and `wait` blocks until the workflow has finished.
//! A report is held until it is collected: `wait` hands it out once and
//! drops the workflow from the registry, and `process` does the same on
//! success. A workflow that surfaced a hard failure stays registered for
//! the operator.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, watch, Mutex, RwLock, Semaphore};
use tokio::time::Instant;
use tracing::{error, info, warn};
use triage::{
    decide_route, select_reason, validation_event, AuditEntry, ClassificationResult, Complaint,
    CustomerContext, DraftResponse, EscalationRecord, EscalationSignals, PipelineConfig,
    PipelineError, PipelineEvent, PipelineState, PriorityFactor, PriorityResult, PriorityScorer,
    StageFailurePolicy, ValidationResult, WorkflowSnapshot, WorkflowState,
};

use crate::audit_sink::AuditSink;
use crate::capability::{
    Capabilities, ClassifyRequest, ContextRequest, DraftRequest, PrioritizeRequest, StageSlot,
    ValidateRequest,
};
use crate::invoker::{AttemptLog, Invocation, StageInvoker};
use crate::memory::{ContextLookup, CustomerLocks, MemoryContext, MemoryStore, ResolutionSummary};
use crate::telemetry::{MetricsCollector, WorkflowMetrics};

/// Final report for one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub snapshot: WorkflowSnapshot,
    pub metrics: WorkflowMetrics,
    /// Set when the workflow surfaced a hard failure to the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_failure: Option<String>,
}

struct EngineInner {
    config: PipelineConfig,
    capabilities: Capabilities,
    context: StageSlot<ContextRequest, ContextLookup>,
    memory: Arc<dyn MemoryStore>,
    audit: Arc<dyn AuditSink>,
    invoker: StageInvoker,
    scorer: PriorityScorer,
    permits: Arc<Semaphore>,
    registry: RwLock<HashMap<String, watch::Receiver<WorkflowSnapshot>>>,
    reports: Mutex<HashMap<String, WorkflowReport>>,
    customer_locks: CustomerLocks,
    deferred: Mutex<Vec<ResolutionSummary>>,
}

/// Runs complaint workflows. Cheap to clone; clones share one engine.
#[derive(Clone)]
pub struct PipelineEngine {
    inner: Arc<EngineInner>,
}

impl PipelineEngine {
    pub fn new(
        config: PipelineConfig,
        capabilities: Capabilities,
        memory: Arc<dyn MemoryStore>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let context = StageSlot::new(Arc::new(MemoryContext::new(Arc::clone(&memory))));
        let inner = EngineInner {
            invoker: StageInvoker::new(config.stage_timeout(), config.retry.clone()),
            scorer: PriorityScorer::new(config.scoring.clone()),
            permits: Arc::new(Semaphore::new(config.concurrency_limit)),
            registry: RwLock::new(HashMap::new()),
            reports: Mutex::new(HashMap::new()),
            customer_locks: CustomerLocks::new(),
            deferred: Mutex::new(Vec::new()),
            config,
            capabilities,
            context,
            memory,
            audit,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Start a workflow in the background and return its ID.
    ///
    /// The workflow stays registered until its report is collected with
    /// [`PipelineEngine::wait`].
    pub async fn submit(&self, complaint: Complaint) -> String {
        let (state, status) = self.register(complaint).await;
        let workflow_id = state.workflow_id.clone();
        let inner = Arc::clone(&self.inner);
        let id = workflow_id.clone();
        tokio::spawn(async move {
            if let Err(e) = execute(inner, state, status).await {
                error!(workflow_id = %id, error = %e, "Workflow surfaced a hard failure");
            }
        });
        workflow_id
    }

    /// Run a workflow to completion on the current task.
    ///
    /// Hard failures are returned as errors; the report stays available
    /// through [`PipelineEngine::wait`].
    pub async fn process(&self, complaint: Complaint) -> Result<WorkflowReport, PipelineError> {
        let (state, status) = self.register(complaint).await;
        let workflow_id = state.workflow_id.clone();
        let report = execute(Arc::clone(&self.inner), state, status).await?;
        self.collect(&workflow_id).await;
        Ok(report)
    }

    /// Latest snapshot of a workflow.
    pub async fn get_status(&self, workflow_id: &str) -> Result<WorkflowSnapshot, PipelineError> {
        let registry = self.inner.registry.read().await;
        let rx = registry
            .get(workflow_id)
            .ok_or_else(|| PipelineError::UnknownWorkflow(workflow_id.to_string()))?;
        let snapshot = rx.borrow().clone();
        Ok(snapshot)
    }

    /// Wait until a workflow has finished and return its report.
    pub async fn wait(&self, workflow_id: &str) -> Result<WorkflowReport, PipelineError> {
        let mut rx = self
            .inner
            .registry
            .read()
            .await
            .get(workflow_id)
            .cloned()
            .ok_or_else(|| PipelineError::UnknownWorkflow(workflow_id.to_string()))?;

        let finished = rx.wait_for(|s| s.finished_at.is_some()).await.is_ok();
        if !finished {
            return Err(PipelineError::InvariantViolated(format!(
                "workflow {workflow_id} stopped without finishing"
            )));
        }
        // A concurrent waiter may have collected it first.
        self.collect(workflow_id)
            .await
            .ok_or_else(|| PipelineError::UnknownWorkflow(workflow_id.to_string()))
    }

    /// Resolutions that could not be recorded and await manual reprocessing.
    pub async fn deferred_resolutions(&self) -> Vec<ResolutionSummary> {
        self.inner.deferred.lock().await.clone()
    }

    /// Forget a finished workflow, handing out its report.
    async fn collect(&self, workflow_id: &str) -> Option<WorkflowReport> {
        let report = self.inner.reports.lock().await.remove(workflow_id);
        self.inner.registry.write().await.remove(workflow_id);
        report
    }

    async fn register(&self, complaint: Complaint) -> (WorkflowState, watch::Sender<WorkflowSnapshot>) {
        let workflow_id = uuid::Uuid::new_v4().to_string();
        let state = WorkflowState::new(&workflow_id, complaint, self.inner.config.max_iterations);
        let (tx, rx) = watch::channel(state.snapshot());
        self.inner.registry.write().await.insert(workflow_id, rx);
        (state, tx)
    }
}

async fn execute(
    inner: Arc<EngineInner>,
    state: WorkflowState,
    status: watch::Sender<WorkflowSnapshot>,
) -> Result<WorkflowReport, PipelineError> {
    let _permit = Arc::clone(&inner.permits)
        .acquire_owned()
        .await
        .map_err(|_| PipelineError::InvariantViolated("engine semaphore closed".into()))?;

    info!(
        workflow_id = %state.workflow_id,
        complaint_id = %state.complaint.complaint_id,
        channel = %state.complaint.channel,
        "Workflow started"
    );

    let budget = inner.config.overall_budget();
    let mut run = Run::new(inner, state, status);
    let driven = tokio::time::timeout(budget, run.drive()).await;
    let outcome = match driven {
        Ok(result) => result,
        Err(_) => run.time_out(budget).await,
    };
    let hard = match outcome {
        Ok(()) => None,
        Err(e) => {
            run.fail_hard(&e).await;
            Some(e)
        }
    };
    run.finish(hard).await
}

/// Mutable context of one running workflow.
struct Run {
    inner: Arc<EngineInner>,
    state: WorkflowState,
    status: watch::Sender<WorkflowSnapshot>,
    metrics: MetricsCollector,
    /// Attempt entries streamed by the invoker while a stage runs.
    attempt_log: AttemptLog,
    attempts: mpsc::UnboundedReceiver<AuditEntry>,
    /// Classify attempts made alongside the context fetch; drained after `attempts`.
    side_log: AttemptLog,
    side_attempts: mpsc::UnboundedReceiver<AuditEntry>,
    /// Recorded locally but not yet accepted by the audit sink, oldest first.
    unsent: VecDeque<AuditEntry>,
    sink_warned: bool,
    complaint_fp: String,
}

impl Run {
    fn new(
        inner: Arc<EngineInner>,
        state: WorkflowState,
        status: watch::Sender<WorkflowSnapshot>,
    ) -> Self {
        let complaint_fp = state.complaint_fingerprint();
        let (attempt_log, attempts) = mpsc::unbounded_channel();
        let (side_log, side_attempts) = mpsc::unbounded_channel();
        Self {
            inner,
            state,
            status,
            metrics: MetricsCollector::new(),
            attempt_log,
            attempts,
            side_log,
            side_attempts,
            unsent: VecDeque::new(),
            sink_warned: false,
            complaint_fp,
        }
    }

    async fn drive(&mut self) -> Result<(), PipelineError> {
        self.transition(PipelineEvent::Normalized, None)?;

        let classified = if self.inner.config.concurrent_context {
            self.context_and_classify().await?
        } else {
            let inner = Arc::clone(&self.inner);
            let request = self.context_request();
            let lookup = self
                .invoke("context", &inner.context, request, empty_lookup)
                .await;
            self.apply_context(lookup)?;
            let request = ClassifyRequest {
                complaint: self.state.complaint.clone(),
            };
            let classified = self
                .invoke(
                    "classify",
                    &inner.capabilities.classify,
                    request,
                    ClassificationResult::conservative_default,
                )
                .await;
            classified
        };

        let Some(classification) = self.apply_classification(classified).await? else {
            return Ok(());
        };
        if classification.has_contradictory_signals() {
            return self.bypass_to_route(&classification).await;
        }
        if !self.prioritize(&classification).await? {
            return Ok(());
        }
        if !self.draft_loop(&classification).await? {
            return Ok(());
        }
        self.route().await
    }

    // ── Stages ──────────────────────────────────────────────────────────────

    /// Fetch context while classifying; results are applied in stage order.
    async fn context_and_classify(
        &mut self,
    ) -> Result<Invocation<ClassificationResult>, PipelineError> {
        let inner = Arc::clone(&self.inner);
        let workflow_id = self.state.workflow_id.clone();
        let context_request = self.context_request();
        let classify_request = ClassifyRequest {
            complaint: self.state.complaint.clone(),
        };

        let started = Instant::now();
        let (lookup, classified) = tokio::join!(
            inner.invoker.invoke(
                &workflow_id,
                "context",
                &inner.context,
                context_request,
                empty_lookup,
                &self.attempt_log,
            ),
            inner.invoker.invoke(
                &workflow_id,
                "classify",
                &inner.capabilities.classify,
                classify_request,
                ClassificationResult::conservative_default,
                &self.side_log,
            ),
        );
        let elapsed = started.elapsed();

        self.absorb("context", &lookup, elapsed).await;
        self.apply_context(lookup)?;
        self.drain_side_attempts().await;
        self.absorb("classify", &classified, elapsed).await;
        Ok(classified)
    }

    fn context_request(&self) -> ContextRequest {
        ContextRequest {
            customer_id: self.state.complaint.customer_id.clone(),
            lookback_days: self.inner.config.lookback_days,
            complaint_id: self.state.complaint.complaint_id.clone(),
        }
    }

    fn apply_context(&mut self, lookup: Invocation<ContextLookup>) -> Result<(), PipelineError> {
        let unavailable = lookup.served.is_unavailable();
        let ContextLookup {
            context,
            known_customer,
        } = lookup.served.payload;
        self.state.context = Some(context);

        if unavailable {
            self.state.flags.context_unavailable = true;
            self.state
                .note("Memory store unavailable; continuing with empty customer context");
            self.transition(PipelineEvent::ContextUnavailable, Some("memory store unavailable"))?;
        } else {
            if !known_customer {
                self.state.note("Unknown customer; using empty context");
            }
            self.transition(PipelineEvent::ContextLoaded, None)?;
        }
        Ok(())
    }

    /// Record the classification. `None` means the workflow failed.
    async fn apply_classification(
        &mut self,
        classified: Invocation<ClassificationResult>,
    ) -> Result<Option<ClassificationResult>, PipelineError> {
        if self.must_fail("classify", &classified) {
            self.fail_stage("classify", &classified).await?;
            return Ok(None);
        }
        let classification = classified.served.payload;
        self.state.classification = Some(classification.clone());

        if classification.has_contradictory_signals() {
            let detail = format!(
                "{} sentiment with legal/chargeback threat ({:?})",
                classification.sentiment, classification.intent
            );
            let err = PipelineError::ContradictorySignals(detail);
            warn!(workflow_id = %self.state.workflow_id, "{err}");
            self.state.flags.contradictory_signals = true;
            self.state.flags.requires_human_review = true;
            self.state.note(err.to_string());
            self.transition(PipelineEvent::ContradictorySignals, Some(&err.to_string()))?;
        } else if classification.confidence < self.inner.config.confidence_threshold {
            let err = PipelineError::LowConfidence {
                confidence: classification.confidence,
                threshold: self.inner.config.confidence_threshold,
            };
            self.state.flags.low_confidence = true;
            self.state.flags.requires_human_review = true;
            self.state.note(err.to_string());
            self.transition(PipelineEvent::LowConfidence, Some(&err.to_string()))?;
        } else {
            self.transition(PipelineEvent::Classified, None)?;
        }
        Ok(Some(classification))
    }

    /// Contradictory signals skip the automated stages. The priority is still
    /// scored locally so the SLA and the resolution summary carry one.
    async fn bypass_to_route(
        &mut self,
        classification: &ClassificationResult,
    ) -> Result<(), PipelineError> {
        let context = self.state.context.clone().unwrap_or_default();
        let priority = self.inner.scorer.score(classification, &context);
        let entry = AuditEntry::decision(
            &self.state.workflow_id,
            "prioritize",
            &self.complaint_fp,
            format!("scored locally at {}; automated stages bypassed", priority.score),
        )
        .with_detail(json!({ "rationale": priority.rationale }));
        self.state.assign_priority(priority, &self.inner.config.sla)?;
        self.audit(entry).await;
        self.route().await
    }

    /// Returns `false` when the workflow failed.
    async fn prioritize(&mut self, classification: &ClassificationResult) -> Result<bool, PipelineError> {
        let inner = Arc::clone(&self.inner);
        let context = self.state.context.clone().unwrap_or_default();
        let request = PrioritizeRequest {
            classification: classification.clone(),
            context: context.clone(),
        };
        let floor = inner.config.priority_floor;
        let prioritized = self
            .invoke("prioritize", &inner.capabilities.prioritize, request, move || {
                PriorityResult::fallback_floor(floor)
            })
            .await;
        if self.must_fail("prioritize", &prioritized) {
            self.fail_stage("prioritize", &prioritized).await?;
            return Ok(false);
        }

        let mut priority = prioritized.served.payload;
        if !priority.is_in_range() {
            let err = PipelineError::PriorityOutOfRange(priority.score);
            warn!(workflow_id = %self.state.workflow_id, "{err}; rescoring with rules");
            self.state.flags.mark_degraded("prioritize");
            self.state.note(format!("{err}; rescored with rule-based scorer"));
            priority = inner.scorer.score(classification, &context);
        }
        if priority.score >= 4 {
            self.state.flags.requires_human_review = true;
            self.state
                .note(format!("Priority {} requires human review", priority.score));
        }
        self.state.assign_priority(priority, &inner.config.sla)?;
        self.transition(PipelineEvent::Prioritized, None)?;
        Ok(true)
    }

    /// Draft ⇄ validate until approval or exhaustion. Returns `false` when
    /// the workflow failed.
    async fn draft_loop(&mut self, classification: &ClassificationResult) -> Result<bool, PipelineError> {
        let inner = Arc::clone(&self.inner);
        let context = self.state.context.clone().unwrap_or_default();
        let mut feedback: Option<String> = None;

        loop {
            let iteration = self.state.begin_draft()?;
            let priority = self.current_priority()?;
            let request = DraftRequest {
                complaint: self.state.complaint.clone(),
                classification: classification.clone(),
                context: context.clone(),
                priority,
                feedback: feedback.take(),
                iteration,
            };
            let drafted = self
                .invoke("draft", &inner.capabilities.draft, request, move || {
                    DraftResponse::generic_template(iteration)
                })
                .await;
            if self.must_fail("draft", &drafted) {
                self.fail_stage("draft", &drafted).await?;
                return Ok(false);
            }
            let mut draft = drafted.served.payload;
            draft.iteration = iteration;
            self.state.draft = Some(draft.clone());
            self.transition(PipelineEvent::Drafted, None)?;

            let request = ValidateRequest {
                complaint: self.state.complaint.clone(),
                classification: classification.clone(),
                draft,
            };
            let validated = self
                .invoke(
                    "validate",
                    &inner.capabilities.validate,
                    request,
                    ValidationResult::send_to_human,
                )
                .await;
            if validated.served.is_unavailable() {
                if self.must_fail("validate", &validated) {
                    self.fail_stage("validate", &validated).await?;
                    return Ok(false);
                }
                self.state.validation = Some(validated.served.payload);
                self.state.flags.requires_human_review = true;
                self.state.note("Validator unavailable; draft sent to human review");
                self.transition(PipelineEvent::LoopExhausted, Some("validator unavailable"))?;
                return Ok(true);
            }

            let validation = validated.served.payload;
            self.state.validation = Some(validation.clone());
            let max = self.state.max_iterations;
            match validation_event(validation.approved, iteration, max) {
                PipelineEvent::Approved => {
                    self.transition(PipelineEvent::Approved, None)?;
                    return Ok(true);
                }
                PipelineEvent::Rejected => {
                    let previous = self.current_priority()?;
                    let reevaluated = inner.scorer.reevaluate(&previous, classification, &context);
                    if reevaluated.score > previous.score {
                        self.state.note(format!(
                            "Priority raised from {} to {} after rejected draft {iteration}",
                            previous.score, reevaluated.score
                        ));
                        if reevaluated.score >= 4 {
                            self.state.flags.requires_human_review = true;
                        }
                    }
                    self.state.assign_priority(reevaluated, &inner.config.sla)?;

                    let reason = validation
                        .feedback
                        .clone()
                        .unwrap_or_else(|| validation.issues.join("; "));
                    self.transition(PipelineEvent::Rejected, Some(&reason))?;
                    feedback = Some(reason);
                }
                PipelineEvent::LoopExhausted => {
                    let err = PipelineError::ValidationLoopExhausted(iteration);
                    warn!(workflow_id = %self.state.workflow_id, drafts = iteration, "{err}");
                    self.state.flags.loop_exhausted = true;
                    self.state.flags.requires_human_review = true;
                    let previous = self.current_priority()?;
                    let bumped = PriorityScorer::bump(
                        &previous,
                        PriorityFactor::ValidationLoopExhausted,
                        "unresolved draft quality",
                    );
                    self.state.assign_priority(bumped, &inner.config.sla)?;
                    self.state.note(err.to_string());
                    self.transition(PipelineEvent::LoopExhausted, Some(&err.to_string()))?;
                    return Ok(true);
                }
                other => {
                    return Err(PipelineError::InvariantViolated(format!(
                        "unexpected validation event {other}"
                    )));
                }
            }
        }
    }

    async fn route(&mut self) -> Result<(), PipelineError> {
        let classification = self
            .state
            .classification
            .clone()
            .unwrap_or_else(ClassificationResult::conservative_default);
        let score = self.current_priority()?.score;
        let flags = &self.state.flags;
        let signals = EscalationSignals {
            contradictory: flags.contradictory_signals,
            priority_score: score,
            classification_confidence: classification.confidence,
            low_confidence: flags.low_confidence,
            loop_exhausted: flags.loop_exhausted,
            drafts: self.state.iteration_count,
        };
        let reason = select_reason(&signals, &classification);
        let decision = decide_route(score, flags.requires_human_review, reason.as_ref());

        let why = match &reason {
            Some(reason) => reason.to_string(),
            None if decision.terminal == PipelineState::AutoSent => "approved".to_string(),
            None => "requires human review".to_string(),
        };
        if let Some(reason) = reason {
            let record = EscalationRecord::new(reason, &classification);
            if decision.terminal == PipelineState::Escalated {
                self.state.flags.escalated = true;
            }
            self.state.note(format!(
                "Escalation reason: {}; team {}, handler {}",
                record.reason, record.assigned_team, record.handler
            ));
            self.state.escalation = Some(record);
        }

        let mut detail = json!({
            "terminal": decision.terminal,
            "priority": score,
            "requires_human_review": self.state.flags.requires_human_review,
            "escalation": self.state.escalation,
            "sla_deadline": self.state.sla.as_ref().map(|s| s.deadline),
        });
        if self.state.flags.contradictory_signals {
            detail["context_dump"] = json!({
                "complaint": self.state.complaint,
                "context": self.state.context,
                "classification": self.state.classification,
                "priority": self.state.priority,
            });
        }

        let verdict = format!("route to {}: {why}", decision.terminal);
        self.state.note(verdict.clone());
        self.transition(decision.event, Some(&why))?;
        let entry = AuditEntry::decision(&self.state.workflow_id, "route", &self.complaint_fp, verdict)
            .with_detail(detail);
        self.audit(entry).await;

        info!(
            workflow_id = %self.state.workflow_id,
            state = %decision.terminal,
            priority = score,
            drafts = self.state.iteration_count,
            "Workflow routed"
        );
        Ok(())
    }

    // ── Failure paths ───────────────────────────────────────────────────────

    fn must_fail<T>(&self, stage: &str, invocation: &Invocation<T>) -> bool {
        let policies = &self.inner.config.stage_policies;
        let policy = match stage {
            "classify" => policies.classify,
            "prioritize" => policies.prioritize,
            "draft" => policies.draft,
            "validate" => policies.validate,
            _ => StageFailurePolicy::Fallback,
        };
        policy == StageFailurePolicy::FailWorkflow && invocation.served.is_unavailable()
    }

    async fn fail_stage<T>(&mut self, stage: &str, invocation: &Invocation<T>) -> Result<(), PipelineError> {
        let reason = match invocation.last_error.clone() {
            Some(last_error) => PipelineError::TransientProviderError {
                stage: stage.to_string(),
                attempts: invocation.attempts,
                last_error,
            }
            .to_string(),
            None => format!("{stage} capabilities exhausted"),
        };
        warn!(workflow_id = %self.state.workflow_id, stage, "Stage exhausted under fail-workflow policy: {reason}");
        self.state.flags.manual_processing = true;
        self.state.note(format!("{reason}; manual processing required"));
        self.transition(PipelineEvent::StageExhausted, Some(&reason))?;
        let entry = AuditEntry::decision(
            &self.state.workflow_id,
            "route",
            &self.complaint_fp,
            "FAILED: manual processing",
        )
        .with_error(reason)
        .with_detail(json!({
            "failed_stage": stage,
            "warnings": invocation.served.warnings,
        }));
        self.audit(entry).await;
        Ok(())
    }

    /// Overall budget expired: force review, keeping whatever state exists.
    async fn time_out(&mut self, budget: Duration) -> Result<(), PipelineError> {
        // Attempts the interrupted stage finished before the budget ran out.
        self.drain_interrupted().await;
        let from = self.state.state();
        if from.is_settled() {
            return Ok(());
        }
        let err = PipelineError::OverallTimeout(budget.as_millis() as u64);
        warn!(workflow_id = %self.state.workflow_id, state = %from, "{err}");
        self.state.flags.timed_out = true;
        self.state.flags.requires_human_review = true;
        self.state.note(err.to_string());
        self.transition(PipelineEvent::OverallTimeout, Some(&err.to_string()))?;
        let entry = AuditEntry::decision(
            &self.state.workflow_id,
            "route",
            &self.complaint_fp,
            format!("forced to {}", PipelineState::QueuedForReview),
        )
        .with_error(err.to_string())
        .with_detail(json!({
            "interrupted_state": from,
            "drafts": self.state.iteration_count,
            "budget_ms": budget.as_millis() as u64,
        }));
        self.audit(entry).await;
        Ok(())
    }

    async fn fail_hard(&mut self, err: &PipelineError) {
        self.drain_interrupted().await;
        error!(workflow_id = %self.state.workflow_id, state = %self.state.state(), "Workflow failed: {err}");
        self.state.flags.manual_processing = true;
        self.state.note(format!("{err}; manual processing required"));
        if !self.state.state().is_settled() {
            if let Err(e) = self.transition(PipelineEvent::InvariantViolated, Some(&err.to_string())) {
                error!(workflow_id = %self.state.workflow_id, "Could not mark workflow failed: {e}");
            }
        }
        let entry = AuditEntry::decision(
            &self.state.workflow_id,
            "route",
            &self.complaint_fp,
            "FAILED: engine invariant",
        )
        .with_error(err.to_string());
        self.audit(entry).await;
    }

    // ── Post-processing ─────────────────────────────────────────────────────

    async fn finish(mut self, mut hard: Option<PipelineError>) -> Result<WorkflowReport, PipelineError> {
        match self.record_resolution().await {
            Ok(()) => {
                if let Err(e) = self.transition(PipelineEvent::Finalized, None) {
                    hard.get_or_insert(e);
                }
            }
            Err(e) => {
                hard.get_or_insert(e);
            }
        }

        if !self.flush_audit().await {
            let kept = self.unsent.len();
            warn!(workflow_id = %self.state.workflow_id, kept, "Audit sink unavailable; entries retained in workflow trail");
            self.state
                .note(format!("Audit sink unavailable; {kept} entries retained in workflow trail"));
        }

        self.state.finished_at = Some(chrono::Utc::now());
        let metrics = self.metrics.finalize(&self.state);
        let snapshot = self.state.snapshot();
        let report = WorkflowReport {
            snapshot: snapshot.clone(),
            metrics,
            hard_failure: hard.as_ref().map(ToString::to_string),
        };
        self.inner
            .reports
            .lock()
            .await
            .insert(self.state.workflow_id.clone(), report.clone());
        self.status.send_replace(snapshot);

        info!(
            workflow_id = %self.state.workflow_id,
            outcome = ?self.state.outcome(),
            "{}",
            self.state.machine().summary()
        );

        match hard {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    /// Record the resolution under the customer lock, retrying with the
    /// stage retry policy. On failure the summary joins the deferred queue.
    async fn record_resolution(&mut self) -> Result<(), PipelineError> {
        let summary = ResolutionSummary::from_snapshot(&self.state.snapshot());
        let customer_id = self.state.complaint.customer_id.clone();
        let retry = self.inner.config.retry.clone();
        let inner = Arc::clone(&self.inner);
        let _guard = inner.customer_locks.lock(&customer_id).await;

        let mut retries = 0;
        loop {
            match self
                .inner
                .memory
                .record_resolution(&customer_id, summary.clone())
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if retry.should_retry(retries) => {
                    retries += 1;
                    let backoff = retry.backoff_duration(retries);
                    warn!(
                        workflow_id = %self.state.workflow_id,
                        attempt = retries,
                        backoff_ms = backoff.as_millis() as u64,
                        "Recording resolution failed, retrying: {e}"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    let err = PipelineError::PersistenceFailure {
                        workflow_id: self.state.workflow_id.clone(),
                        message: e.to_string(),
                    };
                    warn!(workflow_id = %self.state.workflow_id, "{err}; resolution deferred");
                    self.state.flags.persistence_deferred = true;
                    self.state.note(format!("{err}; resolution deferred for manual reprocessing"));
                    let entry = AuditEntry::decision(
                        &self.state.workflow_id,
                        "finalize",
                        &self.complaint_fp,
                        "resolution deferred",
                    )
                    .with_error(e.to_string());
                    self.audit(entry).await;
                    self.inner.deferred.lock().await.push(summary);
                    return Err(err);
                }
            }
        }
    }

    // ── Plumbing ────────────────────────────────────────────────────────────

    fn current_priority(&self) -> Result<PriorityResult, PipelineError> {
        self.state
            .priority
            .clone()
            .ok_or_else(|| PipelineError::InvariantViolated("no priority assigned".into()))
    }

    fn transition(&mut self, event: PipelineEvent, reason: Option<&str>) -> Result<PipelineState, PipelineError> {
        let to = self.state.apply(event, reason)?;
        self.status.send_replace(self.state.snapshot());
        Ok(to)
    }

    async fn invoke<Req, Out>(
        &mut self,
        stage: &str,
        slot: &StageSlot<Req, Out>,
        request: Req,
        default: impl FnOnce() -> Out + Send,
    ) -> Invocation<Out>
    where
        Req: Clone + Serialize + Send + Sync + 'static,
        Out: Serialize + serde::de::DeserializeOwned + Send + 'static,
    {
        let started = Instant::now();
        let invocation = self
            .inner
            .invoker
            .invoke(
                &self.state.workflow_id,
                stage,
                slot,
                request,
                default,
                &self.attempt_log,
            )
            .await;
        self.absorb(stage, &invocation, started.elapsed()).await;
        invocation
    }

    /// Fold an invocation's metrics and degradation into the run, and its
    /// attempt entries into the trail.
    async fn absorb<T>(&mut self, stage: &str, invocation: &Invocation<T>, elapsed: Duration) {
        self.metrics.record_stage(stage, invocation, elapsed);
        if invocation.served.is_degraded() {
            self.state.flags.mark_degraded(stage);
        }
        self.drain_attempts().await;
    }

    /// Move streamed attempt entries into the trail.
    async fn drain_attempts(&mut self) {
        while let Ok(entry) = self.attempts.try_recv() {
            self.audit(entry).await;
        }
    }

    async fn drain_side_attempts(&mut self) {
        while let Ok(entry) = self.side_attempts.try_recv() {
            self.audit(entry).await;
        }
    }

    /// Keep whatever an unfinished stage already streamed, main log first.
    async fn drain_interrupted(&mut self) {
        self.drain_attempts().await;
        self.drain_side_attempts().await;
    }

    async fn audit(&mut self, entry: AuditEntry) {
        let recorded = self.state.record_audit(entry).clone();
        self.unsent.push_back(recorded);
        self.flush_audit().await;
    }

    /// Deliver unsent entries in order. Returns `false` if the sink refused one.
    async fn flush_audit(&mut self) -> bool {
        while let Some(entry) = self.unsent.front() {
            match self.inner.audit.append(entry).await {
                Ok(()) => {
                    self.unsent.pop_front();
                }
                Err(e) => {
                    if !self.sink_warned {
                        warn!(workflow_id = %self.state.workflow_id, "Audit sink append failed, buffering: {e}");
                        self.sink_warned = true;
                    }
                    return false;
                }
            }
        }
        true
    }
}

fn empty_lookup() -> ContextLookup {
    ContextLookup {
        context: CustomerContext::empty(),
        known_customer: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit_sink::InMemoryAuditSink;
    use crate::memory::{CustomerProfile, InMemoryMemoryStore};
    use triage::{Channel, CustomerTier};

    fn engine(config: PipelineConfig) -> (PipelineEngine, Arc<InMemoryMemoryStore>, Arc<InMemoryAuditSink>) {
        let memory = Arc::new(InMemoryMemoryStore::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let caps = Capabilities::rule_based(&config);
        let engine = PipelineEngine::new(config, caps, memory.clone(), audit.clone());
        (engine, memory, audit)
    }

    #[tokio::test]
    async fn test_unknown_workflow() {
        let (engine, _, _) = engine(PipelineConfig::default());
        assert!(matches!(
            engine.get_status("nope").await,
            Err(PipelineError::UnknownWorkflow(_))
        ));
        assert!(matches!(
            engine.wait("nope").await,
            Err(PipelineError::UnknownWorkflow(_))
        ));
    }

    #[tokio::test]
    async fn test_process_reaches_done_and_records_resolution() {
        let (engine, memory, audit) = engine(PipelineConfig::default());
        let complaint = Complaint::new(
            "c-1",
            "cust-1",
            Channel::Email,
            "I was charged twice on my invoice and I want a refund. This is unacceptable and \
             I am frustrated.",
        );
        let report = engine.process(complaint).await.unwrap();
        let snap = &report.snapshot;
        assert_eq!(snap.state, PipelineState::Done);
        assert!(snap.outcome.is_some_and(PipelineState::is_terminal));
        assert!(snap.finished_at.is_some());
        assert!(snap.iteration_count >= 1);

        let profile = memory.profile("cust-1").await.unwrap();
        assert_eq!(profile.resolutions.len(), 1);
        assert_eq!(profile.resolutions[0].resolution_id, "c-1");

        let sunk = audit.entries_for(&snap.workflow_id).await;
        assert_eq!(sunk.len(), snap.audit_trail.len());
        assert!(triage::audit::is_well_ordered(&sunk));
    }

    #[tokio::test]
    async fn test_submit_then_wait() {
        let (engine, memory, _) = engine(PipelineConfig::default());
        memory
            .insert_profile(CustomerProfile::new("vip", CustomerTier::Platinum))
            .await;
        let id = engine
            .submit(Complaint::new("c-2", "vip", Channel::Chat, "Where is my package? It is late."))
            .await;
        let running = engine.get_status(&id).await.unwrap();
        assert_eq!(running.workflow_id, id);

        let report = engine.wait(&id).await.unwrap();
        assert_eq!(report.snapshot.workflow_id, id);
        assert_eq!(report.metrics.workflow_id, id);

        // Collected reports are handed out once.
        assert!(matches!(
            engine.get_status(&id).await,
            Err(PipelineError::UnknownWorkflow(_))
        ));
        assert!(matches!(
            engine.wait(&id).await,
            Err(PipelineError::UnknownWorkflow(_))
        ));
    }

    #[tokio::test]
    async fn test_collected_workflows_release_engine_state() {
        let (engine, _, _) = engine(PipelineConfig::default());
        let mut ids = Vec::new();
        for i in 0..20 {
            let complaint = Complaint::new(
                format!("c-{i}"),
                format!("cust-{}", i % 4),
                Channel::Email,
                "I was charged twice, please refund me.",
            );
            ids.push(engine.submit(complaint).await);
        }
        assert_eq!(engine.inner.registry.read().await.len(), 20);

        for id in &ids {
            engine.wait(id).await.unwrap();
        }
        engine
            .process(Complaint::new("c-20", "cust-0", Channel::Chat, "Refund please"))
            .await
            .unwrap();

        assert!(engine.inner.registry.read().await.is_empty());
        assert!(engine.inner.reports.lock().await.is_empty());
        assert!(engine.inner.customer_locks.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_context_matches_sequential() {
        let text = "My order arrived damaged and I want a replacement.";
        let (sequential, _, _) = engine(PipelineConfig::default());
        let (concurrent, _, _) = engine(PipelineConfig {
            concurrent_context: true,
            ..PipelineConfig::default()
        });
        let a = sequential
            .process(Complaint::new("c-3", "cust-3", Channel::Email, text))
            .await
            .unwrap();
        let b = concurrent
            .process(Complaint::new("c-3", "cust-3", Channel::Email, text))
            .await
            .unwrap();
        assert_eq!(a.snapshot.outcome, b.snapshot.outcome);
        assert_eq!(a.snapshot.priority_history, b.snapshot.priority_history);
        assert_eq!(a.snapshot.audited_stages(), b.snapshot.audited_stages());
    }
}
