//! Workflow State — the accumulating record for one complaint.
//!
//! Owned and mutated only by the engine. Everything other components see is
//! a [`WorkflowSnapshot`] copy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{fingerprint, AuditEntry};
use crate::config::SlaTargets;
use crate::error::PipelineError;
use crate::escalation::EscalationRecord;
use crate::sla::SlaRecord;
use crate::state_machine::{PipelineEvent, PipelineState, StateMachine, TransitionRecord};
use crate::types::{
    ClassificationResult, Complaint, CustomerContext, DraftResponse, PriorityFactor,
    PriorityResult, ValidationResult,
};

/// Boolean markers a reviewer uses to understand how a complaint was handled.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowFlags {
    pub requires_human_review: bool,
    pub escalated: bool,
    pub sla_at_risk: bool,
    pub context_unavailable: bool,
    pub low_confidence: bool,
    pub contradictory_signals: bool,
    pub loop_exhausted: bool,
    pub timed_out: bool,
    /// FAILED workflows wait for an operator.
    pub manual_processing: bool,
    /// Resolution could not be recorded and sits in the deferred queue.
    pub persistence_deferred: bool,
    /// Stages served by a secondary capability or constant default.
    #[serde(default)]
    pub degraded_stages: Vec<String>,
}

impl WorkflowFlags {
    pub fn mark_degraded(&mut self, stage: &str) {
        if !self.degraded_stages.iter().any(|s| s == stage) {
            self.degraded_stages.push(stage.to_string());
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkflowState {
    pub workflow_id: String,
    pub complaint: Complaint,
    pub context: Option<CustomerContext>,
    pub classification: Option<ClassificationResult>,
    pub priority: Option<PriorityResult>,
    /// Every score assigned, in order.
    pub priority_history: Vec<u8>,
    pub draft: Option<DraftResponse>,
    pub validation: Option<ValidationResult>,
    /// Drafts produced so far.
    pub iteration_count: u32,
    pub max_iterations: u32,
    pub flags: WorkflowFlags,
    pub sla: Option<SlaRecord>,
    pub escalation: Option<EscalationRecord>,
    /// Human-readable reasons, oldest first.
    pub decisions: Vec<String>,
    /// Local copy of the audit trail, in append order.
    pub audit_trail: Vec<AuditEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    machine: StateMachine,
}

impl WorkflowState {
    pub fn new(workflow_id: impl Into<String>, complaint: Complaint, max_iterations: u32) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            complaint,
            context: None,
            classification: None,
            priority: None,
            priority_history: Vec::new(),
            draft: None,
            validation: None,
            iteration_count: 0,
            max_iterations,
            flags: WorkflowFlags::default(),
            sla: None,
            escalation: None,
            decisions: Vec::new(),
            audit_trail: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
            machine: StateMachine::new(),
        }
    }

    pub fn state(&self) -> PipelineState {
        self.machine.current()
    }

    pub fn machine(&self) -> &StateMachine {
        &self.machine
    }

    /// Drive the state machine. Illegal events are engine bugs.
    pub fn apply(
        &mut self,
        event: PipelineEvent,
        reason: Option<&str>,
    ) -> Result<PipelineState, PipelineError> {
        Ok(self.machine.apply(event, reason)?)
    }

    /// Start a new draft, enforcing the iteration cap.
    pub fn begin_draft(&mut self) -> Result<u32, PipelineError> {
        if self.iteration_count >= self.max_iterations {
            return Err(PipelineError::InvariantViolated(format!(
                "draft {} would exceed max_iterations {}",
                self.iteration_count + 1,
                self.max_iterations
            )));
        }
        self.iteration_count += 1;
        self.machine.set_iteration(self.iteration_count);
        Ok(self.iteration_count)
    }

    /// Record a priority result, keeping history monotone and the SLA tight.
    pub fn assign_priority(
        &mut self,
        priority: PriorityResult,
        targets: &SlaTargets,
    ) -> Result<(), PipelineError> {
        if !priority.is_in_range() {
            return Err(PipelineError::PriorityOutOfRange(priority.score));
        }
        if let Some(&last) = self.priority_history.last() {
            if priority.score < last {
                return Err(PipelineError::InvariantViolated(format!(
                    "priority lowered from {last} to {}",
                    priority.score
                )));
            }
        }
        if priority.factors.contains(&PriorityFactor::SlaBreachRisk) {
            self.flags.sla_at_risk = true;
        }

        let received_at = self.complaint.received_at;
        match self.sla.as_mut() {
            None => self.sla = Some(SlaRecord::derive(received_at, &priority, targets)),
            Some(sla) => {
                if sla.tighten(received_at, &priority, targets) {
                    self.decisions
                        .push(format!("SLA deadline tightened to {}", sla.deadline));
                }
            }
        }
        self.priority_history.push(priority.score);
        self.priority = Some(priority);
        Ok(())
    }

    pub fn note(&mut self, decision: impl Into<String>) {
        self.decisions.push(decision.into());
    }

    /// Append to the local trail, assigning the next sequence number.
    pub fn record_audit(&mut self, mut entry: AuditEntry) -> &AuditEntry {
        entry.seq = self.audit_trail.len() as u64;
        entry.workflow_id.clone_from(&self.workflow_id);
        self.audit_trail.push(entry);
        &self.audit_trail[self.audit_trail.len() - 1]
    }

    /// The outcome state this workflow reached, if any.
    pub fn outcome(&self) -> Option<PipelineState> {
        self.machine
            .transitions()
            .iter()
            .rev()
            .map(|t| t.to)
            .find(|s| s.is_terminal())
    }

    pub fn complaint_fingerprint(&self) -> String {
        fingerprint(&self.complaint)
    }

    pub fn snapshot(&self) -> WorkflowSnapshot {
        WorkflowSnapshot {
            workflow_id: self.workflow_id.clone(),
            complaint_id: self.complaint.complaint_id.clone(),
            customer_id: self.complaint.customer_id.clone(),
            state: self.state(),
            outcome: self.outcome(),
            iteration_count: self.iteration_count,
            context: self.context.clone(),
            classification: self.classification.clone(),
            priority: self.priority.clone(),
            priority_history: self.priority_history.clone(),
            draft: self.draft.clone(),
            validation: self.validation.clone(),
            flags: self.flags.clone(),
            sla: self.sla.clone(),
            escalation: self.escalation.clone(),
            decisions: self.decisions.clone(),
            audit_trail: self.audit_trail.clone(),
            transitions: self.machine.transitions().to_vec(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Read-only copy of a workflow, safe to hand to callers and stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub workflow_id: String,
    pub complaint_id: String,
    pub customer_id: String,
    pub state: PipelineState,
    pub outcome: Option<PipelineState>,
    pub iteration_count: u32,
    pub context: Option<CustomerContext>,
    pub classification: Option<ClassificationResult>,
    pub priority: Option<PriorityResult>,
    pub priority_history: Vec<u8>,
    pub draft: Option<DraftResponse>,
    pub validation: Option<ValidationResult>,
    pub flags: WorkflowFlags,
    pub sla: Option<SlaRecord>,
    pub escalation: Option<EscalationRecord>,
    pub decisions: Vec<String>,
    pub audit_trail: Vec<AuditEntry>,
    pub transitions: Vec<TransitionRecord>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkflowSnapshot {
    pub fn is_settled(&self) -> bool {
        self.state.is_settled()
    }

    /// Stages with at least one audit entry, in first-seen order.
    pub fn audited_stages(&self) -> Vec<&str> {
        let mut stages: Vec<&str> = Vec::new();
        for entry in &self.audit_trail {
            if !stages.contains(&entry.stage.as_str()) {
                stages.push(&entry.stage);
            }
        }
        stages
    }
}
