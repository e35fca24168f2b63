//! Triage Library
//!
//! Deterministic decision logic for the complaint resolution pipeline:
//! - Typed complaint, classification, priority, draft and validation records
//! - The pipeline state machine and its explicit transition table
//! - Rule-based priority scoring with monotone re-evaluation
//! - SLA deadlines that only ever tighten
//! - Escalation reasons, routing and team assignment
//! - Audit entries with blake3 fingerprints
//! - Stage error taxonomy, retry policy and the degradation envelope
//!
//! Nothing in this crate performs I/O apart from reading a config file.
//! The async runtime lives in the `complaint-resolver` crate.

pub mod audit;
pub mod config;
pub mod error;
pub mod escalation;
pub mod priority;
pub mod resilience;
pub mod retry;
pub mod sla;
pub mod state_machine;
pub mod types;
pub mod workflow;

// Re-export key data model types
pub use types::{
    Category, Channel, ClassificationResult, Complaint, CustomerContext, CustomerTier,
    DraftResponse, Intent, PriorityFactor, PriorityLevel, PriorityResult, Sentiment,
    ThreatSignal, ValidationResult,
};

// Re-export state machine types
pub use state_machine::{
    next_state, IllegalTransition, PipelineEvent, PipelineState, StateMachine, TransitionRecord,
};

// Re-export configuration types
pub use config::{
    EndpointConfig, PipelineConfig, ScoringConfig, SlaTargets, StageFailurePolicy, StagePolicies,
};

// Re-export decision types
pub use escalation::{
    assigned_team, decide_route, select_reason, validation_event, EscalationReason,
    EscalationRecord, EscalationSignals, HandlerLevel, RouteDecision,
};
pub use priority::{breach_probability, PriorityScorer, MAX_PRIORITY};
pub use sla::SlaRecord;

// Re-export error and resilience types
pub use error::{ConfigError, PipelineError, RetryCategory, StageError};
pub use resilience::{DegradationLevel, Served};
pub use retry::RetryPolicy;

// Re-export audit and workflow types
pub use audit::{fingerprint, AuditEntry, AuditOutcome};
pub use workflow::{WorkflowFlags, WorkflowSnapshot, WorkflowState};
