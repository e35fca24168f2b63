//! Complaint Resolver runtime
//!
//! This crate runs the async side of the complaint pipeline:
//! - A pipeline engine that drives one state machine per complaint on tokio tasks
//! - A stage invocation wrapper (timeout, retry with backoff, secondary, constant default)
//! - Stage capabilities: rule-based tables and an HTTP JSON client
//! - Customer memory store and audit sink contracts with in-memory and JSONL backends
//! - Per-workflow telemetry
//!
//! The deterministic core (state machine, scoring, escalation rules, config)
//! lives in the `triage` crate.
//!
//! # Usage
//!
//! ```bash
//! complaint-resolver run --input complaints.jsonl --audit-log audit.jsonl
//! complaint-resolver show-config --config resolver.toml
//! ```

pub mod audit_sink;
pub mod capability;
pub mod engine;
pub mod http;
pub mod invoker;
pub mod memory;
pub mod rules;
pub mod telemetry;

// Re-export the engine API
pub use engine::{PipelineEngine, WorkflowReport};

// Re-export capability contracts
pub use capability::{
    Capabilities, ClassifyRequest, ContextRequest, DraftRequest, DynCapability, PrioritizeRequest,
    Scored, StageCapability, StageSlot, ValidateRequest,
};
pub use invoker::{Invocation, StageInvoker};

// Re-export storage contracts
pub use audit_sink::{AuditError, AuditSink, InMemoryAuditSink, JsonlAuditSink};
pub use memory::{
    CustomerProfile, InMemoryMemoryStore, MemoryError, MemoryStore, ResolutionSummary,
};

// Re-export telemetry
pub use telemetry::{append_telemetry, RunSummary, WorkflowMetrics};
