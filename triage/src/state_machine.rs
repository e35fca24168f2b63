//! Pipeline State Machine — explicit states, events and the transition table.
//!
//! The table is a pure function of `(state, event)` so it can be tested
//! without any stage implementation. The [`StateMachine`] wrapper enforces it
//! and keeps a transition log for replay and for the reviewer-facing trail.
//!
//! ```text
//! Intake ─Normalized─▶ Context ─ContextLoaded|ContextUnavailable─▶ Classify
//! Classify ─Classified|LowConfidence─▶ Prioritize
//! Classify ─ContradictorySignals─▶ Route
//! Prioritize ─Prioritized─▶ Draft ─Drafted─▶ Validate
//! Validate ─Approved|LoopExhausted─▶ Route
//! Validate ─Rejected─▶ Draft
//! Route ─RouteAutoSend─▶ AutoSent
//! Route ─RouteQueue─▶ QueuedForReview
//! Route ─RouteEscalate─▶ Escalated
//! {AutoSent, QueuedForReview, Escalated, Failed} ─Finalized─▶ Done
//! any non-terminal ─StageExhausted|InvariantViolated─▶ Failed
//! any non-terminal ─OverallTimeout─▶ QueuedForReview
//! ```

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The set of pipeline states.
///
/// Every run starts at `Intake` and ends at `Done`, passing through exactly
/// one of the terminal outcome states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Intake,
    Context,
    Classify,
    Prioritize,
    Draft,
    Validate,
    Route,
    AutoSent,
    QueuedForReview,
    Escalated,
    Failed,
    Done,
}

impl PipelineState {
    /// Outcome states: reached after routing (or failure), before post-processing.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::AutoSent | Self::QueuedForReview | Self::Escalated | Self::Failed
        )
    }

    /// Whether processing has left the automated stages.
    pub fn is_settled(self) -> bool {
        self.is_terminal() || self == Self::Done
    }

    /// Stage name used in audit entries.
    pub fn stage_name(self) -> &'static str {
        match self {
            Self::Intake => "intake",
            Self::Context => "context",
            Self::Classify => "classify",
            Self::Prioritize => "prioritize",
            Self::Draft => "draft",
            Self::Validate => "validate",
            Self::Route => "route",
            Self::AutoSent => "auto_sent",
            Self::QueuedForReview => "queued_for_review",
            Self::Escalated => "escalated",
            Self::Failed => "failed",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Intake => "INTAKE",
            Self::Context => "CONTEXT",
            Self::Classify => "CLASSIFY",
            Self::Prioritize => "PRIORITIZE",
            Self::Draft => "DRAFT",
            Self::Validate => "VALIDATE",
            Self::Route => "ROUTE",
            Self::AutoSent => "AUTO_SENT",
            Self::QueuedForReview => "QUEUED_FOR_REVIEW",
            Self::Escalated => "ESCALATED",
            Self::Failed => "FAILED",
            Self::Done => "DONE",
        })
    }
}

/// Events that drive the pipeline forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEvent {
    Normalized,
    ContextLoaded,
    ContextUnavailable,
    Classified,
    LowConfidence,
    ContradictorySignals,
    Prioritized,
    Drafted,
    Approved,
    Rejected,
    LoopExhausted,
    RouteAutoSend,
    RouteQueue,
    RouteEscalate,
    OverallTimeout,
    StageExhausted,
    InvariantViolated,
    Finalized,
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Error returned when an event is not legal in the current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Illegal state transition: {event} in {from}")]
pub struct IllegalTransition {
    pub from: PipelineState,
    pub event: PipelineEvent,
}

/// The transition table.
pub fn next_state(
    from: PipelineState,
    event: PipelineEvent,
) -> Result<PipelineState, IllegalTransition> {
    use PipelineEvent as E;
    use PipelineState as S;

    let to = match (from, event) {
        // Failure and forced review are legal from every automated stage.
        (s, E::StageExhausted | E::InvariantViolated) if !s.is_settled() => S::Failed,
        (s, E::OverallTimeout) if !s.is_settled() => S::QueuedForReview,

        (S::Intake, E::Normalized) => S::Context,
        (S::Context, E::ContextLoaded | E::ContextUnavailable) => S::Classify,
        (S::Classify, E::Classified | E::LowConfidence) => S::Prioritize,
        (S::Classify, E::ContradictorySignals) => S::Route,
        (S::Prioritize, E::Prioritized) => S::Draft,
        (S::Draft, E::Drafted) => S::Validate,
        (S::Validate, E::Approved | E::LoopExhausted) => S::Route,
        (S::Validate, E::Rejected) => S::Draft,
        (S::Route, E::RouteAutoSend) => S::AutoSent,
        (S::Route, E::RouteQueue) => S::QueuedForReview,
        (S::Route, E::RouteEscalate) => S::Escalated,
        (s, E::Finalized) if s.is_terminal() => S::Done,

        _ => return Err(IllegalTransition { from, event }),
    };
    Ok(to)
}

/// A single recorded state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: PipelineState,
    pub to: PipelineState,
    pub event: PipelineEvent,
    /// Draft iteration at the time of transition (0 before the first draft).
    pub iteration: u32,
    /// Milliseconds since the state machine was created.
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// The pipeline state machine.
///
/// Tracks the current state, enforces the transition table, and keeps a
/// complete log of every transition.
#[derive(Debug, Clone)]
pub struct StateMachine {
    current: PipelineState,
    iteration: u32,
    created_at: Instant,
    transitions: Vec<TransitionRecord>,
}

impl StateMachine {
    /// Create a new state machine starting at `Intake`.
    pub fn new() -> Self {
        Self {
            current: PipelineState::Intake,
            iteration: 0,
            created_at: Instant::now(),
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> PipelineState {
        self.current
    }

    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Set the iteration counter (called when a draft starts).
    pub fn set_iteration(&mut self, iteration: u32) {
        self.iteration = iteration;
    }

    /// Apply `event`, moving to the next state if the table allows it.
    pub fn apply(
        &mut self,
        event: PipelineEvent,
        reason: Option<&str>,
    ) -> Result<PipelineState, IllegalTransition> {
        let to = next_state(self.current, event)?;

        tracing::debug!(
            from = %self.current,
            to = %to,
            event = %event,
            iteration = self.iteration,
            "State transition"
        );

        self.transitions.push(TransitionRecord {
            from: self.current,
            to,
            event,
            iteration: self.iteration,
            elapsed_ms: self.created_at.elapsed().as_millis() as u64,
            reason: reason.map(String::from),
        });
        self.current = to;
        Ok(to)
    }

    pub fn is_terminal(&self) -> bool {
        self.current.is_terminal()
    }

    pub fn transitions(&self) -> &[TransitionRecord] {
        &self.transitions
    }

    /// Whether the machine ever passed through `state`.
    pub fn visited(&self, state: PipelineState) -> bool {
        self.transitions
            .iter()
            .any(|t| t.to == state || t.from == state)
    }

    /// Summary string of the path taken.
    pub fn summary(&self) -> String {
        let mut path = vec![PipelineState::Intake.to_string()];
        path.extend(self.transitions.iter().map(|t| t.to.to_string()));
        format!(
            "{} ({}ms, {} transitions)",
            path.join(" → "),
            self.created_at.elapsed().as_millis(),
            self.transitions.len()
        )
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
