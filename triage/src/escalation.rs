//! Escalation and routing decisions.
//!
//! Pure functions over the workflow's facts. No stage calls happen here.
//!
//! # Escalation reasons (first match wins)
//!
//! ```text
//! 1. contradictory signals           → ESCALATED (bypasses remaining stages)
//! 2. priority 5 at ROUTE             → ESCALATED
//! 3. low confidence + priority >= 4  → ESCALATED
//! 4. draft loop exhausted            → route table (after the +1 bump)
//! ```
//!
//! # Route table
//!
//! ```text
//! priority 5                      → ESCALATED
//! priority 4                      → QUEUED_FOR_REVIEW
//! priority 1..=3 + human review   → QUEUED_FOR_REVIEW
//! priority 1..=3                  → AUTO_SENT
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state_machine::{PipelineEvent, PipelineState};
use crate::types::{Category, ClassificationResult};

/// Why a complaint was handed to a human.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum EscalationReason {
    /// Positive sentiment alongside a legal or chargeback threat.
    ContradictorySignals { detail: String },
    /// Priority reached the top of the scale.
    CriticalPriority { score: u8 },
    /// Classifier was unsure about a high-priority complaint.
    LowConfidenceHighPriority { confidence: f64, score: u8 },
    /// Every draft was rejected by validation.
    ValidationLoopExhausted { drafts: u32 },
}

impl EscalationReason {
    /// Whether this reason overrides the route table and forces ESCALATED.
    pub fn forces_escalation(&self) -> bool {
        !matches!(self, Self::ValidationLoopExhausted { .. })
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ContradictorySignals { detail } => write!(f, "contradictory signals: {detail}"),
            Self::CriticalPriority { score } => write!(f, "critical priority {score}"),
            Self::LowConfidenceHighPriority { confidence, score } => write!(
                f,
                "low classification confidence {confidence:.2} at priority {score}"
            ),
            Self::ValidationLoopExhausted { drafts } => {
                write!(f, "response rejected after {drafts} drafts")
            }
        }
    }
}

/// Who should pick up an escalated complaint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerLevel {
    AiAuto,
    TeamLead,
    Supervisor,
    Manager,
}

impl fmt::Display for HandlerLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AiAuto => write!(f, "ai_auto"),
            Self::TeamLead => write!(f, "team_lead"),
            Self::Supervisor => write!(f, "supervisor"),
            Self::Manager => write!(f, "manager"),
        }
    }
}

/// Escalation record attached to the workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub reason: EscalationReason,
    pub assigned_team: String,
    pub handler: HandlerLevel,
    pub at: DateTime<Utc>,
}

impl EscalationRecord {
    pub fn new(reason: EscalationReason, classification: &ClassificationResult) -> Self {
        let handler = handler_for(&reason, classification);
        Self {
            assigned_team: assigned_team(classification).to_string(),
            handler,
            reason,
            at: Utc::now(),
        }
    }
}

/// Facts consulted when choosing an escalation reason.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EscalationSignals {
    pub contradictory: bool,
    pub priority_score: u8,
    pub classification_confidence: f64,
    pub low_confidence: bool,
    pub loop_exhausted: bool,
    pub drafts: u32,
}

/// Pick the single escalation reason, if any, in precedence order.
pub fn select_reason(
    signals: &EscalationSignals,
    classification: &ClassificationResult,
) -> Option<EscalationReason> {
    if signals.contradictory {
        return Some(EscalationReason::ContradictorySignals {
            detail: format!(
                "{} sentiment with {:?} intent",
                classification.sentiment, classification.intent
            ),
        });
    }
    if signals.priority_score >= 5 {
        return Some(EscalationReason::CriticalPriority {
            score: signals.priority_score,
        });
    }
    if signals.low_confidence && signals.priority_score >= 4 {
        return Some(EscalationReason::LowConfidenceHighPriority {
            confidence: signals.classification_confidence,
            score: signals.priority_score,
        });
    }
    if signals.loop_exhausted {
        return Some(EscalationReason::ValidationLoopExhausted {
            drafts: signals.drafts,
        });
    }
    None
}

/// Next event after a validation result.
pub fn validation_event(approved: bool, iteration: u32, max_iterations: u32) -> PipelineEvent {
    if approved {
        PipelineEvent::Approved
    } else if iteration < max_iterations {
        PipelineEvent::Rejected
    } else {
        PipelineEvent::LoopExhausted
    }
}

/// Routing outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDecision {
    pub event: PipelineEvent,
    pub terminal: PipelineState,
}

/// Apply the route table.
pub fn decide_route(
    priority_score: u8,
    requires_human_review: bool,
    reason: Option<&EscalationReason>,
) -> RouteDecision {
    let event = if reason.is_some_and(EscalationReason::forces_escalation) || priority_score >= 5 {
        PipelineEvent::RouteEscalate
    } else if priority_score == 4 || requires_human_review {
        PipelineEvent::RouteQueue
    } else {
        PipelineEvent::RouteAutoSend
    };
    let terminal = match event {
        PipelineEvent::RouteEscalate => PipelineState::Escalated,
        PipelineEvent::RouteQueue => PipelineState::QueuedForReview,
        _ => PipelineState::AutoSent,
    };
    RouteDecision { event, terminal }
}

/// Team that owns a complaint's dominant category.
pub fn assigned_team(classification: &ClassificationResult) -> &'static str {
    if classification.has_legal_or_chargeback_threat() {
        return "legal_team";
    }
    match classification.dominant_category() {
        Category::Billing => "billing_team",
        Category::Shipping => "logistics_team",
        Category::Product => "product_team",
        Category::Technical => "technical_support",
        Category::Legal => "legal_team",
        Category::Service => "customer_success",
        Category::Feedback => "product_feedback",
        Category::Other => "general_support",
    }
}

fn handler_for(reason: &EscalationReason, classification: &ClassificationResult) -> HandlerLevel {
    let legal = classification.has_legal_or_chargeback_threat()
        || classification.dominant_category() == Category::Legal;
    match reason {
        EscalationReason::ContradictorySignals { .. } => HandlerLevel::Manager,
        EscalationReason::CriticalPriority { .. } if legal => HandlerLevel::Manager,
        EscalationReason::CriticalPriority { .. } => HandlerLevel::Supervisor,
        EscalationReason::LowConfidenceHighPriority { .. } => HandlerLevel::TeamLead,
        EscalationReason::ValidationLoopExhausted { .. } => HandlerLevel::TeamLead,
    }
}
