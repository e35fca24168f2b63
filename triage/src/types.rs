//! Complaint data model — the typed records that flow between stages.
//!
//! Everything here is plain data. Stage results are produced once by a
//! capability and never mutated afterwards; the engine only reads them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Channel a complaint arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Email,
    Chat,
    Social,
    Phone,
    Crm,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Email => write!(f, "email"),
            Self::Chat => write!(f, "chat"),
            Self::Social => write!(f, "social"),
            Self::Phone => write!(f, "phone"),
            Self::Crm => write!(f, "crm"),
        }
    }
}

/// A normalized customer complaint. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Complaint {
    /// Unique complaint identifier assigned by the dispatcher.
    pub complaint_id: String,
    /// External customer identifier.
    pub customer_id: String,
    pub channel: Channel,
    /// Normalized complaint text.
    pub raw_text: String,
    pub received_at: DateTime<Utc>,
    /// Urgency markers extracted by the dispatcher (informational only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urgency_signals: Vec<String>,
}

impl Complaint {
    pub fn new(
        complaint_id: impl Into<String>,
        customer_id: impl Into<String>,
        channel: Channel,
        raw_text: impl Into<String>,
    ) -> Self {
        Self {
            complaint_id: complaint_id.into(),
            customer_id: customer_id.into(),
            channel,
            raw_text: raw_text.into(),
            received_at: Utc::now(),
            urgency_signals: Vec::new(),
        }
    }

    /// Pin the received timestamp (deterministic tests, replays).
    pub fn received_at(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = at;
        self
    }
}

// ── Classification ────────────────────────────────────────────────────────────

/// Fixed category vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Category {
    Billing,
    Shipping,
    Product,
    Service,
    Technical,
    Feedback,
    Legal,
    Other,
}

impl Category {
    pub const ALL: [Category; 8] = [
        Self::Billing,
        Self::Shipping,
        Self::Product,
        Self::Service,
        Self::Technical,
        Self::Feedback,
        Self::Legal,
        Self::Other,
    ];
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Billing => "Billing",
            Self::Shipping => "Shipping",
            Self::Product => "Product",
            Self::Service => "Service",
            Self::Technical => "Technical",
            Self::Feedback => "Feedback",
            Self::Legal => "Legal",
            Self::Other => "Other",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sentiment {
    Positive,
    Neutral,
    Frustrated,
    Angry,
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Positive => write!(f, "positive"),
            Self::Neutral => write!(f, "neutral"),
            Self::Frustrated => write!(f, "frustrated"),
            Self::Angry => write!(f, "angry"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Refund,
    Exchange,
    Information,
    Complaint,
    Praise,
    Escalation,
    Cancellation,
    TechnicalSupport,
    LegalAction,
    Chargeback,
}

/// Threats detected in the complaint text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatSignal {
    Legal,
    Chargeback,
    SocialMedia,
}

/// Output of the classification stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    /// Non-empty; the first label is the dominant category.
    pub categories: Vec<Category>,
    pub sentiment: Sentiment,
    pub intent: Intent,
    /// Classifier confidence in [0, 1].
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub threats: Vec<ThreatSignal>,
}

impl ClassificationResult {
    pub fn new(
        categories: Vec<Category>,
        sentiment: Sentiment,
        intent: Intent,
        confidence: f64,
    ) -> Self {
        let categories = if categories.is_empty() {
            vec![Category::Other]
        } else {
            categories
        };
        Self {
            categories,
            sentiment,
            intent,
            confidence: confidence.clamp(0.0, 1.0),
            threats: Vec::new(),
        }
    }

    pub fn with_threat(mut self, threat: ThreatSignal) -> Self {
        if !self.threats.contains(&threat) {
            self.threats.push(threat);
        }
        self
    }

    /// Conservative classification used when every classifier failed.
    pub fn conservative_default() -> Self {
        Self::new(vec![Category::Other], Sentiment::Neutral, Intent::Complaint, 0.0)
    }

    pub fn dominant_category(&self) -> Category {
        self.categories.first().copied().unwrap_or(Category::Other)
    }

    /// Legal or chargeback threat, from either the intent or explicit signals.
    pub fn has_legal_or_chargeback_threat(&self) -> bool {
        matches!(self.intent, Intent::LegalAction | Intent::Chargeback)
            || self
                .threats
                .iter()
                .any(|t| matches!(t, ThreatSignal::Legal | ThreatSignal::Chargeback))
    }

    /// Positive sentiment paired with a legal/chargeback threat.
    pub fn has_contradictory_signals(&self) -> bool {
        self.sentiment == Sentiment::Positive && self.has_legal_or_chargeback_threat()
    }
}

// ── Customer context ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CustomerTier {
    #[default]
    Standard,
    Silver,
    Gold,
    Platinum,
}

/// Read-only snapshot of a customer, taken once per workflow.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CustomerContext {
    pub tier: CustomerTier,
    pub lifetime_complaints: u32,
    /// Categories of complaints still open inside the lookback window.
    #[serde(default)]
    pub open_issue_categories: Vec<Category>,
    /// Churn risk in [0, 1].
    pub churn_risk: f64,
    /// Explicit VIP marker (Gold and Platinum tiers are VIP regardless).
    #[serde(default)]
    pub vip: bool,
}

impl CustomerContext {
    /// Context used when the customer is unknown or the store is down.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_vip(&self) -> bool {
        self.vip || matches!(self.tier, CustomerTier::Gold | CustomerTier::Platinum)
    }

    /// Whether an open complaint exists on the same issue as `classification`.
    pub fn has_open_complaint_on(&self, classification: &ClassificationResult) -> bool {
        self.open_issue_categories
            .contains(&classification.dominant_category())
    }
}

// ── Priority ──────────────────────────────────────────────────────────────────

/// Named priority levels for scores 1..=5.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityLevel {
    Minimal,
    Low,
    Medium,
    High,
    Critical,
}

impl PriorityLevel {
    /// Level for a score; out-of-range scores have no level.
    pub fn from_score(score: u8) -> Option<Self> {
        match score {
            1 => Some(Self::Minimal),
            2 => Some(Self::Low),
            3 => Some(Self::Medium),
            4 => Some(Self::High),
            5 => Some(Self::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Minimal => write!(f, "minimal"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Modifiers that can raise a base priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityFactor {
    RepeatComplaint,
    AngrySentiment,
    VipCustomer,
    LegalOrChargebackThreat,
    SlaBreachRisk,
    /// Unresolved quality risk after the draft loop was exhausted.
    ValidationLoopExhausted,
    /// Floor applied because the priority stage itself failed.
    FallbackFloor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityResult {
    /// Score in [1, 5].
    pub score: u8,
    pub level: PriorityLevel,
    pub base_score: u8,
    pub modifier_total: u8,
    pub factors: Vec<PriorityFactor>,
    pub rationale: String,
}

impl PriorityResult {
    /// Priority floor used when the priority stage is unavailable.
    pub fn fallback_floor(floor: u8) -> Self {
        let score = floor.clamp(1, 5);
        Self {
            score,
            level: PriorityLevel::from_score(score).unwrap_or(PriorityLevel::Medium),
            base_score: score,
            modifier_total: 0,
            factors: vec![PriorityFactor::FallbackFloor],
            rationale: format!("Priority stage unavailable, floor {score} applied"),
        }
    }

    pub fn is_in_range(&self) -> bool {
        (1..=5).contains(&self.score)
    }
}

// ── Draft and validation ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftResponse {
    pub text: String,
    pub tone: String,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
    /// Draft iteration that produced this text (1-indexed).
    pub iteration: u32,
    pub confidence: f64,
}

impl DraftResponse {
    /// Generic holding response used when every drafter failed.
    pub fn generic_template(iteration: u32) -> Self {
        Self {
            text: "Dear Customer,\n\nThank you for contacting us. We're sorry for the trouble \
                   you've experienced. Your message has been received and a member of our team \
                   is reviewing it now. We will follow up with you shortly.\n\nBest regards,\n\
                   Customer Support"
                .to_string(),
            tone: "neutral".to_string(),
            recommended_actions: vec!["Human review of generic response".to_string()],
            iteration,
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub approved: bool,
    #[serde(default)]
    pub feedback: Option<String>,
    pub confidence: f64,
    #[serde(default)]
    pub issues: Vec<String>,
    /// Overall quality score (1..=10).
    #[serde(default)]
    pub quality_score: u8,
}

impl ValidationResult {
    /// Validation outcome used when every validator failed: send to a human.
    pub fn send_to_human() -> Self {
        Self {
            approved: false,
            feedback: Some("Validator unavailable; human review required".to_string()),
            confidence: 0.0,
            issues: vec!["validation unavailable".to_string()],
            quality_score: 0,
        }
    }
}
