//! Priority Scoring — deterministic score from classification and context.
//!
//! `score = min(base(dominant category) + Σ triggered modifiers, 5)`
//!
//! Each modifier applies at most once per evaluation. Re-evaluation never
//! lowers a score that was already assigned: discovered risk stays discovered.

use crate::config::ScoringConfig;
use crate::types::{
    ClassificationResult, CustomerContext, PriorityFactor, PriorityLevel, PriorityResult,
    Sentiment,
};

/// Highest possible priority.
pub const MAX_PRIORITY: u8 = 5;

/// Predicted probability that this complaint misses its SLA.
///
/// Pure function of the snapshot: churn risk, an open complaint on the same
/// issue and the customer's complaint volume all push it up.
pub fn breach_probability(classification: &ClassificationResult, context: &CustomerContext) -> f64 {
    let open_same_issue = if context.has_open_complaint_on(classification) {
        1.0
    } else {
        0.0
    };
    let volume = f64::from(context.lifetime_complaints.min(10));
    (0.4 * context.churn_risk.clamp(0.0, 1.0) + 0.3 * open_same_issue + 0.03 * volume)
        .clamp(0.0, 1.0)
}

/// Rule-based priority scorer.
#[derive(Debug, Clone, Default)]
pub struct PriorityScorer {
    config: ScoringConfig,
}

impl PriorityScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score a complaint.
    pub fn score(
        &self,
        classification: &ClassificationResult,
        context: &CustomerContext,
    ) -> PriorityResult {
        let dominant = classification.dominant_category();
        let base = self.config.base_for(dominant);
        let mut factors = Vec::new();
        let mut modifiers: u16 = 0;
        let mut rationale = vec![format!("Base priority for {dominant}: {base}")];

        let mut apply = |factor: PriorityFactor, weight: u8, why: String| {
            factors.push(factor);
            modifiers += u16::from(weight);
            rationale.push(format!("+{weight} for {why}"));
        };

        if context.has_open_complaint_on(classification) {
            apply(
                PriorityFactor::RepeatComplaint,
                self.config.repeat_complaint,
                format!("open complaint on {dominant}"),
            );
        }
        if classification.sentiment == Sentiment::Angry {
            apply(
                PriorityFactor::AngrySentiment,
                self.config.angry_sentiment,
                "angry sentiment".to_string(),
            );
        }
        if context.is_vip() {
            apply(
                PriorityFactor::VipCustomer,
                self.config.vip_customer,
                format!("{:?} VIP customer", context.tier),
            );
        }
        if classification.has_legal_or_chargeback_threat() {
            apply(
                PriorityFactor::LegalOrChargebackThreat,
                self.config.legal_threat,
                "legal/chargeback threat".to_string(),
            );
        }
        let breach = breach_probability(classification, context);
        if breach > self.config.sla_breach_probability_threshold {
            apply(
                PriorityFactor::SlaBreachRisk,
                self.config.sla_breach_risk,
                format!("predicted SLA breach risk {breach:.2}"),
            );
        }

        let raw = u16::from(base) + modifiers;
        let score = raw.clamp(1, u16::from(MAX_PRIORITY)) as u8;
        let level = PriorityLevel::from_score(score).unwrap_or(PriorityLevel::Critical);
        rationale.push(format!("Final priority: {score} ({level})"));

        PriorityResult {
            score,
            level,
            base_score: base,
            modifier_total: modifiers.min(u16::from(u8::MAX)) as u8,
            factors,
            rationale: rationale.join(" | "),
        }
    }

    /// Recompute from the same snapshot, never going below `previous`.
    pub fn reevaluate(
        &self,
        previous: &PriorityResult,
        classification: &ClassificationResult,
        context: &CustomerContext,
    ) -> PriorityResult {
        let fresh = self.score(classification, context);
        if fresh.score > previous.score {
            fresh
        } else {
            previous.clone()
        }
    }

    /// Raise a priority by one level (capped), recording why.
    pub fn bump(previous: &PriorityResult, factor: PriorityFactor, why: &str) -> PriorityResult {
        let score = (previous.score + 1).min(MAX_PRIORITY);
        let mut bumped = previous.clone();
        if score != previous.score {
            bumped.score = score;
            bumped.level = PriorityLevel::from_score(score).unwrap_or(PriorityLevel::Critical);
            bumped.rationale = format!("{} | +1 for {why}: {score}", previous.rationale);
        }
        if !bumped.factors.contains(&factor) {
            bumped.factors.push(factor);
        }
        bumped
    }
}
