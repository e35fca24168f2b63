//! Rule-based stage capabilities.
//!
//! These never call out of process and never fail on well-formed input, so
//! they serve as secondary capabilities behind model-backed primaries and as
//! the whole pipeline when no endpoint is configured.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use triage::{
    Category, ClassificationResult, DraftResponse, Intent, PriorityLevel, PriorityResult,
    PriorityScorer, ScoringConfig, Sentiment, StageError, ThreatSignal, ValidationResult,
};

use crate::capability::{
    ClassifyRequest, DraftRequest, PrioritizeRequest, Scored, StageCapability, ValidateRequest,
};

// Keyword stems; a match only needs to start at a word boundary.
static CATEGORY_PATTERNS: LazyLock<Vec<(Category, Regex)>> = LazyLock::new(|| {
    [
        (
            Category::Billing,
            r"\b(bill|charg|payment|invoice|price|fee|refund|money|cost|overcharg)",
        ),
        (
            Category::Shipping,
            r"\b(ship|deliver|arriv|track|package|parcel|order|delay|late\b)",
        ),
        (
            Category::Product,
            r"\b(product|item|broken|defect|quality|damag|wrong (item|size|colou?r))",
        ),
        (
            Category::Service,
            r"\b(service|staff|rude|support team|agent|representative)",
        ),
        (
            Category::Technical,
            r"\b(error|bug|crash|login|log in|password|app\b|website|not working)",
        ),
        (
            Category::Legal,
            r"\b(lawyer|attorney|lawsuit|sue\b|legal|court)",
        ),
        (
            Category::Feedback,
            r"\b(suggest|feedback|recommend|love|great|excellent)",
        ),
    ]
    .into_iter()
    .map(|(category, pattern)| {
        (
            category,
            Regex::new(pattern).expect("category keyword regex should compile"),
        )
    })
    .collect()
});

static SENTIMENT_PATTERNS: LazyLock<Vec<(Sentiment, Regex)>> = LazyLock::new(|| {
    [
        (
            Sentiment::Angry,
            r"\b(angry|furious|outrag|terrible|worst|disgust|unacceptable|ridiculous)",
        ),
        (
            Sentiment::Frustrated,
            r"\b(frustrat|annoy|disappoint|upset|unhappy|problem|issue|still waiting)",
        ),
        (
            Sentiment::Positive,
            r"\b(thank|great|excellent|happy|love|amazing|good)",
        ),
    ]
    .into_iter()
    .map(|(sentiment, pattern)| {
        (
            sentiment,
            Regex::new(pattern).expect("sentiment keyword regex should compile"),
        )
    })
    .collect()
});

static LEGAL_THREAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(lawyer|attorney|lawsuit|sue\b|suing|legal action|small claims|court)")
        .expect("LEGAL_THREAT regex should compile")
});

static CHARGEBACK_THREAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(chargeback|charge back|dispute (the|this) charge|dispute with my (bank|card)|call my bank)")
        .expect("CHARGEBACK_THREAT regex should compile")
});

static SOCIAL_THREAT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(twitter|facebook|instagram|tiktok|social media|go viral|bad review|post about)")
        .expect("SOCIAL_THREAT regex should compile")
});

// ── Classifier ────────────────────────────────────────────────────────────────

/// Keyword-table classifier.
#[derive(Debug, Clone, Default)]
pub struct RuleClassifier;

impl RuleClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify `text`. Confidence grows with the number of keyword tables that matched.
    pub fn classify(&self, text: &str) -> ClassificationResult {
        let lower = text.to_lowercase();

        let categories: Vec<Category> = CATEGORY_PATTERNS
            .iter()
            .filter(|(_, re)| re.is_match(&lower))
            .map(|(c, _)| *c)
            .collect();
        let matched_category = !categories.is_empty();

        let sentiment = SENTIMENT_PATTERNS
            .iter()
            .find(|(_, re)| re.is_match(&lower))
            .map(|(s, _)| *s);

        let mut threats = Vec::new();
        if LEGAL_THREAT.is_match(&lower) {
            threats.push(ThreatSignal::Legal);
        }
        if CHARGEBACK_THREAT.is_match(&lower) {
            threats.push(ThreatSignal::Chargeback);
        }
        if SOCIAL_THREAT.is_match(&lower) {
            threats.push(ThreatSignal::SocialMedia);
        }

        let sentiment_value = sentiment.unwrap_or(Sentiment::Neutral);
        let intent = if threats.contains(&ThreatSignal::Legal) {
            Intent::LegalAction
        } else if threats.contains(&ThreatSignal::Chargeback) {
            Intent::Chargeback
        } else if lower.contains("refund") {
            Intent::Refund
        } else if lower.contains("cancel") {
            Intent::Cancellation
        } else if lower.contains("exchange") || lower.contains("replace") {
            Intent::Exchange
        } else if lower.contains("manager") || lower.contains("supervisor") {
            Intent::Escalation
        } else if sentiment_value == Sentiment::Positive {
            Intent::Praise
        } else if lower
            .split(|c: char| !c.is_alphanumeric())
            .any(|word| matches!(word, "help" | "how" | "what" | "where"))
        {
            Intent::Information
        } else if categories.first() == Some(&Category::Technical) {
            Intent::TechnicalSupport
        } else {
            Intent::Complaint
        };

        let mut confidence: f64 = 0.55;
        if matched_category {
            confidence += 0.15;
        }
        if sentiment.is_some() {
            confidence += 0.1;
        }

        let mut result = ClassificationResult::new(categories, sentiment_value, intent, confidence);
        for threat in threats {
            result = result.with_threat(threat);
        }
        result
    }
}

#[async_trait]
impl StageCapability for RuleClassifier {
    type Request = ClassifyRequest;
    type Output = ClassificationResult;

    fn name(&self) -> &str {
        "rule-classifier"
    }

    async fn call(
        &self,
        request: ClassifyRequest,
        _timeout: Duration,
    ) -> Result<Scored<ClassificationResult>, StageError> {
        if request.complaint.raw_text.trim().is_empty() {
            return Err(StageError::InvalidInput("complaint text is empty".into()));
        }
        let result = self.classify(&request.complaint.raw_text);
        let confidence = result.confidence;
        Ok(Scored::new(result, confidence))
    }
}

// ── Prioritizer ───────────────────────────────────────────────────────────────

/// Deterministic scorer exposed as a capability.
#[derive(Debug, Clone, Default)]
pub struct RulePrioritizer {
    scorer: PriorityScorer,
}

impl RulePrioritizer {
    pub fn new(config: ScoringConfig) -> Self {
        Self {
            scorer: PriorityScorer::new(config),
        }
    }
}

#[async_trait]
impl StageCapability for RulePrioritizer {
    type Request = PrioritizeRequest;
    type Output = PriorityResult;

    fn name(&self) -> &str {
        "rule-prioritizer"
    }

    async fn call(
        &self,
        request: PrioritizeRequest,
        _timeout: Duration,
    ) -> Result<Scored<PriorityResult>, StageError> {
        let result = self.scorer.score(&request.classification, &request.context);
        Ok(Scored::new(result, 1.0))
    }
}

// ── Drafter ───────────────────────────────────────────────────────────────────

/// Template drafter: acknowledgment by sentiment, actions by category.
#[derive(Debug, Clone, Default)]
pub struct TemplateDrafter;

impl TemplateDrafter {
    pub fn draft(request: &DraftRequest) -> DraftResponse {
        let sentiment = request.classification.sentiment;
        let acknowledgment = match sentiment {
            Sentiment::Angry => {
                "We sincerely apologize for this experience. We completely understand your \
                 frustration and take this matter very seriously."
            }
            Sentiment::Frustrated => {
                "We apologize for the inconvenience you've experienced. We understand how \
                 frustrating this must be."
            }
            Sentiment::Neutral => {
                "Thank you for contacting us. We appreciate you bringing this to our attention."
            }
            Sentiment::Positive => "Thank you for your feedback! We're glad to hear from you.",
        };

        let actions: &[&str] = match request.classification.dominant_category() {
            Category::Shipping => &[
                "Tracking your order status",
                "Contacting our shipping partner",
                "Expediting delivery if possible",
            ],
            Category::Billing => &[
                "Reviewing your account",
                "Investigating the billing discrepancy",
                "Processing any necessary adjustments",
            ],
            Category::Product => &[
                "Documenting the product issue",
                "Arranging for replacement or refund",
                "Escalating to our quality team",
            ],
            Category::Technical => &[
                "Creating a support ticket",
                "Assigning a technical specialist",
                "Investigating the issue",
            ],
            Category::Service => &[
                "Reviewing the interaction",
                "Following up with the team involved",
            ],
            _ => &["Reviewing your case", "Assigning to the appropriate team"],
        };

        let next_steps = if request.priority.level >= PriorityLevel::High {
            "You will receive an update within 24 hours."
        } else {
            "You will receive an update within 48 hours."
        };

        let mut body = vec![
            "Dear Customer,".to_string(),
            acknowledgment.to_string(),
        ];
        if request.feedback.is_some() {
            body.push(
                "We understand how important this is to you, and we are sorry for any \
                 inconvenience it has caused."
                    .to_string(),
            );
        }
        let bullet_list: Vec<String> = actions.iter().map(|a| format!("• {a}")).collect();
        body.push(format!(
            "We are taking the following actions:\n{}",
            bullet_list.join("\n")
        ));
        body.push(next_steps.to_string());
        body.push(
            "We value your business and are committed to resolving this matter to your \
             satisfaction.\n\nBest regards,\nCustomer Support Team"
                .to_string(),
        );

        DraftResponse {
            text: body.join("\n\n"),
            tone: sentiment.to_string(),
            recommended_actions: vec![
                "Review complaint details".to_string(),
                "Follow up with customer".to_string(),
            ],
            iteration: request.iteration,
            confidence: 0.65,
        }
    }
}

#[async_trait]
impl StageCapability for TemplateDrafter {
    type Request = DraftRequest;
    type Output = DraftResponse;

    fn name(&self) -> &str {
        "template-drafter"
    }

    async fn call(
        &self,
        request: DraftRequest,
        _timeout: Duration,
    ) -> Result<Scored<DraftResponse>, StageError> {
        let draft = Self::draft(&request);
        let confidence = draft.confidence;
        Ok(Scored::new(draft, confidence))
    }
}

// ── Validator ─────────────────────────────────────────────────────────────────

/// Structural checks on a draft: greeting, empathy, actions, closing, length.
#[derive(Debug, Clone, Default)]
pub struct RuleValidator;

struct Check {
    name: &'static str,
    passed: bool,
    score: u8,
    note: &'static str,
}

impl RuleValidator {
    pub fn validate(draft: &DraftResponse, sentiment: Sentiment) -> ValidationResult {
        let lower = draft.text.to_lowercase();
        let any = |words: &[&str]| words.iter().any(|w| lower.contains(w));

        let has_greeting = any(&["dear", "hello", "hi "]);
        let has_empathy = any(&["sorry", "apologize", "understand", "frustrat"]);
        let has_actions = any(&["we are", "we will", "we're", "investigating", "reviewing"]);
        let has_closing = any(&["regards", "thank", "sincerely", "best"]);
        let long_enough = draft.text.len() > 100;
        let needs_empathy = matches!(sentiment, Sentiment::Angry | Sentiment::Frustrated);

        let checks = [
            Check {
                name: "completeness",
                passed: has_actions,
                score: if has_actions { 7 } else { 5 },
                note: "needs specific actions",
            },
            Check {
                name: "empathy",
                passed: has_empathy || !needs_empathy,
                score: if has_empathy || !needs_empathy { 8 } else { 5 },
                note: "should acknowledge the customer's frustration",
            },
            Check {
                name: "specificity",
                passed: long_enough,
                score: if long_enough { 7 } else { 5 },
                note: "too short to be specific",
            },
            Check {
                name: "professionalism",
                passed: has_greeting && has_closing,
                score: if has_greeting && has_closing { 8 } else { 5 },
                note: "needs a greeting and a closing",
            },
        ];

        let failed: Vec<&Check> = checks.iter().filter(|c| !c.passed).collect();
        let quality_score =
            (checks.iter().map(|c| u32::from(c.score)).sum::<u32>() / checks.len() as u32) as u8;
        let approved = failed.is_empty() && quality_score >= 6;

        ValidationResult {
            approved,
            feedback: (!failed.is_empty()).then(|| {
                failed
                    .iter()
                    .map(|c| format!("{}: {}", c.name, c.note))
                    .collect::<Vec<_>>()
                    .join("; ")
            }),
            confidence: 0.6,
            issues: failed.iter().map(|c| c.name.to_string()).collect(),
            quality_score,
        }
    }
}

#[async_trait]
impl StageCapability for RuleValidator {
    type Request = ValidateRequest;
    type Output = ValidationResult;

    fn name(&self) -> &str {
        "rule-validator"
    }

    async fn call(
        &self,
        request: ValidateRequest,
        _timeout: Duration,
    ) -> Result<Scored<ValidationResult>, StageError> {
        let result = Self::validate(&request.draft, request.classification.sentiment);
        let confidence = result.confidence;
        Ok(Scored::new(result, confidence))
    }
}
