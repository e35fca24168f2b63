//! Stage Capability contract and the typed requests each stage receives.
//!
//! A capability is anything that can answer one analysis step: a model
//! behind HTTP, a rule table, or a test stub. The engine only sees trait
//! objects, so implementations are interchangeable per stage slot.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use triage::{
    ClassificationResult, Complaint, CustomerContext, DraftResponse, PipelineConfig,
    PriorityResult, StageError, ValidationResult,
};

/// A capability answer with its self-reported confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scored<T> {
    pub value: T,
    pub confidence: f64,
}

impl<T> Scored<T> {
    pub fn new(value: T, confidence: f64) -> Self {
        Self {
            value,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

/// One analysis step behind a fixed request/response contract.
///
/// Implementations receive owned copies of their inputs and should honour
/// `timeout`; the invocation wrapper enforces it regardless.
#[async_trait]
pub trait StageCapability: Send + Sync {
    type Request: Clone + Serialize + Send + Sync + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Name recorded in audit entries and logs.
    fn name(&self) -> &str;

    async fn call(
        &self,
        request: Self::Request,
        timeout: Duration,
    ) -> Result<Scored<Self::Output>, StageError>;
}

// ── Requests ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextRequest {
    pub customer_id: String,
    pub lookback_days: u32,
    /// Complaint being handled; its own earlier resolution is not history.
    pub complaint_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifyRequest {
    pub complaint: Complaint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrioritizeRequest {
    pub classification: ClassificationResult,
    pub context: CustomerContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DraftRequest {
    pub complaint: Complaint,
    pub classification: ClassificationResult,
    pub context: CustomerContext,
    pub priority: PriorityResult,
    /// Validator feedback from the previous rejected draft.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub iteration: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub complaint: Complaint,
    pub classification: ClassificationResult,
    pub draft: DraftResponse,
}

// ── Slots ─────────────────────────────────────────────────────────────────────

pub type DynCapability<Req, Out> = Arc<dyn StageCapability<Request = Req, Output = Out>>;

/// Primary capability plus an optional secondary tried once on exhaustion.
pub struct StageSlot<Req, Out> {
    pub primary: DynCapability<Req, Out>,
    pub secondary: Option<DynCapability<Req, Out>>,
}

impl<Req, Out> StageSlot<Req, Out> {
    pub fn new(primary: DynCapability<Req, Out>) -> Self {
        Self {
            primary,
            secondary: None,
        }
    }

    pub fn with_secondary(mut self, secondary: DynCapability<Req, Out>) -> Self {
        self.secondary = Some(secondary);
        self
    }
}

impl<Req, Out> Clone for StageSlot<Req, Out> {
    fn clone(&self) -> Self {
        Self {
            primary: Arc::clone(&self.primary),
            secondary: self.secondary.clone(),
        }
    }
}

/// Capabilities for every capability-backed stage.
#[derive(Clone)]
pub struct Capabilities {
    pub classify: StageSlot<ClassifyRequest, ClassificationResult>,
    pub prioritize: StageSlot<PrioritizeRequest, PriorityResult>,
    pub draft: StageSlot<DraftRequest, DraftResponse>,
    pub validate: StageSlot<ValidateRequest, ValidationResult>,
}

impl Capabilities {
    /// Rule-based capabilities only.
    pub fn rule_based(config: &PipelineConfig) -> Self {
        use crate::rules::{RuleClassifier, RulePrioritizer, RuleValidator, TemplateDrafter};
        Self {
            classify: StageSlot::new(Arc::new(RuleClassifier::new())),
            prioritize: StageSlot::new(Arc::new(RulePrioritizer::new(config.scoring.clone()))),
            draft: StageSlot::new(Arc::new(TemplateDrafter)),
            validate: StageSlot::new(Arc::new(RuleValidator)),
        }
    }

    /// HTTP primaries where an endpoint is configured, rules as secondary.
    ///
    /// Stages without an endpoint run on rules alone.
    pub fn from_config(config: &PipelineConfig) -> Self {
        use crate::http::HttpCapability;

        let mut caps = Self::rule_based(config);
        let client = reqwest::Client::new();

        if let Some(url) = &config.endpoints.classify {
            let rules = Arc::clone(&caps.classify.primary);
            caps.classify = StageSlot::new(Arc::new(HttpCapability::new(
                "http-classifier",
                url,
                client.clone(),
            )))
            .with_secondary(rules);
        }
        if let Some(url) = &config.endpoints.prioritize {
            let rules = Arc::clone(&caps.prioritize.primary);
            caps.prioritize = StageSlot::new(Arc::new(HttpCapability::new(
                "http-prioritizer",
                url,
                client.clone(),
            )))
            .with_secondary(rules);
        }
        if let Some(url) = &config.endpoints.draft {
            let rules = Arc::clone(&caps.draft.primary);
            caps.draft = StageSlot::new(Arc::new(HttpCapability::new(
                "http-drafter",
                url,
                client.clone(),
            )))
            .with_secondary(rules);
        }
        if let Some(url) = &config.endpoints.validate {
            let rules = Arc::clone(&caps.validate.primary);
            caps.validate = StageSlot::new(Arc::new(HttpCapability::new(
                "http-validator",
                url,
                client,
            )))
            .with_secondary(rules);
        }
        caps
    }
}
