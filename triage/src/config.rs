//! Pipeline configuration — one immutable value handed to the engine.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Environment variable overrides (`RESOLVER_*`)
//! 2. Values from a TOML file
//! 3. Built-in defaults
//!
//! | Variable                         | Field                  |
//! |----------------------------------|------------------------|
//! | `RESOLVER_CONFIDENCE_THRESHOLD`  | `confidence_threshold` |
//! | `RESOLVER_MAX_ITERATIONS`        | `max_iterations`       |
//! | `RESOLVER_STAGE_TIMEOUT_MS`      | `stage_timeout_ms`     |
//! | `RESOLVER_OVERALL_BUDGET_MS`     | `overall_budget_ms`    |
//! | `RESOLVER_CONCURRENCY_LIMIT`     | `concurrency_limit`    |
//! | `RESOLVER_CLASSIFY_URL`          | `endpoints.classify`   |
//! | `RESOLVER_DRAFT_URL`             | `endpoints.draft`      |
//! | `RESOLVER_VALIDATE_URL`          | `endpoints.validate`   |

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use crate::types::{Category, PriorityLevel};

const ENV_CONFIDENCE_THRESHOLD: &str = "RESOLVER_CONFIDENCE_THRESHOLD";
const ENV_MAX_ITERATIONS: &str = "RESOLVER_MAX_ITERATIONS";
const ENV_STAGE_TIMEOUT_MS: &str = "RESOLVER_STAGE_TIMEOUT_MS";
const ENV_OVERALL_BUDGET_MS: &str = "RESOLVER_OVERALL_BUDGET_MS";
const ENV_CONCURRENCY_LIMIT: &str = "RESOLVER_CONCURRENCY_LIMIT";
const ENV_CLASSIFY_URL: &str = "RESOLVER_CLASSIFY_URL";
const ENV_PRIORITIZE_URL: &str = "RESOLVER_PRIORITIZE_URL";
const ENV_DRAFT_URL: &str = "RESOLVER_DRAFT_URL";
const ENV_VALIDATE_URL: &str = "RESOLVER_VALIDATE_URL";

/// What to do when a stage's capabilities are exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageFailurePolicy {
    /// Substitute the rule-based default and keep going.
    #[default]
    Fallback,
    /// Move the workflow to FAILED for manual processing.
    FailWorkflow,
}

/// Per-stage failure policy. Context failures always fall back to an empty context.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StagePolicies {
    pub classify: StageFailurePolicy,
    pub prioritize: StageFailurePolicy,
    pub draft: StageFailurePolicy,
    pub validate: StageFailurePolicy,
}

/// Base scores and modifier weights for priority scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// Base score per dominant category.
    pub base_scores: BTreeMap<Category, u8>,
    /// Base score for categories missing from the table.
    pub default_base: u8,
    pub repeat_complaint: u8,
    pub angry_sentiment: u8,
    pub vip_customer: u8,
    pub legal_threat: u8,
    pub sla_breach_risk: u8,
    /// Predicted breach probability above which `sla_breach_risk` applies.
    pub sla_breach_probability_threshold: f64,
}

impl ScoringConfig {
    pub fn base_for(&self, category: Category) -> u8 {
        self.base_scores
            .get(&category)
            .copied()
            .unwrap_or(self.default_base)
    }
}

impl Default for ScoringConfig {
    fn default() -> Self {
        let base_scores = BTreeMap::from([
            (Category::Legal, 4),
            (Category::Billing, 3),
            (Category::Shipping, 2),
            (Category::Product, 2),
            (Category::Service, 2),
            (Category::Technical, 2),
            (Category::Feedback, 1),
            (Category::Other, 2),
        ]);
        Self {
            base_scores,
            default_base: 2,
            repeat_complaint: 2,
            angry_sentiment: 1,
            vip_customer: 1,
            legal_threat: 3,
            sla_breach_risk: 2,
            sla_breach_probability_threshold: 0.6,
        }
    }
}

/// Response-time targets per priority level, in minutes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaTargets {
    pub critical_minutes: u32,
    pub high_minutes: u32,
    pub medium_minutes: u32,
    pub low_minutes: u32,
    pub minimal_minutes: u32,
}

impl SlaTargets {
    pub fn minutes_for(&self, level: PriorityLevel) -> u32 {
        match level {
            PriorityLevel::Critical => self.critical_minutes,
            PriorityLevel::High => self.high_minutes,
            PriorityLevel::Medium => self.medium_minutes,
            PriorityLevel::Low => self.low_minutes,
            PriorityLevel::Minimal => self.minimal_minutes,
        }
    }
}

impl Default for SlaTargets {
    fn default() -> Self {
        Self {
            critical_minutes: 60,
            high_minutes: 240,
            medium_minutes: 480,
            low_minutes: 1440,
            minimal_minutes: 2880,
        }
    }
}

/// Optional HTTP endpoints for model-backed stage capabilities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub classify: Option<String>,
    pub prioritize: Option<String>,
    pub draft: Option<String>,
    pub validate: Option<String>,
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Minimum classification confidence before human review is required.
    pub confidence_threshold: f64,
    /// Maximum drafts in the draft↔validate loop.
    pub max_iterations: u32,
    pub scoring: ScoringConfig,
    pub sla: SlaTargets,
    /// Window for "open complaint on the same issue".
    pub lookback_days: u32,
    /// Per-call timeout for stage capabilities.
    pub stage_timeout_ms: u64,
    pub retry: RetryPolicy,
    pub stage_policies: StagePolicies,
    /// Priority used when the priority stage is unavailable.
    pub priority_floor: u8,
    /// Wall-clock budget for a whole workflow.
    pub overall_budget_ms: u64,
    /// Maximum workflows in flight.
    pub concurrency_limit: usize,
    /// Fetch context concurrently with classification.
    pub concurrent_context: bool,
    pub endpoints: EndpointConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.7,
            max_iterations: 3,
            scoring: ScoringConfig::default(),
            sla: SlaTargets::default(),
            lookback_days: 30,
            stage_timeout_ms: 10_000,
            retry: RetryPolicy::default(),
            stage_policies: StagePolicies::default(),
            priority_floor: 3,
            overall_budget_ms: 120_000,
            concurrency_limit: 16,
            concurrent_context: false,
            endpoints: EndpointConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Parse from TOML text. Missing fields keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an optional file, apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                toml::from_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|var| std::env::var(var).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `RESOLVER_*` overrides from `lookup` (the environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = parse_override(&lookup, ENV_CONFIDENCE_THRESHOLD)? {
            self.confidence_threshold = v;
        }
        if let Some(v) = parse_override(&lookup, ENV_MAX_ITERATIONS)? {
            self.max_iterations = v;
        }
        if let Some(v) = parse_override(&lookup, ENV_STAGE_TIMEOUT_MS)? {
            self.stage_timeout_ms = v;
        }
        if let Some(v) = parse_override(&lookup, ENV_OVERALL_BUDGET_MS)? {
            self.overall_budget_ms = v;
        }
        if let Some(v) = parse_override(&lookup, ENV_CONCURRENCY_LIMIT)? {
            self.concurrency_limit = v;
        }
        if let Some(url) = lookup(ENV_CLASSIFY_URL) {
            self.endpoints.classify = Some(url);
        }
        if let Some(url) = lookup(ENV_PRIORITIZE_URL) {
            self.endpoints.prioritize = Some(url);
        }
        if let Some(url) = lookup(ENV_DRAFT_URL) {
            self.endpoints.draft = Some(url);
        }
        if let Some(url) = lookup(ENV_VALIDATE_URL) {
            self.endpoints.validate = Some(url);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(ConfigError::Invalid(format!(
                "confidence_threshold {} outside [0, 1]",
                self.confidence_threshold
            )));
        }
        if self.max_iterations == 0 {
            return Err(ConfigError::Invalid("max_iterations must be >= 1".into()));
        }
        if !(1..=5).contains(&self.priority_floor) {
            return Err(ConfigError::Invalid(format!(
                "priority_floor {} outside 1..=5",
                self.priority_floor
            )));
        }
        if let Some((category, score)) = self
            .scoring
            .base_scores
            .iter()
            .find(|(_, s)| !(1..=5).contains(*s))
        {
            return Err(ConfigError::Invalid(format!(
                "base score {score} for {category} outside 1..=5"
            )));
        }
        if !(1..=5).contains(&self.scoring.default_base) {
            return Err(ConfigError::Invalid("default_base outside 1..=5".into()));
        }
        if !(0.0..=1.0).contains(&self.scoring.sla_breach_probability_threshold) {
            return Err(ConfigError::Invalid(
                "sla_breach_probability_threshold outside [0, 1]".into(),
            ));
        }
        let sla = &self.sla;
        let ordered = sla.critical_minutes <= sla.high_minutes
            && sla.high_minutes <= sla.medium_minutes
            && sla.medium_minutes <= sla.low_minutes
            && sla.low_minutes <= sla.minimal_minutes;
        if !ordered || sla.critical_minutes == 0 {
            return Err(ConfigError::Invalid(
                "SLA targets must be positive and tighten with priority".into(),
            ));
        }
        if self.stage_timeout_ms == 0 || self.overall_budget_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be positive".into()));
        }
        if self.concurrency_limit == 0 {
            return Err(ConfigError::Invalid("concurrency_limit must be >= 1".into()));
        }
        Ok(())
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_millis(self.stage_timeout_ms)
    }

    pub fn overall_budget(&self) -> Duration {
        Duration::from_millis(self.overall_budget_ms)
    }
}

fn parse_override<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(var) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Env {
                var: var.to_string(),
                value,
            }),
    }
}
