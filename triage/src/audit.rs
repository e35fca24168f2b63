//! Audit entries — one append-only record per stage attempt or decision.
//!
//! Inputs and outputs are not stored verbatim. Each entry carries a blake3
//! fingerprint of the canonical JSON, enough to prove which data a stage saw
//! without copying customer text into the log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome recorded for an audit entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// Capability answered.
    Ok,
    /// Attempt failed (timeout, provider error, invalid input).
    Failed,
    /// Secondary capability or constant default was used.
    Fallback,
    /// Engine decision (routing, escalation, loop exit, timeout).
    Decision,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub workflow_id: String,
    /// Position in the workflow's trail. Assigned when appended.
    pub seq: u64,
    pub stage: String,
    /// 1-indexed attempt number (0 for engine decisions).
    pub attempt: u32,
    pub input_fingerprint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_fingerprint: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    /// Set when a human changed a decision after the fact.
    #[serde(default)]
    pub human_override: bool,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub detail: serde_json::Value,
}

impl AuditEntry {
    /// Entry for a single capability attempt.
    pub fn attempt(
        workflow_id: &str,
        stage: &str,
        attempt: u32,
        input_fingerprint: &str,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            workflow_id: workflow_id.to_string(),
            seq: 0,
            stage: stage.to_string(),
            attempt,
            input_fingerprint: input_fingerprint.to_string(),
            output_fingerprint: None,
            timestamp: Utc::now(),
            confidence: None,
            human_override: false,
            outcome,
            error: None,
            decision: None,
            detail: serde_json::Value::Null,
        }
    }

    /// Entry for an engine decision.
    pub fn decision(
        workflow_id: &str,
        stage: &str,
        input_fingerprint: &str,
        decision: impl Into<String>,
    ) -> Self {
        let mut entry = Self::attempt(workflow_id, stage, 0, input_fingerprint, AuditOutcome::Decision);
        entry.decision = Some(decision.into());
        entry
    }

    pub fn with_output(mut self, output_fingerprint: String, confidence: Option<f64>) -> Self {
        self.output_fingerprint = Some(output_fingerprint);
        self.confidence = confidence;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = detail;
        self
    }
}

/// blake3 fingerprint of a value's JSON encoding (hex, 16 chars).
///
/// serde_json emits struct fields in declaration order and BTreeMaps
/// sorted, so equal values always hash equally. A value serde_json
/// rejects hashes its error text instead, so it never collides with the
/// empty encoding.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> String {
    let bytes = serde_json::to_vec(value)
        .unwrap_or_else(|e| format!("unserializable: {e}").into_bytes());
    let hash = blake3::hash(&bytes);
    hash.to_hex()[..16].to_string()
}

/// Whether `trail` is a valid append-only sequence for one workflow.
pub fn is_well_ordered(trail: &[AuditEntry]) -> bool {
    trail.windows(2).all(|w| {
        w[1].seq == w[0].seq + 1 && w[1].workflow_id == w[0].workflow_id && w[1].timestamp >= w[0].timestamp
    })
}
