//! Resilience — degradation envelope for stage results.
//!
//! Instead of hard errors, every stage invocation yields a [`Served`] value
//! that says which tier produced it and how much it can be trusted.
//!
//! ```text
//! Stage call
//!   ├─ Primary succeeds              → Served { level: Full, .. }
//!   ├─ Primary fails, secondary ok   → Served { level: Partial, warnings, .. }
//!   └─ All fail                      → Served { level: Unavailable, payload: default }
//! ```

use serde::{Deserialize, Serialize};

/// How much of a stage's capability was available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    /// Primary capability answered.
    Full,
    /// Secondary (usually rule-based) capability answered.
    Partial,
    /// Nothing answered; the payload is the constant default.
    Unavailable,
}

impl std::fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Partial => write!(f, "partial"),
            Self::Unavailable => write!(f, "unavailable"),
        }
    }
}

/// A stage payload wrapped with degradation metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Served<T> {
    pub payload: T,
    pub level: DegradationLevel,
    /// Confidence reported by the capability (0.0 when unavailable).
    pub confidence: f64,
    /// Which capability produced the payload.
    pub served_by: String,
    pub warnings: Vec<String>,
}

impl<T> Served<T> {
    pub fn full(payload: T, confidence: f64, served_by: &str) -> Self {
        Self {
            payload,
            level: DegradationLevel::Full,
            confidence: confidence.clamp(0.0, 1.0),
            served_by: served_by.to_string(),
            warnings: Vec::new(),
        }
    }

    pub fn partial(payload: T, confidence: f64, served_by: &str, warnings: Vec<String>) -> Self {
        Self {
            payload,
            level: DegradationLevel::Partial,
            confidence: confidence.clamp(0.0, 1.0),
            served_by: served_by.to_string(),
            warnings,
        }
    }

    pub fn unavailable(payload: T, warnings: Vec<String>) -> Self {
        Self {
            payload,
            level: DegradationLevel::Unavailable,
            confidence: 0.0,
            served_by: "default".to_string(),
            warnings,
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.level != DegradationLevel::Full
    }

    pub fn is_unavailable(&self) -> bool {
        self.level == DegradationLevel::Unavailable
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Served<U> {
        Served {
            payload: f(self.payload),
            level: self.level,
            confidence: self.confidence,
            served_by: self.served_by,
            warnings: self.warnings,
        }
    }
}
