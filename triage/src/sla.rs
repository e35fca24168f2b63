//! SLA deadlines derived from priority.
//!
//! The deadline is anchored at the complaint's receipt time. It is set when
//! priority is first computed and may only move earlier afterwards.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SlaTargets;
use crate::types::{PriorityLevel, PriorityResult};

/// Deadline record for one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlaRecord {
    pub deadline: DateTime<Utc>,
    /// Priority score the current deadline was derived from.
    pub derived_from_score: u8,
    pub level: PriorityLevel,
    /// Every deadline held, oldest first.
    pub history: Vec<DateTime<Utc>>,
}

impl SlaRecord {
    /// Derive the initial deadline from the first priority result.
    pub fn derive(
        received_at: DateTime<Utc>,
        priority: &PriorityResult,
        targets: &SlaTargets,
    ) -> Self {
        let deadline = deadline_for(received_at, priority.level, targets);
        Self {
            deadline,
            derived_from_score: priority.score,
            level: priority.level,
            history: vec![deadline],
        }
    }

    /// Tighten the deadline after a priority revision. Returns whether it moved.
    ///
    /// A revision that would relax the deadline is ignored.
    pub fn tighten(
        &mut self,
        received_at: DateTime<Utc>,
        priority: &PriorityResult,
        targets: &SlaTargets,
    ) -> bool {
        if priority.score <= self.derived_from_score {
            return false;
        }
        let candidate = deadline_for(received_at, priority.level, targets);
        if candidate >= self.deadline {
            return false;
        }
        self.deadline = candidate;
        self.derived_from_score = priority.score;
        self.level = priority.level;
        self.history.push(candidate);
        true
    }

    /// Time left until the deadline (negative once breached).
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.deadline - now
    }

    pub fn is_breached(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }
}

pub fn deadline_for(
    received_at: DateTime<Utc>,
    level: PriorityLevel,
    targets: &SlaTargets,
) -> DateTime<Utc> {
    received_at + Duration::minutes(i64::from(targets.minutes_for(level)))
}
