//! Customer Memory Store contract and its in-memory implementation.
//!
//! The store is read once per workflow at the context stage and written
//! once at finalization. Writes are idempotent by resolution ID, and the
//! engine serializes them per customer through [`CustomerLocks`].
//!
//! A context read names the complaint being handled. Its own earlier
//! resolution is left out of the snapshot, so resubmitting a complaint sees
//! the same history as the first run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;
use triage::{
    Category, CustomerContext, CustomerTier, PipelineState, StageError, WorkflowSnapshot,
};

use crate::capability::{ContextRequest, Scored, StageCapability};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MemoryError {
    #[error("Customer not found: {0}")]
    NotFound(String),

    #[error("Memory store unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to record resolution {resolution_id}: {message}")]
    Write {
        resolution_id: String,
        message: String,
    },
}

/// What the store keeps about one finished workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionSummary {
    /// Idempotency key. Equal to the complaint ID, so resubmissions dedupe.
    pub resolution_id: String,
    pub workflow_id: String,
    pub customer_id: String,
    pub outcome: PipelineState,
    #[serde(default)]
    pub categories: Vec<Category>,
    pub priority: u8,
    pub escalated: bool,
    pub resolved_at: DateTime<Utc>,
}

impl ResolutionSummary {
    pub fn from_snapshot(snapshot: &WorkflowSnapshot) -> Self {
        Self {
            resolution_id: snapshot.complaint_id.clone(),
            workflow_id: snapshot.workflow_id.clone(),
            customer_id: snapshot.customer_id.clone(),
            outcome: snapshot.outcome.unwrap_or(snapshot.state),
            categories: snapshot
                .classification
                .as_ref()
                .map(|c| c.categories.clone())
                .unwrap_or_default(),
            priority: snapshot.priority.as_ref().map(|p| p.score).unwrap_or(0),
            escalated: snapshot.flags.escalated,
            resolved_at: snapshot.finished_at.unwrap_or_else(Utc::now),
        }
    }

    /// Whether the complaint still needs human attention.
    pub fn is_open(&self) -> bool {
        matches!(
            self.outcome,
            PipelineState::QueuedForReview | PipelineState::Escalated | PipelineState::Failed
        )
    }
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Customer snapshot for handling `complaint_id`. A resolution already
    /// recorded under that ID is not part of the snapshot.
    async fn get_customer_context(
        &self,
        customer_id: &str,
        lookback_days: u32,
        complaint_id: &str,
    ) -> Result<CustomerContext, MemoryError>;

    /// Record a finished workflow. Recording the same resolution ID twice is a no-op.
    async fn record_resolution(
        &self,
        customer_id: &str,
        summary: ResolutionSummary,
    ) -> Result<(), MemoryError>;
}

// ── In-memory store ───────────────────────────────────────────────────────────

/// Long-lived profile for one customer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomerProfile {
    pub customer_id: String,
    pub tier: CustomerTier,
    #[serde(default)]
    pub vip: bool,
    /// Complaints recorded before this store started tracking the customer.
    #[serde(default)]
    pub prior_complaints: u32,
    /// Churn risk supplied by an upstream system; the computed value never goes below it.
    #[serde(default)]
    pub churn_floor: f64,
    #[serde(default)]
    pub resolutions: Vec<ResolutionSummary>,
}

impl CustomerProfile {
    pub fn new(customer_id: impl Into<String>, tier: CustomerTier) -> Self {
        Self {
            customer_id: customer_id.into(),
            tier,
            vip: false,
            prior_complaints: 0,
            churn_floor: 0.0,
            resolutions: Vec::new(),
        }
    }

    /// Snapshot the profile as seen at `now` with the given lookback window,
    /// ignoring any resolution recorded under `complaint_id`.
    pub fn context_at(
        &self,
        now: DateTime<Utc>,
        lookback_days: u32,
        complaint_id: &str,
    ) -> CustomerContext {
        let since = now - chrono::Duration::days(i64::from(lookback_days));
        let history: Vec<ResolutionSummary> = self
            .resolutions
            .iter()
            .filter(|r| r.resolution_id != complaint_id)
            .cloned()
            .collect();
        let recent: Vec<&ResolutionSummary> =
            history.iter().filter(|r| r.resolved_at >= since).collect();
        let lifetime = self.prior_complaints + history.len() as u32;

        let mut open_issue_categories = Vec::new();
        for r in recent.iter().filter(|r| r.is_open()) {
            if let Some(&dominant) = r.categories.first() {
                if !open_issue_categories.contains(&dominant) {
                    open_issue_categories.push(dominant);
                }
            }
        }

        let computed = churn_risk(lifetime, recent.len(), declining_trend(&history));

        CustomerContext {
            tier: self.tier,
            lifetime_complaints: lifetime,
            open_issue_categories,
            churn_risk: computed.max(self.churn_floor).clamp(0.0, 1.0),
            vip: self.vip,
        }
    }
}

/// Churn risk from complaint volume, recency and outcome trend.
pub fn churn_risk(total: u32, recent: usize, declining: bool) -> f64 {
    let mut risk: f64 = match total {
        0 => 0.0,
        1..=2 => 0.1,
        3..=4 => 0.2,
        _ => 0.3,
    };
    risk += match recent {
        0 => 0.0,
        1 => 0.15,
        _ => 0.3,
    };
    if declining {
        risk += 0.2;
    }
    risk.min(1.0)
}

/// The two most recent resolutions both needed a human.
fn declining_trend(resolutions: &[ResolutionSummary]) -> bool {
    let mut latest: Vec<&ResolutionSummary> = resolutions.iter().collect();
    latest.sort_by_key(|r| std::cmp::Reverse(r.resolved_at));
    latest.len() >= 2 && latest[..2].iter().all(|r| r.is_open())
}

/// Profiles keyed by customer ID, held in process.
#[derive(Debug, Default)]
pub struct InMemoryMemoryStore {
    profiles: RwLock<HashMap<String, CustomerProfile>>,
}

impl InMemoryMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_profile(&self, profile: CustomerProfile) {
        self.profiles
            .write()
            .await
            .insert(profile.customer_id.clone(), profile);
    }

    pub async fn profile(&self, customer_id: &str) -> Option<CustomerProfile> {
        self.profiles.read().await.get(customer_id).cloned()
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn get_customer_context(
        &self,
        customer_id: &str,
        lookback_days: u32,
        complaint_id: &str,
    ) -> Result<CustomerContext, MemoryError> {
        let profiles = self.profiles.read().await;
        let profile = profiles
            .get(customer_id)
            .ok_or_else(|| MemoryError::NotFound(customer_id.to_string()))?;
        Ok(profile.context_at(Utc::now(), lookback_days, complaint_id))
    }

    async fn record_resolution(
        &self,
        customer_id: &str,
        summary: ResolutionSummary,
    ) -> Result<(), MemoryError> {
        let mut profiles = self.profiles.write().await;
        let profile = profiles
            .entry(customer_id.to_string())
            .or_insert_with(|| CustomerProfile::new(customer_id, CustomerTier::Standard));
        if profile
            .resolutions
            .iter()
            .any(|r| r.resolution_id == summary.resolution_id)
        {
            debug!(resolution_id = %summary.resolution_id, "Resolution already recorded");
            return Ok(());
        }
        profile.resolutions.push(summary);
        Ok(())
    }
}

// ── Context capability ────────────────────────────────────────────────────────

/// Result of the context stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextLookup {
    pub context: CustomerContext,
    pub known_customer: bool,
}

/// Exposes a [`MemoryStore`] read as a stage capability so the context
/// fetch gets the same timeout, retry and audit treatment as other stages.
pub struct MemoryContext {
    store: Arc<dyn MemoryStore>,
}

impl MemoryContext {
    pub fn new(store: Arc<dyn MemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StageCapability for MemoryContext {
    type Request = ContextRequest;
    type Output = ContextLookup;

    fn name(&self) -> &str {
        "memory-store"
    }

    async fn call(
        &self,
        request: ContextRequest,
        _timeout: Duration,
    ) -> Result<Scored<ContextLookup>, StageError> {
        match self
            .store
            .get_customer_context(
                &request.customer_id,
                request.lookback_days,
                &request.complaint_id,
            )
            .await
        {
            Ok(context) => Ok(Scored::new(
                ContextLookup {
                    context,
                    known_customer: true,
                },
                1.0,
            )),
            Err(MemoryError::NotFound(_)) => Ok(Scored::new(
                ContextLookup {
                    context: CustomerContext::empty(),
                    known_customer: false,
                },
                1.0,
            )),
            Err(e) => Err(StageError::transient(e.to_string())),
        }
    }
}

// ── Per-customer locks ────────────────────────────────────────────────────────

/// Keyed async mutex serializing finalization per customer.
///
/// An entry lives only while some task holds or waits for it.
#[derive(Debug, Default)]
pub struct CustomerLocks {
    locks: SyncMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CustomerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, customer_id: &str) -> CustomerGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(customer_id.to_string()).or_default())
        };
        let guard = lock.lock_owned().await;
        CustomerGuard {
            locks: self,
            customer_id: customer_id.to_string(),
            guard: Some(guard),
        }
    }

    /// Customers with a lock currently held or awaited.
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&self, customer_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        // The map's own reference is the last one: nobody holds or awaits it.
        if locks
            .get(customer_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(customer_id);
        }
    }
}

/// Held while a customer's resolution is being recorded.
pub struct CustomerGuard<'a> {
    locks: &'a CustomerLocks,
    customer_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for CustomerGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(&self.customer_id);
    }
}
