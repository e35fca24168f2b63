//! Stage Invocation Wrapper.
//!
//! Every capability call goes through [`StageInvoker::invoke`]:
//!
//! ```text
//! primary ──ok──────────────────────────────────▶ Served::Full
//!    │ timeout / transient: backoff, retry (up to max_retries)
//!    │ exhausted or non-retriable
//!    ▼
//! secondary (once) ──ok─────────────────────────▶ Served::Partial
//!    │ failed / absent
//!    ▼
//! constant default ─────────────────────────────▶ Served::Unavailable
//! ```
//!
//! Each attempt yields one audit entry, sent to the caller's [`AttemptLog`]
//! as soon as the attempt finishes. An invocation cancelled midway still
//! leaves the entries of its finished attempts behind.

use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use triage::{fingerprint, AuditEntry, AuditOutcome, RetryPolicy, Served, StageError};

use crate::capability::{Scored, StageCapability, StageSlot};

/// Receives attempt entries in call order, sequence numbers unassigned.
pub type AttemptLog = mpsc::UnboundedSender<AuditEntry>;

fn log_attempt(log: &AttemptLog, entry: AuditEntry) {
    if let Err(e) = log.send(entry) {
        debug!(stage = %e.0.stage, "Attempt log closed, entry dropped");
    }
}

/// Outcome of one wrapped stage invocation.
#[derive(Debug)]
pub struct Invocation<T> {
    pub served: Served<T>,
    /// Calls made, across primary and secondary.
    pub attempts: u32,
    /// Retries of the primary after its first call.
    pub retries: u32,
    pub last_error: Option<StageError>,
}

#[derive(Debug, Clone)]
pub struct StageInvoker {
    timeout: Duration,
    retry: RetryPolicy,
}

impl StageInvoker {
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Self {
        Self { timeout, retry }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Call one capability, bounded by the stage timeout.
    async fn call_once<Req, Out>(
        &self,
        capability: &dyn StageCapability<Request = Req, Output = Out>,
        request: Req,
    ) -> Result<Scored<Out>, StageError>
    where
        Req: Clone + Serialize + Send + Sync + 'static,
        Out: Serialize + DeserializeOwned + Send + 'static,
    {
        match tokio::time::timeout(self.timeout, capability.call(request, self.timeout)).await {
            Ok(result) => result,
            Err(_) => Err(StageError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    pub async fn invoke<Req, Out>(
        &self,
        workflow_id: &str,
        stage: &str,
        slot: &StageSlot<Req, Out>,
        request: Req,
        default: impl FnOnce() -> Out + Send,
        log: &AttemptLog,
    ) -> Invocation<Out>
    where
        Req: Clone + Serialize + Send + Sync + 'static,
        Out: Serialize + DeserializeOwned + Send + 'static,
    {
        let input_fp = fingerprint(&request);
        let mut warnings = Vec::new();
        let mut attempts = 0u32;
        let mut retries = 0u32;
        let mut last_error = None;

        let entry = |attempt: u32, outcome: AuditOutcome| {
            AuditEntry::attempt(workflow_id, stage, attempt, &input_fp, outcome)
        };

        // Primary, with retries.
        let primary = slot.primary.as_ref();
        loop {
            attempts += 1;
            match self.call_once(primary, request.clone()).await {
                Ok(scored) => {
                    debug!(workflow_id, stage, attempt = attempts, capability = primary.name(), "Stage call succeeded");
                    log_attempt(
                        log,
                        entry(attempts, AuditOutcome::Ok)
                            .with_output(fingerprint(&scored.value), Some(scored.confidence)),
                    );
                    return Invocation {
                        served: Served::full(scored.value, scored.confidence, primary.name()),
                        attempts,
                        retries,
                        last_error,
                    };
                }
                Err(e) => {
                    log_attempt(
                        log,
                        entry(attempts, AuditOutcome::Failed).with_error(e.to_string()),
                    );
                    let retriable = e.is_retriable();
                    if retriable && self.retry.should_retry(retries) {
                        retries += 1;
                        let backoff = self.retry.backoff_duration(retries);
                        warn!(
                            workflow_id,
                            stage,
                            attempt = attempts,
                            category = %e.retry_category(),
                            backoff_ms = backoff.as_millis() as u64,
                            "Stage call failed, retrying: {e}"
                        );
                        last_error = Some(e);
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    warn!(
                        workflow_id,
                        stage,
                        attempts,
                        retriable,
                        "Primary capability {} exhausted: {e}",
                        primary.name()
                    );
                    warnings.push(format!("{} failed after {attempts} attempt(s): {e}", primary.name()));
                    last_error = Some(e);
                    break;
                }
            }
        }

        // Secondary, once.
        if let Some(secondary) = slot.secondary.as_deref() {
            attempts += 1;
            match self.call_once(secondary, request.clone()).await {
                Ok(scored) => {
                    warn!(workflow_id, stage, capability = secondary.name(), "Served by secondary capability");
                    log_attempt(
                        log,
                        entry(attempts, AuditOutcome::Fallback)
                            .with_output(fingerprint(&scored.value), Some(scored.confidence)),
                    );
                    return Invocation {
                        served: Served::partial(
                            scored.value,
                            scored.confidence,
                            secondary.name(),
                            warnings,
                        ),
                        attempts,
                        retries,
                        last_error,
                    };
                }
                Err(e) => {
                    log_attempt(
                        log,
                        entry(attempts, AuditOutcome::Failed).with_error(e.to_string()),
                    );
                    warnings.push(format!("{} failed: {e}", secondary.name()));
                    last_error = Some(e);
                }
            }
        }

        // Constant default.
        let payload = default();
        warn!(workflow_id, stage, "All capabilities failed, using default");
        let mut fallback = entry(0, AuditOutcome::Fallback)
            .with_output(fingerprint(&payload), Some(0.0))
            .with_error(warnings.join("; "));
        fallback.decision = Some("constant default".to_string());
        log_attempt(log, fallback);

        Invocation {
            served: Served::unavailable(payload, warnings),
            attempts,
            retries,
            last_error,
        }
    }
}
