//! Structured telemetry for pipeline runs.
//!
//! One [`WorkflowMetrics`] record per workflow. The CLI appends them to a
//! JSONL file, one complete JSON object per line.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::info;
use triage::{DegradationLevel, PipelineState, WorkflowState};

use crate::invoker::Invocation;

/// Metrics for one stage invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageMetrics {
    pub stage: String,
    pub attempts: u32,
    pub retries: u32,
    pub level: DegradationLevel,
    pub served_by: String,
    pub duration_ms: u64,
}

/// Complete record for one workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub workflow_id: String,
    pub complaint_id: String,
    pub stages: Vec<StageMetrics>,
    pub total_attempts: u32,
    pub total_retries: u32,
    /// Stage invocations not served by their primary capability.
    pub fallbacks: u32,
    pub drafts: u32,
    pub duration_ms: u64,
    /// Outcome state; `None` only if the run never reached one.
    pub terminal_state: Option<PipelineState>,
    pub final_priority: Option<u8>,
    pub timed_out: bool,
    pub timestamp: String,
}

/// Accumulates stage metrics while a workflow runs.
#[derive(Debug)]
pub struct MetricsCollector {
    started: Instant,
    stages: Vec<StageMetrics>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            stages: Vec::new(),
        }
    }

    pub fn record_stage<T>(&mut self, stage: &str, invocation: &Invocation<T>, elapsed: Duration) {
        self.stages.push(StageMetrics {
            stage: stage.to_string(),
            attempts: invocation.attempts,
            retries: invocation.retries,
            level: invocation.served.level,
            served_by: invocation.served.served_by.clone(),
            duration_ms: elapsed.as_millis() as u64,
        });
    }

    pub fn finalize(&self, state: &WorkflowState) -> WorkflowMetrics {
        WorkflowMetrics {
            workflow_id: state.workflow_id.clone(),
            complaint_id: state.complaint.complaint_id.clone(),
            total_attempts: self.stages.iter().map(|s| s.attempts).sum(),
            total_retries: self.stages.iter().map(|s| s.retries).sum(),
            fallbacks: self
                .stages
                .iter()
                .filter(|s| s.level != DegradationLevel::Full)
                .count() as u32,
            stages: self.stages.clone(),
            drafts: state.iteration_count,
            duration_ms: self.started.elapsed().as_millis() as u64,
            terminal_state: state.outcome(),
            final_priority: state.priority.as_ref().map(|p| p.score),
            timed_out: state.flags.timed_out,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

/// Append workflow metrics to a JSONL file.
pub async fn append_telemetry(metrics: &WorkflowMetrics, path: &Path) -> std::io::Result<()> {
    let mut line = serde_json::to_string(metrics)?;
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await?;
    info!(path = %path.display(), workflow_id = %metrics.workflow_id, "Appended workflow telemetry");
    Ok(())
}

/// Read back a telemetry JSONL file, skipping malformed lines.
pub async fn read_telemetry(path: &Path) -> std::io::Result<Vec<WorkflowMetrics>> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(text
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

/// Outcome counts across many workflows.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub workflows: usize,
    pub by_outcome: BTreeMap<String, usize>,
    pub total_retries: u32,
    pub total_fallbacks: u32,
    pub timed_out: usize,
}

impl RunSummary {
    pub fn from_metrics(metrics: &[WorkflowMetrics]) -> Self {
        let mut summary = Self {
            workflows: metrics.len(),
            ..Self::default()
        };
        for m in metrics {
            let outcome = m
                .terminal_state
                .map(|s| s.to_string())
                .unwrap_or_else(|| "NONE".to_string());
            *summary.by_outcome.entry(outcome).or_default() += 1;
            summary.total_retries += m.total_retries;
            summary.total_fallbacks += m.fallbacks;
            if m.timed_out {
                summary.timed_out += 1;
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(id: &str, state: PipelineState, retries: u32) -> WorkflowMetrics {
        WorkflowMetrics {
            workflow_id: id.to_string(),
            complaint_id: format!("c-{id}"),
            stages: vec![],
            total_attempts: 4,
            total_retries: retries,
            fallbacks: 0,
            drafts: 1,
            duration_ms: 12,
            terminal_state: Some(state),
            final_priority: Some(2),
            timed_out: false,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    #[tokio::test]
    async fn test_append_telemetry_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        append_telemetry(&metrics("a", PipelineState::AutoSent, 0), &path)
            .await
            .unwrap();
        append_telemetry(&metrics("b", PipelineState::Escalated, 2), &path)
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);

        let read = read_telemetry(&path).await.unwrap();
        assert_eq!(read[1].workflow_id, "b");
    }

    #[tokio::test]
    async fn test_append_telemetry_reports_unwritable_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("metrics.jsonl");
        let err = append_telemetry(&metrics("a", PipelineState::AutoSent, 0), &path)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
        assert!(!path.exists());
    }

    #[test]
    fn test_run_summary() {
        let all = vec![
            metrics("a", PipelineState::AutoSent, 0),
            metrics("b", PipelineState::AutoSent, 1),
            metrics("c", PipelineState::Escalated, 3),
        ];
        let summary = RunSummary::from_metrics(&all);
        assert_eq!(summary.workflows, 3);
        assert_eq!(summary.by_outcome["AUTO_SENT"], 2);
        assert_eq!(summary.total_retries, 4);
    }
}
