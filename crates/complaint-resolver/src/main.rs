use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use complaint_resolver::telemetry::{append_telemetry, RunSummary};
use complaint_resolver::{
    AuditSink, Capabilities, CustomerProfile, InMemoryAuditSink, InMemoryMemoryStore,
    JsonlAuditSink, PipelineEngine, WorkflowReport,
};
use serde::Deserialize;
use tracing::{info, warn};
use triage::{Channel, Complaint, PipelineConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Triage, draft, validate and route customer complaints", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Process every complaint in a JSONL file and print one report per line
    Run {
        /// Complaints, one JSON object per line
        #[arg(long)]
        input: PathBuf,

        /// TOML config file (RESOLVER_* environment variables override it)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Append audit entries to this JSONL file
        #[arg(long)]
        audit_log: Option<PathBuf>,

        /// Append per-workflow metrics to this JSONL file
        #[arg(long)]
        telemetry: Option<PathBuf>,

        /// Seed the memory store with customer profiles (JSON array)
        #[arg(long)]
        profiles: Option<PathBuf>,

        /// Print full reports instead of summaries
        #[arg(long, default_value_t = false)]
        full: bool,
    },

    /// Print the effective configuration as TOML
    ShowConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// One input line. Only customer and text are required.
#[derive(Debug, Deserialize)]
struct ComplaintRecord {
    complaint_id: Option<String>,
    customer_id: String,
    channel: Option<Channel>,
    #[serde(alias = "raw_text")]
    text: String,
    received_at: Option<DateTime<Utc>>,
    #[serde(default)]
    urgency_signals: Vec<String>,
}

impl ComplaintRecord {
    fn into_complaint(self, line: usize) -> Complaint {
        let id = self
            .complaint_id
            .unwrap_or_else(|| format!("line-{line}"));
        let mut complaint = Complaint::new(
            id,
            self.customer_id,
            self.channel.unwrap_or(Channel::Email),
            self.text.trim(),
        );
        if let Some(at) = self.received_at {
            complaint = complaint.received_at(at);
        }
        complaint.urgency_signals = self.urgency_signals;
        complaint
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Run {
            input,
            config,
            audit_log,
            telemetry,
            profiles,
            full,
        } => {
            run(
                &input,
                config.as_deref(),
                audit_log,
                telemetry.as_deref(),
                profiles.as_deref(),
                full,
            )
            .await
        }
        Command::ShowConfig { config } => {
            let config = PipelineConfig::load(config.as_deref()).context("loading config")?;
            let text = toml::to_string_pretty(&config).context("rendering config")?;
            println!("{text}");
            Ok(())
        }
    }
}

async fn run(
    input: &Path,
    config_path: Option<&Path>,
    audit_log: Option<PathBuf>,
    telemetry: Option<&Path>,
    profiles: Option<&Path>,
    full: bool,
) -> Result<()> {
    let config = PipelineConfig::load(config_path).context("loading config")?;
    info!(
        threshold = config.confidence_threshold,
        max_iterations = config.max_iterations,
        concurrency = config.concurrency_limit,
        classify_endpoint = config.endpoints.classify.as_deref().unwrap_or("rules"),
        "Complaint resolver starting"
    );

    let memory = Arc::new(InMemoryMemoryStore::new());
    if let Some(path) = profiles {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading profiles {}", path.display()))?;
        let seeded: Vec<CustomerProfile> =
            serde_json::from_str(&text).context("parsing customer profiles")?;
        info!(count = seeded.len(), "Seeded customer profiles");
        for profile in seeded {
            memory.insert_profile(profile).await;
        }
    }

    let audit: Arc<dyn AuditSink> = match audit_log {
        Some(path) => {
            info!(path = %path.display(), "Appending audit entries");
            Arc::new(JsonlAuditSink::new(path))
        }
        None => Arc::new(InMemoryAuditSink::new()),
    };

    let capabilities = Capabilities::from_config(&config);
    let engine = PipelineEngine::new(config, capabilities, memory, audit);

    let text = std::fs::read_to_string(input)
        .with_context(|| format!("reading complaints {}", input.display()))?;
    let mut ids = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: ComplaintRecord = serde_json::from_str(line)
            .with_context(|| format!("parsing complaint on line {}", idx + 1))?;
        ids.push(engine.submit(record.into_complaint(idx + 1)).await);
    }
    info!(count = ids.len(), "Submitted complaints");

    let reports = futures::future::join_all(ids.iter().map(|id| engine.wait(id))).await;
    let mut metrics = Vec::with_capacity(ids.len());
    for (id, report) in ids.iter().zip(reports) {
        let report = report.with_context(|| format!("waiting for workflow {id}"))?;
        if let Some(path) = telemetry {
            append_telemetry(&report.metrics, path)
                .await
                .with_context(|| format!("appending telemetry to {}", path.display()))?;
        }
        println!("{}", render(&report, full)?);
        metrics.push(report.metrics);
    }

    let summary = RunSummary::from_metrics(&metrics);
    info!(
        workflows = summary.workflows,
        outcomes = ?summary.by_outcome,
        retries = summary.total_retries,
        fallbacks = summary.total_fallbacks,
        timed_out = summary.timed_out,
        "Run complete"
    );

    let deferred = engine.deferred_resolutions().await;
    if !deferred.is_empty() {
        warn!(count = deferred.len(), "Resolutions deferred for manual reprocessing");
        for summary in &deferred {
            warn!(resolution_id = %summary.resolution_id, customer_id = %summary.customer_id, "  deferred");
        }
    }
    Ok(())
}

fn render(report: &WorkflowReport, full: bool) -> Result<String> {
    if full {
        return serde_json::to_string(report).context("encoding report");
    }
    let snap = &report.snapshot;
    let summary = serde_json::json!({
        "workflow_id": snap.workflow_id,
        "complaint_id": snap.complaint_id,
        "outcome": snap.outcome,
        "priority": snap.priority.as_ref().map(|p| p.score),
        "drafts": snap.iteration_count,
        "escalation": snap.escalation,
        "flags": snap.flags,
        "sla_deadline": snap.sla.as_ref().map(|s| s.deadline),
        "response": snap.draft.as_ref().map(|d| &d.text),
        "decisions": snap.decisions,
        "hard_failure": report.hard_failure,
    });
    serde_json::to_string(&summary).context("encoding report summary")
}
