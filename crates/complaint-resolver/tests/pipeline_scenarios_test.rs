//! End-to-end pipeline scenarios against stub capabilities.
//!
//! Covers the four reference scenarios, contradictory signals, the
//! draft/validate loop bound, idempotence across resubmission, and the
//! audit chain every finished workflow must carry.

mod common;

use std::sync::Arc;

use common::*;
use complaint_resolver::{
    Capabilities, DraftRequest, DynCapability, InMemoryAuditSink, InMemoryMemoryStore,
    JsonlAuditSink, PipelineEngine, StageSlot,
};
use triage::{
    Category, CustomerContext, DraftResponse, EscalationReason, HandlerLevel, Intent,
    PipelineConfig, PipelineState, Sentiment, ThreatSignal,
};

fn repeat_shipping_context() -> CustomerContext {
    CustomerContext {
        lifetime_complaints: 1,
        open_issue_categories: vec![Category::Shipping],
        churn_risk: 0.1,
        ..CustomerContext::empty()
    }
}

// ── Reference scenarios ───────────────────────────────────────────────────────

#[tokio::test]
async fn scenario_a_capped_priority_escalates() {
    let config = PipelineConfig::default();
    let classified = classification(
        vec![Category::Shipping, Category::Billing],
        Sentiment::Angry,
        Intent::Chargeback,
        0.9,
    )
    .with_threat(ThreatSignal::Chargeback);
    let caps = capabilities(&config, classified, ScriptedValidator::approving());
    let (engine, memory, _) = engine(config, caps, repeat_shipping_context());

    let report = engine
        .process(complaint(
            "a",
            "My package is late AGAIN and you double charged me. I will file a chargeback.",
        ))
        .await
        .unwrap();
    let snap = report.snapshot;

    assert_eq!(snap.outcome, Some(PipelineState::Escalated));
    assert_eq!(snap.state, PipelineState::Done);
    let priority = snap.priority.as_ref().unwrap();
    assert_eq!(priority.score, 5);
    assert_eq!(priority.base_score, 2);
    assert_eq!(priority.modifier_total, 6);
    assert!(snap.flags.escalated);
    assert!(snap.flags.requires_human_review);

    let escalation = snap.escalation.as_ref().unwrap();
    assert_eq!(escalation.reason, EscalationReason::CriticalPriority { score: 5 });
    assert_eq!(escalation.assigned_team, "legal_team");
    assert_eq!(escalation.handler, HandlerLevel::Manager);

    let recorded = memory.recorded();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].outcome, PipelineState::Escalated);
    assert!(recorded[0].escalated);
}

#[tokio::test]
async fn scenario_b_minimal_feedback_auto_sends() {
    let config = PipelineConfig::default();
    let validator = ScriptedValidator::approving();
    let classified = classification(vec![Category::Feedback], Sentiment::Positive, Intent::Praise, 0.9);
    let caps = capabilities(&config, classified, validator.clone());
    let (engine, _, _) = engine(config, caps, CustomerContext::empty());

    let report = engine
        .process(complaint("b", "Just wanted to say the new app is great, thanks!"))
        .await
        .unwrap();
    let snap = report.snapshot;

    assert_eq!(snap.outcome, Some(PipelineState::AutoSent));
    assert_eq!(snap.priority_history, vec![1]);
    assert_eq!(snap.iteration_count, 1);
    assert_eq!(validator.calls(), 1);
    assert!(!snap.flags.requires_human_review);
    assert!(snap.escalation.is_none());
    assert!(snap.draft.is_some());
    assert!(report.hard_failure.is_none());
}

#[tokio::test]
async fn scenario_c_loop_stops_at_max_and_queues() {
    let config = PipelineConfig::default();
    let validator = ScriptedValidator::rejecting();
    let classified = classification(vec![Category::Billing], Sentiment::Neutral, Intent::Refund, 0.9);
    let caps = capabilities(&config, classified, validator.clone());
    let (engine, _, _) = engine(config, caps, CustomerContext::empty());

    let snap = engine
        .process(complaint("c", "I would like a refund for last month's invoice."))
        .await
        .unwrap()
        .snapshot;

    assert_eq!(validator.calls(), 3);
    assert_eq!(snap.iteration_count, 3);
    assert_eq!(snap.outcome, Some(PipelineState::QueuedForReview));
    assert!(snap.flags.loop_exhausted);
    assert!(snap.flags.requires_human_review);
    assert!(!snap.flags.escalated);
    // 3 at PRIORITIZE, held after each rejection, +1 on exhaustion.
    assert_eq!(snap.priority_history, vec![3, 3, 3, 4]);
    assert_eq!(
        snap.escalation.as_ref().map(|e| &e.reason),
        Some(&EscalationReason::ValidationLoopExhausted { drafts: 3 })
    );
    assert_eq!(snap.escalation.as_ref().unwrap().handler, HandlerLevel::TeamLead);

    let drafts = snap
        .transitions
        .iter()
        .filter(|t| t.to == PipelineState::Draft)
        .count();
    assert_eq!(drafts, 3);
}

#[tokio::test]
async fn scenario_c_approval_on_last_draft_auto_sends() {
    let config = PipelineConfig::default();
    let validator = ScriptedValidator::new(&[false, false, true]);
    let drafter = Arc::new(RecordingDrafter::default());
    let classified = classification(vec![Category::Billing], Sentiment::Neutral, Intent::Refund, 0.9);
    let mut caps = capabilities(&config, classified, validator.clone());
    let dyn_drafter: DynCapability<DraftRequest, DraftResponse> = drafter.clone();
    caps.draft = StageSlot::new(dyn_drafter);
    let (engine, _, _) = engine(config, caps, CustomerContext::empty());

    let snap = engine
        .process(complaint("c2", "I would like a refund for last month's invoice."))
        .await
        .unwrap()
        .snapshot;

    assert_eq!(snap.outcome, Some(PipelineState::AutoSent));
    assert_eq!(snap.iteration_count, 3);
    assert_eq!(snap.draft.as_ref().unwrap().iteration, 3);
    assert!(!snap.flags.loop_exhausted);

    // Each rejection's feedback reaches the next draft.
    let feedback = drafter.feedback.lock().unwrap().clone();
    assert_eq!(feedback.len(), 3);
    assert_eq!(feedback[0], None);
    assert_eq!(feedback[1].as_deref(), Some("Draft 1 needs a concrete next step"));
    assert_eq!(feedback[2].as_deref(), Some("Draft 2 needs a concrete next step"));
}

#[tokio::test]
async fn scenario_d_low_confidence_is_reviewed_and_completes() {
    let config = PipelineConfig::default();
    let classified = classification(vec![Category::Billing], Sentiment::Neutral, Intent::Refund, 0.6);
    let caps = capabilities(&config, classified, ScriptedValidator::approving());
    let (engine, _, _) = engine(config, caps, CustomerContext::empty());

    let snap = engine
        .process(complaint("d", "something about my account"))
        .await
        .unwrap()
        .snapshot;

    assert!(snap.flags.low_confidence);
    assert!(snap.flags.requires_human_review);
    assert_eq!(snap.outcome, Some(PipelineState::QueuedForReview));
    assert!(snap.escalation.is_none());
    assert_eq!(snap.transitions[2].to, PipelineState::Prioritize);
    assert!(snap.transitions[2].reason.is_some());
}

#[tokio::test]
async fn low_confidence_with_high_priority_escalates() {
    let config = PipelineConfig::default();
    let classified = classification(vec![Category::Legal], Sentiment::Neutral, Intent::Information, 0.5);
    let caps = capabilities(&config, classified, ScriptedValidator::approving());
    let (engine, _, _) = engine(config, caps, CustomerContext::empty());

    let snap = engine
        .process(complaint("d2", "question about the terms in my contract"))
        .await
        .unwrap()
        .snapshot;

    assert_eq!(snap.outcome, Some(PipelineState::Escalated));
    let escalation = snap.escalation.unwrap();
    assert!(matches!(
        escalation.reason,
        EscalationReason::LowConfidenceHighPriority { score: 4, .. }
    ));
    assert_eq!(escalation.handler, HandlerLevel::TeamLead);
    assert_eq!(escalation.assigned_team, "legal_team");
}

// ── Contradictory signals ─────────────────────────────────────────────────────

#[tokio::test]
async fn contradictory_signals_bypass_drafting() {
    let config = PipelineConfig::default();
    let validator = ScriptedValidator::approving();
    let classified = classification(vec![Category::Billing], Sentiment::Positive, Intent::Praise, 0.9)
        .with_threat(ThreatSignal::Chargeback);
    let caps = capabilities(&config, classified, validator.clone());
    let (engine, _, audit) = engine(config, caps, CustomerContext::empty());

    let snap = engine
        .process(complaint("x", "Love you guys! Anyway I'm filing a chargeback :)"))
        .await
        .unwrap()
        .snapshot;

    assert_eq!(snap.outcome, Some(PipelineState::Escalated));
    assert_eq!(snap.iteration_count, 0);
    assert_eq!(validator.calls(), 0);
    assert!(snap.draft.is_none());
    assert!(snap.flags.contradictory_signals);
    assert!(!snap.transitions.iter().any(|t| t.to == PipelineState::Draft));
    assert_eq!(snap.escalation.as_ref().unwrap().handler, HandlerLevel::Manager);

    let route = audit
        .entries_for(&snap.workflow_id)
        .await
        .into_iter()
        .find(|e| e.stage == "route")
        .unwrap();
    let dump = &route.detail["context_dump"];
    assert_eq!(dump["complaint"]["complaint_id"], "x");
    assert!(dump["classification"].is_object());
    assert!(dump["priority"].is_object());
}

// ── Properties across scenarios ───────────────────────────────────────────────

#[tokio::test]
async fn prop_loop_never_exceeds_max_iterations() {
    for max in 1..=5u32 {
        let config = PipelineConfig {
            max_iterations: max,
            ..PipelineConfig::default()
        };
        let validator = ScriptedValidator::rejecting();
        let classified =
            classification(vec![Category::Product], Sentiment::Frustrated, Intent::Exchange, 0.9);
        let caps = capabilities(&config, classified, validator.clone());
        let (engine, _, _) = engine(config, caps, CustomerContext::empty());

        let snap = engine
            .process(complaint("loop", "The blender broke after a week, I want an exchange."))
            .await
            .unwrap()
            .snapshot;

        assert_eq!(snap.iteration_count, max, "max={max}");
        assert_eq!(validator.calls(), max, "max={max}");
        assert!(snap.flags.requires_human_review, "max={max}");
        assert!(snap.outcome.is_some_and(PipelineState::is_terminal));
    }
}

#[tokio::test]
async fn resubmission_is_idempotent() {
    let config = PipelineConfig::default();
    let classified = classification(
        vec![Category::Shipping],
        Sentiment::Angry,
        Intent::Complaint,
        0.85,
    );
    let caps = capabilities(&config, classified, ScriptedValidator::new(&[false, true, false, true]));
    let (engine, _, _) = engine(config, caps, repeat_shipping_context());

    let resubmitted = complaint("same", "Third time my parcel has gone missing. Fix it.");
    let first = engine.process(resubmitted.clone()).await.unwrap().snapshot;
    let second = engine.process(resubmitted).await.unwrap().snapshot;

    assert_ne!(first.workflow_id, second.workflow_id);
    assert_eq!(first.priority_history, second.priority_history);
    assert_eq!(first.outcome, second.outcome);
    assert_eq!(first.iteration_count, second.iteration_count);
    assert_eq!(
        first.sla.as_ref().map(|s| s.deadline),
        second.sla.as_ref().map(|s| s.deadline)
    );
}

#[tokio::test]
async fn resubmission_is_idempotent_against_the_memory_store() {
    let config = PipelineConfig::default();
    let classified = classification(vec![Category::Billing], Sentiment::Neutral, Intent::Refund, 0.3);
    let caps = capabilities(&config, classified, ScriptedValidator::new(&[true; 3]));
    let memory = Arc::new(InMemoryMemoryStore::new());
    let engine = PipelineEngine::new(config, caps, memory.clone(), Arc::new(InMemoryAuditSink::new()));

    let resubmitted = complaint("billing-1", "I was charged twice this month.");
    let first = engine.process(resubmitted.clone()).await.unwrap().snapshot;
    let second = engine.process(resubmitted).await.unwrap().snapshot;

    // The first run's resolution is not an open issue for its own resubmission.
    assert_eq!(first.context, second.context);
    assert_eq!(second.context.as_ref().unwrap().lifetime_complaints, 0);
    assert_eq!(first.priority_history, second.priority_history);
    assert_eq!(first.outcome, Some(PipelineState::QueuedForReview));
    assert_eq!(first.outcome, second.outcome);
    assert!(first.escalation.is_none() && second.escalation.is_none());

    let profile = memory.profile("cust-1").await.unwrap();
    assert_eq!(profile.resolutions.len(), 1);

    // A different complaint from the same customer does see it.
    let other = engine
        .process(complaint("billing-2", "Still charged twice."))
        .await
        .unwrap()
        .snapshot;
    let context = other.context.unwrap();
    assert_eq!(context.lifetime_complaints, 1);
    assert_eq!(context.open_issue_categories, vec![Category::Billing]);
}

#[tokio::test]
async fn every_outcome_carries_the_audit_chain() {
    let cases = [
        (Sentiment::Positive, Intent::Praise, vec![Category::Feedback], 0.9, true),
        (Sentiment::Neutral, Intent::Refund, vec![Category::Billing], 0.9, false),
        (Sentiment::Angry, Intent::LegalAction, vec![Category::Legal], 0.9, true),
        (Sentiment::Neutral, Intent::Information, vec![Category::Other], 0.4, true),
    ];
    for (sentiment, intent, categories, confidence, approve) in cases {
        let config = PipelineConfig::default();
        let validator = if approve {
            ScriptedValidator::approving()
        } else {
            ScriptedValidator::rejecting()
        };
        let classified = classification(categories, sentiment, intent, confidence);
        let caps = capabilities(&config, classified, validator);
        let (engine, _, audit) = engine(config, caps, CustomerContext::empty());

        let snap = engine
            .process(complaint("chain", "text"))
            .await
            .unwrap()
            .snapshot;

        let stages = snap.audited_stages();
        for stage in ["context", "classify", "prioritize", "draft", "validate", "route"] {
            assert!(stages.contains(&stage), "{intent:?}: missing {stage} in {stages:?}");
        }
        let classify = stages.iter().position(|s| *s == "classify").unwrap();
        let route = stages.iter().position(|s| *s == "route").unwrap();
        assert!(classify < route);

        let sunk = audit.entries_for(&snap.workflow_id).await;
        assert_eq!(sunk, snap.audit_trail);
        assert!(triage::audit::is_well_ordered(&sunk));
    }
}

// ── Rule-based stack, real stores ─────────────────────────────────────────────

#[tokio::test]
async fn rule_based_run_writes_jsonl_audit() {
    let dir = tempfile::tempdir().unwrap();
    let config = PipelineConfig::default();
    let caps = Capabilities::rule_based(&config);
    let memory = Arc::new(InMemoryMemoryStore::new());
    let sink = Arc::new(JsonlAuditSink::new(dir.path().join("audit.jsonl")));
    let engine = PipelineEngine::new(config, caps, memory.clone(), sink.clone());

    let report = engine
        .process(complaint(
            "r1",
            "My order never arrived and tracking has not updated in a week. Please help.",
        ))
        .await
        .unwrap();

    let written = sink.read_all().await.unwrap();
    let key = |e: &triage::AuditEntry| (e.seq, e.stage.clone(), e.outcome);
    assert_eq!(
        written.iter().map(key).collect::<Vec<_>>(),
        report.snapshot.audit_trail.iter().map(key).collect::<Vec<_>>()
    );
    assert_eq!(written.last().unwrap().stage, "route");

    let profile = memory.profile("cust-1").await.unwrap();
    assert_eq!(profile.resolutions.len(), 1);
}

#[tokio::test]
async fn same_customer_workflows_all_record() {
    let config = PipelineConfig {
        concurrency_limit: 4,
        ..PipelineConfig::default()
    };
    let caps = Capabilities::rule_based(&config);
    let memory = Arc::new(InMemoryMemoryStore::new());
    let audit = Arc::new(complaint_resolver::InMemoryAuditSink::new());
    let engine = PipelineEngine::new(config, caps, memory.clone(), audit);

    let mut ids = Vec::new();
    for i in 0..12 {
        let text = format!("Complaint number {i}: my invoice shows the wrong amount.");
        ids.push(engine.submit(complaint(&format!("c-{i}"), &text)).await);
    }
    for id in &ids {
        let report = engine.wait(id).await.unwrap();
        assert_eq!(report.snapshot.state, PipelineState::Done);
    }

    let profile = memory.profile("cust-1").await.unwrap();
    assert_eq!(profile.resolutions.len(), 12);
}
