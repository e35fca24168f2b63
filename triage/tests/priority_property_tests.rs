//! Priority property tests — exhaustive sweeps over classification and
//! context grids.
//!
//! Tests verify:
//! - score == min(base + Σ modifiers, 5), never below 1
//! - Identical inputs always produce identical results
//! - Re-evaluation never lowers a score
//! - SLA deadlines never move later across re-evaluations
//! - The worked scenarios route where they should

use chrono::{TimeZone, Utc};
use triage::{
    breach_probability, decide_route, Category, ClassificationResult, CustomerContext,
    CustomerTier, Intent, PipelineState, PriorityFactor, PriorityScorer, ScoringConfig,
    Sentiment, SlaRecord, SlaTargets, ThreatSignal,
};

const SENTIMENTS: [Sentiment; 4] = [
    Sentiment::Positive,
    Sentiment::Neutral,
    Sentiment::Frustrated,
    Sentiment::Angry,
];

const INTENTS: [Intent; 4] = [
    Intent::Refund,
    Intent::Complaint,
    Intent::LegalAction,
    Intent::Chargeback,
];

fn contexts() -> Vec<CustomerContext> {
    let mut out = Vec::new();
    for tier in [CustomerTier::Standard, CustomerTier::Gold] {
        for open in [vec![], vec![Category::Shipping], vec![Category::Billing, Category::Legal]] {
            for churn in [0.0, 0.5, 0.95] {
                for lifetime in [0, 3, 12] {
                    out.push(CustomerContext {
                        tier,
                        lifetime_complaints: lifetime,
                        open_issue_categories: open.clone(),
                        churn_risk: churn,
                        vip: false,
                    });
                }
            }
        }
    }
    out
}

fn classifications() -> Vec<ClassificationResult> {
    let mut out = Vec::new();
    for category in Category::ALL {
        for sentiment in SENTIMENTS {
            for intent in INTENTS {
                out.push(ClassificationResult::new(
                    vec![category, Category::Other],
                    sentiment,
                    intent,
                    0.85,
                ));
            }
        }
    }
    out
}

/// Independent restatement of the scoring formula.
fn expected_score(
    config: &ScoringConfig,
    c: &ClassificationResult,
    ctx: &CustomerContext,
) -> u8 {
    let mut total = u32::from(config.base_for(c.dominant_category()));
    if ctx.open_issue_categories.contains(&c.dominant_category()) {
        total += u32::from(config.repeat_complaint);
    }
    if c.sentiment == Sentiment::Angry {
        total += u32::from(config.angry_sentiment);
    }
    if ctx.is_vip() {
        total += u32::from(config.vip_customer);
    }
    if c.has_legal_or_chargeback_threat() {
        total += u32::from(config.legal_threat);
    }
    if breach_probability(c, ctx) > config.sla_breach_probability_threshold {
        total += u32::from(config.sla_breach_risk);
    }
    total.clamp(1, 5) as u8
}

// ── Property: formula and range ────────────────────────────────────

#[test]
fn prop_score_matches_formula() {
    let scorer = PriorityScorer::default();
    for c in classifications() {
        for ctx in contexts() {
            let result = scorer.score(&c, &ctx);
            assert_eq!(
                result.score,
                expected_score(scorer.config(), &c, &ctx),
                "{:?} / {:?}",
                c,
                ctx
            );
            assert!(result.is_in_range());
            assert_eq!(
                result.base_score,
                scorer.config().base_for(c.dominant_category())
            );
        }
    }
}

#[test]
fn prop_score_is_stable() {
    let scorer = PriorityScorer::default();
    for c in classifications() {
        for ctx in contexts().into_iter().step_by(5) {
            assert_eq!(scorer.score(&c, &ctx), scorer.score(&c.clone(), &ctx.clone()));
        }
    }
}

// ── Property: re-evaluation is monotone ────────────────────────────

#[test]
fn prop_reevaluation_never_lowers() {
    let scorer = PriorityScorer::default();
    let ctx_grid = contexts();
    for c in classifications().into_iter().step_by(3) {
        for ctx in ctx_grid.iter().step_by(7) {
            let mut current = scorer.score(&c, ctx);
            let mut history = vec![current.score];
            for round in 0..4 {
                current = scorer.reevaluate(&current, &c, ctx);
                if round == 2 {
                    current = PriorityScorer::bump(
                        &current,
                        PriorityFactor::ValidationLoopExhausted,
                        "unresolved quality risk",
                    );
                }
                history.push(current.score);
            }
            assert!(
                history.windows(2).all(|w| w[1] >= w[0]),
                "history decreased: {history:?}"
            );
            assert!(history.iter().all(|s| (1..=5).contains(s)));
        }
    }
}

// ── Property: SLA never relaxes ────────────────────────────────────

#[test]
fn prop_sla_deadline_never_later() {
    let scorer = PriorityScorer::default();
    let targets = SlaTargets::default();
    let received = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
    for c in classifications().into_iter().step_by(4) {
        for ctx in contexts().iter().step_by(5) {
            let first = scorer.score(&c, ctx);
            let mut sla = SlaRecord::derive(received, &first, &targets);
            let mut current = first;
            for _ in 0..3 {
                let before = sla.deadline;
                current = PriorityScorer::bump(&current, PriorityFactor::ValidationLoopExhausted, "x");
                sla.tighten(received, &current, &targets);
                assert!(sla.deadline <= before);
            }
        }
    }
}

// ── Worked scenarios ───────────────────────────────────────────────

#[test]
fn scenario_a_capped_and_escalated() {
    let scorer = PriorityScorer::default();
    let c = ClassificationResult::new(
        vec![Category::Shipping, Category::Billing],
        Sentiment::Angry,
        Intent::Complaint,
        0.9,
    )
    .with_threat(ThreatSignal::Chargeback);
    let ctx = CustomerContext {
        open_issue_categories: vec![Category::Shipping],
        ..CustomerContext::empty()
    };

    let result = scorer.score(&c, &ctx);
    assert_eq!(result.base_score, 2);
    assert!(result.modifier_total >= 6);
    assert_eq!(result.score, 5);
    for factor in [
        PriorityFactor::RepeatComplaint,
        PriorityFactor::AngrySentiment,
        PriorityFactor::LegalOrChargebackThreat,
    ] {
        assert!(result.factors.contains(&factor), "missing {factor:?}");
    }
    assert_eq!(
        decide_route(result.score, true, None).terminal,
        PipelineState::Escalated
    );
}

#[test]
fn scenario_b_minimal_auto_sent() {
    let scorer = PriorityScorer::default();
    let c = ClassificationResult::new(vec![Category::Feedback], Sentiment::Positive, Intent::Praise, 0.95);
    let result = scorer.score(&c, &CustomerContext::empty());
    assert_eq!(result.score, 1);
    assert!(result.factors.is_empty());
    assert_eq!(
        decide_route(result.score, false, None).terminal,
        PipelineState::AutoSent
    );
}
