//! Stub capabilities and stores shared by the engine integration tests.

#![allow(dead_code)]

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use complaint_resolver::rules::TemplateDrafter;
use complaint_resolver::{
    AuditError, AuditSink, Capabilities, ClassifyRequest, DraftRequest, DynCapability,
    InMemoryAuditSink, MemoryError, MemoryStore, PipelineEngine, ResolutionSummary, Scored,
    StageCapability, StageSlot, ValidateRequest,
};
use serde::{de::DeserializeOwned, Serialize};
use triage::{
    AuditEntry, Category, Channel, ClassificationResult, Complaint, CustomerContext,
    DraftResponse, Intent, PipelineConfig, Sentiment, StageError, ValidationResult,
};

// ── Capabilities ──────────────────────────────────────────────────────────────

/// Always answers the same classification.
pub struct FixedClassifier(pub ClassificationResult);

#[async_trait]
impl StageCapability for FixedClassifier {
    type Request = ClassifyRequest;
    type Output = ClassificationResult;

    fn name(&self) -> &str {
        "fixed-classifier"
    }

    async fn call(
        &self,
        _request: ClassifyRequest,
        _timeout: Duration,
    ) -> Result<Scored<ClassificationResult>, StageError> {
        Ok(Scored::new(self.0.clone(), self.0.confidence))
    }
}

/// Approves or rejects according to a script; rejects once the script runs out.
pub struct ScriptedValidator {
    script: Vec<bool>,
    pub calls: AtomicU32,
}

impl ScriptedValidator {
    pub fn new(script: &[bool]) -> Arc<Self> {
        Arc::new(Self {
            script: script.to_vec(),
            calls: AtomicU32::new(0),
        })
    }

    pub fn approving() -> Arc<Self> {
        Self::new(&[true])
    }

    pub fn rejecting() -> Arc<Self> {
        Self::new(&[])
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StageCapability for ScriptedValidator {
    type Request = ValidateRequest;
    type Output = ValidationResult;

    fn name(&self) -> &str {
        "scripted-validator"
    }

    async fn call(
        &self,
        _request: ValidateRequest,
        _timeout: Duration,
    ) -> Result<Scored<ValidationResult>, StageError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        let approved = self.script.get(n).copied().unwrap_or(false);
        let result = ValidationResult {
            approved,
            feedback: (!approved).then(|| format!("Draft {} needs a concrete next step", n + 1)),
            confidence: 0.9,
            issues: Vec::new(),
            quality_score: if approved { 8 } else { 4 },
        };
        Ok(Scored::new(result, 0.9))
    }
}

/// Template drafter that records the feedback each draft received.
#[derive(Default)]
pub struct RecordingDrafter {
    pub feedback: Mutex<Vec<Option<String>>>,
}

#[async_trait]
impl StageCapability for RecordingDrafter {
    type Request = DraftRequest;
    type Output = DraftResponse;

    fn name(&self) -> &str {
        "recording-drafter"
    }

    async fn call(
        &self,
        request: DraftRequest,
        _timeout: Duration,
    ) -> Result<Scored<DraftResponse>, StageError> {
        self.feedback.lock().unwrap().push(request.feedback.clone());
        Ok(Scored::new(TemplateDrafter::draft(&request), 0.7))
    }
}

/// Fails every call with a fixed error.
pub struct Failing<Req, Out> {
    error: StageError,
    calls: AtomicU32,
    _marker: PhantomData<fn(Req) -> Out>,
}

impl<Req, Out> Failing<Req, Out> {
    pub fn new(error: StageError) -> Arc<Self> {
        Arc::new(Self {
            error,
            calls: AtomicU32::new(0),
            _marker: PhantomData,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<Req, Out> StageCapability for Failing<Req, Out>
where
    Req: Clone + Serialize + Send + Sync + 'static,
    Out: Serialize + DeserializeOwned + Send + 'static,
{
    type Request = Req;
    type Output = Out;

    fn name(&self) -> &str {
        "failing"
    }

    async fn call(&self, _request: Req, _timeout: Duration) -> Result<Scored<Out>, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Fails a fixed number of times, then never answers.
pub struct Hang<Req, Out> {
    failures: u32,
    error: StageError,
    calls: AtomicU32,
    _marker: PhantomData<fn(Req) -> Out>,
}

impl<Req, Out> Hang<Req, Out> {
    pub fn new() -> Arc<Self> {
        Self::after_failures(0, StageError::transient("unused"))
    }

    pub fn after_failures(failures: u32, error: StageError) -> Arc<Self> {
        Arc::new(Self {
            failures,
            error,
            calls: AtomicU32::new(0),
            _marker: PhantomData,
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<Req, Out> StageCapability for Hang<Req, Out>
where
    Req: Clone + Serialize + Send + Sync + 'static,
    Out: Serialize + DeserializeOwned + Send + 'static,
{
    type Request = Req;
    type Output = Out;

    fn name(&self) -> &str {
        "hang"
    }

    async fn call(&self, _request: Req, _timeout: Duration) -> Result<Scored<Out>, StageError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
            return Err(self.error.clone());
        }
        std::future::pending().await
    }
}

// ── Stores ────────────────────────────────────────────────────────────────────

/// Returns one fixed context and keeps every recorded resolution.
pub struct FixedMemory {
    context: CustomerContext,
    pub recorded: Mutex<Vec<ResolutionSummary>>,
}

impl FixedMemory {
    pub fn new(context: CustomerContext) -> Arc<Self> {
        Arc::new(Self {
            context,
            recorded: Mutex::new(Vec::new()),
        })
    }

    pub fn recorded(&self) -> Vec<ResolutionSummary> {
        self.recorded.lock().unwrap().clone()
    }
}

#[async_trait]
impl MemoryStore for FixedMemory {
    async fn get_customer_context(
        &self,
        _customer_id: &str,
        _lookback_days: u32,
        _complaint_id: &str,
    ) -> Result<CustomerContext, MemoryError> {
        Ok(self.context.clone())
    }

    async fn record_resolution(
        &self,
        _customer_id: &str,
        summary: ResolutionSummary,
    ) -> Result<(), MemoryError> {
        self.recorded.lock().unwrap().push(summary);
        Ok(())
    }
}

/// Reads fail, writes fail, or both.
pub struct BrokenMemory {
    pub reads_fail: bool,
    pub writes_fail: bool,
    pub write_attempts: AtomicU32,
}

impl BrokenMemory {
    pub fn new(reads_fail: bool, writes_fail: bool) -> Arc<Self> {
        Arc::new(Self {
            reads_fail,
            writes_fail,
            write_attempts: AtomicU32::new(0),
        })
    }
}

#[async_trait]
impl MemoryStore for BrokenMemory {
    async fn get_customer_context(
        &self,
        _customer_id: &str,
        _lookback_days: u32,
        _complaint_id: &str,
    ) -> Result<CustomerContext, MemoryError> {
        if self.reads_fail {
            Err(MemoryError::Unavailable("connection refused".into()))
        } else {
            Ok(CustomerContext::empty())
        }
    }

    async fn record_resolution(
        &self,
        _customer_id: &str,
        summary: ResolutionSummary,
    ) -> Result<(), MemoryError> {
        self.write_attempts.fetch_add(1, Ordering::SeqCst);
        if self.writes_fail {
            Err(MemoryError::Write {
                resolution_id: summary.resolution_id,
                message: "disk full".into(),
            })
        } else {
            Ok(())
        }
    }
}

/// Audit sink that refuses every entry.
pub struct RefusingSink;

#[async_trait]
impl AuditSink for RefusingSink {
    async fn append(&self, _entry: &AuditEntry) -> Result<(), AuditError> {
        Err(AuditError::Unavailable("sink offline".into()))
    }
}

// ── Builders ──────────────────────────────────────────────────────────────────

pub fn classification(
    categories: Vec<Category>,
    sentiment: Sentiment,
    intent: Intent,
    confidence: f64,
) -> ClassificationResult {
    ClassificationResult::new(categories, sentiment, intent, confidence)
}

pub fn complaint(id: &str, text: &str) -> Complaint {
    Complaint::new(id, "cust-1", Channel::Email, text)
}

/// Rule-based capabilities with a fixed classifier and the given validator.
pub fn capabilities(
    config: &PipelineConfig,
    classified: ClassificationResult,
    validator: Arc<ScriptedValidator>,
) -> Capabilities {
    let mut caps = Capabilities::rule_based(config);
    let classifier: DynCapability<ClassifyRequest, ClassificationResult> =
        Arc::new(FixedClassifier(classified));
    let validator: DynCapability<ValidateRequest, ValidationResult> = validator;
    caps.classify = StageSlot::new(classifier);
    caps.validate = StageSlot::new(validator);
    caps
}

/// Engine over a fixed context and an in-memory audit sink.
pub fn engine(
    config: PipelineConfig,
    caps: Capabilities,
    context: CustomerContext,
) -> (PipelineEngine, Arc<FixedMemory>, Arc<InMemoryAuditSink>) {
    let memory = FixedMemory::new(context);
    let audit = Arc::new(InMemoryAuditSink::new());
    let engine = PipelineEngine::new(config, caps, memory.clone(), audit.clone());
    (engine, memory, audit)
}
