//! In-memory collaborators shared by the integration tests.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use knowledge_assistant::models::{AuditRecord, GenerationRequest, Intent};
use knowledge_assistant::normalize::QueryNormalizer;
use knowledge_assistant::traits::{
    AuditSink, ContextRetriever, IntentClassifier, MemorySource, ResponseGenerator, TokenStream,
};
use knowledge_assistant::workflow::{Collaborators, Workflow};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Barrier, Notify};
use tokio_stream::wrappers::ReceiverStream;

// ─── Classifier ─────────────────────────────────────────────────────

pub struct StubClassifier {
    pub intent: Mutex<Intent>,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
}

#[async_trait]
impl IntentClassifier for StubClassifier {
    async fn classify(&self, _query: &str) -> Result<Intent> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("classifier API error 503");
        }
        Ok(*self.intent.lock().unwrap())
    }
}

// ─── Retriever ──────────────────────────────────────────────────────

pub struct StubRetriever {
    pub snippets: Mutex<Vec<String>>,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
    pub last_query: Mutex<Option<(String, usize)>>,
    pub barrier: Mutex<Option<Arc<Barrier>>>,
}

#[async_trait]
impl ContextRetriever for StubRetriever {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_query.lock().unwrap() = Some((query.to_string(), top_k));
        let barrier = self.barrier.lock().unwrap().clone();
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("vector index unreachable");
        }
        Ok(self.snippets.lock().unwrap().clone())
    }
}

// ─── Memory ─────────────────────────────────────────────────────────

pub struct StubMemory {
    pub text: Mutex<String>,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
    pub barrier: Mutex<Option<Arc<Barrier>>>,
}

#[async_trait]
impl MemorySource for StubMemory {
    async fn recent_turns(&self, _user_id: i32) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let barrier = self.barrier.lock().unwrap().clone();
        if let Some(barrier) = barrier {
            barrier.wait().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("both database backends are unavailable");
        }
        Ok(self.text.lock().unwrap().clone())
    }
}

// ─── Generator ──────────────────────────────────────────────────────

/// How the streaming side of [`StubGenerator`] behaves.
#[derive(Clone)]
pub enum StreamMode {
    /// Yield every fragment.
    Normal,
    /// Yield this many fragments, then an error.
    FailAfter(usize),
    /// Yield the first fragment, then wait for the notify before the rest.
    Gated(Arc<Notify>),
}

pub struct StubGenerator {
    pub answer: Mutex<String>,
    pub fail: AtomicBool,
    pub calls: AtomicUsize,
    pub stream_calls: AtomicUsize,
    pub last_request: Mutex<Option<GenerationRequest>>,
    pub mode: Mutex<StreamMode>,
}

impl StubGenerator {
    /// The answer split on spaces, keeping the spaces.
    fn fragments(&self) -> Vec<String> {
        self.answer
            .lock()
            .unwrap()
            .split_inclusive(' ')
            .map(str::to_string)
            .collect()
    }
}

#[async_trait]
impl ResponseGenerator for StubGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("completion API error 500");
        }
        Ok(self.answer.lock().unwrap().clone())
    }

    async fn generate_stream(&self, request: &GenerationRequest) -> Result<TokenStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("completion API error 500");
        }

        let fragments = self.fragments();
        let mode = self.mode.lock().unwrap().clone();
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            for (i, fragment) in fragments.into_iter().enumerate() {
                match &mode {
                    StreamMode::FailAfter(n) if i == *n => {
                        let _ = tx.send(Err(anyhow::anyhow!("stream interrupted"))).await;
                        return;
                    }
                    StreamMode::Gated(gate) if i == 1 => gate.notified().await,
                    _ => {}
                }
                if tx.send(Ok(fragment)).await.is_err() {
                    return;
                }
            }
        });
        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

// ─── Audit ──────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingAudit {
    pub turns: Mutex<Vec<(i32, String, String)>>,
    pub records: Mutex<Vec<AuditRecord>>,
    pub fail: AtomicBool,
    /// Simulated write latency per call, in milliseconds.
    pub delay_ms: AtomicU64,
}

impl RecordingAudit {
    async fn latency(&self) {
        let ms = self.delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    pub fn turn_count(&self) -> usize {
        self.turns.lock().unwrap().len()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl AuditSink for RecordingAudit {
    async fn save_conversation_turn(&self, user_id: i32, query: &str, answer: &str) -> Result<()> {
        self.latency().await;
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("both database backends are unavailable");
        }
        self.turns
            .lock()
            .unwrap()
            .push((user_id, query.to_string(), answer.to_string()));
        Ok(())
    }

    async fn save_audit_record(&self, record: &AuditRecord) -> Result<()> {
        self.latency().await;
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("failed to write to audit_log");
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

// ─── Harness ────────────────────────────────────────────────────────

pub struct Stubs {
    pub classifier: Arc<StubClassifier>,
    pub retriever: Arc<StubRetriever>,
    pub memory: Arc<StubMemory>,
    pub generator: Arc<StubGenerator>,
    pub audit: Arc<RecordingAudit>,
}

impl Stubs {
    pub fn new(needs_context: bool, needs_memory: bool) -> Self {
        Self {
            classifier: Arc::new(StubClassifier {
                intent: Mutex::new(Intent {
                    needs_context,
                    needs_memory,
                }),
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
            }),
            retriever: Arc::new(StubRetriever {
                snippets: Mutex::new(vec!["France's capital is Paris.".to_string()]),
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
                last_query: Mutex::new(None),
                barrier: Mutex::new(None),
            }),
            memory: Arc::new(StubMemory {
                text: Mutex::new("User: hi\nAssistant: Hello.".to_string()),
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
                barrier: Mutex::new(None),
            }),
            generator: Arc::new(StubGenerator {
                answer: Mutex::new("Paris.".to_string()),
                fail: AtomicBool::new(false),
                calls: AtomicUsize::new(0),
                stream_calls: AtomicUsize::new(0),
                last_request: Mutex::new(None),
                mode: Mutex::new(StreamMode::Normal),
            }),
            audit: Arc::new(RecordingAudit::default()),
        }
    }

    pub fn set_answer(&self, answer: &str) {
        *self.generator.answer.lock().unwrap() = answer.to_string();
    }

    pub fn workflow(&self) -> Workflow {
        Workflow::new(Collaborators {
            normalizer: QueryNormalizer::plain(),
            classifier: self.classifier.clone(),
            retriever: self.retriever.clone(),
            memory: self.memory.clone(),
            generator: self.generator.clone(),
            audit: self.audit.clone(),
            top_k: 5,
        })
    }

    pub fn last_request(&self) -> GenerationRequest {
        self.generator
            .last_request
            .lock()
            .unwrap()
            .clone()
            .expect("generator was not called")
    }
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
