//! Scripted in-memory adapter for orchestration tests.

use crate::error::AiError;
use crate::provider::{Provider, TextStream};
use crate::types::*;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Outcome of one scripted call
#[derive(Debug, Clone)]
pub(crate) enum MockOutcome {
    Reply(String),
    Fail(AiError),
    /// Never answers
    Hang,
}

#[derive(Debug)]
pub(crate) struct MockProvider {
    info: Arc<ProviderInfo>,
    script: Mutex<VecDeque<MockOutcome>>,
    reply: String,
    delay: Duration,
    chunks: Vec<String>,
    chunk_delay: Duration,
    healthy: AtomicBool,
    dispatches: AtomicUsize,
    probes: AtomicUsize,
    open_streams: Arc<AtomicUsize>,
}

impl MockProvider {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            info: Arc::new(ProviderInfo {
                id: name.to_string(),
                name: name.to_string(),
            }),
            script: Mutex::new(VecDeque::new()),
            reply: format!("reply from {name}"),
            delay: Duration::ZERO,
            chunks: vec!["Hello".into(), ", ".into(), "world".into()],
            chunk_delay: Duration::ZERO,
            healthy: AtomicBool::new(true),
            dispatches: AtomicUsize::new(0),
            probes: AtomicUsize::new(0),
            open_streams: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reply used once the script runs out
    pub(crate) fn replying(mut self, text: &str) -> Self {
        self.reply = text.to_string();
        self
    }

    pub(crate) fn scripted(self, outcomes: impl IntoIterator<Item = MockOutcome>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(outcomes);
        self
    }

    /// Fail every call with `err`
    pub(crate) fn failing(self, err: AiError, times: usize) -> Self {
        self.scripted(std::iter::repeat(MockOutcome::Fail(err)).take(times))
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn with_chunks(mut self, chunks: &[&str], chunk_delay: Duration) -> Self {
        self.chunks = chunks.iter().map(|c| c.to_string()).collect();
        self.chunk_delay = chunk_delay;
        self
    }

    pub(crate) fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub(crate) fn dispatch_count(&self) -> usize {
        self.dispatches.load(Ordering::SeqCst)
    }

    pub(crate) fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Streams handed out and not yet dropped
    pub(crate) fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    fn next_outcome(&self) -> MockOutcome {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| MockOutcome::Reply(self.reply.clone()))
    }

    async fn begin_call(&self) -> Result<Option<String>, AiError> {
        self.dispatches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.next_outcome() {
            MockOutcome::Reply(text) => Ok(Some(text)),
            MockOutcome::Fail(err) => Err(err),
            MockOutcome::Hang => {
                futures::future::pending::<()>().await;
                Ok(None)
            }
        }
    }
}

/// Decrements the open stream count when the stream is dropped
struct StreamGuard(Arc<AtomicUsize>);

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn info(&self) -> Arc<ProviderInfo> {
        self.info.clone()
    }

    async fn dispatch(&self, req: ProviderRequest) -> Result<ProviderResponse, AiError> {
        let text = self.begin_call().await?.unwrap_or_default();
        Ok(ProviderResponse {
            id: req.request_id,
            model: req.model,
            text,
            finish_reason: FinishReason::Stop,
            usage: Usage::new(3, 5),
        })
    }

    async fn dispatch_streaming(&self, _req: ProviderRequest) -> Result<Box<TextStream>, AiError> {
        self.begin_call().await?;

        self.open_streams.fetch_add(1, Ordering::SeqCst);
        let guard = StreamGuard(self.open_streams.clone());
        let chunks = self.chunks.clone();
        let chunk_delay = self.chunk_delay;

        let stream = async_stream::stream! {
            let _guard = guard;
            for chunk in chunks {
                if !chunk_delay.is_zero() {
                    tokio::time::sleep(chunk_delay).await;
                }
                yield Ok(TextChunk::text(chunk));
            }
            yield Ok(TextChunk {
                delta: String::new(),
                finish_reason: Some(FinishReason::Stop),
                usage: Some(Usage::new(3, 5)),
            });
        };
        Ok(Box::new(Box::pin(stream)))
    }

    async fn health_probe(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.healthy.load(Ordering::SeqCst)
    }
}
