//! Basic orchestration demo.
//!
//! With `DEEPSEEK_API_KEY` set the demo talks to DeepSeek; otherwise it runs
//! against an offline canned adapter.
//!
//! ```sh
//! RUST_LOG=quill=debug cargo run --example basic
//! ```

use async_trait::async_trait;
use futures::StreamExt;
use quill::prelude::*;
use quill::{ProviderInfo, ProviderRequest, ProviderResponse, TextChunk, TextStream, Usage};
use std::sync::Arc;
use std::time::Duration;

const STORY: &str = "The lighthouse keeper had not seen a ship in forty days. \
                     On the forty-first morning the fog lifted and";

/// Offline adapter that answers with a fixed sentence
#[derive(Debug)]
struct CannedProvider {
    info: Arc<ProviderInfo>,
}

const CANNED: &str = " a red sail appeared on the horizon, moving against the wind.";

#[async_trait]
impl Provider for CannedProvider {
    fn info(&self) -> Arc<ProviderInfo> {
        self.info.clone()
    }

    async fn dispatch(&self, req: ProviderRequest) -> std::result::Result<ProviderResponse, AiError> {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(ProviderResponse {
            id: req.request_id,
            model: req.model,
            text: CANNED.to_string(),
            finish_reason: quill::FinishReason::Stop,
            usage: Usage::new(24, 12),
        })
    }

    async fn dispatch_streaming(
        &self,
        _req: ProviderRequest,
    ) -> std::result::Result<Box<TextStream>, AiError> {
        let words: Vec<_> = CANNED
            .split_inclusive(' ')
            .map(|w| Ok(TextChunk::text(w)))
            .collect();
        let stream = futures::stream::iter(words).then(|chunk| async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            chunk
        });
        Ok(Box::new(Box::pin(stream)))
    }

    async fn health_probe(&self) -> bool {
        true
    }
}

fn orchestrator() -> anyhow::Result<Orchestrator> {
    if let Ok(key) = std::env::var("DEEPSEEK_API_KEY") {
        tracing::info!("Using DeepSeek");
        let config = OrchestratorConfig::default()
            .with_provider(ProviderDescriptor::new("deepseek", "deepseek-chat").with_credential(key));
        return Ok(quill::connect(config)?);
    }

    tracing::info!("DEEPSEEK_API_KEY not set, using the offline adapter");
    let config = OrchestratorConfig::default()
        .with_provider(ProviderDescriptor::new("canned", "canned-1"))
        .with_max_retries(1);
    let canned = CannedProvider {
        info: Arc::new(ProviderInfo {
            id: "canned".into(),
            name: "Canned".into(),
        }),
    };

    Ok(Orchestrator::builder(config)
        .provider("canned", LoggingLayer::new().layer(canned))
        .observer(Arc::new(TracingObserver::new()))
        .finish()?)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,quill=debug".into()),
        )
        .init();

    let orchestrator = orchestrator()?;

    println!("Registered functions:");
    for function in orchestrator.registry().iter() {
        println!("  {:<26} {:?} / {:?}", function.id, function.category, function.default_mode);
    }

    // Too little context for an automatic continuation
    let short = AiRequest::new("intelligent_continuation").with_context("Once");
    match orchestrator.submit(short).await {
        Err(err) => println!("\nShort context rejected: {err}"),
        Ok(_) => println!("\nShort context unexpectedly accepted"),
    }

    // Single-shot, then the same request again from the cache
    let request = AiRequest::new("intelligent_continuation")
        .with_context(STORY)
        .with_temperature(0.7);
    let first = orchestrator.submit(request.clone()).await?;
    println!(
        "\nContinuation ({} via {:?}, {:?}):\n{}{}",
        first.usage.total_tokens,
        first.provider,
        first.latency,
        STORY,
        first.text
    );

    let again = orchestrator.submit(AiRequest { id: "repeat".into(), ..request }).await?;
    println!("Repeat served from cache: {}", again.cached);

    // Streamed, cancelled after a few chunks
    let token = CancellationToken::new();
    let streamed = AiRequest::new("enhanced_ai_chat")
        .with_prompt("Describe the lighthouse in one sentence.")
        .with_priority(Priority::High);
    let mut stream = orchestrator.submit_stream(streamed, token.clone()).await?;

    print!("\nStreaming: ");
    let mut seen = 0;
    while let Some(item) = stream.next().await {
        match item {
            StreamItem::Chunk(chunk) => {
                print!("{}", chunk.delta);
                seen += 1;
                if seen == 4 {
                    token.cancel();
                }
            }
            StreamItem::Done(response) => {
                println!("\nStream ended: {:?} after {} chunks", response.status, response.chunks.len());
            }
        }
    }

    let stats = orchestrator.cache().stats();
    println!(
        "\nCache: {} hits, {} misses, {} coalesced, {} entries",
        stats.hits, stats.misses, stats.coalesced, stats.entries
    );

    Ok(())
}
