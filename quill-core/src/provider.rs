//! Provider trait and core abstractions.

use crate::error::AiError;
use crate::types::*;
use async_trait::async_trait;
use futures::Stream;
use std::fmt::Debug;
use std::sync::Arc;

/// Stream of text deltas from a backend.
///
/// Finite and not restartable. Dropping it must release the underlying
/// transport.
pub type TextStream = dyn Stream<Item = Result<TextChunk, AiError>> + Send + Unpin;

/// Core provider trait, one implementation per backend.
///
/// Adapters translate the uniform [`ProviderRequest`] into their wire format,
/// enforce `req.timeout`, and map backend failures into [`AiError`]. They are
/// stateless apart from the pooled HTTP client each one owns.
#[async_trait]
pub trait Provider: Send + Sync + Debug + 'static {
    /// Get provider information
    fn info(&self) -> Arc<ProviderInfo>;

    /// Single-shot call
    async fn dispatch(&self, req: ProviderRequest) -> Result<ProviderResponse, AiError>;

    /// Streamed call; chunks arrive in backend order
    async fn dispatch_streaming(&self, req: ProviderRequest) -> Result<Box<TextStream>, AiError>;

    /// Lightweight liveness check used by circuit recovery.
    ///
    /// Not a user-facing dispatch: it never consumes a concurrency slot.
    async fn health_probe(&self) -> bool;
}

#[async_trait]
impl<P: Provider + ?Sized> Provider for Arc<P> {
    fn info(&self) -> Arc<ProviderInfo> {
        (**self).info()
    }

    async fn dispatch(&self, req: ProviderRequest) -> Result<ProviderResponse, AiError> {
        (**self).dispatch(req).await
    }

    async fn dispatch_streaming(&self, req: ProviderRequest) -> Result<Box<TextStream>, AiError> {
        (**self).dispatch_streaming(req).await
    }

    async fn health_probe(&self) -> bool {
        (**self).health_probe().await
    }
}

/// Helper function to collect a text stream into a single response
pub async fn collect_text_stream(
    id: impl Into<String>,
    model: impl Into<String>,
    mut stream: Box<TextStream>,
) -> Result<ProviderResponse, AiError> {
    use futures::StreamExt;

    let mut text = String::new();
    let mut finish_reason = None;
    let mut usage = None;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        text.push_str(&chunk.delta);

        if let Some(reason) = chunk.finish_reason {
            finish_reason = Some(reason);
        }

        if let Some(u) = chunk.usage {
            usage = Some(u);
        }
    }

    Ok(ProviderResponse {
        id: id.into(),
        model: model.into(),
        text,
        finish_reason: finish_reason.unwrap_or(FinishReason::Stop),
        usage: usage.unwrap_or_default(),
    })
}
