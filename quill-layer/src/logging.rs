//! Logging layer for backend calls.

use async_trait::async_trait;
use futures::StreamExt;
use quill_core::error::AiError;
use quill_core::impl_layered_provider;
use quill_core::layer::{Layer, LayeredProvider};
use quill_core::provider::{Provider, TextStream};
use quill_core::types::*;
use std::time::Instant;

/// Logging layer that logs every call an adapter makes.
#[derive(Debug, Clone)]
pub struct LoggingLayer {
    prefix: String,
}

impl LoggingLayer {
    /// Create a new logging layer
    pub fn new() -> Self {
        Self {
            prefix: "[quill]".to_string(),
        }
    }

    /// Create a logging layer with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LoggingLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: Provider> Layer<P> for LoggingLayer {
    type LayeredProvider = LoggingProvider<P>;

    fn layer(&self, inner: P) -> Self::LayeredProvider {
        LoggingProvider {
            inner,
            prefix: self.prefix.clone(),
        }
    }
}

/// Provider wrapped with logging
#[derive(Debug)]
pub struct LoggingProvider<P> {
    inner: P,
    prefix: String,
}

#[async_trait]
impl<P: Provider> LayeredProvider for LoggingProvider<P> {
    type Inner = P;

    fn inner(&self) -> &Self::Inner {
        &self.inner
    }

    async fn layered_dispatch(&self, req: ProviderRequest) -> Result<ProviderResponse, AiError> {
        let provider = self.inner.info().id.clone();
        tracing::debug!(
            "{} dispatch request: provider={}, model={}, messages={}, request_id={}",
            self.prefix,
            provider,
            req.model,
            req.messages.len(),
            req.request_id
        );

        let start = Instant::now();
        let result = self.inner.dispatch(req).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(response) => {
                tracing::debug!(
                    "{} dispatch success: provider={}, id={}, tokens={}, elapsed={:?}",
                    self.prefix,
                    provider,
                    response.id,
                    response.usage.total_tokens,
                    elapsed
                );
            }
            Err(e) => {
                tracing::warn!(
                    "{} dispatch error: provider={}, error={}, elapsed={:?}",
                    self.prefix,
                    provider,
                    e,
                    elapsed
                );
            }
        }

        result
    }

    async fn layered_dispatch_streaming(
        &self,
        req: ProviderRequest,
    ) -> Result<Box<TextStream>, AiError> {
        let provider = self.inner.info().id.clone();
        tracing::debug!(
            "{} stream request: provider={}, model={}, request_id={}",
            self.prefix,
            provider,
            req.model,
            req.request_id
        );

        let start = Instant::now();
        let mut inner = match self.inner.dispatch_streaming(req).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(
                    "{} stream error: provider={}, error={}, elapsed={:?}",
                    self.prefix,
                    provider,
                    e,
                    start.elapsed()
                );
                return Err(e);
            }
        };
        tracing::debug!(
            "{} stream opened: provider={}, elapsed={:?}",
            self.prefix,
            provider,
            start.elapsed()
        );

        let prefix = self.prefix.clone();
        let stream = async_stream::stream! {
            let mut chunks = 0usize;
            while let Some(item) = inner.next().await {
                match &item {
                    Ok(_) => chunks += 1,
                    Err(e) => tracing::warn!("{} stream failed mid-flight: provider={}, error={}", prefix, provider, e),
                }
                yield item;
            }
            tracing::debug!(
                "{} stream finished: provider={}, chunks={}, elapsed={:?}",
                prefix,
                provider,
                chunks,
                start.elapsed()
            );
        };

        Ok(Box::new(Box::pin(stream)))
    }

    async fn layered_health_probe(&self) -> bool {
        let healthy = self.inner.health_probe().await;
        tracing::debug!(
            "{} health probe: provider={}, healthy={}",
            self.prefix,
            self.inner.info().id,
            healthy
        );
        healthy
    }
}

impl_layered_provider!(LoggingProvider);

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[derive(Debug)]
    struct EchoProvider {
        info: Arc<ProviderInfo>,
    }

    impl EchoProvider {
        fn new() -> Self {
            Self {
                info: Arc::new(ProviderInfo {
                    id: "echo".into(),
                    name: "Echo".into(),
                }),
            }
        }
    }

    #[async_trait]
    impl Provider for EchoProvider {
        fn info(&self) -> Arc<ProviderInfo> {
            self.info.clone()
        }

        async fn dispatch(&self, req: ProviderRequest) -> Result<ProviderResponse, AiError> {
            let text = req
                .messages
                .last()
                .map(|m| m.content.clone())
                .ok_or_else(|| AiError::invalid_request("no messages"))?;
            Ok(ProviderResponse {
                id: req.request_id,
                model: req.model,
                text,
                finish_reason: FinishReason::Stop,
                usage: Usage::new(1, 1),
            })
        }

        async fn dispatch_streaming(&self, _req: ProviderRequest) -> Result<Box<TextStream>, AiError> {
            let chunks = vec![
                Ok(TextChunk::text("a")),
                Ok(TextChunk::text("b")),
                Err(AiError::stream("reset")),
            ];
            Ok(Box::new(tokio_stream::iter(chunks)))
        }

        async fn health_probe(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_logging_layer_is_transparent() {
        let provider = LoggingLayer::with_prefix("[test]").layer(EchoProvider::new());
        assert_eq!(provider.info().id, "echo");

        let response = provider
            .dispatch(ProviderRequest::new("m", vec![Message::user("ping")]))
            .await
            .unwrap();
        assert_eq!(response.text, "ping");

        let err = provider
            .dispatch(ProviderRequest::new("m", Vec::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::InvalidRequest(_)));

        assert!(!provider.health_probe().await);
    }

    #[tokio::test]
    async fn test_logged_stream_forwards_every_item() {
        let provider = LoggingLayer::new().layer(EchoProvider::new());
        let stream = provider
            .dispatch_streaming(ProviderRequest::new("m", vec![Message::user("x")]))
            .await
            .unwrap();

        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 3);
        assert_eq!(items[1].as_ref().unwrap().delta, "b");
        assert!(items[2].is_err());
    }

    #[tokio::test]
    async fn test_layers_stack_behind_arc() {
        let provider: Arc<dyn Provider> = Arc::new(LoggingLayer::new().layer(EchoProvider::new()));
        let twice = LoggingLayer::with_prefix("[outer]").layer(provider);
        let response = twice
            .dispatch(ProviderRequest::new("m", vec![Message::user("nested")]))
            .await
            .unwrap();
        assert_eq!(response.text, "nested");
    }
}
