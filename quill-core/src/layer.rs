//! Layer trait and abstractions.
//!
//! Layers wrap an adapter with cross-cutting concerns such as logging, while
//! keeping the [`Provider`] contract unchanged for the orchestrator.

use crate::error::AiError;
use crate::provider::{Provider, TextStream};
use crate::types::*;
use async_trait::async_trait;
use std::sync::Arc;

/// Layer trait for wrapping providers.
///
/// Each layer wraps an inner provider and returns a new provider with
/// enhanced behavior.
pub trait Layer<P: Provider> {
    /// The type of the layered provider
    type LayeredProvider: Provider;

    /// Wrap the inner provider with this layer
    fn layer(&self, inner: P) -> Self::LayeredProvider;
}

/// Helper trait for layered providers.
///
/// Provides forwarding implementations for every provider method.
/// Implementers override only the methods they intercept.
#[async_trait]
pub trait LayeredProvider: Sized + Provider {
    /// The inner provider type
    type Inner: Provider;

    /// Get a reference to the inner provider
    fn inner(&self) -> &Self::Inner;

    /// Default implementation for info - forwards to inner
    fn layered_info(&self) -> Arc<ProviderInfo> {
        self.inner().info()
    }

    /// Default implementation for dispatch - forwards to inner
    async fn layered_dispatch(&self, req: ProviderRequest) -> Result<ProviderResponse, AiError> {
        self.inner().dispatch(req).await
    }

    /// Default implementation for dispatch_streaming - forwards to inner
    async fn layered_dispatch_streaming(
        &self,
        req: ProviderRequest,
    ) -> Result<Box<TextStream>, AiError> {
        self.inner().dispatch_streaming(req).await
    }

    /// Default implementation for health_probe - forwards to inner
    async fn layered_health_probe(&self) -> bool {
        self.inner().health_probe().await
    }
}

/// Macro to implement Provider trait by forwarding to LayeredProvider methods.
///
/// This reduces boilerplate for layered providers.
#[macro_export]
macro_rules! impl_layered_provider {
    ($type:ident) => {
        #[async_trait::async_trait]
        impl<P: $crate::provider::Provider> $crate::provider::Provider for $type<P> {
            fn info(&self) -> std::sync::Arc<$crate::types::ProviderInfo> {
                $crate::layer::LayeredProvider::layered_info(self)
            }

            async fn dispatch(
                &self,
                req: $crate::types::ProviderRequest,
            ) -> Result<$crate::types::ProviderResponse, $crate::error::AiError> {
                $crate::layer::LayeredProvider::layered_dispatch(self, req).await
            }

            async fn dispatch_streaming(
                &self,
                req: $crate::types::ProviderRequest,
            ) -> Result<Box<$crate::provider::TextStream>, $crate::error::AiError> {
                $crate::layer::LayeredProvider::layered_dispatch_streaming(self, req).await
            }

            async fn health_probe(&self) -> bool {
                $crate::layer::LayeredProvider::layered_health_probe(self).await
            }
        }
    };
}
