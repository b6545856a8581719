//! # Quill Providers
//!
//! Backend adapters for the orchestration core.
//!
//! Adapters are built from [`ProviderDescriptor`]s by [`build_provider`],
//! keyed on the descriptor's backend:
//!
//! | backend             | adapter              |
//! |---------------------|----------------------|
//! | `openai`            | [`OpenAiProvider`]   |
//! | `deepseek`          | [`OpenAiProvider`]   |
//! | `openai-compatible` | [`OpenAiProvider`]   |
//! | `anthropic`         | [`AnthropicProvider`]|

pub mod anthropic;
pub mod openai;
pub mod sse;

// Re-exports
pub use anthropic::AnthropicProvider;
pub use openai::{OpenAiBuilder, OpenAiProvider};

use quill_core::config::OrchestratorConfig;
use quill_core::error::AiError;
use quill_core::provider::Provider;
use quill_core::types::ProviderDescriptor;
use std::sync::Arc;
use tracing::debug;

/// Create a DeepSeek provider (OpenAI-compatible)
///
/// DeepSeek uses the OpenAI API protocol but with a different endpoint.
///
/// # Example
///
/// ```ignore
/// use quill_provider::deepseek;
///
/// let provider = deepseek("your-api-key")?;
/// ```
pub fn deepseek(api_key: impl Into<String>) -> Result<OpenAiProvider, AiError> {
    OpenAiProvider::builder()
        .api_key(api_key)
        .api_base(openai::DEEPSEEK_API_BASE)
        .build_with_id("deepseek", "deepseek")
}

/// Build the adapter for one configured provider
pub fn build_provider(descriptor: Arc<ProviderDescriptor>) -> Result<Arc<dyn Provider>, AiError> {
    debug!(
        "Building adapter for {} (backend {})",
        descriptor.name,
        descriptor.backend()
    );
    match descriptor.backend() {
        "openai" | "deepseek" | "openai-compatible" => {
            Ok(Arc::new(OpenAiProvider::from_descriptor(descriptor)?))
        }
        "anthropic" => Ok(Arc::new(AnthropicProvider::from_descriptor(descriptor)?)),
        other => Err(AiError::configuration(format!(
            "provider '{}' has unknown backend '{other}'",
            descriptor.name
        ))),
    }
}

/// Build adapters for every provider in `config`, in declared order
pub fn build_providers(config: &OrchestratorConfig) -> Result<Vec<(String, Arc<dyn Provider>)>, AiError> {
    config
        .providers
        .iter()
        .map(|descriptor| {
            let adapter = build_provider(Arc::new(descriptor.clone()))?;
            Ok((descriptor.name.clone(), adapter))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_dispatches_on_backend() {
        let anthropic = ProviderDescriptor::new("claude", "claude-3-5-haiku-latest")
            .with_backend("anthropic")
            .with_credential("k");
        assert_eq!(build_provider(Arc::new(anthropic)).unwrap().info().name, "Anthropic");

        let deepseek = ProviderDescriptor::new("deepseek", "deepseek-chat").with_credential("k");
        assert_eq!(build_provider(Arc::new(deepseek)).unwrap().info().id, "deepseek");

        let unknown = ProviderDescriptor::new("gemini", "gemini-pro").with_credential("k");
        assert!(matches!(
            build_provider(Arc::new(unknown)),
            Err(AiError::Configuration(_))
        ));
    }

    #[test]
    fn test_build_providers_keeps_order() {
        let config = OrchestratorConfig::default()
            .with_provider(ProviderDescriptor::new("deepseek", "deepseek-chat").with_credential("k"))
            .with_provider(ProviderDescriptor::new("openai", "gpt-4o-mini").with_credential("k"));

        let names: Vec<_> = build_providers(&config)
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, ["deepseek", "openai"]);
    }

    #[test]
    fn test_deepseek_helper() {
        let provider = deepseek("k").unwrap();
        assert_eq!(provider.api_base(), openai::DEEPSEEK_API_BASE);
        assert_eq!(provider.info().name, "DeepSeek");
    }
}
