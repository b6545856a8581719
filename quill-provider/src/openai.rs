//! OpenAI-compatible adapter using the async-openai crate.
//!
//! Serves OpenAI itself and any backend speaking the same chat completions
//! protocol (DeepSeek and other compatible endpoints).

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    CreateChatCompletionRequest, CreateChatCompletionRequestArgs,
    CreateChatCompletionStreamResponse, FinishReason as OpenAiFinishReason,
};
use async_openai::Client;
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use quill_core::error::AiError;
use quill_core::provider::{Provider, TextStream};
use quill_core::types::*;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Default OpenAI endpoint
pub const OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// DeepSeek's OpenAI-compatible endpoint
pub const DEEPSEEK_API_BASE: &str = "https://api.deepseek.com/v1";

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// OpenAI-compatible provider.
///
/// The credential is read from the provider descriptor for every call; the
/// adapter keeps only its pooled HTTP client.
#[derive(Clone)]
pub struct OpenAiProvider {
    descriptor: Arc<ProviderDescriptor>,
    api_base: String,
    org_id: Option<String>,
    http: reqwest::Client,
    info: Arc<ProviderInfo>,
}

impl std::fmt::Debug for OpenAiProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiProvider")
            .field("info", &self.info)
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl OpenAiProvider {
    /// Create an OpenAI provider for `model` with the default endpoint
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let descriptor = ProviderDescriptor::new("openai", model).with_credential(api_key);
        Self::with_parts(Arc::new(descriptor), OPENAI_API_BASE.to_string(), None, reqwest::Client::new())
    }

    /// Create a builder for more configuration options
    pub fn builder() -> OpenAiBuilder {
        OpenAiBuilder::default()
    }

    /// Create a provider from a configuration entry.
    ///
    /// The endpoint is `base_url` when set, otherwise the vendor default for
    /// the backend (`openai`, `deepseek`). `openai-compatible` backends must
    /// name their endpoint.
    pub fn from_descriptor(descriptor: Arc<ProviderDescriptor>) -> Result<Self, AiError> {
        if descriptor.credential.is_none() {
            return Err(AiError::configuration(format!(
                "provider '{}' has no credential",
                descriptor.name
            )));
        }

        let api_base = match (descriptor.base_url.as_deref(), descriptor.backend()) {
            (Some(base), _) => base.to_string(),
            (None, "deepseek") => DEEPSEEK_API_BASE.to_string(),
            (None, "openai") => OPENAI_API_BASE.to_string(),
            (None, backend) => {
                return Err(AiError::configuration(format!(
                    "provider '{}' with backend '{backend}' needs a baseUrl",
                    descriptor.name
                )))
            }
        };

        Ok(Self::with_parts(descriptor, api_base, None, reqwest::Client::new()))
    }

    fn with_parts(
        descriptor: Arc<ProviderDescriptor>,
        api_base: String,
        org_id: Option<String>,
        http: reqwest::Client,
    ) -> Self {
        let info = Arc::new(ProviderInfo {
            id: descriptor.name.clone(),
            name: display_name(descriptor.backend()).to_string(),
        });
        Self {
            descriptor,
            api_base,
            org_id,
            http,
            info,
        }
    }

    /// Replace the pooled HTTP client
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Per-call client sharing the pooled connection
    fn client(&self) -> Client<OpenAIConfig> {
        let mut config = OpenAIConfig::new().with_api_base(&self.api_base);
        if let Some(credential) = &self.descriptor.credential {
            config = config.with_api_key(credential.expose());
        }
        if let Some(org_id) = &self.org_id {
            config = config.with_org_id(org_id);
        }
        Client::with_config(config).with_http_client(self.http.clone())
    }

    /// Convert our Message type to OpenAI's ChatCompletionRequestMessage
    fn convert_message(msg: &Message) -> Result<ChatCompletionRequestMessage, AiError> {
        let content = msg.content.clone();
        let converted = match msg.role {
            Role::System => ChatCompletionRequestSystemMessageArgs::default()
                .content(content)
                .build()
                .map(ChatCompletionRequestMessage::System),
            Role::User => ChatCompletionRequestUserMessageArgs::default()
                .content(content)
                .build()
                .map(ChatCompletionRequestMessage::User),
            Role::Assistant => ChatCompletionRequestAssistantMessageArgs::default()
                .content(content)
                .build()
                .map(ChatCompletionRequestMessage::Assistant),
        };
        converted.map_err(|e| AiError::invalid_request(format!("Failed to build message: {}", e)))
    }

    /// Build CreateChatCompletionRequest from our ProviderRequest
    #[allow(deprecated)]
    fn build_request(req: &ProviderRequest) -> Result<CreateChatCompletionRequest, AiError> {
        let messages: Result<Vec<_>, _> = req.messages.iter().map(Self::convert_message).collect();

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&req.model).messages(messages?);

        if let Some(max_tokens) = req.max_tokens {
            builder.max_tokens(max_tokens);
        }
        if let Some(temperature) = req.temperature {
            builder.temperature(temperature);
        }
        if req.stream {
            builder.stream(true);
        }

        builder
            .build()
            .map_err(|e| AiError::invalid_request(format!("Failed to build request: {}", e)))
    }

    fn convert_response(
        response: async_openai::types::CreateChatCompletionResponse,
    ) -> Result<ProviderResponse, AiError> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| AiError::provider("No choices in response"))?;

        let usage = response
            .usage
            .map_or_else(Usage::default, |u| Usage::new(u.prompt_tokens, u.completion_tokens));

        Ok(ProviderResponse {
            id: response.id,
            model: response.model,
            text: choice.message.content.unwrap_or_default(),
            finish_reason: choice
                .finish_reason
                .map_or(FinishReason::Stop, convert_finish_reason),
            usage,
        })
    }

    fn convert_stream_chunk(response: CreateChatCompletionStreamResponse) -> TextChunk {
        let usage = response
            .usage
            .map(|u| Usage::new(u.prompt_tokens, u.completion_tokens));

        let mut chunk = TextChunk {
            usage,
            ..Default::default()
        };
        for choice in response.choices {
            if let Some(content) = choice.delta.content {
                chunk.delta.push_str(&content);
            }
            if let Some(reason) = choice.finish_reason {
                chunk.finish_reason = Some(convert_finish_reason(reason));
            }
        }
        chunk
    }
}

fn display_name(backend: &str) -> &'static str {
    match backend {
        "openai" => "OpenAI",
        "deepseek" => "DeepSeek",
        _ => "OpenAI-compatible",
    }
}

fn convert_finish_reason(reason: OpenAiFinishReason) -> FinishReason {
    match reason {
        OpenAiFinishReason::Stop => FinishReason::Stop,
        OpenAiFinishReason::Length => FinishReason::Length,
        OpenAiFinishReason::ContentFilter => FinishReason::ContentFilter,
        other => FinishReason::Other(format!("{:?}", other).to_lowercase()),
    }
}

/// Map an error body's `code`/`type` into the shared taxonomy
pub fn classify_api_error(code: Option<&str>, kind: Option<&str>, message: &str) -> AiError {
    let code = code.unwrap_or_default();
    let kind = kind.unwrap_or_default();
    let detail = format!("{message} (type={kind}, code={code})");

    match (kind, code) {
        (_, "rate_limit_exceeded") | ("rate_limit_error", _) | ("requests", _) | ("tokens", _) => {
            AiError::rate_limit(detail)
        }
        (_, "invalid_api_key")
        | ("authentication_error", _)
        | ("invalid_authentication", _)
        | ("permission_error", _) => AiError::authentication(detail),
        ("server_error", _) | ("api_error", _) | ("overloaded_error", _) | (_, "server_overloaded") => {
            AiError::transient(detail)
        }
        ("invalid_request_error", _) => AiError::invalid_request(detail),
        _ => AiError::provider(detail),
    }
}

fn map_openai_error(err: OpenAIError) -> AiError {
    match err {
        OpenAIError::Reqwest(e) => AiError::from(e),
        OpenAIError::ApiError(api) => {
            classify_api_error(api.code.as_deref(), api.r#type.as_deref(), &api.message)
        }
        err @ OpenAIError::JSONDeserialize(..) => AiError::Serialization(err.to_string()),
        err @ OpenAIError::StreamError(..) => AiError::stream(err.to_string()),
        err @ OpenAIError::InvalidArgument(..) => AiError::invalid_request(err.to_string()),
        other => AiError::provider(other.to_string()),
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn info(&self) -> Arc<ProviderInfo> {
        self.info.clone()
    }

    async fn dispatch(&self, req: ProviderRequest) -> Result<ProviderResponse, AiError> {
        let mut openai_req = Self::build_request(&req)?;
        openai_req.stream = None;

        let client = self.client();
        let response = tokio::time::timeout(req.timeout, client.chat().create(openai_req))
            .await
            .map_err(|_| AiError::transient(format!("{} timed out after {:?}", self.info.id, req.timeout)))?
            .map_err(map_openai_error)?;

        Self::convert_response(response)
    }

    async fn dispatch_streaming(&self, req: ProviderRequest) -> Result<Box<TextStream>, AiError> {
        let mut openai_req = Self::build_request(&req)?;
        openai_req.stream = Some(true);

        let client = self.client();
        let connect = async {
            let mut upstream = client
                .chat()
                .create_stream(openai_req)
                .await
                .map_err(map_openai_error)?;
            // Surface connection failures here so the caller can retry
            let first = upstream.next().await;
            Ok::<_, AiError>((first, upstream))
        };

        let (first, upstream) = tokio::time::timeout(req.timeout, connect)
            .await
            .map_err(|_| AiError::transient(format!("{} timed out connecting", self.info.id)))??;

        let first = match first {
            None => None,
            Some(Ok(chunk)) => Some(chunk),
            Some(Err(err)) => return Err(map_openai_error(err)),
        };
        debug!("Stream opened on {}", self.info.id);

        let text_stream = stream::iter(first.map(Ok))
            .chain(upstream)
            .map(|result| match result {
                Ok(response) => Ok(Self::convert_stream_chunk(response)),
                Err(err) => Err(match map_openai_error(err) {
                    AiError::Serialization(msg) => AiError::stream(msg),
                    other => other,
                }),
            });

        Ok(Box::new(text_stream))
    }

    async fn health_probe(&self) -> bool {
        let client = self.client();
        match tokio::time::timeout(PROBE_TIMEOUT, client.models().list()).await {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                debug!("Health probe for {} failed: {}", self.info.id, err);
                false
            }
            Err(_) => false,
        }
    }
}

/// Builder for OpenAI provider with custom configuration
#[derive(Default)]
pub struct OpenAiBuilder {
    api_key: Option<String>,
    api_base: Option<String>,
    org_id: Option<String>,
    model: Option<String>,
    http: Option<reqwest::Client>,
}

impl OpenAiBuilder {
    /// Set API key
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set API base URL (for OpenAI-compatible APIs like DeepSeek)
    pub fn api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    /// Set organization ID
    pub fn organization(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }

    /// Set the default model
    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Use a preconfigured HTTP client
    pub fn http_client(mut self, http: reqwest::Client) -> Self {
        self.http = Some(http);
        self
    }

    /// Build the provider
    pub fn build(self) -> Result<OpenAiProvider, AiError> {
        self.build_with_id("openai", "openai")
    }

    /// Build a provider with a custom provider ID and backend
    ///
    /// This is useful for OpenAI-compatible APIs like DeepSeek that use
    /// the same protocol but different endpoints.
    pub fn build_with_id(
        self,
        provider_id: impl Into<String>,
        backend: impl Into<String>,
    ) -> Result<OpenAiProvider, AiError> {
        let api_key = self
            .api_key
            .ok_or_else(|| AiError::configuration("API key is required"))?;

        let backend = backend.into();
        let api_base = self.api_base.unwrap_or_else(|| match backend.as_str() {
            "deepseek" => DEEPSEEK_API_BASE.to_string(),
            _ => OPENAI_API_BASE.to_string(),
        });
        let model = self.model.unwrap_or_else(|| match backend.as_str() {
            "deepseek" => "deepseek-chat".to_string(),
            _ => "gpt-4o-mini".to_string(),
        });

        let descriptor = ProviderDescriptor::new(provider_id, model)
            .with_backend(backend)
            .with_base_url(api_base.clone())
            .with_credential(api_key);

        Ok(OpenAiProvider::with_parts(
            Arc::new(descriptor),
            api_base,
            self.org_id,
            self.http.unwrap_or_default(),
        ))
    }
}
