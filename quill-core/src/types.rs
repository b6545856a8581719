//! Core types for AI operations.

use crate::error::AiError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Default per-request deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Message role
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// Message in a backend conversation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    /// Create a new user message with text
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    /// Create a new assistant message with text
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }

    /// Create a new system message with text
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }
}

// ============================================================================
// Function catalog types
// ============================================================================

/// How a function obtains its input and whether it may run unattended.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Caller must type a prompt
    ManualInput,
    /// Input is the document context
    AutoContext,
    /// Input is the selected text
    AutoSelection,
    /// Selection if present, otherwise the document context
    Hybrid,
}

impl ExecutionMode {
    /// Whether the mode runs without any caller-supplied prompt
    pub fn is_automatic(&self) -> bool {
        !matches!(self, ExecutionMode::ManualInput)
    }
}

/// Function category
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FunctionCategory {
    Generation,
    Optimization,
    Analysis,
    Summarization,
    Translation,
    Conversation,
    Inspiration,
}

/// Capability a function requires or a provider offers
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    TextGeneration,
    TextAnalysis,
    Streaming,
    LongContext,
}

/// Catalog entry describing a function. Immutable once registered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FunctionDescriptor {
    pub id: String,
    pub name: String,
    pub category: FunctionCategory,
    pub default_mode: ExecutionMode,
    #[serde(default)]
    pub min_context_length: usize,
    #[serde(default)]
    pub capabilities: Vec<Capability>,
    /// Instruction sent ahead of the resolved input
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl FunctionDescriptor {
    /// Create a descriptor with no context threshold and no requirements
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        category: FunctionCategory,
        default_mode: ExecutionMode,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            category,
            default_mode,
            min_context_length: 0,
            capabilities: Vec::new(),
            system_prompt: None,
        }
    }

    /// Set the minimum context length for auto-execution
    pub fn with_min_context_length(mut self, len: usize) -> Self {
        self.min_context_length = len;
        self
    }

    /// Add a capability requirement
    pub fn requires(mut self, capability: Capability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    /// Set the system instruction
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

// ============================================================================
// Provider configuration types
// ============================================================================

/// Opaque authentication token. Never printed and never serialized.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Expose the raw token to an adapter building a request
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

/// Backend provider as declared by configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDescriptor {
    /// Unique provider name, also the default backend key
    pub name: String,
    /// Backend kind used by the adapter factory; defaults to `name`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    /// Base endpoint; adapters fall back to the vendor default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default = "default_provider_capabilities")]
    pub capabilities: Vec<Capability>,
    pub default_model: String,
    /// Per-provider in-flight ceiling; the global default applies when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_ceiling: Option<usize>,
    #[serde(default, skip_serializing)]
    pub credential: Option<Credential>,
}

/// Capabilities a provider offers unless its declaration lists them
pub fn default_provider_capabilities() -> Vec<Capability> {
    vec![
        Capability::TextGeneration,
        Capability::TextAnalysis,
        Capability::Streaming,
    ]
}

impl ProviderDescriptor {
    pub fn new(name: impl Into<String>, default_model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            backend: None,
            base_url: None,
            capabilities: default_provider_capabilities(),
            default_model: default_model.into(),
            concurrency_ceiling: None,
            credential: None,
        }
    }

    /// Backend key for the adapter factory
    pub fn backend(&self) -> &str {
        self.backend.as_deref().unwrap_or(&self.name)
    }

    /// Whether this provider offers every capability in `required`
    pub fn supports_all(&self, required: &[Capability]) -> bool {
        required.iter().all(|c| self.capabilities.contains(c))
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        if !self.capabilities.contains(&capability) {
            self.capabilities.push(capability);
        }
        self
    }

    pub fn with_concurrency_ceiling(mut self, ceiling: usize) -> Self {
        self.concurrency_ceiling = Some(ceiling);
        self
    }

    pub fn with_credential(mut self, token: impl Into<String>) -> Self {
        self.credential = Some(Credential::new(token));
        self
    }
}

/// Provider information
#[derive(Debug, Clone)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
}

// ============================================================================
// Request / response model
// ============================================================================

/// Request priority, ordered by weight
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
    Critical,
}

impl Priority {
    pub fn weight(&self) -> u8 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 2,
            Priority::High => 3,
            Priority::Urgent => 4,
            Priority::Critical => 5,
        }
    }
}

/// An abstract generation/analysis task.
#[derive(Debug, Clone)]
pub struct AiRequest {
    pub id: String,
    pub function_id: String,
    pub prompt: String,
    pub context: Option<String>,
    pub selected_text: Option<String>,
    /// Overrides the function's default mode when set
    pub mode: Option<ExecutionMode>,
    /// Explicit provider override
    pub provider: Option<String>,
    /// Explicit model override; the provider default applies otherwise
    pub model: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub timeout: Duration,
    pub priority: Priority,
}

impl AiRequest {
    /// Create a request for `function_id` with a fresh id and default deadline
    pub fn new(function_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            function_id: function_id.into(),
            prompt: String::new(),
            context: None,
            selected_text: None,
            mode: None,
            provider: None,
            model: None,
            max_tokens: None,
            temperature: None,
            timeout: DEFAULT_TIMEOUT,
            priority: Priority::Normal,
        }
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_selected_text(mut self, selected: impl Into<String>) -> Self {
        self.selected_text = Some(selected.into());
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Request translated for a single backend call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub request_id: String,
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Budget the adapter must enforce for this call
    pub timeout: Duration,
    pub stream: bool,
}

impl ProviderRequest {
    pub fn new(model: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            model: model.into(),
            messages,
            temperature: None,
            max_tokens: None,
            timeout: DEFAULT_TIMEOUT,
            stream: false,
        }
    }

    /// System instruction, if the first message carries one
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
    }
}

/// Usage statistics
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub output_bytes: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
            output_bytes: 0,
        }
    }
}

/// Finish reason
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    Other(String),
}

/// Single-shot backend result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub id: String,
    pub model: String,
    pub text: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
}

/// Streaming delta produced by an adapter, in backend order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextChunk {
    pub delta: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl TextChunk {
    pub fn text(delta: impl Into<String>) -> Self {
        Self {
            delta: delta.into(),
            ..Default::default()
        }
    }
}

/// Chunk as delivered to the caller. Sequence numbers start at 0 and have no gaps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputChunk {
    pub sequence: u64,
    pub delta: String,
}

/// Terminal status of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// Outcome of a request.
#[derive(Debug, Clone)]
pub struct AiResponse {
    pub request_id: String,
    /// Provider that served the request; `None` when no provider was reached
    pub provider: Option<String>,
    pub model: Option<String>,
    /// Final text; for streamed responses the concatenation of `chunks`
    pub text: String,
    /// Delivered chunks, empty for non-streamed responses
    pub chunks: Vec<OutputChunk>,
    pub usage: Usage,
    /// Why the backend stopped; `None` when no provider answered
    pub finish_reason: Option<FinishReason>,
    pub latency: Duration,
    pub status: ResponseStatus,
    pub error: Option<AiError>,
    /// Dispatch attempts that reached a provider
    pub attempts: u32,
    pub cached: bool,
}

impl AiResponse {
    /// Successful single-shot response
    pub fn succeeded(request_id: impl Into<String>, provider: impl Into<String>, response: ProviderResponse) -> Self {
        let mut usage = response.usage;
        usage.output_bytes = response.text.len() as u64;
        Self {
            request_id: request_id.into(),
            provider: Some(provider.into()),
            model: Some(response.model),
            text: response.text,
            chunks: Vec::new(),
            usage,
            finish_reason: Some(response.finish_reason),
            latency: Duration::ZERO,
            status: ResponseStatus::Succeeded,
            error: None,
            attempts: 1,
            cached: false,
        }
    }

    /// Terminal failure or cancellation carrying the error detail
    pub fn from_error(request_id: impl Into<String>, provider: Option<String>, error: AiError) -> Self {
        let status = if error.is_cancelled() {
            ResponseStatus::Cancelled
        } else {
            ResponseStatus::Failed
        };
        Self {
            request_id: request_id.into(),
            provider,
            model: None,
            text: String::new(),
            chunks: Vec::new(),
            usage: Usage::default(),
            finish_reason: None,
            latency: Duration::ZERO,
            status,
            error: Some(error),
            attempts: 0,
            cached: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Succeeded
    }

    /// Copy of this response re-addressed to another request
    pub fn for_request(&self, request_id: &str) -> Self {
        let mut copy = self.clone();
        copy.request_id = request_id.to_string();
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_is_redacted() {
        let provider = ProviderDescriptor::new("openai", "gpt-4o-mini").with_credential("sk-secret");
        let printed = format!("{:?}", provider);
        assert!(!printed.contains("sk-secret"));

        let json = serde_json::to_string(&provider).unwrap();
        assert!(!json.contains("sk-secret"));
    }

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::Low < Priority::Normal);
        assert_eq!(Priority::default().weight(), 2);
    }

    #[test]
    fn test_succeeded_keeps_finish_reason() {
        let response = AiResponse::succeeded(
            "r1",
            "a",
            ProviderResponse {
                id: "x".into(),
                model: "m".into(),
                text: "cut".into(),
                finish_reason: FinishReason::Length,
                usage: Usage::new(1, 1),
            },
        );
        assert_eq!(response.finish_reason, Some(FinishReason::Length));
        assert_eq!(response.usage.output_bytes, 3);
    }

    #[test]
    fn test_error_response_status() {
        let cancelled = AiResponse::from_error("r1", None, AiError::Cancelled);
        assert_eq!(cancelled.status, ResponseStatus::Cancelled);

        let failed = AiResponse::from_error("r2", Some("a".into()), AiError::AllProvidersUnavailable);
        assert_eq!(failed.status, ResponseStatus::Failed);
        assert!(!failed.is_success());
    }
}
