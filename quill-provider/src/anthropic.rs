//! Anthropic Messages API adapter.

use crate::sse::{decode_stream, SseEvent};
use async_trait::async_trait;
use futures::StreamExt;
use quill_core::error::AiError;
use quill_core::provider::{Provider, TextStream};
use quill_core::types::*;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Default Anthropic endpoint
pub const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";

/// Pinned API version sent with every call
pub const ANTHROPIC_VERSION: &str = "2023-06-01";

/// The Messages API requires `max_tokens`; used when the request leaves it unset
pub const DEFAULT_MAX_TOKENS: u32 = 1024;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Anthropic provider speaking the Messages API over reqwest.
#[derive(Clone)]
pub struct AnthropicProvider {
    descriptor: Arc<ProviderDescriptor>,
    api_base: String,
    http: reqwest::Client,
    info: Arc<ProviderInfo>,
}

impl std::fmt::Debug for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicProvider")
            .field("info", &self.info)
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl AnthropicProvider {
    /// Create a provider for `model` against the default endpoint
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let descriptor = ProviderDescriptor::new("anthropic", model).with_credential(api_key);
        Self::with_parts(Arc::new(descriptor), ANTHROPIC_API_BASE.to_string())
    }

    /// Create a provider from a configuration entry
    pub fn from_descriptor(descriptor: Arc<ProviderDescriptor>) -> Result<Self, AiError> {
        if descriptor.credential.is_none() {
            return Err(AiError::configuration(format!(
                "provider '{}' has no credential",
                descriptor.name
            )));
        }
        let api_base = descriptor
            .base_url
            .as_deref()
            .unwrap_or(ANTHROPIC_API_BASE)
            .trim_end_matches('/')
            .to_string();
        Ok(Self::with_parts(descriptor, api_base))
    }

    fn with_parts(descriptor: Arc<ProviderDescriptor>, api_base: String) -> Self {
        let info = Arc::new(ProviderInfo {
            id: descriptor.name.clone(),
            name: "Anthropic".to_string(),
        });
        Self {
            descriptor,
            api_base,
            http: reqwest::Client::new(),
            info,
        }
    }

    /// Point the adapter at another endpoint
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Replace the pooled HTTP client
    pub fn with_http_client(mut self, http: reqwest::Client) -> Self {
        self.http = http;
        self
    }

    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = builder.header("anthropic-version", ANTHROPIC_VERSION);
        match &self.descriptor.credential {
            Some(credential) => builder.header("x-api-key", credential.expose()),
            None => builder,
        }
    }

    fn post_messages(&self, req: &ProviderRequest, stream: bool) -> reqwest::RequestBuilder {
        let body = MessagesRequest::from_request(req, stream);
        self.authorized(self.http.post(format!("{}/v1/messages", self.api_base)))
            .json(&body)
    }
}

/// Map an error response into the shared taxonomy
pub fn classify_error(status: u16, body: &str) -> AiError {
    let parsed = serde_json::from_str::<ErrorEnvelope>(body).ok();
    let (kind, message) = match &parsed {
        Some(envelope) => (envelope.error.kind.as_str(), envelope.error.message.as_str()),
        None => ("", body),
    };

    match kind {
        "overloaded_error" | "api_error" => AiError::transient(format!("HTTP {status}: {message}")),
        "rate_limit_error" => AiError::rate_limit(message),
        "authentication_error" | "permission_error" => AiError::authentication(message),
        _ => AiError::from_status(status, message),
    }
}

fn convert_stop_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        None | Some("end_turn") | Some("stop_sequence") => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some("refusal") => FinishReason::ContentFilter,
        Some(other) => FinishReason::Other(other.to_string()),
    }
}

async fn error_from_response(response: reqwest::Response) -> AiError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    classify_error(status, &body)
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<WireMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

impl<'a> MessagesRequest<'a> {
    fn from_request(req: &'a ProviderRequest, stream: bool) -> Self {
        let system: Vec<&str> = req
            .messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();

        let messages = req
            .messages
            .iter()
            .filter_map(|m| {
                let role = match m.role {
                    Role::System => return None,
                    Role::User => "user",
                    Role::Assistant => "assistant",
                };
                Some(WireMessage {
                    role,
                    content: &m.content,
                })
            })
            .collect();

        Self {
            model: &req.model,
            max_tokens: req.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            system: (!system.is_empty()).then(|| system.join("\n\n")),
            messages,
            // The Messages API accepts 0.0..=1.0
            temperature: req.temperature.map(|t| t.clamp(0.0, 1.0)),
            stream,
        }
    }
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    id: String,
    model: String,
    #[serde(default)]
    content: Vec<ContentBlock>,
    stop_reason: Option<String>,
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Text { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StreamEvent {
    MessageStart {
        message: StartMessage,
    },
    ContentBlockDelta {
        delta: BlockDelta,
    },
    MessageDelta {
        delta: MessageDeltaBody,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    MessageStop,
    Error {
        error: ErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StartMessage {
    #[serde(default)]
    usage: WireUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum BlockDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    stop_reason: Option<String>,
}

/// Translate one SSE event. `Ok(None)` means nothing to deliver.
fn translate_event(event: &SseEvent, input_tokens: &mut u32) -> Result<Option<TextChunk>, AiError> {
    let parsed: StreamEvent = serde_json::from_str(&event.data)
        .map_err(|e| AiError::stream(format!("malformed event: {e}")))?;

    match parsed {
        StreamEvent::MessageStart { message } => {
            *input_tokens = message.usage.input_tokens;
            Ok(None)
        }
        StreamEvent::ContentBlockDelta {
            delta: BlockDelta::TextDelta { text },
        } => Ok(Some(TextChunk::text(text))),
        StreamEvent::MessageDelta { delta, usage } => Ok(Some(TextChunk {
            delta: String::new(),
            finish_reason: Some(convert_stop_reason(delta.stop_reason.as_deref())),
            usage: usage.map(|u| Usage::new(*input_tokens, u.output_tokens)),
        })),
        StreamEvent::Error { error } => Err(match error.kind.as_str() {
            "overloaded_error" | "api_error" => AiError::transient(error.message),
            _ => AiError::stream(error.message),
        }),
        StreamEvent::ContentBlockDelta { .. } | StreamEvent::MessageStop | StreamEvent::Other => {
            Ok(None)
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn info(&self) -> Arc<ProviderInfo> {
        self.info.clone()
    }

    async fn dispatch(&self, req: ProviderRequest) -> Result<ProviderResponse, AiError> {
        let response = self.post_messages(&req, false).timeout(req.timeout).send().await?;
        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }

        let body: MessagesResponse = response.json().await?;
        let text = body
            .content
            .into_iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text),
                ContentBlock::Other => None,
            })
            .collect::<String>();

        Ok(ProviderResponse {
            id: body.id,
            model: body.model,
            text,
            finish_reason: convert_stop_reason(body.stop_reason.as_deref()),
            usage: Usage::new(body.usage.input_tokens, body.usage.output_tokens),
        })
    }

    async fn dispatch_streaming(&self, req: ProviderRequest) -> Result<Box<TextStream>, AiError> {
        let send = self.post_messages(&req, true).send();
        let response = tokio::time::timeout(req.timeout, send)
            .await
            .map_err(|_| AiError::transient(format!("{} timed out connecting", self.info.id)))??;

        if !response.status().is_success() {
            return Err(error_from_response(response).await);
        }
        debug!("Stream opened on {}", self.info.id);

        let mut events = Box::pin(decode_stream(response.bytes_stream()));
        let stream = async_stream::stream! {
            let mut input_tokens = 0;
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(err) => {
                        yield Err(err);
                        return;
                    }
                };
                if event.event.as_deref() == Some("message_stop") {
                    return;
                }
                match translate_event(&event, &mut input_tokens) {
                    Ok(Some(chunk)) => yield Ok(chunk),
                    Ok(None) => {}
                    Err(err) => {
                        warn!("Anthropic stream failed: {}", err);
                        yield Err(err);
                        return;
                    }
                }
            }
        };

        Ok(Box::new(Box::pin(stream)))
    }

    async fn health_probe(&self) -> bool {
        let probe = self
            .authorized(self.http.get(format!("{}/v1/models", self.api_base)))
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;
        match probe {
            Ok(response) => response.status().is_success(),
            Err(err) => {
                debug!("Health probe for {} failed: {}", self.info.id, err);
                false
            }
        }
    }
}
