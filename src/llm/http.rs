//! HTTP provider for OpenAI-compatible and Anthropic chat APIs.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use super::LlmBackend;
use super::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};
use crate::error::LlmError;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Anthropic requires `max_tokens` on every request.
const ANTHROPIC_DEFAULT_MAX_TOKENS: u32 = 4096;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Chat completion over HTTP.
pub struct HttpProvider {
    client: reqwest::Client,
    backend: LlmBackend,
    base_url: String,
    api_key: SecretString,
    model: String,
}

impl HttpProvider {
    pub fn new(
        backend: LlmBackend,
        base_url: Option<&str>,
        api_key: SecretString,
        model: impl Into<String>,
    ) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| LlmError::RequestFailed {
                provider: backend.name().to_string(),
                reason: format!("Failed to build HTTP client: {e}"),
            })?;

        let base_url = base_url
            .unwrap_or(match backend {
                LlmBackend::OpenAi => DEFAULT_OPENAI_BASE_URL,
                LlmBackend::Anthropic => DEFAULT_ANTHROPIC_BASE_URL,
            })
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            client,
            backend,
            base_url,
            api_key,
            model: model.into(),
        })
    }

    fn provider(&self) -> String {
        self.backend.name().to_string()
    }

    fn request_body(&self, request: &CompletionRequest) -> serde_json::Value {
        match self.backend {
            LlmBackend::OpenAi => {
                let mut body = json!({
                    "model": self.model,
                    "messages": request.messages,
                });
                if let Some(max_tokens) = request.max_tokens {
                    body["max_tokens"] = json!(max_tokens);
                }
                if let Some(temperature) = request.temperature {
                    body["temperature"] = json!(temperature);
                }
                body
            }
            LlmBackend::Anthropic => {
                let (system, messages) = split_system(&request.messages);
                let mut body = json!({
                    "model": self.model,
                    "messages": messages,
                    "max_tokens": request.max_tokens.unwrap_or(ANTHROPIC_DEFAULT_MAX_TOKENS),
                });
                if let Some(system) = system {
                    body["system"] = json!(system);
                }
                if let Some(temperature) = request.temperature {
                    body["temperature"] = json!(temperature);
                }
                body
            }
        }
    }
}

#[async_trait]
impl LlmProvider for HttpProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = self.request_body(&request);
        let builder = match self.backend {
            LlmBackend::OpenAi => self
                .client
                .post(format!("{}/chat/completions", self.base_url))
                .bearer_auth(self.api_key.expose_secret()),
            LlmBackend::Anthropic => self
                .client
                .post(format!("{}/messages", self.base_url))
                .header("x-api-key", self.api_key.expose_secret())
                .header("anthropic-version", ANTHROPIC_VERSION),
        };

        debug!(
            provider = self.backend.name(),
            model = %self.model,
            messages = request.messages.len(),
            "Sending completion request"
        );

        let response = builder
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: self.provider(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response.text().await.map_err(|e| LlmError::RequestFailed {
            provider: self.provider(),
            reason: format!("Failed to read response body: {e}"),
        })?;

        if !status.is_success() {
            return Err(status_error(&self.provider(), status, retry_after, &text));
        }

        match self.backend {
            LlmBackend::OpenAi => parse_openai_response(&text),
            LlmBackend::Anthropic => parse_anthropic_response(&text),
        }
    }
}

/// Anthropic takes the system prompt as a top-level field.
fn split_system(messages: &[ChatMessage]) -> (Option<String>, Vec<&ChatMessage>) {
    let system: Vec<&str> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    let rest = messages.iter().filter(|m| m.role != Role::System).collect();
    ((!system.is_empty()).then(|| system.join("\n")), rest)
}

fn status_error(
    provider: &str,
    status: StatusCode,
    retry_after: Option<Duration>,
    body: &str,
) -> LlmError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => LlmError::AuthFailed {
            provider: provider.to_string(),
        },
        StatusCode::TOO_MANY_REQUESTS => LlmError::RateLimited {
            provider: provider.to_string(),
            retry_after,
        },
        _ => LlmError::RequestFailed {
            provider: provider.to_string(),
            reason: format!("HTTP {status}: {}", truncate(body, 500)),
        },
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[derive(Deserialize)]
struct OpenAiResponse {
    id: Option<String>,
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn parse_openai_response(body: &str) -> Result<CompletionResponse, LlmError> {
    let parsed: OpenAiResponse =
        serde_json::from_str(body).map_err(|e| LlmError::InvalidResponse {
            provider: LlmBackend::OpenAi.name().to_string(),
            reason: e.to_string(),
        })?;
    let choice = parsed
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: LlmBackend::OpenAi.name().to_string(),
            reason: "response has no choices".to_string(),
        })?;
    let finish_reason = match choice.finish_reason.as_deref() {
        Some("stop") | None => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("content_filter") => FinishReason::ContentFilter,
        Some(_) => FinishReason::Unknown,
    };
    let (input_tokens, output_tokens) = parsed
        .usage
        .map(|u| (u.prompt_tokens, u.completion_tokens))
        .unwrap_or_default();

    Ok(CompletionResponse {
        content: choice.message.content.unwrap_or_default(),
        input_tokens,
        output_tokens,
        finish_reason,
        response_id: parsed.id,
    })
}

#[derive(Deserialize)]
struct AnthropicResponse {
    id: Option<String>,
    #[serde(default)]
    content: Vec<AnthropicBlock>,
    stop_reason: Option<String>,
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: String,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

fn parse_anthropic_response(body: &str) -> Result<CompletionResponse, LlmError> {
    let parsed: AnthropicResponse =
        serde_json::from_str(body).map_err(|e| LlmError::InvalidResponse {
            provider: LlmBackend::Anthropic.name().to_string(),
            reason: e.to_string(),
        })?;
    let content: String = parsed
        .content
        .iter()
        .filter(|b| b.kind == "text")
        .map(|b| b.text.as_str())
        .collect();
    let finish_reason = match parsed.stop_reason.as_deref() {
        Some("end_turn") | Some("stop_sequence") | None => FinishReason::Stop,
        Some("max_tokens") => FinishReason::Length,
        Some(_) => FinishReason::Unknown,
    };
    let (input_tokens, output_tokens) = parsed
        .usage
        .map(|u| (u.input_tokens, u.output_tokens))
        .unwrap_or_default();

    Ok(CompletionResponse {
        content,
        input_tokens,
        output_tokens,
        finish_reason,
        response_id: parsed.id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider(backend: LlmBackend) -> HttpProvider {
        HttpProvider::new(backend, None, SecretString::from("test-key"), "test-model").unwrap()
    }

    #[test]
    fn default_base_urls() {
        assert_eq!(provider(LlmBackend::OpenAi).base_url, DEFAULT_OPENAI_BASE_URL);
        assert_eq!(
            provider(LlmBackend::Anthropic).base_url,
            DEFAULT_ANTHROPIC_BASE_URL
        );
        let custom = HttpProvider::new(
            LlmBackend::OpenAi,
            Some("http://localhost:8080/v1/"),
            SecretString::from("k"),
            "local",
        )
        .unwrap();
        assert_eq!(custom.base_url, "http://localhost:8080/v1");
    }

    #[test]
    fn anthropic_body_lifts_system_prompt() {
        let request = CompletionRequest::new(vec![
            ChatMessage::system("rules"),
            ChatMessage::user("hello"),
        ]);
        let body = provider(LlmBackend::Anthropic).request_body(&request);
        assert_eq!(body["system"], "rules");
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
        assert_eq!(body["messages"][0]["role"], "user");
    }

    #[test]
    fn openai_body_omits_unset_options() {
        let request = CompletionRequest::new(vec![ChatMessage::user("hello")]);
        let body = provider(LlmBackend::OpenAi).request_body(&request);
        assert!(body.get("max_tokens").is_none());
        assert_eq!(body["model"], "test-model");

        let body = provider(LlmBackend::OpenAi).request_body(&request.with_max_tokens(64));
        assert_eq!(body["max_tokens"], 64);
    }

    #[test]
    fn parses_openai_response() {
        let body = r#"{
            "id": "chatcmpl-1",
            "choices": [{"message": {"role": "assistant", "content": "[APPEND]x[/APPEND]"}, "finish_reason": "length"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 5}
        }"#;
        let response = parse_openai_response(body).unwrap();
        assert_eq!(response.content, "[APPEND]x[/APPEND]");
        assert_eq!(response.finish_reason, FinishReason::Length);
        assert_eq!(response.input_tokens, 12);
        assert_eq!(response.response_id.as_deref(), Some("chatcmpl-1"));
    }

    #[test]
    fn openai_without_choices_is_invalid() {
        assert!(matches!(
            parse_openai_response(r#"{"choices": []}"#),
            Err(LlmError::InvalidResponse { .. })
        ));
        assert!(matches!(
            parse_openai_response("not json"),
            Err(LlmError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn parses_anthropic_response() {
        let body = r#"{
            "id": "msg_1",
            "content": [{"type": "text", "text": "a"}, {"type": "text", "text": "b"}],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 3, "output_tokens": 2}
        }"#;
        let response = parse_anthropic_response(body).unwrap();
        assert_eq!(response.content, "ab");
        assert_eq!(response.finish_reason, FinishReason::Stop);
        assert_eq!(response.output_tokens, 2);
    }

    #[test]
    fn status_codes_map_to_error_kinds() {
        assert!(matches!(
            status_error("openai", StatusCode::UNAUTHORIZED, None, ""),
            LlmError::AuthFailed { .. }
        ));
        assert!(matches!(
            status_error("openai", StatusCode::FORBIDDEN, None, ""),
            LlmError::AuthFailed { .. }
        ));
        match status_error(
            "anthropic",
            StatusCode::TOO_MANY_REQUESTS,
            Some(Duration::from_secs(3)),
            "",
        ) {
            LlmError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(3)))
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(matches!(
            status_error("openai", StatusCode::BAD_GATEWAY, None, "upstream"),
            LlmError::RequestFailed { .. }
        ));
    }
}
