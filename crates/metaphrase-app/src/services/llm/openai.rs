//! OpenAI-compatible chat-completions client.
//!
//! Works against api.openai.com and any compatible gateway via `base_url` /
//! `endpoint_path` overrides. Upstream failures are classified at the wire:
//! 429 is rate limiting, 5xx and 408 are transient network faults, other
//! non-2xx statuses indicate a bad request or configuration, and an empty
//! completion is a protocol violation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::fragment::{Batch, Raw};
use crate::services::context::{LlmClient, Prompt};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4.1-mini";
const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
const DEFAULT_ENDPOINT_PATH: &str = "/chat/completions";
const DEFAULT_TIMEOUT_SECS: u64 = 60;
/// Upstream error bodies are kept to a bounded number of characters.
const ERROR_BODY_LIMIT: usize = 2048;

/// Options for the `openai` client.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OpenAiOptions {
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the api key; checked when `api_key` is
    /// empty. Defaults to `OPENAI_API_KEY`.
    pub api_key_env: String,
    pub api_key: String,
    pub timeout_seconds: u64,
    pub temperature: Option<f64>,
    /// Overrides the default `/chat/completions` path; a full `http(s)://`
    /// URL replaces `base_url` entirely.
    pub endpoint_path: String,
    /// Disables the default `Authorization: Bearer` header for gateways
    /// with their own auth scheme.
    pub disable_default_auth: bool,
    pub extra_headers: std::collections::BTreeMap<String, String>,
}

pub struct OpenAiClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    temperature: Option<f64>,
    disable_auth: bool,
    extra_headers: std::collections::BTreeMap<String, String>,
}

impl OpenAiClient {
    pub fn new(mut options: OpenAiOptions) -> PipelineResult<Self> {
        if options.base_url.is_empty() {
            options.base_url = DEFAULT_BASE_URL.to_string();
        }
        if options.model.is_empty() {
            options.model = DEFAULT_MODEL.to_string();
        }
        if options.api_key_env.is_empty() {
            options.api_key_env = DEFAULT_API_KEY_ENV.to_string();
        }
        if options.endpoint_path.is_empty() {
            options.endpoint_path = DEFAULT_ENDPOINT_PATH.to_string();
        }
        if options.timeout_seconds == 0 {
            options.timeout_seconds = DEFAULT_TIMEOUT_SECS;
        }

        let mut api_key = options.api_key;
        if api_key.is_empty() {
            api_key = std::env::var(&options.api_key_env).unwrap_or_default();
        }
        if api_key.is_empty() && !options.disable_default_auth {
            return Err(PipelineError::invalid(format!(
                "openai: missing api key (set {} or api_key)",
                options.api_key_env
            )));
        }

        let url = if options.endpoint_path.starts_with("http://")
            || options.endpoint_path.starts_with("https://")
        {
            options.endpoint_path
        } else {
            format!(
                "{}/{}",
                options.base_url.trim_end_matches('/'),
                options.endpoint_path.trim_start_matches('/')
            )
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(options.timeout_seconds))
            .build()
            .map_err(|e| PipelineError::invalid(format!("openai: http client: {e}")))?;

        Ok(Self {
            http,
            url,
            api_key,
            model: options.model,
            temperature: options.temperature,
            disable_auth: options.disable_default_auth,
            extra_headers: options.extra_headers,
        })
    }

    fn encode_request(&self, prompt: &Prompt) -> ChatRequest {
        let mut request = ChatRequest {
            model: self.model.clone(),
            messages: Vec::new(),
            temperature: self.temperature,
            response_format: None,
        };
        match prompt {
            Prompt::Text(text) => {
                request.messages.push(WireMessage {
                    role: "user".to_string(),
                    content: text.clone(),
                });
            }
            Prompt::Chat(chat) => {
                for message in &chat.messages {
                    request.messages.push(WireMessage {
                        role: message.role.clone(),
                        content: message.content.clone(),
                    });
                }
                if let Some(schema) = &chat.response_schema {
                    request.response_format = Some(ResponseFormat {
                        kind: "json_schema".to_string(),
                        json_schema: Some(JsonSchemaFormat {
                            name: "translation".to_string(),
                            schema: schema.clone(),
                            strict: true,
                        }),
                    });
                }
            }
        }
        request
    }
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    json_schema: Option<JsonSchemaFormat>,
}

#[derive(Serialize)]
struct JsonSchemaFormat {
    name: String,
    schema: serde_json::Value,
    strict: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: String,
}

fn transport_error(err: reqwest::Error) -> PipelineError {
    if err.is_timeout() {
        return PipelineError::Network(format!("request timed out: {err}"));
    }
    PipelineError::Network(err.to_string())
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn invoke(
        &self,
        ctx: &CancellationToken,
        _batch: &Batch,
        prompt: &Prompt,
    ) -> PipelineResult<Raw> {
        let body = self.encode_request(prompt);
        let mut request = self.http.post(&self.url).json(&body);
        if !self.disable_auth {
            request = request.bearer_auth(&self.api_key);
        }
        for (name, value) in &self.extra_headers {
            if !name.is_empty() {
                request = request.header(name.as_str(), value.as_str());
            }
        }

        let response = tokio::select! {
            _ = ctx.cancelled() => return Err(PipelineError::Cancelled),
            result = request.send() => result.map_err(transport_error)?,
        };

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(PipelineError::RateLimited);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message: String = body.trim().chars().take(ERROR_BODY_LIMIT).collect();
            if status.as_u16() == 408 || status.is_server_error() {
                return Err(PipelineError::Upstream { status: status.as_u16(), message });
            }
            return Err(PipelineError::invalid(format!(
                "openai upstream {}: {message}",
                status.as_u16()
            )));
        }

        let parsed: ChatResponse = tokio::select! {
            _ = ctx.cancelled() => return Err(PipelineError::Cancelled),
            result = response.json() => {
                result.map_err(|e| PipelineError::protocol(format!("response body: {e}")))?
            }
        };
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        if content.is_empty() {
            return Err(PipelineError::protocol("completion has no content"));
        }
        Ok(Raw { text: content })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::ErrorCode;
    use crate::pipeline::fragment::{FileId, Record};
    use crate::services::context::{ChatMessage, ChatPrompt};
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> OpenAiClient {
        OpenAiClient::new(OpenAiOptions {
            base_url: server.uri(),
            api_key: "test-key".to_string(),
            ..OpenAiOptions::default()
        })
        .expect("client builds")
    }

    fn batch() -> Batch {
        let records: Arc<[Record]> = vec![Record {
            index: 0,
            file_id: FileId::from("a.srt"),
            text: "line".to_string(),
            meta: None,
        }]
        .into();
        Batch::new(FileId::from("a.srt"), 0, records, 0..1, 0, 0)
    }

    fn chat_prompt() -> Prompt {
        Prompt::Chat(ChatPrompt {
            messages: vec![ChatMessage::new("user", "translate this")],
            response_schema: Some(serde_json::json!({"type": "array"})),
        })
    }

    #[tokio::test]
    async fn returns_first_choice_content() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({
                "model": DEFAULT_MODEL,
                "response_format": {"type": "json_schema"},
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"content": "[{\"id\":0,\"text\":\"ok\"}]"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let raw = client_for(&server)
            .invoke(&CancellationToken::new(), &batch(), &chat_prompt())
            .await
            .expect("invoke succeeds");
        assert_eq!(raw.text, "[{\"id\":0,\"text\":\"ok\"}]");
    }

    #[tokio::test]
    async fn maps_429_to_rate_limited() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .invoke(&CancellationToken::new(), &batch(), &chat_prompt())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Budget);
    }

    #[tokio::test]
    async fn maps_5xx_to_network() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .invoke(&CancellationToken::new(), &batch(), &chat_prompt())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Network);
        assert!(matches!(err, PipelineError::Upstream { status: 503, .. }));
    }

    #[tokio::test]
    async fn maps_4xx_to_invalid_input() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad request"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .invoke(&CancellationToken::new(), &batch(), &chat_prompt())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Invariant);
    }

    #[tokio::test]
    async fn empty_completion_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": []
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .invoke(&CancellationToken::new(), &batch(), &chat_prompt())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Protocol);
    }

    #[test]
    fn missing_api_key_fails_construction() {
        let err = OpenAiClient::new(OpenAiOptions {
            api_key_env: "METAPHRASE_TEST_UNSET_KEY".to_string(),
            ..OpenAiOptions::default()
        })
        .err()
        .expect("construction must fail without a key");
        assert_eq!(err.code(), ErrorCode::Invariant);
    }

    #[test]
    fn full_endpoint_url_replaces_base() {
        let client = OpenAiClient::new(OpenAiOptions {
            endpoint_path: "https://gateway.example/v2/complete".to_string(),
            api_key: "k".to_string(),
            ..OpenAiOptions::default()
        })
        .expect("client builds");
        assert_eq!(client.url, "https://gateway.example/v2/complete");
    }
}
