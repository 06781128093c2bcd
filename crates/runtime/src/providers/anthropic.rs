//! Anthropic Messages API provider (replay mode).

use super::{FragmentStream, Provider};
use crate::context::{Message, Role};
use crate::{Error, Result};
use async_stream::stream;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::RequestBuilder;
use serde::{Deserialize, Serialize};
use tracing::debug;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Authentication mode for Anthropic API.
#[derive(Debug, Clone)]
pub enum AnthropicAuth {
    /// Standard API key authentication.
    ApiKey(String),
    /// OAuth access token, sent as a bearer token.
    OauthToken(String),
}

impl std::fmt::Display for AnthropicAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(_) => write!(f, "api_key"),
            Self::OauthToken(_) => write!(f, "oauth_token"),
        }
    }
}

impl AnthropicAuth {
    fn apply_headers(&self, req: RequestBuilder) -> RequestBuilder {
        match self {
            Self::ApiKey(key) => req.header("x-api-key", key),
            Self::OauthToken(token) => req.header("Authorization", format!("Bearer {token}")),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// API Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ApiRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    messages: Vec<ApiMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    stop_sequences: &'a [String],
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ApiMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiStreamEvent {
    ContentBlockDelta { delta: ApiDelta },
    MessageStop,
    Error { error: ApiErrorBody },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiDelta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(rename = "type")]
    kind: String,
    message: String,
}

/// What one server-sent-event line means for the fragment stream.
#[derive(Debug, PartialEq)]
enum SseLine {
    Text(String),
    Stop,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine> {
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let event: ApiStreamEvent = serde_json::from_str(data.trim_start())
        .map_err(|e| Error::Provider(format!("bad stream event: {e}")))?;
    match event {
        ApiStreamEvent::ContentBlockDelta {
            delta: ApiDelta::TextDelta { text },
        } => Ok(SseLine::Text(text)),
        ApiStreamEvent::MessageStop => Ok(SseLine::Stop),
        ApiStreamEvent::Error { error } => {
            Err(Error::Provider(format!("{}: {}", error.kind, error.message)))
        }
        ApiStreamEvent::ContentBlockDelta { .. } | ApiStreamEvent::Other => Ok(SseLine::Skip),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Provider Implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for creating an Anthropic provider.
#[derive(Debug, Clone)]
pub struct AnthropicProviderBuilder {
    auth: AnthropicAuth,
    model: String,
    max_tokens: u32,
    stop_sequences: Vec<String>,
    url: String,
}

impl AnthropicProviderBuilder {
    pub fn new(auth: AnthropicAuth, model: impl Into<String>) -> Self {
        Self {
            auth,
            model: model.into(),
            max_tokens: 4096,
            stop_sequences: Vec::new(),
            url: ANTHROPIC_API_URL.to_string(),
        }
    }

    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Sequences that end generation. They are not included in the output.
    pub fn stop_sequences(mut self, stop_sequences: Vec<String>) -> Self {
        self.stop_sequences = stop_sequences;
        self
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn build(self) -> AnthropicProvider {
        AnthropicProvider {
            client: reqwest::Client::new(),
            auth: self.auth,
            model: self.model,
            max_tokens: self.max_tokens,
            stop_sequences: self.stop_sequences,
            url: self.url,
        }
    }
}

/// Anthropic Messages API provider.
///
/// Stateless: every pass sends the full reconstructed context.
pub struct AnthropicProvider {
    client: reqwest::Client,
    auth: AnthropicAuth,
    model: String,
    max_tokens: u32,
    stop_sequences: Vec<String>,
    url: String,
}

impl AnthropicProvider {
    pub fn builder(auth: AnthropicAuth, model: impl Into<String>) -> AnthropicProviderBuilder {
        AnthropicProviderBuilder::new(auth, model)
    }

    fn role_to_api(role: Role) -> &'static str {
        match role {
            Role::User | Role::System => "user",
            Role::Assistant => "assistant",
        }
    }

    fn build_request<'a>(&'a self, messages: &'a [Message]) -> ApiRequest<'a> {
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == Role::System)
            .map(|m| m.content.as_str())
            .collect();
        ApiRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            messages: messages
                .iter()
                .filter(|m| m.role != Role::System)
                .map(|m| ApiMessage {
                    role: Self::role_to_api(m.role),
                    content: &m.content,
                })
                .collect(),
            system: (!system.is_empty()).then(|| system.join("\n\n")),
            stop_sequences: &self.stop_sequences,
            stream: true,
        }
    }
}

impl std::fmt::Display for AnthropicProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "anthropic({}, auth={})", self.model, self.auth)
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        "anthropic"
    }

    async fn stream(&self, messages: &[Message]) -> Result<FragmentStream<'static>> {
        let api_request = self.build_request(messages);

        let req = self
            .client
            .post(&self.url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .header("accept", "text/event-stream");

        let req = self.auth.apply_headers(req);

        let response = req
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response.text().await.unwrap_or_default();
            return Err(Error::Api { status, message });
        }
        debug!(model = %self.model, messages = messages.len(), "stream opened");

        let mut body = response.bytes_stream();
        let fragments = stream! {
            // Raw bytes: a chunk may end inside a multi-byte character.
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        yield Err(Error::Network(e.to_string()));
                        return;
                    }
                };
                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    match parse_sse_line(line.trim_end()) {
                        Ok(SseLine::Text(text)) => yield Ok(text),
                        Ok(SseLine::Stop) => return,
                        Ok(SseLine::Skip) => {}
                        Err(e) => {
                            yield Err(e);
                            return;
                        }
                    }
                }
            }
        };
        Ok(Box::pin(fragments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn provider() -> AnthropicProvider {
        AnthropicProvider::builder(AnthropicAuth::ApiKey("test".into()), "claude-test")
            .max_tokens(256)
            .stop_sequences(vec!["</execute>".into()])
            .build()
    }

    #[test]
    fn auth_display() {
        let api = AnthropicAuth::ApiKey("test".into());
        let oauth = AnthropicAuth::OauthToken("test".into());
        assert_eq!(api.to_string(), "api_key");
        assert_eq!(oauth.to_string(), "oauth_token");
    }

    #[test]
    fn request_moves_system_out_of_messages() {
        let provider = provider();
        let messages = vec![
            Message::system("rules"),
            Message::user("hi"),
            Message::assistant("hello"),
        ];
        let body: Value = serde_json::to_value(provider.build_request(&messages)).unwrap();
        assert_eq!(body["system"], "rules");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stop_sequences"], json!(["</execute>"]));
        assert_eq!(
            body["messages"],
            json!([
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"},
            ])
        );
    }

    #[test]
    fn sse_text_delta() {
        let line = r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#;
        assert_eq!(parse_sse_line(line).unwrap(), SseLine::Text("Hel".into()));
    }

    #[test]
    fn sse_ignores_other_lines() {
        assert_eq!(parse_sse_line("event: ping").unwrap(), SseLine::Skip);
        assert_eq!(parse_sse_line("").unwrap(), SseLine::Skip);
        assert_eq!(
            parse_sse_line(r#"data: {"type":"message_start","message":{}}"#).unwrap(),
            SseLine::Skip
        );
        assert_eq!(
            parse_sse_line(r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{"}}"#).unwrap(),
            SseLine::Skip
        );
    }

    #[test]
    fn sse_stop_and_error() {
        assert_eq!(
            parse_sse_line(r#"data: {"type":"message_stop"}"#).unwrap(),
            SseLine::Stop
        );
        let err = parse_sse_line(
            r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        )
        .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "provider error: overloaded_error: Overloaded");
    }
}
