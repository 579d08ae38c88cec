//! HTTP summarizer for an OpenAI-compatible chat completions endpoint.

use std::time::Duration as StdDuration;

use chrono::Duration;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde::{Deserialize, Serialize};

use crate::keyword::{clean_keyword, prepare_text};
use crate::result::{FailureKind, Keyword, Summarizer};

pub const DEFAULT_INSTRUCTION: &str =
    "Summarize the following text in at most 40 characters of keywords.";

/// Connection settings for the model endpoint.
#[derive(Clone)]
pub struct ClientConfig {
    /// Base URL without the `/chat/completions` suffix.
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub instruction: String,
    pub timeout: StdDuration,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl ClientConfig {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            instruction: DEFAULT_INSTRUCTION.to_string(),
            timeout: StdDuration::from_secs(30),
            max_tokens: 100,
            temperature: 0.7,
            top_p: 0.9,
        }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    /// Instruction and order text on separate lines.
    fn prompt(&self, text: &str) -> String {
        format!("{}\n{}", self.instruction.trim_end(), text)
    }

    fn request<'a>(&'a self, text: &str) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: [ChatMessage {
                role: "user",
                content: self.prompt(text),
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            top_p: self.top_p,
        }
    }
}

// The key stays out of logs and panic messages.
impl core::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage; 1],
    max_tokens: u32,
    temperature: f32,
    top_p: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

/// Blocking HTTP client. One call per `summarize`; no internal retries.
#[derive(Debug, Clone)]
pub struct HttpSummarizer {
    http: Client,
    config: ClientConfig,
}

impl HttpSummarizer {
    pub fn new(config: ClientConfig) -> Result<Self, FailureKind> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| FailureKind::permanent(format!("http client init failed: {e}")))?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

impl Summarizer for HttpSummarizer {
    fn summarize(&self, text: &str) -> Result<Keyword, FailureKind> {
        let text = prepare_text(text)?;
        let body = self.config.request(&text);

        tracing::debug!(
            model = %self.config.model,
            input_chars = text.chars().count(),
            "sending summarize request"
        );

        let response = self
            .http
            .post(self.config.endpoint())
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let body = response.text().map_err(|e| classify_transport(&e))?;

        let outcome = classify_response(status.as_u16(), retry_after.as_deref(), &body);
        if let Err(kind) = &outcome {
            tracing::debug!(status = status.as_u16(), error = %kind, "summarize request failed");
        }
        outcome
    }
}

fn classify_transport(err: &reqwest::Error) -> FailureKind {
    if err.is_timeout() {
        FailureKind::transient("request timed out")
    } else if err.is_builder() {
        FailureKind::permanent(format!("invalid request: {err}"))
    } else if let Some(status) = err.status() {
        status_failure(status.as_u16(), None, "")
    } else {
        // connect, body and decode errors on the transport
        FailureKind::transient(format!("network error: {err}"))
    }
}

/// Map a finished HTTP exchange to a keyword or a classified failure.
///
/// Pure so the classification table can be tested without a server.
pub fn classify_response(
    status: u16,
    retry_after: Option<&str>,
    body: &str,
) -> Result<Keyword, FailureKind> {
    if status != StatusCode::OK.as_u16() {
        return Err(status_failure(status, retry_after, body));
    }

    let parsed: ChatResponse = serde_json::from_str(body)
        .map_err(|e| FailureKind::permanent(format!("malformed response body: {e}")))?;

    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message)
        .and_then(|m| m.content)
        .ok_or_else(|| FailureKind::permanent("response has no choices[0].message.content"))?;

    if content.trim().is_empty() {
        return Err(FailureKind::permanent("model returned empty content"));
    }

    clean_keyword(&content)
        .ok_or_else(|| FailureKind::permanent("model output is empty after cleaning"))
}

fn status_failure(status: u16, retry_after: Option<&str>, body: &str) -> FailureKind {
    match status {
        429 => FailureKind::RateLimited {
            retry_after: retry_after
                .and_then(|v| v.trim().parse::<i64>().ok())
                .filter(|secs| *secs >= 0)
                .map(Duration::seconds),
        },
        408 | 500..=599 => FailureKind::transient(format!("upstream status {status}")),
        _ => {
            let snippet: String = body.chars().take(200).collect();
            FailureKind::permanent(format!("upstream status {status}: {snippet}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok_body(content: &str) -> String {
        json!({
            "id": "chatcmpl-1",
            "choices": [{ "index": 0, "message": { "role": "assistant", "content": content } }]
        })
        .to_string()
    }

    #[test]
    fn success_yields_cleaned_keyword() {
        let kw = classify_response(200, None, &ok_body("  \"事业，贵人。\" ")).unwrap();
        assert_eq!(kw.as_str(), "事业，贵人");
    }

    #[test]
    fn too_many_requests_is_rate_limited() {
        assert_eq!(
            classify_response(429, Some("120"), "slow down"),
            Err(FailureKind::RateLimited {
                retry_after: Some(Duration::seconds(120))
            })
        );
        assert_eq!(
            classify_response(429, Some("Wed, 21 Oct 2026 07:28:00 GMT"), ""),
            Err(FailureKind::RateLimited { retry_after: None })
        );
    }

    #[test]
    fn server_errors_and_request_timeout_are_transient() {
        for status in [500, 502, 503, 504, 408] {
            assert!(
                matches!(classify_response(status, None, ""), Err(FailureKind::Transient(_))),
                "status {status}"
            );
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for status in [400, 401, 403, 404, 422] {
            assert!(
                matches!(classify_response(status, None, "{}"), Err(FailureKind::Permanent(_))),
                "status {status}"
            );
        }
    }

    #[test]
    fn malformed_or_empty_bodies_are_permanent() {
        assert!(matches!(
            classify_response(200, None, "<html>"),
            Err(FailureKind::Permanent(_))
        ));
        assert!(matches!(
            classify_response(200, None, r#"{"choices": []}"#),
            Err(FailureKind::Permanent(_))
        ));
        assert!(matches!(
            classify_response(200, None, r#"{"choices": [{"message": {}}]}"#),
            Err(FailureKind::Permanent(_))
        ));
        assert!(matches!(
            classify_response(200, None, &ok_body("   ")),
            Err(FailureKind::Permanent(_))
        ));
    }

    #[test]
    fn request_body_matches_wire_format() {
        let config = ClientConfig::new("https://api.example.test/v1/", "sk-test", "kw-small");
        assert_eq!(config.endpoint(), "https://api.example.test/v1/chat/completions");

        let value = serde_json::to_value(config.request("hello")).unwrap();
        assert_eq!(value["model"], "kw-small");
        assert_eq!(value["max_tokens"], 100);
        assert_eq!(value["messages"][0]["role"], "user");
        assert!(value["messages"][0]["content"].as_str().unwrap().ends_with("hello"));
    }

    #[test]
    fn instruction_and_text_are_on_separate_lines() {
        let config = ClientConfig::new("https://api.example.test/v1", "sk-test", "kw-small");
        let prompt = config.prompt("will the move go well");
        let (instruction, text) = prompt.rsplit_once('\n').unwrap();
        assert_eq!(instruction, config.instruction.trim_end());
        assert_eq!(text, "will the move go well");
    }

    #[test]
    fn debug_output_redacts_api_key() {
        let config = ClientConfig::new("https://api.example.test/v1", "sk-secret", "kw-small");
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("sk-secret"));
    }

    #[test]
    fn blank_input_fails_before_any_request() {
        let summarizer =
            HttpSummarizer::new(ClientConfig::new("http://127.0.0.1:9", "k", "m")).unwrap();
        assert!(matches!(summarizer.summarize("  "), Err(FailureKind::Permanent(_))));
    }
}
