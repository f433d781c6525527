use super::pricing::estimate_tokens;
use super::LlmError;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(180);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const ERROR_SNIPPET_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub completion: u64,
    pub cached: u64,
    /// Counts came from the word heuristic, not the API.
    pub estimated: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LlmReply {
    pub text: String,
    pub usage: TokenUsage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Responses,
    ChatCompletions,
}

impl Endpoint {
    fn for_payload(payload: &Value) -> Self {
        if payload.get("input").is_some() {
            Endpoint::Responses
        } else {
            Endpoint::ChatCompletions
        }
    }

    fn path(self) -> &'static str {
        match self {
            Endpoint::Responses => "responses",
            Endpoint::ChatCompletions => "chat/completions",
        }
    }
}

/// Thin OpenAI-compatible HTTP client. Built once and shared behind an `Arc`.
pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    api_base: String,
}

impl LlmClient {
    pub fn new(api_key: impl Into<String>, api_base: Option<String>) -> Result<Self, LlmError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        let api_base = api_base
            .filter(|base| !base.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        Ok(Self {
            http,
            api_key: api_key.into(),
            api_base: api_base.trim_end_matches('/').to_string(),
        })
    }

    pub async fn complete(&self, payload: &Value) -> Result<LlmReply, LlmError> {
        let endpoint = Endpoint::for_payload(payload);
        let url = format!("{}/{}", self.api_base, endpoint.path());
        debug!("-> POST {}", url);

        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        let raw = response.text().await?;
        if !status.is_success() {
            let message = serde_json::from_str::<Value>(&raw)
                .ok()
                .and_then(|body| {
                    body.pointer("/error/message")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                })
                .unwrap_or_else(|| error_snippet(&raw));
            warn!("LLM call failed with {}: {}", status, message);
            return Err(LlmError::Api {
                status: status.as_u16(),
                message,
            });
        }
        let body: Value = serde_json::from_str(&raw)?;

        let (text, usage) = parse_reply(endpoint, &body)?;
        // No usage block: fall back to the word-count heuristic, so cost is approximate.
        let usage = usage.unwrap_or_else(|| TokenUsage {
            prompt: estimate_tokens(&payload_prompt_text(payload)),
            completion: estimate_tokens(&text),
            cached: 0,
            estimated: true,
        });
        Ok(LlmReply { text, usage })
    }
}

fn error_snippet(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return "unknown error".to_string();
    }
    trimmed.chars().take(ERROR_SNIPPET_CHARS).collect()
}

fn content_item_text(item: &Value) -> Option<&str> {
    let text = match item {
        Value::String(s) => Some(s.as_str()),
        Value::Object(map) => match map.get("text") {
            Some(Value::String(s)) => Some(s.as_str()),
            Some(Value::Object(inner)) => inner.get("value").and_then(Value::as_str),
            _ => map.get("value").and_then(Value::as_str),
        },
        _ => None,
    }?;
    let text = text.trim();
    (!text.is_empty()).then_some(text)
}

fn responses_text(body: &Value) -> String {
    let segments: Vec<&str> = body
        .get("output")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .flat_map(|block| match block.get("content") {
            Some(Value::Array(items)) => items.iter().filter_map(content_item_text).collect(),
            Some(other) => content_item_text(other).into_iter().collect(),
            None => Vec::new(),
        })
        .collect();
    if !segments.is_empty() {
        return segments.join("\n");
    }
    body.get("output_text")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

fn usage_from(body: &Value, prompt_key: &str, completion_key: &str, details_key: &str) -> Option<TokenUsage> {
    let usage = body.get("usage")?;
    let prompt = usage.get(prompt_key).and_then(Value::as_u64)?;
    let completion = usage.get(completion_key).and_then(Value::as_u64)?;
    let cached = usage
        .get(details_key)
        .and_then(|details| details.get("cached_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Some(TokenUsage {
        prompt,
        completion,
        cached,
        estimated: false,
    })
}

fn parse_reply(endpoint: Endpoint, body: &Value) -> Result<(String, Option<TokenUsage>), LlmError> {
    let (text, usage) = match endpoint {
        Endpoint::Responses => {
            let text = responses_text(body);
            let status = body.get("status").and_then(Value::as_str).unwrap_or("");
            if text.is_empty() && !status.is_empty() && status != "completed" {
                let reason = body
                    .pointer("/incomplete_details/reason")
                    .and_then(Value::as_str)
                    .filter(|r| !r.is_empty())
                    .unwrap_or(status);
                return Err(LlmError::Incomplete(reason.to_string()));
            }
            (
                text,
                usage_from(body, "input_tokens", "output_tokens", "input_tokens_details"),
            )
        }
        Endpoint::ChatCompletions => (
            body.pointer("/choices/0/message/content")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
                .unwrap_or_default(),
            usage_from(body, "prompt_tokens", "completion_tokens", "prompt_tokens_details"),
        ),
    };
    if text.is_empty() {
        return Err(LlmError::Empty);
    }
    Ok((text, usage))
}

/// Every prompt string in a request body, for token estimates when the API reports no usage.
fn payload_prompt_text(payload: &Value) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for message in payload
        .get("messages")
        .or_else(|| payload.get("input"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        match message.get("content") {
            Some(Value::String(s)) => parts.push(s),
            Some(Value::Array(items)) => parts.extend(items.iter().filter_map(content_item_text)),
            _ => {}
        }
    }
    parts.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{routing::post, Json, Router};
    use serde_json::json;

    #[test]
    fn responses_text_joins_fragments() {
        let body = json!({
            "status": "completed",
            "output": [
                {"type": "reasoning", "summary": []},
                {"content": [
                    {"type": "output_text", "text": "{\"a\":"},
                    {"type": "output_text", "text": {"value": "1}"}}
                ]}
            ],
            "usage": {"input_tokens": 10, "output_tokens": 4, "input_tokens_details": {"cached_tokens": 6}}
        });
        let (text, usage) = parse_reply(Endpoint::Responses, &body).unwrap();
        assert_eq!(text, "{\"a\":\n1}");
        let usage = usage.unwrap();
        assert_eq!((usage.prompt, usage.completion, usage.cached), (10, 4, 6));
    }

    #[test]
    fn responses_falls_back_to_output_text() {
        let body = json!({"status": "completed", "output": [], "output_text": " {} "});
        let (text, usage) = parse_reply(Endpoint::Responses, &body).unwrap();
        assert_eq!(text, "{}");
        assert!(usage.is_none());
    }

    #[test]
    fn incomplete_response_reports_reason() {
        let body = json!({
            "status": "incomplete",
            "incomplete_details": {"reason": "max_output_tokens"},
            "output": []
        });
        match parse_reply(Endpoint::Responses, &body) {
            Err(LlmError::Incomplete(reason)) => assert_eq!(reason, "max_output_tokens"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn chat_reply_without_content_is_empty() {
        let body = json!({"choices": [{"message": {"content": null}}]});
        assert!(matches!(
            parse_reply(Endpoint::ChatCompletions, &body),
            Err(LlmError::Empty)
        ));
    }

    async fn mock_api(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/v1")
    }

    #[tokio::test]
    async fn chat_completion_estimates_missing_usage() {
        let base = mock_api(Router::new().route(
            "/v1/chat/completions",
            post(|| async { Json(json!({"choices": [{"message": {"content": "{\"ok\": true}"}}]})) }),
        ))
        .await;
        let client = LlmClient::new("test-key", Some(base)).unwrap();
        let payload = json!({
            "model": "gpt-4o-mini",
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": "one two three four"}
            ]
        });
        let reply = client.complete(&payload).await.unwrap();
        assert_eq!(reply.text, "{\"ok\": true}");
        assert!(reply.usage.estimated);
        assert_eq!(reply.usage.prompt, 7);
        assert_eq!(reply.usage.completion, 2);
    }

    #[tokio::test]
    async fn api_errors_surface_message() {
        let base = mock_api(Router::new().route(
            "/v1/responses",
            post(|| async {
                (
                    axum::http::StatusCode::UNAUTHORIZED,
                    Json(json!({"error": {"message": "bad key"}})),
                )
            }),
        ))
        .await;
        let client = LlmClient::new("nope", Some(base)).unwrap();
        let err = client
            .complete(&json!({"model": "gpt-5-nano", "input": []}))
            .await
            .unwrap_err();
        match err {
            LlmError::Api { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "bad key");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn gateway_error_pages_keep_status() {
        let base = mock_api(Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                (
                    axum::http::StatusCode::BAD_GATEWAY,
                    "<html>Bad gateway</html>",
                )
            }),
        ))
        .await;
        let client = LlmClient::new("k", Some(base)).unwrap();
        let err = client
            .complete(&json!({"model": "gpt-4o-mini", "messages": []}))
            .await
            .unwrap_err();
        match err {
            LlmError::Api { status, message } => {
                assert_eq!(status, 502);
                assert_eq!(message, "<html>Bad gateway</html>");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_json_success_body_is_a_decode_error() {
        let base = mock_api(Router::new().route(
            "/v1/chat/completions",
            post(|| async { "plain text" }),
        ))
        .await;
        let client = LlmClient::new("k", Some(base)).unwrap();
        let err = client
            .complete(&json!({"model": "gpt-4o-mini", "messages": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Decode(_)), "{err:?}");
    }
}
