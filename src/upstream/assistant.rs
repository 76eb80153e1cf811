//! Optional chat-completion collaborator used by `POST /api/assistant`.
//!
//! Nothing in the control plane depends on it; without an API key the route
//! answers `ServiceUnavailable`.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;

use crate::config::AssistantConfig;
use crate::error::{ControlError, Result};

pub const SYSTEM_PROMPT: &str = "You are a helpful DevOps assistant. Analyze logs and provide clear step-by-step diagnostics, cautions, and commands to run. Prefer safe, non-destructive suggestions.";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String>;
}

/// OpenAI-compatible `/chat/completions` client.
pub struct OpenAiCompletion {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl OpenAiCompletion {
    /// `None` when no API key is configured.
    pub fn from_config(config: &AssistantConfig) -> anyhow::Result<Option<Self>> {
        let Some(api_key) = config.api_key.clone().filter(|k| !k.is_empty()) else {
            return Ok(None);
        };

        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("opsdeck/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Some(Self {
            http,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key,
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }))
    }

    fn request_body(&self, system_prompt: &str, user_prompt: &str) -> Value {
        serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": system_prompt },
                { "role": "user", "content": user_prompt },
            ],
            "max_tokens": self.max_tokens,
        })
    }
}

#[async_trait]
impl CompletionService for OpenAiCompletion {
    async fn complete(&self, system_prompt: &str, user_prompt: &str) -> Result<String> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&self.request_body(system_prompt, user_prompt))
            .send()
            .await
            .map_err(|e| ControlError::Upstream(format!("completion request failed: {}", e.without_url())))?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(status = %status, model = %self.model, "Completion service returned an error");
            return Err(ControlError::Upstream(format!("completion service returned {}", status)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ControlError::Upstream(format!("invalid completion response: {}", e.without_url())))?;

        tracing::debug!(model = %self.model, "Completion received");
        Ok(extract_reply(&body))
    }
}

/// `choices[0].message.content`, or empty when absent.
pub fn extract_reply(body: &Value) -> String {
    body.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderMap;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_extract_reply() {
        let body = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "Check disk space." } }]
        });
        assert_eq!(extract_reply(&body), "Check disk space.");
        assert_eq!(extract_reply(&serde_json::json!({ "choices": [] })), "");
        assert_eq!(extract_reply(&serde_json::json!({})), "");
    }

    #[test]
    fn test_disabled_without_key() {
        let config = AssistantConfig::default();
        assert!(OpenAiCompletion::from_config(&config).unwrap().is_none());

        let config = AssistantConfig {
            api_key: Some(String::new()),
            ..AssistantConfig::default()
        };
        assert!(OpenAiCompletion::from_config(&config).unwrap().is_none());
    }

    #[derive(Default)]
    struct Seen {
        auth: Option<String>,
        body: Option<Value>,
    }

    async fn mock_upstream(status: u16, reply: Value) -> (String, Arc<Mutex<Seen>>) {
        let seen = Arc::new(Mutex::new(Seen::default()));
        let recorder = seen.clone();
        let app = Router::new().route(
            "/v1/chat/completions",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let recorder = recorder.clone();
                let reply = reply.clone();
                async move {
                    {
                        let mut seen = recorder.lock().unwrap();
                        seen.auth = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        seen.body = Some(body);
                    }
                    (
                        axum::http::StatusCode::from_u16(status).unwrap(),
                        Json(reply),
                    )
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/v1", addr), seen)
    }

    fn client(base_url: String) -> OpenAiCompletion {
        let config = AssistantConfig {
            api_key: Some("sk-test".into()),
            base_url,
            ..AssistantConfig::default()
        };
        OpenAiCompletion::from_config(&config).unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_complete_posts_chat_request() {
        let (base_url, seen) = mock_upstream(
            200,
            serde_json::json!({ "choices": [{ "message": { "content": "Restart the worker." } }] }),
        )
        .await;

        let reply = client(base_url)
            .complete(SYSTEM_PROMPT, "why is uat1 down?")
            .await
            .unwrap();
        assert_eq!(reply, "Restart the worker.");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.auth.as_deref(), Some("Bearer sk-test"));
        let body = seen.body.as_ref().unwrap();
        assert_eq!(body["model"], "gpt-4o-mini");
        assert_eq!(body["max_tokens"], 600);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][0]["content"], SYSTEM_PROMPT);
        assert_eq!(body["messages"][1]["content"], "why is uat1 down?");
    }

    #[tokio::test]
    async fn test_complete_upstream_error() {
        let (base_url, _) = mock_upstream(500, serde_json::json!({ "error": "boom" })).await;
        let err = client(base_url).complete(SYSTEM_PROMPT, "hi").await.unwrap_err();
        assert_eq!(err.kind(), "upstream");
    }
}
