use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::clients::{ModelTransport, TransportError};

/// Cap on a completion response body.
pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Maximum time to wait for response headers after sending the request.
/// The façade's per-call timeout still applies on top of this.
const HEADERS_TIMEOUT: Duration = Duration::from_secs(60);

/// OpenAI-compatible chat-completions transport (non-streaming).
///
/// This is the bundled production transport; tests and other embeddings
/// supply their own [`ModelTransport`] implementations.
pub struct HttpModelTransport {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    temperature: Option<f64>,
    max_tokens: Option<u64>,
}

#[derive(Deserialize)]
struct Completion {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

impl HttpModelTransport {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(4)
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u64) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    fn body(&self, prompt: &str, system: Option<&str>) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(serde_json::json!({"role": "system", "content": system}));
        }
        messages.push(serde_json::json!({"role": "user", "content": prompt}));

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": messages,
        });
        if let Some(temp) = self.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if let Some(max) = self.max_tokens {
            body["max_tokens"] = serde_json::json!(max);
        }
        body
    }
}

#[async_trait]
impl ModelTransport for HttpModelTransport {
    async fn complete(
        &self,
        prompt: &str,
        system: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, TransportError> {
        let send_future = self
            .client
            .post(&self.base_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&self.body(prompt, system))
            .send();

        // Scoped timeout around send() only. Covers the gap between
        // connection and first response header.
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            result = tokio::time::timeout(HEADERS_TIMEOUT, send_future) => result
                .map_err(|_| TransportError::Timeout)?
                .map_err(|e| TransportError::Unavailable(sanitize(&e)))?,
        };

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(TransportError::RateLimited);
        }
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(TransportError::Denied(status.to_string()));
        }
        if !status.is_success() {
            // Error bodies are small; still cap what we echo into the error.
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.chars().take(200).collect();
            return Err(TransportError::Unavailable(format!("{status}: {snippet}")));
        }

        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            bytes = response.bytes() => {
                bytes.map_err(|e| TransportError::Unavailable(sanitize(&e)))?
            }
        };
        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(TransportError::Invalid(format!(
                "response too large: {}B",
                bytes.len()
            )));
        }

        let completion: Completion = serde_json::from_slice(&bytes)
            .map_err(|e| TransportError::Invalid(format!("unparsable completion: {e}")))?;
        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| TransportError::Invalid("completion had no content".to_string()))
    }
}

/// Strip URLs and connection detail out of reqwest errors before they reach
/// logs or task records.
fn sanitize(e: &reqwest::Error) -> String {
    if e.is_connect() {
        "connect error".to_string()
    } else if e.is_timeout() {
        "request timeout".to_string()
    } else if e.is_body() || e.is_decode() {
        "body read error".to_string()
    } else {
        "request error".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_includes_system_and_options() {
        let transport = HttpModelTransport::new("http://localhost/v1", "k", "insight-model")
            .with_temperature(0.0)
            .with_max_tokens(2048);
        let body = transport.body("question", Some("you are a router"));
        assert_eq!(body["model"], "insight-model");
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["role"], "user");
        assert_eq!(body["temperature"], 0.0);
        assert_eq!(body["max_tokens"], 2048);
    }

    #[test]
    fn body_omits_absent_options() {
        let transport = HttpModelTransport::new("http://localhost/v1", "k", "insight-model");
        let body = transport.body("question", None);
        assert_eq!(body["messages"][0]["role"], "user");
        assert!(body.get("temperature").is_none());
        assert!(body.get("max_tokens").is_none());
    }

    #[test]
    fn completion_shape_parses() {
        let raw = r#"{"choices": [{"message": {"role": "assistant", "content": "{\"a\":1}"}}]}"#;
        let completion: Completion = serde_json::from_str(raw).unwrap();
        assert_eq!(
            completion.choices[0].message.content.as_deref(),
            Some("{\"a\":1}")
        );
    }
}
