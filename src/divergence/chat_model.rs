//! OpenAI-compatible chat completion adapter for `StructuredModel`

use super::llm::{ModelError, StructuredModel};
use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Configuration for the chat completion endpoint
#[derive(Debug)]
pub struct ChatCompletionConfig {
    pub endpoint: String,
    pub api_key: Option<SecretString>,
    pub model: String,
    pub timeout: Duration,
    pub temperature: f32,
    pub max_tokens: usize,
}

impl Default for ChatCompletionConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080/v1/chat/completions".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
            timeout: Duration::from_secs(30),
            temperature: 0.0,
            max_tokens: 512,
        }
    }
}

/// Single-attempt chat completion client; retries belong to the host
pub struct ChatCompletionModel {
    client: Client,
    config: ChatCompletionConfig,
}

impl ChatCompletionModel {
    pub fn new(config: ChatCompletionConfig) -> Result<Self, ModelError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ModelError::Initialization(e.to_string()))?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl StructuredModel for ChatCompletionModel {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String, ModelError> {
        let request = ChatCompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            max_tokens: Some(self.config.max_tokens),
            temperature: Some(self.config.temperature),
        };

        let mut req = self.client.post(&self.config.endpoint).json(&request);
        if let Some(ref api_key) = self.config.api_key {
            req = req.bearer_auth(api_key.expose_secret());
        }

        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ModelError::Network(format!("timeout: {}", e))
            } else {
                ModelError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::Api(format!("HTTP {}: {}", status, body)));
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Api(format!("Failed to parse response: {}", e)))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(ModelError::EmptyCompletion)?;

        debug!("Completion received ({} chars)", content.len());
        Ok(content)
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(server: &mockito::ServerGuard) -> ChatCompletionConfig {
        ChatCompletionConfig {
            endpoint: format!("{}/v1/chat/completions", server.url()),
            api_key: Some(SecretString::new("test-key".to_string())),
            timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_complete_returns_first_choice() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .match_header("authorization", "Bearer test-key")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"choices": [{"message": {"role": "assistant", "content": "{\"enrichmentSearches\": []}"}}]}"#,
            )
            .create_async()
            .await;

        let model = ChatCompletionModel::new(config_for(&server)).unwrap();
        let text = model.complete("system", "prompt").await.unwrap();

        assert_eq!(text, r#"{"enrichmentSearches": []}"#);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(503)
            .with_body("overloaded")
            .expect(1)
            .create_async()
            .await;

        let model = ChatCompletionModel::new(config_for(&server)).unwrap();
        let err = model.complete("system", "prompt").await.unwrap_err();

        assert!(matches!(err, ModelError::Api(ref msg) if msg.contains("503")));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_choices() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"choices": []}"#)
            .create_async()
            .await;

        let model = ChatCompletionModel::new(config_for(&server)).unwrap();
        let err = model.complete("system", "prompt").await.unwrap_err();
        assert!(matches!(err, ModelError::EmptyCompletion));
    }
}
