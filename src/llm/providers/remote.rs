use crate::config::LlmConfig;
use crate::llm::{Completion, LlmError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Completion client for an OpenAI-compatible chat endpoint.
pub struct RemoteProvider {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

#[derive(Serialize)]
struct PromptRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
    max_tokens: usize,
}

#[derive(Serialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct PromptResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: String,
}

impl RemoteProvider {
    pub fn new(config: &LlmConfig, model: &str) -> Result<Self, LlmError> {
        let api_url = config.api_url.clone().ok_or_else(|| {
            LlmError::Config("API URL is required for remote LLM provider".to_string())
        })?;

        let api_key = config.api_key.clone().ok_or_else(|| {
            LlmError::Config("API key is required for remote LLM provider".to_string())
        })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            api_url,
            api_key,
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Completion for RemoteProvider {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let request = PromptRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: 0.1,
            max_tokens: 2000,
        };

        let response = self
            .client
            .post(&self.api_url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            return Err(LlmError::Response(format!(
                "API responded with status code: {}",
                response.status()
            )));
        }

        let prompt_response: PromptResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Response(e.to_string()))?;

        let content = prompt_response
            .choices
            .first()
            .map(|choice| choice.message.content.trim().to_string())
            .ok_or_else(|| LlmError::Response("No choices in response".to_string()))?;

        Ok(content)
    }
}
