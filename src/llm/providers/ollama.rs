use crate::config::LlmConfig;
use crate::llm::{Completion, LlmError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error};

const DEFAULT_API_URL: &str = "http://localhost:11434";

/// Completion client for a local Ollama server.
pub struct OllamaProvider {
    client: reqwest::Client,
    endpoint: String,
    model: String,
}

#[derive(Serialize, Debug)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Serialize, Debug)]
struct OllamaOptions {
    num_predict: usize,
    temperature: f32,
}

#[derive(Deserialize, Debug)]
struct OllamaResponse {
    response: String,
}

impl OllamaProvider {
    pub fn new(config: &LlmConfig, model: &str) -> Result<Self, LlmError> {
        let base = config
            .api_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let endpoint = format!("{}/api/generate", base.trim_end_matches('/'));

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            model: model.to_string(),
        })
    }
}

#[async_trait]
impl Completion for OllamaProvider {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        debug!("Sending request to Ollama with model: {}", self.model);

        let request = OllamaRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            stream: false,
            options: OllamaOptions {
                num_predict: 2000,
                temperature: 0.1,
            },
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = match response.text().await {
                Ok(body) => format!(" - Response body: {}", body),
                Err(_) => String::new(),
            };

            error!("Ollama API responded with status code: {}{}", status, error_body);
            return Err(LlmError::Response(format!(
                "Ollama API responded with status code: {}{}",
                status, error_body
            )));
        }

        let response_text = response
            .text()
            .await
            .map_err(|e| LlmError::Response(format!("Failed to read response body: {}", e)))?;

        let ollama_response: OllamaResponse =
            serde_json::from_str(&response_text).map_err(|e| {
                error!(
                    "Failed to parse Ollama response: {} - Response was: {}",
                    e, response_text
                );
                LlmError::Response(format!("Failed to parse Ollama response: {}", e))
            })?;

        Ok(ollama_response.response.trim().to_string())
    }
}
