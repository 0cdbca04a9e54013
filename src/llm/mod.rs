pub mod providers;

use crate::config::LlmConfig;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM connection error: {0}")]
    Connection(String),
    #[error("LLM response error: {0}")]
    Response(String),
    #[error("LLM configuration error: {0}")]
    Config(String),
}

/// Text-completion capability. Both the SQL generator and the general
/// knowledge responder talk to the model through this seam so tests can
/// substitute a scripted implementation.
#[async_trait]
pub trait Completion: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Builds completion clients for the configured backend, one bound to the
/// SQL model and one to the general-knowledge model.
pub struct LlmManager {
    sql: Arc<dyn Completion>,
    general: Arc<dyn Completion>,
}

impl LlmManager {
    pub fn new(config: &LlmConfig) -> Result<Self, LlmError> {
        Ok(Self {
            sql: Self::build_client(config, &config.sql_model)?,
            general: Self::build_client(config, &config.general_model)?,
        })
    }

    fn build_client(config: &LlmConfig, model: &str) -> Result<Arc<dyn Completion>, LlmError> {
        match config.backend.as_str() {
            "ollama" => Ok(Arc::new(providers::ollama::OllamaProvider::new(config, model)?)),
            "remote" => Ok(Arc::new(providers::remote::RemoteProvider::new(config, model)?)),
            other => Err(LlmError::Config(format!(
                "Unsupported LLM backend: {}",
                other
            ))),
        }
    }

    pub fn sql_client(&self) -> Arc<dyn Completion> {
        Arc::clone(&self.sql)
    }

    pub fn general_client(&self) -> Arc<dyn Completion> {
        Arc::clone(&self.general)
    }
}
