//! Generation collaborator
//!
//! Stages talk to a language model only through [`Generator`]: a prompt in,
//! raw text out. Stage-specific JSON is pulled out of the text with
//! [`parse_structured`]; anything that does not parse is a generation error,
//! never a panic.

pub mod prompts;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use crate::config::GenerationConfig;
use crate::error::AppError;

const SYSTEM_PROMPT: &str = "You annotate relational database schemas for business users. \
Answer with a single JSON object and nothing else.";

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, AppError>;

    fn model_id(&self) -> &str;
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint
#[derive(Clone)]
pub struct GenerationClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    model: String,
}

impl GenerationClient {
    pub fn new(config: &GenerationConfig) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AppError::Config(format!("generation client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }
}

#[derive(Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[async_trait]
impl Generator for GenerationClient {
    async fn generate(&self, prompt: &str) -> Result<String, AppError> {
        let body = serde_json::json!({
            "model": &self.model,
            "messages": [
                {"role": "system", "content": SYSTEM_PROMPT},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.1,
            "response_format": {"type": "json_object"}
        });

        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AppError::Generation(format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Generation(format!("endpoint returned {}: {}", status, body)));
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|e| AppError::Generation(format!("malformed completion: {}", e)))?;

        let text = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| AppError::Generation("completion had no content".to_string()))?;

        debug!(model = %self.model, chars = text.len(), "Generation complete");
        Ok(text)
    }

    fn model_id(&self) -> &str {
        &self.model
    }
}

/// Extract the JSON object from model output and decode it.
///
/// Tolerates code fences and prose around the object.
pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T, AppError> {
    let start = raw.find('{');
    let end = raw.rfind('}');
    let json = match (start, end) {
        (Some(start), Some(end)) if end > start => &raw[start..=end],
        _ => {
            return Err(AppError::Generation(format!(
                "no JSON object in output: {}",
                preview(raw)
            )))
        }
    };

    serde_json::from_str(json)
        .map_err(|e| AppError::Generation(format!("unparseable output ({}): {}", e, preview(raw))))
}

fn preview(raw: &str) -> String {
    let trimmed = raw.trim();
    match trimmed.char_indices().nth(120) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}
