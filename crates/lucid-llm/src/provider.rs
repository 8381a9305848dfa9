use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::instrument;

use lucid_core::config::{InferenceConfig, SamplingOptions};
use lucid_core::errors::InferenceError;
use lucid_core::history::HistoryEntry;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Inference backend abstraction. The control plane only ever talks
/// through this trait so tests can substitute a mock.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Model ids currently loaded on the backend.
    async fn list_models(&self) -> Result<Vec<String>, InferenceError>;

    /// Run one non-streaming completion over the session transcript.
    async fn complete(&self, entries: &[HistoryEntry]) -> Result<String, InferenceError>;
}

/// Provider for an OpenAI-compatible HTTP backend.
///
/// The model is discovered on first use via `GET /v1/models` and cached:
/// the first loaded model whose id contains the configured hint wins,
/// falling back to the first loaded model.
pub struct HttpProvider {
    client: Client,
    base_url: String,
    model_hint: Option<String>,
    sampling: SamplingOptions,
    resolved_model: RwLock<Option<String>>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

impl HttpProvider {
    pub fn new(config: &InferenceConfig, request_timeout: Duration) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .timeout(request_timeout)
                .build()
                .expect("failed to build HTTP client"),
            base_url: config.base_url(),
            model_hint: config.model_hint.clone(),
            sampling: config.sampling.clone(),
            resolved_model: RwLock::new(None),
        }
    }

    async fn resolve_model(&self) -> Result<String, InferenceError> {
        if let Some(model) = self.resolved_model.read().await.clone() {
            return Ok(model);
        }
        let models = self.list_models().await?;
        let model = select_model(&models, self.model_hint.as_deref())
            .ok_or(InferenceError::NoModels)?
            .to_string();
        tracing::info!(model = %model, "resolved inference model");
        *self.resolved_model.write().await = Some(model.clone());
        Ok(model)
    }
}

#[async_trait]
impl InferenceProvider for HttpProvider {
    fn name(&self) -> &str {
        "http"
    }

    async fn list_models(&self) -> Result<Vec<String>, InferenceError> {
        let url = format!("{}/v1/models", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(map_transport)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(InferenceError::from_status(status, body));
        }

        let parsed: ModelsResponse = resp
            .json()
            .await
            .map_err(|e| InferenceError::InvalidResponse(e.to_string()))?;
        Ok(parsed.data.into_iter().map(|m| m.id).collect())
    }

    #[instrument(skip(self, entries), fields(messages = entries.len()))]
    async fn complete(&self, entries: &[HistoryEntry]) -> Result<String, InferenceError> {
        let model = self.resolve_model().await?;
        let body = build_request_body(&model, entries, &self.sampling);

        let url = format!("{}/v1/chat/completions", self.base_url);
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(map_transport)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(InferenceError::from_status(status, body));
        }

        let value: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| InferenceError::InvalidResponse(e.to_string()))?;
        parse_completion(&value)
    }
}

fn map_transport(e: reqwest::Error) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout(CONNECT_TIMEOUT)
    } else {
        InferenceError::NetworkError(e.to_string())
    }
}

/// Pick the model to use: first id containing the hint (case-insensitive),
/// else the first loaded model.
fn select_model<'a>(models: &'a [String], hint: Option<&str>) -> Option<&'a str> {
    if let Some(hint) = hint {
        let hint = hint.to_lowercase();
        if let Some(hit) = models.iter().find(|m| m.to_lowercase().contains(&hint)) {
            return Some(hit);
        }
    }
    models.first().map(String::as_str)
}

fn build_request_body(
    model: &str,
    entries: &[HistoryEntry],
    sampling: &SamplingOptions,
) -> serde_json::Value {
    let messages: Vec<serde_json::Value> = entries
        .iter()
        .map(|e| {
            serde_json::json!({
                "role": e.role.as_str(),
                "content": e.content,
            })
        })
        .collect();

    serde_json::json!({
        "model": model,
        "messages": messages,
        "max_tokens": sampling.max_tokens,
        "temperature": sampling.temperature,
        "top_p": sampling.top_p,
        "stream": false,
    })
}

fn parse_completion(value: &serde_json::Value) -> Result<String, InferenceError> {
    value["choices"][0]["message"]["content"]
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| {
            InferenceError::InvalidResponse(format!(
                "missing choices[0].message.content in {value}"
            ))
        })
}
