//! Embedding providers.
//!
//! Implementations of [`Embedder`]:
//! - **[`DisabledEmbedder`]**: chunks are stored without vectors.
//! - **[`OpenAiEmbedder`]**: `POST /v1/embeddings`, key from `OPENAI_API_KEY`.
//! - **[`OllamaEmbedder`]**: `POST <url>/api/embed` on a local Ollama.
//!
//! Use [`create_embedder`] to build the one named by `embedding.provider`.
//!
//! # Retry Strategy
//!
//! Both HTTP providers share [`RetryPolicy`] with the rest of the pipeline:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors and timeouts → retry
//! - Backoff doubles from 1s, capped at 32s
//!
//! Vectors are stored as little-endian `f32` BLOBs ([`vec_to_blob`]).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use paper_harvest_core::retry::{RetryDecision, RetryPolicy};

use crate::config::EmbeddingConfig;
use crate::error::{HarvestError, HarvestResult};
use crate::process::Embedder;

const OPENAI_URL: &str = "https://api.openai.com/v1/embeddings";
const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

fn provider_policy(config: &EmbeddingConfig) -> RetryPolicy {
    RetryPolicy::new(
        config.max_retries,
        Duration::from_secs(1),
        Duration::from_secs(32),
    )
}

fn http_client(config: &EmbeddingConfig) -> HarvestResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| HarvestError::Configuration(format!("embedding HTTP client: {}", e)))
}

/// POST `body` to `url` until it succeeds or the policy gives up.
async fn post_json(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    body: &serde_json::Value,
    policy: &RetryPolicy,
    provider: &str,
) -> HarvestResult<serde_json::Value> {
    let mut retries = 0u32;
    loop {
        let mut request = client.post(url).json(body);
        if let Some(key) = bearer {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let error = match request.send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return Ok(response.json().await?);
                }
                let body_text = response.text().await.unwrap_or_default();
                HarvestError::http(
                    status.as_u16(),
                    format!("{} API error: {}", provider, body_text),
                )
            }
            Err(e) => e.into(),
        };

        match policy.decide(retries, &error) {
            RetryDecision::RetryAfter(delay) => {
                tracing::warn!(provider, error = %error, retry = retries + 1, "embedding request failed, retrying");
                tokio::time::sleep(delay).await;
                retries += 1;
            }
            RetryDecision::GiveUp => return Err(error),
        }
    }
}

fn as_vector(value: &serde_json::Value, provider: &str) -> HarvestResult<Vec<f32>> {
    let items = value.as_array().ok_or_else(|| {
        HarvestError::Processing(format!("invalid {} response: embedding is not an array", provider))
    })?;
    Ok(items
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

/// Extract `data[].embedding`, ordered by `data[].index`.
pub fn parse_openai_response(json: &serde_json::Value) -> HarvestResult<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| {
            HarvestError::Processing("invalid OpenAI response: missing data array".to_string())
        })?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item.get("embedding").ok_or_else(|| {
            HarvestError::Processing("invalid OpenAI response: missing embedding".to_string())
        })?;
        indexed.push((index, as_vector(embedding, "OpenAI")?));
    }
    indexed.sort_by_key(|(index, _)| *index);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

pub fn parse_ollama_response(json: &serde_json::Value) -> HarvestResult<Vec<Vec<f32>>> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| {
            HarvestError::Processing("invalid Ollama response: missing embeddings array".to_string())
        })?
        .iter()
        .map(|e| as_vector(e, "Ollama"))
        .collect()
}

// ============ Disabled ============

pub struct DisabledEmbedder;

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }
    fn dims(&self) -> usize {
        0
    }
    fn is_enabled(&self) -> bool {
        false
    }
    async fn embed(&self, _texts: &[String]) -> HarvestResult<Vec<Vec<f32>>> {
        Err(HarvestError::Configuration(
            "embedding provider is disabled".to_string(),
        ))
    }
}

// ============ OpenAI ============

pub struct OpenAiEmbedder {
    model: String,
    dims: usize,
    api_key: String,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl OpenAiEmbedder {
    /// Requires `embedding.model`, `embedding.dims`, and `OPENAI_API_KEY`.
    pub fn new(config: &EmbeddingConfig) -> HarvestResult<Self> {
        let (model, dims) = model_and_dims(config, "OpenAI")?;
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            HarvestError::Configuration("OPENAI_API_KEY environment variable not set".to_string())
        })?;
        Ok(Self {
            model,
            dims,
            api_key,
            client: http_client(config)?,
            policy: provider_policy(config),
        })
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> HarvestResult<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json = post_json(
            &self.client,
            OPENAI_URL,
            Some(&self.api_key),
            &body,
            &self.policy,
            "OpenAI",
        )
        .await?;
        parse_openai_response(&json)
    }
}

// ============ Ollama ============

pub struct OllamaEmbedder {
    model: String,
    dims: usize,
    url: String,
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl OllamaEmbedder {
    pub fn new(config: &EmbeddingConfig) -> HarvestResult<Self> {
        let (model, dims) = model_and_dims(config, "Ollama")?;
        let url = config
            .url
            .clone()
            .unwrap_or_else(|| OLLAMA_DEFAULT_URL.to_string());
        Ok(Self {
            model,
            dims,
            url: url.trim_end_matches('/').to_string(),
            client: http_client(config)?,
            policy: provider_policy(config),
        })
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn dims(&self) -> usize {
        self.dims
    }
    async fn embed(&self, texts: &[String]) -> HarvestResult<Vec<Vec<f32>>> {
        let body = serde_json::json!({ "model": self.model, "input": texts });
        let json = post_json(
            &self.client,
            &format!("{}/api/embed", self.url),
            None,
            &body,
            &self.policy,
            "Ollama",
        )
        .await?;
        parse_ollama_response(&json)
    }
}

fn model_and_dims(config: &EmbeddingConfig, provider: &str) -> HarvestResult<(String, usize)> {
    let model = config.model.clone().ok_or_else(|| {
        HarvestError::Configuration(format!("embedding.model required for {} provider", provider))
    })?;
    let dims = config.dims.ok_or_else(|| {
        HarvestError::Configuration(format!("embedding.dims required for {} provider", provider))
    })?;
    Ok((model, dims))
}

/// Build the [`Embedder`] named by `embedding.provider`.
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"disabled"` | [`DisabledEmbedder`] |
/// | `"openai"` | [`OpenAiEmbedder`] |
/// | `"ollama"` | [`OllamaEmbedder`] |
pub fn create_embedder(config: &EmbeddingConfig) -> HarvestResult<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "openai" => Ok(Arc::new(OpenAiEmbedder::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaEmbedder::new(config)?)),
        other => Err(HarvestError::Configuration(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}

/// Encode a vector as little-endian `f32` bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn openai_response_is_ordered_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.5, 0.5]},
                {"index": 0, "embedding": [1.0, 0.0]},
            ]
        });
        let vectors = parse_openai_response(&json).unwrap();
        assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.5, 0.5]]);
    }

    #[test]
    fn malformed_responses_are_processing_errors() {
        let err = parse_openai_response(&serde_json::json!({"error": "nope"})).unwrap_err();
        assert!(matches!(err, HarvestError::Processing(_)));
        let err = parse_ollama_response(&serde_json::json!({"embeddings": [1.0]})).unwrap_err();
        assert!(matches!(err, HarvestError::Processing(_)));
    }

    #[test]
    fn ollama_response() {
        let json = serde_json::json!({"embeddings": [[0.25, 0.75], [1.0, 2.0]]});
        assert_eq!(parse_ollama_response(&json).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn disabled_is_not_enabled_and_refuses() {
        let e = create_embedder(&EmbeddingConfig::default()).unwrap();
        assert!(!e.is_enabled());
        assert_eq!(e.model_name(), "disabled");
        assert!(e.embed(&["x".to_string()]).await.is_err());
    }

    #[test]
    fn ollama_requires_model_and_dims() {
        let config = EmbeddingConfig {
            provider: "ollama".into(),
            ..EmbeddingConfig::default()
        };
        assert!(matches!(
            create_embedder(&config),
            Err(HarvestError::Configuration(_))
        ));

        let config = EmbeddingConfig {
            provider: "ollama".into(),
            model: Some("nomic-embed-text".into()),
            dims: Some(768),
            url: Some("http://gpu-box:11434/".into()),
            ..EmbeddingConfig::default()
        };
        let e = create_embedder(&config).unwrap();
        assert_eq!(e.dims(), 768);
    }

    #[test]
    fn unknown_provider_is_rejected() {
        let config = EmbeddingConfig {
            provider: "magic".into(),
            ..EmbeddingConfig::default()
        };
        assert!(create_embedder(&config).is_err());
    }
}
