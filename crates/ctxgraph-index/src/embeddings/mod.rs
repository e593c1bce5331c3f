//! Embedding provider trait and implementations.
//!
//! The indexer treats the provider as a black box mapping text to a
//! fixed-length vector. Two providers ship here: an OpenAI-compatible HTTP
//! client and a deterministic feature-hashing embedder that needs no
//! network.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::search::tokenize;

/// Trait for embedding providers.
///
/// Implementations should be Send + Sync to allow use in async contexts.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut embeddings = self.embed_batch(&[text.to_string()]).await?;
        embeddings
            .pop()
            .ok_or_else(|| anyhow::anyhow!("No embedding returned"))
    }

    /// Embed multiple texts in a batch. Output order matches input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Get the number of dimensions
    fn dimensions(&self) -> usize;

    /// Get the model name
    fn model_name(&self) -> &str;

    /// Get the maximum batch size supported.
    fn max_batch_size(&self) -> usize {
        32
    }
}

/// Bounded retry with exponential backoff for embedding batches.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles after each failure
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(1u32 << attempt.min(16))
    }
}

/// Embed a batch, retrying the whole batch on failure.
///
/// Returns the last error and the number of attempts made when every attempt fails.
pub async fn embed_with_retry<E: EmbeddingProvider + ?Sized>(
    provider: &E,
    texts: &[String],
    policy: RetryPolicy,
) -> std::result::Result<Vec<Vec<f32>>, (u32, anyhow::Error)> {
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        match provider.embed_batch(texts).await {
            Ok(vectors) if vectors.len() == texts.len() => return Ok(vectors),
            Ok(vectors) => {
                last_error = Some(anyhow::anyhow!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    texts.len()
                ));
            }
            Err(e) => last_error = Some(e),
        }

        if attempt + 1 < attempts {
            let delay = policy.delay_for(attempt);
            warn!(
                "Embedding batch of {} failed, retrying in {:?} ({}/{})",
                texts.len(),
                delay,
                attempt + 1,
                attempts
            );
            tokio::time::sleep(delay).await;
        }
    }

    Err((
        attempts,
        last_error.unwrap_or_else(|| anyhow::anyhow!("embedding failed")),
    ))
}

/// Request body for embedding API
#[derive(Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

/// Response from embedding API
#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

/// Individual embedding data in response
#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// Embedding provider for any OpenAI-compatible `/embeddings` endpoint.
pub struct OpenAiEmbeddings {
    api_key: Option<String>,
    model: String,
    dimensions: usize,
    batch_size: usize,
    client: Client,
    base_url: String,
}

impl OpenAiEmbeddings {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1/embeddings";
    pub const DEFAULT_MODEL: &'static str = "text-embedding-3-small";

    pub fn new(api_key: Option<String>, model: Option<String>, dimensions: usize) -> Self {
        Self {
            api_key,
            model: model.unwrap_or_else(|| Self::DEFAULT_MODEL.to_string()),
            dimensions,
            batch_size: 32,
            client: Client::new(),
            base_url: Self::DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Set a custom base URL (local servers, proxies, tests).
    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    async fn send_request(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let request_body = EmbeddingRequest {
            model: self.model.clone(),
            input: texts,
        };

        let mut retry_count = 0;
        let max_retries = 3;
        let mut backoff_secs = 1u64;

        loop {
            debug!(
                "Sending embedding request for {} texts to {}",
                request_body.input.len(),
                self.base_url
            );

            let mut request = self
                .client
                .post(&self.base_url)
                .header("Content-Type", "application/json")
                .json(&request_body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            let response = request
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("Network error: {}", e))?;

            let status = response.status();

            if status.is_success() {
                let embedding_response: EmbeddingResponse = response
                    .json()
                    .await
                    .map_err(|e| anyhow::anyhow!("Failed to parse response: {}", e))?;

                let mut embeddings: Vec<(usize, Vec<f32>)> = embedding_response
                    .data
                    .into_iter()
                    .map(|d| (d.index, d.embedding))
                    .collect();
                embeddings.sort_by_key(|(idx, _)| *idx);

                let vectors: Vec<Vec<f32>> = embeddings.into_iter().map(|(_, emb)| emb).collect();
                if let Some(v) = vectors.iter().find(|v| v.len() != self.dimensions) {
                    return Err(anyhow::anyhow!(
                        "Model {} returned {} dimensions, expected {}",
                        self.model,
                        v.len(),
                        self.dimensions
                    ));
                }
                return Ok(vectors);
            }

            if status.as_u16() == 429 {
                retry_count += 1;
                if retry_count > max_retries {
                    return Err(anyhow::anyhow!("Rate limited after {} retries", max_retries));
                }

                let retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(backoff_secs);

                warn!(
                    "Rate limited, retrying after {} seconds (attempt {}/{})",
                    retry_after, retry_count, max_retries
                );

                tokio::time::sleep(Duration::from_secs(retry_after)).await;
                backoff_secs *= 2;
                continue;
            }

            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(anyhow::anyhow!(
                "API error ({}): {}",
                status.as_u16(),
                error_body
            ));
        }
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddings {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        debug!("Embedding batch of {} texts", texts.len());
        self.send_request(texts.to_vec()).await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn max_batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Deterministic feature-hashing embedder.
///
/// Each token and each adjacent token pair is hashed into a signed bucket and
/// the vector is L2-normalised. Texts sharing vocabulary land close together
/// under cosine similarity. Works offline and gives identical vectors across
/// runs and platforms.
#[derive(Debug, Clone)]
pub struct HashingEmbeddings {
    dimensions: usize,
}

impl HashingEmbeddings {
    pub const MODEL_NAME: &'static str = "feature-hashing";

    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }

    pub fn embed_text(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimensions];
        let tokens = tokenize(text);

        let mut add = |feature: &str, weight: f32| {
            let hash = fnv1a(feature.as_bytes());
            let bucket = (hash % self.dimensions as u64) as usize;
            let sign = if (hash >> 63) == 0 { 1.0 } else { -1.0 };
            vector[bucket] += sign * weight;
        };

        for token in &tokens {
            add(token.as_str(), 1.0);
        }
        for pair in tokens.windows(2) {
            add(&format!("{} {}", pair[0], pair[1]), 0.5);
        }

        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HashingEmbeddings {
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_text(t)).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn model_name(&self) -> &str {
        Self::MODEL_NAME
    }

    fn max_batch_size(&self) -> usize {
        64
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}
