//! Embedding client: dimension detection/caching and embedding requests
//! against an OpenAI-compatible HTTP endpoint (§4.3).

use once_cell::sync::OnceCell;

use crate::error::{MemoryError, Result};

/// Configuration recognized by the embedding client (§4.3).
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub url: String,
    pub model: String,
    pub api_key: Option<String>,
    /// Requested dimensionality for Matryoshka-capable models.
    pub dims: Option<usize>,
}

/// Trait implemented by embedding backends.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;
    fn model_name(&self) -> &str;
    /// Cached dimensionality, populated by `detect_dimension`.
    fn dimension(&self) -> Result<usize>;
}

/// OpenAI-compatible embedding client.
pub struct HttpEmbedder {
    client: reqwest::Client,
    config: EmbeddingConfig,
    dimension: OnceCell<usize>,
}

impl HttpEmbedder {
    pub fn new(config: EmbeddingConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            dimension: OnceCell::new(),
        }
    }

    async fn embed_async(&self, text: &str) -> Result<Vec<f32>> {
        let mut body = serde_json::json!({
            "input": text,
            "model": self.config.model,
        });
        if let Some(dims) = self.config.dims {
            body["dimensions"] = serde_json::json!(dims);
        }

        let mut req = self
            .client
            .post(format!("{}/embeddings", self.config.url.trim_end_matches('/')))
            .json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.header("Authorization", format!("Bearer {key}"));
        }

        let response = req.send().await.map_err(|e| MemoryError::EmbeddingEndpointFailure {
            model: self.config.model.clone(),
            message: e.to_string(),
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(MemoryError::EmbeddingEndpointFailure {
                model: self.config.model.clone(),
                message: format!("HTTP {status}: {text}"),
            });
        }

        let data: serde_json::Value = response.json().await.map_err(|e| {
            MemoryError::EmbeddingEndpointFailure {
                model: self.config.model.clone(),
                message: format!("invalid response body: {e}"),
            }
        })?;

        let embedding: Vec<f32> = data["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| MemoryError::EmbeddingEndpointFailure {
                model: self.config.model.clone(),
                message: "response missing data[0].embedding".to_string(),
            })?
            .iter()
            .filter_map(|v| v.as_f64().map(|f| f as f32))
            .collect();

        Ok(embedding)
    }

    /// Probe the endpoint once at startup, caching (and validating) the
    /// returned dimensionality for the lifetime of this embedder.
    pub async fn detect_dimension(&self) -> Result<usize> {
        if let Some(d) = self.dimension.get() {
            return Ok(*d);
        }
        let probe = self.embed_async("test").await?;
        let actual = probe.len();
        if let Some(requested) = self.config.dims {
            if requested != actual {
                return Err(MemoryError::DimensionMismatch { requested, actual });
            }
        }
        let _ = self.dimension.set(actual);
        Ok(actual)
    }
}

impl Embedder for HttpEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(self.embed_async(text))
        })
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn dimension(&self) -> Result<usize> {
        self.dimension.get().copied().ok_or_else(|| {
            MemoryError::Internal("embedding dimension not yet detected".to_string())
        })
    }
}

/// Table name for a given embedding dimension, e.g. `memory_768`.
pub fn table_name_for_dimension(dims: usize) -> String {
    format!("memory_{dims}")
}

/// Cosine similarity between two equal-length vectors; 0.0 for mismatched
/// lengths, empty vectors, or zero-norm vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 0.001);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 0.001);

        let d = vec![-1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &d) + 1.0).abs() < 0.001);
    }

    #[test]
    fn test_table_name() {
        assert_eq!(table_name_for_dimension(768), "memory_768");
    }
}
