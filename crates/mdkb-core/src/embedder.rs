//! Embedding client
//!
//! The rest of the crate only sees the [`EmbeddingClient`] trait. The
//! production implementation, [`HttpEmbedder`], talks to any
//! OpenAI-compatible `/embeddings` endpoint (LM Studio, llama.cpp server,
//! Ollama, OpenAI itself).

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::text::truncate_chars;

/// Default embedding service endpoint (OpenAI-compatible base URL)
pub const DEFAULT_EMBEDDING_URL: &str = "http://127.0.0.1:1338/v1";

/// Default embedding model
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-nomic-embed-text-v1.5-embedding";

/// Default embedding dimension
pub const DEFAULT_EMBEDDING_DIM: usize = 768;

/// Default cap on characters sent per request
pub const DEFAULT_MAX_INPUT_CHARS: usize = 32_000;

/// Default timeout for one embedding call
pub const DEFAULT_EMBEDDING_TIMEOUT: Duration = Duration::from_secs(30);

/// Maps text to a fixed-length vector.
///
/// Implementations must be safe to call from several threads at once.
pub trait EmbeddingClient: Send + Sync {
    /// Embed one text. The result has exactly [`dimension`](Self::dimension) elements.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Vector length every call returns
    fn dimension(&self) -> usize;

    /// Embed a short probe string and return the length the service actually produced.
    ///
    /// Unlike [`embed`](Self::embed) this does not reject a mismatched length,
    /// so startup can report it as a configuration error.
    fn probe(&self) -> Result<usize> {
        Ok(self.embed("probe")?.len())
    }
}

/// Settings for [`HttpEmbedder`]
#[derive(Debug, Clone)]
pub struct HttpEmbedderConfig {
    pub url: String,
    pub model: String,
    pub dimension: usize,
    pub api_key: Option<String>,
    pub timeout: Duration,
    pub max_input_chars: usize,
}

impl Default for HttpEmbedderConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_EMBEDDING_URL.to_string(),
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimension: DEFAULT_EMBEDDING_DIM,
            api_key: None,
            timeout: DEFAULT_EMBEDDING_TIMEOUT,
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Embedding client for OpenAI-compatible HTTP services
pub struct HttpEmbedder {
    agent: ureq::Agent,
    endpoint: String,
    config: HttpEmbedderConfig,
}

impl HttpEmbedder {
    pub fn new(config: HttpEmbedderConfig) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(config.timeout).build();
        let endpoint = format!("{}/embeddings", config.url.trim_end_matches('/'));
        Self {
            agent,
            endpoint,
            config,
        }
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn request(&self, text: &str) -> Result<Vec<f32>> {
        let input = truncate_chars(text, self.config.max_input_chars);
        let request = EmbeddingRequest {
            model: &self.config.model,
            input,
        };

        let mut call = self
            .agent
            .post(&self.endpoint)
            .set("content-type", "application/json");
        if let Some(key) = &self.config.api_key {
            call = call.set("authorization", &format!("Bearer {key}"));
        }

        let response = match call.send_json(&request) {
            Ok(response) => response,
            Err(ureq::Error::Status(code, response)) => {
                let body = response.into_string().unwrap_or_default();
                bail!(
                    "Embedding service returned HTTP {}: {}",
                    code,
                    truncate_chars(body.trim(), 200)
                );
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to call embedding service at {}", self.endpoint)
                })
            }
        };

        let response: EmbeddingResponse = response
            .into_json()
            .context("Failed to parse embedding response")?;

        response
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .context("Embedding response contained no vectors")
    }
}

impl EmbeddingClient for HttpEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let embedding = self.request(text)?;
        if embedding.len() != self.config.dimension {
            bail!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.config.dimension,
                embedding.len()
            );
        }
        Ok(embedding)
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    fn probe(&self) -> Result<usize> {
        Ok(self.request("probe")?.len())
    }
}
