//! Document Similarity Search
//!
//! Embeds the user's query and ranks the owner's stored chunks by cosine
//! similarity. The scan is brute force over whatever the [`ChunkStore`]
//! returns.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use super::RetrievedContext;

/// Default number of chunks returned
pub const DEFAULT_TOP_K: usize = 5;

/// A stored chunk with its embedding
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedChunk {
    /// Document the chunk was cut from
    pub document_id: String,
    /// Owning user
    pub owner: String,
    /// Source metadata (file name, page, ...)
    pub source: String,
    /// Chunk text
    pub text: String,
    /// Embedding vector
    pub embedding: Vec<f32>,
}

/// Turns text into an embedding vector
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single piece of text
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Source of embedded chunks
#[async_trait]
pub trait ChunkStore: Send + Sync {
    /// All chunks owned by `owner`, optionally limited to one document
    async fn chunks_for(
        &self,
        owner: &str,
        document_id: Option<&str>,
    ) -> anyhow::Result<Vec<EmbeddedChunk>>;
}

/// Cosine similarity, or `None` when the vectors cannot be compared
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return None;
    }
    Some(dot / (norm_a.sqrt() * norm_b.sqrt()))
}

/// Rank chunks against a query embedding, best first
///
/// Chunks with a different dimension or a zero norm are skipped.
#[must_use]
pub fn rank_chunks(
    query: &[f32],
    chunks: Vec<EmbeddedChunk>,
    top_k: usize,
) -> Vec<(f32, EmbeddedChunk)> {
    let mut scored: Vec<(f32, EmbeddedChunk)> = chunks
        .into_iter()
        .filter_map(|chunk| cosine_similarity(query, &chunk.embedding).map(|s| (s, chunk)))
        .collect();

    scored.sort_by(|a, b| b.0.total_cmp(&a.0));
    scored.truncate(top_k);
    scored
}

/// Embedding + chunk collaborators for the document path
#[derive(Clone)]
pub struct DocumentRetriever {
    embedder: Arc<dyn Embedder>,
    chunks: Arc<dyn ChunkStore>,
    top_k: usize,
}

impl DocumentRetriever {
    /// Create a retriever returning at most `top_k` blocks
    pub fn new(embedder: Arc<dyn Embedder>, chunks: Arc<dyn ChunkStore>, top_k: usize) -> Self {
        Self {
            embedder,
            chunks,
            top_k: top_k.max(1),
        }
    }

    /// Most similar chunks for `query` as context blocks
    pub async fn retrieve(
        &self,
        owner: &str,
        document_id: Option<&str>,
        query: &str,
    ) -> anyhow::Result<Vec<RetrievedContext>> {
        let embedding = self.embedder.embed(query).await?;
        if embedding.is_empty() {
            anyhow::bail!("embedder returned an empty vector");
        }

        let chunks = self.chunks.chunks_for(owner, document_id).await?;
        let candidates = chunks.len();
        let ranked = rank_chunks(&embedding, chunks, self.top_k);

        tracing::debug!(
            owner,
            candidates,
            selected = ranked.len(),
            "Ranked document chunks"
        );

        Ok(ranked
            .into_iter()
            .map(|(_, chunk)| RetrievedContext::new(chunk.source, chunk.text))
            .collect())
    }
}

impl std::fmt::Debug for DocumentRetriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentRetriever")
            .field("top_k", &self.top_k)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Collaborator implementations
// ============================================================================

/// Chunks held in process memory
#[derive(Debug, Default)]
pub struct InMemoryChunkStore {
    chunks: RwLock<Vec<EmbeddedChunk>>,
}

impl InMemoryChunkStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a chunk
    pub fn insert(&self, chunk: EmbeddedChunk) {
        self.chunks.write().push(chunk);
    }

    /// Number of stored chunks
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.read().len()
    }

    /// Whether the store is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.read().is_empty()
    }
}

#[async_trait]
impl ChunkStore for InMemoryChunkStore {
    async fn chunks_for(
        &self,
        owner: &str,
        document_id: Option<&str>,
    ) -> anyhow::Result<Vec<EmbeddedChunk>> {
        Ok(self
            .chunks
            .read()
            .iter()
            .filter(|c| c.owner == owner)
            .filter(|c| document_id.map_or(true, |id| c.document_id == id))
            .cloned()
            .collect())
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    embedding: Vec<f32>,
}

/// Ollama `/api/embeddings` client
#[derive(Clone, Debug)]
pub struct OllamaEmbedder {
    http_client: reqwest::Client,
    endpoint: String,
    model: String,
}

impl OllamaEmbedder {
    /// Create an embedder for `model` served at `endpoint`
    pub fn new(
        http_client: reqwest::Client,
        endpoint: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            endpoint: endpoint.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl Embedder for OllamaEmbedder {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        let url = format!("{}/api/embeddings", self.endpoint.trim_end_matches('/'));
        let response = self
            .http_client
            .post(&url)
            .json(&EmbeddingRequest {
                model: &self.model,
                prompt: text,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "embedding request failed ({status}): {}",
                crate::backend::upstream_error_message(&body)
            );
        }

        let parsed: EmbeddingResponse = response.json().await?;
        Ok(parsed.embedding)
    }
}
