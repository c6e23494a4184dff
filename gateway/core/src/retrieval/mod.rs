//! Retrieval Context
//!
//! Optional prompt augmentation from two independent collaborators:
//!
//! - **Web search**: a focused query against a [`WebSearch`] backend, reduced
//!   to one block
//! - **Documents**: cosine ranking of the owner's embedded chunks
//!
//! Both paths run concurrently and are best effort. A failing path is logged
//! and contributes nothing; it never fails the request that asked for it.

mod documents;
mod web;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use documents::{
    cosine_similarity, rank_chunks, ChunkStore, DocumentRetriever, EmbeddedChunk, Embedder,
    InMemoryChunkStore, OllamaEmbedder, DEFAULT_TOP_K,
};
pub use web::{focus_query, reduce_payload, DuckDuckGoSearch, SearchPayload, WebSearch};

/// Ephemeral context block for one outbound prompt
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetrievedContext {
    /// Where the text came from
    pub source_tag: String,
    /// Block text
    pub text: String,
}

impl RetrievedContext {
    /// Create a context block
    pub fn new(source_tag: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            source_tag: source_tag.into(),
            text: text.into(),
        }
    }
}

/// Render blocks as the body of one transient context turn
#[must_use]
pub fn render_context(blocks: &[RetrievedContext]) -> String {
    let mut out = String::from("Use the following context when it is relevant to the question.");
    for block in blocks {
        out.push_str("\n\n[");
        out.push_str(&block.source_tag);
        out.push_str("]\n");
        out.push_str(&block.text);
    }
    out
}

/// Per-request retrieval switches
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetrievalOptions {
    /// Run the web-search path
    pub web_search: bool,
    /// Run the document path over all of the owner's documents
    pub search_documents: bool,
    /// Run the document path restricted to one document
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
}

impl RetrievalOptions {
    /// Whether the document path was requested
    #[must_use]
    pub fn wants_documents(&self) -> bool {
        self.search_documents || self.document_id.is_some()
    }
}

/// Runtime retrieval settings
#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    /// Whether the web-search path is available
    pub web_search: bool,
    /// Instant Answer endpoint (`None` = public DuckDuckGo)
    pub search_endpoint: Option<String>,
    /// Whether the document path is available
    pub documents: bool,
    /// Ollama server used for embeddings
    pub embedding_endpoint: String,
    /// Embedding model
    pub embedding_model: String,
    /// Chunks returned by the document path
    pub top_k: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            web_search: true,
            search_endpoint: None,
            documents: false,
            embedding_endpoint: "http://localhost:11434".to_string(),
            embedding_model: "nomic-embed-text".to_string(),
            top_k: DEFAULT_TOP_K,
        }
    }
}

/// Builds context blocks for a prompt
#[derive(Clone, Default)]
pub struct RetrievalInjector {
    web: Option<Arc<dyn WebSearch>>,
    documents: Option<DocumentRetriever>,
}

impl RetrievalInjector {
    /// An injector with no collaborators (always returns nothing)
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Build the production collaborators enabled in `config`
    ///
    /// `chunks` backs the document path when it is enabled.
    pub fn from_config(
        config: &RetrievalConfig,
        http_client: &reqwest::Client,
        chunks: Arc<dyn ChunkStore>,
    ) -> Self {
        let mut injector = Self::disabled();
        if config.web_search {
            let search = match &config.search_endpoint {
                Some(endpoint) => DuckDuckGoSearch::with_endpoint(http_client.clone(), endpoint),
                None => DuckDuckGoSearch::new(http_client.clone()),
            };
            injector = injector.with_web_search(Arc::new(search));
        }
        if config.documents {
            let embedder = OllamaEmbedder::new(
                http_client.clone(),
                &config.embedding_endpoint,
                &config.embedding_model,
            );
            injector = injector.with_documents(DocumentRetriever::new(
                Arc::new(embedder),
                chunks,
                config.top_k,
            ));
        }
        injector
    }

    /// Attach a web-search backend
    #[must_use]
    pub fn with_web_search(mut self, web: Arc<dyn WebSearch>) -> Self {
        self.web = Some(web);
        self
    }

    /// Attach the document path
    #[must_use]
    pub fn with_documents(mut self, documents: DocumentRetriever) -> Self {
        self.documents = Some(documents);
        self
    }

    /// Gather context for `query`
    ///
    /// Web blocks come first, document blocks after them.
    pub async fn gather(
        &self,
        owner: &str,
        query: &str,
        options: &RetrievalOptions,
    ) -> Vec<RetrievedContext> {
        let (web, documents) = tokio::join!(
            self.web_block(query, options),
            self.document_blocks(owner, query, options)
        );

        let mut blocks = Vec::with_capacity(documents.len() + 1);
        blocks.extend(web);
        blocks.extend(documents);
        blocks
    }

    async fn web_block(&self, query: &str, options: &RetrievalOptions) -> Option<RetrievedContext> {
        if !options.web_search {
            return None;
        }
        let Some(web) = &self.web else {
            tracing::warn!("Web search requested but no search backend is configured");
            return None;
        };

        let focused = focus_query(query);
        if focused.is_empty() {
            return None;
        }

        match web.search(&focused).await {
            Ok(payload) => {
                let block = reduce_payload(&payload);
                if block.is_none() {
                    tracing::warn!(query = %focused, "Web search returned nothing usable");
                }
                block
            }
            Err(e) => {
                tracing::warn!(query = %focused, error = %e, "Web search failed");
                None
            }
        }
    }

    async fn document_blocks(
        &self,
        owner: &str,
        query: &str,
        options: &RetrievalOptions,
    ) -> Vec<RetrievedContext> {
        if !options.wants_documents() {
            return Vec::new();
        }
        let Some(documents) = &self.documents else {
            tracing::warn!("Document search requested but no retriever is configured");
            return Vec::new();
        };

        match documents
            .retrieve(owner, options.document_id.as_deref(), query)
            .await
        {
            Ok(blocks) => blocks,
            Err(e) => {
                tracing::warn!(owner, error = %e, "Document retrieval failed");
                Vec::new()
            }
        }
    }
}

impl std::fmt::Debug for RetrievalInjector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetrievalInjector")
            .field("web", &self.web.is_some())
            .field("documents", &self.documents)
            .finish()
    }
}
