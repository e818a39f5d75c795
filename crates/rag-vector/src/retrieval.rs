//! Retrieval engine: manifest -> index -> chunks -> query embedding -> top-k -> join.

use std::sync::Arc;

use tracing::{debug, info, warn};

use rag_core::config::RetrievalConfig;
use rag_core::error::{RagError, Result};
use rag_core::types::{ChunkEntry, ScoredRow};

use crate::chunks::ChunkStore;
use crate::embedding::{DynEmbeddingService, EmbeddingService};
use crate::index::{EmbeddingIndex, DEFAULT_PARALLEL_THRESHOLD};
use crate::manifest::Manifest;
use crate::package::KbLayout;

/// A knowledge base loaded from disk for one retrieval.
#[derive(Debug, Clone)]
pub struct LoadedKb {
    pub manifest: Manifest,
    pub index: EmbeddingIndex,
    pub chunks: Vec<ChunkEntry>,
}

impl LoadedKb {
    /// Read all three package files of `kb_id`.
    ///
    /// The manifest sizes the index load. The chunk count is not required to
    /// match; [`LoadedKb::join`] tolerates a short store.
    pub fn load(layout: &KbLayout, kb_id: &str, parallel_threshold: usize) -> Result<Self> {
        let manifest = Manifest::load(&layout.manifest_path(kb_id)?)?;
        let index = EmbeddingIndex::load_file(
            &layout.embeddings_path(kb_id)?,
            manifest.embedding_dim,
            manifest.chunk_count,
        )?
        .with_parallel_threshold(parallel_threshold);
        let chunks = ChunkStore::new(layout.chunks_path(kb_id)?).load_all()?;

        if chunks.len() != manifest.chunk_count {
            warn!(
                kb_id,
                manifest_count = manifest.chunk_count,
                chunk_lines = chunks.len(),
                "Chunk store size differs from manifest"
            );
        }
        info!(
            kb_id,
            version = %manifest.version,
            rows = index.len(),
            dimension = index.dimension(),
            "Knowledge base loaded"
        );

        Ok(Self {
            manifest,
            index,
            chunks,
        })
    }

    /// Run top-k for an already embedded query and join rows to chunks.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ChunkEntry>> {
        let hits = self.index.top_k(query, k)?;
        Ok(join(&hits, &self.chunks))
    }
}

/// Map ranked rows to their chunks, keeping rank order.
///
/// Rows past the end of `chunks` are dropped rather than failing the whole
/// request.
pub fn join(hits: &[ScoredRow], chunks: &[ChunkEntry]) -> Vec<ChunkEntry> {
    hits.iter()
        .filter_map(|hit| match chunks.get(hit.index) {
            Some(chunk) => Some(chunk.clone()),
            None => {
                warn!(
                    row = hit.index,
                    chunk_count = chunks.len(),
                    "Dropping search hit with no matching chunk"
                );
                None
            }
        })
        .collect()
}

/// Answers "which chunks of knowledge base X best match this question".
///
/// Packages are read from disk on every call; nothing is cached between calls.
pub struct RetrievalEngine {
    layout: KbLayout,
    embedder: Arc<dyn DynEmbeddingService>,
    parallel_threshold: usize,
}

impl RetrievalEngine {
    pub fn new(layout: KbLayout, embedder: impl EmbeddingService + 'static) -> Self {
        Self::new_dyn(layout, Arc::new(embedder))
    }

    /// Create an engine from a shared dynamic embedding service.
    pub fn new_dyn(layout: KbLayout, embedder: Arc<dyn DynEmbeddingService>) -> Self {
        Self {
            layout,
            embedder,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
        }
    }

    /// Create an engine rooted at the configured `kb_root`.
    pub fn from_config(
        config: &RetrievalConfig,
        layout: KbLayout,
        embedder: Arc<dyn DynEmbeddingService>,
    ) -> Self {
        Self::new_dyn(layout, embedder).with_parallel_threshold(config.parallel_threshold)
    }

    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    /// Return up to `k` chunks of `kb_id` ranked by similarity to `query`.
    ///
    /// Errors: [`RagError::NotFound`] when the package is absent,
    /// [`RagError::Format`] for a malformed package, and
    /// [`RagError::Dimension`] when the embedder's vector length differs from
    /// the manifest's `embedding_dim`.
    pub async fn retrieve(&self, kb_id: &str, query: &str, k: usize) -> Result<Vec<ChunkEntry>> {
        let kb = self.load(kb_id).await?;

        let query_vec = self.embedder.embed_boxed(query).await?;
        if query_vec.len() != kb.manifest.embedding_dim {
            return Err(RagError::Dimension {
                expected: kb.manifest.embedding_dim,
                actual: query_vec.len(),
            });
        }

        let results = kb.search(&query_vec, k)?;
        debug!(kb_id, k, returned = results.len(), "Retrieval complete");
        Ok(results)
    }

    /// Like [`retrieve`](Self::retrieve), but a failed retrieval is logged
    /// and yields no chunks so the caller can still answer without context.
    pub async fn retrieve_or_empty(&self, kb_id: &str, query: &str, k: usize) -> Vec<ChunkEntry> {
        match self.retrieve(kb_id, query, k).await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(kb_id, error = %e, "Retrieval failed, continuing without context");
                Vec::new()
            }
        }
    }

    /// Load a package off the async workers.
    pub async fn load(&self, kb_id: &str) -> Result<LoadedKb> {
        let layout = self.layout.clone();
        let kb_id = kb_id.to_string();
        let threshold = self.parallel_threshold;
        tokio::task::spawn_blocking(move || LoadedKb::load(&layout, &kb_id, threshold))
            .await
            .map_err(|e| RagError::Model(format!("Package load task panicked: {}", e)))?
    }
}
