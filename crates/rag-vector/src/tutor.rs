//! Question answering over a subject knowledge base.
//!
//! Retrieves context for the scope, renders the tutor prompt and streams the
//! model's answer. A failed retrieval is logged and the question is answered
//! without context.

use std::sync::Arc;

use tracing::debug;

use rag_core::error::Result;
use rag_core::types::{ChunkEntry, SubjectScope};

use crate::embedding::DynEmbeddingService;
use crate::model::{GenerationParams, ModelManager, TokenStream};
use crate::package::KbLayout;
use crate::prompt::build_prompt;
use crate::retrieval::RetrievalEngine;

/// An answer in progress.
pub struct TutorAnswer {
    /// Chunks the prompt was built from, best match first. Empty when
    /// retrieval failed or found nothing.
    pub context: Vec<ChunkEntry>,
    pub tokens: TokenStream,
}

pub struct Tutor {
    engine: RetrievalEngine,
    models: Arc<ModelManager>,
    top_k: usize,
    params: GenerationParams,
}

impl Tutor {
    /// Create a tutor whose retrieval embeds queries with the manager's
    /// embedding model.
    pub fn new(layout: KbLayout, models: Arc<ModelManager>) -> Self {
        let embedder: Arc<dyn DynEmbeddingService> = models.clone();
        Self {
            engine: RetrievalEngine::new_dyn(layout, embedder),
            models,
            top_k: 4,
            params: GenerationParams::default(),
        }
    }

    pub fn with_top_k(mut self, top_k: usize) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = params;
        self
    }

    /// Answer `question` for `scope`.
    ///
    /// Fails only if generation cannot start (e.g. no model loaded).
    pub async fn ask(&self, scope: &SubjectScope, question: &str) -> Result<TutorAnswer> {
        let kb_id = scope.scope_id();
        let context = self
            .engine
            .retrieve_or_empty(&kb_id, question, self.top_k)
            .await;
        debug!(kb_id = %kb_id, context_chunks = context.len(), "Prompt context ready");

        let prompt = build_prompt(scope, &context, question);
        let tokens = self.models.generate(&prompt, self.params.clone())?;
        Ok(TutorAnswer { context, tokens })
    }
}
