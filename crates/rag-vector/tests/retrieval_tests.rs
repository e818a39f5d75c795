//! Integration tests for knowledge-base retrieval and the tutor flow.
//!
//! Every test builds its own package directory under a temp root using the
//! crate's own writers, so the on-disk format is exercised end to end.

use std::path::Path;
use std::sync::Arc;

use rag_core::config::RetrievalConfig;
use rag_core::error::{RagError, Result};
use rag_core::types::{ChunkEntry, SubjectScope};
use rag_vector::index::encode_rows;
use rag_vector::package::{CHUNKS_FILE, EMBEDDINGS_FILE, MANIFEST_FILE};
use rag_vector::{
    ChunkStore, EmbeddingService, FinishReason, GenerationParams, KbLayout, Manifest,
    MockEmbedding, MockModelBackend, ModelManager, ModelSpec, RetrievalEngine, Tutor,
};

// =============================================================================
// Helpers
// =============================================================================

/// Embedder that always returns the same vector.
struct FixedEmbedding(Vec<f32>);

impl EmbeddingService for FixedEmbedding {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Ok(self.0.clone())
    }

    fn dimensions(&self) -> Option<usize> {
        Some(self.0.len())
    }
}

fn chunk(id: &str, text: &str) -> ChunkEntry {
    ChunkEntry {
        id: id.to_string(),
        text: text.to_string(),
        source: format!("{id}.md"),
    }
}

/// Write a complete package whose manifest matches `rows`.
fn write_package(root: &Path, kb_id: &str, rows: &[Vec<f32>], chunks: &[ChunkEntry]) {
    let dim = rows.first().map(Vec::len).unwrap_or(4);
    write_package_with_manifest(
        root,
        kb_id,
        &Manifest {
            version: "test-1".to_string(),
            embedding_dim: dim,
            chunk_count: rows.len(),
        },
        rows,
        chunks,
    );
}

fn write_package_with_manifest(
    root: &Path,
    kb_id: &str,
    manifest: &Manifest,
    rows: &[Vec<f32>],
    chunks: &[ChunkEntry],
) {
    let dir = root.join(kb_id);
    std::fs::create_dir_all(&dir).unwrap();
    manifest.save(&dir.join(MANIFEST_FILE)).unwrap();
    std::fs::write(dir.join(EMBEDDINGS_FILE), encode_rows(rows).unwrap()).unwrap();
    ChunkStore::new(dir.join(CHUNKS_FILE)).write_all(chunks).unwrap();
}

fn engine(root: &Path, query: Vec<f32>) -> RetrievalEngine {
    RetrievalEngine::new(KbLayout::new(root), FixedEmbedding(query))
}

fn ids(chunks: &[ChunkEntry]) -> Vec<&str> {
    chunks.iter().map(|c| c.id.as_str()).collect()
}

fn unit_rows() -> Vec<Vec<f32>> {
    vec![vec![1.0, 0.0, 0.0, 0.0], vec![0.0, 1.0, 0.0, 0.0]]
}

// =============================================================================
// Retrieval
// =============================================================================

#[tokio::test]
async fn test_two_row_package_returns_best_chunk() {
    let dir = tempfile::tempdir().unwrap();
    write_package(
        dir.path(),
        "grade_4__science",
        &unit_rows(),
        &[chunk("row0", "Plants need light."), chunk("row1", "Rocks are hard.")],
    );

    let results = engine(dir.path(), vec![0.9, 0.1, 0.0, 0.0])
        .retrieve("grade_4__science", "what do plants need?", 1)
        .await
        .unwrap();
    assert_eq!(ids(&results), vec!["row0"]);
    assert_eq!(results[0].text, "Plants need light.");
}

#[tokio::test]
async fn test_results_in_rank_order() {
    let dir = tempfile::tempdir().unwrap();
    let rows = vec![
        vec![0.0, 0.0, 1.0],
        vec![1.0, 0.0, 0.0],
        vec![0.6, 0.8, 0.0],
    ];
    write_package(
        dir.path(),
        "kb",
        &rows,
        &[chunk("z", "z"), chunk("x", "x"), chunk("xy", "xy")],
    );

    let results = engine(dir.path(), vec![1.0, 0.2, 0.0])
        .retrieve("kb", "q", 3)
        .await
        .unwrap();
    assert_eq!(ids(&results), vec!["x", "xy", "z"]);
}

#[tokio::test]
async fn test_k_larger_than_count() {
    let dir = tempfile::tempdir().unwrap();
    write_package(dir.path(), "kb", &unit_rows(), &[chunk("a", "a"), chunk("b", "b")]);

    let results = engine(dir.path(), vec![1.0, 0.0, 0.0, 0.0])
        .retrieve("kb", "q", 10)
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
}

#[tokio::test]
async fn test_empty_package() {
    let dir = tempfile::tempdir().unwrap();
    write_package_with_manifest(
        dir.path(),
        "kb",
        &Manifest {
            version: "empty".into(),
            embedding_dim: 4,
            chunk_count: 0,
        },
        &[],
        &[],
    );

    let results = engine(dir.path(), vec![1.0, 0.0, 0.0, 0.0])
        .retrieve("kb", "q", 3)
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_missing_package_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let err = engine(dir.path(), vec![1.0; 4])
        .retrieve("absent", "q", 3)
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::NotFound(_)));
}

#[tokio::test]
async fn test_missing_embeddings_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    write_package(dir.path(), "kb", &unit_rows(), &[chunk("a", "a"), chunk("b", "b")]);
    std::fs::remove_file(dir.path().join("kb").join(EMBEDDINGS_FILE)).unwrap();

    let err = engine(dir.path(), vec![1.0; 4])
        .retrieve("kb", "q", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::NotFound(_)));
}

#[tokio::test]
async fn test_manifest_disagreeing_with_embeddings_is_format_error() {
    let dir = tempfile::tempdir().unwrap();
    write_package_with_manifest(
        dir.path(),
        "kb",
        &Manifest {
            version: "bad".into(),
            embedding_dim: 4,
            chunk_count: 3,
        },
        &unit_rows(),
        &[chunk("a", "a"), chunk("b", "b")],
    );

    let err = engine(dir.path(), vec![1.0; 4])
        .retrieve("kb", "q", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Format(_)));
}

#[tokio::test]
async fn test_malformed_manifest_is_format_error() {
    let dir = tempfile::tempdir().unwrap();
    write_package(dir.path(), "kb", &unit_rows(), &[chunk("a", "a"), chunk("b", "b")]);
    std::fs::write(
        dir.path().join("kb").join(MANIFEST_FILE),
        r#"{"version":"v1","embedding_dim":0,"chunk_count":2}"#,
    )
    .unwrap();

    let err = engine(dir.path(), vec![1.0; 4])
        .retrieve("kb", "q", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Format(_)));
}

#[tokio::test]
async fn test_malformed_chunk_line_fails_retrieval() {
    let dir = tempfile::tempdir().unwrap();
    write_package(dir.path(), "kb", &unit_rows(), &[chunk("a", "a"), chunk("b", "b")]);
    std::fs::write(
        dir.path().join("kb").join(CHUNKS_FILE),
        "{\"id\":\"a\",\"text\":\"a\",\"source\":\"s\"}\nnot json\n",
    )
    .unwrap();

    let err = engine(dir.path(), vec![1.0, 0.0, 0.0, 0.0])
        .retrieve("kb", "q", 2)
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::Format(_)));
}

#[tokio::test]
async fn test_missing_chunk_file_yields_no_results() {
    let dir = tempfile::tempdir().unwrap();
    write_package(dir.path(), "kb", &unit_rows(), &[chunk("a", "a"), chunk("b", "b")]);
    std::fs::remove_file(dir.path().join("kb").join(CHUNKS_FILE)).unwrap();

    let results = engine(dir.path(), vec![1.0, 0.0, 0.0, 0.0])
        .retrieve("kb", "q", 2)
        .await
        .unwrap();
    assert!(results.is_empty());
}

#[tokio::test]
async fn test_short_chunk_store_drops_unmatched_rows() {
    let dir = tempfile::tempdir().unwrap();
    let rows = vec![
        vec![0.8, 0.6, 0.0],
        vec![0.0, 1.0, 0.0],
        vec![1.0, 0.0, 0.0],
    ];
    // Only two chunk lines for three rows; row 2 is the best match.
    write_package(dir.path(), "kb", &rows, &[chunk("r0", "r0"), chunk("r1", "r1")]);

    let results = engine(dir.path(), vec![1.0, 0.0, 0.0])
        .retrieve("kb", "q", 3)
        .await
        .unwrap();
    assert_eq!(ids(&results), vec!["r0", "r1"]);
}

#[tokio::test]
async fn test_embedder_dimension_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    write_package(dir.path(), "kb", &unit_rows(), &[chunk("a", "a"), chunk("b", "b")]);

    let err = engine(dir.path(), vec![1.0, 0.0, 0.0])
        .retrieve("kb", "q", 1)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        RagError::Dimension {
            expected: 4,
            actual: 3
        }
    ));
}

#[tokio::test]
async fn test_invalid_kb_id_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let err = engine(dir.path(), vec![1.0; 4])
        .retrieve("../outside", "q", 1)
        .await
        .unwrap_err();
    assert!(matches!(err, RagError::NotFound(_)));
}

#[tokio::test]
async fn test_parallel_scan_matches_sequential() {
    let dir = tempfile::tempdir().unwrap();
    let embedder = MockEmbedding::with_dimensions(32);
    let mut rows = Vec::new();
    let mut chunks = Vec::new();
    for i in 0..200 {
        let text = format!("fact number {i}");
        rows.push(embedder.embed(&text).await.unwrap());
        chunks.push(chunk(&format!("c{i}"), &text));
    }
    write_package(dir.path(), "kb", &rows, &chunks);

    let query = embedder.embed("fact number 17").await.unwrap();
    let sequential = RetrievalEngine::new(KbLayout::new(dir.path()), FixedEmbedding(query.clone()))
        .with_parallel_threshold(usize::MAX)
        .retrieve("kb", "q", 10)
        .await
        .unwrap();
    let parallel = RetrievalEngine::new(KbLayout::new(dir.path()), FixedEmbedding(query))
        .with_parallel_threshold(1)
        .retrieve("kb", "q", 10)
        .await
        .unwrap();

    assert_eq!(sequential, parallel);
    assert_eq!(sequential[0].id, "c17");
}

#[tokio::test]
async fn test_retrieve_or_empty_falls_back_on_failure() {
    let dir = tempfile::tempdir().unwrap();
    write_package(
        dir.path(),
        "kb",
        &unit_rows(),
        &[chunk("row0", "first"), chunk("row1", "second")],
    );
    let engine = engine(dir.path(), vec![0.0, 1.0, 0.0, 0.0]);

    let found = engine.retrieve_or_empty("kb", "q", 1).await;
    assert_eq!(ids(&found), vec!["row1"]);
    assert!(engine.retrieve_or_empty("missing", "q", 1).await.is_empty());
    assert!(engine.retrieve_or_empty("../kb", "q", 1).await.is_empty());
}

#[tokio::test]
async fn test_engine_from_config() {
    let dir = tempfile::tempdir().unwrap();
    write_package(
        dir.path(),
        "kb",
        &unit_rows(),
        &[chunk("row0", "first"), chunk("row1", "second")],
    );
    let config = RetrievalConfig {
        kb_root: dir.path().display().to_string(),
        top_k: 2,
        parallel_threshold: 1,
    };
    let engine = RetrievalEngine::from_config(
        &config,
        KbLayout::new(&config.kb_root),
        Arc::new(FixedEmbedding(vec![1.0, 0.0, 0.0, 0.0])),
    );
    let results = engine.retrieve("kb", "q", config.top_k).await.unwrap();
    assert_eq!(ids(&results), vec!["row0", "row1"]);
}

// =============================================================================
// Tutor
// =============================================================================

const DIM: usize = 64;

fn spec(path: &str) -> ModelSpec {
    ModelSpec {
        path: path.into(),
        context_size: 512,
        threads: 1,
    }
}

async fn science_package(root: &Path, scope: &SubjectScope) -> Vec<ChunkEntry> {
    let embedder = MockEmbedding::with_dimensions(DIM);
    let chunks = vec![
        chunk("c0", "Photosynthesis converts light into chemical energy."),
        chunk("c1", "The water cycle moves water between sea, air and land."),
        chunk("c2", "Magnets attract iron."),
    ];
    let mut rows = Vec::new();
    for c in &chunks {
        rows.push(embedder.embed(&c.text).await.unwrap());
    }
    write_package(root, &scope.scope_id(), &rows, &chunks);
    chunks
}

async fn loaded_models(backend: &MockModelBackend) -> Arc<ModelManager> {
    let models = Arc::new(ModelManager::new(Arc::new(backend.clone())));
    models.load(spec("llm.gguf"), spec("embed.gguf")).await.unwrap();
    models
}

#[tokio::test]
async fn test_tutor_answers_with_retrieved_context() {
    let dir = tempfile::tempdir().unwrap();
    let scope = SubjectScope::new("Grade 5", "Science");
    let chunks = science_package(dir.path(), &scope).await;

    let backend = MockModelBackend::new(DIM).with_reply("Light becomes sugar.");
    let tutor = Tutor::new(KbLayout::new(dir.path()), loaded_models(&backend).await).with_top_k(1);

    let answer = tutor.ask(&scope, &chunks[1].text).await.unwrap();
    assert_eq!(answer.context, vec![chunks[1].clone()]);

    let (text, reason) = answer.tokens.collect_text().await.unwrap();
    assert_eq!(text, "Light becomes sugar.");
    assert_eq!(reason, FinishReason::Stop);

    let prompt = backend.last_prompt().unwrap();
    assert!(prompt.starts_with("You are a helpful tutor for Grade 5 Science."));
    assert!(prompt.contains(&format!("- {}", chunks[1].text)));
    assert!(!prompt.contains(&chunks[2].text));
}

#[tokio::test]
async fn test_tutor_degrades_without_package() {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockModelBackend::new(DIM);
    let tutor = Tutor::new(KbLayout::new(dir.path()), loaded_models(&backend).await);

    let answer = tutor
        .ask(&SubjectScope::new("Grade 9", "History"), "Who built the pyramids?")
        .await
        .unwrap();
    assert!(answer.context.is_empty());
    let (text, _) = answer.tokens.collect_text().await.unwrap();
    assert_eq!(text, "This is a mock answer.");
    assert!(backend
        .last_prompt()
        .unwrap()
        .contains("Question: Who built the pyramids?"));
}

#[tokio::test]
async fn test_tutor_requires_loaded_models() {
    let dir = tempfile::tempdir().unwrap();
    let scope = SubjectScope::new("Grade 5", "Science");
    science_package(dir.path(), &scope).await;

    let models = Arc::new(ModelManager::new(Arc::new(MockModelBackend::new(DIM))));
    let tutor = Tutor::new(KbLayout::new(dir.path()), Arc::clone(&models));
    let err = tutor.ask(&scope, "anything").await.err().unwrap();
    assert!(matches!(err, RagError::ModelNotLoaded(_)));

    models.load(spec("llm"), spec("embed")).await.unwrap();
    assert!(tutor.ask(&scope, "anything").await.is_ok());

    models.unload().unwrap();
    assert!(tutor.ask(&scope, "anything").await.is_err());
}

#[tokio::test]
async fn test_tutor_applies_generation_params() {
    let dir = tempfile::tempdir().unwrap();
    let scope = SubjectScope::new("Grade 5", "Science");
    science_package(dir.path(), &scope).await;

    let backend = MockModelBackend::new(DIM).with_reply("one two three four five");
    let tutor = Tutor::new(KbLayout::new(dir.path()), loaded_models(&backend).await).with_params(
        GenerationParams {
            max_tokens: 3,
            ..GenerationParams::default()
        },
    );

    let answer = tutor.ask(&scope, "Count for me").await.unwrap();
    let (text, reason) = answer.tokens.collect_text().await.unwrap();
    assert_eq!(text, "one two three ");
    assert_eq!(reason, FinishReason::MaxTokens);
}
