//! Embedding service trait and implementations.
//!
//! - `OnnxEmbeddingService` (cargo feature `onnx`) runs a sentence-transformer
//!   ONNX export through ort and tokenizes with the HuggingFace tokenizers
//!   crate.
//! - `MockEmbedding` provides deterministic hash-based vectors for tests and
//!   for the CLI when no model is configured.
//! - [`crate::model::ModelManager`] implements the trait on top of a loaded
//!   native model.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;

use rag_core::error::{RagError, Result};

/// Service that turns query text into a vector in the knowledge base's
/// embedding space.
pub trait EmbeddingService: Send + Sync {
    /// Generate an embedding vector for the given text.
    fn embed(&self, text: &str) -> impl Future<Output = Result<Vec<f32>>> + Send;

    /// Dimensionality of the produced vectors, if known before the first call.
    fn dimensions(&self) -> Option<usize>;
}

/// Object-safe version of [`EmbeddingService`] for dynamic dispatch.
///
/// `EmbeddingService::embed` returns `impl Future`, which is not object-safe.
/// This trait boxes the future so `Arc<dyn DynEmbeddingService>` can be held
/// without generics. Every `EmbeddingService` gets it through a blanket impl.
pub trait DynEmbeddingService: Send + Sync {
    fn embed_boxed<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<f32>>> + Send + 'a>>;

    fn dimensions(&self) -> Option<usize>;
}

impl<T: EmbeddingService> DynEmbeddingService for T {
    fn embed_boxed<'a>(
        &'a self,
        text: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<f32>>> + Send + 'a>> {
        Box::pin(self.embed(text))
    }

    fn dimensions(&self) -> Option<usize> {
        EmbeddingService::dimensions(self)
    }
}

/// L2-normalize in place; zero vectors are left untouched.
pub(crate) fn normalize(values: &mut [f32]) {
    let norm: f32 = values.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in values.iter_mut() {
            *v /= norm;
        }
    }
}

/// Deterministic unit vector derived from hashing `text`.
pub(crate) fn hash_to_vector(text: &str, dimensions: usize) -> Vec<f32> {
    let mut result: Vec<f32> = (0..dimensions)
        .map(|i| {
            let mut hasher = DefaultHasher::new();
            text.hash(&mut hasher);
            i.hash(&mut hasher);
            let h = hasher.finish();
            (((h as f64) / (u64::MAX as f64)) * 2.0 - 1.0) as f32
        })
        .collect();
    normalize(&mut result);
    result
}

// ---------------------------------------------------------------------------
// MockEmbedding - deterministic hash-based vectors
// ---------------------------------------------------------------------------

/// Mock embedding service returning deterministic unit vectors.
///
/// Identical inputs always produce identical outputs, which is enough to
/// exercise retrieval end to end without a model.
#[derive(Debug, Clone)]
pub struct MockEmbedding {
    dimensions: usize,
}

impl MockEmbedding {
    pub const DEFAULT_DIMENSIONS: usize = 384;

    pub fn new() -> Self {
        Self::with_dimensions(Self::DEFAULT_DIMENSIONS)
    }

    pub fn with_dimensions(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

impl Default for MockEmbedding {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingService for MockEmbedding {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.is_empty() {
            return Err(RagError::Model("Cannot embed empty text".to_string()));
        }
        Ok(hash_to_vector(text, self.dimensions))
    }

    fn dimensions(&self) -> Option<usize> {
        Some(self.dimensions)
    }
}

// ---------------------------------------------------------------------------
// OnnxEmbeddingService - ONNX Runtime inference
// ---------------------------------------------------------------------------

#[cfg(feature = "onnx")]
pub use onnx::OnnxEmbeddingService;

#[cfg(feature = "onnx")]
mod onnx {
    use std::path::Path;
    use std::sync::{Arc, Mutex};

    use ort::session::Session;
    use ort::value::TensorRef;
    use tokenizers::Tokenizer;
    use tracing::info;

    use rag_core::error::{RagError, Result};

    use super::{normalize, EmbeddingService};

    /// ONNX Runtime-backed embedding service using a sentence-transformer model.
    ///
    /// Expects a model directory containing `model.onnx` and `tokenizer.json`.
    /// The model takes `input_ids`, `attention_mask` and `token_type_ids` and
    /// yields token embeddings; masked mean pooling produces one vector.
    pub struct OnnxEmbeddingService {
        session: Arc<Mutex<Session>>,
        tokenizer: Arc<Tokenizer>,
        dimensions: usize,
    }

    impl std::fmt::Debug for OnnxEmbeddingService {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("OnnxEmbeddingService")
                .field("dimensions", &self.dimensions)
                .finish()
        }
    }

    impl OnnxEmbeddingService {
        /// Load a model directory holding `model.onnx` and `tokenizer.json`.
        pub fn from_directory(model_dir: &Path) -> Result<Self> {
            Self::from_files(
                &model_dir.join("model.onnx"),
                &model_dir.join("tokenizer.json"),
            )
        }

        pub fn from_files(model_path: &Path, tokenizer_path: &Path) -> Result<Self> {
            if !model_path.exists() {
                return Err(RagError::NotFound(format!(
                    "ONNX model {}",
                    model_path.display()
                )));
            }
            if !tokenizer_path.exists() {
                return Err(RagError::NotFound(format!(
                    "tokenizer {}",
                    tokenizer_path.display()
                )));
            }

            let session = Session::builder()
                .map_err(|e| RagError::Model(format!("ONNX session builder: {}", e)))?
                .with_intra_threads(1)
                .map_err(|e| RagError::Model(format!("ONNX set threads: {}", e)))?
                .commit_from_file(model_path)
                .map_err(|e| RagError::Model(format!("ONNX load model: {}", e)))?;

            // Output is [batch, seq_len, hidden_dim]; fall back to MiniLM's 384.
            let dimensions = session
                .outputs()
                .first()
                .and_then(|out| out.dtype().tensor_shape())
                .and_then(|shape| shape.last().copied())
                .map(|d| if d > 0 { d as usize } else { 384 })
                .unwrap_or(384);

            let tokenizer = Tokenizer::from_file(tokenizer_path)
                .map_err(|e| RagError::Model(format!("Failed to load tokenizer: {}", e)))?;

            info!(
                model = %model_path.display(),
                dimensions,
                "Loaded ONNX embedding model"
            );

            Ok(Self {
                session: Arc::new(Mutex::new(session)),
                tokenizer: Arc::new(tokenizer),
                dimensions,
            })
        }

        fn embed_sync(&self, text: &str) -> Result<Vec<f32>> {
            if text.is_empty() {
                return Err(RagError::Model("Cannot embed empty text".to_string()));
            }

            let encoding = self
                .tokenizer
                .encode(text, true)
                .map_err(|e| RagError::Model(format!("Tokenization failed: {}", e)))?;

            let input_ids: Vec<i64> = encoding.get_ids().iter().map(|&id| id as i64).collect();
            let attention_mask: Vec<i64> = encoding
                .get_attention_mask()
                .iter()
                .map(|&m| m as i64)
                .collect();
            let token_type_ids: Vec<i64> =
                encoding.get_type_ids().iter().map(|&t| t as i64).collect();
            let seq_len = input_ids.len();

            let shape_err = |e: ndarray::ShapeError| RagError::Model(format!("input shape: {}", e));
            let ids_array = ndarray::Array2::from_shape_vec((1, seq_len), input_ids).map_err(shape_err)?;
            let mask_array = ndarray::Array2::from_shape_vec((1, seq_len), attention_mask.clone())
                .map_err(shape_err)?;
            let type_array =
                ndarray::Array2::from_shape_vec((1, seq_len), token_type_ids).map_err(shape_err)?;

            let tensor_err = |e: ort::Error| RagError::Model(format!("input tensor: {}", e));
            let ids_ref = TensorRef::from_array_view(&ids_array).map_err(tensor_err)?;
            let mask_ref = TensorRef::from_array_view(&mask_array).map_err(tensor_err)?;
            let type_ref = TensorRef::from_array_view(&type_array).map_err(tensor_err)?;

            let mut session = self
                .session
                .lock()
                .map_err(|e| RagError::Model(format!("Session lock poisoned: {}", e)))?;
            let outputs = session
                .run(ort::inputs![ids_ref, mask_ref, type_ref])
                .map_err(|e| RagError::Model(format!("ONNX inference failed: {}", e)))?;

            let (shape, data) = outputs[0]
                .try_extract_tensor::<f32>()
                .map_err(|e| RagError::Model(format!("Extract embeddings: {}", e)))?;

            let hidden_dim = match shape.iter().copied().collect::<Vec<i64>>().as_slice() {
                [.., _, last] => *last as usize,
                other => {
                    return Err(RagError::Model(format!(
                        "Unexpected output shape: {:?}",
                        other
                    )))
                }
            };

            let mut pooled = vec![0.0f32; hidden_dim];
            let mut count = 0.0f32;
            for (tok_idx, &mask_val) in attention_mask.iter().enumerate() {
                if mask_val > 0 {
                    let offset = tok_idx * hidden_dim;
                    for (dim, slot) in pooled.iter_mut().enumerate() {
                        *slot += data[offset + dim];
                    }
                    count += 1.0;
                }
            }
            if count > 0.0 {
                for val in &mut pooled {
                    *val /= count;
                }
            }

            normalize(&mut pooled);
            Ok(pooled)
        }
    }

    impl EmbeddingService for OnnxEmbeddingService {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            // Inference is CPU-bound; keep it off the async workers.
            let svc = OnnxEmbeddingService {
                session: Arc::clone(&self.session),
                tokenizer: Arc::clone(&self.tokenizer),
                dimensions: self.dimensions,
            };
            let text_owned = text.to_string();

            tokio::task::spawn_blocking(move || svc.embed_sync(&text_owned))
                .await
                .map_err(|e| RagError::Model(format!("Embedding task panicked: {}", e)))?
        }

        fn dimensions(&self) -> Option<usize> {
            Some(self.dimensions)
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_embedding_dimension() {
        let service = MockEmbedding::new();
        let vec = service.embed("hello world").await.unwrap();
        assert_eq!(vec.len(), 384);

        let small = MockEmbedding::with_dimensions(4);
        assert_eq!(small.embed("hello").await.unwrap().len(), 4);
        assert_eq!(EmbeddingService::dimensions(&small), Some(4));
    }

    #[tokio::test]
    async fn test_mock_embedding_deterministic() {
        let service = MockEmbedding::new();
        let v1 = service.embed("same text").await.unwrap();
        let v2 = service.embed("same text").await.unwrap();
        assert_eq!(v1, v2);
    }

    #[tokio::test]
    async fn test_mock_embedding_different_inputs() {
        let service = MockEmbedding::new();
        let v1 = service.embed("text one").await.unwrap();
        let v2 = service.embed("text two").await.unwrap();
        assert_ne!(v1, v2);
    }

    #[tokio::test]
    async fn test_mock_embedding_is_unit_length() {
        let service = MockEmbedding::new();
        let vec = service.embed("norm check").await.unwrap();
        let norm: f32 = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_mock_embedding_empty_text() {
        let service = MockEmbedding::new();
        assert!(service.embed("").await.is_err());
    }

    #[tokio::test]
    async fn test_dyn_dispatch() {
        let service: Box<dyn DynEmbeddingService> = Box::new(MockEmbedding::with_dimensions(8));
        assert_eq!(service.embed_boxed("boxed").await.unwrap().len(), 8);
        assert_eq!(service.dimensions(), Some(8));
    }

    #[test]
    fn test_normalize_zero_vector_untouched() {
        let mut v = vec![0.0f32; 3];
        normalize(&mut v);
        assert_eq!(v, vec![0.0; 3]);
    }
}
