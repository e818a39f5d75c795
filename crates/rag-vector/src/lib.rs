//! On-device knowledge-base retrieval.
//!
//! Loads half-precision embedding packages, runs brute-force cosine top-k
//! search over them, joins hits to their text chunks, and feeds the result to
//! a local generation model as prompt context.

pub mod binary16;
pub mod chunks;
pub mod embedding;
pub mod index;
pub mod manifest;
pub mod model;
pub mod package;
pub mod prompt;
pub mod retrieval;
pub mod tutor;

pub use chunks::ChunkStore;
pub use embedding::{DynEmbeddingService, EmbeddingService, MockEmbedding};
pub use index::EmbeddingIndex;
pub use manifest::Manifest;
pub use model::{
    FinishReason, GenerationOutcome, GenerationParams, LoadedModel, MockModelBackend,
    ModelBackend, ModelManager, ModelSpec, TokenEvent, TokenStream,
};
pub use package::KbLayout;
pub use retrieval::{LoadedKb, RetrievalEngine};
pub use tutor::{Tutor, TutorAnswer};

#[cfg(feature = "onnx")]
pub use embedding::OnnxEmbeddingService;
