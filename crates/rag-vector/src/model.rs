//! Local model lifecycle and token streaming.
//!
//! A [`ModelManager`] owns the loaded generation and embedding models for as
//! long as the caller keeps it. Models are loaded and released explicitly;
//! using a slot that holds nothing yields [`RagError::ModelNotLoaded`].
//! Generated text arrives as a [`TokenStream`] that ends with an explicit
//! [`TokenEvent::Done`] and stops the producer when cancelled or dropped.

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info};

use rag_core::error::{RagError, Result};

use crate::embedding::{hash_to_vector, EmbeddingService};

/// Buffered tokens between the inference thread and the consumer.
const TOKEN_CHANNEL_CAPACITY: usize = 32;

/// Where to find a model and how to size its runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub path: PathBuf,
    pub context_size: u32,
    pub threads: u32,
}

/// Sampling parameters for one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_tokens: 256,
            temperature: 0.7,
            top_p: 0.9,
        }
    }
}

/// Why a generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The model emitted its end-of-text token.
    Stop,
    /// `max_tokens` was reached.
    MaxTokens,
    /// The consumer cancelled or dropped the stream.
    Cancelled,
}

/// Item of a [`TokenStream`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    Token(String),
    /// Always the last event of a successful generation.
    Done(FinishReason),
}

/// A model that has been loaded into memory by a [`ModelBackend`].
///
/// Calls block on native inference and are run on the blocking pool by
/// [`ModelManager`].
pub trait LoadedModel: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Produce tokens for `prompt`, passing each to `emit`.
    ///
    /// Implementations must stop as soon as `emit` returns
    /// `ControlFlow::Break`.
    fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        emit: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<FinishReason>;

    fn dimensions(&self) -> Option<usize> {
        None
    }
}

/// Inference runtime able to load model files.
pub trait ModelBackend: Send + Sync {
    fn load(&self, spec: &ModelSpec) -> Result<Arc<dyn LoadedModel>>;
}

#[derive(Default)]
struct Slots {
    llm: Option<Arc<dyn LoadedModel>>,
    embedder: Option<Arc<dyn LoadedModel>>,
}

/// Owner of the generation and embedding model handles.
pub struct ModelManager {
    backend: Arc<dyn ModelBackend>,
    slots: RwLock<Slots>,
}

impl std::fmt::Debug for ModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelManager")
            .field("llm_loaded", &self.llm().is_ok())
            .field("embedder_loaded", &self.embedder().is_ok())
            .finish()
    }
}

impl ModelManager {
    pub fn new(backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            backend,
            slots: RwLock::new(Slots::default()),
        }
    }

    /// Load both models, releasing any previously loaded ones first.
    ///
    /// If either load fails, nothing stays loaded.
    pub async fn load(&self, llm: ModelSpec, embed: ModelSpec) -> Result<()> {
        self.unload()?;

        let backend = Arc::clone(&self.backend);
        let (llm_model, embed_model) = tokio::task::spawn_blocking(move || {
            let llm_model = backend.load(&llm)?;
            let embed_model = backend.load(&embed)?;
            Ok::<_, RagError>((llm_model, embed_model))
        })
        .await
        .map_err(|e| RagError::Model(format!("Model load task panicked: {}", e)))??;

        let mut slots = self.write_slots()?;
        slots.llm = Some(llm_model);
        slots.embedder = Some(embed_model);
        info!("Generation and embedding models loaded");
        Ok(())
    }

    /// Release both models. Safe to call when nothing is loaded.
    pub fn unload(&self) -> Result<()> {
        let mut slots = self.write_slots()?;
        if slots.llm.take().is_some() | slots.embedder.take().is_some() {
            info!("Models unloaded");
        }
        Ok(())
    }

    /// Whether both models are loaded.
    pub fn is_loaded(&self) -> bool {
        self.llm().is_ok() && self.embedder().is_ok()
    }

    /// Start generating an answer for `prompt`.
    ///
    /// Inference runs on the blocking pool; tokens are delivered through the
    /// returned stream.
    pub fn generate(&self, prompt: &str, params: GenerationParams) -> Result<TokenStream> {
        let model = self.llm()?;
        let (tx, rx) = mpsc::channel(TOKEN_CHANNEL_CAPACITY);
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancelled);
        let prompt = prompt.to_string();

        tokio::task::spawn_blocking(move || {
            let mut stopped_early = false;
            let mut emit = |token: &str| {
                if flag.load(Ordering::Relaxed)
                    || tx.blocking_send(Ok(TokenEvent::Token(token.to_string()))).is_err()
                {
                    stopped_early = true;
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            };
            let outcome = model.generate(&prompt, &params, &mut emit);
            let event = match outcome {
                Ok(_) if stopped_early => Ok(TokenEvent::Done(FinishReason::Cancelled)),
                Ok(reason) => Ok(TokenEvent::Done(reason)),
                Err(e) => Err(e),
            };
            debug!(?event, "Generation finished");
            // The consumer may already be gone.
            let _ = tx.blocking_send(event);
        });

        Ok(TokenStream {
            inner: ReceiverStream::new(rx),
            cancelled,
        })
    }

    fn llm(&self) -> Result<Arc<dyn LoadedModel>> {
        self.read_slots()?
            .llm
            .clone()
            .ok_or_else(|| RagError::ModelNotLoaded("generation model".into()))
    }

    fn embedder(&self) -> Result<Arc<dyn LoadedModel>> {
        self.read_slots()?
            .embedder
            .clone()
            .ok_or_else(|| RagError::ModelNotLoaded("embedding model".into()))
    }

    fn read_slots(&self) -> Result<std::sync::RwLockReadGuard<'_, Slots>> {
        self.slots
            .read()
            .map_err(|e| RagError::Model(format!("Lock poisoned: {}", e)))
    }

    fn write_slots(&self) -> Result<std::sync::RwLockWriteGuard<'_, Slots>> {
        self.slots
            .write()
            .map_err(|e| RagError::Model(format!("Lock poisoned: {}", e)))
    }
}

impl EmbeddingService for ModelManager {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let model = self.embedder()?;
        let text = text.to_string();
        tokio::task::spawn_blocking(move || model.embed(&text))
            .await
            .map_err(|e| RagError::Model(format!("Embedding task panicked: {}", e)))?
    }

    fn dimensions(&self) -> Option<usize> {
        self.embedder().ok().and_then(|m| m.dimensions())
    }
}

/// Cancellable stream of generated tokens.
///
/// Yields `Token` events followed by exactly one `Done`, or an `Err` if the
/// model failed. Dropping the stream stops generation at the next token.
pub struct TokenStream {
    inner: ReceiverStream<Result<TokenEvent>>,
    cancelled: Arc<AtomicBool>,
}

impl TokenStream {
    /// Ask the producer to stop; the stream then ends with
    /// `Done(FinishReason::Cancelled)`.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Drain the stream into the full answer text.
    pub async fn collect_text(mut self) -> Result<(String, FinishReason)> {
        let mut text = String::new();
        while let Some(event) = self.next().await {
            match event? {
                TokenEvent::Token(token) => text.push_str(&token),
                TokenEvent::Done(reason) => return Ok((text, reason)),
            }
        }
        Err(RagError::Model("generation ended without completion".into()))
    }
}

impl Stream for TokenStream {
    type Item = Result<TokenEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

// ---------------------------------------------------------------------------
// MockModelBackend - scripted models for tests
// ---------------------------------------------------------------------------

/// Backend whose models embed by hashing and "generate" a fixed reply.
///
/// Loading fails with [`RagError::NotFound`] for an empty path. The reply is
/// emitted word by word; the prompt of the latest generation and how it
/// ended are recorded.
#[derive(Debug, Clone)]
pub struct MockModelBackend {
    dimensions: usize,
    reply: String,
    loads: Arc<AtomicUsize>,
    last_prompt: Arc<Mutex<Option<String>>>,
    last_outcome: Arc<Mutex<Option<GenerationOutcome>>>,
}

/// How a [`MockModelBackend`] generation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationOutcome {
    /// Tokens the consumer accepted.
    pub emitted: usize,
    pub reason: FinishReason,
}

impl MockModelBackend {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            reply: "This is a mock answer.".to_string(),
            loads: Arc::new(AtomicUsize::new(0)),
            last_prompt: Arc::new(Mutex::new(None)),
            last_outcome: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = reply.into();
        self
    }

    /// Number of successful `load` calls.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.last_prompt.lock().ok().and_then(|p| p.clone())
    }

    /// Outcome of the latest generation that has returned.
    pub fn last_outcome(&self) -> Option<GenerationOutcome> {
        self.last_outcome.lock().ok().and_then(|o| *o)
    }
}

impl ModelBackend for MockModelBackend {
    fn load(&self, spec: &ModelSpec) -> Result<Arc<dyn LoadedModel>> {
        if spec.path.as_os_str().is_empty() {
            return Err(RagError::NotFound("model path is empty".into()));
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockModel {
            dimensions: self.dimensions,
            reply: self.reply.clone(),
            last_prompt: Arc::clone(&self.last_prompt),
            last_outcome: Arc::clone(&self.last_outcome),
        }))
    }
}

struct MockModel {
    dimensions: usize,
    reply: String,
    last_prompt: Arc<Mutex<Option<String>>>,
    last_outcome: Arc<Mutex<Option<GenerationOutcome>>>,
}

impl MockModel {
    fn run(
        &self,
        params: &GenerationParams,
        emit: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> GenerationOutcome {
        let mut emitted = 0;
        for token in self.reply.split_inclusive(' ') {
            if emitted as u32 >= params.max_tokens {
                return GenerationOutcome {
                    emitted,
                    reason: FinishReason::MaxTokens,
                };
            }
            if emit(token).is_break() {
                return GenerationOutcome {
                    emitted,
                    reason: FinishReason::Cancelled,
                };
            }
            emitted += 1;
        }
        GenerationOutcome {
            emitted,
            reason: FinishReason::Stop,
        }
    }
}

impl LoadedModel for MockModel {
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        Ok(hash_to_vector(text, self.dimensions))
    }

    fn generate(
        &self,
        prompt: &str,
        params: &GenerationParams,
        emit: &mut dyn FnMut(&str) -> ControlFlow<()>,
    ) -> Result<FinishReason> {
        if let Ok(mut last) = self.last_prompt.lock() {
            *last = Some(prompt.to_string());
        }
        let outcome = self.run(params, emit);
        if let Ok(mut last) = self.last_outcome.lock() {
            *last = Some(outcome);
        }
        Ok(outcome.reason)
    }

    fn dimensions(&self) -> Option<usize> {
        Some(self.dimensions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(path: &str) -> ModelSpec {
        ModelSpec {
            path: PathBuf::from(path),
            context_size: 512,
            threads: 1,
        }
    }

    async fn loaded(backend: MockModelBackend) -> ModelManager {
        let manager = ModelManager::new(Arc::new(backend));
        manager.load(spec("llm.gguf"), spec("embed.gguf")).await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_not_loaded_errors() {
        let manager = ModelManager::new(Arc::new(MockModelBackend::new(4)));
        assert!(!manager.is_loaded());
        assert!(matches!(
            manager.embed("q").await,
            Err(RagError::ModelNotLoaded(_))
        ));
        assert!(matches!(
            manager.generate("p", GenerationParams::default()),
            Err(RagError::ModelNotLoaded(_))
        ));
    }

    #[tokio::test]
    async fn test_load_embed_unload() {
        let manager = loaded(MockModelBackend::new(4)).await;
        assert!(manager.is_loaded());
        assert_eq!(manager.embed("photosynthesis").await.unwrap().len(), 4);
        assert_eq!(EmbeddingService::dimensions(&manager), Some(4));

        manager.unload().unwrap();
        assert!(!manager.is_loaded());
        assert!(matches!(
            manager.embed("q").await,
            Err(RagError::ModelNotLoaded(_))
        ));
        // Unloading twice is harmless.
        manager.unload().unwrap();
    }

    #[tokio::test]
    async fn test_reload_replaces_models() {
        let backend = MockModelBackend::new(4);
        let manager = ModelManager::new(Arc::new(backend.clone()));
        manager.load(spec("a"), spec("b")).await.unwrap();
        manager.load(spec("c"), spec("d")).await.unwrap();
        assert_eq!(backend.load_count(), 4);
        assert!(manager.is_loaded());
    }

    #[tokio::test]
    async fn test_failed_load_leaves_nothing_loaded() {
        let manager = loaded(MockModelBackend::new(4)).await;
        let err = manager.load(spec("llm"), spec("")).await.unwrap_err();
        assert!(matches!(err, RagError::NotFound(_)));
        assert!(!manager.is_loaded());
    }

    #[tokio::test]
    async fn test_generate_stream_ends_with_done() {
        let manager = loaded(MockModelBackend::new(4).with_reply("Plants make sugar.")).await;
        let mut stream = manager
            .generate("prompt", GenerationParams::default())
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event.unwrap());
        }
        assert_eq!(
            events,
            vec![
                TokenEvent::Token("Plants ".into()),
                TokenEvent::Token("make ".into()),
                TokenEvent::Token("sugar.".into()),
                TokenEvent::Done(FinishReason::Stop),
            ]
        );
    }

    #[tokio::test]
    async fn test_generate_respects_max_tokens() {
        let manager = loaded(MockModelBackend::new(4).with_reply("one two three four")).await;
        let params = GenerationParams {
            max_tokens: 2,
            ..GenerationParams::default()
        };
        let (text, reason) = manager
            .generate("prompt", params)
            .unwrap()
            .collect_text()
            .await
            .unwrap();
        assert_eq!(text, "one two ");
        assert_eq!(reason, FinishReason::MaxTokens);
    }

    fn long_reply(words: usize) -> String {
        (0..words).map(|i| format!("w{i}")).collect::<Vec<_>>().join(" ")
    }

    #[tokio::test]
    async fn test_cancel_stops_generation() {
        let words = TOKEN_CHANNEL_CAPACITY * 4;
        let backend = MockModelBackend::new(4).with_reply(long_reply(words));
        let manager = loaded(backend.clone()).await;
        let mut stream = manager
            .generate("prompt", GenerationParams::default())
            .unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first, TokenEvent::Token("w0 ".into()));
        stream.cancel();

        let mut received = 1;
        let mut done = None;
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                TokenEvent::Token(_) => received += 1,
                TokenEvent::Done(reason) => done = Some(reason),
            }
        }
        assert_eq!(done, Some(FinishReason::Cancelled));
        assert!(received < words, "received {received} of {words} tokens");

        let outcome = backend.last_outcome().unwrap();
        assert_eq!(outcome.reason, FinishReason::Cancelled);
        assert!(outcome.emitted < words);
    }

    #[tokio::test]
    async fn test_dropping_stream_stops_generation() {
        let words = TOKEN_CHANNEL_CAPACITY * 4;
        let backend = MockModelBackend::new(4).with_reply(long_reply(words));
        let manager = loaded(backend.clone()).await;
        let mut stream = manager
            .generate("prompt", GenerationParams::default())
            .unwrap();
        stream.next().await.unwrap().unwrap();
        drop(stream);

        let outcome = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                if let Some(outcome) = backend.last_outcome() {
                    return outcome;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("producer should stop after the stream is dropped");

        assert_eq!(outcome.reason, FinishReason::Cancelled);
        // At most the channel's buffer plus the token in flight got through.
        assert!(outcome.emitted <= TOKEN_CHANNEL_CAPACITY + 2);
        assert!(outcome.emitted < words);
    }

    #[tokio::test]
    async fn test_generate_records_prompt() {
        let backend = MockModelBackend::new(4);
        let manager = loaded(backend.clone()).await;
        manager
            .generate("What is gravity?", GenerationParams::default())
            .unwrap()
            .collect_text()
            .await
            .unwrap();
        assert_eq!(backend.last_prompt().as_deref(), Some("What is gravity?"));
    }

    #[test]
    fn test_default_params() {
        let params = GenerationParams::default();
        assert_eq!(params.max_tokens, 256);
        assert!((params.temperature - 0.7).abs() < f32::EPSILON);
    }
}
