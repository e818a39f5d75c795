//! ondevice-rag binary: composition root.
//!
//! 1. Parse CLI arguments
//! 2. Load configuration from TOML
//! 3. Initialize tracing
//! 4. Run one command against the installed knowledge-base packages
//!
//! Results go to stdout; logs go to stderr.

mod cli;

use std::sync::Arc;

use clap::Parser;
use serde_json::json;

use rag_core::config::RagConfig;
use rag_core::error::Result;
use rag_core::types::SubjectScope;
use rag_vector::embedding::{DynEmbeddingService, MockEmbedding};
use rag_vector::package::{self, KbLayout};
use rag_vector::prompt::build_prompt;
use rag_vector::{LoadedKb, Manifest, RetrievalEngine};

use cli::{CliArgs, Command};

/// Query embedder for a package.
///
/// With `--model-dir` (and the `onnx` feature) the ONNX sentence model is
/// used; otherwise the deterministic hashing embedder sized to the manifest.
fn query_embedder(args: &CliArgs, dimensions: usize) -> Result<Arc<dyn DynEmbeddingService>> {
    #[cfg(feature = "onnx")]
    if let Some(ref dir) = args.model_dir {
        let service = rag_vector::OnnxEmbeddingService::from_directory(dir)?;
        return Ok(Arc::new(service));
    }
    #[cfg(not(feature = "onnx"))]
    if args.model_dir.is_some() {
        return Err(rag_core::error::RagError::Config(
            "--model-dir requires a build with the `onnx` feature".into(),
        ));
    }
    tracing::debug!(dimensions, "Using hashing embedder for queries");
    Ok(Arc::new(MockEmbedding::with_dimensions(dimensions)))
}

/// Embedding width declared by `kb`'s manifest.
fn manifest_dimensions(layout: &KbLayout, kb: &str) -> Result<usize> {
    Ok(Manifest::load(&layout.manifest_path(kb)?)?.embedding_dim)
}

fn engine_for(
    args: &CliArgs,
    config: &RagConfig,
    layout: &KbLayout,
    dimensions: usize,
) -> Result<RetrievalEngine> {
    let embedder = query_embedder(args, dimensions)?;
    Ok(RetrievalEngine::from_config(
        &config.retrieval,
        layout.clone(),
        embedder,
    ))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

async fn run(args: &CliArgs, config: &RagConfig, layout: &KbLayout) -> Result<()> {
    match &args.command {
        Command::List => {
            for kb_id in layout.installed()? {
                println!("{}", kb_id);
            }
        }
        Command::Inspect { kb } => {
            let loaded = LoadedKb::load(layout, kb, config.retrieval.parallel_threshold)?;
            let report = json!({
                "kb_id": kb,
                "path": layout.package_dir(kb)?.display().to_string(),
                "version": loaded.manifest.version,
                "embedding_dim": loaded.manifest.embedding_dim,
                "chunk_count": loaded.manifest.chunk_count,
                "embedding_bytes": loaded.manifest.expected_embedding_bytes(),
                "chunk_lines": loaded.chunks.len(),
                "consistent": loaded.chunks.len() == loaded.manifest.chunk_count,
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Search { kb, vector, top_k } => {
            let k = top_k.resolve(config.retrieval.top_k);
            let loaded = LoadedKb::load(layout, kb, config.retrieval.parallel_threshold)?;
            let hits = loaded.index.top_k(vector, k)?;
            tracing::info!(kb_id = %kb, k, hits = hits.len(), "Search complete");
            for (rank, hit) in hits.iter().enumerate() {
                let chunk = loaded.chunks.get(hit.index);
                print_json(&json!({
                    "rank": rank + 1,
                    "row": hit.index,
                    "score": hit.score,
                    "id": chunk.map(|c| c.id.as_str()),
                    "text": chunk.map(|c| c.text.as_str()),
                }))?;
            }
        }
        Command::Retrieve { kb, query, top_k } => {
            let k = top_k.resolve(config.retrieval.top_k);
            let engine = engine_for(args, config, layout, manifest_dimensions(layout, kb)?)?;
            for chunk in engine.retrieve(kb, query, k).await? {
                print_json(&chunk)?;
            }
        }
        Command::Prompt {
            kb,
            query,
            grade,
            subject,
            top_k,
        } => {
            let scope = SubjectScope::new(grade.as_str(), subject.as_str());
            let kb_id = kb.clone().unwrap_or_else(|| scope.scope_id());
            let k = top_k.resolve(config.retrieval.top_k);
            // A missing package is reported by the retrieval itself.
            let dimensions = manifest_dimensions(layout, &kb_id)
                .unwrap_or(MockEmbedding::DEFAULT_DIMENSIONS);
            let context = engine_for(args, config, layout, dimensions)?
                .retrieve_or_empty(&kb_id, query, k)
                .await;
            println!("{}", build_prompt(&scope, &context, query));
        }
        Command::Verify { file, sha256 } => {
            package::verify_sha256(file, sha256)?;
            println!("OK {}", file.display());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Config, read before tracing so its log level can apply.
    let config_file = args.resolve_config_path();
    let loaded = if config_file.exists() {
        RagConfig::load(&config_file).map(Some)
    } else {
        Ok(None)
    };
    let config_level = match loaded {
        Ok(Some(ref c)) => c.general.log_level.clone(),
        _ => RagConfig::default().general.log_level,
    };

    // Tracing.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| {
                    tracing_subscriber::EnvFilter::new(args.resolve_log_level(&config_level))
                }),
        )
        .init();

    let config = match loaded {
        Ok(Some(config)) => {
            tracing::debug!(path = %config_file.display(), "Configuration loaded");
            config
        }
        Ok(None) => {
            tracing::debug!(path = %config_file.display(), "No config file, using defaults");
            RagConfig::default()
        }
        Err(e) => {
            tracing::warn!(path = %config_file.display(), error = %e, "Invalid config, using defaults");
            RagConfig::default()
        }
    };

    let kb_root = args.resolve_kb_root(&config.retrieval.kb_root);
    tracing::debug!(kb_root = %kb_root.display(), "Knowledge-base root");
    let layout = KbLayout::new(kb_root);

    if let Err(e) = run(&args, &config, &layout).await {
        tracing::error!(error = %e, "Command failed");
        return Err(e.into());
    }
    Ok(())
}
