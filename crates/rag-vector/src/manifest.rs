//! Knowledge-base manifest (`manifest.json`).

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Number;
use tracing::debug;

use rag_core::error::{RagError, Result};

/// Metadata that sizes the embedding file of a knowledge base.
///
/// `embedding_dim * chunk_count * 2` must equal the byte length of
/// `embeddings.f16`, and `chunk_count` should equal the number of lines in
/// `chunks.jsonl`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Manifest {
    pub version: String,
    pub embedding_dim: usize,
    pub chunk_count: usize,
}

impl Manifest {
    /// Read and validate a manifest file.
    ///
    /// A missing file is [`RagError::NotFound`]: without a manifest the
    /// package is considered absent.
    pub fn load(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RagError::NotFound(format!(
                    "manifest {}",
                    path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        let manifest = Self::parse(&content)?;
        debug!(
            path = %path.display(),
            version = %manifest.version,
            embedding_dim = manifest.embedding_dim,
            chunk_count = manifest.chunk_count,
            "Manifest loaded"
        );
        Ok(manifest)
    }

    /// Parse a manifest from its JSON text.
    ///
    /// Counts may be written as integral floats (`4.0`); fractional values
    /// and strings are rejected.
    pub fn parse(content: &str) -> Result<Self> {
        let raw: RawManifest = serde_json::from_str(content)
            .map_err(|e| RagError::Format(format!("invalid manifest: {}", e)))?;

        let embedding_dim = integer_field("embedding_dim", &raw.embedding_dim)?;
        if embedding_dim <= 0 {
            return Err(RagError::Format(format!(
                "manifest `embedding_dim` must be positive, got {}",
                embedding_dim
            )));
        }

        let chunk_count = integer_field("chunk_count", &raw.chunk_count)?;
        if chunk_count < 0 {
            return Err(RagError::Format(format!(
                "manifest `chunk_count` must not be negative, got {}",
                chunk_count
            )));
        }

        Ok(Self {
            version: raw.version,
            embedding_dim: to_usize(embedding_dim)?,
            chunk_count: to_usize(chunk_count)?,
        })
    }

    /// Expected byte length of the companion `embeddings.f16` file.
    pub fn expected_embedding_bytes(&self) -> Option<usize> {
        self.embedding_dim
            .checked_mul(self.chunk_count)
            .and_then(|n| n.checked_mul(2))
    }

    /// Write the manifest as JSON.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Manifest as written on disk, before range checks.
#[derive(Deserialize)]
struct RawManifest {
    version: String,
    embedding_dim: Number,
    chunk_count: Number,
}

fn integer_field(name: &str, value: &Number) -> Result<i64> {
    if let Some(n) = value.as_i64() {
        return Ok(n);
    }
    match value.as_f64() {
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => Ok(f as i64),
        _ => Err(RagError::Format(format!(
            "manifest field `{}` is not an integer: {}",
            name, value
        ))),
    }
}

fn to_usize(value: i64) -> Result<usize> {
    usize::try_from(value)
        .map_err(|_| RagError::Format(format!("manifest value {} does not fit in usize", value)))
}
