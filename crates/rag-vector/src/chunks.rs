//! Line-delimited chunk records (`chunks.jsonl`).

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use rag_core::error::{RagError, Result};
use rag_core::types::ChunkEntry;

/// Reader for the text side of a knowledge base.
///
/// Line `i` of the file is the text that was embedded into row `i` of the
/// embedding index, so loading is all-or-nothing: a single bad line would
/// otherwise shift every following chunk against its vector.
#[derive(Debug, Clone)]
pub struct ChunkStore {
    path: PathBuf,
}

impl ChunkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load every chunk in file order.
    ///
    /// A missing file yields an empty store. Any line that is not a JSON
    /// object with string `id`, `text` and `source` fields fails the load
    /// with [`RagError::Format`].
    pub fn load_all(&self) -> Result<Vec<ChunkEntry>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Chunk file absent, using empty store");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };
        let chunks = parse(&content)?;
        debug!(path = %self.path.display(), count = chunks.len(), "Chunks loaded");
        Ok(chunks)
    }

    /// Write chunks in the on-disk layout, one JSON object per line.
    pub fn write_all(&self, chunks: &[ChunkEntry]) -> Result<()> {
        let mut out = std::io::BufWriter::new(std::fs::File::create(&self.path)?);
        for chunk in chunks {
            serde_json::to_writer(&mut out, chunk)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse JSONL content into chunks.
pub fn parse(content: &str) -> Result<Vec<ChunkEntry>> {
    content
        .lines()
        .enumerate()
        .map(|(n, line)| {
            serde_json::from_str::<ChunkEntry>(line).map_err(|e| {
                RagError::Format(format!("chunk line {} is malformed: {}", n + 1, e))
            })
        })
        .collect()
}
