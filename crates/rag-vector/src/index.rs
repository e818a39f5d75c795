//! Half-precision embedding index with brute-force cosine similarity search.
//!
//! Vectors are kept in their on-disk binary16 form and decoded on the fly
//! during a scan; only the per-row L2 norms are precomputed. Search is
//! O(count * dimension), which is acceptable for per-subject knowledge bases
//! of a few thousand chunks.

use std::cmp::Ordering;
use std::path::Path;

use rayon::prelude::*;
use tracing::debug;

use rag_core::error::{RagError, Result};
use rag_core::types::ScoredRow;

use crate::binary16;

/// Guards the cosine denominator against all-zero rows or queries.
pub const SCORE_EPSILON: f32 = 1e-6;

/// Default row count at which scoring fans out across the rayon pool.
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 4_096;

/// Immutable embedding matrix loaded from an `embeddings.f16` file.
///
/// Row `i` occupies `vectors[i * dimension..(i + 1) * dimension]`.
#[derive(Debug, Clone)]
pub struct EmbeddingIndex {
    vectors: Vec<u16>,
    norms: Vec<f32>,
    dimension: usize,
    count: usize,
    parallel_threshold: usize,
}

impl EmbeddingIndex {
    /// Build an index from raw little-endian binary16 bytes.
    ///
    /// Fails with [`RagError::Format`] unless `bytes.len()` is exactly
    /// `dimension * count * 2`.
    pub fn load(bytes: &[u8], dimension: usize, count: usize) -> Result<Self> {
        if dimension == 0 {
            return Err(RagError::Format("embedding dimension must be positive".into()));
        }
        let expected = expected_len(dimension, count)?;
        if bytes.len() != expected {
            return Err(RagError::Format(format!(
                "embedding data is {} bytes, expected {} ({} rows x {} dims x 2)",
                bytes.len(),
                expected,
                count,
                dimension
            )));
        }

        let vectors: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        let norms = vectors
            .chunks_exact(dimension)
            .map(|row| row.iter().map(|&bits| binary16::decode(bits)).map(|v| v * v).sum::<f32>().sqrt())
            .collect();

        Ok(Self {
            vectors,
            norms,
            dimension,
            count,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
        })
    }

    /// Read an `embeddings.f16` file and build the index.
    ///
    /// A missing file is [`RagError::NotFound`]. The size is checked before
    /// the file is read so that a mismatched package fails fast.
    pub fn load_file(path: &Path, dimension: usize, count: usize) -> Result<Self> {
        let metadata = match std::fs::metadata(path) {
            Ok(m) => m,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(RagError::NotFound(format!("embeddings {}", path.display())));
            }
            Err(e) => return Err(e.into()),
        };
        let expected = expected_len(dimension, count)?;
        if metadata.len() != expected as u64 {
            return Err(RagError::Format(format!(
                "{} is {} bytes, expected {}",
                path.display(),
                metadata.len(),
                expected
            )));
        }

        let bytes = std::fs::read(path)?;
        let index = Self::load(&bytes, dimension, count)?;
        debug!(
            path = %path.display(),
            dimension,
            count,
            "Embedding index loaded"
        );
        Ok(index)
    }

    /// Set the row count from which [`top_k`](Self::top_k) scores rows in
    /// parallel. Results are identical either way.
    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    /// Return the `k` rows most similar to `query`, best first.
    ///
    /// Ties keep ascending row order. Returns `min(k, count)` rows; rows whose
    /// score is NaN rank after every comparable score.
    pub fn top_k(&self, query: &[f32], k: usize) -> Result<Vec<ScoredRow>> {
        if query.len() != self.dimension {
            return Err(RagError::Dimension {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        if k == 0 || self.count == 0 {
            return Ok(Vec::new());
        }

        let query_norm = query.iter().map(|q| q * q).sum::<f32>().sqrt();
        let scores = if self.count >= self.parallel_threshold {
            self.score_parallel(query, query_norm)
        } else {
            self.score_sequential(query, query_norm)
        };

        let mut scored: Vec<ScoredRow> = scores
            .into_iter()
            .enumerate()
            .map(|(index, score)| ScoredRow { index, score })
            .collect();

        // Stable sort: equal scores stay in row order.
        scored.sort_by(|a, b| descending(a.score, b.score));
        scored.truncate(k);
        Ok(scored)
    }

    fn score_sequential(&self, query: &[f32], query_norm: f32) -> Vec<f32> {
        self.vectors
            .chunks_exact(self.dimension)
            .zip(&self.norms)
            .map(|(row, &norm)| cosine(row, query, norm, query_norm))
            .collect()
    }

    fn score_parallel(&self, query: &[f32], query_norm: f32) -> Vec<f32> {
        self.vectors
            .par_chunks_exact(self.dimension)
            .zip(self.norms.par_iter())
            .map(|(row, &norm)| cosine(row, query, norm, query_norm))
            .collect()
    }

    /// Decoded components of row `index`.
    pub fn row(&self, index: usize) -> Option<Vec<f32>> {
        if index >= self.count {
            return None;
        }
        let start = index * self.dimension;
        Some(
            self.vectors[start..start + self.dimension]
                .iter()
                .map(|&bits| binary16::decode(bits))
                .collect(),
        )
    }

    /// Precomputed L2 norm of row `index`.
    pub fn norm(&self, index: usize) -> Option<f32> {
        self.norms.get(index).copied()
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of rows in the index.
    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Serialize rows into the `embeddings.f16` byte layout.
///
/// Fails with [`RagError::Dimension`] if the rows are ragged.
pub fn encode_rows(rows: &[Vec<f32>]) -> Result<Vec<u8>> {
    let dimension = rows.first().map(Vec::len).unwrap_or(0);
    let mut bytes = Vec::with_capacity(rows.len() * dimension * 2);
    for row in rows {
        if row.len() != dimension {
            return Err(RagError::Dimension {
                expected: dimension,
                actual: row.len(),
            });
        }
        for &value in row {
            bytes.extend_from_slice(&binary16::encode(value).to_le_bytes());
        }
    }
    Ok(bytes)
}

fn expected_len(dimension: usize, count: usize) -> Result<usize> {
    dimension
        .checked_mul(count)
        .and_then(|n| n.checked_mul(2))
        .ok_or_else(|| {
            RagError::Format(format!(
                "embedding size overflows: {} rows x {} dims",
                count, dimension
            ))
        })
}

fn cosine(row: &[u16], query: &[f32], norm: f32, query_norm: f32) -> f32 {
    let dot: f32 = row
        .iter()
        .zip(query)
        .map(|(&bits, &q)| binary16::decode(bits) * q)
        .sum();
    dot / (norm * query_norm + SCORE_EPSILON)
}

fn descending(a: f32, b: f32) -> Ordering {
    b.partial_cmp(&a)
        .unwrap_or_else(|| a.is_nan().cmp(&b.is_nan()))
}
