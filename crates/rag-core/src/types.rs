use serde::{Deserialize, Serialize};

// =============================================================================
// Knowledge-base records
// =============================================================================

/// One retrievable unit of source text.
///
/// The position of an entry inside `chunks.jsonl` is its join key to the
/// embedding row with the same index. `id` is carried for display and
/// provenance only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub id: String,
    pub text: String,
    /// Where the text came from (document title, page, URL).
    pub source: String,
}

/// A row of the embedding index paired with its similarity to a query.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoredRow {
    /// Row index in the embedding index (and chunk store).
    pub index: usize,
    /// Cosine similarity in `[-1.0, 1.0]`, slightly damped by the epsilon term.
    pub score: f32,
}

/// A grade/subject pairing that selects one knowledge base.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectScope {
    pub grade: String,
    pub subject: String,
}

impl SubjectScope {
    pub fn new(grade: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            grade: grade.into(),
            subject: subject.into(),
        }
    }

    /// Knowledge-base id for this scope, e.g. `grade_5__earth_science`.
    pub fn scope_id(&self) -> String {
        format!("{}__{}", normalize(&self.grade), normalize(&self.subject))
    }
}

fn normalize(part: &str) -> String {
    part.to_lowercase().replace(' ', "_")
}
