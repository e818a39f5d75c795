//! Tutor prompt rendering.

use rag_core::types::{ChunkEntry, SubjectScope};

/// Render retrieved chunks as a bulleted context block.
///
/// Chunks are separated by a blank line; no chunks yields an empty string.
pub fn format_context(chunks: &[ChunkEntry]) -> String {
    chunks
        .iter()
        .map(|c| format!("- {}", c.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Build the prompt handed to the generation model.
pub fn build_prompt(scope: &SubjectScope, chunks: &[ChunkEntry], question: &str) -> String {
    format!(
        "You are a helpful tutor for {grade} {subject}.\n\
         Use the provided context to answer clearly and briefly.\n\
         \n\
         Context:\n\
         {context}\n\
         \n\
         Question: {question}\n\
         Answer:",
        grade = scope.grade,
        subject = scope.subject,
        context = format_context(chunks),
        question = question,
    )
}
