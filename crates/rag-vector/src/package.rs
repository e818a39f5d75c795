//! On-disk layout of installed knowledge-base packages.
//!
//! ```text
//! <root>/<kb_id>/manifest.json
//! <root>/<kb_id>/embeddings.f16
//! <root>/<kb_id>/chunks.jsonl
//! ```
//!
//! Packages are delivered (downloaded, verified, unpacked) by the host
//! application before retrieval runs. The checksum helpers here let the host
//! and the CLI check a delivered file against its published SHA-256.

use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use rag_core::error::{RagError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const EMBEDDINGS_FILE: &str = "embeddings.f16";
pub const CHUNKS_FILE: &str = "chunks.jsonl";

/// Resolves knowledge-base ids to package directories under a root.
#[derive(Debug, Clone)]
pub struct KbLayout {
    root: PathBuf,
}

impl KbLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory of one package.
    ///
    /// Ids must be a single path component; anything else cannot name an
    /// installed package and is reported as [`RagError::NotFound`].
    pub fn package_dir(&self, kb_id: &str) -> Result<PathBuf> {
        if kb_id.is_empty()
            || kb_id == "."
            || kb_id.contains("..")
            || kb_id.contains('/')
            || kb_id.contains('\\')
        {
            return Err(RagError::NotFound(format!(
                "invalid knowledge base id {:?}",
                kb_id
            )));
        }
        Ok(self.root.join(kb_id))
    }

    pub fn manifest_path(&self, kb_id: &str) -> Result<PathBuf> {
        Ok(self.package_dir(kb_id)?.join(MANIFEST_FILE))
    }

    pub fn embeddings_path(&self, kb_id: &str) -> Result<PathBuf> {
        Ok(self.package_dir(kb_id)?.join(EMBEDDINGS_FILE))
    }

    pub fn chunks_path(&self, kb_id: &str) -> Result<PathBuf> {
        Ok(self.package_dir(kb_id)?.join(CHUNKS_FILE))
    }

    /// Whether a manifest exists for `kb_id`.
    pub fn is_installed(&self, kb_id: &str) -> bool {
        self.manifest_path(kb_id)
            .map(|p| p.is_file())
            .unwrap_or(false)
    }

    /// Ids of every directory under the root that holds a manifest, sorted.
    pub fn installed(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.path().join(MANIFEST_FILE).is_file() {
                ids.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

/// SHA-256 of a file as lowercase hex, streamed in 64 KiB blocks.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Check a file against an expected SHA-256 hex digest (case-insensitive).
pub fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if actual.eq_ignore_ascii_case(expected.trim()) {
        Ok(())
    } else {
        Err(RagError::Format(format!(
            "checksum mismatch for {}: expected {}, got {}",
            path.display(),
            expected.trim(),
            actual
        )))
    }
}
