use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{RagError, Result};

/// Top-level configuration for the on-device retrieval stack.
///
/// Loaded from `~/.ondevice-rag/config.toml` by default. Every section falls
/// back to its defaults when omitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RagConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

impl RagConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: RagConfig = toml::from_str(&content)?;
        config.validate()?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.retrieval.top_k == 0 {
            return Err(RagError::Config("retrieval.top_k must be positive".into()));
        }
        if self.retrieval.kb_root.trim().is_empty() {
            return Err(RagError::Config("retrieval.kb_root must not be empty".into()));
        }
        Ok(())
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Directory holding one sub-directory per knowledge-base id.
    pub kb_root: String,
    /// Number of chunks handed to the model as context.
    pub top_k: usize,
    /// Row count at which the similarity scan fans out across threads.
    pub parallel_threshold: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            kb_root: "~/.ondevice-rag/data/kb".to_string(),
            top_k: 4,
            parallel_threshold: 4_096,
        }
    }
}
