//! CLI argument definitions for the ondevice-rag tool.
//!
//! Uses `clap` with derive macros for ergonomic argument parsing.
//! Priority resolution: CLI args > env vars > config file > defaults.

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

/// ondevice-rag: inspect and query offline knowledge-base packages.
#[derive(Parser, Debug)]
#[command(name = "ondevice-rag", version, about)]
pub struct CliArgs {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding installed knowledge-base packages.
    #[arg(long = "kb-root", global = true)]
    pub kb_root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    /// Directory with `model.onnx` and `tokenizer.json` for query embedding.
    /// Only honoured by builds with the `onnx` feature.
    #[arg(long = "model-dir", global = true)]
    pub model_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List installed knowledge-base ids.
    List,
    /// Print a package's manifest and file status.
    Inspect {
        /// Knowledge-base id (directory name under the kb root).
        kb: String,
    },
    /// Rank a package's rows against a raw query vector.
    Search {
        kb: String,
        /// Comma-separated query components, e.g. `0.9,0.1,0,0`.
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true, required = true)]
        vector: Vec<f32>,
        #[command(flatten)]
        top_k: TopK,
    },
    /// Embed a question and print the best matching chunks as JSON lines.
    Retrieve {
        kb: String,
        query: String,
        #[command(flatten)]
        top_k: TopK,
    },
    /// Render the tutor prompt for a question using retrieved context.
    Prompt {
        /// Knowledge-base id; defaults to the id derived from grade and subject.
        #[arg(long)]
        kb: Option<String>,
        query: String,
        #[arg(long)]
        grade: String,
        #[arg(long)]
        subject: String,
        #[command(flatten)]
        top_k: TopK,
    },
    /// Check a file against an expected SHA-256 digest.
    Verify {
        file: PathBuf,
        #[arg(long = "sha256")]
        sha256: String,
    },
}

#[derive(Args, Debug, Clone, Copy)]
pub struct TopK {
    /// Number of results (defaults to `retrieval.top_k` from the config).
    #[arg(short = 'k', long = "top-k")]
    pub k: Option<usize>,
}

impl TopK {
    pub fn resolve(self, config_top_k: usize) -> usize {
        self.k.unwrap_or(config_top_k)
    }
}

impl CliArgs {
    /// Resolve the configuration file path.
    ///
    /// Priority: --config flag > ONDEVICE_RAG_CONFIG env var > platform default (~/.ondevice-rag/config.toml).
    pub fn resolve_config_path(&self) -> PathBuf {
        if let Some(ref p) = self.config {
            return p.clone();
        }
        if let Ok(p) = std::env::var("ONDEVICE_RAG_CONFIG") {
            return PathBuf::from(p);
        }
        default_config_path()
    }

    /// Resolve the knowledge-base root.
    ///
    /// Priority: --kb-root flag > config file value (with `~` expanded).
    pub fn resolve_kb_root(&self, config_kb_root: &str) -> PathBuf {
        match self.kb_root {
            Some(ref p) => p.clone(),
            None => expand_home(config_kb_root),
        }
    }

    /// Resolve the log level.
    ///
    /// Priority: --log-level flag > config file value.
    pub fn resolve_log_level(&self, config_level: &str) -> String {
        self.log_level
            .clone()
            .unwrap_or_else(|| config_level.to_string())
    }
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(path: &str) -> PathBuf {
    if path == "~" {
        return home_dir().unwrap_or_else(|| PathBuf::from("."));
    }
    if let Some(rest) = path.strip_prefix("~/").or_else(|| path.strip_prefix("~\\")) {
        return home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(rest);
    }
    Path::new(path).to_path_buf()
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    let var = "USERPROFILE";
    #[cfg(not(target_os = "windows"))]
    let var = "HOME";
    std::env::var(var).ok().map(PathBuf::from)
}

/// Default config file path for the current platform.
fn default_config_path() -> PathBuf {
    match home_dir() {
        Some(home) => home.join(".ondevice-rag").join("config.toml"),
        None => PathBuf::from("config.toml"),
    }
}
