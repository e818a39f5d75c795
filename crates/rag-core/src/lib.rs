pub mod config;
pub mod error;
pub mod types;

pub use config::RagConfig;
pub use error::{RagError, Result};
pub use types::*;
