// ============================================================================
// Error Handling
// ============================================================================

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("File error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] postgres::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("No snapshot folder at {0:?}")]
    MissingSnapshotFolder(PathBuf),
}

pub type Result<T> = std::result::Result<T, Error>;
