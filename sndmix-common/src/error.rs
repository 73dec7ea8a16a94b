//! Common error types for sndmix

use thiserror::Error;

/// Common result type for sndmix operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors shared across the sndmix crates
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}
