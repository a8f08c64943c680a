use thiserror::Error;

#[derive(Debug, Error)]
pub enum VesperError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("schema error: {0}")]
    Schema(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("generation error: {0}")]
    Generation(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("runtime error: {0}")]
    Runtime(String),
}

impl VesperError {
    /// Only schema/initialization failures abort the process; everything else
    /// is recovered where it happens.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VesperError::Schema(_))
    }
}

pub use crate::Result;
