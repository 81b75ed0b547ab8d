//! Error types for position-shifted attention inference.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid model file: {0}")]
    InvalidModel(String),

    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    #[error("Shape mismatch in {context}: expected {expected}, got {got}")]
    Shape {
        context: &'static str,
        expected: String,
        got: String,
    },

    #[error("Position id {position} out of range for rotary table of length {len}")]
    PositionOutOfRange { position: usize, len: usize },
}

impl StreamError {
    /// Build a shape error from anything that debug-prints.
    pub(crate) fn shape(
        context: &'static str,
        expected: impl std::fmt::Debug,
        got: impl std::fmt::Debug,
    ) -> Self {
        StreamError::Shape {
            context,
            expected: format!("{expected:?}"),
            got: format!("{got:?}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;
