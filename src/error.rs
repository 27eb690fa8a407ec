//! Crate-wide error types, one per layer, composed with `thiserror`.
//!
//! Grounded on the teacher's `input::InputError` (plain enum + manual
//! `Display`); converted to `thiserror` derives here since every other
//! error kind in this crate (`EngineError`) needs the same shape and
//! `#[from]` composition pays for itself once there is more than one enum.

use std::path::PathBuf;

/// Errors raised while discovering or parsing on-disk dataset files.
#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing input: {0}")]
    MissingInput(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("parse error: {0}")]
    Parse(String),
}

/// The five error kinds from the external interface contract (spec §7).
///
/// `StepName` is attached so callers can tell which step raised without
/// parsing the message string.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input in step `{step}`: {message}")]
    InvalidInput { step: &'static str, message: String },

    #[error("invalid parameter in step `{step}`: {message}")]
    InvalidParameter { step: &'static str, message: String },

    #[error("stale reference in step `{step}`: {message}")]
    StaleReference { step: &'static str, message: String },

    #[error("resource load failure in step `{step}`: {message}")]
    ResourceLoadFailure { step: &'static str, message: String },

    #[error(
        "state mismatch: persisted state declares {declared_cells} cells, loaded inputs have {loaded_cells}"
    )]
    StateMismatch {
        declared_cells: usize,
        loaded_cells: usize,
    },

    #[error("dataset error: {0}")]
    Dataset(#[from] InputError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed persisted state: {0}")]
    Corrupt(String),
}

impl EngineError {
    pub fn invalid_input(step: &'static str, message: impl Into<String>) -> Self {
        EngineError::InvalidInput {
            step,
            message: message.into(),
        }
    }

    pub fn invalid_parameter(step: &'static str, message: impl Into<String>) -> Self {
        EngineError::InvalidParameter {
            step,
            message: message.into(),
        }
    }

    pub fn stale_reference(step: &'static str, message: impl Into<String>) -> Self {
        EngineError::StaleReference {
            step,
            message: message.into(),
        }
    }

    pub fn resource_load_failure(step: &'static str, message: impl Into<String>) -> Self {
        EngineError::ResourceLoadFailure {
            step,
            message: message.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_input_carries_step_name() {
        let err = EngineError::invalid_input("inputs", "no modality common to all datasets");
        assert!(err.to_string().contains("inputs"));
        assert!(err.to_string().contains("no modality"));
    }
}
