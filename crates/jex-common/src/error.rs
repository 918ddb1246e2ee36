//! Error types for JEX

use thiserror::Error;

/// Result type alias for JEX operations
pub type Result<T> = std::result::Result<T, JexError>;

/// Main error type for JEX
#[derive(Error, Debug)]
pub enum JexError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("Node store error at '{path}': {message}")]
    NodeStore { path: String, message: String },

    #[error("Invalid {object_type} object: {message}")]
    InvalidObject {
        object_type: String,
        message: String,
    },

    #[error("Unknown object type: {0}")]
    UnknownObjectType(String),
}

impl JexError {
    pub fn journal(message: impl std::fmt::Display) -> Self {
        JexError::Journal(message.to_string())
    }

    pub fn node_store(path: impl AsRef<std::path::Path>, message: impl std::fmt::Display) -> Self {
        JexError::NodeStore {
            path: path.as_ref().display().to_string(),
            message: message.to_string(),
        }
    }

    pub fn invalid_object(object_type: impl Into<String>, message: impl Into<String>) -> Self {
        JexError::InvalidObject {
            object_type: object_type.into(),
            message: message.into(),
        }
    }
}
