use thiserror::Error;

pub use crate::error::NotFound;

/// Failure reported by the cluster-control collaborator.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    #[error("{operation} failed: {message}")]
    Cluster {
        operation: &'static str,
        message: String,
    },

    #[error(transparent)]
    NotFound(#[from] NotFound),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl Error {
    pub fn cluster(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Cluster {
            operation,
            message: message.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
