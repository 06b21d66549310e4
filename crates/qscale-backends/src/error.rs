//! Error type for backend fetches.

use thiserror::Error;

/// Errors that can occur while fetching a signal from a backend.
///
/// All variants abort the poll cycle that triggered the fetch; nothing is
/// retried at this layer.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("kubernetes api error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("{endpoint} returned {status}: {body}")]
    ErrorStatus {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[error("malformed response: {0}")]
    Malformed(String),
}
