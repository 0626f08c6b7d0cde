use std::fmt;

use thiserror::Error;

/// Which catalog endpoint a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Add,
    Remove,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Add => "add",
            Operation::Remove => "remove",
        })
    }
}

/// Typed catalog errors enabling retry classification.
///
/// `is_retryable()` separates transient failures (rate limits, server errors,
/// dropped connections) from permanent ones (bad token, rejected payload) so
/// the retry loop gives up early on the latter.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Catalog {operation} returned HTTP {status}")]
    HttpStatus { operation: Operation, status: u16 },

    #[error("Catalog {operation} rejected with code {code}: {message}")]
    Rejected {
        operation: Operation,
        code: i64,
        message: String,
    },

    #[error("Catalog {operation} request failed: {source}")]
    Transport {
        operation: Operation,
        #[source]
        source: reqwest::Error,
    },

    #[error("Catalog {operation} returned an unreadable response: {source}")]
    Decode {
        operation: Operation,
        #[source]
        source: reqwest::Error,
    },

    #[error("Cannot build catalog client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Catalog token contains characters not allowed in a header")]
    InvalidToken,
}

impl CatalogError {
    /// Whether this error is transient and worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            CatalogError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            CatalogError::Transport { .. } => true,
            CatalogError::Rejected { .. }
            | CatalogError::Decode { .. }
            | CatalogError::Client(_)
            | CatalogError::InvalidToken => false,
        }
    }
}
