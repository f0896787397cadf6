//! Typed errors for the library surface. Process-boundary code (CLI bootstrap,
//! listener binds) uses `anyhow` instead, matching the teacher binary's style.

#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("domain must be non-empty and whitespace-free")]
    InvalidDomain,

    #[error("pattern must be of the form \"*.suffix\" with a suffix of at least two labels")]
    InvalidPattern,

    #[error("decision file io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("decision file serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}
