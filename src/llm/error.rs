//! Reasoner error types.

/// Error from a reasoning collaborator.
#[derive(Debug, thiserror::Error)]
pub enum ReasonerError {
    /// The reasoning script could not be parsed or is inconsistent
    #[error("Invalid reasoning script: {0}")]
    InvalidScript(String),

    #[error("Failed to read reasoning script: {0}")]
    Io(#[from] std::io::Error),

    /// The collaborator could not produce a step right now
    #[error("Reasoner unavailable: {0}")]
    Unavailable(String),

    /// The model endpoint refused the request (bad key, unknown model, malformed body)
    #[error("Reasoner request rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The model replied with something that is not a usable step
    #[error("Unusable reasoner reply: {0}")]
    InvalidResponse(String),
}

impl ReasonerError {
    /// Whether asking again might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::InvalidResponse(_))
    }
}
