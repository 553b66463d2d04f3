//! Error types for fuzzdeploy

use thiserror::Error;

/// Main error type for fuzzdeploy
#[derive(Error, Debug)]
pub enum FuzzDeployError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A campaign precondition does not hold; raised before any job launches
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// A single job could not be started
    #[error("Launch error for {job}: {reason}")]
    Launch { job: String, reason: String },

    /// Job backend error
    #[error("Backend error: {0}")]
    Backend(String),

    /// Resource exhausted
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FuzzDeployError {
    /// Whether this error must abort the campaign before anything is launched
    pub fn is_precondition(&self) -> bool {
        matches!(self, FuzzDeployError::Precondition(_) | FuzzDeployError::Config(_))
    }
}

/// Result type for fuzzdeploy operations
pub type FuzzDeployResult<T> = Result<T, FuzzDeployError>;

impl From<toml::de::Error> for FuzzDeployError {
    fn from(err: toml::de::Error) -> Self {
        FuzzDeployError::Config(err.to_string())
    }
}
