//! Error types for the ablate core.
//!
//! Uses `thiserror` with struct-style variants. [`AttributionError`] is what a
//! caller of the estimator sees; [`OracleError`] is the taxonomy a likelihood
//! oracle (model wrapper) reports, and is carried as the source of
//! [`AttributionError::Scoring`].

/// Errors raised by an attribution call. Every variant is fatal to the call.
#[derive(Debug, thiserror::Error)]
pub enum AttributionError {
    #[error("Empty input: {what}")]
    EmptyInput { what: String },

    #[error("Invalid partition: {reason}")]
    InvalidPartition { reason: String },

    #[error("Invalid perturbation for unit(s) {units:?}: {reason}")]
    InvalidPerturbation { units: Vec<usize>, reason: String },

    #[error("Scoring failed: {message}")]
    Scoring {
        message: String,
        #[source]
        source: Option<OracleError>,
    },

    #[error("Scoring timed out after {timeout_ms}ms")]
    ScoringTimeout { timeout_ms: u64 },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AttributionError {
    pub fn empty_input(what: impl Into<String>) -> Self {
        Self::EmptyInput { what: what.into() }
    }

    pub fn invalid_partition(reason: impl Into<String>) -> Self {
        Self::InvalidPartition {
            reason: reason.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// A scoring failure detected by the estimator itself (no oracle cause).
    pub fn scoring(message: impl Into<String>) -> Self {
        Self::Scoring {
            message: message.into(),
            source: None,
        }
    }

    /// Wrap an error reported by the oracle.
    pub fn oracle(err: OracleError) -> Self {
        Self::Scoring {
            message: format!("oracle failed: {err}"),
            source: Some(err),
        }
    }
}

impl From<figment::Error> for AttributionError {
    fn from(err: figment::Error) -> Self {
        Self::configuration(err.to_string())
    }
}

/// Errors reported by a likelihood oracle or sampler implementation.
#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("Resource exhausted: {message}")]
    ResourceExhausted { message: String },

    #[error("Malformed model output: {message}")]
    MalformedOutput { message: String },

    #[error("Request failed: {message}")]
    Request { message: String },

    #[error("Oracle timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Oracle unavailable: {message}")]
    Unavailable { message: String },

    #[error("Request rejected ({status}): {message}")]
    Rejected { status: u16, message: String },
}

impl OracleError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedOutput {
            message: message.into(),
        }
    }

    pub fn request(message: impl Into<String>) -> Self {
        Self::Request {
            message: message.into(),
        }
    }

    /// Whether retrying the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Request { .. }
                | Self::Timeout { .. }
                | Self::RateLimited { .. }
                | Self::Unavailable { .. }
        )
    }
}
