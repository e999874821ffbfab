use thiserror::Error;

/// Main error type for the Parallax system
#[derive(Error, Debug)]
pub enum PxError {
    #[error("Search space error: {0}")]
    SearchSpace(#[from] SearchSpaceError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Aggregation error: {0}")]
    Aggregation(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors raised while compiling or sampling the search space
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SearchSpaceError {
    #[error("Invalid spec for param '{name}': {message}")]
    InvalidSpec { name: String, message: String },

    #[error("Invalid range for param '{name}': {message}")]
    InvalidRangeConfig { name: String, message: String },

    #[error("Missing param '{name}' in best params, and spec is not fixed")]
    MissingParameter { name: String },

    #[error("Param '{name}' is not covered by the sampler: {message}")]
    Unsampleable { name: String, message: String },
}

/// Errors surfaced by trial-store operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Study not found: {name}")]
    StudyNotFound { name: String },

    #[error("Study '{name}' already exists with direction {existing}, requested {requested}")]
    DirectionMismatch {
        name: String,
        existing: String,
        requested: String,
    },

    #[error("Trial {number} not found in study '{study}'")]
    TrialNotFound { study: String, number: u64 },

    #[error("Trial {number} in study '{study}' was already finished as {state}")]
    TrialAlreadyFinished {
        study: String,
        number: u64,
        state: String,
    },

    #[error("Trial {number} is claimed by '{owner}', not '{claimant}'")]
    NotClaimant {
        number: u64,
        owner: String,
        claimant: String,
    },

    #[error("Invalid trial report: {message}")]
    InvalidReport { message: String },

    #[error("Unsupported storage url: {url}")]
    UnsupportedUrl { url: String },

    #[error("Storage backend failure: {message}")]
    Backend { message: String },
}

/// Result type alias for Parallax operations
pub type PxResult<T> = Result<T, PxError>;

/// Result alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::PxError::Config(format!($($arg)*))
    };
}

/// Macro for creating store backend errors
#[macro_export]
macro_rules! backend_error {
    ($($arg:tt)*) => {
        $crate::StoreError::Backend { message: format!($($arg)*) }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = StoreError::NotClaimant {
            number: 7,
            owner: "worker-a".to_string(),
            claimant: "worker-b".to_string(),
        };

        assert!(error.to_string().contains("Trial 7"));
        assert!(error.to_string().contains("worker-a"));
        assert!(error.to_string().contains("worker-b"));
    }

    #[test]
    fn test_error_conversion() {
        let store_error = StoreError::StudyNotFound {
            name: "demo".to_string(),
        };
        let px_error: PxError = store_error.into();

        match px_error {
            PxError::Store(StoreError::StudyNotFound { name }) => assert_eq!(name, "demo"),
            other => panic!("Expected Store error, got {other:?}"),
        }
    }

    #[test]
    fn test_macros() {
        let config_err = config_error!("n_trials ({}) must be >= n_jobs ({})", 2, 4);
        assert!(matches!(config_err, PxError::Config(ref m) if m.contains("n_jobs (4)")));

        let backend_err = backend_error!("disk {}", "full");
        assert_eq!(backend_err.to_string(), "Storage backend failure: disk full");
    }
}
