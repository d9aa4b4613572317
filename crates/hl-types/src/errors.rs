use thiserror::Error;

/// Main error type for the Hyperlift system
#[derive(Error, Debug)]
pub enum HlError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Training error: {0}")]
    Training(#[from] TrainingError),

    #[error("External service error: {0}")]
    ExternalService(#[from] ExternalServiceError),

    #[error("Resolution error: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Data error: {0}")]
    Data(#[from] DataError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HlError {
    /// True for the error kinds that abort a whole search run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration(_) | Self::Training(_))
    }
}

/// Invalid configurations and search spaces
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    #[error("Unknown model family: {family}")]
    UnknownFamily { family: String },

    #[error("Missing parameter '{parameter}' for family {family}")]
    MissingParameter { family: String, parameter: String },

    #[error("Unexpected parameter '{parameter}' for family {family}")]
    UnexpectedParameter { family: String, parameter: String },

    #[error("Parameter '{parameter}' has the wrong type: expected {expected}")]
    WrongType { parameter: String, expected: String },

    #[error("Parameter '{parameter}' out of range: {message}")]
    OutOfRange { parameter: String, message: String },

    #[error("Invalid search space: {message}")]
    InvalidSpace { message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Failures while fitting or predicting
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TrainingError {
    #[error("Non-finite value in {what} at row {row}")]
    NonFinite { what: String, row: usize },

    #[error("Shape mismatch: {message}")]
    ShapeMismatch { message: String },

    #[error("Empty training data")]
    EmptyData,

    #[error("Linear system is singular (alpha = {alpha})")]
    Singular { alpha: f64 },

    #[error("Model has not been fitted")]
    NotFitted,

    #[error("Training failed: {0}")]
    Failed(String),
}

/// External collaborator that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Tracking,
    Registry,
    ObjectStore,
    Filesystem,
}

impl std::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Tracking => "tracking store",
            Self::Registry => "model registry",
            Self::ObjectStore => "object store",
            Self::Filesystem => "filesystem",
        };
        f.write_str(name)
    }
}

/// Tracking store, registry and object storage failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExternalServiceError {
    #[error("{service} call '{operation}' failed: {message}")]
    CallFailed {
        service: Service,
        operation: String,
        message: String,
    },

    #[error("{service} returned an unexpected response to '{operation}': {message}")]
    BadResponse {
        service: Service,
        operation: String,
        message: String,
    },

    #[error("Bucket already exists: {bucket}")]
    BucketAlreadyExists { bucket: String },

    #[error("Bucket not found: {bucket}")]
    BucketNotFound { bucket: String },

    #[error("Run not found: {run_id}")]
    RunNotFound { run_id: String },
}

impl ExternalServiceError {
    pub fn call(service: Service, operation: &str, message: impl ToString) -> Self {
        Self::CallFailed {
            service,
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }

    pub fn bad_response(service: Service, operation: &str, message: impl ToString) -> Self {
        Self::BadResponse {
            service,
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }
}

/// Best-run and best-model lookups that found nothing
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolutionError {
    #[error("No experiment found with name '{name}'")]
    ExperimentNotFound { name: String },

    #[error("No runs with metric '{metric}' found in experiment '{experiment}'")]
    NoRuns { experiment: String, metric: String },

    #[error("No versions registered for model '{model}'")]
    NoModelVersions { model: String },

    #[error("Run {run_id} is not registered under model '{model}'")]
    NotRegistered { model: String, run_id: String },

    #[error("Invalid model URI: {uri}")]
    InvalidModelUri { uri: String },
}

/// Data loading errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("Split not found: {0}")]
    SplitNotFound(String),

    #[error("Data parsing error: {message}")]
    ParseError { message: String },

    #[error("Invalid data shape: {message}")]
    InvalidShape { message: String },

    #[error("Target column '{column}' not found")]
    TargetColumnNotFound { column: String },

    #[error("Encoding error: {message}")]
    Encoding { message: String },
}

/// Result type alias for Hyperlift operations
pub type HlResult<T> = Result<T, HlError>;

/// Macro for creating generic configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::ConfigurationError::Invalid(format!($($arg)*))
    };
}

/// Macro for creating space validation errors
#[macro_export]
macro_rules! space_error {
    ($($arg:tt)*) => {
        $crate::ConfigurationError::InvalidSpace { message: format!($($arg)*) }
    };
}

/// Macro for creating shape mismatch errors
#[macro_export]
macro_rules! shape_error {
    ($($arg:tt)*) => {
        $crate::TrainingError::ShapeMismatch { message: format!($($arg)*) }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigurationError::UnknownFamily {
            family: "Lasso".to_string(),
        };
        assert_eq!(error.to_string(), "Unknown model family: Lasso");

        let error = ExternalServiceError::call(Service::ObjectStore, "upload_file", "timeout");
        assert!(error.to_string().contains("object store"));
        assert!(error.to_string().contains("upload_file"));
    }

    #[test]
    fn test_error_conversion() {
        let training = TrainingError::EmptyData;
        let err: HlError = training.into();
        assert!(matches!(err, HlError::Training(_)));
        assert!(err.is_fatal());

        let resolution: HlError = ResolutionError::NoModelVersions {
            model: "m".into(),
        }
        .into();
        assert!(!resolution.is_fatal());
    }

    #[test]
    fn test_macros() {
        let err = config_error!("bad budget: {}", 0);
        assert_eq!(err, ConfigurationError::Invalid("bad budget: 0".into()));
        let err = space_error!("family '{}' has no parameters", "Ridge");
        assert!(err.to_string().contains("Ridge"));
        let err = shape_error!("{} rows vs {} targets", 3, 4);
        assert!(err.to_string().contains("3 rows vs 4 targets"));
    }
}
