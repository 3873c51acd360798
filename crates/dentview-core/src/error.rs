//! Error types for DentView

use std::path::PathBuf;

/// Result type alias using DentView's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for DentView operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Classifier execution errors
    #[error("classifier error: {0}")]
    Classifier(String),

    /// Image decoding or pixel processing errors
    #[error("image error: {0}")]
    Image(String),

    /// Training run errors (bad data directory, empty dataset, divergence)
    #[error("training error: {0}")]
    Training(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// The classifier has no trained parameters
    #[error("model not trained")]
    NotTrained,

    /// Persisted weights were not found at the expected path
    #[error("model weights not found: {}", .0.display())]
    WeightsMissing(PathBuf),

    /// Filesystem errors
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal errors
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new classifier error
    pub fn classifier(msg: impl Into<String>) -> Self {
        Self::Classifier(msg.into())
    }

    /// Create a new image error
    pub fn image(msg: impl Into<String>) -> Self {
        Self::Image(msg.into())
    }

    /// Create a new training error
    pub fn training(msg: impl Into<String>) -> Self {
        Self::Training(msg.into())
    }

    /// Create a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(Error::NotTrained.to_string(), "model not trained");
        assert_eq!(
            Error::training("no samples").to_string(),
            "training error: no samples"
        );

        let missing = Error::WeightsMissing(PathBuf::from("models/weights.safetensors"));
        assert_eq!(
            missing.to_string(),
            "model weights not found: models/weights.safetensors"
        );
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
