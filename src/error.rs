//! Error types for the Floodgate middleware.

use thiserror::Error;

use crate::mesh::ClusterError;
use crate::throttle::StoreError;

/// Boxed error returned by user-supplied resolver functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rule was rejected at registration time
    #[error("Invalid throttle rule '{rule}': {reason}")]
    InvalidRule { rule: String, reason: String },

    /// Two rules were registered under the same name
    #[error("Throttle rule '{0}' is already registered")]
    DuplicateRule(String),

    /// A discriminator, limit or period function failed
    #[error("Failed to resolve {field} for rule '{rule}': {source}")]
    Resolve {
        rule: String,
        field: &'static str,
        #[source]
        source: BoxError,
    },

    /// A dynamic limit resolved to zero
    #[error("Rule '{rule}' resolved a non-positive limit")]
    InvalidLimit { rule: String },

    /// A dynamic period resolved to zero
    #[error("Rule '{rule}' resolved a non-positive period")]
    InvalidPeriod { rule: String },

    /// Counter store errors
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// Cluster errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
