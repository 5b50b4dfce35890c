// src/utils/error.rs
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// Define specific error types for different parts of the application
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NavigationError {
    #[error("Navigation step timed out: {0}")]
    Timeout(String),

    #[error("Expected page element not found: {0}")]
    ElementNotFound(String), // Form layout changed or option not offered

    #[error("Transient network failure: {0}")]
    TransientNetwork(String), // Connection resets, 5xx, throttling

    #[error("Company not found at regulator: {0}")]
    CompanyNotFound(String),
}

impl NavigationError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NavigationError::Timeout(_) => ErrorKind::Timeout,
            NavigationError::ElementNotFound(_) => ErrorKind::ElementNotFound,
            NavigationError::TransientNetwork(_) => ErrorKind::TransientNetworkError,
            NavigationError::CompanyNotFound(_) => ErrorKind::CompanyNotFound,
        }
    }
}

impl From<reqwest::Error> for NavigationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            NavigationError::Timeout(err.to_string())
        } else {
            NavigationError::TransientNetwork(err.to_string())
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExtractError {
    #[error("Unknown taxonomy: {0}")]
    UnknownTaxonomy(String),

    #[error("Malformed table: {0}")]
    MalformedTable(String),
}

impl ExtractError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExtractError::UnknownTaxonomy(_) => ErrorKind::UnknownTaxonomy,
            ExtractError::MalformedTable(_) => ErrorKind::MalformedTable,
        }
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Could not read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid tax id '{0}'")]
    TaxId(String),
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error), // Automatically convert IO errors

    #[error("Navigation failed: {0}")]
    Navigation(#[from] NavigationError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Roster error: {0}")]
    Roster(String),

    #[error("{0} job(s) failed")]
    JobsFailed(usize),
}

/// Flat classification of why a job failed. Carried in results and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorKind {
    Timeout,
    ElementNotFound,
    TransientNetworkError,
    CompanyNotFound,
    UnknownTaxonomy,
    MalformedTable,
    PersistenceError,
}

impl ErrorKind {
    /// Only failures that can plausibly clear on their own are worth another request.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::TransientNetworkError)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Timeout => "Timeout",
            ErrorKind::ElementNotFound => "ElementNotFound",
            ErrorKind::TransientNetworkError => "TransientNetworkError",
            ErrorKind::CompanyNotFound => "CompanyNotFound",
            ErrorKind::UnknownTaxonomy => "UnknownTaxonomy",
            ErrorKind::MalformedTable => "MalformedTable",
            ErrorKind::PersistenceError => "PersistenceError",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_kinds_are_retryable() {
        assert!(ErrorKind::Timeout.is_retryable());
        assert!(ErrorKind::TransientNetworkError.is_retryable());
        assert!(!ErrorKind::ElementNotFound.is_retryable());
        assert!(!ErrorKind::CompanyNotFound.is_retryable());
        assert!(!ErrorKind::UnknownTaxonomy.is_retryable());
        assert!(!ErrorKind::MalformedTable.is_retryable());
    }

    #[test]
    fn test_navigation_error_kinds() {
        assert_eq!(NavigationError::Timeout("x".into()).kind(), ErrorKind::Timeout);
        assert_eq!(
            NavigationError::CompanyNotFound("1".into()).kind(),
            ErrorKind::CompanyNotFound
        );
    }
}
