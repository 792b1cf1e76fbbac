//! Error types for the harvester
//!
//! This module defines the error hierarchy for the entire crate.
//! All public APIs return `Result<T, Error>` where Error is defined here.
//!
//! The variants double as the retry taxonomy: the predicates at the bottom
//! of `impl Error` decide which failures the retry policy may absorb.

use thiserror::Error;

/// Reason phrases for statuses that are never retried
pub const NO_RETRY_STATUSES: &[(u16, &str)] = &[
    (401, "Unauthorized"),
    (402, "Payment Required"),
    (403, "Forbidden"),
    (407, "Proxy Authentication Required"),
    (410, "Gone"),
];

/// The main error type for the harvester
#[derive(Error, Debug)]
pub enum Error {
    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid options for format '{format}': {message}")]
    InvalidOptions { format: String, message: String },

    #[error("Unknown source format: {format}")]
    UnknownFormat { format: String },

    #[error("Failed to parse YAML: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    // ============================================================================
    // HTTP Errors
    // ============================================================================
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server returned status {status}, {reason}")]
    NonRetryableStatus { status: u16, reason: String },

    #[error("Server returned invalid status {status}, with text response {body}")]
    InvalidStatus { status: u16, body: String },

    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ============================================================================
    // Data Errors
    // ============================================================================
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("XML parsing error: {message}")]
    XmlParse { message: String },

    #[error("Field '{path}' not found in response")]
    MissingField { path: String },

    #[error("Unexpected data: {message}")]
    UnexpectedData { message: String },

    #[error("Too much data: {message}")]
    TooMuchData { message: String },

    #[error("Zero items were harvested")]
    NoResults,

    // ============================================================================
    // Run Errors
    // ============================================================================
    #[error("Harvest was cancelled")]
    Cancelled,

    // ============================================================================
    // I/O Errors
    // ============================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a config error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create an invalid options error
    pub fn invalid_options(format: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidOptions {
            format: format.into(),
            message: message.into(),
        }
    }

    /// Create a status error, classifying terminal statuses
    pub fn status(status: u16, body: impl Into<String>) -> Self {
        match NO_RETRY_STATUSES.iter().find(|(code, _)| *code == status) {
            Some((_, reason)) => Self::NonRetryableStatus {
                status,
                reason: (*reason).to_string(),
            },
            None => Self::InvalidStatus {
                status,
                body: body.into(),
            },
        }
    }

    /// Create an XML parse error
    pub fn xml(message: impl Into<String>) -> Self {
        Self::XmlParse {
            message: message.into(),
        }
    }

    /// Create a missing field error
    pub fn missing_field(path: impl Into<String>) -> Self {
        Self::MissingField { path: path.into() }
    }

    /// Create an unexpected data error
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::UnexpectedData {
            message: message.into(),
        }
    }

    /// Create a too much data error
    pub fn too_much_data(message: impl Into<String>) -> Self {
        Self::TooMuchData {
            message: message.into(),
        }
    }

    /// Transport failures, timeouts and retryable statuses
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http(e) => !e.is_builder(),
            Error::Timeout { .. } | Error::InvalidStatus { .. } => true,
            _ => false,
        }
    }

    /// Malformed response bodies
    pub fn is_parse(&self) -> bool {
        matches!(self, Error::JsonParse(_) | Error::XmlParse { .. })
    }

    /// Expected content missing from a well-formed response
    pub fn is_extraction(&self) -> bool {
        matches!(self, Error::MissingField { .. })
    }

    /// Errors a multi-section harvest may absorb as a soft failure
    ///
    /// Network and status failures plus a missing expected field. Malformed
    /// bodies are not absorbed.
    pub fn is_recoverable(&self) -> bool {
        self.is_transient() || self.is_extraction()
    }

    /// HTTP status carried by this error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::NonRetryableStatus { status, .. } | Error::InvalidStatus { status, .. } => {
                Some(*status)
            }
            Error::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Result type alias for the harvester
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::config("test message");
        assert_eq!(err.to_string(), "Configuration error: test message");

        let err = Error::status(403, "ignored");
        assert_eq!(err.to_string(), "Server returned status 403, Forbidden");

        let err = Error::status(500, "boom");
        assert_eq!(
            err.to_string(),
            "Server returned invalid status 500, with text response boom"
        );
    }

    #[test]
    fn test_status_classification() {
        for code in [401, 402, 403, 407, 410] {
            let err = Error::status(code, "");
            assert!(matches!(err, Error::NonRetryableStatus { .. }));
            assert!(!err.is_transient());
            assert_eq!(err.status_code(), Some(code));
        }

        for code in [400, 404, 429, 500, 503] {
            let err = Error::status(code, "");
            assert!(matches!(err, Error::InvalidStatus { .. }));
            assert!(err.is_transient());
        }
    }

    #[test]
    fn test_retry_predicates() {
        assert!(Error::Timeout { timeout_ms: 1000 }.is_transient());
        assert!(Error::xml("bad").is_parse());
        assert!(Error::missing_field("hits.hits").is_extraction());

        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(Error::from(json_err).is_parse());

        assert!(Error::status(502, "").is_recoverable());
        assert!(Error::missing_field("OAI-PMH.ListRecords").is_recoverable());
        assert!(!Error::xml("bad").is_recoverable());
        assert!(!Error::status(403, "").is_recoverable());
        assert!(!Error::too_much_data("x").is_recoverable());
        assert!(!Error::unexpected("x").is_recoverable());
        assert!(!Error::NoResults.is_recoverable());
        assert!(!Error::Cancelled.is_recoverable());
    }
}
