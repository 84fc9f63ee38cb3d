//! Error types for sessiongen

use thiserror::Error;

/// Main error type for core operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid phone number: {0}")]
    InvalidNumber(String),
}

/// Result type alias using the core Error
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an invalid number error
    pub fn invalid_number(reason: impl Into<String>) -> Self {
        Error::InvalidNumber(reason.into())
    }
}

/// Failure reported by a protocol client
///
/// Carries the upstream status code when the protocol layer supplied one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}{}", .status.map(|s| format!(" (statusCode: {s})")).unwrap_or_default())]
pub struct ProtocolError {
    pub status: Option<u16>,
    pub message: String,
}

impl ProtocolError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Classify this failure at the point where it was produced
    pub fn class(&self) -> ErrorClass {
        if let Some(status) = self.status {
            if let Some(class) = ErrorClass::from_status(status) {
                return class;
            }
        }
        classify(&self.to_string())
    }
}

/// How an upstream failure should be treated by a pairing session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Credentials were rejected; reconnecting cannot help
    LoggedOut,
    /// Network noise or a server-requested restart; reconnect
    Transient,
    /// Upstream throttling; reconnect after backing off
    RateLimited,
    /// Anything unrecognized
    Fatal,
}

/// Upstream messages known to be recoverable
const TRANSIENT_MARKERS: &[&str] = &[
    "conflict",
    "Socket connection timeout",
    "Connection Closed",
    "Timed Out",
    "Value not found",
    "Stream Errored",
    "statusCode: 515",
    "statusCode: 503",
];

impl ErrorClass {
    /// Map a protocol status code, if it is one we know
    pub fn from_status(status: u16) -> Option<Self> {
        match status {
            401 => Some(ErrorClass::LoggedOut),
            429 => Some(ErrorClass::RateLimited),
            408 | 428 | 440 | 500 | 503 | 515 => Some(ErrorClass::Transient),
            _ => None,
        }
    }

    /// Whether a session should open a new connection after this failure
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient | ErrorClass::RateLimited)
    }
}

/// Classify an upstream error message
pub fn classify(message: &str) -> ErrorClass {
    if message.contains("not-authorized") {
        ErrorClass::LoggedOut
    } else if message.contains("rate-overlimit") {
        ErrorClass::RateLimited
    } else if TRANSIENT_MARKERS.iter().any(|m| message.contains(m)) {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_noise_is_transient() {
        assert_eq!(classify("Stream Errored (restart required)"), ErrorClass::Transient);
        assert_eq!(classify("Error: Connection Closed"), ErrorClass::Transient);
        assert_eq!(classify("Boom { statusCode: 515 }"), ErrorClass::Transient);
        assert_eq!(classify("conflict: replaced"), ErrorClass::Transient);
    }

    #[test]
    fn test_auth_and_rate_limit() {
        assert_eq!(classify("stream:error not-authorized"), ErrorClass::LoggedOut);
        assert_eq!(classify("rate-overlimit"), ErrorClass::RateLimited);
        assert!(ErrorClass::RateLimited.is_retryable());
        assert!(!ErrorClass::LoggedOut.is_retryable());
    }

    #[test]
    fn test_unknown_is_fatal() {
        assert_eq!(classify("disk on fire"), ErrorClass::Fatal);
    }

    #[test]
    fn test_status_takes_precedence() {
        let err = ProtocolError::with_status(401, "Connection Closed");
        assert_eq!(err.class(), ErrorClass::LoggedOut);

        let err = ProtocolError::with_status(418, "Timed Out");
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[test]
    fn test_display_includes_status() {
        let err = ProtocolError::with_status(503, "Service Unavailable");
        assert_eq!(err.to_string(), "Service Unavailable (statusCode: 503)");
        assert_eq!(ProtocolError::new("plain").to_string(), "plain");
    }
}
