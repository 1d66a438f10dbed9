//! # Standardized Error Types
//!
//! The error type shared by the gateway's outbound calls. Besides a message it
//! records what kind of failure happened and whether trying again could help,
//! which is what the retry policy keys on.

use std::fmt;
use std::error::Error as StdError;
use std::io;
use serde::{Serialize, Deserialize};
use uuid::Uuid;
use chrono::{DateTime, Utc};

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The severity level of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Severity {
    /// Informational message, not an actual error
    Info,
    /// A minor issue that doesn't affect overall functionality
    Minor,
    /// A significant issue that may impact some functionality
    #[default]
    Major,
    /// A critical issue that severely impacts system functionality
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Minor => write!(f, "MINOR"),
            Severity::Major => write!(f, "MAJOR"),
            Severity::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Categorizes different kinds of errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Initialization or configuration error
    Initialization,
    /// Connection refused, reset or aborted before a response arrived
    Communication,
    /// Error in data validation
    Validation,
    /// Error decoding or transforming data
    Processing,
    /// The remote service answered with a non-success status
    External,
    /// The operation did not finish within its budget
    Timeout,
    /// Resource unavailable or service degraded
    Unavailable,
    /// Input/output error
    IO,
    /// Internal error
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Initialization => write!(f, "Initialization Error"),
            ErrorKind::Communication => write!(f, "Communication Error"),
            ErrorKind::Validation => write!(f, "Validation Error"),
            ErrorKind::Processing => write!(f, "Processing Error"),
            ErrorKind::External => write!(f, "External Service Error"),
            ErrorKind::Timeout => write!(f, "Timeout Error"),
            ErrorKind::Unavailable => write!(f, "Service Unavailable Error"),
            ErrorKind::IO => write!(f, "I/O Error"),
            ErrorKind::Internal => write!(f, "Internal Error"),
        }
    }
}

/// Core error type for outbound calls
///
/// `Clone` drops the opaque `cause`; everything else is structured and
/// serializable.
#[derive(Debug, Serialize, Deserialize)]
pub struct Error {
    /// A unique identifier for this error instance
    pub id: Uuid,
    /// The kind of error that occurred
    pub kind: ErrorKind,
    /// Detailed error message
    pub message: String,
    /// The time when the error occurred
    pub timestamp: DateTime<Utc>,
    /// Error severity level
    pub severity: Severity,
    /// The service the failing call was addressed to
    pub service: Option<String>,
    /// HTTP status returned by the remote side, if any
    pub status: Option<u16>,
    /// Additional context as key-value pairs
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    /// Underlying cause (not serialized)
    #[serde(skip)]
    pub cause: Option<Box<dyn StdError + Send + Sync>>,
    /// Flag indicating if this is a transient error that might succeed on retry
    pub transient: bool,
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind,
            message: self.message.clone(),
            timestamp: self.timestamp,
            severity: self.severity,
            service: self.service.clone(),
            status: self.status,
            context: self.context.clone(),
            cause: None,
            transient: self.transient,
        }
    }
}

impl Error {
    /// Creates a new error with the specified kind and message
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            severity: Severity::default(),
            service: None,
            status: None,
            context: serde_json::Map::new(),
            cause: None,
            transient: false,
        }
    }

    /// Sets the error severity
    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Sets the service name
    pub fn service<S: Into<String>>(mut self, service: S) -> Self {
        self.service = Some(service.into());
        self
    }

    /// Records the HTTP status the remote side answered with
    pub fn status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Adds context information to the error
    pub fn context<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.context.insert(key.into(), value);
        }
        self
    }

    /// Chains this error with its cause
    pub fn cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Marks this error as transient (can be retried)
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Returns true if this error is transient and might succeed on retry
    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.kind, self.message)?;

        if let Some(status) = self.status {
            write!(f, " (HTTP {})", status)?;
        }

        if let Some(service) = &self.service {
            write!(f, " [Service: {}]", service)?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause.as_ref().map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        let transient = is_connection_io_error(&err);
        let kind = if transient { ErrorKind::Communication } else { ErrorKind::IO };
        let error = Self::new(kind, err.to_string()).cause(err);
        if transient { error.transient() } else { error }
    }
}

/// True for the io error kinds that mean the connection itself failed
fn is_connection_io_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

/// Walks the source chain looking for a refused/reset connection
fn has_connection_failure(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            if is_connection_io_error(io_err) {
                return true;
            }
        }
        current = e.source();
    }
    false
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16());
        let connection_failure = err.is_connect() || has_connection_failure(&err);

        let kind = if err.is_timeout() {
            ErrorKind::Timeout
        } else if connection_failure {
            ErrorKind::Communication
        } else if status.is_some() {
            ErrorKind::External
        } else if err.is_decode() {
            ErrorKind::Processing
        } else {
            ErrorKind::Unavailable
        };

        let transient = err.is_timeout()
            || connection_failure
            || status.map_or(false, |s| s >= 500);

        let mut error = Self::new(kind, format!("HTTP request error: {}", err));
        if let Some(status) = status {
            error = error.status(status);
        }
        let error = error.cause(err);
        if transient { error.transient() } else { error }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Processing, format!("JSON error: {}", err)).cause(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let err = Error::new(ErrorKind::External, "upstream rejected request")
            .service("genomics")
            .status(503)
            .context("path", "/query")
            .severity(Severity::Minor);

        assert_eq!(err.kind, ErrorKind::External);
        assert_eq!(err.service, Some("genomics".to_string()));
        assert_eq!(err.status, Some(503));
        assert_eq!(err.severity, Severity::Minor);
        assert_eq!(err.context.get("path"), Some(&serde_json::json!("/query")));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_error_display() {
        let err = Error::new(ErrorKind::External, "bad gateway")
            .service("literature")
            .status(502);

        let display = format!("{}", err);
        assert!(display.contains("MAJOR"));
        assert!(display.contains("External Service Error"));
        assert!(display.contains("HTTP 502"));
        assert!(display.contains("Service: literature"));
    }

    #[test]
    fn test_connection_io_errors_are_transient() {
        let refused: Error = io::Error::new(io::ErrorKind::ConnectionRefused, "refused").into();
        assert_eq!(refused.kind, ErrorKind::Communication);
        assert!(refused.is_transient());

        let other: Error = io::Error::new(io::ErrorKind::NotFound, "missing").into();
        assert_eq!(other.kind, ErrorKind::IO);
        assert!(!other.is_transient());
    }

    #[test]
    fn test_clone_drops_cause() {
        let err = Error::new(ErrorKind::IO, "disk")
            .cause(io::Error::new(io::ErrorKind::Other, "inner"));
        assert!(err.source().is_some());
        assert!(err.clone().source().is_none());
    }
}
