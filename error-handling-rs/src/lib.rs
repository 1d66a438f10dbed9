//! # Error Handling Framework
//!
//! Shared error handling for the query gateway workspace:
//!
//! - A structured error type with kind, severity and a transient flag
//! - Classification of HTTP client failures into retryable categories
//! - One retry policy used by every outbound call site
//! - Structured logging initialization built on `tracing-subscriber`

pub mod types;
pub mod logging;
pub mod retry;

// Re-export commonly used types
pub use types::{Error, Result, ErrorKind, Severity};
pub use logging::{init_logging, LoggingConfig};
pub use retry::{RetryCategory, RetryConfig, RetryPolicy, RetryableError};
