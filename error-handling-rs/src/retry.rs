//! # Retry Mechanism
//!
//! A single retry policy for outbound calls. Which failures are worth another
//! attempt is decided by [`RetryCategory`]; everything else fails fast. The
//! dispatcher uses it with one retry on connection failures, the readiness
//! gate uses its own exponential schedule on top of whole probe rounds.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use metrics::increment_counter;
use serde::{Serialize, Deserialize};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::types::{Error, ErrorKind};

/// A trait for errors that can be retried
pub trait RetryableError {
    /// Returns true if the error is transient and the operation might succeed on retry
    fn is_transient(&self) -> bool;

    /// Error categorization used to match against a policy's retry list
    fn categorize(&self) -> RetryCategory {
        RetryCategory::Normal
    }
}

/// Categories of errors for different retry strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryCategory {
    /// Standard transient error
    Normal,
    /// Timeout
    Timeout,
    /// Connection refused or reset
    Connectivity,
    /// Server error
    Server,
    /// Client error (likely not retriable)
    Client,
    /// Unavailable or maintenance
    Unavailable,
}

impl RetryableError for Error {
    fn is_transient(&self) -> bool {
        self.transient
    }

    fn categorize(&self) -> RetryCategory {
        match self.kind {
            ErrorKind::Timeout => RetryCategory::Timeout,
            ErrorKind::Communication => RetryCategory::Connectivity,
            ErrorKind::External => match self.status {
                Some(status) if status >= 500 => RetryCategory::Server,
                _ => RetryCategory::Client,
            },
            ErrorKind::Unavailable => RetryCategory::Unavailable,
            ErrorKind::Validation => RetryCategory::Client,
            _ => RetryCategory::Normal,
        }
    }
}

/// Configuration for a retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt
    pub max_retries: u32,

    /// Fixed pause between attempts
    pub backoff: Duration,

    /// Categories that are retried; anything else fails on the first attempt
    pub retry_on: Vec<RetryCategory>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            backoff: Duration::from_millis(200),
            retry_on: vec![RetryCategory::Connectivity],
        }
    }
}

impl fmt::Display for RetryConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RetryConfig {{ max_retries: {}, backoff: {:?}, retry_on: {:?} }}",
            self.max_retries, self.backoff, self.retry_on
        )
    }
}

/// A retry policy that determines how to handle retries
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Configuration for this policy
    config: RetryConfig,

    /// Name of the policy (for logs and metrics)
    name: String,
}

impl RetryPolicy {
    /// Creates a new retry policy with the given name and configuration
    pub fn new<S: Into<String>>(name: S, config: RetryConfig) -> Self {
        Self {
            config,
            name: name.into(),
        }
    }

    /// Creates a policy for operations that should never be retried
    pub fn never<S: Into<String>>(name: S) -> Self {
        Self::new(name, RetryConfig {
            max_retries: 0,
            ..RetryConfig::default()
        })
    }

    /// One retry after `backoff` on refused/reset connections, nothing else.
    /// Timeouts are deliberately absent from the list.
    pub fn transient_network<S: Into<String>>(name: S, backoff: Duration) -> Self {
        Self::new(name, RetryConfig {
            max_retries: 1,
            backoff,
            retry_on: vec![RetryCategory::Connectivity],
        })
    }

    /// Policy name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Maximum number of retries after the first attempt
    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    /// Pause between attempts
    pub fn backoff(&self) -> Duration {
        self.config.backoff
    }

    /// Checks if an error is retryable after `retries_done` retries
    pub fn is_retryable<E: RetryableError>(&self, error: &E, retries_done: u32) -> bool {
        if retries_done >= self.config.max_retries {
            return false;
        }

        error.is_transient() && self.config.retry_on.contains(&error.categorize())
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error, or
    /// the retry budget is spent. The closure receives the 1-based attempt
    /// number.
    pub async fn retry<F, Fut, T, E>(&self, operation_name: &str, mut operation: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: RetryableError + fmt::Display,
    {
        let mut retries_done = 0;

        loop {
            let attempt = retries_done + 1;
            match operation(attempt).await {
                Ok(value) => {
                    if retries_done > 0 {
                        debug!(
                            policy = %self.name,
                            operation = %operation_name,
                            attempt,
                            "Operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) if self.is_retryable(&err, retries_done) => {
                    warn!(
                        policy = %self.name,
                        operation = %operation_name,
                        attempt,
                        backoff_ms = %self.config.backoff.as_millis(),
                        error = %err,
                        "Retryable failure, retrying"
                    );
                    increment_counter!("retry_attempts_total", "policy" => self.name.clone());

                    sleep(self.config.backoff).await;
                    retries_done += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
