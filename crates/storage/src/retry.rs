//! Retry with exponential backoff.
//!
//! Errors are classified through [`StorageError::transient_kind`]. The last
//! error is always returned unchanged so callers see the real failure.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{StorageError, TransientKind};

/// Upper bound on any single backoff delay.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Retry settings loaded from configuration.
///
/// Missing fields deserialize to their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Initial backoff delay in milliseconds.
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
            max_backoff_ms: MAX_RETRY_DELAY.as_millis() as u64,
        }
    }
}

/// When and how often to retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first. Always at least 1.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Transient kinds worth retrying. Empty means any error other than
    /// cancellation.
    pub retryable: Vec<TransientKind>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: MAX_RETRY_DELAY,
            retryable: Vec::new(),
        }
    }
}

impl RetryPolicy {
    /// Default policy narrowed to every [`TransientKind`].
    pub fn transient() -> Self {
        Self {
            retryable: TransientKind::ALL.to_vec(),
            ..Self::default()
        }
    }

    /// Transient policy built from configured settings.
    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.initial_backoff_ms),
            max_delay: Duration::from_millis(settings.max_backoff_ms),
            retryable: TransientKind::ALL.to_vec(),
        }
    }

    /// Set the maximum number of attempts. Values below 1 are raised to 1.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Set the base delay.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Set the delay cap.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Replace the allow-list of retryable kinds.
    pub fn with_retryable(mut self, kinds: impl IntoIterator<Item = TransientKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    /// Whether `err` qualifies for another attempt under this policy.
    pub fn is_retryable(&self, err: &StorageError) -> bool {
        if self.retryable.is_empty() {
            return !matches!(err, StorageError::Cancelled);
        }
        match err.transient_kind() {
            Some(kind) => self.retryable.contains(&kind),
            None => false,
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` is 1-based.
    ///
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent: u32 = attempt.saturating_sub(1).min(31);
        let delay: Duration = self
            .base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay);
        delay.min(self.max_delay)
    }
}

/// Runs fallible async operations under a [`RetryPolicy`].
///
/// Holds no state between calls.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Create an executor for `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// The policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or runs out of attempts.
    ///
    /// # Arguments
    /// * `name` - Operation name used in log lines
    /// * `operation` - Produces a fresh future per attempt
    ///
    /// # Returns
    /// The first success, or the last error unchanged.
    pub async fn execute<T, F, Fut>(&self, name: &str, mut operation: F) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let max_attempts: u32 = self.policy.max_attempts.max(1);
        let mut attempt: u32 = 1;

        loop {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= max_attempts || !self.policy.is_retryable(&err) {
                        return Err(err);
                    }

                    let delay: Duration = self.policy.delay_for_attempt(attempt);
                    log::debug!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        name,
                        attempt,
                        max_attempts,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Run `operation` under `policy`. See [`RetryExecutor::execute`].
pub async fn execute<T, F, Fut>(
    policy: &RetryPolicy,
    name: &str,
    operation: F,
) -> Result<T, StorageError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StorageError>>,
{
    RetryExecutor::new(policy.clone()).execute(name, operation).await
}
