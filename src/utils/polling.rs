/// Polling utilities for waiting on conditions with a deadline
use anyhow::Result;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::info;

/// Outcome of a soft-deadline wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Condition was met within the deadline
    Ready,
    /// Deadline elapsed without the condition being met
    DeadlineElapsed,
}

/// Configuration for polling operations
pub struct Poller {
    pub deadline: Duration,
    pub interval: Duration,
    pub description: String,
}

impl Poller {
    /// Create a new poller
    pub fn new(deadline: Duration, interval: Duration, description: impl Into<String>) -> Self {
        Self {
            deadline,
            interval,
            description: description.into(),
        }
    }

    /// Poll until the condition yields a value or the deadline elapses
    ///
    /// The condition function should return:
    /// - Ok(Some(T)) when the condition is met (returns T)
    /// - Ok(None) when the condition is not yet met (continues polling)
    /// - Err(e) when an unrecoverable error occurs (stops polling)
    #[allow(dead_code)]
    pub async fn poll<F, Fut, T>(&self, condition: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<Option<T>>>,
    {
        info!("{}...", self.description);

        let start = Instant::now();

        loop {
            match condition().await {
                Ok(Some(value)) => {
                    info!("✓ {}", self.description);
                    return Ok(value);
                }
                Ok(None) => {
                    // Continue polling
                }
                Err(e) => {
                    return Err(e);
                }
            }

            if start.elapsed() > self.deadline {
                anyhow::bail!(
                    "Timeout after {} seconds: {}",
                    self.deadline.as_secs(),
                    self.description
                );
            }

            tokio::time::sleep(self.interval).await;
        }
    }

    /// Poll a boolean probe until it reports ready or the deadline elapses
    ///
    /// Deadline expiry is reported as a value rather than an error; probe
    /// failures are treated as "not yet ready" and polling continues, since
    /// a target that is still coming up routinely refuses connections.
    pub async fn poll_ready<F, Fut>(&self, probe: F) -> WaitOutcome
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        info!("{}...", self.description);

        let start = Instant::now();

        loop {
            if probe().await {
                info!("✓ {}", self.description);
                return WaitOutcome::Ready;
            }

            if start.elapsed() > self.deadline {
                return WaitOutcome::DeadlineElapsed;
            }

            tokio::time::sleep(self.interval).await;
        }
    }
}
