use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// `min(2^n + 0.1 * n, max)` seconds after the n-th failure.
    Exponential { max: Duration },
    /// Resend straight away.
    Immediate,
}

/// How many times an operation is attempted and how long to wait between
/// attempts. Which errors are worth another attempt is decided per call site
/// by the classifier passed to [`RetryPolicy::run`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    max_attempts: u32,
    backoff: Backoff,
}

#[derive(Debug)]
pub struct RetryFailure<E> {
    pub attempts: u32,
    /// `false` when the classifier rejected the error before the cap was hit.
    pub exhausted: bool,
    pub error: E,
}

impl RetryPolicy {
    pub fn exponential(max_attempts: u32, max_backoff: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential { max: max_backoff },
        }
    }

    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Immediate,
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay_after(&self, failures: u32) -> Duration {
        match self.backoff {
            Backoff::Immediate => Duration::ZERO,
            Backoff::Exponential { max } => {
                let exp = 2f64.powi(failures.min(62) as i32);
                let secs = exp + 0.1 * f64::from(failures);
                Duration::from_secs_f64(secs.min(max.as_secs_f64()))
            }
        }
    }

    pub async fn run<T, E, F, Fut>(
        &self,
        operation: &str,
        is_retryable: impl Fn(&E) -> bool,
        mut attempt: F,
    ) -> Result<T, RetryFailure<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut failures = 0u32;
        loop {
            if failures > 0 {
                let delay = self.delay_after(failures);
                tracing::warn!(
                    operation,
                    attempt = failures + 1,
                    max_attempts = self.max_attempts,
                    delay_secs = delay.as_secs_f64(),
                    "retrying"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            match attempt(failures + 1).await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    failures += 1;
                    tracing::error!(operation, attempt = failures, error = %err, "attempt failed");
                    if !is_retryable(&err) {
                        return Err(RetryFailure {
                            attempts: failures,
                            exhausted: false,
                            error: err,
                        });
                    }
                    if failures >= self.max_attempts {
                        return Err(RetryFailure {
                            attempts: failures,
                            exhausted: true,
                            error: err,
                        });
                    }
                }
            }
        }
    }
}
