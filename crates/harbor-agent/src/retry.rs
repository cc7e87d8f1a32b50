//! Exponential-backoff retry around "register and start heartbeating".
//!
//! The delay after attempt `n` is `base << n` with no jitter and no ceiling.
//! Without `max_attempts` the wrapper keeps trying forever with ever longer
//! waits; callers who need a bound set a cap or cancel the token.

use std::future::Future;
use std::time::Duration;

use harbor_core::feedback::{self, Feedback, FeedbackSender};
use harbor_core::{RegistryConfig, RegistryError, ServiceDescriptor};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const BASE_DELAY: Duration = Duration::from_secs(1);

/// `base << attempt`, saturating at `Duration::MAX`.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    2u32.checked_pow(attempt)
        .and_then(|factor| base.checked_mul(factor))
        .unwrap_or(Duration::MAX)
}

pub struct Retry<F> {
    effector: F,
    max_attempts: Option<u32>,
    base_delay: Duration,
    feedback: Option<FeedbackSender>,
}

impl<F, Fut, T> Retry<F>
where
    F: Fn(CancellationToken, ServiceDescriptor, RegistryConfig) -> Fut,
    Fut: Future<Output = Result<T, RegistryError>>,
{
    pub fn new(effector: F) -> Self {
        Self {
            effector,
            max_attempts: None,
            base_delay: BASE_DELAY,
            feedback: None,
        }
    }

    /// Give up after `attempts` tries. Zero means unbounded.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = (attempts > 0).then_some(attempts);
        self
    }

    pub fn base_delay(mut self, base: Duration) -> Self {
        self.base_delay = base;
        self
    }

    pub fn feedback(mut self, sender: FeedbackSender) -> Self {
        self.feedback = Some(sender);
        self
    }

    pub async fn run(
        &self,
        token: &CancellationToken,
        service: &ServiceDescriptor,
        config: &RegistryConfig,
    ) -> Result<T, RegistryError> {
        let mut attempt: u32 = 1;
        loop {
            if token.is_cancelled() {
                return Err(RegistryError::Cancelled);
            }

            metrics::counter!("harbor_registration_attempts_total").increment(1);
            let err = match (self.effector)(token.clone(), service.clone(), config.clone()).await {
                Ok(value) => {
                    info!(service = %service.name, attempt, "Registration succeeded");
                    self.emit(Feedback::info(format!("retry attempt {attempt} successful")));
                    return Ok(value);
                }
                Err(err) => err,
            };

            if !err.is_retryable() {
                warn!(service = %service.name, attempt, error = %err, "Registration failed permanently");
                self.emit(Feedback::failure(err.clone(), format!("retry attempt {attempt} failed permanently")));
                return Err(err);
            }
            if self.max_attempts.is_some_and(|max| attempt >= max) {
                warn!(service = %service.name, attempt, error = %err, "Registration attempts exhausted");
                self.emit(Feedback::failure(err.clone(), "all attempts used"));
                return Err(err);
            }

            let delay = backoff_delay(self.base_delay, attempt);
            warn!(service = %service.name, attempt, error = %err, delay = ?delay, "Registration failed, retrying");
            self.emit(Feedback::failure(
                err,
                format!("retry attempt {attempt} failed, repeat after {delay:?}"),
            ));

            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(RegistryError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt = attempt.saturating_add(1);
        }
    }

    fn emit(&self, record: Feedback) {
        feedback::emit(self.feedback.as_ref(), record);
    }
}
