// Step execution with retry, backoff and schedule-to-close deadlines.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;
use tracing::{debug, error, warn};

use crate::errors::IntakeError;
use crate::observability::intake_metrics;
use crate::shutdown::ShutdownSignal;

/// Retry schedule for one kind of step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub backoff_coefficient: u64,
    /// `None` retries until the step's schedule-to-close deadline.
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(100),
            backoff_coefficient: 2,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn bounded(initial_interval: Duration, max_interval: Duration, max_attempts: u32) -> Self {
        Self {
            initial_interval,
            max_interval,
            backoff_coefficient: 2,
            max_attempts: Some(max_attempts.max(1)),
        }
    }

    /// Sleeps between attempts: `initial`, then `initial * coefficient^n`,
    /// capped at `max_interval`. Unbounded; callers apply the attempt budget.
    pub fn backoff(&self) -> impl Iterator<Item = Duration> {
        let initial_ms = self.initial_interval.as_millis().min(u64::MAX as u128) as u64;
        let max = self.max_interval;
        std::iter::once(self.initial_interval).chain(
            ExponentialBackoff::from_millis(self.backoff_coefficient.max(1))
                .factor(initial_ms.max(1))
                .max_delay(max),
        )
        .map(move |delay| delay.min(max))
    }

    /// Number of retries after the first attempt.
    fn retries(&self) -> usize {
        self.max_attempts
            .map_or(usize::MAX, |max| max.saturating_sub(1) as usize)
    }
}

/// Policy plus the deadline bounding the whole step, retries included.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOptions {
    pub policy: RetryPolicy,
    pub schedule_to_close: Duration,
}

impl StepOptions {
    pub fn new(policy: RetryPolicy, schedule_to_close: Duration) -> Self {
        Self {
            policy,
            schedule_to_close,
        }
    }
}

/// Run `operation` as a named step: every attempt is bounded by the time left
/// before the deadline, retryable failures back off per the policy, and the
/// caller only ever sees success or a terminal failure.
pub async fn run_step<T, F, Fut>(
    step: &str,
    options: &StepOptions,
    shutdown: &ShutdownSignal,
    mut operation: F,
) -> Result<T, IntakeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, IntakeError>>,
{
    shutdown.check()?;

    let deadline = Instant::now() + options.schedule_to_close;
    let attempts = AtomicU32::new(0);

    // A retry is only scheduled if its sleep ends before the deadline.
    let strategy = options
        .policy
        .backoff()
        .take(options.policy.retries())
        .take_while(|delay| Instant::now() + *delay < deadline)
        .map(|delay| {
            warn!(
                step,
                attempt = attempts.load(Ordering::SeqCst),
                delay_ms = delay.as_millis() as u64,
                "Step failed (retryable), backing off"
            );
            intake_metrics().record_retry();
            delay
        });

    let action = || {
        let attempt = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let call = operation();
        async move {
            let result = match tokio::time::timeout(remaining, call).await {
                Ok(result) => result,
                Err(_) => Err(IntakeError::transient(
                    step,
                    format!("attempt timed out after {remaining:?}"),
                )),
            };
            if let Err(err) = &result {
                debug!(step, attempt, error = %err, "Step attempt failed");
            }
            result
        }
    };

    let retried = RetryIf::spawn(strategy, action, |err: &IntakeError| err.is_retryable());
    let result = tokio::select! {
        result = retried => result,
        _ = shutdown.triggered() => return Err(IntakeError::Cancelled),
    };

    let attempt = attempts.load(Ordering::SeqCst);
    let err = match result {
        Ok(value) => {
            if attempt > 1 {
                debug!(step, attempt, "Step succeeded after retry");
            }
            return Ok(value);
        }
        Err(IntakeError::Cancelled) => return Err(IntakeError::Cancelled),
        Err(err) => err,
    };

    let reason = if !err.is_retryable() {
        error!(step, attempt, error = %err, "Step failed (non-retryable)");
        match err {
            IntakeError::UnrecoverableRemoteFailure { reason, .. } => reason,
            other => other.to_string(),
        }
    } else if options
        .policy
        .max_attempts
        .is_some_and(|max| attempt >= max)
    {
        error!(step, attempt, error = %err, "Step retry budget exhausted");
        format!("retry budget exhausted: {err}")
    } else {
        error!(step, attempt, error = %err, "Step schedule-to-close deadline reached");
        format!(
            "schedule-to-close timeout of {:?} reached: {err}",
            options.schedule_to_close
        )
    };

    Err(IntakeError::UnrecoverableRemoteFailure {
        step: step.to_string(),
        attempts: attempt,
        reason,
    })
}
