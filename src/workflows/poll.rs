use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

use super::step_options;
use crate::config::SagaConfig;
use crate::errors::IntakeError;
use crate::gateway::{ActivityGateway, Operation, SearchJobId, SearchState};
use crate::retry::run_step;
use crate::shutdown::ShutdownSignal;

/// Exponential backoff between status checks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PollBackoff {
    pub initial: Duration,
    pub max: Duration,
    /// Upper bound of the random addend on each sleep
    pub jitter: Duration,
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(10),
            jitter: Duration::from_millis(250),
        }
    }
}

impl From<&SagaConfig> for PollBackoff {
    fn from(config: &SagaConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.poll_initial_backoff_ms),
            max: Duration::from_millis(config.poll_max_backoff_ms),
            jitter: Duration::from_millis(config.poll_jitter_ms),
        }
    }
}

/// The only poll state that survives a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollProgress {
    pub iterations: u32,
    pub backoff: Duration,
}

impl PollProgress {
    pub fn new(backoff: &PollBackoff) -> Self {
        Self {
            iterations: 0,
            backoff: backoff.initial,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    Polling,
    Found { archive_url: String },
    NotFound,
    GivenUp { reason: String },
}

impl PollState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PollState::Polling)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Found { archive_url: String },
    NotFound,
}

/// Result of one status check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStep {
    /// Still polling; sleep this long before the next check.
    Wait(Duration),
    Done(PollOutcome),
}

/// Polls a search job until it reaches a terminal status.
///
/// Each status check is a retried step of its own; the loop's backoff only
/// spaces out checks that succeeded but reported a non-terminal state. When the
/// status check exhausts its retries the loop moves to `GivenUp` and the
/// failure is returned to the caller.
pub struct DocumentPollLoop<'a> {
    gateway: &'a dyn ActivityGateway,
    job_id: SearchJobId,
    backoff: PollBackoff,
    progress: PollProgress,
    state: PollState,
    shutdown: ShutdownSignal,
}

impl<'a> DocumentPollLoop<'a> {
    pub fn new(
        gateway: &'a dyn ActivityGateway,
        job_id: SearchJobId,
        backoff: PollBackoff,
        shutdown: ShutdownSignal,
    ) -> Self {
        let progress = PollProgress::new(&backoff);
        Self::resume(gateway, job_id, backoff, progress, shutdown)
    }

    /// Continue a loop from saved progress.
    pub fn resume(
        gateway: &'a dyn ActivityGateway,
        job_id: SearchJobId,
        backoff: PollBackoff,
        progress: PollProgress,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            gateway,
            job_id,
            backoff,
            progress,
            state: PollState::Polling,
            shutdown,
        }
    }

    pub fn progress(&self) -> PollProgress {
        self.progress
    }

    pub fn state(&self) -> &PollState {
        &self.state
    }

    /// Run one status check and apply the transition it implies.
    pub async fn poll_once(&mut self) -> Result<PollStep, IntakeError> {
        if self.state.is_terminal() {
            return Err(IntakeError::Invariant(format!(
                "poll loop for job {} already finished in {:?}",
                self.job_id, self.state
            )));
        }

        let gateway = self.gateway;
        let job_id = &self.job_id;
        let checked = run_step(
            Operation::CheckStatus.name(),
            &step_options(Operation::CheckStatus),
            &self.shutdown,
            || gateway.check_status(job_id),
        )
        .await;

        let status = match checked {
            Ok(status) => status,
            Err(IntakeError::Cancelled) => return Err(IntakeError::Cancelled),
            Err(err) => {
                warn!(job_id = %self.job_id, iterations = self.progress.iterations, error = %err, "Giving up on search job");
                self.state = PollState::GivenUp {
                    reason: err.to_string(),
                };
                return Err(err);
            }
        };

        self.progress.iterations += 1;
        debug!(
            job_id = %self.job_id,
            iteration = self.progress.iterations,
            state = ?status.state,
            "Search job status"
        );

        match status.state {
            SearchState::Finished => match status.archive_url {
                Some(archive_url) => {
                    self.state = PollState::Found {
                        archive_url: archive_url.clone(),
                    };
                    Ok(PollStep::Done(PollOutcome::Found { archive_url }))
                }
                None => {
                    self.state = PollState::NotFound;
                    Ok(PollStep::Done(PollOutcome::NotFound))
                }
            },
            SearchState::Failed | SearchState::NotFound => {
                self.state = PollState::NotFound;
                Ok(PollStep::Done(PollOutcome::NotFound))
            }
            SearchState::Queued | SearchState::Running | SearchState::Unknown => {
                let delay = self.progress.backoff + self.jitter();
                self.progress.backoff = (self.progress.backoff * 2).min(self.backoff.max);
                Ok(PollStep::Wait(delay))
            }
        }
    }

    /// Poll to completion, sleeping between checks.
    pub async fn run(mut self) -> Result<PollOutcome, IntakeError> {
        loop {
            match self.poll_once().await? {
                PollStep::Wait(delay) => self.shutdown.sleep(delay).await?,
                PollStep::Done(outcome) => return Ok(outcome),
            }
        }
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.backoff.jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max_ms))
    }
}
