use governor::{Quota, RateLimiter};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::errors::IntakeError;
use crate::shutdown::ShutdownSignal;
use crate::workflows::{IntakeOutcome, PatientIntakeSaga};

/// Tally of a batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub found: usize,
    pub not_found: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl BatchSummary {
    pub fn total(&self) -> usize {
        self.found + self.not_found + self.failed + self.cancelled
    }
}

/// Synthetic patient id in the directory's `P#####` format.
pub fn random_patient_id() -> String {
    format!("P{:05}", rand::rng().random_range(0..100_000))
}

/// Start `count` sagas at `rate` per second and wait for all of them.
pub async fn run_batch(
    saga: Arc<PatientIntakeSaga>,
    count: usize,
    rate: f64,
    shutdown: &ShutdownSignal,
) -> Result<BatchSummary, IntakeError> {
    if !(rate.is_finite() && rate > 0.0) {
        return Err(IntakeError::Config(format!(
            "start rate must be a positive number, got {rate}"
        )));
    }
    let quota = Quota::with_period(Duration::from_secs_f64(1.0 / rate))
        .ok_or_else(|| IntakeError::Config(format!("start rate {rate}/s is too high")))?;
    let limiter = RateLimiter::direct(quota);

    info!(count, rate, "Starting intake batch");
    let mut set = JoinSet::new();
    for _ in 0..count {
        tokio::select! {
            _ = limiter.until_ready() => {}
            _ = shutdown.triggered() => break,
        }
        let saga = saga.clone();
        let patient_id = random_patient_id();
        set.spawn(async move { saga.run(&patient_id).await });
    }

    let mut summary = BatchSummary::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(state)) => match state.outcome() {
                Some(IntakeOutcome::Found) => summary.found += 1,
                Some(IntakeOutcome::NotFound) => summary.not_found += 1,
                None => summary.failed += 1,
            },
            Ok(Err(IntakeError::Cancelled)) => summary.cancelled += 1,
            Ok(Err(err)) => {
                warn!(error = %err, "Intake failed");
                summary.failed += 1;
            }
            Err(err) => {
                warn!(error = %err, "Intake task panicked");
                summary.failed += 1;
            }
        }
    }

    info!(
        found = summary.found,
        not_found = summary.not_found,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "Intake batch finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::InMemoryCheckpointStore;
    use crate::config::SagaConfig;
    use crate::gateway::{
        MockActivityGateway, PatientIdentity, SearchJobId, SearchState, SearchStatus, TaskId,
    };

    #[test]
    fn test_patient_id_format() {
        for _ in 0..100 {
            let id = random_patient_id();
            assert_eq!(id.len(), 6);
            assert!(id.starts_with('P'));
            assert!(id[1..].chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[tokio::test]
    async fn test_rejects_non_positive_rate() {
        let saga = Arc::new(PatientIntakeSaga::new(
            Arc::new(MockActivityGateway::new()),
            Arc::new(InMemoryCheckpointStore::new()),
            SagaConfig::default(),
            ShutdownSignal::never(),
        ));
        let result = run_batch(saga, 3, 0.0, &ShutdownSignal::never()).await;
        assert!(matches!(result, Err(IntakeError::Config(_))));
    }

    #[tokio::test]
    async fn test_batch_tallies_outcomes() {
        let mut gateway = MockActivityGateway::new();
        gateway.expect_lookup_patient().returning(|_| {
            Ok(PatientIdentity {
                first: "Pat01".to_string(),
                last: "Example".to_string(),
            })
        });
        gateway
            .expect_create_task()
            .returning(|patient_id, _| Ok(TaskId(format!("T-{patient_id}"))));
        gateway
            .expect_start_search()
            .returning(|_| Ok(SearchJobId::from("J1")));
        gateway
            .expect_check_status()
            .returning(|_| Ok(SearchStatus::new(SearchState::NotFound)));
        gateway.expect_update_task_status().returning(|_, _| Ok(()));
        gateway.expect_append_report().returning(|_, _| Ok(()));

        let saga = Arc::new(PatientIntakeSaga::new(
            Arc::new(gateway),
            Arc::new(InMemoryCheckpointStore::new()),
            SagaConfig::default(),
            ShutdownSignal::never(),
        ));

        let summary = run_batch(saga, 4, 200.0, &ShutdownSignal::never())
            .await
            .unwrap();

        assert_eq!(summary.not_found, 4);
        assert_eq!(summary.total(), 4);
    }
}
