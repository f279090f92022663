use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn, Instrument};

use super::fanout::BoundedConversionFanout;
use super::poll::{DocumentPollLoop, PollBackoff, PollOutcome, PollProgress, PollStep};
use super::state::{IntakeOutcome, IntakeState, SagaPhase};
use super::step_options;
use crate::checkpoint::{CheckpointStore, IntakeCheckpoint};
use crate::config::SagaConfig;
use crate::errors::IntakeError;
use crate::gateway::{ActivityGateway, ConvertedRef, Operation, TaskId, TaskStatus};
use crate::observability::{intake_metrics, OperationTimer};
use crate::retry::run_step;
use crate::shutdown::ShutdownSignal;
use crate::telemetry::{create_saga_span, generate_correlation_id};

const COMPENSATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Report appended to the tracking task: one converted reference per line.
pub fn render_report(converted: &[ConvertedRef]) -> String {
    converted
        .iter()
        .map(ConvertedRef::as_str)
        .collect::<Vec<_>>()
        .join("\n")
}

/// Top-level intake state machine for one patient.
///
/// Phases run strictly in order; after every completed step the checkpoint is
/// saved, so a run that was cancelled or crashed picks up from the step after
/// the last one that finished.
pub struct PatientIntakeSaga {
    gateway: Arc<dyn ActivityGateway>,
    checkpoints: Arc<dyn CheckpointStore>,
    config: SagaConfig,
    shutdown: ShutdownSignal,
}

impl PatientIntakeSaga {
    pub fn new(
        gateway: Arc<dyn ActivityGateway>,
        checkpoints: Arc<dyn CheckpointStore>,
        config: SagaConfig,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            gateway,
            checkpoints,
            config,
            shutdown,
        }
    }

    /// Run (or resume) the intake for `patient_id` to a terminal outcome.
    pub async fn run(&self, patient_id: &str) -> Result<IntakeState, IntakeError> {
        let correlation_id = generate_correlation_id();
        let span = create_saga_span(patient_id, &correlation_id);
        self.execute(patient_id).instrument(span).await
    }

    async fn execute(&self, patient_id: &str) -> Result<IntakeState, IntakeError> {
        let timer = OperationTimer::new("patient_intake");
        intake_metrics().record_saga_started();

        let mut checkpoint = match self.checkpoints.load(patient_id).await? {
            Some(saved) => {
                info!(phase = ?saved.phase, "Resuming intake from checkpoint");
                saved
            }
            None => IntakeCheckpoint::new(patient_id),
        };

        let result = self.advance(&mut checkpoint).await;
        timer.finish();

        match result {
            Ok(()) => {
                if let Err(clear_err) = self.checkpoints.clear(patient_id).await {
                    warn!(error = %clear_err, "Failed to clear checkpoint of finished intake");
                }
                match checkpoint.state.outcome() {
                    Some(IntakeOutcome::Found) => intake_metrics().record_saga_found(),
                    Some(IntakeOutcome::NotFound) => intake_metrics().record_saga_not_found(),
                    None => {}
                }
                info!(
                    outcome = ?checkpoint.state.outcome(),
                    converted = checkpoint.state.converted().len(),
                    "Intake complete"
                );
                Ok(checkpoint.state)
            }
            Err(IntakeError::Cancelled) => {
                // Checkpoint stays behind for the next run to resume.
                warn!(phase = ?checkpoint.phase, "Intake cancelled");
                Err(IntakeError::Cancelled)
            }
            Err(err) => {
                intake_metrics().record_saga_failed();
                error!(phase = ?checkpoint.phase, error = %err, "Intake aborted");
                if self.config.compensate_on_failure {
                    if let Some(task_id) = checkpoint.state.task_id() {
                        self.compensate(task_id).await;
                    }
                }
                if let Err(clear_err) = self.checkpoints.clear(patient_id).await {
                    warn!(error = %clear_err, "Failed to clear checkpoint of aborted intake");
                }
                Err(err)
            }
        }
    }

    /// Mark the task failed. Best effort: one attempt, errors only logged.
    async fn compensate(&self, task_id: &TaskId) {
        let attempt = tokio::time::timeout(
            COMPENSATION_TIMEOUT,
            self.gateway
                .update_task_status(task_id, TaskStatus::IntakeFailed),
        )
        .await;
        match attempt {
            Ok(Ok(())) => info!(task_id = %task_id, "Task marked as failed"),
            Ok(Err(err)) => warn!(task_id = %task_id, error = %err, "Could not mark task as failed"),
            Err(_) => warn!(task_id = %task_id, "Timed out marking task as failed"),
        }
    }

    async fn save(&self, checkpoint: &mut IntakeCheckpoint) -> Result<(), IntakeError> {
        checkpoint.updated_at = Utc::now();
        self.checkpoints.save(checkpoint).await
    }

    async fn advance(&self, checkpoint: &mut IntakeCheckpoint) -> Result<(), IntakeError> {
        let gateway = self.gateway.as_ref();
        let shutdown = &self.shutdown;

        loop {
            self.shutdown.check()?;
            let phase = checkpoint.phase;
            let state = &mut checkpoint.state;

            let next = match phase {
                SagaPhase::Start => {
                    let patient_id = state.patient_id().to_string();
                    let identity = self
                        .step(Operation::LookupPatient, || gateway.lookup_patient(&patient_id))
                        .await?;
                    state.set_identity(identity)?;
                    SagaPhase::Identity
                }
                SagaPhase::Identity => {
                    let patient_id = state.patient_id().to_string();
                    let identity = state.identity()?.clone();
                    let task_id = self
                        .step(Operation::CreateTask, || {
                            gateway.create_task(&patient_id, &identity)
                        })
                        .await?;
                    info!(task_id = %task_id, "Tracking task created");
                    state.set_task_id(task_id)?;
                    SagaPhase::TaskCreated
                }
                SagaPhase::TaskCreated => {
                    let identity = state.identity()?.clone();
                    let job_id = self
                        .step(Operation::StartSearch, || gateway.start_search(&identity))
                        .await?;
                    info!(job_id = %job_id, "Document search started");
                    state.set_search_job_id(job_id)?;
                    SagaPhase::Searching
                }
                SagaPhase::Searching => {
                    checkpoint.poll = Some(PollProgress::new(&PollBackoff::from(&self.config)));
                    SagaPhase::Polling
                }
                SagaPhase::Polling => {
                    let outcome = self.poll(checkpoint).await?;
                    checkpoint.poll = None;
                    match outcome {
                        PollOutcome::Found { archive_url } => {
                            checkpoint.state.set_archive_url(archive_url)?;
                            SagaPhase::Downloading
                        }
                        PollOutcome::NotFound => SagaPhase::NotFoundBranch,
                    }
                }
                SagaPhase::NotFoundBranch => {
                    self.finalize(checkpoint, TaskStatus::DocumentsNotFound, IntakeOutcome::NotFound)
                        .await?;
                    SagaPhase::Done
                }
                SagaPhase::Downloading => {
                    let archive_url = state
                        .archive_url()
                        .ok_or_else(|| {
                            IntakeError::Invariant("downloading without an archive".to_string())
                        })?
                        .to_string();
                    let files = self
                        .step(Operation::DownloadAndExtract, || {
                            gateway.download_and_extract(&archive_url)
                        })
                        .await?;
                    info!(files = files.len(), "Archive downloaded");
                    state.set_files(files)?;
                    SagaPhase::Converting
                }
                SagaPhase::Converting => {
                    let files = state.files()?.to_vec();
                    let fanout = BoundedConversionFanout::new(
                        self.gateway.clone(),
                        self.config.conversion_concurrency,
                        shutdown.clone(),
                    );
                    let converted = fanout.run(files).await?;
                    state.extend_converted(converted)?;
                    SagaPhase::Finalizing
                }
                SagaPhase::Finalizing => {
                    self.finalize(checkpoint, TaskStatus::DocumentsFound, IntakeOutcome::Found)
                        .await?;
                    SagaPhase::Done
                }
                SagaPhase::Done => return Ok(()),
            };

            checkpoint.phase = next;
            self.save(checkpoint).await?;
        }
    }

    async fn step<T, F, Fut>(&self, operation: Operation, call: F) -> Result<T, IntakeError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, IntakeError>>,
    {
        run_step(
            operation.name(),
            &step_options(operation),
            &self.shutdown,
            call,
        )
        .await
    }

    /// Drive the poll loop, saving its progress between iterations.
    async fn poll(&self, checkpoint: &mut IntakeCheckpoint) -> Result<PollOutcome, IntakeError> {
        let backoff = PollBackoff::from(&self.config);
        let progress = checkpoint
            .poll
            .unwrap_or_else(|| PollProgress::new(&backoff));
        let mut poll = DocumentPollLoop::resume(
            self.gateway.as_ref(),
            checkpoint.state.search_job_id()?.clone(),
            backoff,
            progress,
            self.shutdown.clone(),
        );

        loop {
            match poll.poll_once().await? {
                PollStep::Wait(delay) => {
                    checkpoint.poll = Some(poll.progress());
                    self.save(checkpoint).await?;
                    self.shutdown.sleep(delay).await?;
                }
                PollStep::Done(outcome) => return Ok(outcome),
            }
        }
    }

    /// Closing status update, then the report. The status update is
    /// checkpointed on its own so a resumed run does not repeat it.
    async fn finalize(
        &self,
        checkpoint: &mut IntakeCheckpoint,
        status: TaskStatus,
        outcome: IntakeOutcome,
    ) -> Result<(), IntakeError> {
        let gateway = self.gateway.as_ref();
        let task_id = checkpoint
            .state
            .task_id()
            .cloned()
            .ok_or_else(|| IntakeError::Invariant("finalizing without a task".to_string()))?;

        if !checkpoint.status_recorded {
            self.step(Operation::UpdateTaskStatus, || {
                gateway.update_task_status(&task_id, status)
            })
            .await?;
            checkpoint.status_recorded = true;
            self.save(checkpoint).await?;
        }

        let report = render_report(checkpoint.state.converted());
        self.step(Operation::AppendReport, || gateway.append_report(&task_id, &report))
            .await?;
        info!(task_id = %task_id, status = %status, "Report appended");

        checkpoint.state.set_outcome(outcome)
    }
}
