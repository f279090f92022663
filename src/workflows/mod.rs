// Intake orchestration: the saga and its two sub-state-machines

pub mod fanout;
pub mod poll;
pub mod saga;
pub mod state;

use std::time::Duration;

use crate::gateway::Operation;
use crate::retry::{RetryPolicy, StepOptions};

pub use fanout::BoundedConversionFanout;
pub use poll::{DocumentPollLoop, PollBackoff, PollOutcome, PollProgress, PollState, PollStep};
pub use saga::{render_report, PatientIntakeSaga};
pub use state::{IntakeOutcome, IntakeState, SagaPhase};

/// Retry policy and deadline for each gateway operation.
pub fn step_options(operation: Operation) -> StepOptions {
    match operation {
        Operation::LookupPatient
        | Operation::CreateTask
        | Operation::UpdateTaskStatus
        | Operation::AppendReport
        | Operation::StoreConverted => {
            StepOptions::new(RetryPolicy::default(), Duration::from_secs(10))
        }
        // Search backends are slow to come back; give them more attempts.
        Operation::StartSearch => StepOptions::new(
            RetryPolicy::bounded(Duration::from_secs(1), Duration::from_secs(10), 10),
            Duration::from_secs(15),
        ),
        Operation::CheckStatus => StepOptions::new(
            RetryPolicy::bounded(Duration::from_millis(500), Duration::from_secs(5), 3),
            Duration::from_secs(5),
        ),
        Operation::DownloadAndExtract => StepOptions::new(
            RetryPolicy::bounded(Duration::from_secs(1), Duration::from_secs(10), 5),
            Duration::from_secs(30),
        ),
        Operation::ConvertFile => {
            StepOptions::new(RetryPolicy::default(), Duration::from_secs(30))
        }
    }
}
