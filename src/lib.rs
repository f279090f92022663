// Patient Intake Library - document intake saga with distributed admission control
// This exposes the core components for testing and integration

pub mod admission;
pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod loader;
pub mod observability;
pub mod retry;
pub mod shutdown;
pub mod telemetry;
pub mod workflows;

// Re-export key types for easy access
pub use admission::{
    build_admission, AdmissionChannel, AdmissionController, ChannelAdmission,
    InMemoryAdmissionChannel, NullAdmission, RateKey, TokenDripper, TokenId,
};
pub use checkpoint::{CheckpointStore, FileCheckpointStore, InMemoryCheckpointStore, IntakeCheckpoint};
pub use config::{IntakeConfig, LimiterMode};
pub use errors::IntakeError;
pub use gateway::{ActivityGateway, HttpActivityGateway, Operation, TaskStatus};
pub use loader::{run_batch, BatchSummary};
pub use observability::{intake_metrics, IntakeMetrics, OperationTimer};
pub use retry::{run_step, RetryPolicy, StepOptions};
pub use shutdown::{ShutdownCoordinator, ShutdownSignal};
pub use telemetry::{create_saga_span, generate_correlation_id, init_telemetry};
pub use workflows::{
    BoundedConversionFanout, DocumentPollLoop, IntakeOutcome, IntakeState, PatientIntakeSaga,
};
