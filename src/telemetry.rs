use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::config::ObservabilityConfig;

/// Initialize structured logging. `RUST_LOG` wins over the configured level.
pub fn init_telemetry(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))?;

    if config.json_logs {
        tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true),
            )
            .with(filter)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer().compact())
            .with(filter)
            .try_init()?;
    }

    tracing::info!("Patient intake telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking the steps of one saga run
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span wrapping every step of one saga run
pub fn create_saga_span(patient_id: &str, correlation_id: &str) -> tracing::Span {
    tracing::info_span!(
        "patient_intake",
        patient.id = patient_id,
        correlation.id = correlation_id,
        otel.kind = "internal"
    )
}
