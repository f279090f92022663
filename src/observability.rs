use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Process-wide intake counters
#[derive(Debug, Default)]
pub struct IntakeMetrics {
    pub sagas_started: AtomicU64,
    pub sagas_found: AtomicU64,
    pub sagas_not_found: AtomicU64,
    pub sagas_failed: AtomicU64,
    pub admissions: AtomicU64,
    pub admission_timeouts: AtomicU64,
    pub step_retries: AtomicU64,
}

impl IntakeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_saga_started(&self) {
        self.sagas_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_saga_found(&self) {
        self.sagas_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_saga_not_found(&self) {
        self.sagas_not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_saga_failed(&self) {
        self.sagas_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admission(&self) {
        self.admissions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admission_timeout(&self) {
        self.admission_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.step_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> IntakeStats {
        IntakeStats {
            sagas_started: self.sagas_started.load(Ordering::Relaxed),
            sagas_found: self.sagas_found.load(Ordering::Relaxed),
            sagas_not_found: self.sagas_not_found.load(Ordering::Relaxed),
            sagas_failed: self.sagas_failed.load(Ordering::Relaxed),
            admissions: self.admissions.load(Ordering::Relaxed),
            admission_timeouts: self.admission_timeouts.load(Ordering::Relaxed),
            step_retries: self.step_retries.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            sagas_started = stats.sagas_started,
            found = stats.sagas_found,
            not_found = stats.sagas_not_found,
            failed = stats.sagas_failed,
            admissions = stats.admissions,
            admission_timeouts = stats.admission_timeouts,
            step_retries = stats.step_retries,
            "Intake metrics"
        );
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntakeStats {
    pub sagas_started: u64,
    pub sagas_found: u64,
    pub sagas_not_found: u64,
    pub sagas_failed: u64,
    pub admissions: u64,
    pub admission_timeouts: u64,
    pub step_retries: u64,
}

/// Global metrics instance
static INTAKE_METRICS: std::sync::LazyLock<IntakeMetrics> =
    std::sync::LazyLock::new(IntakeMetrics::new);

pub fn intake_metrics() -> &'static IntakeMetrics {
    &INTAKE_METRICS
}

/// Time an operation and log its duration on finish
pub struct OperationTimer {
    operation: String,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &str) -> Self {
        Self {
            operation: operation.to_string(),
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let duration = self.start.elapsed();
        info!(
            operation = %self.operation,
            duration_ms = duration.as_millis() as u64,
            "Operation completed"
        );
    }
}
