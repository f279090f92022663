use anyhow::Result;
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::admission::{parse_rates, RateKey};
use crate::errors::IntakeError;

/// Main configuration structure for the intake worker and dripper
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct IntakeConfig {
    /// Remote services the gateway talks to
    pub services: ServiceConfig,
    /// Admission control settings
    pub limiter: LimiterConfig,
    /// Token dripper settings
    pub dripper: DripperConfig,
    /// Saga tuning
    pub saga: SagaConfig,
    /// Observability settings
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Task tracker base URL
    pub tracker_url: String,
    /// Document exchange base URL
    pub docex_url: String,
    /// Where converted documents are stored
    pub storage_dir: PathBuf,
    /// Transport-level timeout for a single HTTP request
    pub request_timeout_ms: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            tracker_url: "http://localhost:9001".to_string(),
            docex_url: "http://localhost:9000".to_string(),
            storage_dir: PathBuf::from("./data/converted"),
            request_timeout_ms: 10_000,
        }
    }
}

/// How outbound calls are gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimiterMode {
    /// Everything is admitted immediately
    #[default]
    None,
    /// Calls wait for dripped tokens
    Dripper,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub mode: LimiterMode,
    /// Per-key rates, e.g. `docx:status=10/sec,docx:search_download=10/min`
    pub rates: String,
    /// Shared SQLite token log (needs the `database` feature)
    pub database_url: Option<String>,
    /// Newest tokens kept per key; bounds permits banked while idle
    pub retained_tokens: usize,
    /// Upper bound of the random delay after a successful admission
    pub release_jitter_ms: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            mode: LimiterMode::None,
            rates: "docx:status=10/sec,docx:search_download=10/min,tasktracker:writes=10/sec"
                .to_string(),
            database_url: None,
            retained_tokens: 1,
            release_jitter_ms: 20,
        }
    }
}

impl LimiterConfig {
    pub fn parsed_rates(&self) -> Result<Vec<(RateKey, Duration)>, IntakeError> {
        parse_rates(&self.rates)
    }

    pub fn release_jitter(&self) -> Duration {
        Duration::from_millis(self.release_jitter_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DripperConfig {
    /// Polling tick of the dripper loop
    pub tick_ms: u64,
    /// Emission jitter as a fraction of each key's interval (max 0.05)
    pub jitter_fraction: f64,
}

impl Default for DripperConfig {
    fn default() -> Self {
        Self {
            tick_ms: 20,
            jitter_fraction: 0.05,
        }
    }
}

impl DripperConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Maximum in-flight convert+store pipelines
    pub conversion_concurrency: usize,
    pub poll_initial_backoff_ms: u64,
    pub poll_max_backoff_ms: u64,
    /// Upper bound of the random addend on each poll sleep
    pub poll_jitter_ms: u64,
    /// Mark the task failed when a saga aborts after creating it
    pub compensate_on_failure: bool,
    /// Directory for saga checkpoints; in-memory when unset
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            conversion_concurrency: 6,
            poll_initial_backoff_ms: 500,
            poll_max_backoff_ms: 10_000,
            poll_jitter_ms: 250,
            compensate_on_failure: true,
            checkpoint_dir: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Default log filter when RUST_LOG is unset
    pub log_level: String,
    /// Emit JSON lines instead of human-readable logs
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl IntakeConfig {
    /// Load configuration from multiple sources with precedence:
    /// 1. Default values
    /// 2. Configuration file (patient-intake.toml)
    /// 3. Environment variables (prefixed with PATIENT_INTAKE, `__` between sections)
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new("patient-intake.toml"))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let mut builder = Config::builder();

        if path.exists() {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("PATIENT_INTAKE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: IntakeConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would only fail later, mid-saga.
    pub fn validate(&self) -> Result<(), IntakeError> {
        self.limiter.parsed_rates()?;
        if self.saga.conversion_concurrency == 0 {
            return Err(IntakeError::Config(
                "saga.conversion_concurrency must be at least 1".to_string(),
            ));
        }
        if self.saga.poll_initial_backoff_ms == 0
            || self.saga.poll_initial_backoff_ms > self.saga.poll_max_backoff_ms
        {
            return Err(IntakeError::Config(
                "saga poll backoff must satisfy 0 < initial <= max".to_string(),
            ));
        }
        if !(0.0..=crate::admission::dripper::MAX_JITTER_FRACTION)
            .contains(&self.dripper.jitter_fraction)
        {
            return Err(IntakeError::Config(
                "dripper.jitter_fraction must be within [0, 0.05]".to_string(),
            ));
        }
        Ok(())
    }

    /// Save configuration to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load .env file if it exists
    pub fn load_env_file() -> Result<()> {
        if Path::new(".env").exists() {
            dotenvy::dotenv()?;
            tracing::info!("Loaded environment variables from .env file");
        }
        Ok(())
    }
}
