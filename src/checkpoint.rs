use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tracing::debug;

use crate::errors::IntakeError;
use crate::workflows::{IntakeState, PollProgress, SagaPhase};

/// Everything needed to resume a saga run after its last completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeCheckpoint {
    pub state: IntakeState,
    pub phase: SagaPhase,
    /// Present only while polling
    pub poll: Option<PollProgress>,
    /// The closing status update went through; only the report is left.
    #[serde(default)]
    pub status_recorded: bool,
    pub updated_at: DateTime<Utc>,
}

impl IntakeCheckpoint {
    pub fn new(patient_id: &str) -> Self {
        Self {
            state: IntakeState::new(patient_id),
            phase: SagaPhase::Start,
            poll: None,
            status_recorded: false,
            updated_at: Utc::now(),
        }
    }

    pub fn saga_id(&self) -> &str {
        self.state.patient_id()
    }
}

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, saga_id: &str) -> Result<Option<IntakeCheckpoint>, IntakeError>;

    async fn save(&self, checkpoint: &IntakeCheckpoint) -> Result<(), IntakeError>;

    async fn clear(&self, saga_id: &str) -> Result<(), IntakeError>;
}

/// Process-local checkpoints; enough for resuming after a cancelled run.
#[derive(Debug, Default)]
pub struct InMemoryCheckpointStore {
    checkpoints: Mutex<HashMap<String, IntakeCheckpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, IntakeCheckpoint>>, IntakeError> {
        self.checkpoints
            .lock()
            .map_err(|_| IntakeError::Checkpoint("checkpoint store lock poisoned".to_string()))
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn load(&self, saga_id: &str) -> Result<Option<IntakeCheckpoint>, IntakeError> {
        Ok(self.lock()?.get(saga_id).cloned())
    }

    async fn save(&self, checkpoint: &IntakeCheckpoint) -> Result<(), IntakeError> {
        self.lock()?
            .insert(checkpoint.saga_id().to_string(), checkpoint.clone());
        Ok(())
    }

    async fn clear(&self, saga_id: &str) -> Result<(), IntakeError> {
        self.lock()?.remove(saga_id);
        Ok(())
    }
}

/// One JSON file per saga under a directory, replaced atomically on save.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, saga_id: &str) -> PathBuf {
        let name: String = saga_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, saga_id: &str) -> Result<Option<IntakeCheckpoint>, IntakeError> {
        let path = self.path_for(saga_id);
        if !fs::try_exists(&path).await? {
            return Ok(None);
        }
        let contents = fs::read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&contents)?))
    }

    async fn save(&self, checkpoint: &IntakeCheckpoint) -> Result<(), IntakeError> {
        fs::create_dir_all(&self.dir).await?;
        let path = self.path_for(checkpoint.saga_id());
        let serialized = serde_json::to_string_pretty(checkpoint)?;

        // Write to a temporary file first, then rename over the old one
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, serialized).await?;
        fs::rename(&temp, &path).await?;

        debug!(saga_id = checkpoint.saga_id(), phase = ?checkpoint.phase, "Checkpoint saved");
        Ok(())
    }

    async fn clear(&self, saga_id: &str) -> Result<(), IntakeError> {
        match fs::remove_file(self.path_for(saga_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
