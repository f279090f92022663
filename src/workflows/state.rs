use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::IntakeError;
use crate::gateway::{ConvertedRef, FileRef, PatientIdentity, SearchJobId, TaskId};

/// Successful terminal results of an intake run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntakeOutcome {
    Found,
    NotFound,
}

impl fmt::Display for IntakeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntakeOutcome::Found => f.write_str("FOUND"),
            IntakeOutcome::NotFound => f.write_str("NOT_FOUND"),
        }
    }
}

/// Where a saga run stands. Each phase names the work already completed;
/// the saga resumes by executing the transition out of its current phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SagaPhase {
    #[default]
    Start,
    Identity,
    TaskCreated,
    Searching,
    Polling,
    Downloading,
    NotFoundBranch,
    Converting,
    Finalizing,
    Done,
}

impl SagaPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaPhase::Done)
    }
}

fn write_once<T>(slot: &mut Option<T>, value: T, field: &str) -> Result<(), IntakeError> {
    if slot.is_some() {
        return Err(IntakeError::Invariant(format!("{field} is already set")));
    }
    *slot = Some(value);
    Ok(())
}

fn required<'a, T>(slot: &'a Option<T>, field: &str) -> Result<&'a T, IntakeError> {
    slot.as_ref()
        .ok_or_else(|| IntakeError::Invariant(format!("{field} has not been set")))
}

/// Per-run saga data. Every field is write-once except `converted`, which only
/// grows, and only while converting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntakeState {
    patient_id: String,
    identity: Option<PatientIdentity>,
    task_id: Option<TaskId>,
    search_job_id: Option<SearchJobId>,
    archive_url: Option<String>,
    files: Option<Vec<FileRef>>,
    converted: Vec<ConvertedRef>,
    outcome: Option<IntakeOutcome>,
}

impl IntakeState {
    pub fn new(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            identity: None,
            task_id: None,
            search_job_id: None,
            archive_url: None,
            files: None,
            converted: Vec::new(),
            outcome: None,
        }
    }

    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    pub fn identity(&self) -> Result<&PatientIdentity, IntakeError> {
        required(&self.identity, "identity")
    }

    pub fn task_id(&self) -> Option<&TaskId> {
        self.task_id.as_ref()
    }

    pub fn search_job_id(&self) -> Result<&SearchJobId, IntakeError> {
        required(&self.search_job_id, "search_job_id")
    }

    /// `None` until the poll loop finds documents; stays `None` when it does not.
    pub fn archive_url(&self) -> Option<&str> {
        self.archive_url.as_deref()
    }

    pub fn files(&self) -> Result<&[FileRef], IntakeError> {
        required(&self.files, "files").map(Vec::as_slice)
    }

    pub fn converted(&self) -> &[ConvertedRef] {
        &self.converted
    }

    pub fn outcome(&self) -> Option<IntakeOutcome> {
        self.outcome
    }

    pub fn set_identity(&mut self, identity: PatientIdentity) -> Result<(), IntakeError> {
        write_once(&mut self.identity, identity, "identity")
    }

    pub fn set_task_id(&mut self, task_id: TaskId) -> Result<(), IntakeError> {
        write_once(&mut self.task_id, task_id, "task_id")
    }

    pub fn set_search_job_id(&mut self, job_id: SearchJobId) -> Result<(), IntakeError> {
        write_once(&mut self.search_job_id, job_id, "search_job_id")
    }

    pub fn set_archive_url(&mut self, archive_url: String) -> Result<(), IntakeError> {
        write_once(&mut self.archive_url, archive_url, "archive_url")
    }

    pub fn set_files(&mut self, files: Vec<FileRef>) -> Result<(), IntakeError> {
        write_once(&mut self.files, files, "files")
    }

    /// Only valid while converting: after the file list is known and before
    /// the outcome is set.
    pub fn extend_converted(
        &mut self,
        converted: impl IntoIterator<Item = ConvertedRef>,
    ) -> Result<(), IntakeError> {
        if self.files.is_none() {
            return Err(IntakeError::Invariant(
                "converted list opens only once the file list is known".to_string(),
            ));
        }
        if self.outcome.is_some() {
            return Err(IntakeError::Invariant(
                "converted list is closed once the outcome is set".to_string(),
            ));
        }
        self.converted.extend(converted);
        Ok(())
    }

    pub fn set_outcome(&mut self, outcome: IntakeOutcome) -> Result<(), IntakeError> {
        write_once(&mut self.outcome, outcome, "outcome")
    }
}
