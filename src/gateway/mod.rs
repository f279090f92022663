//! Outbound operations used by the intake saga.
//!
//! [`ActivityGateway`] is the seam between orchestration and the remote
//! services. Implementations gate rate-limited operations on an
//! [`AdmissionController`](crate::admission::AdmissionController) before
//! issuing the call; conversion and storage are never gated.

pub mod http;

use async_trait::async_trait;
#[cfg(any(test, feature = "testing"))]
use mockall::automock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::admission::RateKey;
use crate::errors::IntakeError;

pub use http::HttpActivityGateway;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Tracking task identifier issued by the task tracker
    TaskId
);
string_id!(
    /// Document search job identifier
    SearchJobId
);
string_id!(
    /// One extracted file from a search archive
    FileRef
);
string_id!(
    /// A converted and stored document
    ConvertedRef
);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientIdentity {
    pub first: String,
    pub last: String,
}

/// Status markers written onto the tracking task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    DocumentsFound,
    DocumentsNotFound,
    IntakeFailed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::DocumentsFound => "DOCUMENTS_FOUND",
            TaskStatus::DocumentsNotFound => "DOCUMENTS_NOT_FOUND",
            TaskStatus::IntakeFailed => "INTAKE_FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remote search job state. Unrecognised values keep the poll loop polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchState {
    Queued,
    Running,
    Finished,
    Failed,
    NotFound,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchStatus {
    pub state: SearchState,
    #[serde(default)]
    pub archive_url: Option<String>,
}

impl SearchStatus {
    pub fn new(state: SearchState) -> Self {
        Self {
            state,
            archive_url: None,
        }
    }

    pub fn finished(archive_url: impl Into<String>) -> Self {
        Self {
            state: SearchState::Finished,
            archive_url: Some(archive_url.into()),
        }
    }
}

/// Gateway operations, named as the saga's steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    LookupPatient,
    CreateTask,
    UpdateTaskStatus,
    AppendReport,
    StartSearch,
    CheckStatus,
    DownloadAndExtract,
    ConvertFile,
    StoreConverted,
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::LookupPatient => "lookup_patient",
            Operation::CreateTask => "create_task",
            Operation::UpdateTaskStatus => "update_task_status",
            Operation::AppendReport => "append_report",
            Operation::StartSearch => "start_search",
            Operation::CheckStatus => "check_status",
            Operation::DownloadAndExtract => "download_and_extract",
            Operation::ConvertFile => "convert_file",
            Operation::StoreConverted => "store_converted",
        }
    }

    /// The admission key and wait bound gating this operation, if any.
    pub fn admission(&self) -> Option<(RateKey, Duration)> {
        match self {
            Operation::CreateTask | Operation::UpdateTaskStatus | Operation::AppendReport => {
                Some((RateKey::TrackerWrites, Duration::from_secs(3)))
            }
            Operation::StartSearch | Operation::DownloadAndExtract => {
                Some((RateKey::SearchDownload, Duration::from_secs(6)))
            }
            Operation::CheckStatus => Some((RateKey::StatusPolling, Duration::from_millis(1500))),
            Operation::LookupPatient | Operation::ConvertFile | Operation::StoreConverted => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Remote calls made by the intake saga. Each call is a single attempt;
/// retries belong to the caller.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait ActivityGateway: Send + Sync {
    async fn lookup_patient(&self, patient_id: &str) -> Result<PatientIdentity, IntakeError>;

    async fn create_task(
        &self,
        patient_id: &str,
        identity: &PatientIdentity,
    ) -> Result<TaskId, IntakeError>;

    async fn update_task_status(&self, task_id: &TaskId, status: TaskStatus)
        -> Result<(), IntakeError>;

    async fn append_report(&self, task_id: &TaskId, report: &str) -> Result<(), IntakeError>;

    async fn start_search(&self, identity: &PatientIdentity) -> Result<SearchJobId, IntakeError>;

    async fn check_status(&self, job_id: &SearchJobId) -> Result<SearchStatus, IntakeError>;

    async fn download_and_extract(&self, archive_url: &str) -> Result<Vec<FileRef>, IntakeError>;

    async fn convert_file(&self, file: &FileRef) -> Result<ConvertedRef, IntakeError>;

    async fn store_converted(&self, converted: &ConvertedRef) -> Result<(), IntakeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_search_state_deserializes() {
        let status: SearchStatus = serde_json::from_str(r#"{"state":"paused"}"#).unwrap();
        assert_eq!(status.state, SearchState::Unknown);
        assert_eq!(status.archive_url, None);

        let status: SearchStatus =
            serde_json::from_str(r#"{"state":"finished","archive_url":"s3://a.zip"}"#).unwrap();
        assert_eq!(status, SearchStatus::finished("s3://a.zip"));
    }

    #[test]
    fn test_task_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&TaskStatus::DocumentsNotFound).unwrap(),
            "\"DOCUMENTS_NOT_FOUND\""
        );
        assert_eq!(TaskStatus::IntakeFailed.to_string(), "INTAKE_FAILED");
    }

    #[test]
    fn test_only_remote_service_calls_are_gated() {
        assert_eq!(
            Operation::CheckStatus.admission(),
            Some((RateKey::StatusPolling, Duration::from_millis(1500)))
        );
        assert_eq!(
            Operation::DownloadAndExtract.admission().map(|(key, _)| key),
            Some(RateKey::SearchDownload)
        );
        assert_eq!(Operation::ConvertFile.admission(), None);
        assert_eq!(Operation::StoreConverted.admission(), None);
        assert_eq!(Operation::LookupPatient.admission(), None);
    }
}
