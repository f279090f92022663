use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{
    ActivityGateway, ConvertedRef, FileRef, Operation, PatientIdentity, SearchJobId, SearchStatus,
    TaskId, TaskStatus,
};
use crate::admission::AdmissionController;
use crate::config::ServiceConfig;
use crate::errors::IntakeError;
use crate::shutdown::ShutdownSignal;

#[derive(Debug, Deserialize)]
struct CreateTaskResponse {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct StartSearchResponse {
    job_id: String,
}

#[derive(Debug, Deserialize)]
struct DownloadResponse {
    files: Vec<String>,
}

/// [`ActivityGateway`] over the task tracker and document exchange HTTP APIs.
pub struct HttpActivityGateway {
    client: Client,
    tracker_url: String,
    docex_url: String,
    storage_dir: PathBuf,
    admission: Arc<dyn AdmissionController>,
    shutdown: ShutdownSignal,
}

impl HttpActivityGateway {
    pub fn new(
        services: &ServiceConfig,
        admission: Arc<dyn AdmissionController>,
    ) -> Result<Self, IntakeError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(services.request_timeout_ms))
            .build()
            .map_err(|e| IntakeError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            tracker_url: services.tracker_url.trim_end_matches('/').to_string(),
            docex_url: services.docex_url.trim_end_matches('/').to_string(),
            storage_dir: services.storage_dir.clone(),
            admission,
            shutdown: ShutdownSignal::never(),
        })
    }

    /// Stop waiting for admission, and stop sending, once `shutdown` fires.
    pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    async fn admit(&self, operation: Operation) -> Result<(), IntakeError> {
        if let Some((key, timeout)) = operation.admission() {
            tokio::select! {
                admitted = self.admission.admit_or_wait(key, timeout) => admitted?,
                _ = self.shutdown.triggered() => return Err(IntakeError::Cancelled),
            }
        }
        Ok(())
    }

    async fn send(&self, operation: Operation, request: RequestBuilder) -> Result<Response, IntakeError> {
        self.admit(operation).await?;
        // A token granted after cancellation must not start a request.
        self.shutdown.check()?;
        let response = request
            .send()
            .await
            .map_err(|e| classify_transport(operation, e))?;
        check_response(operation, response)
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        operation: Operation,
        request: RequestBuilder,
    ) -> Result<T, IntakeError> {
        let response = self.send(operation, request).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| classify_transport(operation, e))
    }
}

fn check_response(operation: Operation, response: Response) -> Result<Response, IntakeError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        Err(IntakeError::transient(operation.name(), format!("HTTP {status}")))
    } else {
        Err(IntakeError::rejected(operation.name(), format!("HTTP {status}")))
    }
}

fn classify_transport(operation: Operation, err: reqwest::Error) -> IntakeError {
    if err.is_decode() {
        IntakeError::rejected(operation.name(), format!("malformed response: {err}"))
    } else {
        IntakeError::transient(operation.name(), err)
    }
}

/// The synthetic directory derives names from the id's last two characters.
fn synthetic_identity(patient_id: &str) -> PatientIdentity {
    let chars: Vec<char> = patient_id.chars().collect();
    let suffix: String = chars[chars.len().saturating_sub(2)..].iter().collect();
    PatientIdentity {
        first: format!("Pat{suffix}"),
        last: "Example".to_string(),
    }
}

#[async_trait]
impl ActivityGateway for HttpActivityGateway {
    async fn lookup_patient(&self, patient_id: &str) -> Result<PatientIdentity, IntakeError> {
        if patient_id.trim().is_empty() {
            return Err(IntakeError::rejected(
                Operation::LookupPatient.name(),
                "empty patient id",
            ));
        }
        Ok(synthetic_identity(patient_id))
    }

    async fn create_task(
        &self,
        patient_id: &str,
        identity: &PatientIdentity,
    ) -> Result<TaskId, IntakeError> {
        let request = self
            .client
            .post(format!("{}/create", self.tracker_url))
            .json(&json!({
                "patient_id": patient_id,
                "first": identity.first,
                "last": identity.last,
            }));
        let created: CreateTaskResponse = self.send_json(Operation::CreateTask, request).await?;
        debug!(patient_id, task_id = %created.task_id, "Tracking task created");
        Ok(TaskId(created.task_id))
    }

    async fn update_task_status(
        &self,
        task_id: &TaskId,
        status: TaskStatus,
    ) -> Result<(), IntakeError> {
        let request = self
            .client
            .post(format!("{}/update", self.tracker_url))
            .json(&json!({ "task_id": task_id, "status": status }));
        self.send(Operation::UpdateTaskStatus, request).await?;
        Ok(())
    }

    async fn append_report(&self, task_id: &TaskId, report: &str) -> Result<(), IntakeError> {
        let request = self
            .client
            .post(format!("{}/append", self.tracker_url))
            .json(&json!({ "task_id": task_id, "report": report }));
        self.send(Operation::AppendReport, request).await?;
        Ok(())
    }

    async fn start_search(&self, identity: &PatientIdentity) -> Result<SearchJobId, IntakeError> {
        let request = self
            .client
            .post(format!("{}/search", self.docex_url))
            .json(&json!({ "first": identity.first, "last": identity.last }));
        let started: StartSearchResponse = self.send_json(Operation::StartSearch, request).await?;
        Ok(SearchJobId(started.job_id))
    }

    async fn check_status(&self, job_id: &SearchJobId) -> Result<SearchStatus, IntakeError> {
        let request = self
            .client
            .get(format!("{}/status", self.docex_url))
            .query(&[("job_id", job_id.as_str())]);
        self.send_json(Operation::CheckStatus, request).await
    }

    async fn download_and_extract(&self, archive_url: &str) -> Result<Vec<FileRef>, IntakeError> {
        let request = self
            .client
            .get(format!("{}/download", self.docex_url))
            .query(&[("url", archive_url)]);
        let downloaded: DownloadResponse =
            self.send_json(Operation::DownloadAndExtract, request).await?;
        Ok(downloaded.files.into_iter().map(FileRef).collect())
    }

    async fn convert_file(&self, file: &FileRef) -> Result<ConvertedRef, IntakeError> {
        Ok(ConvertedRef(format!("{}.pdf", file.as_str())))
    }

    async fn store_converted(&self, converted: &ConvertedRef) -> Result<(), IntakeError> {
        let operation = Operation::StoreConverted;
        let name = converted.as_str().replace(['/', '\\', ':'], "_");
        tokio::fs::create_dir_all(&self.storage_dir)
            .await
            .map_err(|e| IntakeError::transient(operation.name(), e))?;
        tokio::fs::write(self.storage_dir.join(name), converted.as_str())
            .await
            .map_err(|e| IntakeError::transient(operation.name(), e))?;
        Ok(())
    }
}
