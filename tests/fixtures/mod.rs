/// Scripted gateway for end-to-end saga scenarios
use async_trait::async_trait;
use patient_intake::admission::AdmissionController;
use patient_intake::errors::IntakeError;
use patient_intake::gateway::{
    ActivityGateway, ConvertedRef, FileRef, Operation, PatientIdentity, SearchJobId, SearchState,
    SearchStatus, TaskId, TaskStatus,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Plays back a fixed status sequence and records every call it receives.
#[derive(Default)]
pub struct ScriptedGateway {
    statuses: Mutex<VecDeque<SearchStatus>>,
    files: Vec<FileRef>,
    download_failures_left: AtomicU32,
    conversion_time: Duration,
    admission: Option<Arc<dyn AdmissionController>>,
    calls: Mutex<Vec<Operation>>,
    statuses_written: Mutex<Vec<TaskStatus>>,
    reports: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self {
            conversion_time: Duration::from_millis(20),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: impl IntoIterator<Item = SearchStatus>) -> Self {
        self.statuses = Mutex::new(statuses.into_iter().collect());
        self
    }

    pub fn with_files(mut self, count: usize) -> Self {
        self.files = (0..count)
            .map(|i| FileRef(format!("/tmp/archive/doc{i}.docx")))
            .collect();
        self
    }

    pub fn failing_downloads(self, times: u32) -> Self {
        self.download_failures_left.store(times, Ordering::SeqCst);
        self
    }

    /// Gate calls on `admission` the way a real gateway does.
    pub fn with_admission(mut self, admission: Arc<dyn AdmissionController>) -> Self {
        self.admission = Some(admission);
        self
    }

    pub fn calls_to(&self, operation: Operation) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|op| **op == operation)
            .count()
    }

    pub fn statuses_written(&self) -> Vec<TaskStatus> {
        self.statuses_written.lock().unwrap().clone()
    }

    pub fn reports(&self) -> Vec<String> {
        self.reports.lock().unwrap().clone()
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, operation: Operation) -> Result<(), IntakeError> {
        if let (Some(admission), Some((key, timeout))) = (&self.admission, operation.admission()) {
            admission.admit_or_wait(key, timeout).await?;
        }
        self.calls.lock().unwrap().push(operation);
        Ok(())
    }
}

#[async_trait]
impl ActivityGateway for ScriptedGateway {
    async fn lookup_patient(&self, patient_id: &str) -> Result<PatientIdentity, IntakeError> {
        self.enter(Operation::LookupPatient).await?;
        Ok(PatientIdentity {
            first: format!("Pat{}", &patient_id[patient_id.len().saturating_sub(2)..]),
            last: "Example".to_string(),
        })
    }

    async fn create_task(&self, patient_id: &str, _: &PatientIdentity) -> Result<TaskId, IntakeError> {
        self.enter(Operation::CreateTask).await?;
        Ok(TaskId(format!("T-{patient_id}")))
    }

    async fn update_task_status(&self, _: &TaskId, status: TaskStatus) -> Result<(), IntakeError> {
        self.enter(Operation::UpdateTaskStatus).await?;
        self.statuses_written.lock().unwrap().push(status);
        Ok(())
    }

    async fn append_report(&self, _: &TaskId, report: &str) -> Result<(), IntakeError> {
        self.enter(Operation::AppendReport).await?;
        self.reports.lock().unwrap().push(report.to_string());
        Ok(())
    }

    async fn start_search(&self, _: &PatientIdentity) -> Result<SearchJobId, IntakeError> {
        self.enter(Operation::StartSearch).await?;
        Ok(SearchJobId::from("J-0001"))
    }

    async fn check_status(&self, _: &SearchJobId) -> Result<SearchStatus, IntakeError> {
        self.enter(Operation::CheckStatus).await?;
        Ok(self
            .statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| SearchStatus::new(SearchState::Running)))
    }

    async fn download_and_extract(&self, _: &str) -> Result<Vec<FileRef>, IntakeError> {
        self.enter(Operation::DownloadAndExtract).await?;
        let failed = self
            .download_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failed {
            return Err(IntakeError::transient("download_and_extract", "connection reset by peer"));
        }
        Ok(self.files.clone())
    }

    async fn convert_file(&self, file: &FileRef) -> Result<ConvertedRef, IntakeError> {
        self.enter(Operation::ConvertFile).await?;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.conversion_time).await;
        Ok(ConvertedRef(format!("{file}.pdf")))
    }

    async fn store_converted(&self, _: &ConvertedRef) -> Result<(), IntakeError> {
        self.enter(Operation::StoreConverted).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}
