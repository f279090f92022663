use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error};

use super::step_options;
use crate::errors::IntakeError;
use crate::gateway::{ActivityGateway, ConvertedRef, FileRef, Operation};
use crate::retry::run_step;
use crate::shutdown::ShutdownSignal;

/// Converts and stores a list of files with a hard cap on in-flight pipelines.
///
/// A fixed pool of at most `max_in_flight` workers pulls files from a shared
/// queue, so the pipeline count never exceeds the cap regardless of input
/// length. The first unrecoverable pipeline stops workers from taking new
/// files; pipelines already running finish, then the whole fan-out fails and
/// nothing converted so far is returned.
pub struct BoundedConversionFanout {
    gateway: Arc<dyn ActivityGateway>,
    max_in_flight: usize,
    shutdown: ShutdownSignal,
}

struct Worker {
    gateway: Arc<dyn ActivityGateway>,
    queue: Arc<Mutex<VecDeque<FileRef>>>,
    failed: Arc<AtomicBool>,
    shutdown: ShutdownSignal,
}

impl Worker {
    fn next_file(&self) -> Option<FileRef> {
        if self.failed.load(Ordering::SeqCst) || self.shutdown.is_triggered() {
            return None;
        }
        self.queue.lock().ok()?.pop_front()
    }

    async fn run(self) -> Result<Vec<ConvertedRef>, IntakeError> {
        let mut converted = Vec::new();
        while let Some(file) = self.next_file() {
            match self.pipeline(&file).await {
                Ok(done) => converted.push(done),
                Err(err) => {
                    self.failed.store(true, Ordering::SeqCst);
                    return Err(match err {
                        IntakeError::Cancelled => IntakeError::Cancelled,
                        other => IntakeError::FanoutMemberFailure {
                            file: file.to_string(),
                            source: Box::new(other),
                        },
                    });
                }
            }
        }
        Ok(converted)
    }

    async fn pipeline(&self, file: &FileRef) -> Result<ConvertedRef, IntakeError> {
        let gateway = self.gateway.as_ref();
        let converted = run_step(
            Operation::ConvertFile.name(),
            &step_options(Operation::ConvertFile),
            &self.shutdown,
            || gateway.convert_file(file),
        )
        .await?;

        run_step(
            Operation::StoreConverted.name(),
            &step_options(Operation::StoreConverted),
            &self.shutdown,
            || gateway.store_converted(&converted),
        )
        .await?;

        debug!(file = %file, converted = %converted, "File converted and stored");
        Ok(converted)
    }
}

impl BoundedConversionFanout {
    pub fn new(
        gateway: Arc<dyn ActivityGateway>,
        max_in_flight: usize,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            gateway,
            max_in_flight: max_in_flight.max(1),
            shutdown,
        }
    }

    pub async fn run(&self, files: Vec<FileRef>) -> Result<Vec<ConvertedRef>, IntakeError> {
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let total = files.len();
        let workers = total.min(self.max_in_flight);
        let queue = Arc::new(Mutex::new(VecDeque::from(files)));
        let failed = Arc::new(AtomicBool::new(false));

        let mut set = JoinSet::new();
        for _ in 0..workers {
            let worker = Worker {
                gateway: self.gateway.clone(),
                queue: queue.clone(),
                failed: failed.clone(),
                shutdown: self.shutdown.clone(),
            };
            set.spawn(worker.run());
        }

        let mut converted = Vec::with_capacity(total);
        let mut first_error: Option<IntakeError> = None;
        while let Some(joined) = set.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                failed.store(true, Ordering::SeqCst);
                Err(IntakeError::Invariant(format!("conversion worker panicked: {e}")))
            });
            match result {
                Ok(batch) => converted.extend(batch),
                Err(err) => {
                    if first_error.is_none() {
                        error!(error = %err, "Conversion fan-out failed");
                        first_error = Some(err);
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        if converted.len() < total {
            // Only a shutdown stops workers early without an error.
            self.shutdown.check()?;
            return Err(IntakeError::Invariant(format!(
                "conversion fan-out finished {} of {} files",
                converted.len(),
                total
            )));
        }
        Ok(converted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{
        PatientIdentity, SearchJobId, SearchStatus, TaskId, TaskStatus,
    };
    use async_trait::async_trait;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Counts pipelines between convert start and store completion.
    #[derive(Default)]
    struct ConversionRecorder {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        converts: AtomicUsize,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl ActivityGateway for ConversionRecorder {
        async fn lookup_patient(&self, _: &str) -> Result<PatientIdentity, IntakeError> {
            unreachable!()
        }
        async fn create_task(&self, _: &str, _: &PatientIdentity) -> Result<TaskId, IntakeError> {
            unreachable!()
        }
        async fn update_task_status(&self, _: &TaskId, _: TaskStatus) -> Result<(), IntakeError> {
            unreachable!()
        }
        async fn append_report(&self, _: &TaskId, _: &str) -> Result<(), IntakeError> {
            unreachable!()
        }
        async fn start_search(&self, _: &PatientIdentity) -> Result<SearchJobId, IntakeError> {
            unreachable!()
        }
        async fn check_status(&self, _: &SearchJobId) -> Result<SearchStatus, IntakeError> {
            unreachable!()
        }
        async fn download_and_extract(&self, _: &str) -> Result<Vec<FileRef>, IntakeError> {
            unreachable!()
        }

        async fn convert_file(&self, file: &FileRef) -> Result<ConvertedRef, IntakeError> {
            self.converts.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.fail_on.as_deref() == Some(file.as_str()) {
                self.in_flight.fetch_sub(1, Ordering::SeqCst);
                return Err(IntakeError::rejected("convert_file", "corrupt document"));
            }
            Ok(ConvertedRef(format!("{file}.pdf")))
        }

        async fn store_converted(&self, _: &ConvertedRef) -> Result<(), IntakeError> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn files(n: usize) -> Vec<FileRef> {
        (0..n).map(|i| FileRef(format!("/tmp/J1/doc{i}.docx"))).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_input_completes_immediately() {
        let recorder = Arc::new(ConversionRecorder::default());
        let fanout = BoundedConversionFanout::new(recorder.clone(), 6, ShutdownSignal::never());
        assert!(fanout.run(Vec::new()).await.unwrap().is_empty());
        assert_eq!(recorder.converts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_file_converted_once() {
        let recorder = Arc::new(ConversionRecorder::default());
        let fanout = BoundedConversionFanout::new(recorder.clone(), 6, ShutdownSignal::never());

        let converted = fanout.run(files(17)).await.unwrap();

        let unique: HashSet<_> = converted.iter().map(|c| c.as_str().to_string()).collect();
        assert_eq!(converted.len(), 17);
        assert_eq!(unique.len(), 17);
        assert_eq!(recorder.peak.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_member_failure_fails_whole_fanout() {
        let recorder = Arc::new(ConversionRecorder {
            fail_on: Some("/tmp/J1/doc3.docx".to_string()),
            ..Default::default()
        });
        let fanout = BoundedConversionFanout::new(recorder.clone(), 2, ShutdownSignal::never());

        let err = fanout.run(files(20)).await.unwrap_err();

        match err {
            IntakeError::FanoutMemberFailure { file, source } => {
                assert_eq!(file, "/tmp/J1/doc3.docx");
                assert!(matches!(*source, IntakeError::UnrecoverableRemoteFailure { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        // Workers stop taking new files once a member fails.
        assert!(recorder.converts.load(Ordering::SeqCst) < 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_new_pipelines() {
        let coordinator = crate::shutdown::ShutdownCoordinator::new();
        let recorder = Arc::new(ConversionRecorder::default());
        let fanout = BoundedConversionFanout::new(recorder.clone(), 2, coordinator.signal());

        coordinator.trigger();
        let result = fanout.run(files(5)).await;

        assert!(matches!(result, Err(IntakeError::Cancelled)));
        assert_eq!(recorder.converts.load(Ordering::SeqCst), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_in_flight_never_exceeds_cap(n in 0usize..40, cap in 1usize..8) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .start_paused(true)
                .build()
                .unwrap();
            let recorder = Arc::new(ConversionRecorder::default());

            let converted = runtime.block_on(async {
                BoundedConversionFanout::new(recorder.clone(), cap, ShutdownSignal::never())
                    .run(files(n))
                    .await
            }).unwrap();

            prop_assert_eq!(converted.len(), n);
            prop_assert!(recorder.peak.load(Ordering::SeqCst) <= cap);
        }
    }
}
