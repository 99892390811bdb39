//! Submission path: job creation, synchronous edge extraction and the
//! hand-off to the background worker.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::edges::EdgeDetector;
use crate::error::{JobError, SubmitError};
use crate::job::Job;
use crate::registry::JobRegistry;
use crate::storage::JobStorage;
use crate::worker::{BackgroundWorker, RemoteTask};

#[derive(Debug, Clone)]
pub struct Submission {
    pub original_filename: String,
    pub image: Vec<u8>,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitReceipt {
    pub job_id: String,
    pub edge_map: PathBuf,
}

pub struct PipelineOrchestrator {
    registry: JobRegistry,
    storage: JobStorage,
    edge_detector: Arc<dyn EdgeDetector>,
    worker: Arc<BackgroundWorker>,
}

impl PipelineOrchestrator {
    pub fn new(
        registry: JobRegistry,
        storage: JobStorage,
        edge_detector: Arc<dyn EdgeDetector>,
        worker: Arc<BackgroundWorker>,
    ) -> Self {
        Self {
            registry,
            storage,
            edge_detector,
            worker,
        }
    }

    /// Creates the job, extracts edges and dispatches the remote stage.
    ///
    /// Returns once the job is `processing_remote`; stylization continues in
    /// the background. A preprocessing failure leaves the job `failed` and is
    /// returned to the caller.
    pub async fn submit(&self, submission: Submission) -> Result<SubmitReceipt, SubmitError> {
        let Submission {
            original_filename,
            image,
            prompt,
        } = submission;

        let job_id = self
            .registry
            .create(Job::new(Uuid::new_v4().to_string(), original_filename.as_str()))?;
        info!(job_id = %job_id, filename = %original_filename, "Job created");

        let files = self.storage.files(&job_id, &original_filename);
        if let Err(err) = self.storage.create_job_dir(&files) {
            self.record_failure(&job_id, &format!("{err:#}"));
            return Err(SubmitError::Storage(err));
        }

        let detector = Arc::clone(&self.edge_detector);
        let output = files.edge_map.clone();
        let extracted =
            tokio::task::spawn_blocking(move || detector.detect_edges(&image, &output)).await;
        let edge_map = match extracted {
            Ok(Ok(path)) => path,
            Ok(Err(err)) => return Err(self.preprocessing_failed(job_id, format!("{err:#}"))),
            Err(join_err) => {
                return Err(self.preprocessing_failed(
                    job_id,
                    format!("edge extraction task aborted: {join_err}"),
                ))
            }
        };

        self.registry
            .update(&job_id, |job| job.record_edge_map(edge_map.clone()))?;
        info!(job_id = %job_id, path = %edge_map.display(), "Edge map ready");

        self.dispatch(RemoteTask {
            job_id: job_id.clone(),
            edge_map: edge_map.clone(),
            output: files.stylized,
            prompt,
        });

        Ok(SubmitReceipt { job_id, edge_map })
    }

    /// Moves the job to `processing_remote` and spawns its single worker run.
    /// Losing the transition means the job was already dispatched or failed;
    /// nothing is spawned then.
    fn dispatch(&self, task: RemoteTask) {
        match self.registry.update(&task.job_id, Job::start_remote) {
            Ok(_) => {
                info!(job_id = %task.job_id, "Dispatched to background worker");
                self.worker.spawn(task);
            }
            Err(err) => {
                error!(job_id = %task.job_id, error = %err, "Refusing to dispatch job outside edges_ready");
            }
        }
    }

    fn preprocessing_failed(&self, job_id: String, message: String) -> SubmitError {
        warn!(job_id = %job_id, error = %message, "Edge extraction failed");
        self.record_failure(&job_id, &message);
        SubmitError::Preprocessing { job_id, message }
    }

    fn record_failure(&self, job_id: &str, message: &str) {
        if let Err(err) = self.registry.update(job_id, |job| job.fail(message)) {
            match err {
                JobError::NotFound(_) => warn!(job_id, "Job vanished before failure was recorded"),
                other => error!(job_id, error = %other, "Could not record job failure"),
            }
        }
    }
}
