//! Domain errors for the job lifecycle.
//!
//! Collaborators (edge extraction, stylization, composition) report
//! failures as [`anyhow::Error`]; these enums classify what the lifecycle
//! makes of them so the transport can answer with the right status.

use crate::job::JobStatus;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job id already registered: {0}")]
    DuplicateId(String),

    #[error("invalid job transition from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    #[error("job already failed")]
    AlreadyTerminal,

    #[error("job artifact already recorded: {0}")]
    PathAlreadySet(&'static str),
}

/// Failure of the synchronous part of a submission.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The job exists and is now terminal in `failed`.
    #[error("{message}")]
    Preprocessing { job_id: String, message: String },

    #[error("failed to prepare job storage: {0:#}")]
    Storage(anyhow::Error),

    #[error(transparent)]
    Registry(#[from] JobError),
}

/// Failure of a single download attempt. Never changes a committed job state.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job not yet complete. Status: {0}")]
    NotReady(JobStatus),

    #[error("required image files for job are missing")]
    MissingArtifacts,

    #[error("{0}")]
    Composition(String),
}

impl From<JobError> for DownloadError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(id) => DownloadError::NotFound(id),
            other => DownloadError::Composition(other.to_string()),
        }
    }
}
