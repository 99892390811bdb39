use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    EdgesReady,
    ProcessingRemote,
    Stylized,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::EdgesReady => "edges_ready",
            JobStatus::ProcessingRemote => "processing_remote",
            JobStatus::Stylized => "stylized",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == JobStatus::Failed
    }

    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Failed, _) => false,
            (_, JobStatus::Failed) => true,
            (JobStatus::Created, JobStatus::EdgesReady)
            | (JobStatus::EdgesReady, JobStatus::ProcessingRemote)
            | (JobStatus::ProcessingRemote, JobStatus::Stylized) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One submission and every artifact derived from it.
///
/// Fields are public for reading; all writes go through the transition
/// methods below, which the registry runs inside its atomic update.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub original_filename: String,
    pub edge_map_path: Option<PathBuf>,
    pub stylized_image_path: Option<PathBuf>,
    pub composite_image_path: Option<PathBuf>,
    pub preview_path: Option<PathBuf>,
    pub bundle_path: Option<PathBuf>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Outputs of one successful composition run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleArtifacts {
    pub composite_image_path: PathBuf,
    pub preview_path: Option<PathBuf>,
    pub bundle_path: PathBuf,
}

impl Job {
    pub fn new(id: impl Into<String>, original_filename: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: JobStatus::Created,
            original_filename: original_filename.into(),
            edge_map_path: None,
            stylized_image_path: None,
            composite_image_path: None,
            preview_path: None,
            bundle_path: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// `Created → EdgesReady`, recording the edge map.
    pub fn record_edge_map(&mut self, path: PathBuf) -> Result<(), JobError> {
        self.advance(JobStatus::EdgesReady)?;
        set_once(&mut self.edge_map_path, path, "edge_map_path")
    }

    /// `EdgesReady → ProcessingRemote`. Succeeds for exactly one caller per job.
    pub fn start_remote(&mut self) -> Result<(), JobError> {
        self.advance(JobStatus::ProcessingRemote)
    }

    /// `ProcessingRemote → Stylized`, recording the downloaded image.
    pub fn record_stylized(&mut self, path: PathBuf) -> Result<(), JobError> {
        self.advance(JobStatus::Stylized)?;
        set_once(&mut self.stylized_image_path, path, "stylized_image_path")
    }

    /// Any non-terminal state → `Failed`.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), JobError> {
        self.advance(JobStatus::Failed)?;
        let message = message.into();
        let message = if message.trim().is_empty() {
            "unknown error".to_string()
        } else {
            message
        };
        self.error_message = Some(message);
        Ok(())
    }

    /// Publishes a composition run. Status stays `Stylized`.
    pub fn record_bundle(&mut self, artifacts: BundleArtifacts) -> Result<(), JobError> {
        if self.status != JobStatus::Stylized {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: JobStatus::Stylized,
            });
        }
        set_once(
            &mut self.composite_image_path,
            artifacts.composite_image_path,
            "composite_image_path",
        )?;
        if let Some(preview) = artifacts.preview_path {
            set_once(&mut self.preview_path, preview, "preview_path")?;
        }
        set_once(&mut self.bundle_path, artifacts.bundle_path, "bundle_path")
    }

    /// Derived condition: stylized and every downloadable artifact recorded.
    pub fn is_ready(&self) -> bool {
        self.status == JobStatus::Stylized
            && self.edge_map_path.is_some()
            && self.stylized_image_path.is_some()
            && self.composite_image_path.is_some()
            && self.bundle_path.is_some()
    }

    fn advance(&mut self, next: JobStatus) -> Result<(), JobError> {
        if self.status.is_terminal() {
            return Err(JobError::AlreadyTerminal);
        }
        if !self.status.can_transition_to(next) {
            return Err(JobError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

fn set_once(slot: &mut Option<PathBuf>, value: PathBuf, field: &'static str) -> Result<(), JobError> {
    if slot.is_some() {
        return Err(JobError::PathAlreadySet(field));
    }
    *slot = Some(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stylized_job() -> Job {
        let mut job = Job::new("job-1", "cat.png");
        job.record_edge_map(PathBuf::from("/tmp/edge.png")).unwrap();
        job.start_remote().unwrap();
        job.record_stylized(PathBuf::from("/tmp/stylized.png")).unwrap();
        job
    }

    #[test]
    fn forward_path_reaches_stylized() {
        let job = stylized_job();
        assert_eq!(job.status, JobStatus::Stylized);
        assert_eq!(job.edge_map_path, Some(PathBuf::from("/tmp/edge.png")));
        assert!(!job.is_ready());
    }

    #[test]
    fn skipping_a_stage_is_rejected() {
        let mut job = Job::new("job-1", "cat.png");
        let err = job.start_remote().unwrap_err();
        assert_eq!(
            err,
            JobError::InvalidTransition {
                from: JobStatus::Created,
                to: JobStatus::ProcessingRemote,
            }
        );
        assert_eq!(job.status, JobStatus::Created);
    }

    #[test]
    fn start_remote_only_succeeds_once() {
        let mut job = Job::new("job-1", "cat.png");
        job.record_edge_map(PathBuf::from("/tmp/edge.png")).unwrap();
        job.start_remote().unwrap();
        assert!(job.start_remote().is_err());
    }

    #[test]
    fn failed_is_terminal_and_keeps_message() {
        let mut job = Job::new("job-1", "cat.png");
        job.fail("decode error").unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("decode error"));

        assert_eq!(job.fail("second"), Err(JobError::AlreadyTerminal));
        assert!(job.record_edge_map(PathBuf::from("/tmp/e.png")).is_err());
        assert_eq!(job.error_message.as_deref(), Some("decode error"));
    }

    #[test]
    fn blank_failure_message_is_replaced() {
        let mut job = Job::new("job-1", "cat.png");
        job.fail("  ").unwrap();
        assert_eq!(job.error_message.as_deref(), Some("unknown error"));
    }

    #[test]
    fn bundle_paths_are_write_once() {
        let mut job = stylized_job();
        let artifacts = BundleArtifacts {
            composite_image_path: PathBuf::from("/tmp/composite.png"),
            preview_path: None,
            bundle_path: PathBuf::from("/tmp/bundle.zip"),
        };
        job.record_bundle(artifacts.clone()).unwrap();
        assert!(job.is_ready());
        assert_eq!(
            job.record_bundle(artifacts),
            Err(JobError::PathAlreadySet("composite_image_path"))
        );
    }

    #[test]
    fn bundle_requires_stylized() {
        let mut job = Job::new("job-1", "cat.png");
        let result = job.record_bundle(BundleArtifacts {
            composite_image_path: PathBuf::from("/tmp/composite.png"),
            preview_path: None,
            bundle_path: PathBuf::from("/tmp/bundle.zip"),
        });
        assert!(result.is_err());
        assert!(job.composite_image_path.is_none());
    }

    #[test]
    fn transitions_only_move_forward_one_step() {
        let forward = [
            JobStatus::Created,
            JobStatus::EdgesReady,
            JobStatus::ProcessingRemote,
            JobStatus::Stylized,
        ];
        for (i, from) in forward.iter().enumerate() {
            for (j, to) in forward.iter().enumerate() {
                assert_eq!(from.can_transition_to(*to), j == i + 1, "{from} -> {to}");
            }
            assert!(from.can_transition_to(JobStatus::Failed));
            assert!(!JobStatus::Failed.can_transition_to(*from));
        }
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::ProcessingRemote).unwrap();
        assert_eq!(json, "\"processing_remote\"");
        assert_eq!(JobStatus::EdgesReady.to_string(), "edges_ready");
    }
}
