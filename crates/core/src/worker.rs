//! Off-request execution of the remote stylization stage.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use url::Url;

use crate::config::StylizeConfig;
use crate::error::JobError;
use crate::job::{Job, JobStatus};
use crate::logging::redact_sensitive_text;
use crate::registry::JobRegistry;
use crate::stylize::Stylizer;

const DOWNLOAD_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Slack past the provider's own deadline so its error wins when it reports one.
const STYLIZE_GRACE: Duration = Duration::from_secs(5);

/// Upper bounds for the two slow steps of a remote run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerTimeouts {
    pub stylize: Duration,
    pub download: Duration,
}

impl WorkerTimeouts {
    pub fn from_config(config: &StylizeConfig) -> Self {
        Self {
            stylize: config.request_timeout().saturating_add(STYLIZE_GRACE),
            download: config.download_timeout(),
        }
    }
}

/// Everything one remote run needs; the job must already be `processing_remote`.
#[derive(Debug, Clone)]
pub struct RemoteTask {
    pub job_id: String,
    pub edge_map: PathBuf,
    pub output: PathBuf,
    pub prompt: String,
}

pub struct BackgroundWorker {
    registry: JobRegistry,
    stylizer: Arc<dyn Stylizer>,
    stylize_timeout: Duration,
    http: reqwest::Client,
}

impl BackgroundWorker {
    pub fn new(
        registry: JobRegistry,
        stylizer: Arc<dyn Stylizer>,
        timeouts: WorkerTimeouts,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(DOWNLOAD_CONNECT_TIMEOUT)
            .timeout(timeouts.download)
            .build()
            .context("failed to build HTTP client for stylized image download")?;
        Ok(Self {
            registry,
            stylizer,
            stylize_timeout: timeouts.stylize,
            http,
        })
    }

    /// Detaches the run. Nothing awaits the handle in production; tests may.
    pub fn spawn(self: &Arc<Self>, task: RemoteTask) -> JoinHandle<JobStatus> {
        let worker = Arc::clone(self);
        tokio::spawn(async move { worker.run(task).await })
    }

    /// Runs the stage to completion and commits exactly one outcome.
    pub async fn run(&self, task: RemoteTask) -> JobStatus {
        info!(job_id = %task.job_id, "Starting remote stylization");

        let outcome = self.stylize_and_fetch(&task).await;
        let committed = match outcome {
            Ok(path) => {
                info!(job_id = %task.job_id, path = %path.display(), "Stylized image stored");
                self.registry
                    .update(&task.job_id, |job| job.record_stylized(path))
            }
            Err(err) => {
                let message = redact_sensitive_text(&format!("{err:#}"));
                warn!(job_id = %task.job_id, error = %message, "Remote stylization failed");
                self.registry.update(&task.job_id, |job| job.fail(message))
            }
        };

        match committed {
            Ok(job) => job.status,
            Err(err) => {
                error!(job_id = %task.job_id, error = %err, "Could not record remote stage outcome");
                self.current_status(&task.job_id, &err)
            }
        }
    }

    async fn stylize_and_fetch(&self, task: &RemoteTask) -> Result<PathBuf> {
        let stylizing = self.stylizer.stylize(&task.edge_map, &task.prompt);
        let remote_url = tokio::time::timeout(self.stylize_timeout, stylizing)
            .await
            .map_err(|_| {
                anyhow!(
                    "stylization did not finish within {:?}",
                    self.stylize_timeout
                )
            })??;
        self.download(&remote_url, &task.output).await
    }

    async fn download(&self, raw_url: &str, output: &Path) -> Result<PathBuf> {
        let url = parse_http_url(raw_url)?;
        let shown = redacted_url_for_display(&url);

        let response = self
            .http
            .get(url.as_str())
            .send()
            .await
            .with_context(|| format!("failed to download stylized image from {shown}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!(
                "stylized image download returned HTTP {} for {}",
                status.as_u16(),
                shown
            );
        }
        let bytes = response
            .bytes()
            .await
            .with_context(|| format!("failed while reading stylized image from {shown}"))?;

        let partial = output.with_extension("png.part");
        tokio::fs::write(&partial, &bytes)
            .await
            .with_context(|| format!("failed to write {}", partial.display()))?;
        if let Err(err) = tokio::fs::rename(&partial, output).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(err).with_context(|| format!("failed to store {}", output.display()));
        }
        Ok(output.to_path_buf())
    }

    fn current_status(&self, job_id: &str, fallback: &JobError) -> JobStatus {
        match self.registry.get(job_id) {
            Ok(Job { status, .. }) => status,
            Err(_) => {
                warn!(job_id, error = %fallback, "Job vanished during remote stage");
                JobStatus::Failed
            }
        }
    }
}

fn parse_http_url(raw: &str) -> Result<Url> {
    let parsed = Url::parse(raw)
        .with_context(|| format!("invalid stylized image URL: {}", redact_sensitive_text(raw)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        scheme => bail!(
            "unsupported stylized image URL scheme '{scheme}' (expected http/https)"
        ),
    }
}

fn redacted_url_for_display(url: &Url) -> String {
    let mut shown = url.clone();
    let _ = shown.set_username("");
    let _ = shown.set_password(None);
    shown.set_query(None);
    shown.to_string()
}
