//! Remote stylization of an edge map.
//!
//! [`ReplicateStylizer`] submits the edge map to a ControlNet model on
//! Replicate and polls the prediction until it settles. It never cancels
//! a prediction it started; the caller's only lever is the overall
//! request timeout.

use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::StylizeConfig;

#[async_trait]
pub trait Stylizer: Send + Sync {
    /// Returns the URL of the stylized image.
    async fn stylize(&self, edge_map: &Path, prompt: &str) -> Result<String>;
}

pub struct ReplicateStylizer {
    client: reqwest::Client,
    api_base: String,
    model: String,
    version: Option<String>,
    api_token: Option<String>,
    request_timeout: Duration,
    poll_interval: Duration,
}

#[derive(Debug, Deserialize)]
struct Prediction {
    id: String,
    status: String,
    #[serde(default)]
    output: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<serde_json::Value>,
    #[serde(default)]
    urls: Option<PredictionUrls>,
}

#[derive(Debug, Deserialize)]
struct PredictionUrls {
    get: Option<String>,
}

impl ReplicateStylizer {
    pub fn new(config: &StylizeConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(15))
            .build()
            .context("failed to build HTTP client for stylization provider")?;
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: reqwest::Client, config: &StylizeConfig) -> Self {
        Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            version: config.version.clone().filter(|v| !v.trim().is_empty()),
            api_token: config.api_token.clone().filter(|t| !t.trim().is_empty()),
            request_timeout: config.request_timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    pub fn has_token(&self) -> bool {
        self.api_token.is_some()
    }

    async fn run_prediction(&self, edge_map: &Path, prompt: &str) -> Result<String> {
        let token = self
            .api_token
            .as_deref()
            .context("REPLICATE_API_TOKEN is not set; stylization is unavailable")?;

        let bytes = tokio::fs::read(edge_map)
            .await
            .with_context(|| format!("Edge map file not found at: {}", edge_map.display()))?;
        let image_uri = format!("data:image/png;base64,{}", STANDARD.encode(bytes));
        let input = serde_json::json!({ "image": image_uri, "prompt": prompt });

        let (url, body) = match &self.version {
            Some(version) => (
                format!("{}/predictions", self.api_base),
                serde_json::json!({ "version": version, "input": input }),
            ),
            None => (
                format!("{}/models/{}/predictions", self.api_base, self.model),
                serde_json::json!({ "input": input }),
            ),
        };

        info!(model = %self.model, prompt, "Submitting stylization prediction");
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .context("stylization request failed")?;
        let mut prediction = parse_prediction(response).await?;

        loop {
            debug!(prediction_id = %prediction.id, status = %prediction.status, "Prediction status");
            match prediction.status.as_str() {
                "succeeded" => return extract_output_url(prediction.output.as_ref()),
                "failed" | "canceled" => {
                    let reason = prediction
                        .error
                        .as_ref()
                        .map(render_error)
                        .unwrap_or_else(|| "no error detail".to_string());
                    bail!("prediction {} {}: {}", prediction.id, prediction.status, reason);
                }
                _ => {}
            }

            let poll_url = prediction
                .urls
                .as_ref()
                .and_then(|urls| urls.get.clone())
                .unwrap_or_else(|| format!("{}/predictions/{}", self.api_base, prediction.id));

            tokio::time::sleep(self.poll_interval).await;
            let response = self
                .client
                .get(&poll_url)
                .bearer_auth(token)
                .send()
                .await
                .context("stylization status request failed")?;
            prediction = parse_prediction(response).await?;
        }
    }
}

#[async_trait]
impl Stylizer for ReplicateStylizer {
    async fn stylize(&self, edge_map: &Path, prompt: &str) -> Result<String> {
        if !edge_map.exists() {
            bail!("Edge map file not found at: {}", edge_map.display());
        }

        match tokio::time::timeout(self.request_timeout, self.run_prediction(edge_map, prompt)).await
        {
            Ok(result) => result,
            Err(_) => Err(anyhow!(
                "stylization timed out after {}s",
                self.request_timeout.as_secs()
            )),
        }
    }
}

async fn parse_prediction(response: reqwest::Response) -> Result<Prediction> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        bail!("stylization provider error ({}): {}", status.as_u16(), body);
    }
    response
        .json::<Prediction>()
        .await
        .context("invalid prediction payload from stylization provider")
}

/// Models answer with either a list of URLs (first wins) or a single URL.
fn extract_output_url(output: Option<&serde_json::Value>) -> Result<String> {
    let url = match output {
        Some(serde_json::Value::Array(items)) => items.iter().find_map(|v| v.as_str()),
        Some(serde_json::Value::String(url)) => Some(url.as_str()),
        _ => None,
    };
    url.filter(|u| !u.trim().is_empty())
        .map(ToOwned::to_owned)
        .ok_or_else(|| anyhow!("Unexpected output format from stylization model; expected a list of URLs"))
}

fn render_error(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
