//! Reporting collaborators: per-step screenshots, the final report and the
//! step-generator export. Failures here are logged by the caller and never
//! stop a run.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::config::ReportConfig;
use crate::{Error, Result};

/// Downloadable report produced at the end of a successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportArtifact {
    pub message: String,
    pub file_url: String,
}

#[async_trait]
pub trait Reporter: Send + Sync {
    /// Append one step record with a base64 PNG screenshot.
    async fn add_step(&self, project: &str, step: &str, image_base64: &str) -> Result<()>;

    /// Generate the report for `project`. `None` when reporting is disabled.
    async fn finalize(&self, project: &str) -> Result<Option<ReportArtifact>>;

    /// Forward a parsed step to the step generator.
    async fn export_step(&self, thought: &str, action: &str, dom: &str) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopReporter;

#[async_trait]
impl Reporter for NoopReporter {
    async fn add_step(&self, _: &str, _: &str, _: &str) -> Result<()> {
        Ok(())
    }

    async fn finalize(&self, _: &str) -> Result<Option<ReportArtifact>> {
        Ok(None)
    }

    async fn export_step(&self, _: &str, _: &str, _: &str) -> Result<()> {
        Ok(())
    }
}

/// HTTP reporter. Each endpoint is optional; an absent one is a no-op.
pub struct HttpReporter {
    client: reqwest::Client,
    reporter_url: Option<String>,
    generator_url: Option<String>,
}

impl HttpReporter {
    pub fn new(reporter_url: Option<&str>, generator_url: Option<&str>) -> Self {
        Self {
            client: reqwest::Client::new(),
            reporter_url: reporter_url.map(|u| u.trim_end_matches('/').to_string()),
            generator_url: generator_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    pub fn from_config(config: &ReportConfig) -> Self {
        Self::new(
            config.reporter_url.as_deref(),
            config.generator_url.as_deref(),
        )
    }
}

fn steps_url(base: &str, project: &str) -> String {
    format!("{}/api/steps/{}", base, project)
}

fn generate_url(base: &str, project: &str) -> String {
    format!("{}/api/generate/{}", base, project)
}

fn export_body(thought: &str, action: &str, dom: &str) -> Value {
    json!({
        "Thought": thought.replace('"', "'"),
        "Action": action.replace('"', "'"),
        "Dom": dom.replace('"', "'"),
    })
}

async fn check(response: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(Error::Report(format!("{} failed: {} {}", what, status, body)))
}

#[async_trait]
impl Reporter for HttpReporter {
    async fn add_step(&self, project: &str, step: &str, image_base64: &str) -> Result<()> {
        let Some(base) = &self.reporter_url else {
            return Ok(());
        };
        let response = self
            .client
            .post(steps_url(base, project))
            .json(&json!({ "step": step, "imageBase64": image_base64 }))
            .send()
            .await?;
        check(response, "add step").await?;
        debug!("report: step added to {}", project);
        Ok(())
    }

    async fn finalize(&self, project: &str) -> Result<Option<ReportArtifact>> {
        let Some(base) = &self.reporter_url else {
            return Ok(None);
        };
        let response = self.client.get(generate_url(base, project)).send().await?;
        let artifact: ReportArtifact = check(response, "generate report").await?.json().await?;
        Ok(Some(artifact))
    }

    async fn export_step(&self, thought: &str, action: &str, dom: &str) -> Result<()> {
        let Some(base) = &self.generator_url else {
            return Ok(());
        };
        let response = self
            .client
            .post(format!("{}/api/steps", base))
            .json(&export_body(thought, action, dom))
            .send()
            .await?;
        check(response, "export step").await?;
        Ok(())
    }
}
