//! REST client for the remote coordination service.
//!
//! Endpoints:
//! - `GET  {endpoint}/health`: probed once at connect time.
//! - `POST {endpoint}/tasks/{id}/complete`: one `CompletionReport` per
//!   recorded result.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use tracing::{debug, info, warn};

use crate::error::ReporterError;
use crate::ports::{CompletionReport, ExternalReporter, NoopReporter};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct ReporterConfig {
    /// Base URL, e.g. `https://coordinator.internal/api`.
    pub endpoint: String,
    pub token: Option<String>,
    /// Per-request timeout, probe included.
    pub timeout: Duration,
}

impl ReporterConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

pub struct HttpReporter {
    client: Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpReporter {
    /// Build the client and probe `/health`.
    pub async fn connect(config: ReporterConfig) -> Result<Self, ReporterError> {
        let endpoint = config.endpoint.trim().trim_end_matches('/').to_string();
        if endpoint.is_empty() {
            return Err(ReporterError::InvalidConfig("empty endpoint".to_string()));
        }
        Url::parse(&endpoint)
            .map_err(|err| ReporterError::InvalidConfig(format!("{endpoint}: {err}")))?;
        if config.token.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err(ReporterError::InvalidConfig("empty bearer token".to_string()));
        }

        let client = Client::builder().timeout(config.timeout).build()?;
        let reporter = Self {
            client,
            endpoint,
            token: config.token,
        };
        reporter.probe().await?;
        info!(endpoint = %reporter.endpoint, "external reporter connected");
        Ok(reporter)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn probe(&self) -> Result<(), ReporterError> {
        let url = format!("{}/health", self.endpoint);
        let resp = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|err| ReporterError::Unreachable(format!("{url}: {err}")))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ReporterError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ExternalReporter for HttpReporter {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn report_completion(&self, report: &CompletionReport) -> Result<(), ReporterError> {
        let url = format!("{}/tasks/{}/complete", self.endpoint, report.task_id.get());
        let resp = self
            .authorized(self.client.post(&url))
            .json(report)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ReporterError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        debug!(task_id = %report.task_id, "completion reported");
        Ok(())
    }
}

/// HTTP reporter when configured and reachable; otherwise local-only mode
/// with a warning. Never fails.
pub async fn init_reporter(config: Option<&ReporterConfig>) -> Arc<dyn ExternalReporter> {
    let Some(config) = config else {
        info!("no external reporter configured, running local-only");
        return Arc::new(NoopReporter);
    };
    match HttpReporter::connect(config.clone()).await {
        Ok(reporter) => Arc::new(reporter),
        Err(err) => {
            warn!(
                endpoint = %config.endpoint,
                error = %err,
                "external reporter unavailable, running local-only"
            );
            Arc::new(NoopReporter)
        }
    }
}
