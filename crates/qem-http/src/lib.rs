//! reqwest-backed implementations of the `qem-core` gateway traits.
//!
//! One [`HttpClient`] serves all three seams. Every request goes through the
//! configured [`RetryPolicy`]; connection failures, timeouts and 5xx answers
//! are retried, everything else is returned as is.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Response, StatusCode};
use serde_json::Value;
use tracing::debug;

use qem_core::domain::incident::RawIncident;
use qem_core::gateway::{
    CloudImageSource, DashboardGateway, RepoMetadataSource, RepoReply, ScheduledJob,
};
use qem_core::{FetchError, RetryPolicy};

/// Settings for [`HttpClient`].
#[derive(Debug, Clone)]
pub struct HttpConfig {
    /// Dashboard base URL, with trailing slash.
    pub dashboard_url: String,
    /// Dashboard API token, sent as `Authorization: Token …`.
    pub token: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            dashboard_url: qem_core::config::DEFAULT_DASHBOARD_URL.to_string(),
            token: None,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("failed to build HTTP client: {0}")]
    Build(#[from] reqwest::Error),
}

pub struct HttpClient {
    client: reqwest::Client,
    config: HttpConfig,
}

impl HttpClient {
    pub fn new(config: HttpConfig) -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .user_agent(format!("qem-bot/{}", qem_core::VERSION))
            .timeout(config.timeout)
            .build()?;
        Ok(Self { client, config })
    }

    fn dashboard(&self, path: &str) -> String {
        format!("{}{}", self.config.dashboard_url, path)
    }

    /// GET `url`. Server errors become [`FetchError::Status`] so the retry
    /// policy can see them.
    async fn send(&self, url: &str, authorized: bool) -> Result<Response, FetchError> {
        let mut request = self.client.get(url);
        if authorized {
            if let Some(token) = &self.config.token {
                request = request.header(AUTHORIZATION, format!("Token {}", token));
            }
        }
        let response = request.send().await.map_err(|e| classify(&e))?;
        let status = response.status();
        if status.is_server_error() {
            return Err(status_error(status, url));
        }
        Ok(response)
    }

    /// GET and decode JSON. With `require_success`, 4xx answers are errors;
    /// otherwise their body is decoded too.
    async fn get_value(
        &self,
        url: &str,
        authorized: bool,
        require_success: bool,
    ) -> Result<Value, FetchError> {
        self.config
            .retry
            .run(url, || async move {
                let response = self.send(url, authorized).await?;
                let status = response.status();
                if require_success && !status.is_success() {
                    return Err(status_error(status, url));
                }
                response.json::<Value>().await.map_err(|e| classify(&e))
            })
            .await
    }
}

#[async_trait]
impl RepoMetadataSource for HttpClient {
    async fn fetch(&self, url: &str) -> Result<RepoReply, FetchError> {
        let result = self
            .config
            .retry
            .run(url, || async move {
                let response = self.send(url, false).await?;
                let status = response.status();
                if !status.is_success() {
                    return Ok(RepoReply::Missing {
                        status: status.as_u16(),
                    });
                }
                let body = response.bytes().await.map_err(|e| classify(&e))?;
                Ok(RepoReply::Found(body.to_vec()))
            })
            .await;

        match result {
            // Out of retries on a server error: the repository is skipped.
            Err(FetchError::Status { status, .. }) => {
                debug!(url = %url, status, "Repository metadata unavailable");
                Ok(RepoReply::Missing { status })
            }
            other => other,
        }
    }
}

#[async_trait]
impl DashboardGateway for HttpClient {
    async fn scheduled_jobs(&self, incident_id: u64) -> Result<Vec<ScheduledJob>, FetchError> {
        let url = self.dashboard(&format!("api/incident_settings/{}", incident_id));
        let value = self.get_value(&url, true, false).await?;
        Ok(ScheduledJob::list_from_value(&value))
    }

    async fn incidents(&self) -> Result<Vec<RawIncident>, FetchError> {
        let url = self.dashboard("api/incidents");
        let value = self.get_value(&url, true, true).await?;
        serde_json::from_value(value).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

#[async_trait]
impl CloudImageSource for HttpClient {
    async fn get_json(&self, url: &str) -> Result<Value, FetchError> {
        self.get_value(url, false, true).await
    }
}

fn status_error(status: StatusCode, url: &str) -> FetchError {
    FetchError::Status {
        status: status.as_u16(),
        url: url.to_string(),
    }
}

fn classify(err: &reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(err.to_string())
    } else if err.is_decode() {
        FetchError::Decode(err.to_string())
    } else if let Some(status) = err.status() {
        FetchError::Status {
            status: status.as_u16(),
            url: err.url().map(|u| u.to_string()).unwrap_or_default(),
        }
    } else {
        FetchError::Transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dashboard_paths() {
        let client = HttpClient::new(HttpConfig {
            dashboard_url: "http://dash/".to_string(),
            ..HttpConfig::default()
        })
        .unwrap();
        assert_eq!(
            client.dashboard("api/incident_settings/5"),
            "http://dash/api/incident_settings/5"
        );
    }
}
