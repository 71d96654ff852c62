//! Request layer for the prediction proxy.
//!
//! Two endpoints, both behind the same base URL:
//! - `POST /api/predictions` creates a job
//! - `GET /api/predictions?ids=a,b,c` returns the status of many jobs in one call
//!
//! Nothing here retries. A failed call is reported once and the next poll
//! cycle naturally asks again.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::prediction::{RemoteJob, error_message};
use crate::version::user_agent;

pub const PREDICTIONS_PATH: &str = "/api/predictions";

#[derive(Debug, thiserror::Error)]
pub enum RemoteServiceError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("prediction service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("prediction service error: {0}")]
    Service(String),

    #[error("unexpected response from prediction service: {0}")]
    Decode(String),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: std::env::var("EASEL_API_URL")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| "http://localhost:3000".to_string()),
            timeout: Duration::from_secs(
                std::env::var("EASEL_HTTP_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .unwrap_or(30),
            ),
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }
}

/// The two calls the lifecycle manager makes against the remote service.
#[async_trait]
pub trait PredictionApi: Send + Sync {
    async fn create(
        &self,
        credential: Option<&str>,
        input: &serde_json::Value,
    ) -> Result<RemoteJob, RemoteServiceError>;

    /// Fetch the status of every id in a single request.
    ///
    /// An empty id list must not touch the network.
    async fn poll_batch(
        &self,
        credential: Option<&str>,
        ids: &[String],
    ) -> Result<Vec<RemoteJob>, RemoteServiceError>;
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    input: &'a serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
}

pub struct HttpPredictionClient {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpPredictionClient {
    pub fn new(config: ClientConfig) -> Result<Self, RemoteServiceError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent())
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            endpoint: format!("{}{}", config.base_url.trim_end_matches('/'), PREDICTIONS_PATH),
            client,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Read a response body as JSON, turning non-2xx statuses into errors.
///
/// Error statuses whose body carries an `error` field report that message.
async fn read_json(response: reqwest::Response) -> Result<serde_json::Value, RemoteServiceError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        let message = serde_json::from_str::<serde_json::Value>(&body)
            .ok()
            .and_then(|v| error_message(v.get("error")));
        return Err(match message {
            Some(message) => RemoteServiceError::Service(message),
            None => RemoteServiceError::Status {
                status: status.as_u16(),
                body,
            },
        });
    }

    serde_json::from_str(&body).map_err(|e| RemoteServiceError::Decode(e.to_string()))
}

fn decode_job(value: serde_json::Value) -> Result<RemoteJob, RemoteServiceError> {
    serde_json::from_value(value).map_err(|e| RemoteServiceError::Decode(e.to_string()))
}

/// Normalize a poll response to a list of jobs.
///
/// The proxy answers with either a single job object or an array of them. A
/// top-level object with an `error` but no `id` means the whole batch failed.
/// Array entries that do not decode are logged and skipped.
pub fn normalize_poll_response(
    value: serde_json::Value,
) -> Result<Vec<RemoteJob>, RemoteServiceError> {
    match value {
        serde_json::Value::Array(items) => Ok(items
            .into_iter()
            .filter_map(|item| {
                let id = item.get("id").cloned();
                match decode_job(item) {
                    Ok(job) => Some(job),
                    Err(e) => {
                        tracing::warn!(
                            id = ?id,
                            error = %e,
                            "Skipping undecodable job in poll response"
                        );
                        None
                    }
                }
            })
            .collect()),
        serde_json::Value::Object(ref map) if !map.contains_key("id") => {
            match error_message(map.get("error")) {
                Some(message) => Err(RemoteServiceError::Service(message)),
                None => Err(RemoteServiceError::Decode(
                    "job object without an id".to_string(),
                )),
            }
        }
        serde_json::Value::Object(_) => Ok(vec![decode_job(value)?]),
        other => Err(RemoteServiceError::Decode(format!(
            "expected a job or a list of jobs, got {other}"
        ))),
    }
}

#[async_trait]
impl PredictionApi for HttpPredictionClient {
    async fn create(
        &self,
        credential: Option<&str>,
        input: &serde_json::Value,
    ) -> Result<RemoteJob, RemoteServiceError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&CreateRequest {
                input,
                token: credential,
            })
            .send()
            .await?;

        let value = read_json(response).await?;
        if let Some(message) = error_message(value.get("error")) {
            return Err(RemoteServiceError::Service(message));
        }

        let job = decode_job(value)?;
        tracing::debug!(remote_job_id = %job.id, status = %job.status, "Prediction created");
        Ok(job)
    }

    async fn poll_batch(
        &self,
        credential: Option<&str>,
        ids: &[String],
    ) -> Result<Vec<RemoteJob>, RemoteServiceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query = vec![("ids", ids.join(","))];
        if let Some(token) = credential {
            query.push(("token", token.to_string()));
        }

        let response = self
            .client
            .get(&self.endpoint)
            .query(&query)
            .send()
            .await?;

        let jobs = normalize_poll_response(read_json(response).await?)?;
        tracing::debug!(requested = ids.len(), returned = jobs.len(), "Polled predictions");
        Ok(jobs)
    }
}
