//! HTTP client for the remote job service.
//!
//! The client owns a small tokio runtime so the synchronous control threads
//! can call it directly: job checks block on the runtime, progress and ready
//! notifications are spawned onto it and never wait for the reply.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::{Builder, Runtime};
use tracing::debug;
use wash_spine::{ProgressReporter, IDLE_CURSOR};

pub const ENV_BASE_URL: &str = "API_BASE_URL";
pub const ENV_HUB_ID: &str = "HUB_ID";
pub const ENV_DEVICE_ID: &str = "DEVICE_ID";
pub const ENV_REQUEST_TIMEOUT: &str = "REQUEST_TIMEOUT";

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("invalid remote configuration: {0}")]
    Config(String),
    #[error("failed to start client runtime: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("malformed job response: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteConfig {
    pub base_url: String,
    pub hub_id: String,
    pub device_id: i64,
    pub request_timeout: Duration,
}

impl RemoteConfig {
    pub fn new(base_url: impl Into<String>, hub_id: impl Into<String>, device_id: i64) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            hub_id: hub_id.into(),
            device_id,
            request_timeout: Duration::from_secs(10),
        }
    }

    /// Reads the collaborator settings from the process environment.
    /// `Ok(None)` when no base URL is configured.
    pub fn from_env() -> Result<Option<Self>, RemoteError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>, RemoteError> {
        let Some(base_url) = lookup(ENV_BASE_URL).filter(|url| !url.trim().is_empty()) else {
            return Ok(None);
        };
        let hub_id = lookup(ENV_HUB_ID).unwrap_or_default();
        let device_id = match lookup(ENV_DEVICE_ID) {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .map_err(|_| RemoteError::Config(format!("{ENV_DEVICE_ID}={raw} is not an integer")))?,
            None => 0,
        };

        let mut config = Self::new(base_url.trim(), hub_id, device_id);
        if let Some(raw) = lookup(ENV_REQUEST_TIMEOUT) {
            let secs = raw.trim().parse::<u64>().map_err(|_| {
                RemoteError::Config(format!("{ENV_REQUEST_TIMEOUT}={raw} is not a number of seconds"))
            })?;
            config.request_timeout = Duration::from_secs(secs);
        }
        Ok(Some(config))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

/// What the job service wants the washer to do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobStatus {
    pub cursor: f32,
    /// `None` when the service answered without a body.
    pub mode: Option<f32>,
}

impl JobStatus {
    pub fn no_job() -> Self {
        Self {
            cursor: IDLE_CURSOR,
            mode: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.cursor >= IDLE_CURSOR
    }
}

#[derive(Debug, Deserialize)]
struct CheckJobsResponse {
    #[serde(rename = "deviceStatus", default)]
    device_status: Option<Value>,
    #[serde(rename = "washModeValue", default)]
    wash_mode_value: Option<Value>,
}

#[derive(Debug, Serialize)]
struct DeviceBody<'a> {
    hubid: &'a str,
    deviceid: i64,
}

#[derive(Debug, Serialize)]
struct ProgressBody<'a> {
    hubid: &'a str,
    deviceid: i64,
    progress: String,
}

/// Decodes a 200 reply from `/device/checkjobs`.
pub fn parse_job_response(body: &str) -> Result<JobStatus, RemoteError> {
    let response: CheckJobsResponse =
        serde_json::from_str(body).map_err(|err| RemoteError::Parse(err.to_string()))?;
    Ok(JobStatus {
        cursor: parse_status(response.device_status.as_ref()),
        mode: Some(parse_mode(response.wash_mode_value.as_ref())?),
    })
}

/// Anything that is not a plain non-negative number means idle.
fn parse_status(raw: Option<&Value>) -> f32 {
    match raw {
        Some(Value::String(text)) => parse_numeric_text(text).unwrap_or(IDLE_CURSOR),
        Some(Value::Number(number)) => number
            .as_f64()
            .filter(|value| value.is_finite() && *value >= 0.0)
            .map(|value| value as f32)
            .unwrap_or(IDLE_CURSOR),
        _ => IDLE_CURSOR,
    }
}

fn parse_numeric_text(text: &str) -> Option<f32> {
    let text = text.trim();
    let digits = text.chars().filter(char::is_ascii_digit).count();
    let dots = text.chars().filter(|c| *c == '.').count();
    if digits == 0 || dots > 1 || digits + dots != text.len() {
        return None;
    }
    text.parse().ok()
}

fn parse_mode(raw: Option<&Value>) -> Result<f32, RemoteError> {
    match raw {
        None | Some(Value::Null) => Ok(0.0),
        Some(Value::String(text)) if text.trim().is_empty() => Ok(0.0),
        Some(Value::String(text)) => text
            .trim()
            .parse::<f32>()
            .map_err(|_| RemoteError::Parse(format!("washModeValue {text:?} is not a number"))),
        Some(Value::Number(number)) => number
            .as_f64()
            .map(|value| value as f32)
            .ok_or_else(|| RemoteError::Parse(format!("washModeValue {number} out of range"))),
        Some(other) => Err(RemoteError::Parse(format!(
            "washModeValue has unexpected type: {other}"
        ))),
    }
}

pub struct RemoteClient {
    config: RemoteConfig,
    http: reqwest::Client,
    runtime: Arc<Runtime>,
}

impl RemoteClient {
    pub fn new(config: RemoteConfig) -> Result<Self, RemoteError> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("wash-remote")
            .enable_all()
            .build()?;
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(RemoteError::Client)?;
        Ok(Self {
            config,
            http,
            runtime: Arc::new(runtime),
        })
    }

    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn device(&self) -> DeviceBody<'_> {
        DeviceBody {
            hubid: &self.config.hub_id,
            deviceid: self.config.device_id,
        }
    }

    /// Asks the service for the current job. Blocks for at most the request
    /// timeout.
    pub fn check_jobs(&self) -> Result<JobStatus, RemoteError> {
        let url = self.config.url("/device/checkjobs");
        let request = self.http.post(&url).json(&self.device());
        self.runtime.block_on(async move {
            let response = request.send().await?;
            match response.status() {
                StatusCode::OK => {
                    let body = response.text().await?;
                    parse_job_response(&body)
                }
                StatusCode::NO_CONTENT => Ok(JobStatus::no_job()),
                other => Err(RemoteError::Status(other.as_u16())),
            }
        })
    }

    fn post_detached<B: Serialize>(&self, path: &'static str, body: &B) {
        let url = self.config.url(path);
        let request = self.http.post(&url).json(body);
        self.runtime.spawn(async move {
            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(url = %url, status = response.status().as_u16(), "Notification delivered");
                }
                Ok(response) => {
                    debug!(url = %url, status = response.status().as_u16(), "Notification rejected");
                }
                Err(err) => debug!(url = %url, error = %err, "Notification failed"),
            }
        });
    }
}

impl ProgressReporter for RemoteClient {
    fn report_progress(&self, progress: u8) {
        let body = ProgressBody {
            hubid: &self.config.hub_id,
            deviceid: self.config.device_id,
            progress: format!("{progress:02}"),
        };
        self.post_detached("/users/updateProgress", &body);
    }

    fn report_ready(&self) {
        self.post_detached("/users/updateReady", &self.device());
    }
}

impl std::fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteClient")
            .field("base_url", &self.config.base_url)
            .field("hub_id", &self.config.hub_id)
            .field("device_id", &self.config.device_id)
            .finish()
    }
}
