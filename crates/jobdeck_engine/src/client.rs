use std::time::Duration;

use deck_logging::{deck_debug, deck_trace};
use futures_util::StreamExt;
use jobdeck_core::{ControlAck, ItemResult, JobAction, JobId, JobSnapshot, MessageId, VmSnapshot};
use reqwest::header::ACCEPT;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::stream::{decode_lines, EventLines};
use crate::{BackendKind, CreateJobRequest, CreatedJob, FailureKind, OpError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    /// Root of the REST surface. Without one the session runs in demo mode.
    pub base_url: Option<Url>,
    pub connect_timeout: Duration,
    /// Bound on every REST call, body included.
    pub request_timeout: Duration,
    /// Longest silence tolerated on an open event stream.
    pub stream_idle_timeout: Duration,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            base_url: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(15),
            stream_idle_timeout: Duration::from_secs(60),
        }
    }
}

/// Everything the engine needs from the job backend. One call, one request, no retries.
#[async_trait::async_trait]
pub trait JobBackend: Send + Sync {
    fn backend_kind(&self) -> BackendKind;

    async fn create_job(&self, request: &CreateJobRequest) -> Result<CreatedJob, OpError>;

    async fn launch_job(&self, job_id: &JobId) -> Result<ControlAck, OpError>;

    /// `Start`, `Pause`, `Resume` or `Stop`.
    async fn control_job(&self, job_id: &JobId, action: JobAction) -> Result<ControlAck, OpError>;

    async fn job_status(&self, job_id: &JobId) -> Result<JobSnapshot, OpError>;

    async fn job_results(&self, job_id: &JobId) -> Result<Vec<ItemResult>, OpError>;

    async fn delete_job(&self, job_id: &JobId) -> Result<(), OpError>;

    async fn vm_status(&self) -> Result<VmSnapshot, OpError>;

    async fn vm_start(&self) -> Result<(), OpError>;

    async fn vm_stop(&self) -> Result<(), OpError>;

    async fn open_bulk_stream(&self, message_ids: &[MessageId]) -> Result<EventLines, OpError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestBackend {
    settings: BackendSettings,
    base_url: Url,
    client: reqwest::Client,
}

impl ReqwestBackend {
    pub fn new(settings: BackendSettings) -> Result<Self, OpError> {
        let base_url = settings
            .base_url
            .clone()
            .ok_or_else(|| OpError::unreachable("no backend endpoint configured"))?;
        let client = reqwest::Client::builder()
            .connect_timeout(settings.connect_timeout)
            .read_timeout(settings.stream_idle_timeout)
            .build()
            .map_err(|err| OpError::unreachable(err.to_string()))?;
        Ok(Self {
            settings,
            base_url,
            client,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> Result<Url, OpError> {
        let joined = format!("{}/{}", self.base_url.as_str().trim_end_matches('/'), path);
        Url::parse(&joined).map_err(|err| OpError::unreachable(format!("bad endpoint {joined}: {err}")))
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, OpError> {
        let url = self.endpoint(path)?;
        deck_trace!("{} {}", method, url);
        Ok(self
            .client
            .request(method, url)
            .timeout(self.settings.request_timeout))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, OpError> {
        let response = request.send().await.map_err(map_reqwest_error)?;
        ensure_success(response).await
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, OpError> {
        let response = self.send(request).await?;
        let status = response.status().as_u16();
        response.json::<T>().await.map_err(|err| {
            if err.is_timeout() {
                map_reqwest_error(err)
            } else {
                OpError::rejected(status, format!("unexpected response body: {err}"))
            }
        })
    }

    /// Control endpoints may answer with an empty body.
    async fn send_ack(&self, request: RequestBuilder) -> Result<ControlAck, OpError> {
        let response = self.send(request).await?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(map_reqwest_error)?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(ControlAck::default());
        }
        serde_json::from_slice(&body)
            .map_err(|err| OpError::rejected(status, format!("unexpected response body: {err}")))
    }
}

#[async_trait::async_trait]
impl JobBackend for ReqwestBackend {
    fn backend_kind(&self) -> BackendKind {
        BackendKind::Live
    }

    async fn create_job(&self, request: &CreateJobRequest) -> Result<CreatedJob, OpError> {
        self.send_json(self.request(Method::POST, "jobs")?.json(request))
            .await
    }

    async fn launch_job(&self, job_id: &JobId) -> Result<ControlAck, OpError> {
        self.send_ack(self.request(Method::POST, &format!("jobs/{job_id}/launch"))?)
            .await
    }

    async fn control_job(&self, job_id: &JobId, action: JobAction) -> Result<ControlAck, OpError> {
        match action {
            JobAction::Start | JobAction::Pause | JobAction::Resume | JobAction::Stop => {}
            other => {
                return Err(OpError::new(
                    FailureKind::InvalidInput,
                    format!("{other} has its own endpoint"),
                ))
            }
        }
        self.send_ack(self.request(Method::POST, &format!("jobs/{job_id}/{action}"))?)
            .await
    }

    async fn job_status(&self, job_id: &JobId) -> Result<JobSnapshot, OpError> {
        self.send_json(self.request(Method::GET, &format!("jobs/{job_id}"))?)
            .await
    }

    async fn job_results(&self, job_id: &JobId) -> Result<Vec<ItemResult>, OpError> {
        self.send_json(self.request(Method::GET, &format!("jobs/{job_id}/results"))?)
            .await
    }

    async fn delete_job(&self, job_id: &JobId) -> Result<(), OpError> {
        self.send(self.request(Method::DELETE, &format!("jobs/{job_id}"))?)
            .await
            .map(|_| ())
    }

    async fn vm_status(&self) -> Result<VmSnapshot, OpError> {
        self.send_json(self.request(Method::GET, "vm/status")?).await
    }

    async fn vm_start(&self) -> Result<(), OpError> {
        self.send(self.request(Method::POST, "vm/start")?)
            .await
            .map(|_| ())
    }

    async fn vm_stop(&self) -> Result<(), OpError> {
        self.send(self.request(Method::POST, "vm/stop")?)
            .await
            .map(|_| ())
    }

    async fn open_bulk_stream(&self, message_ids: &[MessageId]) -> Result<EventLines, OpError> {
        let mut url = self.endpoint("bulk-reply-stream")?;
        let ids = message_ids
            .iter()
            .map(MessageId::as_str)
            .collect::<Vec<_>>()
            .join(",");
        url.query_pairs_mut().append_pair("ids", &ids);
        deck_debug!("Opening bulk reply stream {}", url);

        // No overall timeout here: the stream lives as long as the operation.
        let request = self
            .client
            .get(url)
            .header(ACCEPT, "text/event-stream, application/x-ndjson");
        let response = self.send(request).await?;
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(map_reqwest_error));
        Ok(decode_lines(bytes))
    }
}

async fn ensure_success(response: Response) -> Result<Response, OpError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(OpError::rejected(status.as_u16(), rejection_reason(status, &body)))
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn rejection_reason(status: reqwest::StatusCode, body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(reason) = parsed.error.or(parsed.message) {
            return reason;
        }
    }
    let body = body.trim();
    if body.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request rejected")
            .to_string()
    } else {
        body.to_string()
    }
}

/// Only a failed connect counts as unreachable; it is what switches a session to demo.
pub(crate) fn map_reqwest_error(err: reqwest::Error) -> OpError {
    let kind = if err.is_connect() {
        FailureKind::Unreachable
    } else if err.is_timeout() {
        FailureKind::Timeout
    } else {
        FailureKind::Rejected {
            status: err.status().map(|status| status.as_u16()),
        }
    };
    OpError::new(kind, err.to_string())
}
