//! Authenticated HTTP access to the cluster's REST API.

mod job;

pub use job::{
    poll_job,
    JobState,
    POLL_INTERVAL,
};
use reqwest::{
    header::{
        AUTHORIZATION,
        CONTENT_TYPE,
    },
    Method,
};
use serde::Deserialize;
use std::{
    future::Future,
    sync::OnceLock,
    time::Duration,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug)]
pub enum RestError {
    #[error("request to {url} timed out after {timeout_secs}s")]
    Timeout { url: String, timeout_secs: u64 },

    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned status {status}: {body}")]
    Status { url: String, status: u16, body: String },

    #[error("could not decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("job {job_id} finished in state {state}")]
    JobState { job_id: String, state: JobState },

    #[error("cancelled")]
    Cancelled,
}

static CLIENT: OnceLock<RestClient> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    timeout_secs: u64,
}

#[derive(Deserialize)]
struct QueryId {
    id: String,
}

impl RestClient {
    pub fn new(allow_insecure: bool, timeout_secs: u64) -> Result<Self, RestError> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(allow_insecure)
            .timeout(Duration::from_secs(timeout_secs.max(1)))
            .build()
            .map_err(|source| RestError::Transport {
                url: String::new(),
                source,
            })?;
        Ok(Self { http, timeout_secs })
    }

    /// Process-wide client, built on the first call. Later calls reuse it.
    pub fn init(allow_insecure: bool, timeout_secs: u64) -> Result<&'static RestClient, RestError> {
        if let Some(client) = CLIENT.get() {
            return Ok(client);
        }
        let client = Self::new(allow_insecure, timeout_secs)?;
        Ok(CLIENT.get_or_init(|| client))
    }

    pub fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    /// Sends one request with `Authorization: _dremio<token>` and returns the body.
    pub async fn api_request(
        &self,
        url: &str,
        token: &str,
        method: Method,
        headers: &[(&str, &str)],
        body: Option<String>,
    ) -> Result<Vec<u8>, RestError> {
        let mut request = self
            .http
            .request(method.clone(), url)
            .header(AUTHORIZATION, format!("_dremio{token}"));
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        if let Some(body) = body {
            request = request.header(CONTENT_TYPE, "application/json").body(body);
        }

        trace!(%method, url, "rest request");
        let response = request.send().await.map_err(|e| self.classify(url, e))?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| self.classify(url, e))?;
        if !status.is_success() {
            let text = String::from_utf8_lossy(&bytes);
            return Err(RestError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                body: text.chars().take(512).collect(),
            });
        }
        Ok(bytes.to_vec())
    }

    /// Submits `sql_body` (a `{"sql": ...}` document) and returns the job id.
    pub async fn post_query(
        &self,
        url: &str,
        token: &str,
        headers: &[(&str, &str)],
        sql_body: &str,
    ) -> Result<String, RestError> {
        let body = self
            .api_request(url, token, Method::POST, headers, Some(sql_body.to_string()))
            .await?;
        let id: QueryId = serde_json::from_slice(&body).map_err(|source| RestError::Decode {
            url: url.to_string(),
            source,
        })?;
        Ok(id.id)
    }

    fn classify(&self, url: &str, err: reqwest::Error) -> RestError {
        if err.is_timeout() {
            RestError::Timeout {
                url: url.to_string(),
                timeout_secs: self.timeout_secs,
            }
        } else {
            RestError::Transport {
                url: url.to_string(),
                source: err,
            }
        }
    }
}

/// Races a request against `cancel`.
pub async fn cancellable<T>(
    cancel: &CancellationToken,
    request: impl Future<Output = Result<T, RestError>>,
) -> Result<T, RestError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(RestError::Cancelled),
        result = request => result,
    }
}

/// Endpoint layout for self-managed and cloud deployments.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiPaths {
    base: String,
    cloud_project: Option<String>,
}

impl ApiPaths {
    pub fn new(endpoint: &str, cloud_project: Option<&str>) -> Self {
        Self {
            base: endpoint.trim_end_matches('/').to_string(),
            cloud_project: cloud_project.filter(|p| !p.is_empty()).map(str::to_string),
        }
    }

    pub fn is_cloud(&self) -> bool {
        self.cloud_project.is_some()
    }

    fn v3(&self, path: &str) -> String {
        match &self.cloud_project {
            Some(project) => format!("{}/v0/projects/{project}/{path}", self.base),
            None => format!("{}/api/v3/{path}", self.base),
        }
    }

    pub fn sql(&self) -> String {
        self.v3("sql")
    }

    pub fn job(&self, job_id: &str) -> String {
        self.v3(&format!("job/{job_id}"))
    }

    /// `suffix` is the `?offset=..&limit=..` query string.
    pub fn job_results(&self, job_id: &str, suffix: &str) -> String {
        format!("{}/results{suffix}", self.job(job_id))
    }

    pub fn wlm_queues(&self) -> String {
        self.v3("wlm/queue")
    }

    pub fn wlm_rules(&self) -> String {
        self.v3("wlm/rule")
    }

    pub fn engines(&self) -> String {
        self.v3("engines")
    }

    pub fn cluster_usage(&self) -> String {
        self.v3("cluster/usage")
    }

    pub fn kvstore_report(&self) -> String {
        format!("{}/apiv2/kvstore/report", self.base)
    }

    pub fn job_profile(&self, job_id: &str) -> String {
        match &self.cloud_project {
            Some(project) => format!("{}/ui/projects/{project}/support/{job_id}/download", self.base),
            None => format!("{}/apiv2/support/{job_id}/download", self.base),
        }
    }
}
