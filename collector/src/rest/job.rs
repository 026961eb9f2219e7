use super::{
    ApiPaths,
    RestClient,
    RestError,
};
use reqwest::Method;
use serde::Deserialize;
use std::time::Duration;
use strum::Display;
use tokio_util::sync::CancellationToken;

/// Fixed interval between job-state polls. Callers bound the total time with
/// their own deadline token.
pub const POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum JobState {
    Running,
    Completed,
    Failed,
    Cancelled,
    Invalid,
}

impl JobState {
    pub fn from_server(state: &str) -> Self {
        match state {
            "COMPLETED" => JobState::Completed,
            "FAILED" => JobState::Failed,
            "CANCELED" | "CANCELLED" | "CANCELLATION_REQUESTED" => JobState::Cancelled,
            "INVALID_STATE" => JobState::Invalid,
            _ => JobState::Running,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Running)
    }
}

#[derive(Deserialize)]
struct JobStatus {
    #[serde(rename = "jobState")]
    job_state: String,
}

/// Polls `job_id` until it reaches a terminal state. Only `COMPLETED` is success.
pub async fn poll_job(
    client: &RestClient,
    paths: &ApiPaths,
    token: &str,
    job_id: &str,
    cancel: &CancellationToken,
) -> Result<(), RestError> {
    let url = paths.job(job_id);
    loop {
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RestError::Cancelled),
            body = client.api_request(&url, token, Method::GET, &[], None) => body?,
        };
        let status: JobStatus = serde_json::from_slice(&body).map_err(|source| RestError::Decode {
            url: url.clone(),
            source,
        })?;
        match JobState::from_server(&status.job_state) {
            JobState::Completed => return Ok(()),
            JobState::Running => {
                trace!(job_id, state = %status.job_state, "job still running");
            },
            state => {
                return Err(RestError::JobState {
                    job_id: job_id.to_string(),
                    state,
                })
            },
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(RestError::Cancelled),
            _ = tokio::time::sleep(POLL_INTERVAL) => {},
        }
    }
}
