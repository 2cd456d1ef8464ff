//! Poll a remote object until it reaches a target state.

use std::future::Future;
use std::time::Duration;

use serde_json::Value;

use crate::client::ServiceClient;
use crate::error::{SdkError, SdkResult};
use crate::json::path_search_str;

/// Polling parameters; mirrors the state-change configuration every
/// resource builds before waiting.
#[derive(Debug, Clone)]
pub struct WaitConf {
    pub pending: Vec<String>,
    pub target: Vec<String>,
    pub timeout: Duration,
    /// Wait before the first refresh
    pub delay: Duration,
    pub poll_interval: Duration,
    /// Target must be observed this many times in a row
    pub continuous_target_occurrence: u32,
}

impl WaitConf {
    pub fn new(pending: &[&str], target: &[&str], timeout: Duration) -> Self {
        Self {
            pending: pending.iter().map(|s| s.to_string()).collect(),
            target: target.iter().map(|s| s.to_string()).collect(),
            timeout,
            delay: Duration::from_secs(10),
            poll_interval: Duration::from_secs(10),
            continuous_target_occurrence: 1,
        }
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn continuous_target_occurrence(mut self, n: u32) -> Self {
        self.continuous_target_occurrence = n.max(1);
        self
    }

    fn target_display(&self) -> String {
        self.target.join(", ")
    }
}

/// Call `refresh` until it reports a target state.
///
/// `refresh` returns the object and its current state. A state outside
/// `pending` and `target` fails the wait, unless `pending` is empty.
pub async fn wait_for_state<F, Fut>(conf: &WaitConf, mut refresh: F) -> SdkResult<Value>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SdkResult<(Value, String)>>,
{
    let mut last_state = String::new();
    let polling = async {
        tokio::time::sleep(conf.delay).await;
        let mut seen = 0;
        loop {
            let (object, state) = refresh().await?;
            log::debug!("waiting for [{}], current state: {}", conf.target_display(), state);
            last_state = state.clone();

            if conf.target.contains(&state) {
                seen += 1;
                if seen >= conf.continuous_target_occurrence {
                    return Ok::<Value, SdkError>(object);
                }
            } else {
                seen = 0;
                if !conf.pending.is_empty() && !conf.pending.contains(&state) {
                    return Err(SdkError::UnexpectedState {
                        state,
                        target: conf.target_display(),
                    });
                }
            }

            tokio::time::sleep(conf.poll_interval).await;
        }
    };

    let outcome = tokio::time::timeout(conf.timeout, polling).await;
    match outcome {
        Ok(result) => result,
        Err(_) => Err(SdkError::Timeout {
            target: conf.target_display(),
            last_state,
            timeout: conf.timeout,
        }),
    }
}

/// Wait for an ECS/EVS asynchronous job: `GET v1/{project_id}/jobs/{job_id}`.
///
/// Returns the job body once `status` is `SUCCESS`.
pub async fn wait_for_job(client: &ServiceClient, job_id: &str, conf: &WaitConf) -> SdkResult<Value> {
    let url = client.build_path("v1/{project_id}/jobs/{job_id}", &[("job_id", job_id)]);
    let conf = WaitConf {
        pending: vec!["INIT".into(), "RUNNING".into()],
        target: vec!["SUCCESS".into()],
        ..conf.clone()
    };

    let url = &url;
    wait_for_state(&conf, || async move {
        let job = client.get(url).await?;
        let status = path_search_str("status", &job)
            .ok_or_else(|| SdkError::missing(format!("status of job {}", job_id)))?;
        if status == "FAIL" {
            let reason = path_search_str("fail_reason", &job)
                .or_else(|| path_search_str("entities.sub_jobs[0].fail_reason", &job))
                .unwrap_or_else(|| "unknown".to_string());
            return Err(SdkError::JobFailed {
                job_id: job_id.to_string(),
                reason,
            });
        }
        // Anything that is not terminal keeps us polling
        let state = if status == "SUCCESS" { status } else { "RUNNING".to_string() };
        Ok((job, state))
    })
    .await
}
