//! Asynchronous search jobs.
//!
//! Process searches and process facets do not answer inline. The backend
//! follows a submit-then-poll pattern:
//!
//! 1. **POST** the search envelope to the submission endpoint. The response
//!    carries a `job_id`.
//! 2. **GET** the results endpoint with `rows=0` until `completed` reaches
//!    `contacted`, i.e. every distributed shard has reported. A `contacted`
//!    of zero means the job is still warming up.
//! 3. **GET** the results endpoint again with `start`/`rows` to read the
//!    matching documents in batches.
//!
//! [`AsyncJob`] owns steps 1 and 2, including the caller's timeout. Polling
//! sleeps a fixed interval between checks and never backs off; these jobs
//! are short-lived.

use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::client::ApiClient;
use crate::criteria::SearchRequest;
use crate::error::{ApiError, Result};

/// Default pause between status checks.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Controls polling of long-running server-side requests (workflow
/// updates, live response sessions and commands).
///
/// Defaults: a check every 2 seconds for at most 5 minutes.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Pause before each check.
    pub interval: Duration,
    /// Maximum total polling time, measured from the first check.
    pub timeout: Duration,
}

impl PollConfig {
    /// Creates a `PollConfig` with the given interval and timeout.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        PollConfig { interval, timeout }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        PollConfig {
            interval: Duration::from_secs(2),
            timeout: Duration::from_secs(300),
        }
    }
}

/// Repeats `check` until it yields a value.
///
/// Each round sleeps `config.interval` first, then fails with
/// `ApiError::Timeout` if `config.timeout` has elapsed, then runs the check.
/// `Ok(None)` means "not yet".
pub async fn poll_until<T, F, Fut>(config: &PollConfig, what: &str, mut check: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let started = Instant::now();
    loop {
        tokio::time::sleep(config.interval).await;

        if started.elapsed() > config.timeout {
            return Err(ApiError::Timeout {
                message: format!("{what} not finished after {:?}", started.elapsed()),
            });
        }
        if let Some(done) = check().await? {
            return Ok(done);
        }
    }
}

/// One status report of a search job.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobStatus {
    /// Shards the job was dispatched to.
    #[serde(default)]
    pub contacted: u64,
    /// Shards that have reported.
    #[serde(default)]
    pub completed: u64,
    /// Matches found so far.
    #[serde(default)]
    pub num_found: Option<u64>,
    /// Matches that can actually be paged through.
    #[serde(default)]
    pub num_available: Option<u64>,
    /// The full status document.
    #[serde(skip)]
    pub body: Value,
}

impl JobStatus {
    /// Parses a status document, keeping the raw body.
    pub fn from_value(body: Value) -> Result<Self> {
        let mut status: JobStatus = serde_json::from_value(body.clone())?;
        status.body = body;
        Ok(status)
    }

    /// `true` once every contacted shard has completed.
    pub fn is_complete(&self) -> bool {
        self.contacted > 0 && self.completed >= self.contacted
    }

    /// Result count to page through: the smaller of `num_found` and
    /// `num_available` when both are reported.
    pub fn total(&self) -> u64 {
        match (self.num_found, self.num_available) {
            (Some(found), Some(available)) => found.min(available),
            (Some(n), None) | (None, Some(n)) => n,
            (None, None) => 0,
        }
    }
}

/// Submission and polling state of one search job.
#[derive(Debug, Clone)]
pub struct AsyncJob {
    submit_path: String,
    results_template: String,
    status_params: Vec<(&'static str, String)>,
    job_id: Option<String>,
    submitted_at: Option<Instant>,
    timed_out: bool,
    /// Upper bound on total polling time, measured from submission.
    pub timeout: Option<Duration>,
    /// Pause between status checks.
    pub poll_interval: Duration,
}

impl AsyncJob {
    /// A search job. `results_template` keeps its `{job_id}` placeholder.
    pub fn new(submit_path: String, results_template: String) -> Self {
        AsyncJob {
            submit_path,
            results_template,
            status_params: vec![("start", "0".to_string()), ("rows", "0".to_string())],
            job_id: None,
            submitted_at: None,
            timed_out: false,
            timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// A facet job; its status checks send no paging parameters.
    pub fn for_facets(submit_path: String, results_template: String) -> Self {
        AsyncJob {
            status_params: Vec::new(),
            ..AsyncJob::new(submit_path, results_template)
        }
    }

    /// The server-issued job token, once submitted.
    pub fn job_id(&self) -> Option<&str> {
        self.job_id.as_deref()
    }

    /// `true` after a successful [`AsyncJob::submit`].
    pub fn is_submitted(&self) -> bool {
        self.job_id.is_some()
    }

    /// `true` once a status check has exceeded the timeout.
    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    /// Results endpoint for the submitted job.
    pub fn results_path(&self) -> Result<String> {
        let job_id = self
            .job_id
            .as_deref()
            .ok_or_else(|| ApiError::Api("search job has not been submitted".to_string()))?;
        Ok(self.results_template.replace("{job_id}", job_id))
    }

    /// Submits the job and records its token.
    ///
    /// # Errors
    ///
    /// - `ApiError::Api` if this job was already submitted, or the response
    ///   carries no `job_id`.
    /// - Any transport error from the POST.
    pub async fn submit(&mut self, api: &ApiClient, request: &SearchRequest) -> Result<&str> {
        if self.job_id.is_some() {
            return Err(ApiError::Api("query has already been submitted".to_string()));
        }
        let body = api.post_json(&self.submit_path, request).await?;
        let job_id = match body.get("job_id") {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Number(n)) => n.to_string(),
            _ => {
                return Err(ApiError::Api(format!(
                    "job submission to {} returned no job_id",
                    self.submit_path
                )));
            }
        };
        info!(%job_id, path = %self.submit_path, "submitted search job");
        self.submitted_at = Some(Instant::now());
        Ok(self.job_id.insert(job_id).as_str())
    }

    /// Performs one status check.
    ///
    /// The timeout is enforced here: once the time since submission exceeds
    /// it, this check and every later one fail with `ApiError::Timeout`
    /// without contacting the server.
    pub async fn status(&mut self, api: &ApiClient) -> Result<JobStatus> {
        let path = self.results_path()?;
        if self.timed_out {
            return Err(self.timeout_error());
        }
        if let (Some(timeout), Some(at)) = (self.timeout, self.submitted_at) {
            if at.elapsed() > timeout {
                self.timed_out = true;
                return Err(self.timeout_error());
            }
        }

        let status = JobStatus::from_value(api.get_object(&path, &self.status_params).await?)?;
        debug!(
            contacted = status.contacted,
            completed = status.completed,
            total = status.total(),
            "search job status"
        );
        Ok(status)
    }

    /// Polls until the job completes, returning the final status.
    ///
    /// The first check is immediate; later checks are spaced by
    /// `poll_interval`.
    pub async fn wait(&mut self, api: &ApiClient) -> Result<JobStatus> {
        loop {
            let status = self.status(api).await?;
            if status.is_complete() {
                return Ok(status);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    fn timeout_error(&self) -> ApiError {
        ApiError::Timeout {
            message: format!(
                "search job {} did not complete within {} ms",
                self.job_id.as_deref().unwrap_or("<unsubmitted>"),
                self.timeout.map(|t| t.as_millis()).unwrap_or_default()
            ),
        }
    }
}
