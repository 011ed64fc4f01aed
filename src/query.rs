//! Query execution engine.
//!
//! A [`Query`] pairs a model schema with [`SearchCriteria`] and turns them
//! into network calls according to the schema's [`SearchKind`]:
//!
//! - **Simple**: one GET returns every object. Criteria are evaluated
//!   client-side and the filtered list is cached on the query until a
//!   builder method changes the criteria.
//! - **Paginated**: POST searches windowed by `start`/`rows`. Each batch asks
//!   for at most `batch_size` rows and never more than the caller's window
//!   still needs. Iteration stops at the server-reported total, which is
//!   clamped to what was actually observed when a page comes back short.
//!   Nothing is cached; re-iterating issues fresh requests.
//! - **AsyncJob**: the search is submitted as a job, polled until every
//!   shard has reported, and then read in batches from the job's results
//!   endpoint.
//!
//! Results are read lazily through [`Results`], or collected with
//! [`Query::all`], [`Query::slice`], [`Query::first`] and [`Query::one`].
//! Device-style resources additionally support cursor scrolling through
//! [`Query::scroll`].

use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, instrument};

use crate::client::ApiClient;
use crate::criteria::{QueryPart, SearchCriteria, SearchRequest, SortOrder, TimeRange};
use crate::error::{ApiError, Result};
use crate::job::{AsyncJob, DEFAULT_POLL_INTERVAL};
use crate::model::Model;
use crate::schema::{ModelSchema, SearchKind};

/// Rows per request unless overridden with [`Query::batch_size`].
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Largest page the scroll endpoint accepts.
pub const MAX_SCROLL_ROWS: usize = 10_000;

/// One page of documents plus the total the server reported with it.
#[derive(Debug, Default)]
struct Page {
    items: Vec<Map<String, Value>>,
    total: usize,
}

fn documents(body: &Value, key: Option<&str>) -> Vec<Map<String, Value>> {
    let list = match key {
        Some(key) => body.get(key),
        None => Some(body),
    };
    list.and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_object().cloned())
                .collect()
        })
        .unwrap_or_default()
}

fn reported(body: &Value) -> Option<usize> {
    let read = |key: &str| body.get(key).and_then(Value::as_u64);
    let total = match (read("num_found"), read("num_available")) {
        (Some(found), Some(available)) => found.min(available),
        (Some(n), None) | (None, Some(n)) => n,
        (None, None) => return None,
    };
    Some(usize::try_from(total).unwrap_or(usize::MAX))
}

fn reported_total(body: &Value) -> usize {
    reported(body).unwrap_or(0)
}

/// A search over one model type.
#[derive(Debug, Clone)]
pub struct Query {
    api: Arc<ApiClient>,
    schema: &'static ModelSchema,
    criteria: SearchCriteria,
    batch_size: usize,
    timeout: Option<Duration>,
    poll_interval: Duration,
    cached: Option<Vec<Map<String, Value>>>,
    job: Option<AsyncJob>,
    job_total: Option<usize>,
    search_after: Option<String>,
    num_remaining: Option<usize>,
}

impl Query {
    /// Starts an unfiltered query for `schema`.
    ///
    /// # Errors
    ///
    /// `ApiError::Api` when the model type cannot be searched.
    pub fn new(api: &Arc<ApiClient>, schema: &'static ModelSchema) -> Result<Self> {
        if matches!(schema.search, SearchKind::Unsearchable) {
            return Err(ApiError::Api(format!("{} objects cannot be searched", schema.name)));
        }
        Ok(Query {
            api: Arc::clone(api),
            schema,
            criteria: SearchCriteria::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            cached: None,
            job: None,
            job_total: None,
            search_after: None,
            num_remaining: None,
        })
    }

    /// The model type being searched.
    pub fn schema(&self) -> &'static ModelSchema {
        self.schema
    }

    /// The client this query runs against.
    pub fn api(&self) -> &Arc<ApiClient> {
        &self.api
    }

    /// Accumulated criteria.
    pub fn criteria(&self) -> &SearchCriteria {
        &self.criteria
    }

    /// Token of the submitted search job, if any.
    pub fn job_id(&self) -> Option<&str> {
        self.job.as_ref().and_then(AsyncJob::job_id)
    }

    /// Remaining rows reported by the last [`Query::scroll`] call.
    pub fn num_remaining(&self) -> Option<usize> {
        self.num_remaining
    }

    // ── Builder ──────────────────────────────────────────────────────

    fn changed(mut self) -> Self {
        self.cached = None;
        self.job = None;
        self.job_total = None;
        self.search_after = None;
        self.num_remaining = None;
        self
    }

    /// Adds a predicate (conjunctive with earlier ones).
    pub fn where_(mut self, part: impl Into<QueryPart>) -> Result<Self> {
        self.criteria.query.where_(part)?;
        Ok(self.changed())
    }

    /// Conjoins a predicate.
    pub fn and_(mut self, part: impl Into<QueryPart>) -> Result<Self> {
        self.criteria.query.and_(part)?;
        Ok(self.changed())
    }

    /// Disjoins a predicate.
    pub fn or_(mut self, part: impl Into<QueryPart>) -> Result<Self> {
        self.criteria.query.or_(part)?;
        Ok(self.changed())
    }

    /// Conjoins a negated predicate.
    pub fn not_(mut self, part: impl Into<QueryPart>) -> Result<Self> {
        self.criteria.query.not_(part)?;
        Ok(self.changed())
    }

    /// Restricts `key` to the given values; repeated calls append.
    pub fn add_criteria<I, V>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.criteria
            .add_criteria(key, values.into_iter().map(Into::into).collect());
        self.changed()
    }

    /// Excludes the given values of `key`; repeated calls append.
    pub fn add_exclusions<I, V>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.criteria
            .add_exclusions(key, values.into_iter().map(Into::into).collect());
        self.changed()
    }

    /// Sets the time-range filter.
    pub fn set_time_range(mut self, range: TimeRange) -> Self {
        self.criteria.set_time_range(range);
        self.changed()
    }

    /// Adds a sort key.
    pub fn sort_by(mut self, field: &str, order: SortOrder) -> Self {
        self.criteria.sort_by(field, order);
        self.changed()
    }

    /// Rows requested per page (minimum 1).
    pub fn batch_size(mut self, rows: usize) -> Self {
        self.batch_size = rows.max(1);
        self
    }

    /// Bounds total polling time for job-based searches.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Pause between job status checks.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Renders the request envelope for one page.
    pub fn request(&self, start: Option<usize>, rows: Option<usize>) -> SearchRequest {
        self.criteria.build_request(start, rows)
    }

    // ── Strategy plumbing ────────────────────────────────────────────

    fn model(&self, doc: Map<String, Value>) -> Model {
        // Simple list endpoints return summaries; everything else returns
        // complete documents.
        let full_doc = !matches!(self.schema.search, SearchKind::Simple { .. });
        Model::from_document(&self.api, self.schema, doc, full_doc)
    }

    async fn simple_results(&mut self) -> Result<&[Map<String, Value>]> {
        let SearchKind::Simple { path, results_key } = self.schema.search else {
            return Err(ApiError::Api("not a simple query".to_string()));
        };
        if self.cached.is_none() {
            let path = self.api.path(path, None, None);
            let body = self.api.get_object(&path, &[]).await?;
            let docs: Vec<_> = documents(&body, results_key)
                .into_iter()
                .filter(|doc| self.criteria.matches(doc))
                .collect();
            debug!(model = self.schema.name, count = docs.len(), "cached simple query results");
            self.cached = Some(docs);
        }
        Ok(self.cached.as_deref().unwrap_or_default())
    }

    async fn validate_query(&self, validation_path: &'static str) -> Result<()> {
        let q = self.criteria.query.collapse();
        if q.is_empty() {
            return Ok(());
        }
        let path = self.api.path(validation_path, None, None);
        let body = self.api.get_object(&path, &[("q", q)]).await?;
        if body.get("valid").and_then(Value::as_bool) == Some(false) {
            let message = body
                .get("invalid_message")
                .and_then(Value::as_str)
                .unwrap_or("query rejected by search validation")
                .to_string();
            return Err(ApiError::QuerySyntax { uri: path, message });
        }
        Ok(())
    }

    fn new_job(&self) -> Result<AsyncJob> {
        let SearchKind::AsyncJob {
            submit_path,
            results_path,
            ..
        } = self.schema.search
        else {
            return Err(ApiError::Api(format!(
                "{} searches do not run as jobs",
                self.schema.name
            )));
        };
        let mut job = AsyncJob::new(
            self.api.path(submit_path, None, None),
            self.api.path(results_path, None, None),
        );
        job.timeout = self.timeout;
        job.poll_interval = self.poll_interval;
        Ok(job)
    }

    /// Validates and submits the search job.
    ///
    /// # Errors
    ///
    /// - `ApiError::Api` if the job was already submitted or the model
    ///   type does not search through jobs.
    /// - `ApiError::QuerySyntax` if search validation rejects the query.
    #[instrument(skip(self), fields(model = self.schema.name))]
    pub async fn submit(&mut self) -> Result<String> {
        if self.job.is_some() {
            return Err(ApiError::Api("query has already been submitted".to_string()));
        }
        let mut job = self.new_job()?;
        if let SearchKind::AsyncJob {
            validation_path: Some(validation_path),
            ..
        } = self.schema.search
        {
            self.validate_query(validation_path).await?;
        }
        let request = self.request(None, None);
        let job_id = job.submit(&self.api, &request).await?.to_string();
        self.job = Some(job);
        Ok(job_id)
    }

    fn job_mut(&mut self) -> Result<&mut AsyncJob> {
        self.job
            .as_mut()
            .ok_or_else(|| ApiError::Api("search job has not been submitted".to_string()))
    }

    async fn job_ready(&mut self) -> Result<usize> {
        if let Some(total) = self.job_total {
            return Ok(total);
        }
        if self.job.is_none() {
            self.submit().await?;
        }
        let api = Arc::clone(&self.api);
        let status = self.job_mut()?.wait(&api).await?;
        let total = usize::try_from(status.total()).unwrap_or(usize::MAX);
        self.job_total = Some(total);
        Ok(total)
    }

    async fn fetch_page(&mut self, start: usize, rows: usize) -> Result<Page> {
        match self.schema.search {
            SearchKind::Unsearchable => Err(ApiError::Api(format!(
                "{} objects cannot be searched",
                self.schema.name
            ))),
            SearchKind::Simple { .. } => {
                let all = self.simple_results().await?;
                let items = all.iter().skip(start).take(rows).cloned().collect();
                Ok(Page {
                    items,
                    total: all.len(),
                })
            }
            SearchKind::Paginated { path, .. } => {
                let path = self.api.path(path, None, None);
                let body = self
                    .api
                    .post_json(&path, &self.request(Some(start), Some(rows)))
                    .await?;
                Ok(Page {
                    items: documents(&body, Some("results")),
                    total: reported_total(&body),
                })
            }
            SearchKind::AsyncJob { .. } => {
                let total = self.job_ready().await?;
                if start >= total {
                    return Ok(Page {
                        items: Vec::new(),
                        total,
                    });
                }
                let path = self.job_mut()?.results_path()?;
                let params = [("start", start.to_string()), ("rows", rows.to_string())];
                let body = self.api.get_object(&path, &params).await?;
                Ok(Page {
                    items: documents(&body, Some("results")),
                    total: reported(&body).map_or(total, |r| total.min(r)),
                })
            }
        }
    }

    // ── Execution ────────────────────────────────────────────────────

    /// Total number of matching objects.
    ///
    /// Paginated searches ask the server with `rows=0` on every call.
    /// Job-based searches submit the job if needed and then always re-check
    /// its status, even when a total is already known.
    pub async fn count(&mut self) -> Result<usize> {
        match self.schema.search {
            SearchKind::Paginated { .. } => Ok(self.fetch_page(0, 0).await?.total),
            SearchKind::AsyncJob { .. } => {
                if self.job.is_none() {
                    self.submit().await?;
                }
                let api = Arc::clone(&self.api);
                let status = self.job_mut()?.wait(&api).await?;
                let total = usize::try_from(status.total()).unwrap_or(usize::MAX);
                self.job_total = Some(total);
                Ok(total)
            }
            _ => Ok(self.fetch_page(0, 0).await?.total),
        }
    }

    /// A lazy cursor over every result.
    pub fn results(&mut self) -> Results<'_> {
        Results::new(self, 0, None)
    }

    /// A lazy cursor over results `start..end` (`end` exclusive).
    pub fn window(&mut self, start: usize, end: Option<usize>) -> Results<'_> {
        Results::new(self, start, end)
    }

    /// Collects every result.
    pub async fn all(&mut self) -> Result<Vec<Model>> {
        self.results().collect().await
    }

    /// Collects the results in `range`, fetching only the rows it covers.
    ///
    /// Negative bounds count from the end and need a [`Query::count`] first.
    pub async fn slice(&mut self, range: impl RangeBounds<isize>) -> Result<Vec<Model>> {
        let needs_count = matches!(range.start_bound(), Bound::Included(s) | Bound::Excluded(s) if *s < 0)
            || matches!(range.end_bound(), Bound::Included(e) | Bound::Excluded(e) if *e < 0);
        let len = if needs_count {
            Some(self.count().await?)
        } else {
            None
        };

        let resolve = |i: isize| -> usize {
            if i >= 0 {
                i.unsigned_abs()
            } else {
                len.unwrap_or(0).saturating_sub(i.unsigned_abs())
            }
        };
        let start = match range.start_bound() {
            Bound::Included(s) => resolve(*s),
            Bound::Excluded(s) => resolve(*s) + 1,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(e) => Some(resolve(*e) + 1),
            Bound::Excluded(e) => Some(resolve(*e)),
            Bound::Unbounded => None,
        };
        if end.is_some_and(|e| e <= start) {
            return Ok(Vec::new());
        }
        self.window(start, end).collect().await
    }

    /// The result at `index`, if it exists.
    pub async fn nth(&mut self, index: isize) -> Result<Option<Model>> {
        let next = index.checked_add(1).unwrap_or(isize::MAX);
        let end = if next == 0 { None } else { Some(next) };
        let mut items = match end {
            Some(end) => self.slice(index..end).await?,
            None => self.slice(index..).await?,
        };
        Ok(if items.is_empty() {
            None
        } else {
            Some(items.swap_remove(0))
        })
    }

    /// The first result, or `None` when nothing matches.
    pub async fn first(&mut self) -> Result<Option<Model>> {
        let mut cursor = self.window(0, Some(1));
        cursor.next().await
    }

    /// The only result.
    ///
    /// # Errors
    ///
    /// `ApiError::MoreThanOneResult` when zero or several objects match.
    pub async fn one(&mut self) -> Result<Model> {
        let mut cursor = self.window(0, Some(2));
        let mut found = Vec::new();
        while let Some(model) = cursor.next().await? {
            found.push(model);
        }
        let total = cursor.total().unwrap_or(found.len()).max(found.len());
        match (found.pop(), found.is_empty()) {
            (Some(model), true) => Ok(model),
            _ => Err(ApiError::MoreThanOneResult { found: total }),
        }
    }

    /// Fetches the next batch through the scroll cursor.
    ///
    /// `rows` is capped at 10 000. The remaining count is an estimate: the
    /// first call derives it from `num_found`, later calls subtract what
    /// they received, because totals can shift while scrolling. Once it
    /// reaches zero, further calls return an empty batch without a request.
    #[instrument(skip(self), fields(model = self.schema.name))]
    pub async fn scroll(&mut self, rows: usize) -> Result<Vec<Model>> {
        let SearchKind::Paginated {
            scroll_path: Some(scroll_path),
            ..
        } = self.schema.search
        else {
            return Err(ApiError::Api(format!(
                "{} searches do not support scrolling",
                self.schema.name
            )));
        };
        if self.num_remaining == Some(0) {
            return Ok(Vec::new());
        }

        let mut request = self.request(None, Some(rows.clamp(1, MAX_SCROLL_ROWS)));
        request.search_after = self.search_after.clone();
        let path = self.api.path(scroll_path, None, None);
        let body = self.api.post_json(&path, &request).await?;

        let docs = documents(&body, Some("results"));
        self.num_remaining = Some(match (self.search_after.is_some(), self.num_remaining) {
            (true, Some(left)) => left.saturating_sub(docs.len()),
            _ => reported_total(&body).saturating_sub(docs.len()),
        });
        self.search_after = body
            .get("search_after")
            .and_then(Value::as_str)
            .map(str::to_string);
        if self.search_after.is_none() {
            self.num_remaining = Some(0);
        }
        Ok(docs.into_iter().map(|doc| self.model(doc)).collect())
    }

    /// Runs [`Query::all`] on a background task of the current runtime.
    pub fn execute_async(&self) -> JoinHandle<Result<Vec<Model>>> {
        let mut query = self.clone();
        tokio::spawn(async move { query.all().await })
    }

    /// Runs [`Query::all`] on a background task of `handle`'s runtime.
    pub fn execute_async_on(&self, handle: &Handle) -> JoinHandle<Result<Vec<Model>>> {
        let mut query = self.clone();
        handle.spawn(async move { query.all().await })
    }
}

/// Lazy cursor over a window of query results.
///
/// Pages are requested only as the cursor advances. Each page asks for at
/// most the query's batch size and never past the window's end.
#[derive(Debug)]
pub struct Results<'q> {
    query: &'q mut Query,
    next_start: usize,
    end: Option<usize>,
    total: Option<usize>,
    buffer: VecDeque<Map<String, Value>>,
    done: bool,
}

impl<'q> Results<'q> {
    fn new(query: &'q mut Query, start: usize, end: Option<usize>) -> Self {
        Results {
            query,
            next_start: start,
            end,
            total: None,
            buffer: VecDeque::new(),
            done: false,
        }
    }

    /// Server-reported total, once the first page has arrived.
    pub fn total(&self) -> Option<usize> {
        self.total
    }

    /// Advances the cursor.
    pub async fn next(&mut self) -> Result<Option<Model>> {
        loop {
            if let Some(doc) = self.buffer.pop_front() {
                return Ok(Some(self.query.model(doc)));
            }
            if self.done {
                return Ok(None);
            }

            let limit = match (self.end, self.total) {
                (Some(end), Some(total)) => Some(end.min(total)),
                (end, total) => end.or(total),
            };
            if limit.is_some_and(|limit| self.next_start >= limit) {
                self.done = true;
                continue;
            }

            let mut rows = self.query.batch_size;
            if let Some(limit) = limit {
                rows = rows.min(limit - self.next_start);
            }
            let page = self.query.fetch_page(self.next_start, rows).await?;
            let received = page.items.len();
            let mut total = page.total;
            if received < rows && self.next_start + received < total {
                debug!(
                    reported = total,
                    observed = self.next_start + received,
                    "short page; clamping total"
                );
                total = self.next_start + received;
            }
            self.total = Some(total);
            if received == 0 {
                self.done = true;
            }
            self.next_start += received;
            self.buffer.extend(page.items);
        }
    }

    /// Drains the cursor into a vector.
    pub async fn collect(mut self) -> Result<Vec<Model>> {
        let mut out = Vec::new();
        while let Some(model) = self.next().await? {
            out.push(model);
        }
        Ok(out)
    }
}
