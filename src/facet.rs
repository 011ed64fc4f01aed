//! Facet queries: server-side bucket counts instead of matching objects.
//!
//! A [`FacetQuery`] shares the search criteria of a regular query and adds
//! term facets (one bucket per distinct field value) and range facets
//! (fixed-width buckets over a numeric or time field). Requested field
//! names and range descriptions are checked against the model's allow-lists
//! as they are added, so a typo fails before anything is sent.

use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::instrument;

use crate::client::ApiClient;
use crate::criteria::{QueryPart, RangeRequest, SearchCriteria, SearchRequest, TermsRequest, TimeRange};
use crate::error::{ApiError, Result};
use crate::job::{AsyncJob, DEFAULT_POLL_INTERVAL};
use crate::schema::{FacetEndpoint, FacetSupport, ModelSchema};

const RANGE_KEYS: [&str; 4] = ["field", "start", "end", "bucket_size"];

/// One bucket of a facet.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FacetBucket {
    /// Bucket key as sent by the server.
    #[serde(default)]
    pub id: Option<Value>,
    /// Display name (a string, number, or timestamp depending on the field).
    #[serde(default)]
    pub name: Option<Value>,
    /// Objects falling into the bucket.
    #[serde(default)]
    pub total: u64,
}

/// Buckets for one term-facet field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TermFacet {
    /// Faceted field.
    pub field: String,
    /// Buckets, most frequent first.
    #[serde(default)]
    pub values: Vec<FacetBucket>,
}

/// Buckets for one range facet.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RangeFacet {
    /// Faceted field.
    pub field: String,
    /// Range start as echoed by the server.
    #[serde(default)]
    pub start: Value,
    /// Range end.
    #[serde(default)]
    pub end: Value,
    /// Bucket width.
    #[serde(default)]
    pub bucket_size: Value,
    /// One bucket per step.
    #[serde(default)]
    pub values: Vec<FacetBucket>,
}

/// Aggregate returned by a facet request.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct FacetResult {
    /// Term facets. Some endpoints call this list `results`.
    #[serde(default, alias = "results")]
    pub terms: Vec<TermFacet>,
    /// Range facets.
    #[serde(default)]
    pub ranges: Vec<RangeFacet>,
    /// Objects matching the criteria, when reported.
    #[serde(default)]
    pub num_found: Option<u64>,
}

impl FacetResult {
    /// Term facet for `field`, if requested.
    pub fn term(&self, field: &str) -> Option<&TermFacet> {
        self.terms.iter().find(|t| t.field == field)
    }

    /// Range facet for `field`, if requested.
    pub fn range(&self, field: &str) -> Option<&RangeFacet> {
        self.ranges.iter().find(|r| r.field == field)
    }
}

impl RangeRequest {
    /// Builds a range request from a JSON object with exactly the keys
    /// `field`, `start`, `end` and `bucket_size`.
    pub fn from_value(value: &Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(ApiError::InvalidArgument(
                "range facet must be an object".to_string(),
            ));
        };
        if let Some(extra) = map.keys().find(|k| !RANGE_KEYS.contains(&k.as_str())) {
            return Err(ApiError::InvalidArgument(format!(
                "unexpected key '{extra}' in range facet"
            )));
        }
        let get = |key: &str| {
            map.get(key).cloned().ok_or_else(|| {
                ApiError::InvalidArgument(format!("range facet is missing '{key}'"))
            })
        };
        let field = match get("field")? {
            Value::String(s) => s,
            other => {
                return Err(ApiError::InvalidArgument(format!(
                    "range facet field must be a string, got {other}"
                )));
            }
        };
        Ok(RangeRequest {
            field,
            start: get("start")?,
            end: get("end")?,
            bucket_size: get("bucket_size")?,
        })
    }
}

/// Facet request builder and executor.
#[derive(Debug, Clone)]
pub struct FacetQuery {
    api: Arc<ApiClient>,
    schema: &'static ModelSchema,
    support: FacetSupport,
    criteria: SearchCriteria,
    fields: Vec<String>,
    rows: Option<usize>,
    ranges: Vec<RangeRequest>,
    timeout: Option<Duration>,
    poll_interval: Duration,
}

impl FacetQuery {
    /// Starts a facet query for `schema`.
    ///
    /// # Errors
    ///
    /// `ApiError::Api` if the model type has no facet endpoint.
    pub fn new(api: &Arc<ApiClient>, schema: &'static ModelSchema) -> Result<Self> {
        let support = schema.facets.ok_or_else(|| {
            ApiError::Api(format!("{} objects do not support facets", schema.name))
        })?;
        Ok(FacetQuery {
            api: Arc::clone(api),
            schema,
            support,
            criteria: SearchCriteria::new(),
            fields: Vec::new(),
            rows: None,
            ranges: Vec::new(),
            timeout: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
        })
    }

    /// Adds a term facet.
    ///
    /// # Errors
    ///
    /// `ApiError::InvalidArgument` if `field` is not facetable.
    pub fn add_facet_field(mut self, field: &str) -> Result<Self> {
        if !self.support.term_fields.contains(&field) {
            return Err(ApiError::InvalidArgument(format!(
                "'{field}' is not a valid facet field for {}",
                self.schema.name
            )));
        }
        if !self.fields.iter().any(|f| f == field) {
            self.fields.push(field.to_string());
        }
        Ok(self)
    }

    /// Adds a range facet.
    ///
    /// # Errors
    ///
    /// `ApiError::InvalidArgument` if the field does not allow range facets.
    pub fn add_range(mut self, range: RangeRequest) -> Result<Self> {
        if !self.support.range_fields.contains(&range.field.as_str()) {
            return Err(ApiError::InvalidArgument(format!(
                "'{}' is not a valid range facet field for {}",
                range.field, self.schema.name
            )));
        }
        self.ranges.push(range);
        Ok(self)
    }

    /// Adds a range facet described as a JSON object.
    pub fn add_range_value(self, range: &Value) -> Result<Self> {
        let range = RangeRequest::from_value(range)?;
        self.add_range(range)
    }

    /// Buckets returned per term facet.
    pub fn set_rows(mut self, rows: usize) -> Self {
        self.rows = Some(rows);
        self
    }

    /// Adds a predicate.
    pub fn where_(mut self, part: impl Into<QueryPart>) -> Result<Self> {
        self.criteria.query.where_(part)?;
        Ok(self)
    }

    /// Conjoins a predicate.
    pub fn and_(mut self, part: impl Into<QueryPart>) -> Result<Self> {
        self.criteria.query.and_(part)?;
        Ok(self)
    }

    /// Restricts `key` to the given values.
    pub fn add_criteria<I, V>(mut self, key: &str, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        self.criteria
            .add_criteria(key, values.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the time-range filter.
    pub fn set_time_range(mut self, range: TimeRange) -> Self {
        self.criteria.set_time_range(range);
        self
    }

    /// Bounds polling time for job-based facets.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Pause between facet job status checks.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Renders the facet request envelope.
    pub fn request(&self) -> SearchRequest {
        let mut request = self.criteria.build_request(None, None);
        if !self.fields.is_empty() {
            request.terms = Some(TermsRequest {
                fields: self.fields.clone(),
                rows: self.rows,
            });
        }
        request.ranges = self.ranges.clone();
        request
    }

    /// Executes the facet request.
    ///
    /// # Errors
    ///
    /// `ApiError::InvalidArgument` when no facet was requested; otherwise
    /// transport and timeout errors.
    #[instrument(skip(self), fields(model = self.schema.name))]
    pub async fn results(&self) -> Result<FacetResult> {
        if self.fields.is_empty() && self.ranges.is_empty() {
            return Err(ApiError::InvalidArgument(
                "facet query needs at least one term field or range".to_string(),
            ));
        }
        let request = self.request();
        let body = match self.support.endpoint {
            FacetEndpoint::Direct { path } => {
                let path = self.api.path(path, None, None);
                self.api.post_json(&path, &request).await?
            }
            FacetEndpoint::Job {
                submit_path,
                results_path,
            } => {
                let mut job = AsyncJob::for_facets(
                    self.api.path(submit_path, None, None),
                    self.api.path(results_path, None, None),
                );
                job.timeout = self.timeout;
                job.poll_interval = self.poll_interval;
                job.submit(&self.api, &request).await?;
                job.wait(&self.api).await?.body
            }
        };
        Ok(serde_json::from_value(body)?)
    }
}
