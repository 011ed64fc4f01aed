//! Search predicates and the search-request envelope.
//!
//! [`QueryBuilder`] accumulates a free-text predicate either as raw
//! query-language strings or as structured [`Predicate`] trees (not both).
//! [`SearchCriteria`] adds field criteria, exclusions, a time range, and a
//! sort order, and renders everything into a [`SearchRequest`], the JSON
//! body the search endpoints accept. Nothing in this module performs I/O.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{ApiError, Result};

/// A structured search predicate in the backend's query language.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// `field:value`
    Term {
        /// Field name.
        field: String,
        /// Matched value.
        value: Value,
    },
    /// All children must match.
    And(Vec<Predicate>),
    /// Any child may match.
    Or(Vec<Predicate>),
    /// The child must not match.
    Not(Box<Predicate>),
}

impl Predicate {
    /// `field:value`
    pub fn term(field: &str, value: impl Into<Value>) -> Self {
        Predicate::Term {
            field: field.to_string(),
            value: value.into(),
        }
    }

    /// Conjunction, flattening nested conjunctions.
    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::And(mut a), Predicate::And(b)) => {
                a.extend(b);
                Predicate::And(a)
            }
            (Predicate::And(mut a), b) => {
                a.push(b);
                Predicate::And(a)
            }
            (a, b) => Predicate::And(vec![a, b]),
        }
    }

    /// Disjunction, flattening nested disjunctions.
    pub fn or(self, other: Predicate) -> Self {
        match (self, other) {
            (Predicate::Or(mut a), Predicate::Or(b)) => {
                a.extend(b);
                Predicate::Or(a)
            }
            (Predicate::Or(mut a), b) => {
                a.push(b);
                Predicate::Or(a)
            }
            (a, b) => Predicate::Or(vec![a, b]),
        }
    }

    /// Negation.
    pub fn negate(self) -> Self {
        match self {
            Predicate::Not(inner) => *inner,
            other => Predicate::Not(Box::new(other)),
        }
    }

    /// Evaluates the predicate against a document, for client-side filtering.
    ///
    /// A term matches when the field equals the value, or when the field is
    /// an array containing it. String comparison ignores ASCII case.
    pub fn matches(&self, doc: &Map<String, Value>) -> bool {
        match self {
            Predicate::Term { field, value } => doc
                .get(field)
                .is_some_and(|actual| value_matches(actual, value)),
            Predicate::And(children) => children.iter().all(|p| p.matches(doc)),
            Predicate::Or(children) => children.iter().any(|p| p.matches(doc)),
            Predicate::Not(inner) => !inner.matches(doc),
        }
    }

    fn fmt_nested(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::And(c) | Predicate::Or(c) if c.len() > 1 => write!(f, "({self})"),
            _ => write!(f, "{self}"),
        }
    }
}

fn value_matches(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Array(items), _) => items.iter().any(|item| value_matches(item, expected)),
        (Value::String(a), Value::String(e)) => a.eq_ignore_ascii_case(e),
        (Value::Number(a), Value::Number(e)) => a.as_f64() == e.as_f64(),
        (Value::String(a), Value::Number(e)) => a == &e.to_string(),
        (Value::Number(a), Value::String(e)) => &a.to_string() == e,
        (a, e) => a == e,
    }
}

/// Escapes query-language metacharacters in a term value.
fn escape_term(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(
            ch,
            '+' | '-' | '&' | '|' | '!' | '(' | ')' | '{' | '}' | '[' | ']' | '^' | '"' | '~'
                | '*' | '?' | ':' | '\\' | '/' | ' '
        ) {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Term { field, value } => match value {
                Value::String(s) => write!(f, "{field}:{}", escape_term(s)),
                other => write!(f, "{field}:{other}"),
            },
            Predicate::And(children) | Predicate::Or(children) => {
                let op = if matches!(self, Predicate::And(_)) {
                    " AND "
                } else {
                    " OR "
                };
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        f.write_str(op)?;
                    }
                    child.fmt_nested(f)?;
                }
                Ok(())
            }
            Predicate::Not(inner) => {
                f.write_str("NOT ")?;
                inner.fmt_nested(f)
            }
        }
    }
}

/// Either form accepted by the builder's `where_`/`and_`/`or_`/`not_`.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryPart {
    /// A raw query-language string.
    Raw(String),
    /// A structured predicate.
    Structured(Predicate),
}

impl From<&str> for QueryPart {
    fn from(s: &str) -> Self {
        QueryPart::Raw(s.to_string())
    }
}

impl From<String> for QueryPart {
    fn from(s: String) -> Self {
        QueryPart::Raw(s)
    }
}

impl From<Predicate> for QueryPart {
    fn from(p: Predicate) -> Self {
        QueryPart::Structured(p)
    }
}

/// Accumulates the free-text predicate of a search.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryBuilder {
    raw: Vec<String>,
    structured: Option<Predicate>,
}

impl QueryBuilder {
    /// An empty builder (matches everything).
    pub fn new() -> Self {
        Self::default()
    }

    fn check_form(&self, part: &QueryPart) -> Result<()> {
        let mixed = match part {
            QueryPart::Raw(_) => self.structured.is_some(),
            QueryPart::Structured(_) => !self.raw.is_empty(),
        };
        if mixed {
            return Err(ApiError::InvalidArgument(
                "cannot mix raw query strings and structured predicates".to_string(),
            ));
        }
        Ok(())
    }

    fn combine(&mut self, part: QueryPart, joiner: &str, merge: fn(Predicate, Predicate) -> Predicate) -> Result<()> {
        self.check_form(&part)?;
        match part {
            QueryPart::Raw(s) => {
                if !self.raw.is_empty() && !joiner.is_empty() {
                    self.raw.push(joiner.to_string());
                }
                self.raw.push(s);
            }
            QueryPart::Structured(p) => {
                self.structured = Some(match self.structured.take() {
                    Some(existing) => merge(existing, p),
                    None => p,
                });
            }
        }
        Ok(())
    }

    /// Adds a predicate; successive calls are conjunctive.
    pub fn where_(&mut self, part: impl Into<QueryPart>) -> Result<()> {
        self.combine(part.into(), "", Predicate::and)
    }

    /// Conjoins a predicate.
    pub fn and_(&mut self, part: impl Into<QueryPart>) -> Result<()> {
        self.combine(part.into(), "AND", Predicate::and)
    }

    /// Disjoins a predicate.
    pub fn or_(&mut self, part: impl Into<QueryPart>) -> Result<()> {
        self.combine(part.into(), "OR", Predicate::or)
    }

    /// Conjoins the negation of a predicate.
    pub fn not_(&mut self, part: impl Into<QueryPart>) -> Result<()> {
        let negated = match part.into() {
            QueryPart::Raw(s) => QueryPart::Raw(format!("NOT {s}")),
            QueryPart::Structured(p) => QueryPart::Structured(p.negate()),
        };
        self.combine(negated, "AND", Predicate::and)
    }

    /// `true` when no predicate has been added.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty() && self.structured.is_none()
    }

    /// The structured predicate, if the builder holds one.
    pub fn predicate(&self) -> Option<&Predicate> {
        self.structured.as_ref()
    }

    /// Renders the predicate; empty means "match everything".
    pub fn collapse(&self) -> String {
        match &self.structured {
            Some(p) => p.to_string(),
            None => self.raw.join(" "),
        }
    }
}

/// Time-range filter of a search.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TimeRange {
    /// Explicit bounds, rendered as ISO-8601 strings.
    Absolute {
        /// Inclusive start.
        #[serde(skip_serializing_if = "Option::is_none", serialize_with = "iso")]
        start: Option<DateTime<Utc>>,
        /// Exclusive end.
        #[serde(skip_serializing_if = "Option::is_none", serialize_with = "iso")]
        end: Option<DateTime<Utc>>,
    },
    /// A relative window such as `-2w` or `-30d`.
    Window {
        /// Window expression.
        window: String,
    },
    /// A relative range, for endpoints that name the key `range`.
    Range {
        /// Range expression.
        range: String,
    },
}

fn iso<S: serde::Serializer>(ts: &Option<DateTime<Utc>>, s: S) -> std::result::Result<S::Ok, S::Error> {
    match ts {
        Some(ts) => s.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true)),
        None => s.serialize_none(),
    }
}

impl TimeRange {
    /// Builds a time range from either explicit bounds or a relative window.
    ///
    /// Supplying both forms, or neither, is an error.
    pub fn new(
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
        window: Option<&str>,
    ) -> Result<Self> {
        let has_bounds = start.is_some() || end.is_some();
        match (has_bounds, window) {
            (true, Some(_)) => Err(ApiError::InvalidArgument(
                "specify either start/end or a relative window, not both".to_string(),
            )),
            (true, None) => Ok(TimeRange::Absolute { start, end }),
            (false, Some(w)) => Ok(TimeRange::Window {
                window: w.to_string(),
            }),
            (false, None) => Err(ApiError::InvalidArgument(
                "a time range needs start/end or a window".to_string(),
            )),
        }
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    /// Ascending.
    Asc,
    /// Descending.
    Desc,
}

/// One sort key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SortField {
    /// Field name.
    pub field: String,
    /// Direction.
    pub order: SortOrder,
}

/// Term-facet section of a facet request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TermsRequest {
    /// Fields to bucket.
    pub fields: Vec<String>,
    /// Buckets per field.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
}

/// One range-facet request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RangeRequest {
    /// Field to bucket.
    pub field: String,
    /// Range start (number or date expression).
    pub start: Value,
    /// Range end.
    pub end: Value,
    /// Bucket width (number or duration expression such as `"+1DAY"`).
    pub bucket_size: Value,
}

/// JSON body accepted by the search, scroll, job and facet endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SearchRequest {
    /// Field → allowed values.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub criteria: BTreeMap<String, Vec<Value>>,
    /// Field → excluded values.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub exclusions: BTreeMap<String, Vec<Value>>,
    /// Rendered predicate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
    /// Time-range filter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    /// Page size.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<usize>,
    /// Page offset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<usize>,
    /// Sort keys.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortField>,
    /// Scroll continuation cursor.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search_after: Option<String>,
    /// Term facets.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terms: Option<TermsRequest>,
    /// Range facets.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub ranges: Vec<RangeRequest>,
}

/// Everything that narrows a search, independent of paging.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchCriteria {
    /// Free-text predicate.
    pub query: QueryBuilder,
    criteria: BTreeMap<String, Vec<Value>>,
    exclusions: BTreeMap<String, Vec<Value>>,
    time_range: Option<TimeRange>,
    sort: Vec<SortField>,
}

fn append_unique(map: &mut BTreeMap<String, Vec<Value>>, key: &str, values: Vec<Value>) {
    let slot = map.entry(key.to_string()).or_default();
    for v in values {
        if !slot.contains(&v) {
            slot.push(v);
        }
    }
}

impl SearchCriteria {
    /// Empty criteria.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds allowed values for `key`; repeated calls append.
    pub fn add_criteria(&mut self, key: &str, values: Vec<Value>) {
        append_unique(&mut self.criteria, key, values);
    }

    /// Adds excluded values for `key`; repeated calls append.
    pub fn add_exclusions(&mut self, key: &str, values: Vec<Value>) {
        append_unique(&mut self.exclusions, key, values);
    }

    /// Sets the time range, replacing any previous one.
    pub fn set_time_range(&mut self, range: TimeRange) {
        self.time_range = Some(range);
    }

    /// Appends a sort key; a repeated field replaces its earlier direction.
    pub fn sort_by(&mut self, field: &str, order: SortOrder) {
        self.sort.retain(|s| s.field != field);
        self.sort.push(SortField {
            field: field.to_string(),
            order,
        });
    }

    /// Accumulated criteria.
    pub fn criteria(&self) -> &BTreeMap<String, Vec<Value>> {
        &self.criteria
    }

    /// Accumulated exclusions.
    pub fn exclusions(&self) -> &BTreeMap<String, Vec<Value>> {
        &self.exclusions
    }

    /// Renders the request envelope for one page.
    pub fn build_request(&self, start: Option<usize>, rows: Option<usize>) -> SearchRequest {
        let query = self.query.collapse();
        SearchRequest {
            criteria: self.criteria.clone(),
            exclusions: self.exclusions.clone(),
            query: (!query.is_empty()).then_some(query),
            time_range: self.time_range.clone(),
            rows,
            start,
            sort: self.sort.clone(),
            ..SearchRequest::default()
        }
    }

    /// Client-side evaluation used by simple (non-paginated) searches.
    ///
    /// Criteria and exclusions are checked field by field; a structured
    /// predicate is evaluated too. Raw query strings cannot be evaluated
    /// locally and are ignored.
    pub fn matches(&self, doc: &Map<String, Value>) -> bool {
        let hit = |key: &String, values: &Vec<Value>| {
            doc.get(key)
                .is_some_and(|actual| values.iter().any(|v| value_matches(actual, v)))
        };
        self.criteria.iter().all(|(k, v)| hit(k, v))
            && !self.exclusions.iter().any(|(k, v)| hit(k, v))
            && self.query.predicate().is_none_or(|p| p.matches(doc))
    }
}
