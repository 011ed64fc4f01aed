//! Static model schemas and the model registry.
//!
//! Each resource module declares one `static` [`ModelSchema`] per model type:
//! its URL templates, primary key, declared fields, mutability, and how it
//! is searched. Schemas are plain data built at compile time; nothing is
//! discovered through reflection.
//!
//! URL templates use `{org_key}`, `{id}` and `{job_id}` placeholders, filled
//! with [`expand_path`].
//!
//! [`ModelRegistry`] maps type names to schemas so that generic calls such as
//! [`crate::client::ApiClient::select_by_name`] can resolve a type from a
//! string. Resource modules contribute their schemas through `register`
//! functions called from [`ModelRegistry::with_defaults`].

use std::collections::HashMap;

use crate::attribute::FieldSpec;
use crate::error::{ApiError, Result};

/// Whether attribute writes are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    /// Every write fails with `ApiError::Immutable`.
    Immutable,
    /// Declared fields are dirty-tracked; `save()` persists them.
    Mutable,
}

/// Which search backend a model type uses.
#[derive(Debug, Clone, Copy)]
pub enum SearchKind {
    /// The model cannot be searched.
    Unsearchable,
    /// One GET returns every object; criteria are applied client-side and
    /// the result list is cached on the query.
    Simple {
        /// List endpoint.
        path: &'static str,
        /// Key holding the result array, or `None` when the body is the array.
        results_key: Option<&'static str>,
    },
    /// POST searches windowed by `start`/`rows`.
    Paginated {
        /// Search endpoint.
        path: &'static str,
        /// Cursor-scroll endpoint, if the resource supports it.
        scroll_path: Option<&'static str>,
    },
    /// An asynchronous search job that is submitted, polled, then read.
    AsyncJob {
        /// Job submission endpoint (POST).
        submit_path: &'static str,
        /// Status/results endpoint (GET), with a `{job_id}` placeholder.
        results_path: &'static str,
        /// Optional query validation endpoint (GET with `q`).
        validation_path: Option<&'static str>,
    },
}

/// How facet requests are executed for a model type.
#[derive(Debug, Clone, Copy)]
pub enum FacetEndpoint {
    /// A single POST returns the facet result.
    Direct {
        /// Facet endpoint.
        path: &'static str,
    },
    /// A facet job that is submitted and polled like a search job.
    Job {
        /// Job submission endpoint (POST).
        submit_path: &'static str,
        /// Results endpoint (GET), with a `{job_id}` placeholder.
        results_path: &'static str,
    },
}

/// Facet capabilities of a model type.
#[derive(Debug, Clone, Copy)]
pub struct FacetSupport {
    /// Where facet requests go.
    pub endpoint: FacetEndpoint,
    /// Field names accepted for term facets.
    pub term_fields: &'static [&'static str],
    /// Field names accepted for range facets.
    pub range_fields: &'static [&'static str],
}

/// Everything the generic model and query layers need to know about a type.
#[derive(Debug)]
pub struct ModelSchema {
    /// Registered type name, e.g. `"Device"`.
    pub name: &'static str,
    /// Document key holding the unique identifier.
    pub primary_key: &'static str,
    /// Collection endpoint; new objects are POSTed here.
    pub urlobject: &'static str,
    /// Single-object endpoint, with an `{id}` placeholder.
    pub urlobject_single: &'static str,
    /// Declared fields.
    pub fields: &'static [FieldSpec],
    /// Whether writes are accepted.
    pub mutability: Mutability,
    /// Whether `refresh()` can re-fetch the object.
    pub refreshable: bool,
    /// Search backend.
    pub search: SearchKind,
    /// Facet backend, if any.
    pub facets: Option<FacetSupport>,
}

impl ModelSchema {
    /// Looks up a declared field.
    pub fn field(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Names of fields `validate()` requires.
    pub fn required_fields(&self) -> impl Iterator<Item = &'static str> {
        self.fields.iter().filter(|f| f.required).map(|f| f.name)
    }

    /// `true` when writes are accepted.
    pub fn is_mutable(&self) -> bool {
        self.mutability == Mutability::Mutable
    }
}

/// Fills `{org_key}`, `{id}` and `{job_id}` placeholders in a URL template.
pub fn expand_path(template: &str, org_key: &str, id: Option<&str>, job_id: Option<&str>) -> String {
    let mut path = template.replace("{org_key}", org_key);
    if let Some(id) = id {
        path = path.replace("{id}", id);
    }
    if let Some(job_id) = job_id {
        path = path.replace("{job_id}", job_id);
    }
    path
}

/// Name → schema table used for dynamic model lookup.
#[derive(Debug, Default, Clone)]
pub struct ModelRegistry {
    models: HashMap<&'static str, &'static ModelSchema>,
}

impl ModelRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every model type this crate defines.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        crate::devices::register(&mut registry);
        crate::alerts::register(&mut registry);
        crate::policies::register(&mut registry);
        crate::processes::register(&mut registry);
        crate::workflow::register(&mut registry);
        registry
    }

    /// Adds or replaces a schema under its own name.
    pub fn register(&mut self, schema: &'static ModelSchema) {
        self.models.insert(schema.name, schema);
    }

    /// Resolves a type name.
    pub fn lookup(&self, name: &str) -> Result<&'static ModelSchema> {
        self.models
            .get(name)
            .copied()
            .ok_or_else(|| ApiError::ModelNotFound(name.to_string()))
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.models.keys().copied().collect();
        names.sort_unstable();
        names
    }
}
