//! Processes observed by sensors.
//!
//! Process searches run as asynchronous jobs (see [`crate::job`]). Queries
//! are checked by the search-validation endpoint before a job is submitted,
//! so a malformed predicate fails with `ApiError::QuerySyntax` carrying the
//! server's diagnostic. Facets run as jobs too.
//!
//! Process documents come only from search results; there is no
//! single-object endpoint to refresh them from.

use std::sync::Arc;

use crate::attribute::{FieldKind, FieldSpec};
use crate::client::ApiClient;
use crate::error::Result;
use crate::facet::FacetQuery;
use crate::query::Query;
use crate::schema::{FacetEndpoint, FacetSupport, ModelRegistry, ModelSchema, Mutability, SearchKind};

/// Schema of a process.
pub static PROCESS: ModelSchema = ModelSchema {
    name: "Process",
    primary_key: "process_guid",
    urlobject: "/api/investigate/v2/orgs/{org_key}/processes",
    urlobject_single: "/api/investigate/v2/orgs/{org_key}/processes/{id}",
    fields: &[
        FieldSpec::required("process_guid", FieldKind::String),
        FieldSpec::new("process_name", FieldKind::String),
        FieldSpec::new("process_pid", FieldKind::Array),
        FieldSpec::new("process_cmdline", FieldKind::Array),
        FieldSpec::new("process_hash", FieldKind::Array),
        FieldSpec::new("process_username", FieldKind::Array),
        FieldSpec::new("parent_guid", FieldKind::String),
        FieldSpec::new("parent_name", FieldKind::String),
        FieldSpec::new("device_id", FieldKind::Integer),
        FieldSpec::new("device_name", FieldKind::String),
        FieldSpec::new(
            "device",
            FieldKind::ForeignKey {
                model: "Device",
                id_field: None,
            },
        ),
        FieldSpec::new("childproc_count", FieldKind::Integer),
        FieldSpec::new("netconn_count", FieldKind::Integer),
        FieldSpec::new("backend_timestamp", FieldKind::IsoDate),
        FieldSpec::new("process_start_time", FieldKind::IsoDate),
    ],
    mutability: Mutability::Immutable,
    refreshable: false,
    search: SearchKind::AsyncJob {
        submit_path: "/api/investigate/v2/orgs/{org_key}/processes/search_jobs",
        results_path: "/api/investigate/v2/orgs/{org_key}/processes/search_jobs/{job_id}/results",
        validation_path: Some("/api/investigate/v1/orgs/{org_key}/processes/search_validation"),
    },
    facets: Some(FacetSupport {
        endpoint: FacetEndpoint::Job {
            submit_path: "/api/investigate/v2/orgs/{org_key}/processes/facet_jobs",
            results_path: "/api/investigate/v2/orgs/{org_key}/processes/facet_jobs/{job_id}/results",
        },
        term_fields: &[
            "backend_timestamp",
            "device_id",
            "device_name",
            "device_os",
            "device_policy_id",
            "device_timestamp",
            "parent_name",
            "process_hash",
            "process_name",
            "process_reputation",
            "process_username",
        ],
        range_fields: &[
            "backend_timestamp",
            "device_timestamp",
            "childproc_count",
            "crossproc_count",
            "filemod_count",
            "modload_count",
            "netconn_count",
            "regmod_count",
        ],
    }),
};

/// Adds the process schema to `registry`.
pub fn register(registry: &mut ModelRegistry) {
    registry.register(&PROCESS);
}

/// An unfiltered process search job (submitted on first access).
pub fn search(api: &Arc<ApiClient>) -> Result<Query> {
    Query::new(api, &PROCESS)
}

/// An empty process facet job.
pub fn facets(api: &Arc<ApiClient>) -> Result<FacetQuery> {
    FacetQuery::new(api, &PROCESS)
}
