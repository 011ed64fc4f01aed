//! Alerts raised by sensors and analytics.
//!
//! Alerts are read-only models found through the paginated alert search.
//! Each alert references the device it fired on through `device_id`; the
//! `device` field resolves that reference with [`Model::related`].
//!
//! Triage happens in bulk: [`update_workflow`] sends the criteria of an
//! alert search together with the desired workflow state and returns a
//! request id, which [`crate::workflow::wait_for_workflow`] can poll.
//!
//! [`Model::related`]: crate::model::Model::related

use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{info, instrument};

use crate::attribute::{FieldKind, FieldSpec};
use crate::client::ApiClient;
use crate::error::{ApiError, Result};
use crate::facet::FacetQuery;
use crate::query::Query;
use crate::schema::{FacetEndpoint, FacetSupport, ModelRegistry, ModelSchema, Mutability, SearchKind};

const WORKFLOW_PATH: &str = "/appservices/v6/orgs/{org_key}/alerts/workflow/_criteria";

/// Schema of an alert.
pub static ALERT: ModelSchema = ModelSchema {
    name: "Alert",
    primary_key: "id",
    urlobject: "/api/alerts/v7/orgs/{org_key}/alerts",
    urlobject_single: "/api/alerts/v7/orgs/{org_key}/alerts/{id}",
    fields: &[
        FieldSpec::required("id", FieldKind::String),
        FieldSpec::new("type", FieldKind::String),
        FieldSpec::new("severity", FieldKind::Integer),
        FieldSpec::new("reason", FieldKind::String),
        FieldSpec::new("threat_id", FieldKind::String),
        FieldSpec::new("device_id", FieldKind::Integer),
        FieldSpec::new("device_name", FieldKind::String),
        FieldSpec::new("device_os", FieldKind::String),
        FieldSpec::new(
            "device",
            FieldKind::ForeignKey {
                model: "Device",
                id_field: None,
            },
        ),
        FieldSpec::new("policy_id", FieldKind::Integer),
        FieldSpec::new("process_name", FieldKind::String),
        FieldSpec::new("workflow", FieldKind::Object),
        FieldSpec::new("tags", FieldKind::Array),
        FieldSpec::new("backend_timestamp", FieldKind::IsoDate),
        FieldSpec::new("first_event_timestamp", FieldKind::IsoDate),
        FieldSpec::new("last_event_timestamp", FieldKind::IsoDate),
    ],
    mutability: Mutability::Immutable,
    refreshable: true,
    search: SearchKind::Paginated {
        path: "/api/alerts/v7/orgs/{org_key}/alerts/_search",
        scroll_path: None,
    },
    facets: Some(FacetSupport {
        endpoint: FacetEndpoint::Direct {
            path: "/api/alerts/v7/orgs/{org_key}/alerts/_facet",
        },
        term_fields: &[
            "type",
            "severity",
            "device_id",
            "device_name",
            "device_os",
            "policy_id",
            "policy_name",
            "process_name",
            "reason_code",
            "threat_id",
            "workflow_status",
        ],
        range_fields: &[
            "backend_timestamp",
            "detection_timestamp",
            "first_event_timestamp",
            "last_event_timestamp",
            "severity",
        ],
    }),
};

/// Adds the alert schema to `registry`.
pub fn register(registry: &mut ModelRegistry) {
    registry.register(&ALERT);
}

/// An unfiltered alert search.
pub fn search(api: &Arc<ApiClient>) -> Result<Query> {
    Query::new(api, &ALERT)
}

/// An empty alert facet request.
pub fn facets(api: &Arc<ApiClient>) -> Result<FacetQuery> {
    FacetQuery::new(api, &ALERT)
}

// ── Workflow ─────────────────────────────────────────────────────────

/// Target state of a workflow update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertState {
    /// Dismiss the matching alerts.
    Dismissed,
    /// Reopen the matching alerts.
    Open,
}

/// Desired workflow state sent with an alert search.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowUpdate {
    /// New state.
    pub state: AlertState,
    /// Free-form remediation label, e.g. `"FIXED"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remediation_state: Option<String>,
    /// Analyst note stored with the change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl WorkflowUpdate {
    /// Dismisses with an optional remediation label and comment.
    pub fn dismiss(remediation: Option<&str>, comment: Option<&str>) -> Self {
        WorkflowUpdate {
            state: AlertState::Dismissed,
            remediation_state: remediation.map(str::to_string),
            comment: comment.map(str::to_string),
        }
    }

    /// Reopens with an optional comment.
    pub fn reopen(comment: Option<&str>) -> Self {
        WorkflowUpdate {
            state: AlertState::Open,
            remediation_state: None,
            comment: comment.map(str::to_string),
        }
    }
}

/// Applies a workflow state to every alert matching `query`.
///
/// Returns the request id of the bulk operation.
///
/// # Errors
///
/// - `ApiError::InvalidArgument` if `query` is not an alert search.
/// - `ApiError::Api` if the response carries no `request_id`.
#[instrument(skip_all, fields(state = ?update.state))]
pub async fn update_workflow(query: &Query, update: &WorkflowUpdate) -> Result<String> {
    if query.schema().name != ALERT.name {
        return Err(ApiError::InvalidArgument(format!(
            "alert workflow cannot be driven by a {} query",
            query.schema().name
        )));
    }
    let mut body = match serde_json::to_value(query.request(None, None))? {
        Value::Object(map) => map,
        _ => Default::default(),
    };
    if let Value::Object(state) = serde_json::to_value(update)? {
        body.extend(state);
    }

    let api = query.api();
    let path = api.path(WORKFLOW_PATH, None, None);
    let response = api.post_json(&path, &body).await?;
    let request_id = match response.get("request_id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => {
            return Err(ApiError::Api(format!(
                "workflow update returned no request_id: {response}"
            )));
        }
    };
    info!(%request_id, "alert workflow update accepted");
    Ok(request_id)
}

/// Applies a workflow state to the alerts with the given ids.
pub async fn update_workflow_by_ids(
    api: &Arc<ApiClient>,
    ids: &[&str],
    update: &WorkflowUpdate,
) -> Result<String> {
    if ids.is_empty() {
        return Err(ApiError::InvalidArgument(
            "workflow update needs at least one alert id".to_string(),
        ));
    }
    let query = search(api)?.add_criteria("id", ids.iter().map(|id| json!(id)));
    update_workflow(&query, update).await
}
