//! Status of bulk alert-workflow requests.
//!
//! [`crate::alerts::update_workflow`] returns a request id immediately; the
//! backend then applies the change to every matching alert in the
//! background. A request moves through:
//!
//!   QUEUED → IN_PROGRESS → FINISHED
//!
//! [`wait_for_workflow`] polls the `WorkflowStatus` model until the request
//! finishes or the caller's timeout expires.

use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::attribute::{FieldKind, FieldSpec};
use crate::client::ApiClient;
use crate::error::Result;
use crate::job::poll_until;
pub use crate::job::PollConfig;
use crate::model::Model;
use crate::schema::{ModelRegistry, ModelSchema, Mutability, SearchKind};

/// Schema of a workflow request status.
pub static WORKFLOW_STATUS: ModelSchema = ModelSchema {
    name: "WorkflowStatus",
    primary_key: "id",
    urlobject: "/appservices/v6/orgs/{org_key}/workflow/status",
    urlobject_single: "/appservices/v6/orgs/{org_key}/workflow/status/{id}",
    fields: &[
        FieldSpec::required("id", FieldKind::String),
        FieldSpec::new("status", FieldKind::String),
        FieldSpec::new("num_hits", FieldKind::Integer),
        FieldSpec::new("num_success", FieldKind::Integer),
        FieldSpec::new("num_failure", FieldKind::Integer),
        FieldSpec::new("errors", FieldKind::Array),
        FieldSpec::new("create_time", FieldKind::IsoDate),
        FieldSpec::new("last_update_time", FieldKind::IsoDate),
    ],
    mutability: Mutability::Immutable,
    refreshable: true,
    search: SearchKind::Unsearchable,
    facets: None,
};

/// Adds the workflow status schema to `registry`.
pub fn register(registry: &mut ModelRegistry) {
    registry.register(&WORKFLOW_STATUS);
}

/// Lifecycle state of a bulk workflow request.
///
/// `Unknown` absorbs status strings this crate does not recognize and is
/// treated as still running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowState {
    /// Accepted, not yet started.
    Queued,
    /// Being applied.
    InProgress,
    /// Done; see `num_success`/`num_failure`.
    Finished,
    /// Unrecognized status string.
    #[serde(other)]
    Unknown,
}

impl WorkflowState {
    /// Reads the state of a `WorkflowStatus` model without refreshing it.
    pub fn of(status: &Model) -> Self {
        status
            .peek("status")
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or(WorkflowState::Unknown)
    }
}

/// Polls a workflow request until it is `FINISHED`.
///
/// Each check fetches a fresh status document; the select cache is not
/// consulted.
///
/// # Errors
///
/// - `ApiError::Timeout` once `config.timeout` has elapsed.
/// - `ApiError::ObjectNotFound` if the request id is unknown.
pub async fn wait_for_workflow(
    api: &Arc<ApiClient>,
    request_id: &str,
    config: &PollConfig,
) -> Result<Model> {
    let what = format!("workflow request {request_id}");
    poll_until(config, &what, move || async move {
        let status =
            Model::new(api, &WORKFLOW_STATUS, Some(request_id), None, true, false).await?;
        let state = WorkflowState::of(&status);
        debug!(%request_id, ?state, "workflow status");
        Ok((state == WorkflowState::Finished).then_some(status))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Weak;

    fn status_model(status: &str) -> Model {
        let serde_json::Value::Object(doc) = json!({"id": "r1", "status": status}) else {
            unreachable!()
        };
        Model::detached(Weak::new(), &WORKFLOW_STATUS, doc, true)
    }

    #[test]
    fn state_reads_known_and_unknown_values() {
        assert_eq!(WorkflowState::of(&status_model("QUEUED")), WorkflowState::Queued);
        assert_eq!(
            WorkflowState::of(&status_model("IN_PROGRESS")),
            WorkflowState::InProgress
        );
        assert_eq!(WorkflowState::of(&status_model("FINISHED")), WorkflowState::Finished);
        assert_eq!(WorkflowState::of(&status_model("PAUSED")), WorkflowState::Unknown);
    }
}
