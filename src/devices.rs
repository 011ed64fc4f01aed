//! Devices: endpoint sensors registered with the organization.
//!
//! Devices are read-only models searched through the paginated
//! `devices/_search` endpoint, which also supports cursor scrolling and
//! direct (single-request) facets.
//!
//! Remediation actions are issued through one endpoint that accepts either
//! an explicit device id list or the criteria of a device search:
//!
//! | Function | `action_type` | Options |
//! |----------|---------------|---------|
//! | [`background_scan`] | `BACKGROUND_SCAN` | `toggle` |
//! | [`bypass`] | `BYPASS` | `toggle` |
//! | [`quarantine`] | `QUARANTINE` | `toggle` |
//! | [`update_policy`] | `UPDATE_POLICY` | `policy_id` |
//! | [`update_sensor_version`] | `UPDATE_SENSOR_VERSION` | `sensor_version` |
//!
//! The endpoint answers `204 No Content`; actions are applied
//! asynchronously on the sensors.

use serde::Serialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::info;

use crate::attribute::{FieldKind, FieldSpec};
use crate::client::ApiClient;
use crate::error::{ApiError, Result};
use crate::facet::FacetQuery;
use crate::query::Query;
use crate::schema::{FacetEndpoint, FacetSupport, ModelRegistry, ModelSchema, Mutability, SearchKind};

const DEVICE_ACTIONS_PATH: &str = "/appservices/v6/orgs/{org_key}/device_actions";

/// Schema of a device.
pub static DEVICE: ModelSchema = ModelSchema {
    name: "Device",
    primary_key: "id",
    urlobject: "/appservices/v6/orgs/{org_key}/devices",
    urlobject_single: "/appservices/v6/orgs/{org_key}/devices/{id}",
    fields: &[
        FieldSpec::required("id", FieldKind::Integer),
        FieldSpec::new("name", FieldKind::String),
        FieldSpec::new("os", FieldKind::String),
        FieldSpec::new("os_version", FieldKind::String),
        FieldSpec::new("status", FieldKind::String),
        FieldSpec::new("sensor_version", FieldKind::String),
        FieldSpec::new("quarantined", FieldKind::Boolean),
        FieldSpec::new("policy_id", FieldKind::Integer),
        FieldSpec::new("policy_name", FieldKind::String),
        FieldSpec::new(
            "policy",
            FieldKind::ForeignKey {
                model: "Policy",
                id_field: Some("policy_id"),
            },
        ),
        FieldSpec::new("ad_group_id", FieldKind::Integer),
        FieldSpec::new("deployment_type", FieldKind::String),
        FieldSpec::new("last_internal_ip_address", FieldKind::String),
        FieldSpec::new("last_external_ip_address", FieldKind::String),
        FieldSpec::new("last_contact_time", FieldKind::IsoDate),
        FieldSpec::new("registered_time", FieldKind::IsoDate),
        FieldSpec::new("av_status", FieldKind::Array),
    ],
    mutability: Mutability::Immutable,
    refreshable: true,
    search: SearchKind::Paginated {
        path: "/appservices/v6/orgs/{org_key}/devices/_search",
        scroll_path: Some("/appservices/v6/orgs/{org_key}/devices/_scroll"),
    },
    facets: Some(FacetSupport {
        endpoint: FacetEndpoint::Direct {
            path: "/appservices/v6/orgs/{org_key}/devices/_facet",
        },
        term_fields: &[
            "policy_id",
            "status",
            "os",
            "ad_group_id",
            "cloud_provider_account_id",
            "auto_scaling_group_name",
            "virtual_private_cloud_id",
        ],
        range_fields: &[],
    }),
};

/// Adds the device schema to `registry`.
pub fn register(registry: &mut ModelRegistry) {
    registry.register(&DEVICE);
}

/// An unfiltered device search.
pub fn search(api: &Arc<ApiClient>) -> Result<Query> {
    Query::new(api, &DEVICE)
}

/// An empty device facet request.
pub fn facets(api: &Arc<ApiClient>) -> Result<FacetQuery> {
    FacetQuery::new(api, &DEVICE)
}

// ── Actions ──────────────────────────────────────────────────────────

/// A remediation action applied to one or more devices.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceAction {
    /// Start or stop a background scan.
    BackgroundScan(bool),
    /// Enable or disable bypass mode.
    Bypass(bool),
    /// Quarantine or release from quarantine.
    Quarantine(bool),
    /// Move to another policy.
    UpdatePolicy(i64),
    /// Upgrade sensors, keyed by OS (e.g. `{"WINDOWS": "3.8.0.1"}`).
    UpdateSensorVersion(Map<String, Value>),
}

impl DeviceAction {
    fn action_type(&self) -> &'static str {
        match self {
            DeviceAction::BackgroundScan(_) => "BACKGROUND_SCAN",
            DeviceAction::Bypass(_) => "BYPASS",
            DeviceAction::Quarantine(_) => "QUARANTINE",
            DeviceAction::UpdatePolicy(_) => "UPDATE_POLICY",
            DeviceAction::UpdateSensorVersion(_) => "UPDATE_SENSOR_VERSION",
        }
    }

    fn options(&self) -> Value {
        let toggle = |on: bool| json!({ "toggle": if on { "ON" } else { "OFF" } });
        match self {
            DeviceAction::BackgroundScan(on)
            | DeviceAction::Bypass(on)
            | DeviceAction::Quarantine(on) => toggle(*on),
            DeviceAction::UpdatePolicy(policy_id) => json!({ "policy_id": policy_id }),
            DeviceAction::UpdateSensorVersion(versions) => {
                json!({ "sensor_version": versions })
            }
        }
    }
}

/// Which devices an action applies to.
#[derive(Debug, Clone)]
pub enum ActionTarget<'a> {
    /// An explicit list of device ids.
    Ids(Vec<i64>),
    /// Every device matching a device search.
    Search(&'a Query),
}

/// Body of the device actions endpoint.
#[derive(Debug, Serialize)]
struct DeviceActionRequest {
    action_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_id: Option<Vec<i64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    search: Option<Value>,
    options: Value,
}

/// Sends a device action.
///
/// # Errors
///
/// - `ApiError::InvalidArgument` for an empty id list or a query over
///   another model type (checked before any request is made).
/// - HTTP errors mapped by the transport.
pub async fn execute_action(
    api: &ApiClient,
    target: &ActionTarget<'_>,
    action: &DeviceAction,
) -> Result<()> {
    let (device_id, search) = match target {
        ActionTarget::Ids(ids) if ids.is_empty() => {
            return Err(ApiError::InvalidArgument(
                "device action needs at least one device id".to_string(),
            ));
        }
        ActionTarget::Ids(ids) => (Some(ids.clone()), None),
        ActionTarget::Search(query) => {
            if query.schema().name != DEVICE.name {
                return Err(ApiError::InvalidArgument(format!(
                    "device actions cannot target a {} query",
                    query.schema().name
                )));
            }
            let request = query.request(None, None);
            let mut search = Map::new();
            search.insert("criteria".into(), json!(request.criteria));
            search.insert("exclusions".into(), json!(request.exclusions));
            search.insert("query".into(), json!(request.query.unwrap_or_default()));
            (None, Some(Value::Object(search)))
        }
    };

    let body = DeviceActionRequest {
        action_type: action.action_type(),
        device_id,
        search,
        options: action.options(),
    };
    let path = api.path(DEVICE_ACTIONS_PATH, None, None);
    api.post_object(&path, &body).await?.error_for_status()?;
    info!(action = body.action_type, "device action accepted");
    Ok(())
}

/// Quarantines (`true`) or releases (`false`) devices.
pub async fn quarantine(api: &ApiClient, target: &ActionTarget<'_>, enable: bool) -> Result<()> {
    execute_action(api, target, &DeviceAction::Quarantine(enable)).await
}

/// Enables or disables bypass mode.
pub async fn bypass(api: &ApiClient, target: &ActionTarget<'_>, enable: bool) -> Result<()> {
    execute_action(api, target, &DeviceAction::Bypass(enable)).await
}

/// Starts or stops a background scan.
pub async fn background_scan(
    api: &ApiClient,
    target: &ActionTarget<'_>,
    enable: bool,
) -> Result<()> {
    execute_action(api, target, &DeviceAction::BackgroundScan(enable)).await
}

/// Moves devices to `policy_id`.
pub async fn update_policy(api: &ApiClient, target: &ActionTarget<'_>, policy_id: i64) -> Result<()> {
    execute_action(api, target, &DeviceAction::UpdatePolicy(policy_id)).await
}

/// Requests a sensor upgrade.
pub async fn update_sensor_version(
    api: &ApiClient,
    target: &ActionTarget<'_>,
    versions: Map<String, Value>,
) -> Result<()> {
    execute_action(api, target, &DeviceAction::UpdateSensorVersion(versions)).await
}
