//! Prevention policies.
//!
//! Policies are the one mutable resource in this crate. The list endpoint
//! returns short summaries, so policies found by a search are partial
//! documents that load the full policy the first time a missing field is
//! read. New policies start from [`new_policy`], which seeds the schema
//! defaults; [`Model::save`] creates or updates them.
//!
//! [`Model::save`]: crate::model::Model::save

use serde_json::{Value, json};
use std::sync::Arc;

use crate::attribute::{FieldKind, FieldSpec};
use crate::client::ApiClient;
use crate::error::Result;
use crate::model::Model;
use crate::query::Query;
use crate::schema::{ModelRegistry, ModelSchema, Mutability, SearchKind};

fn default_priority() -> Value {
    json!("MEDIUM")
}

fn default_version() -> Value {
    json!(2)
}

fn empty_list() -> Value {
    json!([])
}

/// Schema of a policy.
pub static POLICY: ModelSchema = ModelSchema {
    name: "Policy",
    primary_key: "id",
    urlobject: "/policyservice/v1/orgs/{org_key}/policies",
    urlobject_single: "/policyservice/v1/orgs/{org_key}/policies/{id}",
    fields: &[
        FieldSpec::new("id", FieldKind::Integer),
        FieldSpec::required("name", FieldKind::String),
        FieldSpec::new("description", FieldKind::String),
        FieldSpec::required("priority_level", FieldKind::String).with_default(default_priority),
        FieldSpec::required("version", FieldKind::Integer).with_default(default_version),
        FieldSpec::new("position", FieldKind::Integer),
        FieldSpec::new("is_system", FieldKind::Boolean),
        FieldSpec::new("num_devices", FieldKind::Integer),
        FieldSpec::new("rules", FieldKind::Array).with_default(empty_list),
        FieldSpec::new("sensor_settings", FieldKind::Array).with_default(empty_list),
        FieldSpec::new("av_settings", FieldKind::Object),
        FieldSpec::new("update_time", FieldKind::EpochDate { divisor: 1000.0 }),
    ],
    mutability: Mutability::Mutable,
    refreshable: true,
    search: SearchKind::Simple {
        path: "/policyservice/v1/orgs/{org_key}/policies/summary",
        results_key: Some("policies"),
    },
    facets: None,
};

/// Adds the policy schema to `registry`.
pub fn register(registry: &mut ModelRegistry) {
    registry.register(&POLICY);
}

/// A policy search, filtered client-side.
pub fn search(api: &Arc<ApiClient>) -> Result<Query> {
    Query::new(api, &POLICY)
}

/// A blank policy with default priority, version and empty rule lists.
pub fn new_policy(api: &Arc<ApiClient>) -> Model {
    Model::new_object(api, &POLICY)
}
