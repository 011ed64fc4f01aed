//! Integration tests for the model lifecycle using wiremock.
//!
//! Policies are the mutable resource: selected by id, found through a
//! client-filtered summary list, created, updated and deleted. Devices and
//! alerts cover the read-only paths (immutability and references).

use std::sync::Arc;

use cbc_sdk::alerts::ALERT;
use cbc_sdk::client::ApiClient;
use cbc_sdk::credentials::Credentials;
use cbc_sdk::criteria::Predicate;
use cbc_sdk::devices::DEVICE;
use cbc_sdk::error::ApiError;
use cbc_sdk::model::Model;
use cbc_sdk::policies::{self, POLICY};
use cbc_sdk::processes::PROCESS;
use serde_json::{Map, Value, json};
use wiremock::matchers::{body_json, body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const POLICIES: &str = "/policyservice/v1/orgs/ORG1/policies";
const SUMMARY: &str = "/policyservice/v1/orgs/ORG1/policies/summary";

/// Helper: creates an API client pointed at the given wiremock server.
fn mock_api(server: &MockServer) -> Arc<ApiClient> {
    Arc::new(ApiClient::new(Credentials::new(&server.uri(), "mock-token", "ORG1")).unwrap())
}

fn object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {other}"),
    }
}

fn full_policy(id: i64, name: &str) -> Value {
    json!({
        "id": id,
        "name": name,
        "description": "",
        "priority_level": "HIGH",
        "version": 2,
        "rules": [{"id": 1, "action": "DENY"}],
        "sensor_settings": [],
        "update_time": 1_700_000_000_000i64
    })
}

// ── Select ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn repeated_select_is_served_from_cache() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    Mock::given(method("GET"))
        .and(path(format!("{POLICIES}/42")))
        .respond_with(ResponseTemplate::new(200).set_body_json(full_policy(42, "Servers")))
        .expect(1)
        .mount(&server)
        .await;

    let first = api.select(&POLICY, "42").await.unwrap();
    let second = api.select_by_name("Policy", "42").await.unwrap();
    assert_eq!(first.peek("name"), Some(&json!("Servers")));
    assert_eq!(second.id(), Some("42"));
    assert!(second.is_fully_initialized());
}

#[tokio::test]
async fn select_of_missing_object_is_not_found() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    Mock::given(method("GET"))
        .and(path(format!("{POLICIES}/404")))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such policy"))
        .mount(&server)
        .await;

    match api.select(&POLICY, "404").await {
        Err(ApiError::ObjectNotFound { uri, message }) => {
            assert!(uri.ends_with("/policies/404"), "{uri}");
            assert_eq!(message, "no such policy");
        }
        other => panic!("expected ObjectNotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn rejected_token_is_unauthorized() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    Mock::given(method("GET"))
        .and(path(format!("{POLICIES}/1")))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    assert!(matches!(
        api.select(&POLICY, "1").await,
        Err(ApiError::Unauthorized { .. })
    ));
}

// ── Simple queries and lazy loading ────────────────────────────────────

#[tokio::test]
async fn simple_query_filters_client_side_and_caches_the_list() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    Mock::given(method("GET"))
        .and(path(SUMMARY))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "policies": [
                {"id": 1, "name": "Default", "priority_level": "LOW", "is_system": true},
                {"id": 2, "name": "Servers", "priority_level": "HIGH", "is_system": false},
                {"id": 3, "name": "Kiosks", "priority_level": "HIGH", "is_system": false}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut query = policies::search(&api)
        .unwrap()
        .where_(Predicate::term("priority_level", "high"))
        .unwrap();
    assert_eq!(query.count().await.unwrap(), 2);

    let found = query.all().await.unwrap();
    let names: Vec<_> = found.iter().filter_map(|p| p.peek("name")).collect();
    assert_eq!(names, [&json!("Servers"), &json!("Kiosks")]);
    assert_eq!(query.first().await.unwrap().unwrap().id(), Some("2"));
}

#[tokio::test]
async fn summary_policy_loads_full_document_on_first_missing_field() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    Mock::given(method("GET"))
        .and(path(SUMMARY))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "policies": [{"id": 2, "name": "Servers", "priority_level": "HIGH"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("{POLICIES}/2")))
        .respond_with(ResponseTemplate::new(200).set_body_json(full_policy(2, "Servers")))
        .expect(1)
        .mount(&server)
        .await;

    let mut query = policies::search(&api).unwrap();
    let mut policy = query.one().await.unwrap();
    assert!(!policy.is_fully_initialized());

    // Present in the summary: no refresh.
    assert_eq!(policy.get_str("name").await.unwrap().as_deref(), Some("Servers"));

    let rules = policy.get_list("rules").await.unwrap();
    assert_eq!(rules.len(), 1);
    assert!(policy.is_fully_initialized());
    assert!(policy.last_refresh().is_some());

    // Already loaded: a second read stays local.
    assert_eq!(
        policy.get_timestamp("update_time").await.unwrap().map(|t| t.timestamp()),
        Some(1_700_000_000)
    );
}

// ── Create / update / delete ───────────────────────────────────────────

#[tokio::test]
async fn new_policy_is_created_once() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    Mock::given(method("POST"))
        .and(path(POLICIES))
        .and(body_partial_json(json!({
            "name": "Laptops",
            "priority_level": "MEDIUM",
            "version": 2,
            "rules": []
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 77, "name": "Laptops", "priority_level": "MEDIUM", "version": 2,
            "rules": [], "sensor_settings": []
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut policy = policies::new_policy(&api);
    policy.set("name", "Laptops").await.unwrap();
    assert!(policy.is_dirty());

    policy.save().await.unwrap();
    assert_eq!(policy.id(), Some("77"));
    assert!(!policy.is_dirty());

    // Nothing changed: no second POST.
    policy.save().await.unwrap();
}

#[tokio::test]
async fn incomplete_policy_fails_validation_without_a_request() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    let mut policy = policies::new_policy(&api);
    policy.set("description", "no name yet").await.unwrap();
    match policy.save().await {
        Err(ApiError::InvalidObject { missing }) => assert_eq!(missing, ["name"]),
        other => panic!("expected InvalidObject, got {other:?}"),
    }
    let requests = server.received_requests().await.unwrap_or_default();
    assert!(requests.is_empty());
}

#[tokio::test]
async fn update_sends_primary_key_and_changed_fields_only() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    Mock::given(method("GET"))
        .and(path(format!("{POLICIES}/5")))
        .respond_with(ResponseTemplate::new(200).set_body_json(full_policy(5, "Servers")))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("{POLICIES}/5")))
        .and(body_json(json!({"id": 5, "description": "production fleet"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 5})))
        .expect(1)
        .mount(&server)
        .await;

    let mut policy = api.select(&POLICY, "5").await.unwrap();
    policy.set("description", "production fleet").await.unwrap();
    assert_eq!(
        policy.dirty_attributes().get("description"),
        Some(&Some(json!("")))
    );
    policy.save().await.unwrap();
    assert!(!policy.is_dirty());
}

#[tokio::test]
async fn reverting_a_change_clears_the_dirty_mark() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    Mock::given(method("GET"))
        .and(path(format!("{POLICIES}/5")))
        .respond_with(ResponseTemplate::new(200).set_body_json(full_policy(5, "Servers")))
        .mount(&server)
        .await;

    let mut policy = api.select(&POLICY, "5").await.unwrap();
    policy.set("name", "Renamed").await.unwrap();
    policy.set("name", "Servers").await.unwrap();
    assert!(!policy.is_dirty());

    policy.set("priority_level", "LOW").await.unwrap();
    policy.reset();
    assert_eq!(policy.peek("priority_level"), Some(&json!("HIGH")));
    assert!(!policy.is_dirty());
}

#[tokio::test]
async fn delete_forgets_identity_and_evicts_cache() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    Mock::given(method("GET"))
        .and(path(format!("{POLICIES}/9")))
        .respond_with(ResponseTemplate::new(200).set_body_json(full_policy(9, "Old")))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path(format!("{POLICIES}/9")))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let mut policy = api.select(&POLICY, "9").await.unwrap();
    policy.delete().await.unwrap();
    assert!(policy.id().is_none());

    // The cached document is gone, so this selects from the server again.
    api.select(&POLICY, "9").await.unwrap();
}

#[tokio::test]
async fn forbidden_update_is_unauthorized_and_keeps_changes() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    Mock::given(method("GET"))
        .and(path(format!("{POLICIES}/5")))
        .respond_with(ResponseTemplate::new(200).set_body_json(full_policy(5, "Servers")))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("{POLICIES}/5")))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .expect(1)
        .mount(&server)
        .await;

    let mut policy = api.select(&POLICY, "5").await.unwrap();
    policy.set("description", "production fleet").await.unwrap();
    match policy.save().await {
        Err(ApiError::Unauthorized { status, body, .. }) => {
            assert_eq!(status.as_u16(), 403);
            assert_eq!(body, "forbidden");
        }
        other => panic!("expected Unauthorized, got {other:?}"),
    }
    assert!(policy.is_dirty());
}

#[tokio::test]
async fn create_rejected_as_unprocessable_is_a_client_error() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    Mock::given(method("POST"))
        .and(path(POLICIES))
        .respond_with(ResponseTemplate::new(422).set_body_string("duplicate name"))
        .expect(1)
        .mount(&server)
        .await;

    let mut policy = policies::new_policy(&api);
    policy.set("name", "Servers").await.unwrap();
    assert!(matches!(policy.save().await, Err(ApiError::Client { .. })));
}

#[tokio::test]
async fn changed_primary_key_saves_as_a_new_object() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    Mock::given(method("GET"))
        .and(path(format!("{POLICIES}/5")))
        .respond_with(ResponseTemplate::new(200).set_body_json(full_policy(5, "Servers")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(POLICIES))
        .and(body_partial_json(json!({"id": 6, "name": "Servers"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(full_policy(6, "Servers")))
        .expect(1)
        .mount(&server)
        .await;

    let mut policy = api.select(&POLICY, "5").await.unwrap();
    policy.set("id", 6i64).await.unwrap();

    // A pending key change must not be overwritten by the server copy.
    policy.refresh().await.unwrap();
    assert_eq!(policy.peek("id"), Some(&json!(6)));

    policy.save().await.unwrap();
    assert_eq!(policy.id(), Some("6"));
    assert!(!policy.is_dirty());
}

#[tokio::test]
async fn unsaved_objects_neither_refresh_nor_delete() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    let mut policy = policies::new_policy(&api);
    policy.set("name", "Draft").await.unwrap();
    policy.refresh().await.unwrap();
    policy.delete().await.unwrap();
    assert_eq!(policy.peek("name"), Some(&json!("Draft")));

    let requests = server.received_requests().await.unwrap_or_default();
    assert!(requests.is_empty());
}

#[tokio::test]
async fn unrefreshable_models_refuse_refresh() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    let mut process = Model::from_document(
        &api,
        &PROCESS,
        object(json!({"process_guid": "ORG1-0001-abcd", "process_name": "svchost.exe"})),
        true,
    );
    assert!(matches!(process.refresh().await, Err(ApiError::Api(_))));

    let requests = server.received_requests().await.unwrap_or_default();
    assert!(requests.is_empty());
}

#[tokio::test]
async fn summary_policy_accepts_writes_to_keys_only_in_full_document() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    Mock::given(method("GET"))
        .and(path(SUMMARY))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "policies": [{"id": 2, "name": "Servers", "priority_level": "HIGH"}]
        })))
        .mount(&server)
        .await;
    let mut full = full_policy(2, "Servers");
    full["managed_by"] = json!("console");
    Mock::given(method("GET"))
        .and(path(format!("{POLICIES}/2")))
        .respond_with(ResponseTemplate::new(200).set_body_json(full))
        .expect(1)
        .mount(&server)
        .await;

    let mut policy = policies::search(&api).unwrap().one().await.unwrap();
    policy.set("managed_by", "terraform").await.unwrap();

    assert!(policy.is_fully_initialized());
    assert_eq!(
        policy.dirty_attributes().get("managed_by"),
        Some(&Some(json!("console")))
    );
}

// ── Read-only models ───────────────────────────────────────────────────

#[tokio::test]
async fn immutable_models_reject_writes() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    let mut device = Model::from_document(
        &api,
        &DEVICE,
        object(json!({"id": 98, "name": "ws-01"})),
        true,
    );
    assert!(matches!(
        device.set("name", "ws-02").await,
        Err(ApiError::Immutable { model: "Device", .. })
    ));
}

#[tokio::test]
async fn alert_resolves_its_device() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    Mock::given(method("GET"))
        .and(path("/appservices/v6/orgs/ORG1/devices/98"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 98, "name": "ws-01", "os": "WINDOWS", "policy_id": 5
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut alert = Model::from_document(
        &api,
        &ALERT,
        object(json!({"id": "a-1", "device_id": 98, "severity": 7})),
        true,
    );
    let device = alert.related("device").await.unwrap().expect("device reference");
    assert_eq!(device.schema().name, "Device");
    assert_eq!(device.peek("name"), Some(&json!("ws-01")));

    let mut orphan = Model::from_document(&api, &ALERT, object(json!({"id": "a-2"})), true);
    assert!(orphan.related("device").await.unwrap().is_none());
}
