//! Integration tests for device actions using wiremock.
//!
//! Every action goes to one endpoint, `POST .../device_actions`, which
//! answers 204 and applies the action asynchronously.

use std::sync::Arc;

use cbc_sdk::client::ApiClient;
use cbc_sdk::credentials::Credentials;
use cbc_sdk::devices::{self, ActionTarget};
use cbc_sdk::error::ApiError;
use cbc_sdk::policies;
use serde_json::{Map, json};
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ACTIONS: &str = "/appservices/v6/orgs/ORG1/device_actions";

/// Helper: creates an API client pointed at the given wiremock server.
fn mock_api(server: &MockServer) -> Arc<ApiClient> {
    Arc::new(ApiClient::new(Credentials::new(&server.uri(), "mock-token", "ORG1")).unwrap())
}

// ── By id ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn quarantine_by_ids_sends_toggle() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    Mock::given(method("POST"))
        .and(path(ACTIONS))
        .and(body_json(json!({
            "action_type": "QUARANTINE",
            "device_id": [98, 99],
            "options": {"toggle": "ON"}
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    devices::quarantine(&api, &ActionTarget::Ids(vec![98, 99]), true)
        .await
        .unwrap();
}

#[tokio::test]
async fn sensor_update_carries_versions_by_os() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    Mock::given(method("POST"))
        .and(path(ACTIONS))
        .and(body_json(json!({
            "action_type": "UPDATE_SENSOR_VERSION",
            "device_id": [98],
            "options": {"sensor_version": {"WINDOWS": "3.9.1.2"}}
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let mut versions = Map::new();
    versions.insert("WINDOWS".to_string(), json!("3.9.1.2"));
    devices::update_sensor_version(&api, &ActionTarget::Ids(vec![98]), versions)
        .await
        .unwrap();
}

// ── By search ──────────────────────────────────────────────────────────

#[tokio::test]
async fn policy_move_by_search_sends_search_criteria() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    Mock::given(method("POST"))
        .and(path(ACTIONS))
        .and(body_json(json!({
            "action_type": "UPDATE_POLICY",
            "search": {
                "criteria": {"os": ["LINUX"]},
                "exclusions": {},
                "query": "name:build-*"
            },
            "options": {"policy_id": 6525}
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let query = devices::search(&api)
        .unwrap()
        .where_("name:build-*")
        .unwrap()
        .add_criteria("os", ["LINUX"]);
    devices::update_policy(&api, &ActionTarget::Search(&query), 6525)
        .await
        .unwrap();
}

// ── Rejections ─────────────────────────────────────────────────────────

#[tokio::test]
async fn invalid_targets_are_rejected_locally() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    assert!(matches!(
        devices::bypass(&api, &ActionTarget::Ids(Vec::new()), true).await,
        Err(ApiError::InvalidArgument(_))
    ));

    let policy_query = policies::search(&api).unwrap();
    assert!(matches!(
        devices::background_scan(&api, &ActionTarget::Search(&policy_query), true).await,
        Err(ApiError::InvalidArgument(_))
    ));

    let requests = server.received_requests().await.unwrap_or_default();
    assert!(requests.is_empty());
}

#[tokio::test]
async fn forbidden_action_maps_to_unauthorized() {
    let server = MockServer::start().await;
    let api = mock_api(&server);

    Mock::given(method("POST"))
        .and(path(ACTIONS))
        .respond_with(ResponseTemplate::new(403).set_body_string("insufficient permissions"))
        .mount(&server)
        .await;

    match devices::quarantine(&api, &ActionTarget::Ids(vec![1]), false).await {
        Err(ApiError::Unauthorized { status, .. }) => assert_eq!(status.as_u16(), 403),
        other => panic!("expected Unauthorized, got {other:?}"),
    }
}
