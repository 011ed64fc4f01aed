//! Authenticated HTTP client for the Carbon Black Cloud REST API.
//!
//! `ApiClient` wraps a `reqwest::Client`, the tenant's [`Credentials`], the
//! [`ModelRegistry`] used for name-based lookups, and an [`ExpiringCache`] of
//! fetched documents that backs [`ApiClient::select`].
//!
//! Two layers of request helpers:
//! - `get_object` and `post_json` return decoded JSON and translate
//!   non-success statuses into typed [`ApiError`]s.
//! - `post_object`, `put_object`, `delete_object` and `send` return the raw
//!   [`ApiResponse`] (status + body) so callers such as `Model::save` can
//!   decide how to interpret ambiguous success bodies.
//!
//! Status translation:
//! - 401/403 → `Unauthorized`
//! - 404 → `ObjectNotFound`
//! - 400 carrying an invalid-query error code → `QuerySyntax`
//! - other 4xx → `Client`, 5xx → `Server`
//! - 2xx with a body that is not JSON → `Server`
//!
//! Nothing here retries; a failed request propagates to the caller.

use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::cache::ExpiringCache;
use crate::credentials::Credentials;
use crate::error::{ApiError, Result};
use crate::model::Model;
use crate::schema::{ModelRegistry, ModelSchema, expand_path};

/// Connect timeout: TCP + TLS handshake only.
const API_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the select-by-id document cache.
const SELECT_CACHE_SIZE: usize = 1024;

/// How long a selected document is reused before it is fetched again.
const SELECT_CACHE_TTL: Duration = Duration::from_secs(10);

/// Error codes the search backends use for a rejected predicate.
const QUERY_ERROR_CODES: &[&str] = &["INVALID_QUERY", "QUERY_SYNTAX_ERROR"];

/// Status and body of a completed HTTP exchange.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// Request URI (path plus query).
    pub uri: String,
    /// HTTP status.
    pub status: StatusCode,
    /// Raw response body.
    pub body: String,
}

impl ApiResponse {
    /// `true` for 2xx statuses.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Decodes the body as JSON. An empty body decodes as `Value::Null`; a
    /// body that is not JSON is reported as a server error.
    pub fn json(&self) -> Result<Value> {
        if self.body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&self.body).map_err(|_| ApiError::Server {
            uri: self.uri.clone(),
            status: self.status,
            body: self.body.clone(),
        })
    }

    /// Converts a non-success response into the matching typed error.
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            return Ok(self);
        }
        Err(status_error(self.uri, self.status, self.body))
    }
}

/// Maps a failed HTTP status onto the error taxonomy.
fn status_error(uri: String, status: StatusCode, body: String) -> ApiError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ApiError::Unauthorized { uri, status, body }
        }
        StatusCode::NOT_FOUND => ApiError::ObjectNotFound { uri, message: body },
        StatusCode::BAD_REQUEST => match query_error_message(&body) {
            Some(message) => ApiError::QuerySyntax { uri, message },
            None => ApiError::Client { uri, status, body },
        },
        s if s.is_client_error() => ApiError::Client { uri, status, body },
        _ => ApiError::Server { uri, status, body },
    }
}

fn query_error_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    let code = parsed.get("error_code")?.as_str()?;
    if !QUERY_ERROR_CODES.contains(&code) {
        return None;
    }
    Some(
        parsed
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(code)
            .to_string(),
    )
}

fn build_http_client(credentials: &Credentials) -> Result<Client> {
    let mut user_agent = format!("cbc-sdk-rust/{}", env!("CARGO_PKG_VERSION"));
    if let Some(integration) = &credentials.integration_name {
        user_agent = format!("{integration} {user_agent}");
    }

    let mut builder = Client::builder()
        .connect_timeout(API_CONNECT_TIMEOUT)
        .timeout(credentials.request_timeout)
        .user_agent(user_agent)
        .danger_accept_invalid_certs(!credentials.ssl_verify);

    if let Some(path) = &credentials.ssl_cert_file {
        let pem = std::fs::read(path).map_err(|e| ApiError::Credential {
            message: format!("cannot read certificate {}", path.display()),
            source: Some(Box::new(e)),
        })?;
        let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| ApiError::Credential {
            message: format!("invalid certificate {}", path.display()),
            source: Some(Box::new(e)),
        })?;
        builder = builder.add_root_certificate(cert);
    }

    if credentials.ignore_system_proxy {
        builder = builder.no_proxy();
    } else if let Some(proxy) = &credentials.proxy {
        let proxy = reqwest::Proxy::all(proxy).map_err(|e| ApiError::Credential {
            message: format!("invalid proxy {proxy}"),
            source: Some(Box::new(e)),
        })?;
        builder = builder.proxy(proxy);
    }

    Ok(builder.build()?)
}

/// Authenticated client for one Carbon Black Cloud organization.
///
/// Models keep a weak handle to the client, so it is normally shared as
/// `Arc<ApiClient>` and must outlive the models and queries built from it.
pub struct ApiClient {
    client: Client,
    credentials: Credentials,
    registry: ModelRegistry,
    documents: ExpiringCache<String, Map<String, Value>>,
}

impl std::fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClient")
            .field("credentials", &self.credentials)
            .field("models", &self.registry.names())
            .finish()
    }
}

impl ApiClient {
    /// Builds a client from validated credentials with the default registry.
    pub fn new(credentials: Credentials) -> Result<Self> {
        credentials.validate()?;
        Ok(ApiClient {
            client: build_http_client(&credentials)?,
            credentials,
            registry: ModelRegistry::with_defaults(),
            documents: ExpiringCache::new(SELECT_CACHE_SIZE, SELECT_CACHE_TTL),
        })
    }

    /// Replaces the model registry.
    pub fn with_registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Replaces the select-by-id cache policy.
    pub fn with_select_cache(mut self, max_size: usize, ttl: Duration) -> Self {
        self.documents = ExpiringCache::new(max_size, ttl);
        self
    }

    /// The credentials this client was built from.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Organization key substituted into resource paths.
    pub fn org_key(&self) -> &str {
        &self.credentials.org_key
    }

    /// The model registry.
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Expands a URL template for this client's organization.
    pub fn path(&self, template: &str, id: Option<&str>, job_id: Option<&str>) -> String {
        expand_path(template, self.org_key(), id, job_id)
    }

    /// Sends an authenticated request and returns the response without
    /// checking its status.
    ///
    /// `path` is appended to the credentials' base URL and should start with
    /// `/`. `body`, when present, is sent as JSON.
    pub async fn send<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&B>,
    ) -> Result<ApiResponse> {
        let url = format!("{}{}", self.credentials.url, path);
        debug!(%method, %url, "sending request");

        let mut req = self
            .client
            .request(method, &url)
            .header("X-Auth-Token", &self.credentials.token);
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(payload) = body {
            req = req.json(payload);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let uri = match resp.url().query() {
            Some(q) => format!("{path}?{q}"),
            None => path.to_string(),
        };
        let body = resp.text().await?;
        debug!(%status, %uri, bytes = body.len(), "received response");

        Ok(ApiResponse { uri, status, body })
    }

    /// GETs a JSON document, failing on any non-success status.
    pub async fn get_object(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        self.send::<()>(Method::GET, path, query, None)
            .await?
            .error_for_status()?
            .json()
    }

    /// POSTs a JSON body and returns the raw response.
    pub async fn post_object<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ApiResponse> {
        self.send(Method::POST, path, &[], Some(body)).await
    }

    /// POSTs a JSON body, failing on any non-success status, and decodes
    /// the response.
    pub async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<Value> {
        self.post_object(path, body).await?.error_for_status()?.json()
    }

    /// PUTs a JSON body and returns the raw response.
    pub async fn put_object<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<ApiResponse> {
        self.send(Method::PUT, path, &[], Some(body)).await
    }

    /// Sends a DELETE and returns the raw response.
    pub async fn delete_object(&self, path: &str) -> Result<ApiResponse> {
        self.send::<()>(Method::DELETE, path, &[], None).await
    }

    /// Downloads raw bytes from an API path (e.g. live response file content).
    pub async fn get_raw_data(&self, path: &str) -> Result<bytes::Bytes> {
        let url = format!("{}{}", self.credentials.url, path);
        debug!(%url, "downloading raw data");
        let resp = self
            .client
            .get(&url)
            .header("X-Auth-Token", &self.credentials.token)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(status_error(path.to_string(), status, body));
        }
        Ok(resp.bytes().await?)
    }

    fn cache_key(schema: &ModelSchema, id: &str) -> String {
        format!("{}:{}", schema.name, id)
    }

    pub(crate) fn cache_document(&self, schema: &ModelSchema, id: &str, doc: &Map<String, Value>) {
        self.documents
            .set(Self::cache_key(schema, id), doc.clone());
    }

    pub(crate) fn evict_document(&self, schema: &ModelSchema, id: &str) {
        self.documents.remove(&Self::cache_key(schema, id));
    }

    /// Fetches the document for `id` directly from the server, bypassing and
    /// then refreshing the select cache.
    pub(crate) async fn fetch_document(
        &self,
        schema: &'static ModelSchema,
        id: &str,
    ) -> Result<Map<String, Value>> {
        let path = self.path(schema.urlobject_single, Some(id), None);
        match self.get_object(&path, &[]).await? {
            Value::Object(doc) => {
                self.cache_document(schema, id, &doc);
                Ok(doc)
            }
            other => Err(ApiError::Server {
                uri: path,
                status: StatusCode::OK,
                body: other.to_string(),
            }),
        }
    }

    /// Returns a fully initialized model for `id`.
    ///
    /// Repeated selections of the same identifier within the cache window
    /// reuse the previously fetched document instead of issuing a request.
    pub async fn select(self: &Arc<Self>, schema: &'static ModelSchema, id: &str) -> Result<Model> {
        let key = Self::cache_key(schema, id);
        let doc = match self.documents.get(&key) {
            Some(doc) => doc,
            None => self.fetch_document(schema, id).await?,
        };
        Ok(Model::from_document(self, schema, doc, true))
    }

    /// Same as [`ApiClient::select`], resolving the model type by name.
    pub async fn select_by_name(self: &Arc<Self>, name: &str, id: &str) -> Result<Model> {
        let schema = self.registry.lookup(name)?;
        self.select(schema, id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, body: &str) -> ApiResponse {
        ApiResponse {
            uri: "/test".to_string(),
            status: StatusCode::from_u16(status).unwrap(),
            body: body.to_string(),
        }
    }

    #[test]
    fn status_mapping_follows_taxonomy() {
        assert!(matches!(
            response(401, "").error_for_status(),
            Err(ApiError::Unauthorized { .. })
        ));
        assert!(matches!(
            response(403, "").error_for_status(),
            Err(ApiError::Unauthorized { .. })
        ));
        assert!(matches!(
            response(404, "nope").error_for_status(),
            Err(ApiError::ObjectNotFound { .. })
        ));
        assert!(matches!(
            response(409, "conflict").error_for_status(),
            Err(ApiError::Client { .. })
        ));
        assert!(matches!(
            response(502, "bad gateway").error_for_status(),
            Err(ApiError::Server { .. })
        ));
        assert!(response(204, "").error_for_status().is_ok());
    }

    #[test]
    fn invalid_query_400_becomes_query_syntax() {
        let body = r#"{"error_code":"INVALID_QUERY","message":"unbalanced parenthesis"}"#;
        match response(400, body).error_for_status() {
            Err(ApiError::QuerySyntax { message, .. }) => {
                assert_eq!(message, "unbalanced parenthesis")
            }
            other => panic!("expected QuerySyntax, got {other:?}"),
        }
    }

    #[test]
    fn plain_400_stays_client_error() {
        let body = r#"{"error_code":"INVALID_FIELD","message":"bad"}"#;
        assert!(matches!(
            response(400, body).error_for_status(),
            Err(ApiError::Client { .. })
        ));
    }

    #[test]
    fn empty_body_decodes_as_null() {
        assert_eq!(response(204, "  ").json().unwrap(), Value::Null);
    }

    #[test]
    fn malformed_success_body_is_server_error() {
        assert!(matches!(
            response(200, "<html>").json(),
            Err(ApiError::Server { .. })
        ));
    }

    #[test]
    fn client_requires_valid_credentials() {
        let err = ApiClient::new(Credentials::new("https://x", "", "ORG")).unwrap_err();
        assert!(matches!(err, ApiError::Credential { .. }));
    }

    #[test]
    fn path_uses_org_key() {
        let client = ApiClient::new(Credentials::new("https://x", "T/I", "ORG9")).unwrap();
        assert_eq!(
            client.path("/appservices/v6/orgs/{org_key}/devices/{id}", Some("7"), None),
            "/appservices/v6/orgs/ORG9/devices/7"
        );
    }
}
