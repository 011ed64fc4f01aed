//! Typed error hierarchy for the cbc-sdk crate.
//!
//! `ApiError` separates failures by the boundary they happen at, so callers
//! can tell "the object does not exist" apart from "the server broke" or
//! "the query was rejected before anything was sent":
//!
//! - `Credential` covers missing or malformed auth material.
//! - `Connection` wraps `reqwest::Error` for transport failures that never
//!   produced an HTTP status (DNS, TCP, TLS, transport timeout).
//! - `Client`, `Server`, `Unauthorized`, `ObjectNotFound` and `QuerySyntax`
//!   are translated from HTTP status codes and keep the URI and body text.
//! - `Timeout` is the client-enforced limit on async job polling.
//! - `InvalidObject` and `InvalidArgument` are raised locally, before any
//!   network call is made.

use reqwest::StatusCode;

/// Unified error type for all cbc-sdk library operations.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Credentials are missing required values or could not be loaded.
    #[error("credential error: {message}")]
    Credential {
        /// What was missing or malformed.
        message: String,
        /// The underlying I/O or parse error, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A transport-level failure occurred before an HTTP status was received.
    #[error("connection error: {0}")]
    Connection(#[from] reqwest::Error),

    /// The server rejected the request with a 4xx status (other than the
    /// statuses that map to more specific variants).
    #[error("client error {status} on {uri}: {body}")]
    Client {
        /// Request URI.
        uri: String,
        /// HTTP status code.
        status: StatusCode,
        /// Raw response body.
        body: String,
    },

    /// The server failed with a 5xx status, or returned a success status with
    /// a body that could not be decoded.
    #[error("server error {status} on {uri}: {body}")]
    Server {
        /// Request URI.
        uri: String,
        /// HTTP status code.
        status: StatusCode,
        /// Raw response body.
        body: String,
    },

    /// The server returned 404 for the requested object.
    #[error("object not found at {uri}: {message}")]
    ObjectNotFound {
        /// Request URI.
        uri: String,
        /// Server-provided message, if any.
        message: String,
    },

    /// The API token was rejected (401) or lacks permission (403).
    #[error("unauthorized ({status}) on {uri}: {body}")]
    Unauthorized {
        /// Request URI.
        uri: String,
        /// HTTP status code.
        status: StatusCode,
        /// Raw response body.
        body: String,
    },

    /// The backend rejected the search predicate.
    #[error("invalid query on {uri}: {message}")]
    QuerySyntax {
        /// Request URI.
        uri: String,
        /// Server diagnostic for the rejected predicate.
        message: String,
    },

    /// A client-enforced timeout elapsed while waiting on the server.
    #[error("timed out: {message}")]
    Timeout {
        /// Description of what was being waited on.
        message: String,
    },

    /// A model failed validation because required fields are absent.
    #[error("missing required fields: {}", missing.join(", "))]
    InvalidObject {
        /// Names of the missing fields, sorted.
        missing: Vec<String>,
    },

    /// A caller-supplied argument failed local validation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `one()` found a result count other than exactly one.
    #[error("expected exactly one result, found {found}")]
    MoreThanOneResult {
        /// Number of matches the query reported.
        found: usize,
    },

    /// A model type name was not present in the registry.
    #[error("no model registered under the name {0:?}")]
    ModelNotFound(String),

    /// An attribute is neither declared by the schema nor present in the
    /// backing document.
    #[error("{model} has no attribute {name:?}")]
    NoSuchAttribute {
        /// Model type name.
        model: &'static str,
        /// Requested attribute.
        name: String,
    },

    /// An attempt was made to write to an immutable model.
    #[error("{model} is immutable; cannot set {name:?}")]
    Immutable {
        /// Model type name.
        model: &'static str,
        /// Attribute that was written.
        name: String,
    },

    /// SDK-level misuse or an unsupported operation, e.g. resubmitting a job
    /// or refreshing a model type that cannot be refreshed.
    #[error("{0}")]
    Api(String),

    /// JSON (de)serialization failed.
    #[error("failed to parse response: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ApiError {
    /// Builds a credential error without an underlying cause.
    pub fn credential(message: impl Into<String>) -> Self {
        ApiError::Credential {
            message: message.into(),
            source: None,
        }
    }

    /// Returns the HTTP status carried by this error, if it came from a
    /// completed HTTP exchange.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Client { status, .. }
            | ApiError::Server { status, .. }
            | ApiError::Unauthorized { status, .. } => Some(*status),
            ApiError::ObjectNotFound { .. } => Some(StatusCode::NOT_FOUND),
            _ => None,
        }
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, ApiError>;
