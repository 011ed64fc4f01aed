//! Async Rust client SDK for the Carbon Black Cloud REST API.
//!
//! Server objects are exposed as [`model::Model`]s: typed views over JSON
//! documents with lazy loading and dirty tracking, described by static
//! [`schema::ModelSchema`] tables. Searches are built with
//! [`query::Query`], which hides three backend strategies (client-filtered
//! lists, offset-windowed searches, and asynchronous search jobs) behind one
//! lazy result cursor.
//!
//! # Modules
//!
//! - [`error`]: Typed error taxonomy (`ApiError`) for all library operations.
//! - [`credentials`]: Credential loading from the environment or a TOML file.
//! - [`client`]: Authenticated HTTP transport, status mapping, cached `select`.
//! - [`cache`]: Size- and time-bounded cache with an optional sweeper task.
//! - [`attribute`]: Field descriptors and value coercion.
//! - [`schema`]: Model schemas and the name → schema registry.
//! - [`model`]: The model base: identity, lazy load, dirty tracking, save.
//! - [`criteria`]: Predicates, criteria and the search request envelope.
//! - [`job`]: Asynchronous search-job submission and polling.
//! - [`query`]: The query execution engine and result cursor.
//! - [`facet`]: Facet (bucket count) requests.
//! - [`devices`], [`alerts`], [`policies`], [`processes`], [`workflow`]: Resources.
//! - [`live_response`]: Interactive sessions on a device.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use cbc_sdk::client::ApiClient;
//! use cbc_sdk::credentials::Credentials;
//! use cbc_sdk::devices;
//!
//! let api = Arc::new(ApiClient::new(Credentials::from_env()?)?);
//! let mut query = devices::search(&api)?
//!     .where_("os:WINDOWS")?
//!     .add_criteria("status", ["REGISTERED"]);
//! for device in query.slice(0..10).await? {
//!     println!("{device}");
//! }
//! ```

#![warn(missing_docs)]

pub mod alerts;
pub mod attribute;
pub mod cache;
pub mod client;
pub mod credentials;
pub mod criteria;
pub mod devices;
pub mod error;
pub mod facet;
pub mod job;
pub mod live_response;
pub mod model;
pub mod policies;
pub mod processes;
pub mod query;
pub mod schema;
pub mod workflow;
