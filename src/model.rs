//! Model base: a typed view over a server-side JSON document.
//!
//! A [`Model`] pairs a static [`ModelSchema`] with the object's backing
//! document and tracks:
//!
//! - **identity**: the server-assigned unique id (`None` until created);
//! - **initialization**: whether the document is a complete server copy or a
//!   partial stub that should be refreshed on first access to a missing key;
//! - **dirty attributes**: for each field changed since the last load/save,
//!   the value it had before (`None` if the key was absent).
//!
//! Reads go through [`Model::get`] (raw value, with lazy refresh) or
//! [`Model::field`] (descriptor-coerced value). Writes go through
//! [`Model::set`], which rejects immutable models and routes declared
//! fields through the dirty-tracking setter. [`Model::save`] sends a create
//! or an update depending on identity, and only when something is dirty.
//!
//! Models hold a weak handle to their [`ApiClient`]; every network operation
//! fails with `ApiError::Api` if the client has been dropped.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use tracing::{debug, instrument, warn};

use crate::attribute::{FieldKind, FieldValue};
use crate::client::{ApiClient, ApiResponse};
use crate::error::{ApiError, Result};
use crate::schema::ModelSchema;

/// One server-side object.
#[derive(Clone)]
pub struct Model {
    api: Weak<ApiClient>,
    schema: &'static ModelSchema,
    info: Map<String, Value>,
    unique_id: Option<String>,
    full_doc: bool,
    dirty: BTreeMap<String, Option<Value>>,
    last_refresh: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct(self.schema.name)
            .field("id", &self.unique_id)
            .field("full_doc", &self.full_doc)
            .field("dirty", &self.dirty.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Renders a JSON value the way it would read in a report: strings bare,
/// everything else as compact JSON.
fn render_value(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn id_from_value(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

impl Model {
    /// General constructor.
    ///
    /// When `initial` is `None`, `id` is `Some` and `force_init` is set, the
    /// document is fetched immediately. Otherwise the model starts from the
    /// given document (or an empty one); `full_doc` declares whether that
    /// document is complete. When `id` is `None` it is read from the
    /// document's primary key.
    pub async fn new(
        api: &Arc<ApiClient>,
        schema: &'static ModelSchema,
        id: Option<&str>,
        initial: Option<Map<String, Value>>,
        force_init: bool,
        full_doc: bool,
    ) -> Result<Self> {
        let needs_fetch = initial.is_none() && id.is_some() && force_init;
        let mut model = Model::detached(
            Arc::downgrade(api),
            schema,
            initial.unwrap_or_default(),
            full_doc,
        );
        if let Some(id) = id {
            model.unique_id = Some(id.to_string());
        }
        if needs_fetch {
            model.refresh().await?;
        }
        Ok(model)
    }

    /// Wraps a document already fetched from the server.
    pub fn from_document(
        api: &Arc<ApiClient>,
        schema: &'static ModelSchema,
        doc: Map<String, Value>,
        full_doc: bool,
    ) -> Self {
        Model::detached(Arc::downgrade(api), schema, doc, full_doc)
    }

    /// A blank, unsaved object seeded with the schema's field defaults.
    pub fn new_object(api: &Arc<ApiClient>, schema: &'static ModelSchema) -> Self {
        let mut doc = Map::new();
        for field in schema.fields {
            if let Some(default) = field.default {
                doc.insert(field.name.to_string(), default());
            }
        }
        // Nothing to lazy-load for an object that does not exist yet.
        Model::detached(Arc::downgrade(api), schema, doc, true)
    }

    pub(crate) fn detached(
        api: Weak<ApiClient>,
        schema: &'static ModelSchema,
        info: Map<String, Value>,
        full_doc: bool,
    ) -> Self {
        let unique_id = info.get(schema.primary_key).and_then(id_from_value);
        Model {
            api,
            schema,
            info,
            unique_id,
            full_doc,
            dirty: BTreeMap::new(),
            last_refresh: None,
        }
    }

    fn api(&self) -> Result<Arc<ApiClient>> {
        self.api
            .upgrade()
            .ok_or_else(|| ApiError::Api("API client has been dropped".to_string()))
    }

    /// The schema this model was built from.
    pub fn schema(&self) -> &'static ModelSchema {
        self.schema
    }

    /// Server-assigned identifier, if any.
    pub fn id(&self) -> Option<&str> {
        self.unique_id.as_deref()
    }

    /// The backing document as currently held locally.
    pub fn document(&self) -> &Map<String, Value> {
        &self.info
    }

    /// Reads a raw value without triggering a refresh.
    pub fn peek(&self, name: &str) -> Option<&Value> {
        self.info.get(name)
    }

    /// `true` if the document is a complete server copy.
    pub fn is_fully_initialized(&self) -> bool {
        self.full_doc
    }

    /// `true` if any attribute changed since the last load or save.
    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Dirty attribute names mapped to their pre-change values.
    pub fn dirty_attributes(&self) -> &BTreeMap<String, Option<Value>> {
        &self.dirty
    }

    /// When the document was last fetched from the server.
    pub fn last_refresh(&self) -> Option<DateTime<Utc>> {
        self.last_refresh
    }

    /// Single-object URI for this model.
    pub fn uri(&self) -> Option<String> {
        let api = self.api.upgrade()?;
        let id = self.unique_id.as_deref()?;
        Some(api.path(self.schema.urlobject_single, Some(id), None))
    }

    /// Refreshes once if the model has an identity but only a partial document.
    async fn ensure_loaded(&mut self) -> Result<()> {
        if !self.full_doc && self.unique_id.is_some() {
            self.refresh().await?;
        }
        Ok(())
    }

    /// Reads a raw attribute.
    ///
    /// A key missing from a partial document triggers one refresh before the
    /// lookup is retried. Declared fields that are still absent read as
    /// `Value::Null`; undeclared, absent names fail with `NoSuchAttribute`.
    pub async fn get(&mut self, name: &str) -> Result<Value> {
        if !self.info.contains_key(name) {
            self.ensure_loaded().await?;
        }
        match self.info.get(name) {
            Some(v) => Ok(v.clone()),
            None if self.schema.field(name).is_some() => Ok(Value::Null),
            None => Err(ApiError::NoSuchAttribute {
                model: self.schema.name,
                name: name.to_string(),
            }),
        }
    }

    /// Reads a declared field through its descriptor.
    ///
    /// Array fields never read as null (absent → empty list); object fields
    /// read as an empty map. Undeclared names fall back to [`Model::get`].
    pub async fn field(&mut self, name: &str) -> Result<FieldValue> {
        let Some(spec) = self.schema.field(name) else {
            return self.get(name).await.map(FieldValue::from);
        };
        let key = spec.id_field().unwrap_or_else(|| spec.name.to_string());
        if !self.info.contains_key(&key) {
            self.ensure_loaded().await?;
        }
        Ok(spec.kind.decode(self.info.get(&key)))
    }

    /// Reads a string field.
    pub async fn get_str(&mut self, name: &str) -> Result<Option<String>> {
        Ok(self.field(name).await?.as_str().map(str::to_string))
    }

    /// Reads a timestamp field.
    pub async fn get_timestamp(&mut self, name: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.field(name).await?.as_timestamp())
    }

    /// Reads an array field; absent reads as empty.
    pub async fn get_list(&mut self, name: &str) -> Result<Vec<Value>> {
        match self.field(name).await? {
            FieldValue::List(items) => Ok(items),
            FieldValue::Null => Ok(Vec::new()),
            FieldValue::Value(Value::Array(items)) => Ok(items),
            other => Err(ApiError::InvalidArgument(format!(
                "{name:?} is not a list: {other:?}"
            ))),
        }
    }

    /// Resolves a foreign-key field to the referenced model.
    ///
    /// Returns `None` when the sibling id attribute is absent.
    pub async fn related(&mut self, name: &str) -> Result<Option<Model>> {
        let spec = self.schema.field(name).ok_or_else(|| ApiError::NoSuchAttribute {
            model: self.schema.name,
            name: name.to_string(),
        })?;
        let FieldKind::ForeignKey { model, .. } = spec.kind else {
            return Err(ApiError::InvalidArgument(format!(
                "{name:?} is not a reference field"
            )));
        };
        let id_field = spec.id_field().unwrap_or_default();
        let Some(id) = id_from_value(&self.get(&id_field).await?) else {
            return Ok(None);
        };
        let api = self.api()?;
        let target = api.registry().lookup(model)?;
        api.select(target, &id).await.map(Some)
    }

    /// Writes an attribute.
    ///
    /// - Immutable models reject every write.
    /// - Declared fields are coerced by their descriptor and dirty-tracked.
    /// - Undeclared keys that already exist in the document are written with
    ///   a warning, tolerating schema drift.
    /// - Anything else fails with `NoSuchAttribute`.
    pub async fn set(&mut self, name: &str, value: impl Into<FieldValue>) -> Result<()> {
        if !self.schema.is_mutable() {
            return Err(ApiError::Immutable {
                model: self.schema.name,
                name: name.to_string(),
            });
        }

        let value = value.into();
        if let Some(spec) = self.schema.field(name) {
            let encoded = spec.kind.encode(name, value)?;
            return self.set_field(name, encoded).await;
        }

        self.ensure_loaded().await?;
        if self.info.contains_key(name) {
            warn!(
                model = self.schema.name,
                attribute = name,
                "setting attribute not declared in the schema"
            );
            let encoded = FieldKind::Any.encode(name, value)?;
            return self.set_field(name, encoded).await;
        }

        Err(ApiError::NoSuchAttribute {
            model: self.schema.name,
            name: name.to_string(),
        })
    }

    /// Dirty-tracking write of a raw document value.
    ///
    /// Loads the full document first if the model has an identity. Setting
    /// the current value is a no-op; setting a dirty field back to its
    /// original value clears its dirty entry.
    pub async fn set_field(&mut self, name: &str, new_value: Value) -> Result<()> {
        self.ensure_loaded().await?;
        self.apply_field(name, new_value);
        Ok(())
    }

    fn apply_field(&mut self, name: &str, new_value: Value) {
        if self.info.get(name) == Some(&new_value) {
            return;
        }

        match self.dirty.get(name).cloned() {
            Some(Some(original)) if original == new_value => {
                self.dirty.remove(name);
            }
            Some(_) => {}
            None => {
                let previous = self.info.get(name).cloned();
                self.dirty.insert(name.to_string(), previous);
            }
        }
        self.info.insert(name.to_string(), new_value);
    }

    /// Restores every dirty attribute to its recorded original value.
    pub fn reset(&mut self) {
        for (name, original) in std::mem::take(&mut self.dirty) {
            match original {
                Some(v) => self.info.insert(name, v),
                None => self.info.remove(&name),
            };
        }
    }

    /// Re-fetches the document by identifier, replacing local state.
    ///
    /// No-op when the model has no identifier, or when the primary key itself
    /// is dirty (a pending rename would be clobbered).
    #[instrument(skip(self), fields(model = self.schema.name, id = ?self.unique_id))]
    pub async fn refresh(&mut self) -> Result<()> {
        if !self.schema.refreshable {
            return Err(ApiError::Api(format!(
                "{} objects cannot be refreshed",
                self.schema.name
            )));
        }
        let Some(id) = self.unique_id.clone() else {
            return Ok(());
        };
        if self.dirty.contains_key(self.schema.primary_key) {
            return Ok(());
        }

        let api = self.api()?;
        let doc = api.fetch_document(self.schema, &id).await?;
        self.adopt(doc);
        Ok(())
    }

    fn adopt(&mut self, doc: Map<String, Value>) {
        if let Some(id) = doc.get(self.schema.primary_key).and_then(id_from_value) {
            self.unique_id = Some(id);
        }
        self.info = doc;
        self.dirty.clear();
        self.full_doc = true;
        self.last_refresh = Some(Utc::now());
    }

    /// Checks that every required field is present, loading the full
    /// document first if needed.
    pub async fn validate(&mut self) -> Result<()> {
        self.ensure_loaded().await?;
        let mut missing: Vec<String> = self
            .schema
            .required_fields()
            .filter(|name| !self.info.contains_key(*name))
            .map(str::to_string)
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        missing.sort();
        Err(ApiError::InvalidObject { missing })
    }

    /// Persists pending changes.
    ///
    /// Does nothing (and sends nothing) when no attribute is dirty. New
    /// objects, and objects whose primary key changed, are POSTed in full to
    /// the collection endpoint; existing objects get a PUT carrying the
    /// primary key plus the changed fields. A rejected request keeps the
    /// pending changes and fails with the status's typed error.
    #[instrument(skip(self), fields(model = self.schema.name, id = ?self.unique_id))]
    pub async fn save(&mut self) -> Result<()> {
        if !self.is_dirty() {
            return Ok(());
        }
        self.validate().await?;

        let api = self.api()?;
        let creating =
            self.unique_id.is_none() || self.dirty.contains_key(self.schema.primary_key);

        let response = if creating {
            let path = api.path(self.schema.urlobject, None, None);
            api.post_object(&path, &self.info).await?.error_for_status()?
        } else {
            let path = api.path(self.schema.urlobject_single, self.unique_id.as_deref(), None);
            api.put_object(&path, &self.update_envelope())
                .await?
                .error_for_status()?
        };

        self.dirty.clear();
        self.refresh_if_needed(&api, response).await
    }

    fn update_envelope(&self) -> Map<String, Value> {
        let mut envelope = Map::new();
        if let Some(id) = self.info.get(self.schema.primary_key) {
            envelope.insert(self.schema.primary_key.to_string(), id.clone());
        }
        for name in self.dirty.keys() {
            let v = self.info.get(name).cloned().unwrap_or(Value::Null);
            envelope.insert(name.clone(), v);
        }
        envelope
    }

    /// Interprets a successful create/update response: a full document is
    /// adopted directly; a bare identifier or empty body leads to a refresh.
    async fn refresh_if_needed(&mut self, api: &ApiClient, response: ApiResponse) -> Result<()> {
        let pk = self.schema.primary_key;
        let refresh_required = match response.json()? {
            Value::Object(doc) if doc.get("success") == Some(&Value::Bool(false)) => {
                return Err(ApiError::Server {
                    uri: response.uri,
                    status: response.status,
                    body: response.body,
                });
            }
            Value::Object(doc) if doc.len() == 1 && doc.contains_key(pk) => {
                self.unique_id = doc.get(pk).and_then(id_from_value);
                true
            }
            Value::Object(doc) if !doc.is_empty() => {
                self.adopt(doc);
                false
            }
            bare @ (Value::String(_) | Value::Number(_)) => {
                self.unique_id = id_from_value(&bare);
                true
            }
            _ => true,
        };

        if refresh_required {
            debug!(model = self.schema.name, "response did not carry the object; refreshing");
            if self.schema.refreshable {
                self.refresh().await?;
            }
        } else if let Some(id) = self.unique_id.clone() {
            api.cache_document(self.schema, &id, &self.info);
        }
        Ok(())
    }

    /// Deletes the object on the server and forgets its identity.
    ///
    /// No-op for models without an identifier.
    #[instrument(skip(self), fields(model = self.schema.name, id = ?self.unique_id))]
    pub async fn delete(&mut self) -> Result<()> {
        let Some(id) = self.unique_id.clone() else {
            return Ok(());
        };
        let api = self.api()?;
        let path = api.path(self.schema.urlobject_single, Some(&id), None);
        let response = api.delete_object(&path).await?;
        if !response.is_success() {
            return Err(ApiError::Server {
                uri: response.uri,
                status: response.status,
                body: response.body,
            });
        }
        api.evict_document(self.schema, &id);
        self.unique_id = None;
        self.full_doc = false;
        Ok(())
    }
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} object", self.schema.name)?;
        if let Some(uri) = self.uri() {
            write!(f, ", bound to {uri}")?;
        }
        writeln!(f)?;
        if let Some(ts) = self.last_refresh {
            writeln!(f, " Last refreshed at {}", ts.to_rfc3339())?;
        }
        writeln!(f)?;

        let mut keys: Vec<&String> = self.info.keys().collect();
        keys.sort();
        let width = keys.iter().map(|k| k.len()).max().unwrap_or(0);
        for key in keys {
            let marker = if self.dirty.contains_key(key) { "*" } else { " " };
            writeln!(
                f,
                "{marker}{key:>width$}: {}",
                render_value(&self.info[key])
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::FieldSpec;
    use crate::schema::{Mutability, SearchKind};
    use serde_json::json;

    const WIDGET_SCHEMA: ModelSchema = ModelSchema {
        name: "Widget",
        primary_key: "id",
        urlobject: "/widgets/{org_key}",
        urlobject_single: "/widgets/{org_key}/{id}",
        fields: &[
            FieldSpec::new("id", FieldKind::String),
            FieldSpec::required("name", FieldKind::String),
            FieldSpec::new("count", FieldKind::Integer),
            FieldSpec::new("tags", FieldKind::Array),
            FieldSpec::new("meta", FieldKind::Object),
            FieldSpec::new("created", FieldKind::IsoDate),
            FieldSpec::new("seen", FieldKind::EpochDate { divisor: 1000.0 }),
            FieldSpec::new("blob", FieldKind::Binary),
        ],
        mutability: Mutability::Mutable,
        refreshable: true,
        search: SearchKind::Unsearchable,
        facets: None,
    };

    static WIDGET: ModelSchema = WIDGET_SCHEMA;

    static FROZEN: ModelSchema = ModelSchema {
        name: "Frozen",
        mutability: Mutability::Immutable,
        ..WIDGET_SCHEMA
    };

    fn widget(doc: Value) -> Model {
        let Value::Object(map) = doc else {
            panic!("test document must be an object")
        };
        Model::detached(Weak::new(), &WIDGET, map, true)
    }

    #[tokio::test]
    async fn setting_current_value_is_not_dirty() {
        let mut m = widget(json!({"id": "w1", "name": "alpha"}));
        m.set("name", "alpha").await.unwrap();
        assert!(!m.is_dirty());
    }

    #[tokio::test]
    async fn restoring_original_value_clears_dirty_entry() {
        let mut m = widget(json!({"id": "w1", "name": "alpha"}));
        m.set("name", "beta").await.unwrap();
        m.set("name", "gamma").await.unwrap();
        assert_eq!(m.dirty_attributes().get("name"), Some(&Some(json!("alpha"))));
        m.set("name", "alpha").await.unwrap();
        assert!(!m.is_dirty());
    }

    #[tokio::test]
    async fn newly_added_field_records_absent_sentinel() {
        let mut m = widget(json!({"id": "w1", "name": "alpha"}));
        m.set("count", "5").await.unwrap();
        assert_eq!(m.peek("count"), Some(&json!(5)));
        assert_eq!(m.dirty_attributes().get("count"), Some(&None));
        m.reset();
        assert!(m.peek("count").is_none());
        assert!(!m.is_dirty());
    }

    #[tokio::test]
    async fn absent_collections_read_as_empty() {
        let mut m = widget(json!({"id": "w1"}));
        assert_eq!(m.field("tags").await.unwrap(), FieldValue::List(vec![]));
        assert_eq!(m.field("meta").await.unwrap(), FieldValue::Map(Map::new()));
        assert!(m.get_list("tags").await.unwrap().is_empty());
        assert!(m.field("name").await.unwrap().is_null());
    }

    #[tokio::test]
    async fn typed_setters_encode_into_document() {
        let mut m = widget(json!({"id": "w1", "name": "a"}));
        let ts = DateTime::parse_from_rfc3339("2024-01-02T03:04:05Z")
            .unwrap()
            .with_timezone(&Utc);
        m.set("created", ts).await.unwrap();
        m.set("seen", ts).await.unwrap();
        m.set("blob", b"hi".to_vec()).await.unwrap();
        assert_eq!(m.peek("created"), Some(&json!("2024-01-02T03:04:05.000Z")));
        assert_eq!(m.peek("seen"), Some(&json!(1_704_164_645_000_i64)));
        assert_eq!(m.peek("blob"), Some(&json!("aGk=")));
        assert_eq!(m.get_timestamp("seen").await.unwrap(), Some(ts));
    }

    #[tokio::test]
    async fn undeclared_existing_key_is_writable() {
        let mut m = widget(json!({"id": "w1", "name": "a", "legacy": 1}));
        m.set("legacy", 2_i64).await.unwrap();
        assert_eq!(m.peek("legacy"), Some(&json!(2)));
        assert!(m.dirty_attributes().contains_key("legacy"));
    }

    #[tokio::test]
    async fn unknown_attribute_write_fails() {
        let mut m = widget(json!({"id": "w1", "name": "a"}));
        assert!(matches!(
            m.set("bogus", 1_i64).await,
            Err(ApiError::NoSuchAttribute { .. })
        ));
    }

    #[tokio::test]
    async fn unknown_attribute_read_fails_on_full_document() {
        let mut m = widget(json!({"id": "w1"}));
        assert!(matches!(
            m.get("bogus").await,
            Err(ApiError::NoSuchAttribute { .. })
        ));
    }

    #[tokio::test]
    async fn immutable_models_reject_writes() {
        let Value::Object(doc) = json!({"id": "f1", "name": "x"}) else {
            unreachable!()
        };
        let mut m = Model::detached(Weak::new(), &FROZEN, doc, true);
        assert!(matches!(
            m.set("name", "y").await,
            Err(ApiError::Immutable { .. })
        ));
    }

    #[tokio::test]
    async fn validate_names_missing_required_fields() {
        let mut m = widget(json!({"id": "w1"}));
        match m.validate().await {
            Err(ApiError::InvalidObject { missing }) => assert_eq!(missing, vec!["name"]),
            other => panic!("expected InvalidObject, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_save_sends_nothing() {
        // A detached model has no client; any network attempt would fail.
        let mut m = widget(json!({"id": "w1", "name": "a"}));
        m.save().await.unwrap();
        m.save().await.unwrap();
    }

    #[tokio::test]
    async fn update_envelope_holds_key_and_changes() {
        let mut m = widget(json!({"id": "w1", "name": "a", "count": 1}));
        m.set("count", 2_i64).await.unwrap();
        assert_eq!(
            Value::Object(m.update_envelope()),
            json!({"id": "w1", "count": 2})
        );
    }

    #[test]
    fn numeric_primary_key_becomes_string_id() {
        let m = widget(json!({"id": 42}));
        assert_eq!(m.id(), Some("42"));
    }

    #[test]
    fn display_lists_sorted_fields_and_marks_dirty() {
        let mut m = widget(json!({"name": "alpha", "id": "w1"}));
        m.apply_field("name", json!("beta"));
        let text = m.to_string();
        assert!(text.starts_with("Widget object"));
        let id_pos = text.find("id: w1").unwrap();
        let name_pos = text.find("*name: beta").unwrap();
        assert!(id_pos < name_pos);
    }
}
