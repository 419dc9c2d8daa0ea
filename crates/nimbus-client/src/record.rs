//! Records: the client-side view of stored objects.
//!
//! A [`Record`] is untyped at its core (a JSON attribute map) and is tagged
//! with a [`RecordKind`]. Types implementing [`Schema`] give per-kind field
//! typing on top of it.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Number, Value};

use crate::relation::Relation;
use crate::types::{FieldOp, Pointer, encode_ops, parse_date};
use crate::{Acl, ErrorCode, NimbusError};

/// Keys the server manages; never sent as attributes.
const RESERVED_KEYS: &[&str] = &[
    "objectId",
    "createdAt",
    "updatedAt",
    "ACL",
    "className",
    "__type",
];

/// Which class a record belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKind {
    User,
    Role,
    Session,
    Installation,
    Custom(String),
}

impl RecordKind {
    /// The class name used on the wire.
    pub fn class_name(&self) -> &str {
        match self {
            RecordKind::User => "_User",
            RecordKind::Role => "_Role",
            RecordKind::Session => "_Session",
            RecordKind::Installation => "_Installation",
            RecordKind::Custom(name) => name,
        }
    }

    /// REST path of the collection, relative to the server URL.
    pub(crate) fn collection_path(&self) -> String {
        match self {
            RecordKind::User => "users".to_string(),
            RecordKind::Role => "roles".to_string(),
            RecordKind::Session => "sessions".to_string(),
            RecordKind::Installation => "installations".to_string(),
            RecordKind::Custom(name) => format!("classes/{name}"),
        }
    }
}

impl From<&str> for RecordKind {
    fn from(name: &str) -> Self {
        match name {
            "_User" => RecordKind::User,
            "_Role" => RecordKind::Role,
            "_Session" => RecordKind::Session,
            "_Installation" => RecordKind::Installation,
            other => RecordKind::Custom(other.to_string()),
        }
    }
}

impl From<String> for RecordKind {
    fn from(name: String) -> Self {
        RecordKind::from(name.as_str())
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

/// Typed field layout for one record kind.
pub trait Schema: Serialize + DeserializeOwned {
    fn kind() -> RecordKind;
}

/// A stored object: identity, attributes, pending changes, and ACL.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    kind: RecordKind,
    id: Option<String>,
    created_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
    server_data: Map<String, Value>,
    attributes: Map<String, Value>,
    pending: BTreeMap<String, FieldOp>,
    acl: Option<Acl>,
    acl_dirty: bool,
    existed: bool,
    data_available: bool,
}

impl Record {
    /// A new, unsaved record.
    pub fn new(kind: impl Into<RecordKind>) -> Self {
        Self {
            kind: kind.into(),
            id: None,
            created_at: None,
            updated_at: None,
            server_data: Map::new(),
            attributes: Map::new(),
            pending: BTreeMap::new(),
            acl: None,
            acl_dirty: false,
            existed: false,
            data_available: true,
        }
    }

    /// A reference to an existing record whose data has not been fetched.
    pub fn with_id(kind: impl Into<RecordKind>, id: impl Into<String>) -> Self {
        let mut record = Self::new(kind);
        record.id = Some(id.into());
        record.existed = true;
        record.data_available = false;
        record
    }

    /// Build a record from a server JSON object.
    pub fn from_server(
        kind: impl Into<RecordKind>,
        mut data: Map<String, Value>,
    ) -> Result<Self, NimbusError> {
        let mut record = Self::new(kind);
        record.id = match data.remove("objectId") {
            Some(Value::String(id)) => Some(id),
            Some(other) => {
                return Err(NimbusError::InvalidResponse(format!(
                    "objectId is not a string: {other}"
                )));
            }
            None => None,
        };
        record.created_at = data.remove("createdAt").as_ref().and_then(parse_date);
        record.updated_at = data.remove("updatedAt").as_ref().and_then(parse_date);
        if let Some(acl) = data.remove("ACL") {
            record.acl = Some(serde_json::from_value(acl)?);
        }
        data.remove("className");
        data.remove("__type");

        record.server_data = data.clone();
        record.attributes = data;
        record.existed = true;
        Ok(record)
    }

    /// Build an unsaved record whose every field is set from a schema value.
    pub fn from_schema<S: Schema>(value: &S) -> Result<Self, NimbusError> {
        let mut record = Self::new(S::kind());
        match serde_json::to_value(value)? {
            Value::Object(fields) => {
                for (key, value) in fields {
                    if !value.is_null() {
                        record.set(key, value);
                    }
                }
                Ok(record)
            }
            other => Err(NimbusError::invalid(
                ErrorCode::IncorrectType,
                format!("schema value must serialize to an object, got {other}"),
            )),
        }
    }

    /// Decode the attributes into a schema type.
    pub fn decode<S: Schema>(&self) -> Result<S, NimbusError> {
        if S::kind() != self.kind {
            return Err(NimbusError::invalid(
                ErrorCode::InvalidClassName,
                format!("cannot decode {} as {}", self.kind, S::kind()),
            ));
        }
        Ok(serde_json::from_value(Value::Object(self.attributes.clone()))?)
    }

    pub fn kind(&self) -> &RecordKind {
        &self.kind
    }

    pub fn class_name(&self) -> &str {
        self.kind.class_name()
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.updated_at
    }

    /// Whether the record existed on the server before its last save.
    pub fn existed(&self) -> bool {
        self.existed
    }

    /// Whether attribute data has been loaded from the server or set locally.
    pub fn is_data_available(&self) -> bool {
        self.data_available
    }

    pub fn pointer(&self) -> Option<Pointer> {
        self.id
            .as_ref()
            .map(|id| Pointer::new(self.class_name(), id.clone()))
    }

    pub fn attributes(&self) -> &Map<String, Value> {
        &self.attributes
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Decode one attribute; `Ok(None)` when absent or null.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, NimbusError> {
        match self.attributes.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
        }
    }

    pub fn has(&self, key: &str) -> bool {
        matches!(self.attributes.get(key), Some(v) if !v.is_null())
    }

    /// An attribute rendered as HTML-escaped text.
    pub fn escape(&self, key: &str) -> String {
        match self.attributes.get(key) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => escape_html(s),
            Some(other) => escape_html(&other.to_string()),
        }
    }

    /// Apply `op` to the local estimate and record it as pending.
    ///
    /// Fails without touching the record when `op` cannot be combined with
    /// the operation already pending on `key`.
    fn queue(&mut self, key: String, op: FieldOp) -> Result<&mut Self, NimbusError> {
        if RESERVED_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, class = %self.kind, "ignoring write to reserved key");
            return Ok(self);
        }

        let merged = match self.pending.get(&key) {
            Some(previous) => op.clone().merge_after(previous)?,
            None => op.clone(),
        };

        match op.apply(self.attributes.get(&key)) {
            Some(value) => {
                self.attributes.insert(key.clone(), value);
            }
            None => {
                self.attributes.remove(&key);
            }
        }
        self.pending.insert(key, merged);
        Ok(self)
    }

    /// Queue an operation that replaces whatever is pending on `key`.
    fn overwrite(&mut self, key: String, op: FieldOp) -> &mut Self {
        if RESERVED_KEYS.contains(&key.as_str()) {
            tracing::warn!(key = %key, class = %self.kind, "ignoring write to reserved key");
            return self;
        }
        match op.apply(None) {
            Some(value) => {
                self.attributes.insert(key.clone(), value);
            }
            None => {
                self.attributes.remove(&key);
            }
        }
        self.pending.insert(key, op);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.overwrite(key.into(), FieldOp::Set(value.into()))
    }

    pub fn unset(&mut self, key: impl Into<String>) -> &mut Self {
        self.overwrite(key.into(), FieldOp::Unset)
    }

    pub fn increment(
        &mut self,
        key: impl Into<String>,
        amount: impl Into<Number>,
    ) -> Result<&mut Self, NimbusError> {
        self.queue(key.into(), FieldOp::Increment(amount.into()))
    }

    /// Append an item to an array field.
    pub fn add(
        &mut self,
        key: impl Into<String>,
        item: impl Into<Value>,
    ) -> Result<&mut Self, NimbusError> {
        self.queue(key.into(), FieldOp::Add(vec![item.into()]))
    }

    /// Append an item to an array field unless already present.
    pub fn add_unique(
        &mut self,
        key: impl Into<String>,
        item: impl Into<Value>,
    ) -> Result<&mut Self, NimbusError> {
        self.queue(key.into(), FieldOp::AddUnique(vec![item.into()]))
    }

    /// Remove every occurrence of an item from an array field.
    pub fn remove(
        &mut self,
        key: impl Into<String>,
        item: impl Into<Value>,
    ) -> Result<&mut Self, NimbusError> {
        self.queue(key.into(), FieldOp::Remove(vec![item.into()]))
    }

    pub fn add_relation(
        &mut self,
        key: impl Into<String>,
        targets: &[Pointer],
    ) -> Result<&mut Self, NimbusError> {
        self.queue(
            key.into(),
            FieldOp::Relation {
                added: targets.to_vec(),
                removed: Vec::new(),
            },
        )
    }

    pub fn remove_relation(
        &mut self,
        key: impl Into<String>,
        targets: &[Pointer],
    ) -> Result<&mut Self, NimbusError> {
        self.queue(
            key.into(),
            FieldOp::Relation {
                added: Vec::new(),
                removed: targets.to_vec(),
            },
        )
    }

    /// The relation stored under `key`, for querying its members.
    pub fn relation(&self, key: &str) -> Result<Relation, NimbusError> {
        let parent = self.pointer().ok_or_else(|| {
            NimbusError::invalid(
                ErrorCode::MissingObjectId,
                "relations can only be queried on saved records",
            )
        })?;

        let declared = self
            .attributes
            .get(key)
            .and_then(|v| v.get("className"))
            .and_then(Value::as_str)
            .map(str::to_string);
        let from_pending = match self.pending.get(key) {
            Some(FieldOp::Relation { added, removed }) => added
                .first()
                .or(removed.first())
                .map(|p| p.class_name.clone()),
            _ => None,
        };

        Ok(Relation::new(parent, key, declared.or(from_pending)))
    }

    pub fn acl(&self) -> Option<&Acl> {
        self.acl.as_ref()
    }

    pub fn set_acl(&mut self, acl: Acl) -> &mut Self {
        self.acl = Some(acl);
        self.acl_dirty = true;
        self
    }

    pub fn dirty(&self, key: &str) -> bool {
        self.pending.contains_key(key)
    }

    /// Whether anything needs saving.
    pub fn is_dirty(&self) -> bool {
        self.id.is_none() || !self.pending.is_empty() || self.acl_dirty
    }

    pub fn dirty_keys(&self) -> Vec<&str> {
        self.pending.keys().map(String::as_str).collect()
    }

    pub fn pending_op(&self, key: &str) -> Option<&FieldOp> {
        self.pending.get(key)
    }

    /// Discard unsaved changes.
    pub fn revert(&mut self) {
        self.attributes = self.server_data.clone();
        self.pending.clear();
        self.acl_dirty = false;
    }

    /// Drop a field locally without queuing a server change.
    pub(crate) fn forget(&mut self, key: &str) {
        self.attributes.remove(key);
        self.server_data.remove(key);
        self.pending.remove(key);
    }

    /// Full JSON representation, as the server would return it.
    pub fn to_json(&self) -> Value {
        let mut map = self.attributes.clone();
        map.insert("className".to_string(), Value::from(self.class_name()));
        if let Some(id) = &self.id {
            map.insert("objectId".to_string(), Value::from(id.as_str()));
        }
        if let Some(at) = self.created_at {
            map.insert("createdAt".to_string(), Value::from(at.to_rfc3339()));
        }
        if let Some(at) = self.updated_at {
            map.insert("updatedAt".to_string(), Value::from(at.to_rfc3339()));
        }
        if let Some(acl) = &self.acl {
            map.insert(
                "ACL".to_string(),
                serde_json::to_value(acl).unwrap_or(Value::Null),
            );
        }
        Value::Object(map)
    }

    /// Request body carrying the pending changes.
    pub(crate) fn save_body(&self) -> Map<String, Value> {
        let mut body = encode_ops(self.pending.iter());
        if self.acl_dirty {
            if let Some(acl) = &self.acl {
                body.insert(
                    "ACL".to_string(),
                    serde_json::to_value(acl).unwrap_or(Value::Null),
                );
            }
        }
        body
    }

    /// Fold a save response into the record and mark everything clean.
    pub(crate) fn commit_save(
        &mut self,
        mut response: Map<String, Value>,
    ) -> Result<(), NimbusError> {
        let created = self.id.is_none();
        if created {
            match response.remove("objectId") {
                Some(Value::String(id)) => self.id = Some(id),
                _ => {
                    return Err(NimbusError::InvalidResponse(
                        "create response is missing objectId".to_string(),
                    ));
                }
            }
        }
        if let Some(at) = response.remove("createdAt").as_ref().and_then(parse_date) {
            self.created_at = Some(at);
            if created {
                self.updated_at = Some(at);
            }
        }
        if let Some(at) = response.remove("updatedAt").as_ref().and_then(parse_date) {
            self.updated_at = Some(at);
        }

        // Anything else the server echoes back (e.g. a session token) is data.
        for (key, value) in response {
            if !RESERVED_KEYS.contains(&key.as_str()) {
                self.attributes.insert(key, value);
            }
        }

        self.server_data = self.attributes.clone();
        self.pending.clear();
        self.acl_dirty = false;
        self.existed = !created;
        self.data_available = true;
        Ok(())
    }

    /// Replace server data with a fetched copy, keeping unsaved changes on top.
    pub(crate) fn commit_fetch(&mut self, fetched: Record) {
        self.created_at = fetched.created_at.or(self.created_at);
        self.updated_at = fetched.updated_at.or(self.updated_at);
        if !self.acl_dirty {
            self.acl = fetched.acl;
        }
        self.server_data = fetched.server_data;

        let mut attributes = self.server_data.clone();
        for (key, op) in &self.pending {
            match op.apply(attributes.get(key)) {
                Some(value) => {
                    attributes.insert(key.clone(), value);
                }
                None => {
                    attributes.remove(key);
                }
            }
        }
        self.attributes = attributes;
        self.existed = true;
        self.data_available = true;
    }
}

pub(crate) fn escape_html(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#x27;"),
            '/' => escaped.push_str("&#x2F;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
