//! Core types for the sync layer.

use crate::error::{Result, SyncError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity of an authenticated user, independent of their profile document.
pub type PrincipalId = String;

/// Slash-separated location in the document store.
///
/// An even number of segments names a document (`users/u1`), an odd number
/// names a collection (`posts/p1/comments`).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentPath(String);

impl DocumentPath {
    /// Parse and normalize a path. Leading/trailing slashes are ignored.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim().trim_matches('/');
        if trimmed.is_empty() {
            return Err(SyncError::InvalidPath("empty path".to_string()));
        }
        if trimmed.split('/').any(|segment| segment.trim().is_empty()) {
            return Err(SyncError::InvalidPath(format!("empty segment in {raw:?}")));
        }
        Ok(DocumentPath(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    pub fn is_document(&self) -> bool {
        self.segments().count() % 2 == 0
    }

    pub fn is_collection(&self) -> bool {
        !self.is_document()
    }

    /// Last segment: the document id, or the collection name.
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Enclosing path, `None` for a root collection.
    pub fn parent(&self) -> Option<DocumentPath> {
        self.0
            .rsplit_once('/')
            .map(|(parent, _)| DocumentPath(parent.to_string()))
    }

    /// Append one or more segments.
    pub fn join(&self, segment: &str) -> Result<DocumentPath> {
        DocumentPath::parse(&format!("{}/{}", self.0, segment))
    }
}

impl TryFrom<String> for DocumentPath {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self> {
        DocumentPath::parse(&value)
    }
}

impl From<DocumentPath> for String {
    fn from(path: DocumentPath) -> Self {
        path.0
    }
}

impl fmt::Debug for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocumentPath({})", self.0)
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Milliseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or_default();
        Timestamp(millis)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A stored document: identity plus an opaque field map.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub path: DocumentPath,
    pub fields: Map<String, Value>,
}

impl Document {
    pub fn new(path: DocumentPath, fields: Map<String, Value>) -> Self {
        Self { path, fields }
    }

    /// Build from a JSON object. Non-object values yield an empty document.
    pub fn from_json(path: DocumentPath, value: Value) -> Self {
        let fields = match value {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { path, fields }
    }

    pub fn id(&self) -> &str {
        self.path.id()
    }

    /// Field lookup; dotted names reach into nested maps (`stats.points`).
    pub fn get(&self, field: &str) -> Option<&Value> {
        let mut parts = field.split('.');
        let first = parts.next()?;
        let mut current = self.fields.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    pub fn get_f64(&self, field: &str) -> Option<f64> {
        self.get(field).and_then(Value::as_f64)
    }

    /// Decode into a typed record. The document id is exposed as `id` unless
    /// the payload already carries one.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        let mut fields = self.fields.clone();
        fields
            .entry("id".to_string())
            .or_insert_with(|| Value::String(self.id().to_string()));
        Ok(serde_json::from_value(Value::Object(fields))?)
    }
}

/// Kind of access attempted against a path.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Read,
    List,
    Create,
    Update,
    Delete,
}

impl OperationKind {
    pub fn is_write(self) -> bool {
        matches!(
            self,
            OperationKind::Create | OperationKind::Update | OperationKind::Delete
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Read => "read",
            OperationKind::List => "list",
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Comparison used by a query filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilterOp {
    Eq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    ArrayContains,
    ArrayContainsAny,
    In,
}

impl fmt::Display for FilterOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FilterOp::Eq => "==",
            FilterOp::NotEq => "!=",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
            FilterOp::ArrayContains => "array-contains",
            FilterOp::ArrayContainsAny => "array-contains-any",
            FilterOp::In => "in",
        };
        f.write_str(s)
    }
}

/// One `where` clause of a query.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::Eq, value)
    }

    pub fn array_contains(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOp::ArrayContains, value)
    }

    fn canonical(&self) -> String {
        // serde_json maps are key-sorted, so this is stable for equal values
        format!("{} {} {}", self.field, self.op, self.value)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// A filtered, ordered read over one collection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Query {
    pub collection: DocumentPath,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub order_by: Vec<OrderBy>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl Query {
    pub fn new(collection: DocumentPath) -> Self {
        Self {
            collection,
            filters: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    /// Query over a collection path given as a string.
    pub fn collection(path: &str) -> Result<Self> {
        let collection = DocumentPath::parse(path)?;
        if !collection.is_collection() {
            return Err(SyncError::InvalidPath(format!(
                "{collection} is a document, not a collection"
            )));
        }
        Ok(Self::new(collection))
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by.push(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// What a live binding subscribes to.
///
/// Two descriptors are equal when their normalized content is equal: filter
/// order does not matter, duplicate filters collapse.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Descriptor {
    Document { path: DocumentPath },
    Query(Query),
}

impl Descriptor {
    pub fn document(path: DocumentPath) -> Self {
        Descriptor::Document { path }
    }

    pub fn query(query: Query) -> Self {
        Descriptor::Query(query)
    }

    /// Same descriptor with filters in canonical order and duplicates removed.
    pub fn normalized(&self) -> Descriptor {
        match self {
            Descriptor::Document { path } => Descriptor::Document { path: path.clone() },
            Descriptor::Query(query) => {
                let mut filters = query.filters.clone();
                filters.sort_by_cached_key(Filter::canonical);
                filters.dedup();
                Descriptor::Query(Query {
                    collection: query.collection.clone(),
                    filters,
                    order_by: query.order_by.clone(),
                    limit: query.limit,
                })
            }
        }
    }

    /// Canonical key; equal keys mean semantically equal descriptors.
    pub fn key(&self) -> String {
        match self.normalized() {
            Descriptor::Document { path } => format!("doc:{path}"),
            Descriptor::Query(query) => {
                let filters: Vec<String> = query.filters.iter().map(Filter::canonical).collect();
                let order: Vec<String> = query
                    .order_by
                    .iter()
                    .map(|o| format!("{} {:?}", o.field, o.direction))
                    .collect();
                format!(
                    "query:{}|where:{}|order:{}|limit:{:?}",
                    query.collection,
                    filters.join(","),
                    order.join(","),
                    query.limit
                )
            }
        }
    }

    /// Operation kind a read through this descriptor is checked as.
    pub fn read_kind(&self) -> OperationKind {
        match self {
            Descriptor::Document { .. } => OperationKind::Read,
            Descriptor::Query(_) => OperationKind::List,
        }
    }

    /// Path reported for access checks and diagnostics.
    pub fn path(&self) -> &DocumentPath {
        match self {
            Descriptor::Document { path } => path,
            Descriptor::Query(query) => &query.collection,
        }
    }
}

impl PartialEq for Descriptor {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Descriptor {}

/// Value written to one field.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldValue {
    /// Plain replacement.
    Value(Value),
    /// Add elements not already present.
    ArrayUnion(Vec<Value>),
    /// Remove every occurrence of the elements.
    ArrayRemove(Vec<Value>),
    /// Add to a numeric field (missing counts as zero).
    Increment(i64),
    /// Store-assigned write time.
    ServerTimestamp,
    /// Remove the field.
    Delete,
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        FieldValue::Value(value)
    }
}

/// Field-level write payload.
pub type WritePayload = BTreeMap<String, FieldValue>;

/// Payload of plain values from a JSON object.
pub fn payload_from_json(value: Value) -> Result<WritePayload> {
    match value {
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(k, v)| (k, FieldValue::Value(v)))
            .collect()),
        other => Err(SyncError::Validation(format!(
            "payload must be a JSON object, got {other}"
        ))),
    }
}

/// One write handed to the store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WriteRequest {
    /// Document path, or collection path for creates with a store-assigned id.
    pub path: DocumentPath,
    pub kind: OperationKind,
    #[serde(default)]
    pub payload: Option<WritePayload>,
}

/// Outcome of an accepted write.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteResult {
    /// Path actually written (the assigned path for auto-id creates).
    pub path: DocumentPath,
    /// Document after the write; `None` for deletes.
    pub document: Option<Document>,
}

/// Full result delivered by a live connection.
#[derive(Clone, Debug, PartialEq)]
pub enum Snapshot {
    Document {
        path: DocumentPath,
        document: Option<Document>,
    },
    Query {
        documents: Vec<Document>,
    },
}

impl Snapshot {
    /// Documents in store order; a missing single document yields nothing.
    pub fn documents(&self) -> &[Document] {
        match self {
            Snapshot::Document { document, .. } => document.as_slice(),
            Snapshot::Query { documents } => documents,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Document> {
        self.documents().iter().find(|doc| doc.id() == id)
    }

    pub fn len(&self) -> usize {
        self.documents().len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents().is_empty()
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        self.documents().iter().map(Document::decode).collect()
    }
}
