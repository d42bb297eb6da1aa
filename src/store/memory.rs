//! In-memory document store with live listeners.

use super::transforms::apply_payload;
use super::{
    AuthProvider, DocumentStore, ErrorCallback, ListenerRegistration, SnapshotCallback,
};
use crate::error::{FailureCode, StoreFailure};
use crate::types::{
    Descriptor, Direction, Document, DocumentPath, Filter, FilterOp, OperationKind, PrincipalId,
    Query, Snapshot, Timestamp, WritePayload, WriteRequest, WriteResult,
};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// What an access rule is asked to decide.
#[derive(Debug)]
pub struct AccessRequest<'a> {
    pub principal: Option<&'a str>,
    pub path: &'a DocumentPath,
    pub operation: OperationKind,
    /// Stored document before the operation, if any.
    pub existing: Option<&'a Document>,
    /// Document as it would look after a create/update.
    pub incoming: Option<&'a Document>,
}

/// Returns true to allow the request.
pub type AccessRule = Arc<dyn Fn(&AccessRequest<'_>) -> bool + Send + Sync>;

/// When listener callbacks run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Callbacks run before `write`/`subscribe` returns.
    #[default]
    Immediate,
    /// Callbacks are queued and run by [`MemoryStore::flush`].
    Deferred,
}

/// Internal listener state.
struct Listener {
    descriptor: Descriptor,
    on_snapshot: SnapshotCallback,
    /// Last snapshot handed out; unchanged results are not redelivered.
    last: Option<Snapshot>,
}

impl Listener {
    /// Check if a change at `path` can affect this listener's result.
    fn is_affected_by(&self, path: &DocumentPath) -> bool {
        match &self.descriptor {
            Descriptor::Document { path: watched } => watched == path,
            Descriptor::Query(query) => path.parent().as_ref() == Some(&query.collection),
        }
    }
}

enum Delivery {
    Snapshot(SnapshotCallback, Snapshot),
    Error(ErrorCallback, StoreFailure),
}

impl Delivery {
    fn deliver(self) {
        match self {
            Delivery::Snapshot(callback, snapshot) => callback(snapshot),
            Delivery::Error(callback, failure) => callback(failure),
        }
    }
}

type Listeners = Arc<RwLock<HashMap<u64, Listener>>>;

/// Document store held entirely in memory.
///
/// Documents are kept ordered by path, so unordered queries return documents
/// in id order. Access rules, when set, are consulted for every listen and
/// write; the principal comes from the attached [`AuthProvider`].
pub struct MemoryStore {
    documents: RwLock<BTreeMap<DocumentPath, Document>>,
    listeners: Listeners,
    next_listener_id: AtomicU64,
    next_auto_id: AtomicU64,
    rules: RwLock<Option<AccessRule>>,
    auth: Option<Arc<dyn AuthProvider>>,
    mode: DeliveryMode,
    queue_tx: Sender<Delivery>,
    queue_rx: Receiver<Delivery>,
    /// Failures returned by the next writes, oldest first.
    injected: Mutex<VecDeque<StoreFailure>>,
    /// Every write request received, accepted or not.
    write_log: Mutex<Vec<WriteRequest>>,
    /// Serializes mutations with listener bookkeeping.
    write_lock: Mutex<()>,
}

impl MemoryStore {
    /// Create an empty store that allows everything.
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = unbounded();
        Self {
            documents: RwLock::new(BTreeMap::new()),
            listeners: Arc::new(RwLock::new(HashMap::new())),
            next_listener_id: AtomicU64::new(1),
            next_auto_id: AtomicU64::new(1),
            rules: RwLock::new(None),
            auth: None,
            mode: DeliveryMode::Immediate,
            queue_tx,
            queue_rx,
            injected: Mutex::new(VecDeque::new()),
            write_log: Mutex::new(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Resolve principals for rule checks from `auth`.
    pub fn with_auth(mut self, auth: Arc<dyn AuthProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub fn with_rules(self, rule: AccessRule) -> Self {
        *self.rules.write() = Some(rule);
        self
    }

    pub fn with_delivery(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }

    /// Replace the access rule (`None` allows everything).
    pub fn set_rules(&self, rule: Option<AccessRule>) {
        *self.rules.write() = rule;
    }

    /// Make the next write (or commit) fail with `failure`.
    pub fn inject_failure(&self, failure: StoreFailure) {
        self.injected.lock().push_back(failure);
    }

    /// Seed a document, bypassing access rules. Listeners are notified.
    pub fn insert(&self, path: &DocumentPath, value: Value) {
        let document = Document::from_json(path.clone(), value);
        let deliveries = {
            let _guard = self.write_lock.lock();
            let mut docs = self.documents.write();
            docs.insert(path.clone(), document);
            let deliveries = self.collect_deliveries(&docs, std::slice::from_ref(path));
            drop(docs);
            self.route(deliveries)
        };
        deliver_all(deliveries);
    }

    pub fn get(&self, path: &DocumentPath) -> Option<Document> {
        self.documents.read().get(path).cloned()
    }

    pub fn document_count(&self) -> usize {
        self.documents.read().len()
    }

    /// Number of live listeners currently registered.
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// All write requests received so far, including rejected ones.
    pub fn writes(&self) -> Vec<WriteRequest> {
        self.write_log.lock().clone()
    }

    pub fn write_count(&self) -> usize {
        self.write_log.lock().len()
    }

    /// Deliveries queued in deferred mode.
    pub fn pending_deliveries(&self) -> usize {
        self.queue_rx.len()
    }

    /// Run queued deliveries in order. Returns how many ran.
    pub fn flush(&self) -> usize {
        let mut delivered = 0;
        while let Ok(delivery) = self.queue_rx.try_recv() {
            delivery.deliver();
            delivered += 1;
        }
        trace!(delivered, "Flushed deferred deliveries");
        delivered
    }

    fn principal(&self) -> Option<PrincipalId> {
        self.auth.as_ref().and_then(|auth| auth.current_principal_id())
    }

    fn check(
        &self,
        principal: Option<&str>,
        path: &DocumentPath,
        operation: OperationKind,
        existing: Option<&Document>,
        incoming: Option<&Document>,
    ) -> Result<(), StoreFailure> {
        let rule = self.rules.read().clone();
        let Some(rule) = rule else {
            return Ok(());
        };

        let request = AccessRequest {
            principal,
            path,
            operation,
            existing,
            incoming,
        };
        if rule(&request) {
            Ok(())
        } else {
            debug!(path = %path, operation = %operation, "Access rule denied request");
            Err(StoreFailure::permission_denied(path))
        }
    }

    fn apply_write(
        &self,
        docs: &mut BTreeMap<DocumentPath, Document>,
        request: &WriteRequest,
        principal: Option<&str>,
    ) -> Result<WriteResult, StoreFailure> {
        let now = Timestamp::now();

        match request.kind {
            OperationKind::Create => {
                let payload = require_payload(request)?;
                let path = if request.path.is_collection() {
                    let n = self.next_auto_id.fetch_add(1, Ordering::SeqCst);
                    request.path.join(&format!("auto-{n:06}")).map_err(|e| {
                        StoreFailure::new(FailureCode::InvalidArgument, e.to_string())
                    })?
                } else {
                    request.path.clone()
                };

                let incoming = Document::new(path.clone(), apply_payload(None, payload, now)?);
                self.check(principal, &path, OperationKind::Create, None, Some(&incoming))?;

                if docs.contains_key(&path) {
                    return Err(StoreFailure::new(
                        FailureCode::AlreadyExists,
                        format!("document {path} already exists"),
                    )
                    .at(&path));
                }

                docs.insert(path.clone(), incoming.clone());
                Ok(WriteResult {
                    path,
                    document: Some(incoming),
                })
            }

            OperationKind::Update => {
                let path = require_document_path(request)?;
                let payload = require_payload(request)?;
                let existing = docs.get(path);
                let fields = apply_payload(existing.map(|doc| &doc.fields), payload, now)?;
                let incoming = Document::new(path.clone(), fields);
                self.check(principal, path, OperationKind::Update, existing, Some(&incoming))?;

                if existing.is_none() {
                    return Err(StoreFailure::new(
                        FailureCode::NotFound,
                        format!("no document to update: {path}"),
                    )
                    .at(path));
                }

                docs.insert(path.clone(), incoming.clone());
                Ok(WriteResult {
                    path: path.clone(),
                    document: Some(incoming),
                })
            }

            OperationKind::Delete => {
                let path = require_document_path(request)?;
                self.check(principal, path, OperationKind::Delete, docs.get(path), None)?;
                docs.remove(path);
                Ok(WriteResult {
                    path: path.clone(),
                    document: None,
                })
            }

            OperationKind::Read | OperationKind::List => Err(StoreFailure::new(
                FailureCode::InvalidArgument,
                format!("{} is not a write", request.kind),
            )
            .at(&request.path)),
        }
    }

    /// Recompute results for listeners touched by `changed`.
    fn collect_deliveries(
        &self,
        docs: &BTreeMap<DocumentPath, Document>,
        changed: &[DocumentPath],
    ) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        let mut listeners = self.listeners.write();

        for (id, listener) in listeners.iter_mut() {
            if !changed.iter().any(|path| listener.is_affected_by(path)) {
                continue;
            }
            let snapshot = evaluate(&listener.descriptor, docs);
            if listener.last.as_ref() == Some(&snapshot) {
                continue;
            }
            trace!(listener = id, "Snapshot changed");
            listener.last = Some(snapshot.clone());
            deliveries.push(Delivery::Snapshot(Arc::clone(&listener.on_snapshot), snapshot));
        }

        deliveries
    }

    /// Queue deliveries in deferred mode; hand them back otherwise.
    fn route(&self, deliveries: Vec<Delivery>) -> Vec<Delivery> {
        match self.mode {
            DeliveryMode::Immediate => deliveries,
            DeliveryMode::Deferred => {
                for delivery in deliveries {
                    // Receiver lives as long as self
                    let _ = self.queue_tx.send(delivery);
                }
                Vec::new()
            }
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DocumentStore for MemoryStore {
    fn subscribe(
        &self,
        descriptor: &Descriptor,
        on_snapshot: SnapshotCallback,
        on_error: ErrorCallback,
    ) -> ListenerRegistration {
        let principal = self.principal();
        let id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);

        let deliveries = {
            let _guard = self.write_lock.lock();
            let docs = self.documents.read();

            let existing = match descriptor {
                Descriptor::Document { path } => docs.get(path),
                Descriptor::Query(_) => None,
            };
            if let Err(failure) = self.check(
                principal.as_deref(),
                descriptor.path(),
                descriptor.read_kind(),
                existing,
                None,
            ) {
                drop(docs);
                let deliveries = self.route(vec![Delivery::Error(on_error, failure)]);
                drop(_guard);
                deliver_all(deliveries);
                return ListenerRegistration::noop();
            }

            let snapshot = evaluate(descriptor, &docs);
            self.listeners.write().insert(
                id,
                Listener {
                    descriptor: descriptor.clone(),
                    on_snapshot: Arc::clone(&on_snapshot),
                    last: Some(snapshot.clone()),
                },
            );
            debug!(listener = id, path = %descriptor.path(), "Listener registered");
            drop(docs);
            self.route(vec![Delivery::Snapshot(on_snapshot, snapshot)])
        };
        deliver_all(deliveries);

        let listeners = Arc::downgrade(&self.listeners);
        ListenerRegistration::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                if listeners.write().remove(&id).is_some() {
                    debug!(listener = id, "Listener released");
                }
            }
        })
    }

    fn write(&self, request: &WriteRequest) -> Result<WriteResult, StoreFailure> {
        self.write_log.lock().push(request.clone());
        if let Some(failure) = self.injected.lock().pop_front() {
            debug!(path = %request.path, code = %failure.code, "Returning injected failure");
            return Err(failure);
        }

        let principal = self.principal();
        let (result, deliveries) = {
            let _guard = self.write_lock.lock();
            let mut docs = self.documents.write();
            let result = self.apply_write(&mut docs, request, principal.as_deref())?;
            let deliveries = self.collect_deliveries(&docs, std::slice::from_ref(&result.path));
            drop(docs);
            (result, self.route(deliveries))
        };
        deliver_all(deliveries);

        Ok(result)
    }

    fn commit(&self, requests: &[WriteRequest]) -> Result<Vec<WriteResult>, StoreFailure> {
        self.write_log.lock().extend(requests.iter().cloned());
        if let Some(failure) = self.injected.lock().pop_front() {
            debug!(writes = requests.len(), code = %failure.code, "Returning injected failure");
            return Err(failure);
        }

        let principal = self.principal();
        let (results, deliveries) = {
            let _guard = self.write_lock.lock();
            let mut docs = self.documents.write();

            // Stage against a copy so a failing write leaves nothing behind
            let mut staged = docs.clone();
            let mut results = Vec::with_capacity(requests.len());
            for request in requests {
                results.push(self.apply_write(&mut staged, request, principal.as_deref())?);
            }
            *docs = staged;

            let changed: Vec<DocumentPath> = results.iter().map(|r| r.path.clone()).collect();
            let deliveries = self.collect_deliveries(&docs, &changed);
            drop(docs);
            (results, self.route(deliveries))
        };
        deliver_all(deliveries);

        Ok(results)
    }
}

fn deliver_all(deliveries: Vec<Delivery>) {
    for delivery in deliveries {
        delivery.deliver();
    }
}

fn require_payload(request: &WriteRequest) -> Result<&WritePayload, StoreFailure> {
    request.payload.as_ref().ok_or_else(|| {
        StoreFailure::new(
            FailureCode::InvalidArgument,
            format!("{} requires a payload", request.kind),
        )
        .at(&request.path)
    })
}

fn require_document_path(request: &WriteRequest) -> Result<&DocumentPath, StoreFailure> {
    if request.path.is_document() {
        Ok(&request.path)
    } else {
        Err(StoreFailure::new(
            FailureCode::InvalidArgument,
            format!("{} needs a document path, got {}", request.kind, request.path),
        )
        .at(&request.path))
    }
}

// --- Query Evaluation ---

fn evaluate(descriptor: &Descriptor, docs: &BTreeMap<DocumentPath, Document>) -> Snapshot {
    match descriptor {
        Descriptor::Document { path } => Snapshot::Document {
            path: path.clone(),
            document: docs.get(path).cloned(),
        },
        Descriptor::Query(query) => Snapshot::Query {
            documents: run_query(query, docs),
        },
    }
}

fn run_query(query: &Query, docs: &BTreeMap<DocumentPath, Document>) -> Vec<Document> {
    let mut matched: Vec<Document> = docs
        .values()
        .filter(|doc| doc.path.parent().as_ref() == Some(&query.collection))
        .filter(|doc| query.filters.iter().all(|f| matches_filter(f, doc)))
        // Ordering on a field excludes documents that lack it
        .filter(|doc| query.order_by.iter().all(|o| doc.get(&o.field).is_some()))
        .cloned()
        .collect();

    if !query.order_by.is_empty() {
        // Stable: ties keep path order
        matched.sort_by(|a, b| {
            for order in &query.order_by {
                let ord = match (a.get(&order.field), b.get(&order.field)) {
                    (Some(x), Some(y)) => compare_values(x, y),
                    _ => CmpOrdering::Equal,
                };
                let ord = match order.direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                };
                if ord != CmpOrdering::Equal {
                    return ord;
                }
            }
            CmpOrdering::Equal
        });
    }

    if let Some(limit) = query.limit {
        matched.truncate(limit);
    }

    matched
}

fn matches_filter(filter: &Filter, doc: &Document) -> bool {
    let field = doc.get(&filter.field);

    match filter.op {
        FilterOp::Eq => field == Some(&filter.value),
        FilterOp::NotEq => field.is_some_and(|v| v != &filter.value),
        FilterOp::Lt => ordered(field, &filter.value, |o| o == CmpOrdering::Less),
        FilterOp::Le => ordered(field, &filter.value, |o| o != CmpOrdering::Greater),
        FilterOp::Gt => ordered(field, &filter.value, |o| o == CmpOrdering::Greater),
        FilterOp::Ge => ordered(field, &filter.value, |o| o != CmpOrdering::Less),
        FilterOp::ArrayContains => field
            .and_then(Value::as_array)
            .is_some_and(|arr| arr.contains(&filter.value)),
        FilterOp::ArrayContainsAny => match (field.and_then(Value::as_array), filter.value.as_array()) {
            (Some(arr), Some(candidates)) => candidates.iter().any(|c| arr.contains(c)),
            _ => false,
        },
        FilterOp::In => filter
            .value
            .as_array()
            .is_some_and(|candidates| field.is_some_and(|v| candidates.contains(v))),
    }
}

/// Range comparisons only match values of the same type.
fn ordered(field: Option<&Value>, value: &Value, accept: impl Fn(CmpOrdering) -> bool) -> bool {
    match field {
        Some(v) if type_rank(v) == type_rank(value) => accept(compare_values(v, value)),
        _ => false,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

fn compare_values(a: &Value, b: &Value) -> CmpOrdering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or_default();
            let y = y.as_f64().unwrap_or_default();
            x.partial_cmp(&y).unwrap_or(CmpOrdering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (l, r) in x.iter().zip(y) {
                let ord = compare_values(l, r);
                if ord != CmpOrdering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}
