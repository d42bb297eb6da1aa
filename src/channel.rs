//! Permission-error channel.
//!
//! A publish/subscribe bus for a single event kind, `permission-error`. Write
//! paths publish a [`PermissionDenial`] when the store rejects them; a
//! listener registered once at startup turns it into developer diagnostics.
//! The channel is a plain value: construct one per application (or per test)
//! and pass it to whoever needs it.

use crate::error::StoreFailure;
use crate::types::{DocumentPath, FieldValue, OperationKind, WritePayload};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, trace, warn};

/// Name of the only event kind carried by the channel.
pub const PERMISSION_ERROR: &str = "permission-error";

/// A write the store refused for lack of permission.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PermissionDenial {
    pub path: DocumentPath,
    pub operation: OperationKind,
    /// The rejected payload, when the write carried one and reporting it is on.
    pub payload: Option<Value>,
    pub message: String,
}

impl PermissionDenial {
    pub fn new(
        path: DocumentPath,
        operation: OperationKind,
        payload: Option<&WritePayload>,
        failure: &StoreFailure,
    ) -> Self {
        Self {
            path,
            operation,
            payload: payload.map(payload_data),
            message: failure.message.clone(),
        }
    }

    /// Request context as the rules engine would have seen it.
    pub fn request_context(&self) -> Value {
        let mut context = json!({
            "path": self.path.as_str(),
            "method": self.operation,
        });
        if let Some(payload) = &self.payload {
            context["request"] = json!({ "resource": { "data": payload } });
        }
        context
    }

    /// Multi-line developer diagnostic.
    pub fn diagnostic(&self) -> String {
        let context = serde_json::to_string_pretty(&self.request_context())
            .unwrap_or_else(|_| self.request_context().to_string());
        format!(
            "{}\nThe following request was denied by security rules:\n{}",
            self.message, context
        )
    }
}

impl fmt::Display for PermissionDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} denied on {}: {}", self.operation, self.path, self.message)
    }
}

/// Payload as document data: plain values unwrapped, transforms kept tagged.
fn payload_data(payload: &WritePayload) -> Value {
    let fields = payload
        .iter()
        .map(|(name, value)| {
            let rendered = match value {
                FieldValue::Value(plain) => plain.clone(),
                transform => serde_json::to_value(transform).unwrap_or(Value::Null),
            };
            (name.clone(), rendered)
        })
        .collect();
    Value::Object(fields)
}

/// Callback receiving published denials.
pub type PermissionListener = Arc<dyn Fn(&PermissionDenial) + Send + Sync>;

/// Identifier returned by [`PermissionErrorChannel::register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Process-wide bus for permission denials.
pub struct PermissionErrorChannel {
    /// Registered listeners in registration order.
    listeners: RwLock<Vec<(ListenerId, PermissionListener)>>,
    next_id: AtomicU64,
    published: AtomicU64,
}

impl PermissionErrorChannel {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            published: AtomicU64::new(0),
        }
    }

    /// Add a listener. The same listener may be registered more than once.
    pub fn register(&self, listener: PermissionListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.listeners.write().push((id, listener));
        trace!(listener = id.0, kind = PERMISSION_ERROR, "Listener registered");
        id
    }

    /// Remove the earliest registration of `listener` (pointer equality).
    ///
    /// Returns false if it was not registered.
    pub fn unregister(&self, listener: &PermissionListener) -> bool {
        let mut listeners = self.listeners.write();
        match listeners.iter().position(|(_, l)| Arc::ptr_eq(l, listener)) {
            Some(index) => {
                listeners.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn unregister_id(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Number of events published so far.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    /// Invoke every listener registered at call time, in registration order.
    ///
    /// Listeners registered or removed during dispatch take effect from the
    /// next publish. A panicking listener is logged and skipped.
    pub fn publish(&self, event: &PermissionDenial) -> usize {
        self.published.fetch_add(1, Ordering::SeqCst);

        let snapshot: Vec<(ListenerId, PermissionListener)> = self
            .listeners
            .read()
            .iter()
            .map(|(id, l)| (*id, Arc::clone(l)))
            .collect();

        for (id, listener) in &snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(
                    listener = id.0,
                    path = %event.path,
                    "Permission-error listener panicked"
                );
            }
        }

        snapshot.len()
    }
}

impl Default for PermissionErrorChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// Listener that logs each denial with its request context.
pub fn logging_listener() -> PermissionListener {
    Arc::new(|event: &PermissionDenial| {
        error!(
            path = %event.path,
            operation = %event.operation,
            "{}",
            event.diagnostic()
        );
    })
}
