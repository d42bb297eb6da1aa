//! Document store and auth boundaries.
//!
//! The sync layer never talks to a database directly. It consumes two
//! capability sets:
//! - [`DocumentStore`]: live subscriptions plus single and batched writes
//! - [`AuthProvider`]: auth-state notifications and the current principal
//!
//! [`MemoryStore`] and [`MemoryAuth`] implement both in-process, with access
//! rules, query evaluation and optional deferred delivery.
//!
//! # Example
//!
//! ```ignore
//! let store = MemoryStore::new();
//! let registration = store.subscribe(
//!     &Descriptor::query(Query::collection("projects")?),
//!     Arc::new(|snapshot| println!("{} projects", snapshot.len())),
//!     Arc::new(|failure| eprintln!("listen failed: {failure}")),
//! );
//!
//! // Later: stop listening
//! registration.release();
//! ```

mod auth;
mod memory;
mod transforms;

pub use auth::MemoryAuth;
pub use memory::{AccessRequest, AccessRule, DeliveryMode, MemoryStore};
pub use transforms::{apply_field_value, apply_payload};

use crate::error::StoreFailure;
use crate::types::{Descriptor, PrincipalId, Snapshot, WriteRequest, WriteResult};
use std::fmt;
use std::sync::Arc;

/// Called with every full snapshot a live connection delivers.
pub type SnapshotCallback = Arc<dyn Fn(Snapshot) + Send + Sync>;

/// Called once when a live connection fails. No snapshots follow.
pub type ErrorCallback = Arc<dyn Fn(StoreFailure) + Send + Sync>;

/// Called with the new principal (or `None`) on every auth-state change.
pub type AuthCallback = Arc<dyn Fn(Option<PrincipalId>) + Send + Sync>;

/// Handle to one live connection or listener.
///
/// Releasing (explicitly or by dropping) stops further callbacks from the
/// source. Releasing twice is a no-op.
pub struct ListenerRegistration {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl ListenerRegistration {
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Registration with nothing to release (e.g. a listen that failed up front).
    pub fn noop() -> Self {
        Self { release: None }
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for ListenerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistration")
            .field("active", &self.release.is_some())
            .finish()
    }
}

/// Remote document database, as seen by the sync layer.
pub trait DocumentStore: Send + Sync {
    /// Open a live connection. Every update replaces the whole snapshot.
    ///
    /// Implementations may deliver synchronously from inside this call, so
    /// callers must not hold locks the callbacks need.
    fn subscribe(
        &self,
        descriptor: &Descriptor,
        on_snapshot: SnapshotCallback,
        on_error: ErrorCallback,
    ) -> ListenerRegistration;

    /// Perform a single write.
    fn write(&self, request: &WriteRequest) -> Result<WriteResult, StoreFailure>;

    /// Perform all writes or none of them.
    fn commit(&self, requests: &[WriteRequest]) -> Result<Vec<WriteResult>, StoreFailure>;
}

/// Authentication provider.
pub trait AuthProvider: Send + Sync {
    /// Register for auth-state changes. The callback fires once right away
    /// with the current principal.
    fn on_auth_state_changed(&self, callback: AuthCallback) -> ListenerRegistration;

    fn current_principal_id(&self) -> Option<PrincipalId>;
}

impl<T: DocumentStore + ?Sized> DocumentStore for Arc<T> {
    fn subscribe(
        &self,
        descriptor: &Descriptor,
        on_snapshot: SnapshotCallback,
        on_error: ErrorCallback,
    ) -> ListenerRegistration {
        (**self).subscribe(descriptor, on_snapshot, on_error)
    }

    fn write(&self, request: &WriteRequest) -> Result<WriteResult, StoreFailure> {
        (**self).write(request)
    }

    fn commit(&self, requests: &[WriteRequest]) -> Result<Vec<WriteResult>, StoreFailure> {
        (**self).commit(requests)
    }
}

impl<T: AuthProvider + ?Sized> AuthProvider for Arc<T> {
    fn on_auth_state_changed(&self, callback: AuthCallback) -> ListenerRegistration {
        (**self).on_auth_state_changed(callback)
    }

    fn current_principal_id(&self) -> Option<PrincipalId> {
        (**self).current_principal_id()
    }
}
