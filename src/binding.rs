//! Live query binding.
//!
//! A [`LiveQuery`] keeps one live connection for its current descriptor and
//! mirrors what the store pushes: the latest full snapshot, a loading flag
//! and an error slot.
//!
//! Rebinding is an explicit transition. A new descriptor that normalizes to
//! the current one is a no-op; anything else releases the old connection
//! before the new one is opened. Each connection's callbacks carry the
//! generation they were opened under, and anything arriving for an older
//! generation is dropped.
//!
//! # Example
//!
//! ```ignore
//! let projects = LiveQuery::new(store.clone());
//! projects.bind(Some(Descriptor::query(
//!     Query::collection("projects")?.filter(Filter::array_contains("tags", "AI/ML")),
//! )));
//!
//! if !projects.is_loading() {
//!     for doc in projects.data().iter().flat_map(|s| s.documents()) {
//!         println!("{}", doc.id());
//!     }
//! }
//! ```

use crate::error::{Result, StoreFailure};
use crate::store::{DocumentStore, ErrorCallback, ListenerRegistration, SnapshotCallback};
use crate::types::{Descriptor, Snapshot};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

/// What a binding currently exposes.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BindingState {
    /// Latest snapshot for the current descriptor.
    pub data: Option<Snapshot>,
    /// True from bind until the first snapshot or error.
    pub loading: bool,
    pub error: Option<StoreFailure>,
}

/// Called after each snapshot or error is applied.
pub type BindingObserver = Arc<dyn Fn(&BindingState) + Send + Sync>;

struct Binding {
    descriptor: Option<Descriptor>,
    /// Bumped on every rebind; callbacks from older generations are stale.
    generation: u64,
    registration: Option<ListenerRegistration>,
    state: BindingState,
}

/// A view's subscription to one document or query.
pub struct LiveQuery<S: DocumentStore + ?Sized> {
    store: Arc<S>,
    shared: Arc<Mutex<Binding>>,
    observer: Option<BindingObserver>,
}

impl<S: DocumentStore + ?Sized> LiveQuery<S> {
    /// Create an inactive binding.
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            shared: Arc::new(Mutex::new(Binding {
                descriptor: None,
                generation: 0,
                registration: None,
                state: BindingState::default(),
            })),
            observer: None,
        }
    }

    /// Create an inactive binding that reports every applied update.
    pub fn with_observer(store: Arc<S>, observer: BindingObserver) -> Self {
        let mut query = Self::new(store);
        query.observer = Some(observer);
        query
    }

    /// Point the binding at `descriptor`, or deactivate it with `None`.
    ///
    /// Returns false when the descriptor is semantically unchanged.
    pub fn bind(&self, descriptor: Option<Descriptor>) -> bool {
        self.rebind(descriptor, false)
    }

    /// Deactivate the binding, releasing its connection.
    pub fn unbind(&self) -> bool {
        self.bind(None)
    }

    /// Reopen the connection for the current descriptor, e.g. after an error.
    pub fn refresh(&self) -> bool {
        let current = self.descriptor();
        current.is_some() && self.rebind(current, true)
    }

    fn rebind(&self, descriptor: Option<Descriptor>, force: bool) -> bool {
        let (previous, generation) = {
            let mut binding = self.shared.lock();
            if !force && binding.descriptor == descriptor {
                return false;
            }
            binding.generation += 1;
            binding.descriptor = descriptor.clone();
            binding.state = BindingState {
                data: None,
                loading: descriptor.is_some(),
                error: None,
            };
            (binding.registration.take(), binding.generation)
        };

        // Old connection goes first so two are never open at once
        if let Some(previous) = previous {
            previous.release();
            debug!(generation, "Released superseded connection");
        }

        let Some(descriptor) = descriptor else {
            return true;
        };

        debug!(generation, path = %descriptor.path(), "Opening live connection");
        let registration = self.store.subscribe(
            &descriptor,
            self.snapshot_handler(generation),
            self.error_handler(generation),
        );

        let mut binding = self.shared.lock();
        if binding.generation == generation && binding.state.error.is_none() {
            binding.registration = Some(registration);
        } else {
            // Superseded or failed while subscribing
            drop(binding);
            registration.release();
        }

        true
    }

    fn snapshot_handler(&self, generation: u64) -> SnapshotCallback {
        let shared = Arc::downgrade(&self.shared);
        let observer = self.observer.clone();

        Arc::new(move |snapshot: Snapshot| {
            let Some((view, _)) = apply(&shared, generation, |state| {
                state.data = Some(snapshot);
                state.loading = false;
                state.error = None;
            }) else {
                return;
            };
            if let Some(observer) = &observer {
                observer(&view);
            }
        })
    }

    fn error_handler(&self, generation: u64) -> ErrorCallback {
        let shared = Arc::downgrade(&self.shared);
        let observer = self.observer.clone();

        Arc::new(move |failure: StoreFailure| {
            debug!(generation, code = %failure.code, "Live connection failed");
            let Some((view, registration)) = apply(&shared, generation, |state| {
                state.loading = false;
                state.error = Some(failure);
            }) else {
                return;
            };
            // No automatic retry: the connection stays closed until rebind
            if let Some(registration) = registration {
                registration.release();
            }
            if let Some(observer) = &observer {
                observer(&view);
            }
        })
    }

    pub fn state(&self) -> BindingState {
        self.shared.lock().state.clone()
    }

    pub fn data(&self) -> Option<Snapshot> {
        self.shared.lock().state.data.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.lock().state.loading
    }

    pub fn error(&self) -> Option<StoreFailure> {
        self.shared.lock().state.error.clone()
    }

    pub fn descriptor(&self) -> Option<Descriptor> {
        self.shared.lock().descriptor.clone()
    }

    /// Whether a live connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.shared.lock().registration.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.shared.lock().generation
    }

    /// Decode the current documents; empty while loading or inactive.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        match self.data() {
            Some(snapshot) => snapshot.decode(),
            None => Ok(Vec::new()),
        }
    }
}

impl<S: DocumentStore + ?Sized> Drop for LiveQuery<S> {
    fn drop(&mut self) {
        let registration = {
            let mut binding = self.shared.lock();
            binding.generation += 1;
            binding.registration.take()
        };
        if let Some(registration) = registration {
            registration.release();
        }
    }
}

/// Apply `update` if `generation` is still current. Hands back the new state
/// and, after an error, the connection to release outside the lock.
fn apply(
    shared: &Weak<Mutex<Binding>>,
    generation: u64,
    update: impl FnOnce(&mut BindingState),
) -> Option<(BindingState, Option<ListenerRegistration>)> {
    let shared = shared.upgrade()?;
    let mut binding = shared.lock();

    if binding.generation != generation {
        trace!(
            generation,
            current = binding.generation,
            "Discarding delivery from superseded connection"
        );
        return None;
    }

    update(&mut binding.state);
    let registration = if binding.state.error.is_some() {
        binding.registration.take()
    } else {
        None
    };
    Some((binding.state.clone(), registration))
}
