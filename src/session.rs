//! Session and identity resolution.
//!
//! A [`Session`] follows the auth provider and mirrors the signed-in
//! principal's profile document through a [`LiveQuery`] it owns:
//!
//! ```text
//! Uninitialized --start--> Resolving --profile snapshot--> Resolved
//!                              |                              |
//!                              +--no principal / no profile---+--> Anonymous
//! ```
//!
//! A principal whose profile document does not exist is treated as
//! anonymous. If the document appears later the session resolves.

use crate::binding::{BindingObserver, BindingState, LiveQuery};
use crate::config::SyncConfig;
use crate::error::{Result, StoreFailure, SyncError};
use crate::store::{AuthCallback, AuthProvider, DocumentStore, ListenerRegistration};
use crate::types::{Descriptor, Document, DocumentPath, PrincipalId, Snapshot};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Where the session is in resolving its principal.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionState {
    /// Not yet connected to the auth provider.
    Uninitialized,
    /// Waiting for auth state or for the first profile snapshot.
    Resolving { principal: Option<PrincipalId> },
    Resolved {
        principal: PrincipalId,
        profile: Document,
    },
    Anonymous,
}

struct Shared {
    state: SessionState,
    /// Profile document the session currently expects snapshots for.
    profile_path: Option<DocumentPath>,
    last_error: Option<StoreFailure>,
}

/// The current user, resolved from auth state plus their profile document.
pub struct Session<S: DocumentStore + ?Sized> {
    profiles: DocumentPath,
    shared: Arc<Mutex<Shared>>,
    profile: Arc<LiveQuery<S>>,
    auth_registration: Mutex<Option<ListenerRegistration>>,
}

impl<S: DocumentStore + ?Sized + 'static> Session<S> {
    pub fn new(store: Arc<S>, config: &SyncConfig) -> Result<Self> {
        let profiles = DocumentPath::parse(&config.profile_collection)?;
        if !profiles.is_collection() {
            return Err(SyncError::Config(format!(
                "profile collection {profiles} is not a collection"
            )));
        }

        let shared = Arc::new(Mutex::new(Shared {
            state: SessionState::Uninitialized,
            profile_path: None,
            last_error: None,
        }));
        let profile = Arc::new(LiveQuery::with_observer(
            store,
            profile_observer(Arc::downgrade(&shared)),
        ));

        Ok(Self {
            profiles,
            shared,
            profile,
            auth_registration: Mutex::new(None),
        })
    }

    /// Start following `auth`. Restarting replaces the previous registration.
    pub fn start<A: AuthProvider + ?Sized>(&self, auth: &A) {
        if let Some(previous) = self.auth_registration.lock().take() {
            previous.release();
        }
        {
            let mut shared = self.shared.lock();
            shared.state = SessionState::Resolving { principal: None };
            shared.profile_path = None;
            shared.last_error = None;
        }
        // The auth callback rebinds from scratch
        self.profile.unbind();
        debug!("Session resolving");

        let registration = auth.on_auth_state_changed(self.auth_handler());
        *self.auth_registration.lock() = Some(registration);
    }

    /// Stop following auth and release the profile subscription.
    pub fn stop(&self) {
        if let Some(registration) = self.auth_registration.lock().take() {
            registration.release();
        }
        {
            let mut shared = self.shared.lock();
            shared.state = SessionState::Uninitialized;
            shared.profile_path = None;
        }
        self.profile.unbind();
        debug!("Session stopped");
    }

    fn auth_handler(&self) -> AuthCallback {
        let shared = Arc::downgrade(&self.shared);
        let profile = Arc::downgrade(&self.profile);
        let profiles = self.profiles.clone();

        Arc::new(move |principal: Option<PrincipalId>| {
            let (Some(shared), Some(profile)) = (shared.upgrade(), profile.upgrade()) else {
                return;
            };
            on_principal(&shared, &profile, &profiles, principal);
        })
    }

    pub fn state(&self) -> SessionState {
        self.shared.lock().state.clone()
    }

    /// The mirrored profile, when resolved.
    pub fn current_user(&self) -> Option<Document> {
        match &self.shared.lock().state {
            SessionState::Resolved { profile, .. } => Some(profile.clone()),
            _ => None,
        }
    }

    /// Decode the mirrored profile into a typed record.
    pub fn current_profile<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        self.current_user().map(|doc| doc.decode()).transpose()
    }

    /// Principal of a resolved session.
    pub fn principal(&self) -> Option<PrincipalId> {
        match &self.shared.lock().state {
            SessionState::Resolved { principal, .. } => Some(principal.clone()),
            _ => None,
        }
    }

    /// Principal of a resolved session, or [`SyncError::NotSignedIn`].
    pub fn require_principal(&self) -> Result<PrincipalId> {
        self.principal().ok_or(SyncError::NotSignedIn)
    }

    /// Profile document path of a resolved session.
    pub fn profile_path(&self) -> Option<DocumentPath> {
        let principal = self.principal()?;
        self.profiles.join(&principal).ok()
    }

    pub fn is_loading(&self) -> bool {
        matches!(self.shared.lock().state, SessionState::Resolving { .. })
    }

    /// Failure from the last profile read, if it was refused.
    pub fn last_error(&self) -> Option<StoreFailure> {
        self.shared.lock().last_error.clone()
    }

    /// Whether the session currently holds a profile subscription.
    pub fn is_subscribed(&self) -> bool {
        self.profile.is_connected()
    }
}

fn on_principal<S: DocumentStore + ?Sized>(
    shared: &Mutex<Shared>,
    profile: &LiveQuery<S>,
    profiles: &DocumentPath,
    principal: Option<PrincipalId>,
) {
    let Some(principal) = principal else {
        {
            let mut shared = shared.lock();
            shared.state = SessionState::Anonymous;
            shared.profile_path = None;
        }
        profile.unbind();
        debug!("Session anonymous: no principal");
        return;
    };

    if principal.is_empty() || principal.contains('/') {
        warn!(principal = %principal, "Principal is not a single path segment");
        {
            let mut shared = shared.lock();
            shared.state = SessionState::Anonymous;
            shared.profile_path = None;
        }
        profile.unbind();
        return;
    }

    let path = match profiles.join(&principal) {
        Ok(path) => path,
        Err(e) => {
            warn!(principal = %principal, error = %e, "Principal is not a valid document id");
            {
                let mut shared = shared.lock();
                shared.state = SessionState::Anonymous;
                shared.profile_path = None;
            }
            profile.unbind();
            return;
        }
    };

    let retry = {
        let mut shared = shared.lock();
        let same = shared.profile_path.as_ref() == Some(&path);
        if same && shared.last_error.is_none() {
            // Same principal reported again; keep the resolved profile
            return;
        }
        shared.state = SessionState::Resolving {
            principal: Some(principal.clone()),
        };
        shared.profile_path = Some(path.clone());
        shared.last_error = None;
        same
    };

    // May deliver synchronously; state above is already in place
    if retry {
        debug!(principal = %principal, path = %path, "Retrying refused profile read");
        profile.refresh();
    } else {
        debug!(principal = %principal, path = %path, "Resolving profile");
        profile.bind(Some(Descriptor::document(path)));
    }
}

fn profile_observer(shared: Weak<Mutex<Shared>>) -> BindingObserver {
    Arc::new(move |view: &BindingState| {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let mut shared = shared.lock();
        let Some(expected) = shared.profile_path.clone() else {
            return;
        };

        if let Some(failure) = &view.error {
            warn!(path = %expected, code = %failure.code, "Profile read failed; session anonymous");
            shared.state = SessionState::Anonymous;
            shared.last_error = Some(failure.clone());
            return;
        }

        let Some(Snapshot::Document { path, document }) = &view.data else {
            return;
        };
        if *path != expected {
            return;
        }

        shared.state = match document {
            Some(profile) => SessionState::Resolved {
                principal: expected.id().to_string(),
                profile: profile.clone(),
            },
            None => {
                debug!(path = %expected, "Profile document missing; session anonymous");
                SessionState::Anonymous
            }
        };
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureCode;
    use crate::store::{AccessRequest, DeliveryMode, MemoryAuth, MemoryStore};
    use crate::types::OperationKind;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

    fn path(raw: &str) -> DocumentPath {
        DocumentPath::parse(raw).unwrap()
    }

    fn session(store: &Arc<MemoryStore>) -> Session<MemoryStore> {
        Session::new(Arc::clone(store), &SyncConfig::default()).unwrap()
    }

    #[test]
    fn test_starts_uninitialized() {
        let store = Arc::new(MemoryStore::new());
        let session = session(&store);
        assert_eq!(session.state(), SessionState::Uninitialized);
        assert!(!session.is_loading());
        assert!(session.current_user().is_none());
    }

    #[test]
    fn test_missing_profile_settles_anonymous() {
        let store = Arc::new(MemoryStore::new());
        let auth = MemoryAuth::new();
        auth.sign_in("u1");

        let session = session(&store);
        session.start(&auth);

        assert_eq!(session.state(), SessionState::Anonymous);
        assert!(!session.is_loading());
        assert!(session.current_user().is_none());
        assert!(matches!(session.require_principal(), Err(SyncError::NotSignedIn)));
    }

    #[test]
    fn test_profile_resolves_and_mirrors_updates() {
        let store = Arc::new(MemoryStore::new());
        store.insert(&path("users/u1"), json!({"name": "Ada", "points": 1}));
        let auth = MemoryAuth::new();

        let session = session(&store);
        session.start(&auth);
        assert_eq!(session.state(), SessionState::Anonymous);

        auth.sign_in("u1");
        assert_eq!(session.principal().as_deref(), Some("u1"));
        assert_eq!(session.current_user().unwrap().get_str("name"), Some("Ada"));
        assert_eq!(session.profile_path(), Some(path("users/u1")));

        store.insert(&path("users/u1"), json!({"name": "Ada", "points": 5}));
        assert_eq!(session.current_user().unwrap().get_f64("points"), Some(5.0));
    }

    #[test]
    fn test_profile_created_after_sign_in_resolves() {
        let store = Arc::new(MemoryStore::new());
        let auth = MemoryAuth::new();
        let session = session(&store);
        session.start(&auth);

        auth.sign_in("u1");
        assert_eq!(session.state(), SessionState::Anonymous);
        assert!(session.is_subscribed());

        store.insert(&path("users/u1"), json!({"name": "New"}));
        assert_eq!(session.principal().as_deref(), Some("u1"));
    }

    #[test]
    fn test_sign_out_releases_subscription() {
        let store = Arc::new(MemoryStore::new());
        store.insert(&path("users/u1"), json!({}));
        let auth = MemoryAuth::new();
        auth.sign_in("u1");

        let session = session(&store);
        session.start(&auth);
        assert!(session.principal().is_some());
        assert_eq!(store.listener_count(), 1);

        auth.sign_out();
        assert_eq!(session.state(), SessionState::Anonymous);
        assert_eq!(store.listener_count(), 0);

        // Changes to the old profile no longer reach the session
        store.insert(&path("users/u1"), json!({"name": "late"}));
        assert_eq!(session.state(), SessionState::Anonymous);
    }

    #[test]
    fn test_switching_principal_rebinds() {
        let store = Arc::new(MemoryStore::new());
        store.insert(&path("users/u1"), json!({"name": "One"}));
        store.insert(&path("users/u2"), json!({"name": "Two"}));
        let auth = MemoryAuth::new();

        let session = session(&store);
        session.start(&auth);
        auth.sign_in("u1");
        auth.sign_in("u2");

        assert_eq!(session.principal().as_deref(), Some("u2"));
        assert_eq!(store.listener_count(), 1);

        store.insert(&path("users/u1"), json!({"name": "One again"}));
        assert_eq!(session.current_user().unwrap().get_str("name"), Some("Two"));
    }

    #[test]
    fn test_repeated_principal_keeps_resolution() {
        let store = Arc::new(MemoryStore::new());
        store.insert(&path("users/u1"), json!({}));
        let auth = MemoryAuth::new();
        let session = session(&store);
        session.start(&auth);

        auth.sign_in("u1");
        auth.sign_in("u1");
        assert!(session.principal().is_some());
        assert!(!session.is_loading());
    }

    #[test]
    fn test_loading_until_first_snapshot() {
        let store = Arc::new(MemoryStore::new().with_delivery(DeliveryMode::Deferred));
        store.insert(&path("users/u1"), json!({"name": "Ada"}));
        let auth = MemoryAuth::new();
        auth.sign_in("u1");

        let session = session(&store);
        session.start(&auth);
        assert!(session.is_loading());
        assert_eq!(
            session.state(),
            SessionState::Resolving {
                principal: Some("u1".to_string())
            }
        );

        store.flush();
        assert!(!session.is_loading());
        assert_eq!(session.principal().as_deref(), Some("u1"));
    }

    #[test]
    fn test_profile_read_denied_is_anonymous() {
        let store = Arc::new(MemoryStore::new().with_rules(Arc::new(
            |req: &AccessRequest<'_>| req.operation != OperationKind::Read,
        )));
        store.insert(&path("users/u1"), json!({}));
        let auth = MemoryAuth::new();
        auth.sign_in("u1");

        let session = session(&store);
        session.start(&auth);

        assert_eq!(session.state(), SessionState::Anonymous);
        assert_eq!(
            session.last_error().map(|f| f.code),
            Some(FailureCode::PermissionDenied)
        );
    }

    #[test]
    fn test_restart_resolves_again() {
        let store = Arc::new(MemoryStore::new());
        store.insert(&path("users/u1"), json!({"name": "Ada"}));
        let auth = MemoryAuth::new();
        auth.sign_in("u1");

        let session = session(&store);
        session.start(&auth);
        assert_eq!(session.principal().as_deref(), Some("u1"));

        session.start(&auth);
        assert!(!session.is_loading());
        assert_eq!(session.principal().as_deref(), Some("u1"));
        assert_eq!(store.listener_count(), 1);
        assert_eq!(auth.listener_count(), 1);
    }

    #[test]
    fn test_repeated_principal_retries_refused_read() {
        let allow_reads = Arc::new(AtomicBool::new(false));
        let gate = Arc::clone(&allow_reads);
        let store = Arc::new(MemoryStore::new().with_rules(Arc::new(
            move |req: &AccessRequest<'_>| {
                req.operation != OperationKind::Read || gate.load(AtomicOrdering::SeqCst)
            },
        )));
        store.insert(&path("users/u1"), json!({"name": "Ada"}));
        let auth = MemoryAuth::new();

        let session = session(&store);
        session.start(&auth);
        auth.sign_in("u1");
        assert_eq!(session.state(), SessionState::Anonymous);
        assert!(session.last_error().is_some());
        assert!(!session.is_subscribed());

        allow_reads.store(true, AtomicOrdering::SeqCst);
        auth.sign_in("u1");
        assert_eq!(session.principal().as_deref(), Some("u1"));
        assert!(session.last_error().is_none());
        assert!(session.is_subscribed());
    }

    #[test]
    fn test_multi_segment_principal_is_anonymous() {
        let store = Arc::new(MemoryStore::new());
        store.insert(&path("users/a/b/c"), json!({"name": "nested"}));
        let auth = MemoryAuth::new();
        auth.sign_in("a/b/c");

        let session = session(&store);
        session.start(&auth);

        assert_eq!(session.state(), SessionState::Anonymous);
        assert!(session.profile_path().is_none());
        assert!(!session.is_subscribed());
        assert_eq!(store.listener_count(), 0);
    }

    #[test]
    fn test_stop_releases_everything() {
        let store = Arc::new(MemoryStore::new());
        store.insert(&path("users/u1"), json!({}));
        let auth = MemoryAuth::new();
        auth.sign_in("u1");

        let session = session(&store);
        session.start(&auth);
        session.stop();

        assert_eq!(session.state(), SessionState::Uninitialized);
        assert_eq!(store.listener_count(), 0);
        assert_eq!(auth.listener_count(), 0);

        auth.sign_in("u2");
        assert_eq!(session.state(), SessionState::Uninitialized);
    }

    #[test]
    fn test_typed_profile() {
        #[derive(serde::Deserialize)]
        struct Profile {
            id: String,
            name: String,
        }

        let store = Arc::new(MemoryStore::new());
        store.insert(&path("users/u1"), json!({"name": "Ada"}));
        let auth = MemoryAuth::new();
        auth.sign_in("u1");
        let session = session(&store);
        session.start(&auth);

        let profile: Profile = session.current_profile().unwrap().unwrap();
        assert_eq!(profile.id, "u1");
        assert_eq!(profile.name, "Ada");
    }
}
