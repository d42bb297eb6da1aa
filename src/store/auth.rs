//! In-process auth provider.

use super::{AuthCallback, AuthProvider, ListenerRegistration};
use crate::types::PrincipalId;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

type AuthListeners = Arc<RwLock<Vec<(u64, AuthCallback)>>>;

/// Auth provider whose principal is set by hand.
#[derive(Default)]
pub struct MemoryAuth {
    principal: RwLock<Option<PrincipalId>>,
    listeners: AuthListeners,
    next_id: AtomicU64,
}

impl MemoryAuth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sign in as `principal` and notify listeners.
    pub fn sign_in(&self, principal: impl Into<PrincipalId>) {
        let principal = principal.into();
        debug!(principal = %principal, "Auth state changed: signed in");
        *self.principal.write() = Some(principal.clone());
        self.notify(Some(principal));
    }

    /// Clear the principal and notify listeners.
    pub fn sign_out(&self) {
        debug!("Auth state changed: signed out");
        *self.principal.write() = None;
        self.notify(None);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    fn notify(&self, principal: Option<PrincipalId>) {
        // Snapshot first so callbacks can register or release freely
        let callbacks: Vec<AuthCallback> = self
            .listeners
            .read()
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();
        for callback in callbacks {
            callback(principal.clone());
        }
    }
}

impl AuthProvider for MemoryAuth {
    fn on_auth_state_changed(&self, callback: AuthCallback) -> ListenerRegistration {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.listeners.write().push((id, Arc::clone(&callback)));

        callback(self.current_principal_id());

        let listeners = Arc::downgrade(&self.listeners);
        ListenerRegistration::new(move || {
            if let Some(listeners) = listeners.upgrade() {
                listeners.write().retain(|(lid, _)| *lid != id);
            }
        })
    }

    fn current_principal_id(&self) -> Option<PrincipalId> {
        self.principal.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_listener_fires_immediately_and_on_change() {
        let auth = MemoryAuth::new();
        auth.sign_in("u1");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let registration = auth.on_auth_state_changed(Arc::new(move |p| s.lock().push(p)));

        auth.sign_out();
        registration.release();
        auth.sign_in("u2");

        assert_eq!(*seen.lock(), vec![Some("u1".to_string()), None]);
        assert_eq!(auth.listener_count(), 0);
        assert_eq!(auth.current_principal_id().as_deref(), Some("u2"));
    }
}
