//! Application context.
//!
//! [`SyncContext`] wires one store and one auth provider to the shared
//! pieces the rest of the application uses: the permission-error channel,
//! the session, and the mutator. Components take what they need from it
//! instead of reaching for globals.

use crate::binding::LiveQuery;
use crate::channel::{logging_listener, ListenerId, PermissionErrorChannel};
use crate::community::Community;
use crate::config::SyncConfig;
use crate::error::Result;
use crate::mutation::{MutationNotifier, Mutator};
use crate::session::Session;
use crate::store::{AuthProvider, DocumentStore};
use crate::types::Descriptor;
use std::sync::Arc;
use tracing::debug;

pub struct SyncContext<S: DocumentStore + ?Sized + 'static> {
    config: SyncConfig,
    store: Arc<S>,
    auth: Arc<dyn AuthProvider>,
    channel: Arc<PermissionErrorChannel>,
    mutator: Mutator<S>,
    session: Session<S>,
    log_listener: Option<ListenerId>,
}

impl<S: DocumentStore + ?Sized + 'static> SyncContext<S> {
    /// Build the context. The session is idle until [`start`](Self::start).
    pub fn new(store: Arc<S>, auth: Arc<dyn AuthProvider>, config: SyncConfig) -> Result<Self> {
        config.validate()?;

        let channel = Arc::new(PermissionErrorChannel::new());
        let log_listener = config
            .log_permission_denials
            .then(|| channel.register(logging_listener()));

        let mutator = Mutator::new(Arc::clone(&store), Arc::clone(&channel))
            .with_payload_reports(config.report_write_payloads);
        let session = Session::new(Arc::clone(&store), &config)?;

        Ok(Self {
            config,
            store,
            auth,
            channel,
            mutator,
            session,
            log_listener,
        })
    }

    /// Attach a notifier that hears every write settle.
    pub fn with_notifier(mut self, notifier: Arc<dyn MutationNotifier>) -> Self {
        self.mutator.set_notifier(notifier);
        self
    }

    /// Start resolving the session from the auth provider.
    pub fn start(&self) {
        debug!(profiles = %self.config.profile_collection, "Starting sync context");
        self.session.start(self.auth.as_ref());
    }

    pub fn stop(&self) {
        self.session.stop();
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn channel(&self) -> &Arc<PermissionErrorChannel> {
        &self.channel
    }

    pub fn mutator(&self) -> &Mutator<S> {
        &self.mutator
    }

    pub fn session(&self) -> &Session<S> {
        &self.session
    }

    pub fn community(&self) -> Community<'_, S> {
        Community::new(&self.mutator, &self.session, &self.config)
    }

    /// A new binding against this context's store, bound to `descriptor`.
    pub fn live_query(&self, descriptor: Option<Descriptor>) -> LiveQuery<S> {
        let binding = LiveQuery::new(Arc::clone(&self.store));
        binding.bind(descriptor);
        binding
    }
}

impl<S: DocumentStore + ?Sized + 'static> Drop for SyncContext<S> {
    fn drop(&mut self) {
        if let Some(id) = self.log_listener.take() {
            self.channel.unregister_id(id);
        }
        self.session.stop();
    }
}
