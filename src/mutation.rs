//! Permission-aware writes.
//!
//! Every write goes through a [`Mutator`]. It validates the intent before the
//! store sees it, performs the write, and when the store refuses on
//! permission grounds publishes exactly one [`PermissionDenial`] before
//! handing the failure back. Callers still get the error and run their own
//! rollback.

use crate::channel::{PermissionDenial, PermissionErrorChannel};
use crate::error::{FailureCode, Result, StoreFailure, SyncError};
use crate::store::DocumentStore;
use crate::types::{DocumentPath, OperationKind, WritePayload, WriteRequest, WriteResult};
use std::sync::Arc;
use tracing::debug;

/// One pending write.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationIntent {
    /// Document path, or collection path for a create with a store-assigned id.
    pub path: DocumentPath,
    pub kind: OperationKind,
    pub payload: Option<WritePayload>,
    /// Include `payload` in the denial report if this write is refused.
    pub report_payload: bool,
}

impl MutationIntent {
    pub fn create(path: DocumentPath, payload: WritePayload) -> Self {
        Self {
            path,
            kind: OperationKind::Create,
            payload: Some(payload),
            report_payload: true,
        }
    }

    pub fn update(path: DocumentPath, payload: WritePayload) -> Self {
        Self {
            path,
            kind: OperationKind::Update,
            payload: Some(payload),
            report_payload: true,
        }
    }

    pub fn delete(path: DocumentPath) -> Self {
        Self {
            path,
            kind: OperationKind::Delete,
            payload: None,
            report_payload: false,
        }
    }

    /// Leave the payload out of any denial report.
    pub fn without_payload_report(mut self) -> Self {
        self.report_payload = false;
        self
    }

    /// Reject intents the store could never accept.
    pub fn validate(&self) -> Result<()> {
        if !self.kind.is_write() {
            return Err(SyncError::Validation(format!(
                "{} is not a write operation",
                self.kind
            )));
        }

        if matches!(self.kind, OperationKind::Update | OperationKind::Delete)
            && !self.path.is_document()
        {
            return Err(SyncError::Validation(format!(
                "{} needs a document path, got {}",
                self.kind, self.path
            )));
        }

        match (&self.payload, self.kind) {
            (None, OperationKind::Create | OperationKind::Update) => {
                return Err(SyncError::Validation(format!("{} needs a payload", self.kind)));
            }
            (Some(payload), OperationKind::Update) if payload.is_empty() => {
                return Err(SyncError::Validation("update payload is empty".to_string()));
            }
            _ => {}
        }

        if let Some(payload) = &self.payload {
            if let Some(bad) = payload
                .keys()
                .find(|name| name.split('.').any(|part| part.trim().is_empty()))
            {
                return Err(SyncError::Validation(format!("invalid field name {bad:?}")));
            }
        }

        Ok(())
    }

    fn to_request(&self) -> WriteRequest {
        WriteRequest {
            path: self.path.clone(),
            kind: self.kind,
            payload: self.payload.clone(),
        }
    }

    /// Whether a store error naming `path` is about this write.
    fn targets(&self, path: &DocumentPath) -> bool {
        &self.path == path
            || (self.path.is_collection() && path.parent().as_ref() == Some(&self.path))
    }
}

/// Terminal signal for one mutation (or one compound mutation).
#[derive(Clone, Debug, PartialEq)]
pub enum Settlement {
    Succeeded {
        path: DocumentPath,
        operation: OperationKind,
    },
    Failed {
        path: DocumentPath,
        operation: OperationKind,
        code: FailureCode,
        message: String,
    },
}

/// Receives one settlement per mutation, e.g. to show a toast.
pub trait MutationNotifier: Send + Sync {
    fn settled(&self, settlement: &Settlement);
}

impl<F> MutationNotifier for F
where
    F: Fn(&Settlement) + Send + Sync,
{
    fn settled(&self, settlement: &Settlement) {
        self(settlement)
    }
}

/// Performs writes and classifies their failures.
pub struct Mutator<S: DocumentStore + ?Sized> {
    store: Arc<S>,
    channel: Arc<PermissionErrorChannel>,
    notifier: Option<Arc<dyn MutationNotifier>>,
    report_payloads: bool,
}

impl<S: DocumentStore + ?Sized> Mutator<S> {
    pub fn new(store: Arc<S>, channel: Arc<PermissionErrorChannel>) -> Self {
        Self {
            store,
            channel,
            notifier: None,
            report_payloads: true,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn MutationNotifier>) -> Self {
        self.set_notifier(notifier);
        self
    }

    pub fn set_notifier(&mut self, notifier: Arc<dyn MutationNotifier>) {
        self.notifier = Some(notifier);
    }

    /// Globally allow or suppress payloads in denial reports.
    pub fn with_payload_reports(mut self, enabled: bool) -> Self {
        self.report_payloads = enabled;
        self
    }

    pub fn channel(&self) -> &Arc<PermissionErrorChannel> {
        &self.channel
    }

    pub fn create(&self, path: DocumentPath, payload: WritePayload) -> Result<WriteResult> {
        self.execute(MutationIntent::create(path, payload))
    }

    pub fn update(&self, path: DocumentPath, payload: WritePayload) -> Result<WriteResult> {
        self.execute(MutationIntent::update(path, payload))
    }

    pub fn delete(&self, path: DocumentPath) -> Result<()> {
        self.execute(MutationIntent::delete(path)).map(|_| ())
    }

    /// Perform one write.
    ///
    /// Validation errors return before the store is called and are not
    /// signalled to the notifier; the caller reports them inline.
    pub fn execute(&self, intent: MutationIntent) -> Result<WriteResult> {
        intent.validate()?;

        match self.store.write(&intent.to_request()) {
            Ok(result) => {
                debug!(path = %result.path, operation = %intent.kind, "Write accepted");
                self.notify(Settlement::Succeeded {
                    path: result.path.clone(),
                    operation: intent.kind,
                });
                Ok(result)
            }
            Err(failure) => Err(self.fail(&intent, failure)),
        }
    }

    /// Perform writes one after another, stopping at the first failure.
    ///
    /// Writes after a failed one are never issued. This is not atomic:
    /// writes before the failure stay applied.
    pub fn execute_sequence(&self, intents: Vec<MutationIntent>) -> Result<Vec<WriteResult>> {
        for intent in &intents {
            intent.validate()?;
        }

        let mut results = Vec::with_capacity(intents.len());
        for intent in &intents {
            match self.store.write(&intent.to_request()) {
                Ok(result) => results.push(result),
                // The failing write is the one just issued
                Err(failure) => return Err(self.fail(intent, failure)),
            }
        }

        self.notify_batch(&intents);
        Ok(results)
    }

    /// Perform all writes atomically through the store's batch commit.
    ///
    /// On failure the denial names the write whose path the store blamed,
    /// or the first write when the store does not say.
    pub fn commit_atomic(&self, intents: Vec<MutationIntent>) -> Result<Vec<WriteResult>> {
        if intents.is_empty() {
            return Ok(Vec::new());
        }
        for intent in &intents {
            intent.validate()?;
        }

        let requests: Vec<WriteRequest> = intents.iter().map(MutationIntent::to_request).collect();
        match self.store.commit(&requests) {
            Ok(results) => {
                self.notify_batch(&intents);
                Ok(results)
            }
            Err(failure) => {
                let blamed = blame(&intents, &failure).unwrap_or(&intents[0]);
                Err(self.fail(blamed, failure))
            }
        }
    }

    /// Publish a denial if this is one, signal failure, and wrap the error.
    fn fail(&self, intent: &MutationIntent, failure: StoreFailure) -> SyncError {
        if failure.is_permission_denied() {
            let payload = if self.report_payloads && intent.report_payload {
                intent.payload.as_ref()
            } else {
                None
            };
            let denial = PermissionDenial::new(intent.path.clone(), intent.kind, payload, &failure);
            let listeners = self.channel.publish(&denial);
            debug!(path = %intent.path, operation = %intent.kind, listeners, "Published permission denial");
        } else {
            debug!(path = %intent.path, code = %failure.code, "Write failed");
        }

        self.notify(Settlement::Failed {
            path: intent.path.clone(),
            operation: intent.kind,
            code: failure.code,
            message: failure.message.clone(),
        });

        SyncError::Store(failure)
    }

    fn notify_batch(&self, intents: &[MutationIntent]) {
        if let Some(first) = intents.first() {
            self.notify(Settlement::Succeeded {
                path: first.path.clone(),
                operation: first.kind,
            });
        }
    }

    fn notify(&self, settlement: Settlement) {
        if let Some(notifier) = &self.notifier {
            notifier.settled(&settlement);
        }
    }
}

/// The intent a store failure refers to, judged by the path it names.
fn blame<'a>(intents: &'a [MutationIntent], failure: &StoreFailure) -> Option<&'a MutationIntent> {
    let path = failure.path.as_ref()?;
    intents.iter().find(|intent| intent.targets(path))
}
