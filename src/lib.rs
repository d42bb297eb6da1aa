//! # Commons Sync
//!
//! Client-side data layer for a student community hub backed by a
//! real-time document store.
//!
//! ## Core Concepts
//!
//! - **Live queries**: Bindings that hold exactly one store subscription and
//!   expose `(data, loading, error)`
//! - **Mutations**: Writes whose permission denials are published with full
//!   request context
//! - **Permission channel**: Injectable fan-out for denial events
//! - **Session**: Auth state plus the signed-in user's mirrored profile
//! - **Derived views**: Pure search, filtering, rating and leaderboard
//!   functions over synced collections
//!
//! ## Example
//!
//! ```ignore
//! use commons_sync::{Descriptor, Filter, MemoryAuth, MemoryStore, Query, SyncConfig, SyncContext};
//! use std::sync::Arc;
//!
//! let auth = Arc::new(MemoryAuth::new());
//! let store = Arc::new(MemoryStore::new().with_auth(auth.clone()));
//! let ctx = SyncContext::new(store, auth.clone(), SyncConfig::default())?;
//! ctx.start();
//!
//! // Bind a query
//! let projects = ctx.live_query(Some(Descriptor::query(
//!     Query::collection("projects")?.filter(Filter::array_contains("tags", "AI/ML")),
//! )));
//!
//! // Write as the signed-in user
//! auth.sign_in("u1");
//! ctx.community().toggle_bookmark("proj-9", false)?;
//! ```

pub mod binding;
pub mod channel;
pub mod community;
pub mod config;
pub mod context;
pub mod derive;
pub mod error;
pub mod ideas;
pub mod mutation;
pub mod session;
pub mod store;
pub mod types;

// Re-exports
pub use binding::{BindingObserver, BindingState, LiveQuery};
pub use channel::{
    logging_listener, ListenerId, PermissionDenial, PermissionErrorChannel, PermissionListener,
    PERMISSION_ERROR,
};
pub use community::Community;
pub use config::SyncConfig;
pub use context::SyncContext;
pub use derive::{
    average_ratings, filter_by_tag, leaderboard, search, LeaderboardEntry, RatingSummary,
    SearchHit, SearchSource,
};
pub use error::{FailureCode, Result, StoreFailure, SyncError};
pub use ideas::{
    suggest_project_ideas, IdeaGenerator, ProjectIdea, ProjectIdeaRequest, ProjectIdeas,
};
pub use mutation::{MutationIntent, MutationNotifier, Mutator, Settlement};
pub use session::{Session, SessionState};
pub use store::{
    AccessRequest, AccessRule, AuthCallback, AuthProvider, DeliveryMode, DocumentStore,
    ErrorCallback, ListenerRegistration, MemoryAuth, MemoryStore, SnapshotCallback,
};
pub use types::*;
