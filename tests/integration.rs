//! Integration tests for the sync layer.

use commons_sync::{
    search, AccessRequest, Descriptor, DocumentPath, Filter, MemoryAuth, MemoryStore,
    OperationKind, PermissionDenial, Query, SearchSource, SessionState, Snapshot, SyncConfig,
    SyncContext,
};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

fn path(raw: &str) -> DocumentPath {
    DocumentPath::parse(raw).unwrap()
}

/// Route library logs (denial diagnostics included) to the test output.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Store seeded with a small community, plus its auth provider.
fn seeded() -> (Arc<MemoryStore>, Arc<MemoryAuth>) {
    init_tracing();
    let auth = Arc::new(MemoryAuth::new());
    let store = Arc::new(MemoryStore::new().with_auth(auth.clone()));

    store.insert(&path("users/u1"), json!({"name": "Ada", "bookmarks": ["proj-9"]}));
    store.insert(&path("users/u2"), json!({"name": "Grace"}));
    store.insert(
        &path("projects/p1"),
        json!({"title": "Campus Robotics", "tags": ["AI/ML", "Hardware"]}),
    );
    store.insert(
        &path("projects/p2"),
        json!({"title": "Poster design", "tags": ["Design"]}),
    );
    store.insert(&path("posts/post1"), json!({"title": "Hello", "commentCount": 0}));

    (store, auth)
}

/// Owner-only profiles and inboxes; anyone signed in may drop a
/// notification into an inbox or read everything else.
fn owner_rules(req: &AccessRequest<'_>) -> bool {
    let Some(principal) = req.principal else {
        return false;
    };
    let mut segments = req.path.segments();
    match (segments.next(), segments.next(), segments.next()) {
        (Some("users"), Some(owner), Some("notifications")) => {
            req.operation == OperationKind::Create || owner == principal
        }
        (Some("users"), Some(owner), _) if req.operation.is_write() => owner == principal,
        _ => true,
    }
}

// --- Realistic Workflow Tests ---

#[test]
fn test_tag_filtered_projects_scenario() {
    let (store, auth) = seeded();
    let ctx = SyncContext::new(store, auth, SyncConfig::default()).unwrap();

    let projects = ctx.live_query(Some(Descriptor::query(
        Query::collection("projects")
            .unwrap()
            .filter(Filter::array_contains("tags", "AI/ML")),
    )));

    let state = projects.state();
    assert!(!state.loading);
    assert!(state.error.is_none());
    let ids: Vec<String> = state
        .data
        .unwrap()
        .documents()
        .iter()
        .map(|d| d.id().to_string())
        .collect();
    assert_eq!(ids, vec!["p1"]);
}

#[test]
fn test_community_session_workflow() {
    let (store, auth) = seeded();
    let ctx = SyncContext::new(Arc::clone(&store), auth.clone(), SyncConfig::default()).unwrap();
    ctx.start();
    assert_eq!(ctx.session().state(), SessionState::Anonymous);

    auth.sign_in("u1");
    assert_eq!(ctx.session().principal().as_deref(), Some("u1"));

    let community = ctx.community();
    community.toggle_bookmark("proj-9", true).unwrap();
    community.toggle_bookmark("p1", false).unwrap();
    community.toggle_upvote("post1", false).unwrap();
    let comment = community.add_comment("post1", "Count me in").unwrap();

    let profile = ctx.session().current_user().unwrap();
    assert_eq!(profile.get("bookmarks"), Some(&json!(["p1"])));

    let post = store.get(&path("posts/post1")).unwrap();
    assert_eq!(post.get("upvotes"), Some(&json!(["u1"])));
    assert_eq!(post.get("commentCount"), Some(&json!(1)));
    assert_eq!(store.get(&comment).unwrap().get_str("authorId"), Some("u1"));

    auth.sign_out();
    assert!(ctx.session().current_user().is_none());
    assert!(ctx.community().toggle_upvote("post1", true).is_err());
}

#[test]
fn test_comment_thread_stays_live() {
    let (store, auth) = seeded();
    let ctx = SyncContext::new(store, auth.clone(), SyncConfig::default()).unwrap();
    ctx.start();
    auth.sign_in("u2");

    let thread = ctx.live_query(Some(Descriptor::query(
        Query::collection("posts/post1/comments").unwrap(),
    )));
    assert_eq!(thread.data().map(|s| s.len()), Some(0));

    ctx.community().add_comment("post1", "first").unwrap();
    ctx.community().add_comment("post1", "second").unwrap();

    #[derive(Deserialize)]
    struct Comment {
        text: String,
        #[serde(rename = "authorName")]
        author_name: String,
    }
    let mut comments: Vec<Comment> = thread.decode().unwrap();
    comments.sort_by(|a, b| a.text.cmp(&b.text));
    assert_eq!(comments.len(), 2);
    assert_eq!(comments[0].text, "first");
    assert_eq!(comments[1].author_name, "Grace");
}

#[test]
fn test_rules_enforced_end_to_end() {
    let (store, auth) = seeded();
    store.set_rules(Some(Arc::new(owner_rules)));
    let ctx = SyncContext::new(Arc::clone(&store), auth.clone(), SyncConfig::default()).unwrap();

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&events);
    ctx.channel()
        .register(Arc::new(move |e: &PermissionDenial| sink.lock().push(e.clone())));

    ctx.start();
    auth.sign_in("u1");
    assert!(ctx.session().principal().is_some());

    // Another user's inbox is not readable
    let inbox = ctx.live_query(Some(Descriptor::query(
        Query::collection("users/u2/notifications").unwrap(),
    )));
    assert!(inbox.error().unwrap().is_permission_denied());
    assert!(!inbox.is_connected());

    // But a teammate request can be dropped into it
    let request = ctx.community().request_teammate("u2", "p1", "join?").unwrap();
    assert_eq!(store.get(&request).unwrap().get_str("projectId"), Some("p1"));
    assert!(events.lock().is_empty());

    // Read denials go to the binding, never to the channel
    assert_eq!(ctx.channel().published_count(), 0);
}

#[test]
fn test_search_over_bound_collections() {
    let (store, auth) = seeded();
    let ctx = SyncContext::new(store, auth, SyncConfig::default()).unwrap();

    let projects = ctx.live_query(Some(Descriptor::query(Query::collection("projects").unwrap())));
    let users = ctx.live_query(Some(Descriptor::query(Query::collection("users").unwrap())));
    let events = ctx.live_query(None);

    let project_snapshot = projects.data();
    let user_snapshot = users.data();
    let event_snapshot = events.data();

    let documents = |snapshot: &Option<Snapshot>| {
        snapshot.as_ref().map(|s| s.documents().to_vec())
    };
    let project_docs = documents(&project_snapshot);
    let user_docs = documents(&user_snapshot);
    let event_docs = documents(&event_snapshot);

    let hits = search(
        &[
            SearchSource {
                collection: "projects",
                documents: project_docs.as_deref(),
                fields: &["title", "tags"],
            },
            SearchSource {
                collection: "users",
                documents: user_docs.as_deref(),
                fields: &["name"],
            },
            SearchSource {
                collection: "events",
                documents: event_docs.as_deref(),
                fields: &["title"],
            },
        ],
        "r",
    );

    let found: Vec<(String, String)> = hits
        .iter()
        .map(|h| (h.collection.clone(), h.document.id().to_string()))
        .collect();
    assert_eq!(
        found,
        vec![
            ("projects".to_string(), "p1".to_string()),
            ("projects".to_string(), "p2".to_string()),
            ("users".to_string(), "u2".to_string()),
        ]
    );
}

#[test]
fn test_config_from_file_drives_context() {
    let dir = tempfile::TempDir::new().unwrap();
    let file = dir.path().join("sync.json");
    std::fs::write(
        &file,
        r#"{"profile_collection": "members", "log_permission_denials": false}"#,
    )
    .unwrap();
    let config = SyncConfig::load(&file).unwrap();

    let auth = Arc::new(MemoryAuth::new());
    let store = Arc::new(MemoryStore::new().with_auth(auth.clone()));
    store.insert(&path("members/m1"), json!({"name": "Linus"}));

    let ctx = SyncContext::new(store, auth.clone(), config).unwrap();
    assert_eq!(ctx.channel().listener_count(), 0);
    ctx.start();
    auth.sign_in("m1");

    assert_eq!(ctx.session().profile_path(), Some(path("members/m1")));
    let updated = ctx
        .community()
        .update_profile(json!({"skills": ["Rust"]}))
        .unwrap();
    assert_eq!(updated.get("skills"), Some(&json!(["Rust"])));
}
