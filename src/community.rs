//! Community write paths.
//!
//! The application's concrete mutations: bookmarks, upvotes, comments,
//! notifications, teammate requests and profile edits. Each resolves the
//! acting principal from the [`Session`] it is given and writes through the
//! [`Mutator`], so denials land on the permission-error channel.

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::mutation::{MutationIntent, Mutator};
use crate::session::Session;
use crate::store::DocumentStore;
use crate::types::{payload_from_json, Document, DocumentPath, FieldValue, WritePayload};
use serde_json::{json, Value};

const POSTS: &str = "posts";
const COMMENTS: &str = "comments";
const NOTIFICATIONS: &str = "notifications";

/// Community actions for the signed-in user.
pub struct Community<'a, S: DocumentStore + ?Sized> {
    mutator: &'a Mutator<S>,
    session: &'a Session<S>,
    config: &'a SyncConfig,
}

impl<'a, S: DocumentStore + ?Sized + 'static> Community<'a, S> {
    pub fn new(mutator: &'a Mutator<S>, session: &'a Session<S>, config: &'a SyncConfig) -> Self {
        Self {
            mutator,
            session,
            config,
        }
    }

    fn profile_path(&self) -> Result<DocumentPath> {
        self.session.profile_path().ok_or(SyncError::NotSignedIn)
    }

    /// Add or remove a project from the user's bookmarks.
    ///
    /// `bookmarked` is the current state; returns the new one.
    pub fn toggle_bookmark(&self, project_id: &str, bookmarked: bool) -> Result<bool> {
        let project_id = id_segment(project_id)?;
        let path = self.profile_path()?;

        let element = vec![Value::from(project_id)];
        let change = if bookmarked {
            FieldValue::ArrayRemove(element)
        } else {
            FieldValue::ArrayUnion(element)
        };

        self.mutator.update(path, single("bookmarks", change))?;
        Ok(!bookmarked)
    }

    /// Add or remove the user's upvote on a post.
    pub fn toggle_upvote(&self, post_id: &str, upvoted: bool) -> Result<bool> {
        let post = post_path(post_id)?;
        let principal = self.session.require_principal()?;

        let element = vec![Value::from(principal)];
        let change = if upvoted {
            FieldValue::ArrayRemove(element)
        } else {
            FieldValue::ArrayUnion(element)
        };

        self.mutator.update(post, single("upvotes", change))?;
        Ok(!upvoted)
    }

    /// Create a comment and bump the post's `commentCount`.
    ///
    /// Runs as one atomic batch or as two ordered writes depending on
    /// `atomic_compound_writes`. Returns the new comment's path.
    pub fn add_comment(&self, post_id: &str, text: &str) -> Result<DocumentPath> {
        let post = post_path(post_id)?;
        let text = text.trim();
        if text.is_empty() {
            return Err(SyncError::Validation("comment is empty".to_string()));
        }
        if text.chars().count() > self.config.max_comment_len {
            return Err(SyncError::Validation(format!(
                "comment exceeds {} characters",
                self.config.max_comment_len
            )));
        }

        let principal = self.session.require_principal()?;
        let author_name = self
            .session
            .current_user()
            .and_then(|profile| profile.get_str("name").map(str::to_string))
            .unwrap_or_default();

        let mut comment = payload_from_json(json!({
            "text": text,
            "authorId": principal,
            "authorName": author_name,
        }))?;
        comment.insert("createdAt".to_string(), FieldValue::ServerTimestamp);

        let intents = vec![
            MutationIntent::create(post.join(COMMENTS)?, comment),
            MutationIntent::update(post, single("commentCount", FieldValue::Increment(1))),
        ];

        let results = if self.config.atomic_compound_writes {
            self.mutator.commit_atomic(intents)?
        } else {
            self.mutator.execute_sequence(intents)?
        };

        results
            .into_iter()
            .next()
            .map(|result| result.path)
            .ok_or_else(|| SyncError::Validation("comment write produced no result".to_string()))
    }

    pub fn mark_notification_read(&self, notification_id: &str) -> Result<()> {
        let id = id_segment(notification_id)?;
        let path = self.profile_path()?.join(NOTIFICATIONS)?.join(id)?;
        self.mutator
            .update(path, single("read", FieldValue::Value(Value::Bool(true))))?;
        Ok(())
    }

    /// Ask another user to join a project, via their notifications.
    pub fn request_teammate(
        &self,
        recipient_id: &str,
        project_id: &str,
        message: &str,
    ) -> Result<DocumentPath> {
        let recipient = id_segment(recipient_id)?;
        let project_id = id_segment(project_id)?;
        let principal = self.session.require_principal()?;
        if principal == recipient {
            return Err(SyncError::Validation(
                "cannot send a team request to yourself".to_string(),
            ));
        }

        let inbox = DocumentPath::parse(&self.config.profile_collection)?
            .join(recipient)?
            .join(NOTIFICATIONS)?;
        let mut payload = payload_from_json(json!({
            "type": "team-request",
            "fromId": principal,
            "projectId": project_id,
            "message": message.trim(),
            "read": false,
        }))?;
        payload.insert("createdAt".to_string(), FieldValue::ServerTimestamp);

        Ok(self.mutator.create(inbox, payload)?.path)
    }

    /// Update fields on the user's own profile document.
    pub fn update_profile(&self, fields: Value) -> Result<Document> {
        let path = self.profile_path()?;
        let payload = payload_from_json(fields)?;
        if payload.contains_key("id") {
            return Err(SyncError::Validation("profile id cannot change".to_string()));
        }

        let result = self.mutator.update(path.clone(), payload)?;
        result
            .document
            .ok_or_else(|| SyncError::Validation(format!("no document returned for {path}")))
    }
}

fn single(field: &str, value: FieldValue) -> WritePayload {
    let mut payload = WritePayload::new();
    payload.insert(field.to_string(), value);
    payload
}

fn post_path(post_id: &str) -> Result<DocumentPath> {
    DocumentPath::parse(POSTS)?.join(id_segment(post_id)?)
}

/// A single path segment supplied by the caller.
fn id_segment(id: &str) -> Result<&str> {
    let id = id.trim();
    if id.is_empty() || id.contains('/') {
        return Err(SyncError::Validation(format!("invalid id {id:?}")));
    }
    Ok(id)
}
