//! Project idea suggestions.
//!
//! Generation itself is an opaque remote call behind [`IdeaGenerator`]. This
//! module owns the request/response shapes and the checks done before the
//! call. There is no retry; any generator failure surfaces as
//! [`SyncError::Generation`].

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectIdeaRequest {
    pub skills: Vec<String>,
    pub interests: Vec<String>,
    #[serde(default)]
    pub preferences: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectIdea {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub relevant_resources: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectIdeas {
    pub project_ideas: Vec<ProjectIdea>,
}

/// Remote text generation, treated as a black box.
pub trait IdeaGenerator: Send + Sync {
    fn generate(
        &self,
        request: &ProjectIdeaRequest,
    ) -> std::result::Result<ProjectIdeas, Box<dyn std::error::Error + Send + Sync>>;
}

impl ProjectIdeaRequest {
    /// Trim entries, drop blanks, and require at least one skill or interest.
    pub fn normalized(&self) -> Result<ProjectIdeaRequest> {
        let clean = |items: &[String]| -> Vec<String> {
            items
                .iter()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        };

        let request = ProjectIdeaRequest {
            skills: clean(&self.skills),
            interests: clean(&self.interests),
            preferences: self.preferences.trim().to_string(),
        };

        if request.skills.is_empty() && request.interests.is_empty() {
            return Err(SyncError::Validation(
                "at least one skill or interest is required".to_string(),
            ));
        }
        Ok(request)
    }
}

/// Validate `request` and ask `generator` for ideas.
pub fn suggest_project_ideas<G: IdeaGenerator + ?Sized>(
    generator: &G,
    request: &ProjectIdeaRequest,
) -> Result<ProjectIdeas> {
    let request = request.normalized()?;
    debug!(
        skills = request.skills.len(),
        interests = request.interests.len(),
        "Requesting project ideas"
    );

    generator
        .generate(&request)
        .map_err(|e| SyncError::Generation(e.to_string()))
}
