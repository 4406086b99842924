//! Story CRUD with the embedding threshold policy

use chrono::Utc;
use serde::Deserialize;
use uuid::Uuid;

use crate::analysis::{self, StoryAnalysis};
use crate::db::{Database, EmbeddingChange, Story, StoryKind};
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::generation::{Premise, SceneResponse};
use crate::logging;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewStory {
    #[serde(alias = "userId")]
    pub user_id: String,
    pub title: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub premise: Option<Premise>,
    #[serde(default)]
    pub scene: Option<SceneResponse>,
    #[serde(rename = "type", default)]
    pub kind: StoryKind,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoryEdit {
    #[serde(alias = "storyId")]
    pub story_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Clone)]
pub struct StoryService {
    db: Database,
    gateway: Gateway,
    embedding_min_chars: usize,
}

impl StoryService {
    pub fn new(db: Database, gateway: Gateway, embedding_min_chars: usize) -> Self {
        Self {
            db,
            gateway,
            embedding_min_chars,
        }
    }

    fn needs_embedding(&self, content: &str) -> bool {
        content.chars().count() > self.embedding_min_chars
    }

    /// Embedding failures never block a save; the story is stored unembedded.
    async fn try_embed(&self, user_id: &str, content: &str) -> Option<Vec<f32>> {
        match self.gateway.embed(content).await {
            Ok(vector) => Some(vector),
            Err(e) => {
                logging::log_error(Some(user_id), &format!("Embedding skipped: {}", e));
                None
            }
        }
    }

    pub async fn create(&self, new: NewStory) -> Result<Story> {
        if new.user_id.trim().is_empty() || new.title.trim().is_empty() {
            return Err(Error::Validation("user_id and title are required".into()));
        }

        let embedding = if self.needs_embedding(&new.content) {
            self.try_embed(&new.user_id, &new.content).await
        } else {
            None
        };

        let now = Utc::now().to_rfc3339();
        let story = Story {
            id: Uuid::new_v4().to_string(),
            user_id: new.user_id,
            title: new.title,
            content: new.content,
            embedding,
            premise: new.premise,
            scene: new.scene,
            kind: new.kind,
            analysis: None,
            created_at: now.clone(),
            updated_at: now,
        };
        self.db.insert_story(&story).await?;

        logging::log_story(
            Some(&story.user_id),
            &format!(
                "Saved '{}' ({}, embedded: {})",
                story.title,
                story.kind.as_str(),
                story.embedding.is_some()
            ),
        );
        Ok(story)
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<Story>> {
        if user_id.trim().is_empty() {
            return Err(Error::Validation("user_id is required".into()));
        }
        self.db.get_stories_for_user(user_id).await
    }

    /// Content at or under the threshold clears a stale embedding instead of
    /// recomputing it.
    pub async fn update(&self, edit: StoryEdit) -> Result<Story> {
        if edit.story_id.trim().is_empty() {
            return Err(Error::Validation("story_id is required".into()));
        }
        let existing = self
            .db
            .get_story(&edit.story_id)
            .await?
            .ok_or_else(|| Error::NotFound("Story not found".into()))?;

        let embedding = match &edit.content {
            Some(content) if *content != existing.content => {
                if self.needs_embedding(content) {
                    match self.try_embed(&existing.user_id, content).await {
                        Some(vector) => EmbeddingChange::Set(vector),
                        None => EmbeddingChange::Clear,
                    }
                } else {
                    EmbeddingChange::Clear
                }
            }
            _ => EmbeddingChange::Keep,
        };

        let matched = self
            .db
            .update_story(&edit.story_id, edit.title, edit.content, embedding)
            .await?;
        if !matched {
            return Err(Error::NotFound("Story not found".into()));
        }

        logging::log_story(Some(&existing.user_id), &format!("Updated story {}", edit.story_id));
        self.db
            .get_story(&edit.story_id)
            .await?
            .ok_or_else(|| Error::NotFound("Story not found".into()))
    }

    pub async fn delete(&self, story_id: &str) -> Result<()> {
        if story_id.trim().is_empty() {
            return Err(Error::Validation("story_id is required".into()));
        }
        if !self.db.delete_story(story_id).await? {
            return Err(Error::NotFound("Story not found".into()));
        }
        logging::log_story(None, &format!("Deleted story {}", story_id));
        Ok(())
    }

    /// Store an uploaded text. Missing analysis is computed, falling back to
    /// heuristics when the model is unavailable.
    pub async fn import(
        &self,
        user_id: &str,
        title: &str,
        content: &str,
        provided: Option<StoryAnalysis>,
    ) -> Result<Story> {
        if user_id.trim().is_empty() || title.trim().is_empty() || content.trim().is_empty() {
            return Err(Error::Validation("Content, title, and user_id are required".into()));
        }

        let analysis = match provided {
            Some(analysis) => analysis,
            None => analysis::analyze_content(&self.gateway, content).await?.analysis,
        };
        let embedding = if self.needs_embedding(content) {
            self.try_embed(user_id, content).await
        } else {
            None
        };

        let now = Utc::now().to_rfc3339();
        let story = Story {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title.to_string(),
            content: content.to_string(),
            embedding,
            premise: None,
            scene: None,
            kind: StoryKind::Uploaded,
            analysis: Some(analysis),
            created_at: now.clone(),
            updated_at: now,
        };
        self.db.insert_story(&story).await?;

        logging::log_story(Some(user_id), &format!("Imported '{}'", story.title));
        Ok(story)
    }
}
