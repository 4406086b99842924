use chrono::Utc;
use rusqlite::{params, Connection, Row};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::analysis::StoryAnalysis;
use crate::error::{Error, Result};
use crate::generation::{Premise, SceneResponse};
use crate::tensor::UserTensor;

/// Shared handle to the SQLite document store.
///
/// Cloning is cheap; all clones share one connection. Statements run on the
/// blocking pool so request tasks never stall a runtime worker.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

// ============ Story Structs ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoryKind {
    #[default]
    Draft,
    Uploaded,
}

impl StoryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoryKind::Draft => "draft",
            StoryKind::Uploaded => "uploaded",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "draft" => Some(StoryKind::Draft),
            "uploaded" => Some(StoryKind::Uploaded),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Story {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub content: String,
    /// Never leaves the process; search strips it and listings skip it.
    #[serde(skip_serializing, default)]
    pub embedding: Option<Vec<f32>>,
    pub premise: Option<Premise>,
    pub scene: Option<SceneResponse>,
    #[serde(rename = "type")]
    pub kind: StoryKind,
    pub analysis: Option<StoryAnalysis>,
    pub created_at: String,
    pub updated_at: String,
}

/// What an update does to the stored embedding
#[derive(Debug, Clone, PartialEq)]
pub enum EmbeddingChange {
    Keep,
    Set(Vec<f32>),
    Clear,
}

const STORY_COLUMNS: &str =
    "id, user_id, title, content, embedding, premise, scene, kind, analysis, created_at, updated_at";

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    Error::StoreUnavailable(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
        }
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| Error::StoreUnavailable("database lock poisoned".to_string()))?;
            f(&guard).map_err(Error::from)
        })
        .await?
    }

    // ============ Tensors ============

    pub async fn get_tensor(&self, user_id: &str) -> Result<Option<UserTensor>> {
        let user_id = user_id.to_string();
        let document: Option<String> = self
            .with_connection(move |conn| {
                let result = conn.query_row(
                    "SELECT document FROM tensors WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                );
                match result {
                    Ok(doc) => Ok(Some(doc)),
                    Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                    Err(e) => Err(e),
                }
            })
            .await?;

        document
            .map(|doc| {
                serde_json::from_str(&doc)
                    .map_err(|e| Error::StoreUnavailable(format!("corrupt tensor document: {}", e)))
            })
            .transpose()
    }

    /// Insert only when no tensor exists for this user. Returns true if inserted.
    pub async fn insert_tensor_if_absent(&self, tensor: &UserTensor) -> Result<bool> {
        let user_id = tensor.user_id.clone();
        let timestamp = tensor.timestamp.clone();
        let document = encode(tensor)?;
        self.with_connection(move |conn| {
            let inserted = conn.execute(
                "INSERT INTO tensors (user_id, document, timestamp) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO NOTHING",
                params![user_id, document, timestamp],
            )?;
            Ok(inserted > 0)
        })
        .await
    }

    /// Full-document upsert. Returns true if a prior document was replaced.
    pub async fn upsert_tensor(&self, tensor: &UserTensor) -> Result<bool> {
        let user_id = tensor.user_id.clone();
        let timestamp = tensor.timestamp.clone();
        let document = encode(tensor)?;
        self.with_connection(move |conn| {
            let existed: bool = conn.query_row(
                "SELECT COUNT(*) FROM tensors WHERE user_id = ?1",
                params![user_id],
                |row| Ok(row.get::<_, i64>(0)? > 0),
            )?;
            conn.execute(
                "INSERT INTO tensors (user_id, document, timestamp) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET document = excluded.document, timestamp = excluded.timestamp",
                params![user_id, document, timestamp],
            )?;
            Ok(existed)
        })
        .await
    }

    // ============ Stories ============

    pub async fn insert_story(&self, story: &Story) -> Result<()> {
        let story = story.clone();
        let embedding = story.embedding.as_ref().map(encode).transpose()?;
        let premise = story.premise.as_ref().map(encode).transpose()?;
        let scene = story.scene.as_ref().map(encode).transpose()?;
        let analysis = story.analysis.as_ref().map(encode).transpose()?;
        self.with_connection(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO stories ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    STORY_COLUMNS
                ),
                params![
                    story.id,
                    story.user_id,
                    story.title,
                    story.content,
                    embedding,
                    premise,
                    scene,
                    story.kind.as_str(),
                    analysis,
                    story.created_at,
                    story.updated_at,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn get_story(&self, story_id: &str) -> Result<Option<Story>> {
        let story_id = story_id.to_string();
        self.with_connection(move |conn| {
            let result = conn.query_row(
                &format!("SELECT {} FROM stories WHERE id = ?1", STORY_COLUMNS),
                params![story_id],
                story_from_row,
            );
            match result {
                Ok(story) => Ok(Some(story)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// All stories for a user, newest first
    pub async fn get_stories_for_user(&self, user_id: &str) -> Result<Vec<Story>> {
        let user_id = user_id.to_string();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM stories WHERE user_id = ?1 ORDER BY created_at DESC",
                STORY_COLUMNS
            ))?;
            let stories = stmt.query_map(params![user_id], story_from_row)?;
            stories.collect()
        })
        .await
    }

    /// Stories that carry a precomputed embedding
    pub async fn get_embedded_stories(&self, user_id: &str) -> Result<Vec<Story>> {
        let user_id = user_id.to_string();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM stories WHERE user_id = ?1 AND embedding IS NOT NULL",
                STORY_COLUMNS
            ))?;
            let stories = stmt.query_map(params![user_id], story_from_row)?;
            stories.collect()
        })
        .await
    }

    /// Apply an edit. Returns false when no story matched.
    pub async fn update_story(
        &self,
        story_id: &str,
        title: Option<String>,
        content: Option<String>,
        embedding: EmbeddingChange,
    ) -> Result<bool> {
        let story_id = story_id.to_string();
        let now = Utc::now().to_rfc3339();
        let (touch_embedding, embedding) = match embedding {
            EmbeddingChange::Keep => (false, None),
            EmbeddingChange::Set(vector) => (true, Some(encode(&vector)?)),
            EmbeddingChange::Clear => (true, None),
        };
        self.with_connection(move |conn| {
            let updated = conn.execute(
                "UPDATE stories SET
                    title = COALESCE(?2, title),
                    content = COALESCE(?3, content),
                    embedding = CASE WHEN ?4 THEN ?5 ELSE embedding END,
                    updated_at = ?6
                 WHERE id = ?1",
                params![story_id, title, content, touch_embedding, embedding, now],
            )?;
            Ok(updated > 0)
        })
        .await
    }

    /// Returns false when no story matched.
    pub async fn delete_story(&self, story_id: &str) -> Result<bool> {
        let story_id = story_id.to_string();
        self.with_connection(move |conn| {
            let deleted = conn.execute("DELETE FROM stories WHERE id = ?1", params![story_id])?;
            Ok(deleted > 0)
        })
        .await
    }
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        -- One profile document per user
        CREATE TABLE IF NOT EXISTS tensors (
            user_id TEXT PRIMARY KEY,
            document TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );

        -- Drafts and uploaded stories
        CREATE TABLE IF NOT EXISTS stories (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            title TEXT NOT NULL,
            content TEXT NOT NULL DEFAULT '',
            embedding TEXT,
            premise TEXT,
            scene TEXT,
            kind TEXT NOT NULL DEFAULT 'draft',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_stories_user ON stories(user_id);
        ",
    )?;

    // Migration: analysis arrived with story import
    let has_analysis: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM pragma_table_info('stories') WHERE name='analysis'",
            [],
            |row| Ok(row.get::<_, i64>(0)? > 0),
        )
        .unwrap_or(false);

    if !has_analysis {
        conn.execute("ALTER TABLE stories ADD COLUMN analysis TEXT", [])?;
    }

    Ok(())
}

fn encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::StoreUnavailable(format!("encode failed: {}", e)))
}

fn json_column<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<Option<T>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|text| {
        serde_json::from_str(&text).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
    })
    .transpose()
}

fn story_from_row(row: &Row) -> rusqlite::Result<Story> {
    let kind: String = row.get(7)?;
    Ok(Story {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        content: row.get(3)?,
        embedding: json_column(row, 4)?,
        premise: json_column(row, 5)?,
        scene: json_column(row, 6)?,
        kind: StoryKind::from_str(&kind).unwrap_or_default(),
        analysis: json_column(row, 8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn story(id: &str, user_id: &str, created_at: &str, embedding: Option<Vec<f32>>) -> Story {
        Story {
            id: id.to_string(),
            user_id: user_id.to_string(),
            title: format!("Story {}", id),
            content: "The airport at dawn, mirrors everywhere.".to_string(),
            embedding,
            premise: None,
            scene: None,
            kind: StoryKind::Draft,
            analysis: None,
            created_at: created_at.to_string(),
            updated_at: created_at.to_string(),
        }
    }

    #[tokio::test]
    async fn test_tensor_insert_if_absent_keeps_first_document() {
        let db = Database::open_in_memory().unwrap();
        let mut first = UserTensor::default_for("u1");
        first.creative_voice.diction = "Elevated".to_string();
        let mut second = UserTensor::default_for("u1");
        second.creative_voice.diction = "Plain".to_string();

        assert!(db.insert_tensor_if_absent(&first).await.unwrap());
        assert!(!db.insert_tensor_if_absent(&second).await.unwrap());

        let stored = db.get_tensor("u1").await.unwrap().unwrap();
        assert_eq!(stored.creative_voice.diction, "Elevated");
    }

    #[tokio::test]
    async fn test_tensor_upsert_reports_replacement() {
        let db = Database::open_in_memory().unwrap();
        let tensor = UserTensor::default_for("u2");
        assert!(!db.upsert_tensor(&tensor).await.unwrap());
        assert!(db.upsert_tensor(&tensor).await.unwrap());
        assert!(db.get_tensor("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_story_crud_round() {
        let db = Database::open_in_memory().unwrap();
        db.insert_story(&story("a", "u1", "2024-01-01T00:00:00Z", Some(vec![1.0, 0.0])))
            .await
            .unwrap();
        db.insert_story(&story("b", "u1", "2024-02-01T00:00:00Z", None))
            .await
            .unwrap();
        db.insert_story(&story("c", "u2", "2024-03-01T00:00:00Z", Some(vec![0.0, 1.0])))
            .await
            .unwrap();

        let mine = db.get_stories_for_user("u1").await.unwrap();
        assert_eq!(mine.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(), vec!["b", "a"]);

        let embedded = db.get_embedded_stories("u1").await.unwrap();
        assert_eq!(embedded.len(), 1);
        assert_eq!(embedded[0].embedding, Some(vec![1.0, 0.0]));

        assert!(db
            .update_story("a", Some("Renamed".into()), None, EmbeddingChange::Clear)
            .await
            .unwrap());
        let updated = db.get_story("a").await.unwrap().unwrap();
        assert_eq!(updated.title, "Renamed");
        assert_eq!(updated.content, "The airport at dawn, mirrors everywhere.");
        assert!(updated.embedding.is_none());

        assert!(!db
            .update_story("nope", None, None, EmbeddingChange::Keep)
            .await
            .unwrap());
        assert!(db.delete_story("a").await.unwrap());
        assert!(!db.delete_story("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_open_on_disk_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("qs.db");
        {
            let db = Database::open(&path).unwrap();
            db.upsert_tensor(&UserTensor::default_for("u1")).await.unwrap();
        }
        let reopened = Database::open(&path).unwrap();
        assert!(reopened.get_tensor("u1").await.unwrap().is_some());
    }

    #[test]
    fn test_embedding_is_not_serialized() {
        let s = story("a", "u1", "2024-01-01T00:00:00Z", Some(vec![0.5; 4]));
        let value = serde_json::to_value(&s).unwrap();
        assert!(value.get("embedding").is_none());
        assert_eq!(value["type"], "draft");
    }
}
