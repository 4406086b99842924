//! Semantic search over a user's embedded stories.
//!
//! A linear in-memory scan: per-user corpora are small, so there is no index.

use serde::Serialize;

use crate::db::{Database, Story};
use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::logging;

pub const DEFAULT_LIMIT: usize = 5;

/// `dot(a, b) / (|a| * |b|)`. Zero when either side has no magnitude or the
/// dimensions disagree.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (x, y) in a.iter().zip(b) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// A ranked story. The embedding never serializes, see [`Story`].
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    #[serde(flatten)]
    pub story: Story,
    pub similarity: f64,
}

/// Score candidates, best first, keeping at most `limit`. Embeddings are
/// dropped from the returned stories.
pub fn rank(query: &[f32], candidates: Vec<Story>, limit: usize) -> Vec<SearchResult> {
    let mut results: Vec<SearchResult> = candidates
        .into_iter()
        .filter_map(|mut story| {
            let embedding = story.embedding.take()?;
            Some(SearchResult {
                similarity: cosine_similarity(query, &embedding),
                story,
            })
        })
        .collect();

    results.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
    results.truncate(limit);
    results
}

pub async fn semantic_search(
    gateway: &Gateway,
    db: &Database,
    user_id: &str,
    query: &str,
    limit: Option<usize>,
) -> Result<Vec<SearchResult>> {
    if user_id.trim().is_empty() || query.trim().is_empty() {
        return Err(Error::Validation("User ID and query are required".into()));
    }
    let limit = limit.unwrap_or(DEFAULT_LIMIT);

    let query_embedding = gateway.embed(query).await?;
    let candidates = db.get_embedded_stories(user_id).await?;
    let scanned = candidates.len();
    let results = rank(&query_embedding, candidates, limit);

    logging::log_search(
        Some(user_id),
        &format!("'{}' scanned {} stories, returned {}", query.trim(), scanned, results.len()),
    );
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StoryKind;
    use crate::testing::MockModel;

    fn story(id: &str, user_id: &str, embedding: Option<Vec<f32>>) -> Story {
        Story {
            id: id.into(),
            user_id: user_id.into(),
            title: format!("Story {}", id),
            content: "content".into(),
            embedding,
            premise: None,
            scene: None,
            kind: StoryKind::Draft,
            analysis: None,
            created_at: "2024-01-01T00:00:00Z".into(),
            updated_at: "2024-01-01T00:00:00Z".into(),
        }
    }

    /// Unit vector in the x/y plane with the given cosine against (1, 0).
    fn at_cosine(c: f32) -> Vec<f32> {
        vec![c, (1.0 - c * c).sqrt()]
    }

    #[test]
    fn test_cosine_identity_zero_and_symmetry() {
        let v = [0.3f32, -1.2, 4.0];
        let w = [2.0f32, 0.5, -0.1];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
        assert_eq!(cosine_similarity(&v, &[0.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0, 0.0], &v), 0.0);
        assert_eq!(cosine_similarity(&v, &w), cosine_similarity(&w, &v));
    }

    #[test]
    fn test_cosine_dimension_mismatch_is_zero() {
        assert_eq!(cosine_similarity(&[1.0, 0.0], &[1.0, 0.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn test_rank_keeps_top_two_descending() {
        let query = vec![1.0, 0.0];
        let candidates = vec![
            story("low", "u", Some(at_cosine(0.1))),
            story("high", "u", Some(at_cosine(0.9))),
            story("mid", "u", Some(at_cosine(0.5))),
        ];
        let results = rank(&query, candidates, 2);

        let ids: Vec<&str> = results.iter().map(|r| r.story.id.as_str()).collect();
        assert_eq!(ids, vec!["high", "mid"]);
        assert!((results[0].similarity - 0.9).abs() < 1e-6);
        assert!((results[1].similarity - 0.5).abs() < 1e-6);
        assert!(results.iter().all(|r| r.story.embedding.is_none()));

        let json = serde_json::to_value(&results).unwrap();
        assert!(json[0].get("embedding").is_none());
        assert_eq!(json[0]["id"], "high");
    }

    #[tokio::test]
    async fn test_semantic_search_scans_only_this_users_embedded_stories() {
        let db = Database::open_in_memory().unwrap();
        db.insert_story(&story("a", "u1", Some(vec![1.0, 0.0]))).await.unwrap();
        db.insert_story(&story("b", "u1", None)).await.unwrap();
        db.insert_story(&story("c", "u2", Some(vec![1.0, 0.0]))).await.unwrap();

        let (gateway, _) = MockModel::replying(|_| Ok(String::new()))
            .with_embeddings(|_| Ok(vec![1.0, 0.0]))
            .build();
        let results = semantic_search(&gateway, &db, "u1", "maps", None).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].story.id, "a");
    }

    #[tokio::test]
    async fn test_semantic_search_requires_query() {
        let db = Database::open_in_memory().unwrap();
        let (gateway, model) = MockModel::replying(|_| Ok(String::new())).build();
        assert!(matches!(
            semantic_search(&gateway, &db, "u1", "  ", Some(3)).await,
            Err(Error::Validation(_))
        ));
        assert_eq!(model.embed_calls(), 0);
    }
}
