//! Thematic tagging with a local keyword fallback

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::logging;
use crate::prompts;

pub const THEME_VOCABULARY: &[&str] = &["Memory", "Identity", "Time", "Nature", "Technology"];
pub const MOTIF_VOCABULARY: &[&str] = &["Light", "Shadow", "Water"];

const MAX_TAGS: usize = 5;
const COMPLEX_THRESHOLD_CHARS: usize = 1000;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StoryAnalysis {
    #[serde(default)]
    pub themes: Vec<String>,
    #[serde(default)]
    pub emotional_valence: String,
    #[serde(default)]
    pub motifs: Vec<String>,
    #[serde(default)]
    pub cultural_markers: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisOutcome {
    pub analysis: StoryAnalysis,
    pub is_heuristic: bool,
}

/// Vocabulary entries that occur in `text`, case-insensitively, in vocabulary order.
pub fn keyword_matches(text: &str, vocabulary: &[&str]) -> Vec<String> {
    let lowered = text.to_lowercase();
    vocabulary
        .iter()
        .filter(|word| lowered.contains(&word.to_lowercase()))
        .map(|word| word.to_string())
        .collect()
}

pub fn heuristic_analysis(text: &str) -> StoryAnalysis {
    let valence = if text.chars().count() > COMPLEX_THRESHOLD_CHARS {
        "Complex"
    } else {
        "Neutral"
    };
    StoryAnalysis {
        themes: keyword_matches(text, THEME_VOCABULARY),
        emotional_valence: valence.to_string(),
        motifs: keyword_matches(text, MOTIF_VOCABULARY),
        cultural_markers: Vec::new(),
    }
}

/// Generation failures degrade to [`heuristic_analysis`]; only missing
/// content is an error.
pub async fn analyze_content(gateway: &Gateway, content: &str) -> Result<AnalysisOutcome> {
    if content.trim().is_empty() {
        return Err(Error::Validation("Content is required".into()));
    }
    match request_analysis(gateway, content).await {
        Ok(analysis) => Ok(AnalysisOutcome {
            analysis,
            is_heuristic: false,
        }),
        Err(e) if e.is_generation_failure() => {
            logging::log_error(None, &format!("Analysis fell back to heuristics: {}", e));
            Ok(AnalysisOutcome {
                analysis: heuristic_analysis(content),
                is_heuristic: true,
            })
        }
        Err(e) => Err(e),
    }
}

async fn request_analysis(gateway: &Gateway, content: &str) -> Result<StoryAnalysis> {
    let mut analysis: StoryAnalysis = gateway.generate_json(&prompts::analysis(content)).await?;
    if analysis.themes.is_empty() && analysis.motifs.is_empty() && analysis.emotional_valence.trim().is_empty() {
        return Err(Error::GenerationParse(
            "analysis reply carried no themes, motifs or valence".into(),
        ));
    }
    analysis.themes.truncate(MAX_TAGS);
    analysis.motifs.truncate(MAX_TAGS);
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockModel;

    #[test]
    fn test_keyword_matches_case_insensitive() {
        let found = keyword_matches("the MEMORY of light on water", THEME_VOCABULARY);
        assert_eq!(found, vec!["Memory"]);
        let motifs = keyword_matches("the MEMORY of light on water", MOTIF_VOCABULARY);
        assert_eq!(motifs, vec!["Light", "Water"]);
    }

    #[test]
    fn test_heuristic_valence_threshold() {
        assert_eq!(heuristic_analysis("short").emotional_valence, "Neutral");
        assert_eq!(heuristic_analysis(&"x".repeat(1001)).emotional_valence, "Complex");
        assert!(heuristic_analysis("nothing matches").themes.is_empty());
    }

    #[tokio::test]
    async fn test_off_contract_object_falls_back() {
        let (gateway, _) = MockModel::replying(|_| Ok(r#"{"error":"content blocked"}"#.into())).build();
        let outcome = analyze_content(&gateway, "Memory and water and light").await.unwrap();

        assert!(outcome.is_heuristic);
        assert_eq!(outcome.analysis.themes, vec!["Memory"]);
        assert_eq!(outcome.analysis.motifs, vec!["Light", "Water"]);
        assert_eq!(outcome.analysis.emotional_valence, "Neutral");
    }

    #[tokio::test]
    async fn test_malformed_reply_uses_vocabulary_only() {
        let (gateway, _) =
            MockModel::replying(|_| Ok("Themes: grief, Identity, exile. Mood: dark".into())).build();
        let text = "Her identity dissolved with time, like shadow over the river and its memory.";
        let outcome = analyze_content(&gateway, text).await.unwrap();

        assert!(outcome.is_heuristic);
        assert!(!outcome.analysis.themes.is_empty());
        for theme in &outcome.analysis.themes {
            assert!(THEME_VOCABULARY.contains(&theme.as_str()), "unexpected theme {}", theme);
        }
        assert_eq!(outcome.analysis.motifs, vec!["Shadow"]);
    }

    #[tokio::test]
    async fn test_unavailable_provider_falls_back() {
        let (gateway, _) =
            MockModel::replying(|_| Err(Error::GenerationUnavailable("quota".into()))).build();
        let outcome = analyze_content(&gateway, "Nature, always nature").await.unwrap();
        assert!(outcome.is_heuristic);
        assert_eq!(outcome.analysis.themes, vec!["Nature"]);
    }

    #[tokio::test]
    async fn test_model_tags_are_truncated() {
        let (gateway, _) = MockModel::replying(|_| {
            Ok(r#"{"themes":["a","b","c","d","e","f"],"emotional_valence":"Tense","motifs":["m"],"cultural_markers":["Eid"]}"#.into())
        })
        .build();
        let outcome = analyze_content(&gateway, "story").await.unwrap();
        assert!(!outcome.is_heuristic);
        assert_eq!(outcome.analysis.themes.len(), 5);
        assert_eq!(outcome.analysis.cultural_markers, vec!["Eid"]);
    }

    #[tokio::test]
    async fn test_empty_content_is_validation_error() {
        let (gateway, model) = MockModel::replying(|_| Ok("{}".into())).build();
        assert!(matches!(
            analyze_content(&gateway, "  ").await,
            Err(Error::Validation(_))
        ));
        assert!(model.prompts().is_empty());
    }
}
