//! Single-shot generation tasks
//!
//! Each task composes its prompt from the tensor, calls the gateway once and
//! validates the reply shape. Provider and parse failures propagate to the
//! caller; only the antimatter confrontation has a local fallback.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::gateway::Gateway;
use crate::logging;
use crate::prompts;
use crate::tensor::UserTensor;

// ============ Task Shapes ============

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Premise {
    pub title: String,
    pub logline: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub stylistic_note: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationKind {
    Cultural,
    Linguistic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    #[serde(rename = "type")]
    pub kind: AnnotationKind,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneResponse {
    pub scene: String,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoiceAnalysis {
    pub match_score: f64,
    pub feedback: String,
    #[serde(default)]
    pub suggestion: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnwrittenStory {
    pub title: String,
    pub premise: String,
    pub opening: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Confrontation {
    pub insight: String,
    pub dare: String,
}

impl Confrontation {
    fn silent() -> Self {
        Self {
            insight: "The Shadow is silent.".to_string(),
            dare: "Write what you are afraid to know.".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AmbientContext {
    pub time_of_day: Option<String>,
    pub local_time: Option<String>,
}

/// One prior conversational turn. `role` is "user" for the writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    #[serde(alias = "text")]
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewKind {
    Feedback,
    Suggestions,
    Outline,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum WritingReview {
    Text { result: String },
    Suggestions { suggestions: Vec<String> },
}

const STARTER_COUNT: usize = 5;

fn require(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} is required", what)));
    }
    Ok(())
}

fn require_text(text: String, task: &str) -> Result<String> {
    if text.is_empty() {
        return Err(Error::GenerationParse(format!("{} came back empty", task)));
    }
    Ok(text)
}

// ============ Tasks ============

pub async fn generate_premise(gateway: &Gateway, tensor: &UserTensor) -> Result<Premise> {
    let premise: Premise = gateway.generate_json(&prompts::premise(tensor)).await?;
    require_text(premise.title.trim().to_string(), "premise title")?;
    logging::log_generation(Some(&tensor.user_id), &format!("Premise: {}", premise.title));
    Ok(premise)
}

pub async fn generate_scene(
    gateway: &Gateway,
    tensor: &UserTensor,
    premise: &Premise,
) -> Result<SceneResponse> {
    require(&premise.title, "Premise title")?;
    let scene: SceneResponse = gateway.generate_json(&prompts::scene(tensor, premise)).await?;
    require_text(scene.scene.trim().to_string(), "scene")?;
    logging::log_generation(
        Some(&tensor.user_id),
        &format!("Scene for '{}' with {} annotations", premise.title, scene.annotations.len()),
    );
    Ok(scene)
}

pub async fn suggest_continuation(
    gateway: &Gateway,
    tensor: &UserTensor,
    current_text: &str,
    ambient: &AmbientContext,
) -> Result<String> {
    let text = gateway
        .generate_text(&prompts::suggestion(tensor, current_text, ambient))
        .await?;
    let text = text.trim_matches('"').trim().to_string();
    require_text(text, "suggestion")
}

pub async fn rewrite_in_voice(gateway: &Gateway, tensor: &UserTensor, text: &str) -> Result<String> {
    require(text, "Text")?;
    let rewritten = gateway.generate_text(&prompts::rewrite(tensor, text)).await?;
    require_text(rewritten, "rewrite")
}

pub async fn analyze_voice(gateway: &Gateway, tensor: &UserTensor, text: &str) -> Result<VoiceAnalysis> {
    require(text, "Text")?;
    let mut analysis: VoiceAnalysis = gateway
        .generate_json(&prompts::voice_analysis(tensor, text))
        .await?;
    analysis.match_score = analysis.match_score.clamp(0.0, 100.0).round();
    Ok(analysis)
}

pub async fn unwritten_story(gateway: &Gateway, tensor: &UserTensor) -> Result<UnwrittenStory> {
    let story: UnwrittenStory = gateway.generate_json(&prompts::unwritten_story(tensor)).await?;
    require_text(story.opening.trim().to_string(), "unwritten story")?;
    logging::log_generation(Some(&tensor.user_id), &format!("Unwritten story: {}", story.title));
    Ok(story)
}

pub async fn conversation_starters(gateway: &Gateway, tensor: &UserTensor) -> Result<Vec<String>> {
    let starters: Vec<String> = gateway
        .generate_json(&prompts::conversation_starters(tensor))
        .await?;
    Ok(starters
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .take(STARTER_COUNT)
        .collect())
}

pub async fn writing_prompt(gateway: &Gateway, tensor: &UserTensor) -> Result<String> {
    let prompt = gateway.generate_text(&prompts::writing_prompt(tensor)).await?;
    require_text(prompt, "writing prompt")
}

pub async fn review_writing(
    gateway: &Gateway,
    tensor: &UserTensor,
    content: &str,
    kind: ReviewKind,
) -> Result<WritingReview> {
    require(content, "Content")?;
    let raw = gateway
        .generate_text(&prompts::writing_review(tensor, content, kind))
        .await?;

    if kind == ReviewKind::Suggestions {
        if let Some(suggestions) = crate::json_scan::find_json::<Vec<String>>(&raw) {
            return Ok(WritingReview::Suggestions { suggestions });
        }
    }
    Ok(WritingReview::Text {
        result: require_text(raw, "review")?,
    })
}

pub async fn chat_with_context(
    gateway: &Gateway,
    tensor: &UserTensor,
    message: &str,
    current_text: &str,
    history: &[ChatTurn],
) -> Result<String> {
    require(message, "Message")?;
    let reply = gateway
        .generate_text(&prompts::chat_with_context(tensor, message, current_text, history))
        .await?;
    require_text(reply, "chat reply")
}

/// Never fails: any generation problem yields the silent-shadow fallback.
pub async fn confront_antimatter(gateway: &Gateway, deleted: &[String]) -> Confrontation {
    let deleted: Vec<String> = deleted
        .iter()
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty())
        .collect();
    if deleted.is_empty() {
        return Confrontation::silent();
    }

    match gateway
        .generate_json::<Confrontation>(&prompts::antimatter(&deleted))
        .await
    {
        Ok(c) if !c.dare.trim().is_empty() => c,
        Ok(_) => Confrontation::silent(),
        Err(e) => {
            logging::log_error(None, &format!("Antimatter confrontation fell back: {}", e));
            Confrontation::silent()
        }
    }
}
