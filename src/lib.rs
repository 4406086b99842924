pub mod analysis;
pub mod calibration;
pub mod chorus;
pub mod config;
pub mod db;
pub mod debate;
pub mod error;
pub mod gateway;
pub mod gemini;
pub mod generation;
pub mod json_scan;
pub mod logging;
pub mod openai;
pub mod prompts;
pub mod search;
pub mod stories;
pub mod tensor;

#[cfg(test)]
mod testing;

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Query, Request, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{async_trait, Json, Router};
use futures::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use analysis::StoryAnalysis;
use calibration::CalibrationEngine;
use chorus::{Agent, ChorusOrchestrator, ChorusSession, ChorusStage, DebateRecord, RawBeat, StoryStructure, Thread};
use db::Database;
use error::ApiError;
use gateway::{Gateway, LanguageModel};
use generation::{AmbientContext, ChatTurn, Premise, ReviewKind};
use stories::{NewStory, StoryEdit, StoryService};
use tensor::{TensorStore, UserTensor};

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============ App State ============

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub tensors: TensorStore,
    pub gateway: Gateway,
    pub chorus: ChorusOrchestrator,
    pub calibration: CalibrationEngine,
    pub stories: StoryService,
}

impl AppState {
    pub fn new(db: Database, model: Arc<dyn LanguageModel>, embedding_min_chars: usize) -> Self {
        let gateway = Gateway::new(model);
        let tensors = TensorStore::new(db.clone());
        Self {
            chorus: ChorusOrchestrator::new(gateway.clone()),
            calibration: CalibrationEngine::new(gateway.clone(), tensors.clone()),
            stories: StoryService::new(db.clone(), gateway.clone(), embedding_min_chars),
            db,
            tensors,
            gateway,
        }
    }

    async fn tensor_for(&self, user_id: &str, fallback: &str) -> ApiResult<UserTensor> {
        self.tensors
            .get(user_id)
            .await
            .map_err(|e| ApiError::task(e, fallback))
    }
}

// ============ Router ============

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        // Tensor
        .route("/api/tensor", get(get_tensor).post(save_tensor).patch(merge_tensor))
        .route("/api/tensor/calibrate", post(calibrate))
        // Generation
        .route("/api/generate-premise", post(generate_premise))
        .route("/api/generate-scene", post(generate_scene))
        .route("/api/generate-suggestion", post(generate_suggestion))
        .route("/api/generate-suggestions", post(generate_suggestions))
        .route("/api/generate-prompts", post(generate_prompts))
        .route("/api/mirror/rewrite", post(mirror_rewrite))
        .route("/api/mirror/unwritten", post(mirror_unwritten))
        .route("/api/analyze-voice", post(analyze_voice))
        .route("/api/analyze", post(analyze))
        .route("/api/analyze-writing", post(analyze_writing))
        .route("/api/chat-with-context", post(chat_with_context))
        .route("/api/antimatter/confront", post(confront_antimatter))
        // Chorus
        .route("/api/chorus/debate", post(chorus_debate))
        .route("/api/chorus/structure", post(chorus_structure))
        .route("/api/chorus/generate", post(chorus_generate))
        .route("/api/chorus/weave", post(chorus_weave))
        .route("/api/chorus/compose", post(chorus_compose))
        // Stories and search
        .route("/api/search/semantic", post(semantic_search))
        .route(
            "/api/stories",
            get(list_stories)
                .post(create_story)
                .put(update_story)
                .delete(delete_story),
        )
        .route("/api/upload", post(upload_story))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

// ============ Extractors ============

/// `Json` whose rejections use the `{error}` body like every other failure.
pub struct ApiJson<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> ApiResult<Self> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(json_rejection(rejection)),
        }
    }
}

fn json_rejection(rejection: JsonRejection) -> ApiError {
    ApiError::bad_request(format!("Invalid request body: {}", rejection.body_text()))
}

#[derive(Debug, Deserialize)]
struct UserQuery {
    #[serde(alias = "userId")]
    user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StoryQuery {
    #[serde(alias = "storyId")]
    story_id: Option<String>,
}

/// Body for tasks that need nothing beyond the user's tensor
#[derive(Debug, Deserialize)]
struct UserRequest {
    #[serde(alias = "userId", default)]
    user_id: String,
}

// ============ Health ============

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "quantum-storytelling",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ============ Tensor ============

async fn get_tensor(State(state): State<AppState>, Query(query): Query<UserQuery>) -> ApiResult<Json<Value>> {
    let user_id = query.user_id.unwrap_or_default();
    let tensor = state.tensor_for(&user_id, "Failed to fetch tensor").await?;
    Ok(Json(json!({ "tensor": tensor })))
}

async fn save_tensor(State(state): State<AppState>, ApiJson(tensor): ApiJson<UserTensor>) -> ApiResult<Json<Value>> {
    let replaced = state
        .tensors
        .replace(tensor)
        .await
        .map_err(|e| ApiError::task(e, "Failed to update tensor"))?;
    Ok(Json(json!({
        "success": true,
        "message": "Tensor updated successfully",
        "upserted": !replaced,
    })))
}

#[derive(Debug, Deserialize)]
struct MergeRequest {
    #[serde(alias = "userId", default)]
    user_id: String,
    #[serde(default)]
    updates: Value,
}

async fn merge_tensor(State(state): State<AppState>, ApiJson(req): ApiJson<MergeRequest>) -> ApiResult<Json<Value>> {
    let tensor = state
        .tensors
        .merge(&req.user_id, &req.updates)
        .await
        .map_err(|e| ApiError::task(e, "Failed to update tensor"))?;
    Ok(Json(json!({ "tensor": tensor })))
}

#[derive(Debug, Deserialize)]
struct CalibrateRequest {
    #[serde(alias = "userId", default)]
    user_id: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    history: Vec<ChatTurn>,
}

async fn calibrate(State(state): State<AppState>, ApiJson(req): ApiJson<CalibrateRequest>) -> ApiResult<Json<Value>> {
    let outcome = state
        .calibration
        .calibrate(&req.user_id, &req.message, &req.history)
        .await
        .map_err(|e| ApiError::task(e, "Failed to process calibration"))?;
    Ok(Json(json!(outcome)))
}

// ============ Generation ============

async fn generate_premise(State(state): State<AppState>, ApiJson(req): ApiJson<UserRequest>) -> ApiResult<Json<Value>> {
    const FALLBACK: &str = "Failed to generate premise";
    let tensor = state.tensor_for(&req.user_id, FALLBACK).await?;
    let premise = generation::generate_premise(&state.gateway, &tensor)
        .await
        .map_err(|e| ApiError::task(e, FALLBACK))?;
    Ok(Json(json!(premise)))
}

#[derive(Debug, Deserialize)]
struct SceneRequest {
    #[serde(alias = "userId", default)]
    user_id: String,
    premise: Premise,
}

async fn generate_scene(State(state): State<AppState>, ApiJson(req): ApiJson<SceneRequest>) -> ApiResult<Json<Value>> {
    const FALLBACK: &str = "Failed to generate scene";
    let tensor = state.tensor_for(&req.user_id, FALLBACK).await?;
    let scene = generation::generate_scene(&state.gateway, &tensor, &req.premise)
        .await
        .map_err(|e| ApiError::task(e, FALLBACK))?;
    Ok(Json(json!(scene)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SuggestionRequest {
    #[serde(alias = "user_id", default)]
    user_id: String,
    #[serde(alias = "current_text", default)]
    current_text: String,
    #[serde(alias = "ambient_context", default)]
    ambient_context: Option<AmbientContext>,
}

async fn generate_suggestion(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<SuggestionRequest>,
) -> ApiResult<Json<Value>> {
    const FALLBACK: &str = "Failed to generate suggestion";
    let tensor = state.tensor_for(&req.user_id, FALLBACK).await?;
    let ambient = req.ambient_context.unwrap_or_default();
    let suggestion = generation::suggest_continuation(&state.gateway, &tensor, &req.current_text, &ambient)
        .await
        .map_err(|e| ApiError::task(e, FALLBACK))?;
    Ok(Json(json!({ "suggestion": suggestion })))
}

async fn generate_suggestions(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<UserRequest>,
) -> ApiResult<Json<Value>> {
    const FALLBACK: &str = "Failed to generate suggestions";
    let tensor = state.tensor_for(&req.user_id, FALLBACK).await?;
    let suggestions = generation::conversation_starters(&state.gateway, &tensor)
        .await
        .map_err(|e| ApiError::task(e, FALLBACK))?;
    Ok(Json(json!({ "suggestions": suggestions })))
}

async fn generate_prompts(State(state): State<AppState>, ApiJson(req): ApiJson<UserRequest>) -> ApiResult<Json<Value>> {
    const FALLBACK: &str = "Failed to generate prompt";
    let tensor = state.tensor_for(&req.user_id, FALLBACK).await?;
    let prompt = generation::writing_prompt(&state.gateway, &tensor)
        .await
        .map_err(|e| ApiError::task(e, FALLBACK))?;
    Ok(Json(json!({ "prompt": prompt })))
}

#[derive(Debug, Deserialize)]
struct TextRequest {
    #[serde(alias = "userId", default)]
    user_id: String,
    #[serde(default)]
    text: String,
}

async fn mirror_rewrite(State(state): State<AppState>, ApiJson(req): ApiJson<TextRequest>) -> ApiResult<Json<Value>> {
    const FALLBACK: &str = "Failed to rewrite text";
    let tensor = state.tensor_for(&req.user_id, FALLBACK).await?;
    let rewritten = generation::rewrite_in_voice(&state.gateway, &tensor, &req.text)
        .await
        .map_err(|e| ApiError::task(e, FALLBACK))?;
    Ok(Json(json!({ "rewritten": rewritten })))
}

async fn mirror_unwritten(State(state): State<AppState>, ApiJson(req): ApiJson<UserRequest>) -> ApiResult<Json<Value>> {
    const FALLBACK: &str = "Failed to generate unwritten story";
    let tensor = state.tensor_for(&req.user_id, FALLBACK).await?;
    let story = generation::unwritten_story(&state.gateway, &tensor)
        .await
        .map_err(|e| ApiError::task(e, FALLBACK))?;
    Ok(Json(json!(story)))
}

async fn analyze_voice(State(state): State<AppState>, ApiJson(req): ApiJson<TextRequest>) -> ApiResult<Json<Value>> {
    const FALLBACK: &str = "Failed to analyze voice";
    let tensor = state.tensor_for(&req.user_id, FALLBACK).await?;
    let analysis = generation::analyze_voice(&state.gateway, &tensor, &req.text)
        .await
        .map_err(|e| ApiError::task(e, FALLBACK))?;
    Ok(Json(json!(analysis)))
}

#[derive(Debug, Deserialize)]
struct AnalyzeRequest {
    #[serde(default)]
    content: String,
}

async fn analyze(State(state): State<AppState>, ApiJson(req): ApiJson<AnalyzeRequest>) -> ApiResult<Json<Value>> {
    let outcome = analysis::analyze_content(&state.gateway, &req.content)
        .await
        .map_err(|e| ApiError::task(e, "Failed to analyze story"))?;
    Ok(Json(json!({
        "success": true,
        "analysis": outcome.analysis,
        "is_heuristic": outcome.is_heuristic,
    })))
}

#[derive(Debug, Deserialize)]
struct ReviewRequest {
    #[serde(alias = "userId", default)]
    user_id: String,
    #[serde(default)]
    content: String,
    #[serde(rename = "type")]
    kind: ReviewKind,
}

async fn analyze_writing(State(state): State<AppState>, ApiJson(req): ApiJson<ReviewRequest>) -> ApiResult<Json<Value>> {
    const FALLBACK: &str = "Failed to analyze writing";
    let tensor = state.tensor_for(&req.user_id, FALLBACK).await?;
    let review = generation::review_writing(&state.gateway, &tensor, &req.content, req.kind)
        .await
        .map_err(|e| ApiError::task(e, FALLBACK))?;
    Ok(Json(json!(review)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChatRequest {
    #[serde(alias = "user_id", default)]
    user_id: String,
    #[serde(default)]
    message: String,
    #[serde(alias = "current_text", default)]
    current_text: String,
    #[serde(default)]
    history: Vec<ChatTurn>,
}

async fn chat_with_context(State(state): State<AppState>, ApiJson(req): ApiJson<ChatRequest>) -> ApiResult<Json<Value>> {
    const FALLBACK: &str = "Failed to generate reply";
    let tensor = state.tensor_for(&req.user_id, FALLBACK).await?;
    let reply = generation::chat_with_context(&state.gateway, &tensor, &req.message, &req.current_text, &req.history)
        .await
        .map_err(|e| ApiError::task(e, FALLBACK))?;
    Ok(Json(json!({ "reply": reply })))
}

#[derive(Debug, Deserialize)]
struct AntimatterRequest {
    #[serde(default)]
    antimatter: Vec<String>,
}

async fn confront_antimatter(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<AntimatterRequest>,
) -> Json<Value> {
    let confrontation = generation::confront_antimatter(&state.gateway, &req.antimatter).await;
    Json(json!(confrontation))
}

// ============ Chorus ============

/// A debate turn as sent back by a client; unknown agents are dropped.
#[derive(Debug, Deserialize)]
struct TranscriptEntry {
    #[serde(default)]
    agent: String,
    #[serde(default)]
    content: String,
}

fn transcript(entries: Vec<TranscriptEntry>) -> Vec<DebateRecord> {
    entries
        .into_iter()
        .filter_map(|entry| {
            Agent::from_str(&entry.agent).map(|agent| DebateRecord {
                agent,
                content: entry.content,
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct ParticleRequest {
    #[serde(alias = "userId", default)]
    user_id: String,
    #[serde(default)]
    particle: String,
    #[serde(default)]
    history: Vec<TranscriptEntry>,
}

async fn chorus_debate(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ParticleRequest>,
) -> ApiResult<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    const FALLBACK: &str = "Failed to initiate debate";
    let tensor = state.tensor_for(&req.user_id, FALLBACK).await?;

    let mut session = ChorusSession::default();
    session
        .advance(ChorusStage::Debating)
        .map_err(|e| ApiError::task(e, FALLBACK))?;
    let records = state
        .chorus
        .debate(&tensor, &req.particle)
        .await
        .map_err(|e| ApiError::task(e, FALLBACK))?;

    let user_id = req.user_id;
    let events = async_stream::stream! {
        let mut records = Box::pin(records);
        let mut emitted = 0usize;

        while let Some(item) = records.next().await {
            match item {
                Ok(record) => match Event::default().event("record").json_data(&record) {
                    Ok(event) => {
                        emitted += 1;
                        yield Ok::<Event, Infallible>(event);
                    }
                    Err(e) => tracing::warn!("Skipping unencodable debate record: {}", e),
                },
                Err(e) => {
                    logging::log_error(Some(&user_id), &format!("Debate stream failed: {}", e));
                    session.fail();
                    yield Ok::<Event, Infallible>(Event::default()
                        .event("error")
                        .data(json!({ "error": "Debate interrupted" }).to_string()));
                    break;
                }
            }
        }

        if session.stage() == ChorusStage::Debating {
            session.fail();
        }
        logging::log_chorus(Some(&user_id), &format!("Debate closed after {} records", emitted));
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn chorus_structure(
    State(state): State<AppState>,
    ApiJson(req): ApiJson<ParticleRequest>,
) -> ApiResult<Json<StoryStructure>> {
    const FALLBACK: &str = "Failed to structure story";
    let tensor = state.tensor_for(&req.user_id, FALLBACK).await?;
    let structure = state
        .chorus
        .structure(&tensor, &req.particle, &transcript(req.history))
        .await
        .map_err(|e| ApiError::task(e, FALLBACK))?;
    Ok(Json(structure))
}

#[derive(Debug, Deserialize)]
struct ThreadsRequest {
    #[serde(alias = "userId", default)]
    user_id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    beats: Vec<RawBeat>,
}

async fn chorus_generate(State(state): State<AppState>, ApiJson(req): ApiJson<ThreadsRequest>) -> ApiResult<Json<Value>> {
    const FALLBACK: &str = "Failed to generate story threads";
    let structure = StoryStructure::from_request(req.title, req.beats).map_err(|e| ApiError::task(e, FALLBACK))?;
    let tensor = state.tensor_for(&req.user_id, FALLBACK).await?;
    let threads = state
        .chorus
        .generate_threads(&tensor, &structure)
        .await
        .map_err(|e| ApiError::task(e, FALLBACK))?;
    Ok(Json(json!({ "success": true, "threads": threads })))
}

#[derive(Debug, Deserialize)]
struct WeaveRequest {
    #[serde(default)]
    title: String,
    #[serde(default)]
    threads: Vec<Thread>,
}

async fn chorus_weave(State(state): State<AppState>, ApiJson(req): ApiJson<WeaveRequest>) -> ApiResult<Json<Value>> {
    let story = state
        .chorus
        .weave(&req.title, req.threads)
        .await
        .map_err(|e| ApiError::task(e, "Weaving failed"))?;
    Ok(Json(json!({ "success": true, "story": story })))
}

async fn chorus_compose(State(state): State<AppState>, ApiJson(req): ApiJson<ParticleRequest>) -> ApiResult<Json<Value>> {
    const FALLBACK: &str = "Failed to compose story";
    let tensor = state.tensor_for(&req.user_id, FALLBACK).await?;
    let mut session = ChorusSession::default();
    let artifact = state
        .chorus
        .compose(&mut session, &tensor, &req.particle, &transcript(req.history))
        .await
        .map_err(|e| ApiError::task(e, FALLBACK))?;
    Ok(Json(json!(artifact)))
}

// ============ Search ============

#[derive(Debug, Deserialize)]
struct SearchRequest {
    #[serde(alias = "userId", default)]
    user_id: String,
    #[serde(default)]
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

async fn semantic_search(State(state): State<AppState>, ApiJson(req): ApiJson<SearchRequest>) -> ApiResult<Json<Value>> {
    let results = search::semantic_search(&state.gateway, &state.db, &req.user_id, &req.query, req.limit)
        .await
        .map_err(|e| ApiError::task(e, "Failed to perform search"))?;
    Ok(Json(json!({ "results": results })))
}

// ============ Stories ============

async fn list_stories(State(state): State<AppState>, Query(query): Query<UserQuery>) -> ApiResult<Json<Value>> {
    let user_id = query.user_id.unwrap_or_default();
    let stories = state
        .stories
        .list(&user_id)
        .await
        .map_err(|e| ApiError::task(e, "Failed to load stories"))?;
    Ok(Json(json!({ "stories": stories })))
}

async fn create_story(State(state): State<AppState>, ApiJson(new): ApiJson<NewStory>) -> ApiResult<Json<Value>> {
    let story = state
        .stories
        .create(new)
        .await
        .map_err(|e| ApiError::task(e, "Failed to save story"))?;
    Ok(Json(json!({
        "success": true,
        "story_id": story.id,
        "message": "Story saved successfully",
    })))
}

async fn update_story(State(state): State<AppState>, ApiJson(edit): ApiJson<StoryEdit>) -> ApiResult<Json<Value>> {
    state
        .stories
        .update(edit)
        .await
        .map_err(|e| ApiError::task(e, "Failed to update story"))?;
    Ok(Json(json!({ "success": true, "message": "Story updated successfully" })))
}

async fn delete_story(State(state): State<AppState>, Query(query): Query<StoryQuery>) -> ApiResult<Json<Value>> {
    let story_id = query.story_id.unwrap_or_default();
    state
        .stories
        .delete(&story_id)
        .await
        .map_err(|e| ApiError::task(e, "Failed to delete story"))?;
    Ok(Json(json!({ "success": true, "message": "Story deleted successfully" })))
}

#[derive(Debug, Deserialize)]
struct UploadRequest {
    #[serde(alias = "userId", default)]
    user_id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    analysis: Option<StoryAnalysis>,
}

async fn upload_story(State(state): State<AppState>, ApiJson(req): ApiJson<UploadRequest>) -> ApiResult<Json<Value>> {
    let story = state
        .stories
        .import(&req.user_id, &req.title, &req.content, req.analysis)
        .await
        .map_err(|e| ApiError::task(e, "Failed to upload story"))?;
    Ok(Json(json!({
        "success": true,
        "story_id": story.id,
        "analysis": story.analysis,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transcript_drops_unknown_agents() {
        let records = transcript(vec![
            TranscriptEntry {
                agent: "THE POET".into(),
                content: "Rain.".into(),
            },
            TranscriptEntry {
                agent: "Narrator".into(),
                content: "Hi.".into(),
            },
        ]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].agent, Agent::Poet);
    }

    #[test]
    fn test_suggestion_request_accepts_both_spellings() {
        let camel: SuggestionRequest =
            serde_json::from_value(json!({"userId": "u", "currentText": "x"})).unwrap();
        let snake: SuggestionRequest =
            serde_json::from_value(json!({"user_id": "u", "current_text": "x"})).unwrap();
        assert_eq!(camel.user_id, snake.user_id);
        assert_eq!(camel.current_text, snake.current_text);
        assert!(camel.ambient_context.is_none());
    }
}
