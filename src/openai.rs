use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::gateway::{self, LanguageModel, TextStream};

pub const DEFAULT_API_BASE: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

const REQUEST_TIMEOUT_SECS: u64 = 90; // 90 second timeout for generation requests
const TEMPERATURE: f32 = 0.9;
const MAX_TOKENS: u32 = 2048;

#[derive(Debug, Serialize, Clone)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: Delta,
}

#[derive(Debug, Deserialize, Default)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// Delta text of one streamed chat completion chunk
fn stream_chunk_text(data: &str) -> Result<Option<String>> {
    let chunk: ChatCompletionChunk = serde_json::from_str(data)
        .map_err(|e| Error::GenerationParse(format!("unreadable OpenAI stream chunk: {}", e)))?;
    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta.content))
}

pub struct OpenAIClient {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    embedding_model: String,
}

impl OpenAIClient {
    pub fn new(api_key: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key: api_key.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            model: DEFAULT_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
        })
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        if let Some(model) = model {
            self.model = model;
        }
        self
    }

    pub fn with_embedding_model(mut self, model: Option<String>) -> Self {
        if let Some(model) = model {
            self.embedding_model = model;
        }
        self
    }

    /// Any OpenAI-compatible server, e.g. `http://localhost:11434/v1`
    pub fn with_api_base(mut self, base: Option<String>) -> Self {
        if let Some(base) = base {
            self.api_base = base.trim_end_matches('/').to_string();
        }
        self
    }

    fn chat_request(&self, prompt: &str, stream: bool) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: self.model.clone(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            temperature: TEMPERATURE,
            max_tokens: Some(MAX_TOKENS),
            stream,
        }
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<Response> {
        let response = self
            .client
            .post(format!("{}{}", self.api_base, path))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            let reason = match status.as_u16() {
                401 => "Invalid API key".to_string(),
                429 => "Rate limited - too many requests".to_string(),
                _ => error_text,
            };
            return Err(Error::GenerationUnavailable(format!(
                "OpenAI API error ({}): {}",
                status, reason
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl LanguageModel for OpenAIClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let response = self
            .post("/chat/completions", &self.chat_request(prompt, false))
            .await?;
        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Error::GenerationParse(format!("unreadable OpenAI response: {}", e)))?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| Error::GenerationParse("No response from OpenAI".into()))
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TextStream> {
        let response = self
            .post("/chat/completions", &self.chat_request(prompt, true))
            .await?;
        Ok(gateway::sse_text_stream(response, stream_chunk_text))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbeddingRequest {
            model: &self.embedding_model,
            input: text,
        };
        let response = self.post("/embeddings", &request).await?;
        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| Error::GenerationParse(format!("unreadable OpenAI embedding: {}", e)))?;

        body.data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| Error::GenerationParse("No embedding from OpenAI".into()))
    }
}
