use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::gateway::{self, LanguageModel, TextStream};

pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-004";

const REQUEST_TIMEOUT_SECS: u64 = 90; // 90 second timeout for generation requests
const CONNECT_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
struct Content {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

impl Content {
    fn user(text: &str) -> Self {
        Self {
            role: Some("user".to_string()),
            parts: vec![Part { text: text.to_string() }],
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
}

#[derive(Debug, Serialize)]
struct EmbedRequest {
    model: String,
    content: Content,
}

#[derive(Debug, Deserialize)]
struct EmbedResponse {
    embedding: EmbeddingValues,
}

#[derive(Debug, Deserialize)]
struct EmbeddingValues {
    values: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct GeminiError {
    error: ErrorDetails,
}

#[derive(Debug, Deserialize)]
struct ErrorDetails {
    message: String,
    #[serde(default)]
    status: String,
}

/// Concatenated text of the first candidate; `None` when there is no candidate.
fn candidate_text(response: GenerateResponse) -> Option<String> {
    response.candidates.into_iter().next().map(|c| {
        c.content
            .parts
            .into_iter()
            .map(|p| p.text)
            .collect::<String>()
    })
}

/// Text carried by one streamed `GenerateContentResponse` chunk.
fn stream_chunk_text(data: &str) -> Result<Option<String>> {
    if let Ok(err) = serde_json::from_str::<GeminiError>(data) {
        return Err(Error::GenerationUnavailable(format!(
            "Gemini stream error: {}",
            err.error.message
        )));
    }
    let chunk: GenerateResponse = serde_json::from_str(data)
        .map_err(|e| Error::GenerationParse(format!("unreadable Gemini stream chunk: {}", e)))?;
    Ok(candidate_text(chunk))
}

pub struct GeminiClient {
    client: Client,
    api_key: String,
    api_base: String,
    model: String,
    embedding_model: String,
}

impl GeminiClient {
    pub fn new(api_key: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
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

    pub fn with_api_base(mut self, base: Option<String>) -> Self {
        if let Some(base) = base {
            self.api_base = base.trim_end_matches('/').to_string();
        }
        self
    }

    fn endpoint(&self, model: &str, method: &str) -> String {
        format!("{}/models/{}:{}", self.api_base, model, method)
    }

    async fn post<T: Serialize>(&self, url: &str, body: &T) -> Result<Response> {
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<GeminiError>(&error_text)
                .map(|e| format!("{} {}", e.error.status, e.error.message).trim().to_string())
                .unwrap_or(error_text);
            return Err(Error::GenerationUnavailable(format!(
                "Gemini API error ({}): {}",
                status, message
            )));
        }
        Ok(response)
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        let request = GenerateRequest {
            contents: vec![Content::user(prompt)],
        };
        let response = self
            .post(&self.endpoint(&self.model, "generateContent"), &request)
            .await?;
        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| Error::GenerationParse(format!("unreadable Gemini response: {}", e)))?;

        candidate_text(body).ok_or_else(|| Error::GenerationParse("No candidates from Gemini".into()))
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TextStream> {
        let request = GenerateRequest {
            contents: vec![Content::user(prompt)],
        };
        let url = format!("{}?alt=sse", self.endpoint(&self.model, "streamGenerateContent"));
        let response = self.post(&url, &request).await?;
        Ok(gateway::sse_text_stream(response, stream_chunk_text))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let request = EmbedRequest {
            model: format!("models/{}", self.embedding_model),
            content: Content {
                role: None,
                parts: vec![Part { text: text.to_string() }],
            },
        };
        let response = self
            .post(&self.endpoint(&self.embedding_model, "embedContent"), &request)
            .await?;
        let body: EmbedResponse = response
            .json()
            .await
            .map_err(|e| Error::GenerationParse(format!("unreadable Gemini embedding: {}", e)))?;
        Ok(body.embedding.values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_text_joins_parts() {
        let body: GenerateResponse = serde_json::from_str(
            r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"The map "},{"text":"burned."}]},"finishReason":"STOP"}]}"#,
        )
        .unwrap();
        assert_eq!(candidate_text(body).as_deref(), Some("The map burned."));

        let empty: GenerateResponse = serde_json::from_str(r#"{"promptFeedback":{}}"#).unwrap();
        assert_eq!(candidate_text(empty), None);
    }

    #[test]
    fn test_stream_chunk_text() {
        let text = stream_chunk_text(r#"{"candidates":[{"content":{"parts":[{"text":"{\"agent\""}]}}]}"#)
            .unwrap();
        assert_eq!(text.as_deref(), Some("{\"agent\""));

        let err = stream_chunk_text(r#"{"error":{"code":429,"message":"Quota exceeded","status":"RESOURCE_EXHAUSTED"}}"#)
            .unwrap_err();
        assert!(matches!(err, Error::GenerationUnavailable(_)));
    }

    #[test]
    fn test_endpoints_and_overrides() {
        let client = GeminiClient::new("key")
            .unwrap()
            .with_model(Some("gemini-1.5-pro".into()))
            .with_api_base(Some("http://localhost:8080/v1beta/".into()));
        assert_eq!(
            client.endpoint(&client.model, "generateContent"),
            "http://localhost:8080/v1beta/models/gemini-1.5-pro:generateContent"
        );
        assert_eq!(client.embedding_model, DEFAULT_EMBEDDING_MODEL);
    }

    #[test]
    fn test_embed_request_shape() {
        let request = EmbedRequest {
            model: "models/text-embedding-004".into(),
            content: Content {
                role: None,
                parts: vec![Part { text: "hi".into() }],
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["content"]["parts"][0]["text"], "hi");
        assert!(json["content"].get("role").is_none());
    }
}
