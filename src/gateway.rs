//! Generation Gateway
//!
//! Wraps a [`LanguageModel`] provider with the cleanup every caller needs:
//! fence stripping, JSON extraction, the parse/unavailable error split and
//! embedding input checks.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::json_scan;

/// Incremental text chunks from a streaming call. Dropping it closes the
/// underlying connection.
pub type TextStream = BoxStream<'static, Result<String>>;

/// The external text and embedding capability.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String>;

    async fn generate_stream(&self, prompt: &str) -> Result<TextStream>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

#[derive(Clone)]
pub struct Gateway {
    model: Arc<dyn LanguageModel>,
}

impl Gateway {
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self { model }
    }

    /// Free-text task: fences removed, whitespace trimmed.
    pub async fn generate_text(&self, prompt: &str) -> Result<String> {
        let raw = self.model.generate(prompt).await?;
        Ok(strip_fences(&raw).trim().to_string())
    }

    /// Structured task: parse the reply as `T`, extracting the first
    /// well-formed JSON span when the whole reply does not parse.
    pub async fn generate_json<T: DeserializeOwned>(&self, prompt: &str) -> Result<T> {
        let raw = self.model.generate(prompt).await?;
        parse_structured(&raw)
    }

    pub async fn stream_text(&self, prompt: &str) -> Result<TextStream> {
        self.model.generate_stream(prompt).await
    }

    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if text.trim().is_empty() {
            return Err(Error::Validation("cannot embed empty text".into()));
        }
        let vector = self.model.embed(text).await?;
        if vector.is_empty() {
            return Err(Error::GenerationParse("provider returned an empty embedding".into()));
        }
        Ok(vector)
    }
}

/// Remove markdown code fences (```json, ```JSON, ```), keeping their content.
pub fn strip_fences(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = rest.find("```") {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + 3..];
        let tag_len = rest
            .char_indices()
            .take_while(|(_, c)| c.is_ascii_alphabetic())
            .count();
        if rest[..tag_len].eq_ignore_ascii_case("json") {
            rest = &rest[tag_len..];
        }
    }
    out.push_str(rest);
    out
}

pub fn parse_structured<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let cleaned = strip_fences(raw);
    let trimmed = cleaned.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Ok(value);
    }
    json_scan::find_json(trimmed).ok_or_else(|| {
        let preview: String = trimmed.chars().take(120).collect();
        Error::GenerationParse(format!("no usable JSON in model output: {}", preview))
    })
}

// ============ Provider Streaming ============

/// Payload of one server-sent-events line, `None` for comments, other
/// fields and the `[DONE]` sentinel.
pub fn sse_data(line: &str) -> Option<&str> {
    let data = line.trim_end_matches(['\r', '\n']).strip_prefix("data:")?.trim_start();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    Some(data)
}

/// Split an SSE response body into lines and map each `data:` payload to
/// text with `extract`. Lines are decoded only once complete, so multi-byte
/// characters split across network chunks survive. The first error ends the
/// stream.
pub fn sse_text_stream<F>(response: reqwest::Response, extract: F) -> TextStream
where
    F: Fn(&str) -> Result<Option<String>> + Send + 'static,
{
    let mut body = response.bytes_stream();
    async_stream::stream! {
        let mut pending: Vec<u8> = Vec::new();
        let mut failed = false;

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => pending.extend_from_slice(&bytes),
                Err(e) => {
                    yield Err(Error::from(e));
                    failed = true;
                    break;
                }
            }

            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let Some(data) = sse_data(&line) else { continue };
                match extract(data) {
                    Ok(Some(text)) if !text.is_empty() => {
                        yield Ok(text);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        yield Err(e);
                        failed = true;
                        break;
                    }
                }
            }
            if failed {
                break;
            }
        }

        if !failed && !pending.is_empty() {
            let line = String::from_utf8_lossy(&pending).into_owned();
            if let Some(data) = sse_data(&line) {
                match extract(data) {
                    Ok(Some(text)) if !text.is_empty() => {
                        yield Ok(text);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        yield Err(e);
                    }
                }
            }
        }
    }
    .boxed()
}
