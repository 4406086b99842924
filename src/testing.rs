//! Scripted language model for unit tests.

use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::gateway::{Gateway, LanguageModel, TextStream};

type ReplyFn = Box<dyn Fn(&str) -> Result<String> + Send + Sync>;
type DelayFn = Box<dyn Fn(&str) -> Duration + Send + Sync>;
type EmbedFn = Box<dyn Fn(&str) -> Result<Vec<f32>> + Send + Sync>;

pub struct MockModel {
    reply: ReplyFn,
    delay: DelayFn,
    embedder: EmbedFn,
    chunks: Vec<String>,
    stream_error: bool,
    prompts: Mutex<Vec<String>>,
    embed_calls: AtomicUsize,
}

impl MockModel {
    pub fn replying<F>(reply: F) -> Self
    where
        F: Fn(&str) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            reply: Box::new(reply),
            delay: Box::new(|_| Duration::ZERO),
            embedder: Box::new(|text| Ok(vec![text.len() as f32, 1.0, 0.5])),
            chunks: Vec::new(),
            stream_error: false,
            prompts: Mutex::new(Vec::new()),
            embed_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_delay<F>(mut self, delay: F) -> Self
    where
        F: Fn(&str) -> Duration + Send + Sync + 'static,
    {
        self.delay = Box::new(delay);
        self
    }

    pub fn with_embeddings<F>(mut self, embedder: F) -> Self
    where
        F: Fn(&str) -> Result<Vec<f32>> + Send + Sync + 'static,
    {
        self.embedder = Box::new(embedder);
        self
    }

    pub fn with_stream(mut self, chunks: &[&str]) -> Self {
        self.chunks = chunks.iter().map(|c| c.to_string()).collect();
        self
    }

    /// End the scripted stream with a provider error
    pub fn with_stream_error(mut self) -> Self {
        self.stream_error = true;
        self
    }

    pub fn build(self) -> (Gateway, Arc<MockModel>) {
        let model = Arc::new(self);
        (Gateway::new(model.clone()), model)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn embed_calls(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }

    fn record(&self, prompt: &str) {
        if let Ok(mut prompts) = self.prompts.lock() {
            prompts.push(prompt.to_string());
        }
    }
}

#[async_trait]
impl LanguageModel for MockModel {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.record(prompt);
        let delay = (self.delay)(prompt);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        (self.reply)(prompt)
    }

    async fn generate_stream(&self, prompt: &str) -> Result<TextStream> {
        self.record(prompt);
        let mut items: Vec<Result<String>> = self.chunks.iter().cloned().map(Ok).collect();
        if self.stream_error {
            items.push(Err(Error::GenerationUnavailable("stream reset".into())));
        }
        Ok(futures::stream::iter(items).boxed())
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        (self.embedder)(text)
    }
}
