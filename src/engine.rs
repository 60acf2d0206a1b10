//! the inference engine boundary.
//!
//! the session core never talks to a model directly. it hands an
//! [`InferenceEngine`] a model id to load, receives an opaque [`EngineHandle`]
//! back, and uses that handle for every generation until it is disposed.
//!
//! - [`ProviderEngine`](crate::provider::ProviderEngine) implements this over the `llm` crate.
//! - tests use a scripted engine that replays canned chunks.

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures_lite::Stream;
use serde::{Deserialize, Serialize};

use crate::conversation::Turn;
use crate::error::EngineError;

/// opaque reference to a loaded engine instance.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct EngineHandle {
    id: u64,
    model: Arc<str>,
}

impl EngineHandle {
    pub fn new(id: u64, model: impl Into<Arc<str>>) -> Self {
        Self { id, model: model.into() }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    pub temperature: f32,
    /// ask the engine to report token usage alongside the reply.
    pub include_usage: bool,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self { temperature: 0.7, include_usage: false }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }
}

/// one item of a streaming reply. end of stream is the stream ending.
#[derive(Clone, Debug, PartialEq)]
pub enum ReplyChunk {
    Delta(String),
    Usage(Usage),
}

pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<ReplyChunk, EngineError>> + Send>>;

/// callback an engine reports load progress through.
#[derive(Clone)]
pub struct ProgressSink(Arc<dyn Fn(f32, &str) + Send + Sync>);

impl ProgressSink {
    pub fn new(f: impl Fn(f32, &str) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    /// a sink that drops every report.
    pub fn ignore() -> Self {
        Self::new(|_, _| {})
    }

    pub fn report(&self, fraction: f32, text: &str) {
        (self.0)(fraction, text)
    }
}

impl fmt::Debug for ProgressSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ProgressSink")
    }
}

#[async_trait]
pub trait InferenceEngine: Send + Sync + 'static {
    /// instantiate `model`. may take seconds to minutes (weights download + compile).
    async fn load(&self, model: &str, progress: ProgressSink) -> Result<EngineHandle, EngineError>;

    async fn generate_streaming(
        &self,
        handle: &EngineHandle,
        messages: &[Turn],
        options: GenerateOptions,
    ) -> Result<ReplyStream, EngineError>;

    async fn generate_once(
        &self,
        handle: &EngineHandle,
        messages: &[Turn],
        options: GenerateOptions,
    ) -> Result<String, EngineError>;

    /// authoritative text of the last reply, when the engine keeps one.
    async fn final_transcript(&self, handle: &EngineHandle, model: &str) -> Result<String, EngineError>;

    /// release everything held for `handle`.
    async fn dispose(&self, handle: EngineHandle);

    /// total input budget of the loaded model, if the engine knows it.
    fn input_quota(&self, _handle: &EngineHandle) -> Option<usize> {
        None
    }

    /// how much of the input budget `messages` would use.
    fn measure_input(&self, _handle: &EngineHandle, _messages: &[Turn]) -> Option<usize> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_total_saturates() {
        let u = Usage { prompt_tokens: 12, completion_tokens: 30 };
        assert_eq!(u.total(), 42);
        let huge = Usage { prompt_tokens: u32::MAX, completion_tokens: 5 };
        assert_eq!(huge.total(), u32::MAX);
    }
}
