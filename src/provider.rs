//! [`InferenceEngine`] over the `llm` crate.
//!
//! "loading" a model builds an `llm` provider for it; the weights live on the
//! server, so progress jumps straight from connecting to ready. providers are
//! rebuilt lazily when a request asks for a different system prompt or
//! temperature, since `llm` fixes both at build time.
//!
//! the final transcript of a handle is the reply text exactly as the provider
//! delivered it, recorded while the reply is produced.
//!
//! api docs: https://docs.rs/llm
//!   - chat provider:   `llm::chat::ChatProvider`
//!   - streaming:       `llm::chat::{StreamResponse, StreamChoice, StreamDelta}`

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bevy::log::{debug, info};
use futures_lite::StreamExt;

use crate::config::ProviderConfig;
use crate::conversation::{Role, Turn};
use crate::engine::{
    EngineHandle, GenerateOptions, InferenceEngine, ProgressSink, ReplyChunk, ReplyStream,
};
use crate::error::EngineError;
use crate::{ChatMessage, LLMBuilder, LLMProvider, StreamChoice, StreamResponse};

struct Loaded {
    model: String,
    system: Option<String>,
    temperature: Option<f32>,
    provider: Arc<dyn LLMProvider>,
    last_reply: ReplySlot,
}

/// text of the latest reply of one handle.
type ReplySlot = Arc<Mutex<Option<String>>>;

fn lock_slot(slot: &ReplySlot) -> MutexGuard<'_, Option<String>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct ProviderEngine {
    config: ProviderConfig,
    next_id: AtomicU64,
    loaded: Mutex<HashMap<u64, Loaded>>,
}

impl ProviderEngine {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config, next_id: AtomicU64::new(1), loaded: Mutex::new(HashMap::new()) }
    }

    fn build(
        &self,
        model: &str,
        system: Option<&str>,
        temperature: Option<f32>,
    ) -> Result<Arc<dyn LLMProvider>, EngineError> {
        let mut b = LLMBuilder::new().backend(self.config.llm_backend()).model(model);
        if let Some(url) = self.config.normalized_base_url() {
            b = b.base_url(url);
        }
        if let Some(key) = &self.config.api_key {
            b = b.api_key(key.clone());
        }
        if let Some(system) = system {
            b = b.system(system);
        }
        if let Some(t) = temperature {
            b = b.temperature(t);
        }
        Ok(b.build()?.into())
    }

    fn loaded(&self) -> MutexGuard<'_, HashMap<u64, Loaded>> {
        self.loaded.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// provider for `handle`, rebuilt if the request's system prompt or
    /// temperature differ from the ones it was built with.
    fn provider_for(
        &self,
        handle: &EngineHandle,
        turns: &[Turn],
        options: GenerateOptions,
    ) -> Result<Arc<dyn LLMProvider>, EngineError> {
        let system = turns
            .iter()
            .find(|t| t.role == Role::System)
            .map(|t| t.content.clone());
        let temperature = Some(options.temperature);

        let mut loaded = self.loaded();
        let entry = loaded
            .get_mut(&handle.id())
            .ok_or(EngineError::UnknownHandle(handle.id()))?;
        if entry.system != system || entry.temperature != temperature {
            debug!(target: "bevy_llm_session", "provider: rebuilding '{}' for new system/temperature", entry.model);
            entry.provider = self.build(&entry.model, system.as_deref(), temperature)?;
            entry.system = system;
            entry.temperature = temperature;
        }
        Ok(entry.provider.clone())
    }

    /// reply slot of `handle`, emptied for the reply about to start.
    fn fresh_slot(&self, handle: &EngineHandle) -> Result<ReplySlot, EngineError> {
        let slot = self
            .loaded()
            .get(&handle.id())
            .map(|l| l.last_reply.clone())
            .ok_or(EngineError::UnknownHandle(handle.id()))?;
        *lock_slot(&slot) = None;
        Ok(slot)
    }
}

/// copy every delta into `slot` as it passes through.
fn record_reply(stream: ReplyStream, slot: ReplySlot) -> ReplyStream {
    Box::pin(stream.map(move |item| {
        if let Ok(ReplyChunk::Delta(text)) = &item {
            lock_slot(&slot).get_or_insert_with(String::new).push_str(text);
        }
        item
    }))
}

/// the provider carries the system prompt itself; only user/assistant turns are sent.
fn to_chat_messages(turns: &[Turn]) -> Vec<ChatMessage> {
    turns
        .iter()
        .filter_map(|t| match t.role {
            Role::System => None,
            Role::User => Some(ChatMessage::user().content(t.content.clone()).build()),
            Role::Assistant => Some(ChatMessage::assistant().content(t.content.clone()).build()),
        })
        .collect()
}

fn delta_text(resp: StreamResponse) -> String {
    resp.choices
        .into_iter()
        .filter_map(|StreamChoice { delta }| delta.content)
        .collect()
}

#[async_trait]
impl InferenceEngine for ProviderEngine {
    async fn load(&self, model: &str, progress: ProgressSink) -> Result<EngineHandle, EngineError> {
        progress.report(0.0, &format!("connecting to {}", self.config.backend));
        let provider = self.build(model, None, None)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.loaded().insert(
            id,
            Loaded {
                model: model.to_string(),
                system: None,
                temperature: None,
                provider,
                last_reply: ReplySlot::default(),
            },
        );
        info!(target: "bevy_llm_session", "provider: '{}' ready on {} (handle={})", model, self.config.backend, id);
        progress.report(1.0, "ready");
        Ok(EngineHandle::new(id, model))
    }

    async fn generate_streaming(
        &self,
        handle: &EngineHandle,
        messages: &[Turn],
        options: GenerateOptions,
    ) -> Result<ReplyStream, EngineError> {
        let provider = self.provider_for(handle, messages, options)?;
        let slot = self.fresh_slot(handle)?;
        let msgs = to_chat_messages(messages);
        let stream = provider.chat_stream_struct(&msgs).await?;
        // the provider does not surface usage on the stream; include_usage is a no-op here
        let stream: ReplyStream = Box::pin(stream.map(|item| match item {
            Ok(resp) => Ok(ReplyChunk::Delta(delta_text(resp))),
            Err(err) => Err(EngineError::from(err)),
        }));
        Ok(record_reply(stream, slot))
    }

    async fn generate_once(
        &self,
        handle: &EngineHandle,
        messages: &[Turn],
        options: GenerateOptions,
    ) -> Result<String, EngineError> {
        let provider = self.provider_for(handle, messages, options)?;
        let slot = self.fresh_slot(handle)?;
        let resp = provider.chat(&to_chat_messages(messages)).await?;
        let text = resp.text().unwrap_or_default().to_string();
        *lock_slot(&slot) = Some(text.clone());
        Ok(text)
    }

    async fn final_transcript(&self, handle: &EngineHandle, model: &str) -> Result<String, EngineError> {
        let slot = self
            .loaded()
            .get(&handle.id())
            .map(|l| l.last_reply.clone())
            .ok_or(EngineError::UnknownHandle(handle.id()))?;
        let reply = lock_slot(&slot).clone();
        reply.ok_or_else(|| EngineError::Transcript(format!("no reply recorded for '{model}'")))
    }

    async fn dispose(&self, handle: EngineHandle) {
        if self.loaded().remove(&handle.id()).is_some() {
            debug!(target: "bevy_llm_session", "provider: released handle={}", handle.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ChatRole;

    #[test]
    fn system_turns_are_not_sent_as_messages() {
        let turns = vec![
            Turn::new(Role::System, "sys"),
            Turn::new(Role::User, "hi"),
            Turn::new(Role::Assistant, "hello"),
        ];
        let msgs = to_chat_messages(&turns);
        assert_eq!(msgs.len(), 2);
        assert!(matches!(msgs[0].role, ChatRole::User));
        assert_eq!(msgs[0].content, "hi");
        assert!(matches!(msgs[1].role, ChatRole::Assistant));
    }

    #[test]
    fn load_and_dispose_track_handles() {
        let engine = ProviderEngine::new(ProviderConfig::default());
        let handle = pollster::block_on(engine.load("llama3.2:1b", ProgressSink::ignore())).unwrap();
        assert_eq!(handle.model(), "llama3.2:1b");
        assert_eq!(engine.loaded().len(), 1);

        let err = pollster::block_on(engine.final_transcript(&handle, "llama3.2:1b")).unwrap_err();
        assert!(matches!(err, EngineError::Transcript(_)));

        pollster::block_on(engine.dispose(handle.clone()));
        assert!(engine.loaded().is_empty());
        let err = pollster::block_on(engine.final_transcript(&handle, "llama3.2:1b")).unwrap_err();
        assert!(matches!(err, EngineError::UnknownHandle(_)));
    }

    #[test]
    fn final_transcript_is_the_recorded_reply() {
        let engine = ProviderEngine::new(ProviderConfig::default());
        let handle = pollster::block_on(engine.load("llama3.2:1b", ProgressSink::ignore())).unwrap();

        let chunks: Vec<Result<ReplyChunk, EngineError>> = vec![
            Ok(ReplyChunk::Delta("Hel".into())),
            Ok(ReplyChunk::Delta("lo".into())),
        ];
        let stream = record_reply(
            Box::pin(futures_lite::stream::iter(chunks)),
            engine.fresh_slot(&handle).unwrap(),
        );
        let streamed: Vec<_> = pollster::block_on(stream.collect::<Vec<_>>());
        assert_eq!(streamed.len(), 2);

        let transcript = pollster::block_on(engine.final_transcript(&handle, "llama3.2:1b")).unwrap();
        assert_eq!(transcript, "Hello");

        // the next reply starts from an empty slot
        engine.fresh_slot(&handle).unwrap();
        assert!(pollster::block_on(engine.final_transcript(&handle, "llama3.2:1b")).is_err());
    }
}
