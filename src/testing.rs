//! scripted engine and helpers shared by the unit tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use flume::Receiver;

use crate::controller::{SessionController, SessionEvent, Step};
use crate::conversation::Turn;
use crate::engine::{
    EngineHandle, GenerateOptions, InferenceEngine, ProgressSink, ReplyChunk, ReplyStream, Usage,
};
use crate::error::EngineError;
use crate::worker::{EngineMsg, Worker};

/// replays canned progress, chunks and transcripts; records what it was asked.
#[derive(Default)]
pub struct ScriptedEngine {
    progress: Vec<f32>,
    fail_load: bool,
    chunks: Vec<String>,
    usage: Option<Usage>,
    fail_after: Option<usize>,
    stream_unavailable: bool,
    once: String,
    transcript: Option<String>,
    quota: Option<usize>,
    next_id: AtomicU64,
    disposed: Mutex<Vec<u64>>,
    requests: Mutex<Vec<Vec<Turn>>>,
}

impl ScriptedEngine {
    pub fn with_progress(mut self, fractions: &[f32]) -> Self {
        self.progress = fractions.to_vec();
        self
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    pub fn with_chunks(mut self, chunks: &[&str]) -> Self {
        self.chunks = chunks.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }

    /// error out after emitting `n` chunks.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn with_stream_unavailable(mut self) -> Self {
        self.stream_unavailable = true;
        self
    }

    pub fn with_once(mut self, text: &str) -> Self {
        self.once = text.to_string();
        self
    }

    pub fn with_transcript(mut self, text: &str) -> Self {
        self.transcript = Some(text.to_string());
        self
    }

    pub fn with_quota(mut self, quota: usize) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn disposed(&self) -> Vec<u64> {
        self.disposed.lock().unwrap().clone()
    }

    pub fn requests(&self) -> Vec<Vec<Turn>> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl InferenceEngine for ScriptedEngine {
    async fn load(&self, model: &str, progress: ProgressSink) -> Result<EngineHandle, EngineError> {
        for f in &self.progress {
            progress.report(*f, &format!("loading {model}"));
        }
        if self.fail_load {
            return Err(EngineError::Load(format!("{model} is not available")));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(EngineHandle::new(id, model))
    }

    async fn generate_streaming(
        &self,
        _handle: &EngineHandle,
        messages: &[Turn],
        _options: GenerateOptions,
    ) -> Result<ReplyStream, EngineError> {
        if self.stream_unavailable {
            return Err(EngineError::Generation("streaming unsupported".into()));
        }
        self.requests.lock().unwrap().push(messages.to_vec());
        let mut items: Vec<Result<ReplyChunk, EngineError>> = Vec::new();
        for (i, c) in self.chunks.iter().enumerate() {
            if self.fail_after == Some(i) {
                items.push(Err(EngineError::Generation("connection reset".into())));
                return Ok(Box::pin(futures_lite::stream::iter(items)));
            }
            items.push(Ok(ReplyChunk::Delta(c.clone())));
        }
        if let Some(u) = self.usage {
            items.push(Ok(ReplyChunk::Usage(u)));
        }
        Ok(Box::pin(futures_lite::stream::iter(items)))
    }

    async fn generate_once(
        &self,
        _handle: &EngineHandle,
        messages: &[Turn],
        _options: GenerateOptions,
    ) -> Result<String, EngineError> {
        self.requests.lock().unwrap().push(messages.to_vec());
        Ok(self.once.clone())
    }

    async fn final_transcript(&self, _handle: &EngineHandle, _model: &str) -> Result<String, EngineError> {
        self.transcript
            .clone()
            .ok_or_else(|| EngineError::Transcript("no transcript kept".into()))
    }

    async fn dispose(&self, handle: EngineHandle) {
        self.disposed.lock().unwrap().push(handle.id());
    }

    fn input_quota(&self, _handle: &EngineHandle) -> Option<usize> {
        self.quota
    }

    fn measure_input(&self, _handle: &EngineHandle, messages: &[Turn]) -> Option<usize> {
        Some(messages.iter().map(|m| m.content.chars().count()).sum())
    }
}

/// run every effect of `step` and feed the resulting messages back into the
/// controller until nothing is left. returns all events seen on the way.
pub async fn settle(
    ctl: &mut SessionController,
    worker: &Worker,
    rx: &Receiver<EngineMsg>,
    step: Step,
) -> Vec<SessionEvent> {
    let mut events = step.events;
    let mut effects = step.effects;
    loop {
        for effect in effects.drain(..) {
            worker.clone().run(effect).await;
        }
        let msgs: Vec<EngineMsg> = rx.try_iter().collect();
        if msgs.is_empty() {
            return events;
        }
        for msg in msgs {
            let step = ctl.handle(msg);
            events.extend(step.events);
            effects.extend(step.effects);
        }
    }
}
