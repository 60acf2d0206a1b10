//! runs controller effects against the engine and reports back through the inbox.
//!
//! workers never touch session state. everything they learn travels as an
//! [`EngineMsg`] through a bounded channel that the event loop drains in
//! order. each load and generation carries a [`CancelFlag`], checked before
//! every message sent, so a superseded task goes quiet as soon as possible.
//! anything that still slips through is dropped by the controller's token
//! and request checks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bevy::log::{debug, error, info, warn};
use flume::{Sender, TrySendError};
use futures_lite::StreamExt;

use crate::accumulator::RequestId;
use crate::conversation::Turn;
use crate::engine::{
    EngineHandle, GenerateOptions, InferenceEngine, ProgressSink, ReplyChunk, ReplyStream, Usage,
};
use crate::error::EngineError;
use crate::session::LoadToken;

/// shared cancellation flag for one load or generation.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// everything a worker reports back to the controller.
#[derive(Debug)]
pub enum EngineMsg {
    LoadProgress { token: LoadToken, fraction: f32, text: String },
    Loaded { token: LoadToken, handle: EngineHandle },
    LoadFailed { token: LoadToken, error: EngineError },
    Chunk { request: RequestId, text: String },
    Usage { request: RequestId, usage: Usage },
    /// the reply ended; `final_text` is the engine's authoritative transcript, if fetched.
    Completed { request: RequestId, final_text: Option<String> },
    Failed { request: RequestId, error: EngineError },
}

#[derive(Clone, Debug)]
pub struct GenerationRequest {
    pub request: RequestId,
    pub handle: EngineHandle,
    pub turns: Vec<Turn>,
    pub options: GenerateOptions,
    pub streaming: bool,
    /// fetch the final transcript once the reply ends.
    pub reconcile: bool,
    pub cancel: CancelFlag,
}

/// work the controller asks for; executed by a [`Worker`].
#[derive(Debug)]
pub enum Effect {
    Load { token: LoadToken, model: String, cancel: CancelFlag },
    Generate(GenerationRequest),
    Dispose(EngineHandle),
}

#[derive(Clone)]
pub struct Worker {
    engine: Arc<dyn InferenceEngine>,
    tx: Sender<EngineMsg>,
}

impl Worker {
    pub fn new(engine: Arc<dyn InferenceEngine>, tx: Sender<EngineMsg>) -> Self {
        Self { engine, tx }
    }

    /// execute `effect` to completion.
    pub async fn run(self, effect: Effect) {
        match effect {
            Effect::Load { token, model, cancel } => self.load(token, model, cancel).await,
            Effect::Generate(req) => self.generate(req).await,
            Effect::Dispose(handle) => {
                debug!(target: "bevy_llm_session", "worker: dispose handle={}", handle.id());
                self.engine.dispose(handle).await;
            }
        }
    }

    async fn load(&self, token: LoadToken, model: String, cancel: CancelFlag) {
        info!(target: "bevy_llm_session", "worker: load '{}' ({:?})", model, token);
        // report that found the inbox full; flushed before the load result
        let held: Arc<Mutex<Option<EngineMsg>>> = Arc::default();
        let sink = {
            let tx = self.tx.clone();
            let cancel = cancel.clone();
            let held = held.clone();
            ProgressSink::new(move |fraction, text| {
                if cancel.is_cancelled() {
                    return;
                }
                let msg = EngineMsg::LoadProgress { token, fraction, text: text.to_string() };
                let mut held = held.lock().unwrap_or_else(|e| e.into_inner());
                *held = match tx.try_send(msg) {
                    Ok(()) => None,
                    Err(TrySendError::Full(msg)) => Some(msg),
                    Err(TrySendError::Disconnected(_)) => None,
                };
            })
        };

        let result = self.engine.load(&model, sink).await;
        let latest = held.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(msg) = latest.filter(|_| !cancel.is_cancelled()) {
            self.push(msg).await;
        }

        match result {
            Ok(handle) if cancel.is_cancelled() => {
                debug!(target: "bevy_llm_session", "worker: load of '{}' superseded, disposing", model);
                self.engine.dispose(handle).await;
            }
            Ok(handle) => self.push(EngineMsg::Loaded { token, handle }).await,
            Err(error) => {
                if !cancel.is_cancelled() {
                    self.push(EngineMsg::LoadFailed { token, error }).await;
                }
            }
        }
    }

    async fn generate(&self, req: GenerationRequest) {
        let GenerationRequest { request, handle, turns, options, streaming, reconcile, cancel } = req;
        info!(target: "bevy_llm_session",
            "worker: generate {:?} turns={} stream={} reconcile={}",
            request, turns.len(), streaming, reconcile
        );

        let result = if streaming {
            match self.engine.generate_streaming(&handle, &turns, options).await {
                Ok(stream) => self.forward_stream(request, stream, &cancel).await,
                Err(err) => {
                    warn!(target: "bevy_llm_session",
                        "streaming failed to start: {err}. falling back to one-shot generation"
                    );
                    self.generate_once(request, &handle, &turns, options, &cancel).await
                }
            }
        } else {
            self.generate_once(request, &handle, &turns, options, &cancel).await
        };

        if let Err(error) = result {
            error!(target: "bevy_llm_session", "generation {:?} failed: {}", request, error);
            if !cancel.is_cancelled() {
                self.push(EngineMsg::Failed { request, error }).await;
            }
            return;
        }
        if cancel.is_cancelled() {
            debug!(target: "bevy_llm_session", "worker: generation {:?} cancelled", request);
            return;
        }

        let final_text = if reconcile {
            match self.engine.final_transcript(&handle, handle.model()).await {
                Ok(text) => Some(text),
                Err(err) => {
                    warn!(target: "bevy_llm_session", "final transcript unavailable, keeping streamed text: {err}");
                    None
                }
            }
        } else {
            None
        };
        if !cancel.is_cancelled() {
            self.push(EngineMsg::Completed { request, final_text }).await;
        }
    }

    async fn forward_stream(
        &self,
        request: RequestId,
        mut stream: ReplyStream,
        cancel: &CancelFlag,
    ) -> Result<(), EngineError> {
        let mut total = 0usize;
        while let Some(item) = stream.next().await {
            if cancel.is_cancelled() {
                return Ok(());
            }
            match item? {
                ReplyChunk::Delta(text) => {
                    if text.is_empty() {
                        continue;
                    }
                    total += text.len();
                    self.push(EngineMsg::Chunk { request, text }).await;
                }
                ReplyChunk::Usage(usage) => self.push(EngineMsg::Usage { request, usage }).await,
            }
        }
        debug!(target: "bevy_llm_session", "stream {:?} ended: len={}", request, total);
        Ok(())
    }

    async fn generate_once(
        &self,
        request: RequestId,
        handle: &EngineHandle,
        turns: &[Turn],
        options: GenerateOptions,
        cancel: &CancelFlag,
    ) -> Result<(), EngineError> {
        let text = self.engine.generate_once(handle, turns, options).await?;
        if !text.is_empty() && !cancel.is_cancelled() {
            self.push(EngineMsg::Chunk { request, text }).await;
        }
        Ok(())
    }

    /// send to inbox (ignore disconnected: the session is gone)
    async fn push(&self, msg: EngineMsg) {
        let _ = self.tx.send_async(msg).await;
    }
}
