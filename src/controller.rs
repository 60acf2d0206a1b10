//! session orchestration: model selection, sends, and engine message routing.
//!
//! the controller is synchronous and owns all session state. it never awaits:
//! each operation mutates state and returns a [`Step`] holding the events to
//! publish and the [`Effect`]s a worker should run. engine results come back
//! later as [`EngineMsg`]s through [`SessionController::handle`], one at a
//! time, in arrival order.

use std::sync::Arc;

use bevy::log::{debug, info, warn};

use crate::accumulator::{RequestId, StreamAccumulator};
use crate::config::{SessionConfig, SessionMode};
use crate::conversation::{ConversationStore, MessageId, Role, Turn};
use crate::engine::{InferenceEngine, Usage};
use crate::error::SendRejected;
use crate::session::{Delivery, EngineSession, EngineState};
use crate::worker::{CancelFlag, Effect, EngineMsg, GenerationRequest};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReplyStatus {
    #[default]
    Idle,
    Replying { request: RequestId },
    Done,
}

/// what changed, for the presentation layer.
#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    EngineStateChanged,
    ConversationChanged,
    /// the open reply grew; `text` is the full reply so far.
    ReplyUpdated { request: RequestId, text: String },
    ReplyFinished { request: RequestId, text: String },
    ReplyFailed { request: RequestId, error: String },
}

#[derive(Debug, Default)]
pub struct Step {
    pub events: Vec<SessionEvent>,
    pub effects: Vec<Effect>,
}

impl Step {
    fn event(mut self, event: SessionEvent) -> Self {
        self.events.push(event);
        self
    }

    fn effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }
}

#[derive(Debug)]
struct InFlight {
    request: RequestId,
    message: MessageId,
    cancel: CancelFlag,
}

pub struct SessionController {
    config: SessionConfig,
    engine: Arc<dyn InferenceEngine>,
    session: EngineSession,
    load_cancel: CancelFlag,
    conversation: ConversationStore,
    accumulator: StreamAccumulator,
    reply: Option<InFlight>,
    status: ReplyStatus,
    next_request: u64,
    last_error: Option<String>,
    last_usage: Option<Usage>,
}

impl SessionController {
    /// initial mount: begin loading `config.initial_model`.
    pub fn start(config: SessionConfig, engine: Arc<dyn InferenceEngine>) -> (Self, Step) {
        let model = config.initial_model.clone();
        let (session, token) = EngineSession::begin(model.clone());
        let load_cancel = CancelFlag::new();
        let mut conversation = ConversationStore::new();
        conversation.reset_with_system_prompt(config.system_prompt_for(&model));
        info!(target: "bevy_llm_session", "session start: model='{}' mode={:?}", model, config.mode);

        let step = Step::default()
            .event(SessionEvent::EngineStateChanged)
            .event(SessionEvent::ConversationChanged)
            .effect(Effect::Load { token, model, cancel: load_cancel.clone() });
        let ctl = Self {
            config,
            engine,
            session,
            load_cancel,
            conversation,
            accumulator: StreamAccumulator::new(),
            reply: None,
            status: ReplyStatus::Idle,
            next_request: 0,
            last_error: None,
            last_usage: None,
        };
        (ctl, step)
    }

    /// switch to `model`: abort the open reply, reset the conversation, start a new load.
    pub fn on_model_change(&mut self, model: impl Into<String>) -> Step {
        let model = model.into();
        if self.config.option(&model).is_none() {
            warn!(target: "bevy_llm_session", "model '{}' is not in the configured list", model);
        }
        self.abort_reply();
        self.load_cancel.cancel();
        self.load_cancel = CancelFlag::new();

        let (token, previous) = self.session.reload(model.clone());
        self.conversation.reset_with_system_prompt(self.config.system_prompt_for(&model));
        self.status = ReplyStatus::Idle;
        self.last_error = None;
        self.last_usage = None;

        let mut step = Step::default()
            .event(SessionEvent::EngineStateChanged)
            .event(SessionEvent::ConversationChanged);
        if let Some(handle) = previous {
            step = step.effect(Effect::Dispose(handle));
        }
        step.effect(Effect::Load { token, model, cancel: self.load_cancel.clone() })
    }

    /// submit `text`. a rejected send leaves the session untouched.
    pub fn on_send(&mut self, text: &str) -> Result<Step, SendRejected> {
        let handle = self.session.handle().cloned().ok_or(SendRejected::NotReady)?;
        if text.trim().is_empty() {
            return Err(SendRejected::EmptyInput);
        }
        if self.reply.is_some() || self.accumulator.is_open() {
            return Err(SendRejected::ReplyInFlight);
        }

        let turns = self.payload(text);
        if let (Some(quota), Some(used)) =
            (self.engine.input_quota(&handle), self.engine.measure_input(&handle, &turns))
            && used > quota
        {
            return Err(SendRejected::InputTooLong { used, quota });
        }

        let request = RequestId(self.next_request);
        self.next_request += 1;
        self.accumulator
            .open(request)
            .map_err(|_| SendRejected::ReplyInFlight)?;
        self.conversation.append_user(text);
        let message = self.conversation.append_assistant_placeholder();
        let cancel = CancelFlag::new();

        if self.config.log_content {
            debug!(target: "bevy_llm_session", "send {:?}: '{}'", request, text);
        }
        info!(target: "bevy_llm_session",
            "send {:?}: len={} turns={} model='{}'",
            request, text.len(), turns.len(), handle.model()
        );

        self.reply = Some(InFlight { request, message, cancel: cancel.clone() });
        self.status = ReplyStatus::Replying { request };
        self.last_error = None;

        Ok(Step::default()
            .event(SessionEvent::ConversationChanged)
            .effect(Effect::Generate(GenerationRequest {
                request,
                handle,
                turns,
                options: self.config.generate_options(),
                streaming: self.config.streaming,
                reconcile: self.config.reconcile_final_transcript,
                cancel,
            })))
    }

    /// apply one engine message. messages from superseded loads or requests are dropped.
    pub fn handle(&mut self, msg: EngineMsg) -> Step {
        match msg {
            EngineMsg::LoadProgress { token, fraction, text } => {
                match self.session.on_progress(token, fraction, &text) {
                    Delivery::Applied => Step::default().event(SessionEvent::EngineStateChanged),
                    Delivery::Stale => Step::default(),
                }
            }
            EngineMsg::Loaded { token, handle } => match self.session.on_loaded(token, handle) {
                Ok(()) => Step::default().event(SessionEvent::EngineStateChanged),
                Err(stale) => Step::default().effect(Effect::Dispose(stale)),
            },
            EngineMsg::LoadFailed { token, error } => match self.session.on_failed(token, &error) {
                Delivery::Applied => Step::default().event(SessionEvent::EngineStateChanged),
                Delivery::Stale => Step::default(),
            },
            EngineMsg::Chunk { request, text } => self.on_chunk(request, &text),
            EngineMsg::Usage { request, usage } => {
                if self.is_current(request) {
                    self.last_usage = Some(usage);
                }
                Step::default()
            }
            EngineMsg::Completed { request, final_text } => self.on_completed(request, final_text),
            EngineMsg::Failed { request, error } => {
                let Some(reply) = self.take_current(request) else {
                    return Step::default();
                };
                warn!(target: "bevy_llm_session", "reply {:?} failed: {}", request, error);
                // keep whatever arrived; the partial text is already in the message
                let partial = self.accumulator.close(None).unwrap_or_default();
                debug!(target: "bevy_llm_session",
                    "reply {:?} kept {} bytes in {:?}", request, partial.len(), reply.message
                );
                self.status = ReplyStatus::Done;
                let error = error.to_string();
                self.last_error = Some(error.clone());
                Step::default()
                    .event(SessionEvent::ConversationChanged)
                    .event(SessionEvent::ReplyFailed { request, error })
            }
        }
    }

    /// cancel everything outstanding and release the engine.
    pub fn teardown(&mut self) -> Step {
        info!(target: "bevy_llm_session", "session teardown: model='{}'", self.session.model());
        self.abort_reply();
        self.load_cancel.cancel();
        self.status = ReplyStatus::Idle;
        let step = Step::default().event(SessionEvent::EngineStateChanged);
        match self.session.teardown() {
            Some(handle) => step.effect(Effect::Dispose(handle)),
            None => step,
        }
    }

    pub fn engine_state(&self) -> &EngineState {
        self.session.state()
    }

    pub fn conversation(&self) -> &ConversationStore {
        &self.conversation
    }

    pub fn reply_status(&self) -> ReplyStatus {
        self.status
    }

    pub fn is_replying(&self) -> bool {
        self.reply.is_some()
    }

    /// whether a send would currently be accepted, ignoring input checks.
    pub fn can_send(&self) -> bool {
        self.session.is_ready() && !self.is_replying()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn last_usage(&self) -> Option<Usage> {
        self.last_usage
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn on_chunk(&mut self, request: RequestId, chunk: &str) -> Step {
        let Some(message) = self.reply.as_ref().filter(|r| r.request == request).map(|r| r.message) else {
            debug!(target: "bevy_llm_session", "dropping stale chunk for {:?}", request);
            return Step::default();
        };
        let text = match self.accumulator.apply(chunk) {
            Ok(text) => text.to_string(),
            Err(err) => {
                warn!(target: "bevy_llm_session", "chunk for {:?} not applied: {}", request, err);
                return Step::default();
            }
        };
        if self.config.log_content {
            debug!(target: "bevy_llm_session", "chunk {:?}: '{}'", request, chunk);
        }
        if let Err(err) = self.conversation.update_message(message, text.clone()) {
            warn!(target: "bevy_llm_session", "reply message for {:?} lost: {}", request, err);
        }
        Step::default()
            .event(SessionEvent::ConversationChanged)
            .event(SessionEvent::ReplyUpdated { request, text })
    }

    fn on_completed(&mut self, request: RequestId, final_text: Option<String>) -> Step {
        let Some(reply) = self.take_current(request) else {
            debug!(target: "bevy_llm_session", "dropping stale completion for {:?}", request);
            return Step::default();
        };
        let text = match self.accumulator.close(final_text) {
            Ok(text) => text,
            Err(err) => {
                warn!(target: "bevy_llm_session", "completion for {:?}: {}", request, err);
                String::new()
            }
        };
        if let Err(err) = self.conversation.update_message(reply.message, text.clone()) {
            warn!(target: "bevy_llm_session", "reply message for {:?} lost: {}", request, err);
        }
        info!(target: "bevy_llm_session", "reply {:?} completed: final_len={}", request, text.len());
        self.status = ReplyStatus::Done;
        Step::default()
            .event(SessionEvent::ConversationChanged)
            .event(SessionEvent::ReplyFinished { request, text })
    }

    /// what the engine receives for a send of `text`.
    fn payload(&self, text: &str) -> Vec<Turn> {
        match self.config.mode {
            SessionMode::Chat => {
                let mut turns = self.conversation.turns();
                turns.push(Turn::new(Role::User, text));
                turns
            }
            SessionMode::Summarize => vec![
                Turn::new(Role::System, self.config.summarize_prompt.clone()),
                Turn::new(Role::User, text),
            ],
        }
    }

    fn is_current(&self, request: RequestId) -> bool {
        self.reply.as_ref().is_some_and(|r| r.request == request)
    }

    fn take_current(&mut self, request: RequestId) -> Option<InFlight> {
        if self.is_current(request) { self.reply.take() } else { None }
    }

    fn abort_reply(&mut self) {
        if let Some(reply) = self.reply.take() {
            info!(target: "bevy_llm_session", "aborting reply {:?}", reply.request);
            reply.cancel.cancel();
            self.accumulator.cancel();
        }
    }
}
