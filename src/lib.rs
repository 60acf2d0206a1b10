//! bevy_llm_session: pick a model, load it, chat with it, with live progress
//! and streamed replies.
//!
//! - the session core (`controller`, `session`, `accumulator`, `conversation`,
//!   `progress`) is plain rust: synchronous state machines that return the
//!   async work they need as effects.
//! - workers run those effects against an [`InferenceEngine`] and report back
//!   through a bounded inbox; bevy's `Update` drains it in order, which makes
//!   the app loop the single-threaded event loop of the session.
//! - never blocks the main thread: on native we spawn onto a tiny tokio
//!   runtime; on wasm we spawn onto the browser's event loop.
//! - uis read [`ChatSession`] and talk to it only through events.
//!
//! api docs (types & traits): https://docs.rs/llm
//!   - chat provider:             `llm::chat::ChatProvider`
//!   - message builder/roles:     `llm::chat::{ChatMessage, ChatRole}`
//!   - streaming:                 `llm::chat::{StreamResponse, StreamChoice, StreamDelta}`

use bevy::ecs::system::SystemParam;
use bevy::prelude::*;
use flume::{Receiver, Sender, TryRecvError};
use std::ops::Deref;
use std::sync::Arc;

pub mod accumulator;
pub mod config;
pub mod controller;
pub mod conversation;
pub mod engine;
pub mod error;
pub mod progress;
pub mod provider;
pub mod session;
pub mod worker;

#[cfg(test)]
mod testing;

/// re-export the llm types so downstream code can use the same structs/enums.
pub use llm::{
    builder::{LLMBackend, LLMBuilder},
    chat::{ChatMessage, ChatProvider, ChatRole, StreamChoice, StreamDelta, StreamResponse},
    error::LLMError,
    LLMProvider,
};

pub use accumulator::{RequestId, StreamAccumulator};
pub use config::{ModelOption, ProviderConfig, SessionConfig, SessionMode};
pub use controller::{ReplyStatus, SessionController, SessionEvent, Step};
pub use conversation::{ConversationStore, Message, MessageId, Role, Turn};
pub use engine::{EngineHandle, GenerateOptions, InferenceEngine, ProgressSink, ReplyChunk, Usage};
pub use error::{ConfigError, EngineError, SendRejected};
pub use progress::LoadProgress;
pub use provider::ProviderEngine;
pub use session::{EngineSession, EngineState, LoadToken};
pub use worker::{CancelFlag, Effect, EngineMsg, Worker};

/// the engine every session loads models through. insert before the app starts.
#[derive(Resource, Clone)]
pub struct Engine(pub Arc<dyn InferenceEngine>);

impl Engine {
    pub fn new(engine: impl InferenceEngine) -> Self {
        Self(Arc::new(engine))
    }
}

/// on native we keep a tiny tokio runtime to drive engine futures
/// so neither the main thread nor bevy's pools block.
#[cfg(not(target_arch = "wasm32"))]
#[derive(Resource, Clone)]
pub struct TokioRt(pub Arc<tokio::runtime::Runtime>);

#[cfg(not(target_arch = "wasm32"))]
impl Default for TokioRt {
    fn default() -> Self {
        info!(target: "bevy_llm_session", "LlmSessionPlugin: initializing Tokio multi-thread runtime (native)");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .expect("tokio runtime");
        Self(Arc::new(rt))
    }
}

/// system ordering so uis can run after we emit events
#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum LlmSet {
    /// user actions are applied and the inbox drained here (in `Update`)
    Drain,
}

/// the live session. read-only for uis; change it with [`UserAction`]s.
#[derive(Resource)]
pub struct ChatSession {
    controller: SessionController,
}

impl Deref for ChatSession {
    type Target = SessionController;

    fn deref(&self) -> &SessionController {
        &self.controller
    }
}

/// configuration the session is started with.
#[derive(Resource, Clone, Debug)]
pub struct SessionSettings(pub SessionConfig);

/// what the user did. applied in the order they were sent, so a submit
/// followed by a model switch in the same frame sends and then aborts.
#[derive(Event, Debug, Clone, PartialEq)]
pub enum UserAction {
    /// picked a model (by id).
    SelectModel(String),
    /// submitted the input box.
    Submit(String),
}

/// events emitted as the session changes.
#[derive(Event, Debug)]
pub struct EngineStateChanged;
#[derive(Event, Debug)]
pub struct ConversationChanged;
#[derive(Event, Debug)]
pub struct ReplyDeltaEvt {
    pub request: RequestId,
    /// full reply text so far, not just the new chunk.
    pub text: String,
}
#[derive(Event, Debug)]
pub struct ReplyCompletedEvt {
    pub request: RequestId,
    pub text: String,
}
#[derive(Event, Debug)]
pub struct ReplyErrorEvt {
    pub request: RequestId,
    pub error: String,
}
#[derive(Event, Debug)]
pub struct SendRejectedEvt {
    pub reason: SendRejected,
}

/// cross-thread inbox; workers send, main thread drains.
/// bounded to avoid unbounded growth when the frame stalls briefly.
#[derive(Resource, Clone)]
struct StreamInbox {
    tx: Sender<EngineMsg>,
    rx: Receiver<EngineMsg>,
}

impl Default for StreamInbox {
    fn default() -> Self {
        let (tx, rx) = flume::bounded(2048);
        Self { tx, rx }
    }
}

/// spawns effects without blocking the frame.
#[derive(Resource, Clone)]
struct Runner {
    worker: Worker,
    #[cfg(not(target_arch = "wasm32"))]
    rt: Arc<tokio::runtime::Runtime>,
}

impl Runner {
    /// run `effect` to completion before returning (native); used at exit,
    /// when the runtime is about to go away.
    fn finish(&self, effect: Effect) {
        let run = self.worker.clone().run(effect);
        #[cfg(not(target_arch = "wasm32"))]
        {
            self.rt.block_on(run);
        }
        #[cfg(target_arch = "wasm32")]
        {
            wasm_bindgen_futures::spawn_local(run);
        }
    }

    fn spawn(&self, effect: Effect) {
        let run = self.worker.clone().run(effect);
        #[cfg(not(target_arch = "wasm32"))]
        {
            self.rt.spawn(run);
        }
        #[cfg(target_arch = "wasm32")]
        {
            wasm_bindgen_futures::spawn_local(run);
        }
    }
}

#[derive(SystemParam)]
struct SessionWriters<'w> {
    state: EventWriter<'w, EngineStateChanged>,
    conversation: EventWriter<'w, ConversationChanged>,
    delta: EventWriter<'w, ReplyDeltaEvt>,
    done: EventWriter<'w, ReplyCompletedEvt>,
    failed: EventWriter<'w, ReplyErrorEvt>,
    rejected: EventWriter<'w, SendRejectedEvt>,
}

impl SessionWriters<'_> {
    /// spawn the step's effects and publish its events.
    fn apply(&mut self, runner: &Runner, step: Step) {
        for effect in step.effects {
            runner.spawn(effect);
        }
        self.publish(step.events);
    }

    fn publish(&mut self, events: Vec<SessionEvent>) {
        for event in events {
            match event {
                SessionEvent::EngineStateChanged => {
                    self.state.write(EngineStateChanged);
                }
                SessionEvent::ConversationChanged => {
                    self.conversation.write(ConversationChanged);
                }
                SessionEvent::ReplyUpdated { request, text } => {
                    self.delta.write(ReplyDeltaEvt { request, text });
                }
                SessionEvent::ReplyFinished { request, text } => {
                    self.done.write(ReplyCompletedEvt { request, text });
                }
                SessionEvent::ReplyFailed { request, error } => {
                    self.failed.write(ReplyErrorEvt { request, error });
                }
            }
        }
    }
}

/// bevy plugin: wires systems, events, resources.
/// requires an [`Engine`] resource; on native, also inserts a tiny tokio
/// runtime resource by default.
#[derive(Default)]
pub struct LlmSessionPlugin {
    pub config: SessionConfig,
}

impl LlmSessionPlugin {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

impl Plugin for LlmSessionPlugin {
    fn build(&self, app: &mut App) {
        info!(target: "bevy_llm_session", "LlmSessionPlugin: build()");
        app.insert_resource(SessionSettings(self.config.clone()))
            .init_resource::<StreamInbox>()
            .add_event::<UserAction>()
            .add_event::<EngineStateChanged>()
            .add_event::<ConversationChanged>()
            .add_event::<ReplyDeltaEvt>()
            .add_event::<ReplyCompletedEvt>()
            .add_event::<ReplyErrorEvt>()
            .add_event::<SendRejectedEvt>()
            .configure_sets(Update, LlmSet::Drain)
            // initial mount: load the configured model
            .add_systems(Startup, start_session)
            // user actions first so a send never races the chunks it causes
            .add_systems(
                Update,
                (handle_user_actions, drain_engine_inbox)
                    .chain()
                    .in_set(LlmSet::Drain),
            )
            .add_systems(Last, teardown_on_exit);

        #[cfg(not(target_arch = "wasm32"))]
        if app.world().get_resource::<TokioRt>().is_none() {
            app.insert_resource(TokioRt::default());
        }
    }
}

fn start_session(
    mut commands: Commands,
    engine: Option<Res<Engine>>,
    settings: Res<SessionSettings>,
    inbox: Res<StreamInbox>,
    mut writers: SessionWriters,

    #[cfg(not(target_arch = "wasm32"))] rt: Res<TokioRt>,
) {
    let Some(engine) = engine else {
        error!(target: "bevy_llm_session", "start_session: no Engine resource inserted; session not started");
        return;
    };
    if let Err(err) = settings.0.validate() {
        warn!(target: "bevy_llm_session", "start_session: {err}");
    }

    let runner = Runner {
        worker: Worker::new(engine.0.clone(), inbox.tx.clone()),
        #[cfg(not(target_arch = "wasm32"))]
        rt: rt.0.clone(),
    };
    let (controller, step) = SessionController::start(settings.0.clone(), engine.0.clone());
    writers.apply(&runner, step);
    commands.insert_resource(ChatSession { controller });
    commands.insert_resource(runner);
}

fn handle_user_actions(
    session: Option<ResMut<ChatSession>>,
    runner: Option<Res<Runner>>,
    mut ev_action: EventReader<UserAction>,
    mut writers: SessionWriters,
) {
    let (Some(mut session), Some(runner)) = (session, runner) else {
        ev_action.clear();
        return;
    };

    for action in ev_action.read() {
        match action {
            UserAction::SelectModel(model) => {
                info!(target: "bevy_llm_session", "select model -> '{}'", model);
                let step = session.controller.on_model_change(model.clone());
                writers.apply(&runner, step);
            }
            UserAction::Submit(text) => match session.controller.on_send(text) {
                Ok(step) => writers.apply(&runner, step),
                Err(reason) => {
                    info!(target: "bevy_llm_session", "send rejected: {}", reason);
                    writers.rejected.write(SendRejectedEvt { reason });
                }
            },
        }
    }
}

/// drains the inbox into the controller, in arrival order.
fn drain_engine_inbox(
    inbox: Res<StreamInbox>,
    session: Option<ResMut<ChatSession>>,
    runner: Option<Res<Runner>>,
    mut writers: SessionWriters,
) {
    let (Some(mut session), Some(runner)) = (session, runner) else {
        return;
    };
    // drain up to a cap per frame to avoid long frames on bursty streams
    const MAX_PER_FRAME: usize = 512;
    for _ in 0..MAX_PER_FRAME {
        match inbox.rx.try_recv() {
            Ok(msg) => {
                let step = session.controller.handle(msg);
                writers.apply(&runner, step);
            }
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => break,
        }
    }
}

/// release the engine before the runtime is dropped. whatever is still in the
/// inbox is applied too, so a handle that arrived late is disposed as well.
fn teardown_on_exit(
    mut ev_exit: EventReader<AppExit>,
    inbox: Res<StreamInbox>,
    session: Option<ResMut<ChatSession>>,
    runner: Option<Res<Runner>>,
    mut writers: SessionWriters,
) {
    if ev_exit.read().last().is_none() {
        return;
    }
    let (Some(mut session), Some(runner)) = (session, runner) else {
        return;
    };
    let mut steps = vec![session.controller.teardown()];
    steps.extend(inbox.rx.try_iter().map(|msg| session.controller.handle(msg)));
    for step in steps {
        for effect in step.effects {
            runner.finish(effect);
        }
        writers.publish(step.events);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedEngine;
    use std::time::Duration;

    fn app_with(engine: ScriptedEngine, config: SessionConfig) -> App {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.insert_resource(Engine::new(engine));
        app.add_plugins(LlmSessionPlugin::new(config));
        app
    }

    /// step the app until `done` holds; workers run on the tokio runtime meanwhile.
    fn update_until(app: &mut App, done: impl Fn(&ChatSession) -> bool) -> bool {
        for _ in 0..400 {
            app.update();
            if app.world().get_resource::<ChatSession>().is_some_and(&done) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn startup_loads_initial_model() {
        let mut app = app_with(
            ScriptedEngine::default().with_progress(&[0.1, 0.5, 1.0]),
            SessionConfig::default(),
        );
        assert!(update_until(&mut app, |s| matches!(s.engine_state(), EngineState::Ready { .. })));

        let session = app.world().resource::<ChatSession>();
        assert_eq!(session.engine_state().model(), "llama3.2:1b");
        assert_eq!(session.conversation().len(), 1);
    }

    #[test]
    fn early_submit_is_rejected() {
        let mut app = app_with(ScriptedEngine::default(), SessionConfig::default());
        app.world_mut().send_event(UserAction::Submit("hi".into()));
        app.update();

        let mut ev = app.world_mut().resource_mut::<Events<SendRejectedEvt>>();
        let rejected: Vec<_> = ev.drain().collect();
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].reason, SendRejected::NotReady);
    }

    #[test]
    fn submit_streams_reply_into_session() {
        let mut app = app_with(
            ScriptedEngine::default().with_chunks(&["Hel", "lo"]),
            SessionConfig::default(),
        );
        assert!(update_until(&mut app, |s| s.can_send()));

        app.world_mut().send_event(UserAction::Submit("hi".into()));
        assert!(update_until(&mut app, |s| s.reply_status() == ReplyStatus::Done));

        let session = app.world().resource::<ChatSession>();
        let shown: Vec<(Role, &str)> = session
            .conversation()
            .displayed()
            .map(|m| (m.role, m.content.as_str()))
            .collect();
        assert_eq!(shown, vec![(Role::User, "hi"), (Role::Assistant, "Hello")]);
        assert!(session.can_send());
    }

    #[test]
    fn select_model_switches_and_resets() {
        let mut app = app_with(ScriptedEngine::default(), SessionConfig::default());
        assert!(update_until(&mut app, |s| s.can_send()));

        app.world_mut().send_event(UserAction::SelectModel("gemma2:2b".into()));
        assert!(update_until(&mut app, |s| {
            matches!(s.engine_state(), EngineState::Ready { model, .. } if model == "gemma2:2b")
        }));
        assert_eq!(app.world().resource::<ChatSession>().conversation().len(), 1);
    }

    #[test]
    fn actions_apply_in_the_order_sent() {
        let mut app = app_with(
            ScriptedEngine::default().with_chunks(&["Hel", "lo"]),
            SessionConfig::default(),
        );
        assert!(update_until(&mut app, |s| s.can_send()));

        app.world_mut().send_event(UserAction::Submit("hi".into()));
        app.world_mut().send_event(UserAction::SelectModel("gemma2:2b".into()));
        app.update();

        let rejected: Vec<_> = app
            .world_mut()
            .resource_mut::<Events<SendRejectedEvt>>()
            .drain()
            .collect();
        assert!(rejected.is_empty());
        let session = app.world().resource::<ChatSession>();
        assert_eq!(session.engine_state().model(), "gemma2:2b");
        assert_eq!(session.conversation().len(), 1);
        assert!(!session.is_replying());
    }

    #[test]
    fn exit_disposes_engine_before_returning() {
        let engine = Arc::new(ScriptedEngine::default());
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.insert_resource(Engine(engine.clone()));
        app.add_plugins(LlmSessionPlugin::default());
        assert!(update_until(&mut app, |s| s.can_send()));

        app.world_mut().send_event(AppExit::Success);
        app.update();

        assert_eq!(engine.disposed(), vec![1]);
        assert!(!app.world().resource::<ChatSession>().can_send());
    }

    #[test]
    fn drain_without_session_is_noop() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        // no Engine resource: the session never starts
        app.add_plugins(LlmSessionPlugin::default());
        app.update();
        assert!(app.world().get_resource::<ChatSession>().is_none());
    }
}
