//! lifecycle of the current engine instance: loading, ready, error, replacement.
//!
//! every load is tagged with a [`LoadToken`]. callbacks carrying any token but
//! the current one belong to a superseded load and are dropped, so a slow,
//! abandoned load can never overwrite the state of a newer selection.

use bevy::log::{debug, info, warn};

use crate::engine::EngineHandle;
use crate::error::EngineError;
use crate::progress::LoadProgress;

/// shown while in [`EngineState::Error`] until another model is selected.
pub const LOAD_FAILED_MESSAGE: &str =
    "Could not load the model. Select a model to try again.";

pub const SESSION_CLOSED_MESSAGE: &str = "The engine was released.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LoadToken(u64);

#[derive(Clone, Debug, PartialEq)]
pub enum EngineState {
    LoadingModel { model: String, progress: LoadProgress },
    Ready { model: String, handle: EngineHandle },
    Error { model: String, message: String },
}

impl EngineState {
    pub fn model(&self) -> &str {
        match self {
            EngineState::LoadingModel { model, .. }
            | EngineState::Ready { model, .. }
            | EngineState::Error { model, .. } => model,
        }
    }
}

/// result of delivering a callback to the session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    Applied,
    Stale,
}

#[derive(Debug)]
pub struct EngineSession {
    state: EngineState,
    token: LoadToken,
    next_token: u64,
}

impl EngineSession {
    /// start loading `model`; the returned token tags that load's callbacks.
    pub fn begin(model: impl Into<String>) -> (Self, LoadToken) {
        let token = LoadToken(0);
        let session = Self {
            state: EngineState::LoadingModel { model: model.into(), progress: LoadProgress::new() },
            token,
            next_token: 1,
        };
        (session, token)
    }

    /// switch to `model` from any state. returns the new token and the previous
    /// ready handle, which the caller must dispose.
    pub fn reload(&mut self, model: impl Into<String>) -> (LoadToken, Option<EngineHandle>) {
        let model = model.into();
        let token = self.issue_token();
        let previous = std::mem::replace(
            &mut self.state,
            EngineState::LoadingModel { model: model.clone(), progress: LoadProgress::new() },
        );
        info!(target: "bevy_llm_session", "engine: loading '{}' ({:?})", model, token);
        (token, Self::into_handle(previous))
    }

    pub fn on_progress(&mut self, token: LoadToken, fraction: f32, text: &str) -> Delivery {
        if token != self.token {
            debug!(target: "bevy_llm_session", "engine: stale progress from {:?}", token);
            return Delivery::Stale;
        }
        match &mut self.state {
            EngineState::LoadingModel { progress, .. } => {
                progress.report(fraction, text);
                Delivery::Applied
            }
            _ => Delivery::Stale,
        }
    }

    /// move to ready. a stale or unexpected handle is handed back for disposal.
    pub fn on_loaded(&mut self, token: LoadToken, handle: EngineHandle) -> Result<(), EngineHandle> {
        if token != self.token {
            debug!(target: "bevy_llm_session", "engine: stale load result from {:?}", token);
            return Err(handle);
        }
        let EngineState::LoadingModel { model, .. } = &self.state else {
            return Err(handle);
        };
        info!(target: "bevy_llm_session", "engine: '{}' ready (handle={})", model, handle.id());
        let model = model.clone();
        self.state = EngineState::Ready { model, handle };
        Ok(())
    }

    pub fn on_failed(&mut self, token: LoadToken, err: &EngineError) -> Delivery {
        if token != self.token {
            debug!(target: "bevy_llm_session", "engine: stale load failure from {:?}: {}", token, err);
            return Delivery::Stale;
        }
        let EngineState::LoadingModel { model, .. } = &self.state else {
            return Delivery::Stale;
        };
        warn!(target: "bevy_llm_session", "engine: loading '{}' failed: {}", model, err);
        let model = model.clone();
        self.state = EngineState::Error { model, message: LOAD_FAILED_MESSAGE.to_string() };
        Delivery::Applied
    }

    /// invalidate any outstanding load and release the ready handle, if any.
    pub fn teardown(&mut self) -> Option<EngineHandle> {
        self.issue_token();
        let model = self.state.model().to_string();
        let previous = std::mem::replace(
            &mut self.state,
            EngineState::Error { model, message: SESSION_CLOSED_MESSAGE.to_string() },
        );
        Self::into_handle(previous)
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn model(&self) -> &str {
        self.state.model()
    }

    pub fn handle(&self) -> Option<&EngineHandle> {
        match &self.state {
            EngineState::Ready { handle, .. } => Some(handle),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, EngineState::Ready { .. })
    }

    pub fn token(&self) -> LoadToken {
        self.token
    }

    fn issue_token(&mut self) -> LoadToken {
        self.token = LoadToken(self.next_token);
        self.next_token += 1;
        self.token
    }

    fn into_handle(state: EngineState) -> Option<EngineHandle> {
        match state {
            EngineState::Ready { handle, .. } => Some(handle),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn progress_of(s: &EngineSession) -> Option<(f32, String)> {
        match s.state() {
            EngineState::LoadingModel { progress, .. } => {
                Some((progress.fraction(), progress.text().to_string()))
            }
            _ => None,
        }
    }

    #[test]
    fn initial_state_is_loading_at_zero() {
        let (s, _) = EngineSession::begin("m0");
        assert_eq!(progress_of(&s), Some((0.0, String::new())));
        assert_eq!(s.model(), "m0");
        assert!(!s.is_ready());
    }

    #[test]
    fn load_to_ready() {
        let (mut s, t) = EngineSession::begin("m1");
        for f in [0.1, 0.5, 1.0] {
            assert_eq!(s.on_progress(t, f, "loading"), Delivery::Applied);
        }
        assert_eq!(progress_of(&s), Some((1.0, "loading".into())));
        s.on_loaded(t, EngineHandle::new(1, "m1")).unwrap();
        assert_eq!(s.handle().map(|h| h.id()), Some(1));
    }

    #[test]
    fn failure_surfaces_generic_message() {
        let (mut s, t) = EngineSession::begin("m1");
        s.on_failed(t, &EngineError::Load("out of memory".into()));
        assert_eq!(
            s.state(),
            &EngineState::Error { model: "m1".into(), message: LOAD_FAILED_MESSAGE.into() }
        );
        assert!(s.handle().is_none());
    }

    #[test]
    fn superseded_load_is_ignored() {
        let (mut s, m1) = EngineSession::begin("m1");
        s.on_progress(m1, 0.5, "m1 half");
        let (m2, previous) = s.reload("m2");
        assert!(previous.is_none());

        assert_eq!(s.on_progress(m1, 0.8, "m1 late"), Delivery::Stale);
        assert_eq!(s.on_failed(m1, &EngineError::Load("late".into())), Delivery::Stale);
        let stale = s.on_loaded(m1, EngineHandle::new(9, "m1")).unwrap_err();
        assert_eq!(stale.id(), 9);
        assert_eq!(progress_of(&s), Some((0.0, String::new())));
        assert_eq!(s.model(), "m2");

        s.on_progress(m2, 0.3, "m2");
        assert_eq!(progress_of(&s), Some((0.3, "m2".into())));
    }

    #[test]
    fn reload_from_ready_returns_old_handle() {
        let (mut s, t) = EngineSession::begin("m1");
        s.on_loaded(t, EngineHandle::new(1, "m1")).unwrap();
        let (_, previous) = s.reload("m2");
        assert_eq!(previous.map(|h| h.id()), Some(1));
    }

    #[test]
    fn reload_from_error() {
        let (mut s, t) = EngineSession::begin("m1");
        s.on_failed(t, &EngineError::Load("nope".into()));
        let (t2, _) = s.reload("m1");
        assert_ne!(t, t2);
        assert!(matches!(s.state(), EngineState::LoadingModel { .. }));
    }

    #[test]
    fn teardown_invalidates_outstanding_load() {
        let (mut s, t) = EngineSession::begin("m1");
        assert!(s.teardown().is_none());
        assert!(s.on_loaded(t, EngineHandle::new(3, "m1")).is_err());
        assert_eq!(s.on_progress(t, 0.9, ""), Delivery::Stale);
    }
}
