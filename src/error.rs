//! error types for the session core and the engine boundary.

use crate::conversation::MessageId;
use crate::LLMError;

/// failures reported by an [`crate::engine::InferenceEngine`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("model load failed: {0}")]
    Load(String),
    #[error("generation failed: {0}")]
    Generation(String),
    #[error("final transcript unavailable: {0}")]
    Transcript(String),
    #[error("unknown engine handle {0}")]
    UnknownHandle(u64),
    #[error(transparent)]
    Provider(#[from] LLMError),
}

/// why a send was refused. a refused send never changes session state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendRejected {
    #[error("engine is not ready")]
    NotReady,
    #[error("input is empty")]
    EmptyInput,
    #[error("a reply is already in flight")]
    ReplyInFlight,
    #[error("input uses {used} of {quota} available tokens")]
    InputTooLong { used: usize, quota: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConversationError {
    #[error("trailing message is not an assistant message")]
    TrailingNotAssistant,
    #[error("no message with id {0:?}")]
    UnknownMessage(MessageId),
    #[error("message {0:?} is not an assistant message")]
    NotAssistant(MessageId),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AccumulatorError {
    #[error("accumulator is already open")]
    AlreadyOpen,
    #[error("accumulator is not open")]
    NotOpen,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("model '{0}' is not in the model list")]
    UnknownModel(String),
    #[error("model list is empty")]
    NoModels,
}
