//! folds the chunk stream of one generation request into a running buffer.

use crate::error::AccumulatorError;

/// identity of one generation request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Phase {
    #[default]
    Idle,
    Open,
    Closed,
    Cancelled,
}

/// running text of a single reply. chunks are concatenated in arrival order,
/// never reordered or deduplicated.
#[derive(Clone, Debug, Default)]
pub struct StreamAccumulator {
    request: Option<RequestId>,
    buffer: String,
    phase: Phase,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&mut self, request: RequestId) -> Result<(), AccumulatorError> {
        if self.is_open() {
            return Err(AccumulatorError::AlreadyOpen);
        }
        self.request = Some(request);
        self.buffer.clear();
        self.phase = Phase::Open;
        Ok(())
    }

    /// append `chunk` and return the full buffer so far.
    pub fn apply(&mut self, chunk: &str) -> Result<&str, AccumulatorError> {
        if !self.is_open() {
            return Err(AccumulatorError::NotOpen);
        }
        self.buffer.push_str(chunk);
        Ok(&self.buffer)
    }

    /// finalize the reply. an authoritative transcript, when given, replaces
    /// the locally concatenated text.
    pub fn close(&mut self, authoritative: Option<String>) -> Result<String, AccumulatorError> {
        if !self.is_open() {
            return Err(AccumulatorError::NotOpen);
        }
        if let Some(text) = authoritative {
            self.buffer = text;
        }
        self.phase = Phase::Closed;
        Ok(self.buffer.clone())
    }

    pub fn cancel(&mut self) {
        self.buffer.clear();
        self.phase = Phase::Cancelled;
    }

    pub fn request(&self) -> Option<RequestId> {
        self.request
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_open(&self) -> bool {
        self.phase == Phase::Open
    }
}
