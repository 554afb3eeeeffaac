use thiserror::Error;

use crate::{Handle, ThreadId};

/// Failures of the object store.
///
/// `OutOfHandles` and `TooManyThreads` are resource exhaustion of the
/// simulated program and surface as a thrown `OutOfMemoryError`; the other
/// variants mean the engine itself is broken.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeapError {
    #[error("handle space of {thread} exhausted ({capacity} handles)")]
    OutOfHandles { thread: ThreadId, capacity: usize },
    #[error("{thread} exceeds the {max} execution units the heap is configured for")]
    TooManyThreads { thread: ThreadId, max: usize },
    #[error("array of {length} elements exceeds the {max_slots} slot limit")]
    ArrayTooLarge { length: usize, max_slots: usize },
    #[error("pin-down count of {0} overflowed")]
    PinOverflow(Handle),
    #[error("no live object for handle {0}")]
    UnknownHandle(Handle),
    #[error("class `{0}` does not describe this kind of record")]
    WrongKind(String),
}

impl HeapError {
    pub fn is_resource_exhaustion(&self) -> bool {
        matches!(
            self,
            HeapError::OutOfHandles { .. }
                | HeapError::TooManyThreads { .. }
                | HeapError::ArrayTooLarge { .. }
        )
    }
}

/// Fatal engine defects. None of these is recoverable within the search.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("inconsistent engine state: {0}")]
    Inconsistent(String),
    #[error("unknown class `{0}`")]
    UnknownClass(String),
    #[error("unknown method `{0}`")]
    UnknownMethod(String),
    #[error("unknown field `{field}` in class `{class}`")]
    UnknownField { class: String, field: String },
    #[error("invalid program counter {pc} in `{method}`")]
    InvalidPc { method: String, pc: usize },
    #[error("operand stack overflow in `{0}`")]
    OperandOverflow(String),
    #[error("operand stack underflow in `{0}`")]
    OperandUnderflow(String),
    #[error("unknown thread {0}")]
    UnknownThread(ThreadId),
    #[error("no scheduled thread for the current transition")]
    NoScheduledThread,
    #[error("trace replay diverged at transition {index}: {reason}")]
    ReplayDiverged { index: usize, reason: String },
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Build(#[from] BuildError),
}

/// What an instruction can fail with.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// Throw a freshly allocated exception of `class` in the current thread.
    #[error("{class}: {message}")]
    Throw { class: String, message: String },
    /// Throw an exception object the program already holds.
    #[error("exception object {0}")]
    Exception(Handle),
    /// Simulated resource exhaustion, thrown as `OutOfMemoryError`.
    #[error(transparent)]
    Resource(HeapError),
    #[error(transparent)]
    Engine(EngineError),
}

impl ExecError {
    pub fn throw(class: &str, message: impl Into<String>) -> Self {
        ExecError::Throw {
            class: class.to_owned(),
            message: message.into(),
        }
    }
}

impl From<HeapError> for ExecError {
    fn from(err: HeapError) -> Self {
        if err.is_resource_exhaustion() {
            ExecError::Resource(err)
        } else {
            ExecError::Engine(EngineError::Heap(err))
        }
    }
}

impl From<EngineError> for ExecError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Heap(heap) => heap.into(),
            other => ExecError::Engine(other),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid heap settings: {0}")]
    Heap(&'static str),
    #[error("invalid search settings: {0}")]
    Search(&'static str),
}

/// Malformed method under construction.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("label L{label} of `{method}` is already bound")]
    LabelAlreadyBound { method: String, label: usize },
    #[error("label L{label} of `{method}` is unbound")]
    LabelUnbound { method: String, label: usize },
    #[error("method `{0}` has no instructions")]
    EmptyMethod(String),
}

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("trace i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("trace format: {0}")]
    Format(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_exhaustion_becomes_resource_error() {
        let err: ExecError = HeapError::OutOfHandles {
            thread: ThreadId(1),
            capacity: 4,
        }
        .into();
        assert!(matches!(err, ExecError::Resource(_)));
    }

    #[test]
    fn wrapped_exhaustion_is_still_a_resource_error() {
        let err: ExecError = EngineError::Heap(HeapError::TooManyThreads {
            thread: ThreadId(9),
            max: 8,
        })
        .into();
        assert!(matches!(err, ExecError::Resource(_)));
    }

    #[test]
    fn unknown_handle_is_an_engine_defect() {
        let err: ExecError = HeapError::UnknownHandle(Handle::new(3)).into();
        assert!(matches!(err, ExecError::Engine(EngineError::Heap(_))));
    }
}
