use std::{fmt, fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::{ChoiceSpec, ThreadId, TraceError};

/// One transition of a path: the thread that ran and every choice the
/// transition consumed, cascaded generators included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub thread: ThreadId,
    pub choices: Vec<ChoiceSpec>,
}

/// Ordered transitions from the initial state. Enough to replay a run
/// without deciding any nondeterminism again.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub transitions: Vec<TransitionRecord>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: TransitionRecord) {
        self.transitions.push(record);
    }

    pub fn pop(&mut self) -> Option<TransitionRecord> {
        self.transitions.pop()
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.transitions.iter()
    }

    pub fn to_json(&self) -> Result<String, TraceError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, TraceError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), TraceError> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        Self::from_json(&fs::read_to_string(path)?)
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (index, record) in self.transitions.iter().enumerate() {
            write!(f, "#{index:<4} {}", record.thread)?;
            for spec in &record.choices {
                write!(
                    f,
                    "  {}={} ({}/{})",
                    spec.generator,
                    spec.choice,
                    spec.index + 1,
                    spec.total
                )?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
