use std::fmt;

use serde::{Deserialize, Serialize};

/// Integer identifier of a managed object.
///
/// Handles are plain data on purpose: the heap snapshot stores them verbatim
/// and restoring a snapshot reinstalls exactly the same handle to record
/// mapping. `-1` is the null handle.
#[repr(transparent)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Handle(i32);

impl Handle {
    pub const NULL: Handle = Handle(-1);

    #[inline]
    pub const fn new(raw: i32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> i32 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 < 0
    }

    /// Slot index for non-null handles.
    #[inline]
    pub fn index(self) -> Option<usize> {
        usize::try_from(self.0).ok()
    }

    /// Reinterprets a raw operand-stack or field slot as a handle.
    #[inline]
    pub const fn from_slot(slot: i32) -> Self {
        if slot < 0 { Self::NULL } else { Self(slot) }
    }
}

impl Default for Handle {
    fn default() -> Self {
        Self::NULL
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "@{}", self.0)
        }
    }
}

/// Global id of an execution unit. Ids are never reused within a run.
#[repr(transparent)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ThreadId(pub u32);

impl ThreadId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

#[repr(transparent)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ClassId(pub u32);

impl ClassId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

#[repr(transparent)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MethodId(pub u32);

/// Id the state set hands out for a classified state.
#[repr(transparent)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StateId(pub u64);

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_handle_has_no_index() {
        assert!(Handle::NULL.is_null());
        assert_eq!(Handle::NULL.index(), None);
        assert_eq!(Handle::new(7).index(), Some(7));
    }

    #[test]
    fn negative_slots_decode_to_null() {
        assert_eq!(Handle::from_slot(-5), Handle::NULL);
        assert_eq!(Handle::from_slot(3), Handle::new(3));
    }

    #[test]
    fn handle_display_marks_null() {
        assert_eq!(Handle::NULL.to_string(), "null");
        assert_eq!(Handle::new(12).to_string(), "@12");
    }
}
