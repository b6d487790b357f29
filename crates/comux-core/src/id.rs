//! Coroutine identifier type

use core::fmt;

/// Unique identifier for a coroutine.
///
/// Dense non-negative integer handed out by the machine's id bitmap and
/// recycled after the coroutine dies. The maximum value (`u32::MAX`) is
/// reserved as a sentinel for "no coroutine".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct CoroId(u32);

impl CoroId {
    /// Sentinel value indicating no coroutine
    pub const NONE: CoroId = CoroId(u32::MAX);

    /// Create a new CoroId from a raw value
    #[inline]
    pub const fn new(id: u32) -> Self {
        CoroId(id)
    }

    /// Get the raw u32 value
    #[inline]
    pub const fn as_u32(self) -> u32 {
        self.0
    }

    /// Get as usize for indexing
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == u32::MAX
    }

    /// Check if this is a valid coroutine id
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != u32::MAX
    }
}

impl From<u32> for CoroId {
    #[inline]
    fn from(id: u32) -> Self {
        CoroId(id)
    }
}

impl From<CoroId> for u32 {
    #[inline]
    fn from(id: CoroId) -> Self {
        id.0
    }
}

impl fmt::Debug for CoroId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "CoroId(NONE)")
        } else {
            write!(f, "CoroId({})", self.0)
        }
    }
}

impl fmt::Display for CoroId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for CoroId {
    fn default() -> Self {
        CoroId::NONE
    }
}
