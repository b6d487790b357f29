//! Error types for the coroutine machine

use crate::state::CoroState;
use core::fmt;

/// Result type for machine operations
pub type CoroResult<T> = Result<T, CoroError>;

/// Errors that can occur in machine or coroutine operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoroError {
    /// The id bitmap is full; no more coroutines can be registered
    IdExhausted,

    /// Call on a coroutine that already has a caller bound
    OverlappingCall,

    /// Operation invoked in a state where it is not legal
    InvalidState {
        /// Operation that was attempted
        op: &'static str,
        /// State the coroutine was in
        state: CoroState,
    },

    /// poll(2) failed with an errno other than EINTR
    PollFailed(i32),

    /// The one-shot timer fd could not be created or armed
    TimerSetupFailed(i32),

    /// The coroutine stack could not be mapped
    StackSetupFailed(i32),

    /// The per-coroutine event fd could not be created
    EventSetupFailed(i32),

    /// A Call received a value of a different type than requested
    ValueTypeMismatch,
}

impl fmt::Display for CoroError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoroError::IdExhausted => write!(f, "coroutine id space exhausted"),
            CoroError::OverlappingCall => {
                write!(f, "call on a coroutine that already has a caller")
            }
            CoroError::InvalidState { op, state } => {
                write!(f, "invalid operation: {} (state {})", op, state)
            }
            CoroError::PollFailed(errno) => write!(f, "poll failed: errno {}", errno),
            CoroError::TimerSetupFailed(errno) => {
                write!(f, "timer fd setup failed: errno {}", errno)
            }
            CoroError::StackSetupFailed(errno) => {
                write!(f, "stack mapping failed: errno {}", errno)
            }
            CoroError::EventSetupFailed(errno) => {
                write!(f, "event fd setup failed: errno {}", errno)
            }
            CoroError::ValueTypeMismatch => {
                write!(f, "call received a value of an unexpected type")
            }
        }
    }
}

impl std::error::Error for CoroError {}

impl CoroError {
    /// Shorthand for the InvalidState variant
    #[inline]
    pub fn invalid(op: &'static str, state: CoroState) -> Self {
        CoroError::InvalidState { op, state }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            format!("{}", CoroError::IdExhausted),
            "coroutine id space exhausted"
        );
        assert_eq!(
            format!("{}", CoroError::invalid("yield", CoroState::Waiting)),
            "invalid operation: yield (state waiting)"
        );
        assert_eq!(
            format!("{}", CoroError::PollFailed(9)),
            "poll failed: errno 9"
        );
    }

    #[test]
    fn test_error_is_std_error() {
        fn assert_err<E: std::error::Error>(_e: E) {}
        assert_err(CoroError::OverlappingCall);
    }
}
