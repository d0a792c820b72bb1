//! Failure causes and the modem retry-delay encoding.

use std::time::Duration;

use thiserror::Error;

/// Failure kinds visible to bearer consumers.
///
/// `Modem` is a passthrough of the numeric cause reported by the data
/// service; the outer tracker maps it to permanent/transient.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum FailCause {
    #[error("no failure")]
    None,
    #[error("radio not available")]
    RadioNotAvailable,
    #[error("unacceptable network parameter")]
    UnacceptableNetworkParameter,
    #[error("handover failed")]
    HandoverFailed,
    #[error("lost connection")]
    LostConnection,
    #[error("unknown failure")]
    Unknown,
    #[error("modem failure cause {0}")]
    Modem(i32),
}

impl FailCause {
    pub fn is_failure(&self) -> bool {
        !matches!(self, FailCause::None)
    }

    /// The numeric modem cause, when this is a modem passthrough.
    pub fn modem_cause(&self) -> Option<i32> {
        match self {
            FailCause::Modem(c) => Some(*c),
            _ => None,
        }
    }
}

// ─── Retry hint ─────────────────────────────────────────────────────────────

/// Modem-suggested retry delay attached to a setup failure.
///
/// Wire encoding: a negative value means no suggestion, `0` means retry
/// as soon as possible, `i32::MAX` means do not retry, anything else is a
/// delay in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    NoSuggestion,
    Immediate,
    Never,
    After(Duration),
}

impl RetryHint {
    pub fn decode(raw: i32) -> RetryHint {
        match raw {
            r if r < 0 => RetryHint::NoSuggestion,
            0 => RetryHint::Immediate,
            i32::MAX => RetryHint::Never,
            ms => RetryHint::After(Duration::from_millis(ms as u64)),
        }
    }
}
