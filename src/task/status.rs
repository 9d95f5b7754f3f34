//! Task status state machine.

use std::fmt;

/// Execution status of a task.
///
/// `Suspended → Resuming → {Suspended | Done}` is the normal cycle;
/// `Canceled` and `Faulted` are terminal, and `Disconnected` is what a
/// detached handle reports; it is never stored in a live continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Waiting at a suspension point for the next resume.
    Suspended,
    /// Inside a resume step; transient, never observable between calls.
    Resuming,
    /// Explicitly canceled; the body never runs again.
    Canceled,
    /// Ran to completion; the return slot may hold a value.
    Done,
    /// The body panicked during a resume step.
    Faulted,
    /// The handle no longer refers to a computation.
    Disconnected,
}

impl Status {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            1 => Status::Resuming,
            2 => Status::Canceled,
            3 => Status::Done,
            4 => Status::Faulted,
            5 => Status::Disconnected,
            _ => Status::Suspended,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            Status::Suspended => 0,
            Status::Resuming => 1,
            Status::Canceled => 2,
            Status::Done => 3,
            Status::Faulted => 4,
            Status::Disconnected => 5,
        }
    }

    /// Whether no further resume can have an effect.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Canceled | Status::Done | Status::Faulted | Status::Disconnected
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Suspended => "Suspended",
            Status::Resuming => "Resuming",
            Status::Canceled => "Canceled",
            Status::Done => "Done",
            Status::Faulted => "Faulted",
            Status::Disconnected => "Disconnected",
        };
        write!(f, "{name}")
    }
}
