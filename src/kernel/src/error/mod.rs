//! Error handling for the kernel core.
//!
//! Two tiers exist. Recoverable conditions are returned to the caller as
//! typed errors from the enums below; each enum converts to the negative
//! sentinel code that a syscall-marshalling layer would hand to user code.
//! Fatal conditions (caller bugs: privilege violations, oversized names,
//! quitting with live children, slot-pool overflow) never surface as a
//! value — they halt the machine.

use core::fmt;

/// Recoverable errors from the process lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcError {
    /// Empty name or priority outside the allowed range.
    InvalidArgument,
    /// Requested stack below the machine minimum.
    StackTooSmall,
    /// No free slot in the process table.
    TableFull,
    /// The caller has neither live nor unjoined children.
    NoChildren,
    /// Target of `unblock_proc` does not exist, is the caller, or is not
    /// in an unblockable wait.
    NotBlocked,
    /// The caller was zapped while the operation was blocked.
    Interrupted,
}

impl From<ProcError> for i32 {
    fn from(err: ProcError) -> i32 {
        match err {
            ProcError::InvalidArgument => -1,
            ProcError::StackTooSmall => -2,
            ProcError::TableFull => -1,
            ProcError::NoChildren => -2,
            ProcError::NotBlocked => -2,
            ProcError::Interrupted => -1,
        }
    }
}

impl fmt::Display for ProcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProcError::InvalidArgument => write!(f, "invalid argument"),
            ProcError::StackTooSmall => write!(f, "stack size below minimum"),
            ProcError::TableFull => write!(f, "process table full"),
            ProcError::NoChildren => write!(f, "no children to join"),
            ProcError::NotBlocked => write!(f, "process not in an unblockable wait"),
            ProcError::Interrupted => write!(f, "interrupted by zap"),
        }
    }
}

/// Recoverable errors from the mailbox subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpcError {
    /// Unknown or inactive mailbox, or a message/buffer size violation.
    Invalid,
    /// A conditional operation found the mailbox full (send) or empty
    /// (receive), or the slot pool exhausted.
    WouldBlock,
    /// The caller was zapped, or the mailbox was released, while blocked.
    Interrupted,
}

impl From<IpcError> for i32 {
    fn from(err: IpcError) -> i32 {
        match err {
            IpcError::Invalid => -1,
            IpcError::WouldBlock => -2,
            IpcError::Interrupted => -3,
        }
    }
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            IpcError::Invalid => write!(f, "invalid mailbox or argument"),
            IpcError::WouldBlock => write!(f, "operation would block"),
            IpcError::Interrupted => write!(f, "interrupted by zap or release"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_error_codes() {
        assert_eq!(i32::from(ProcError::InvalidArgument), -1);
        assert_eq!(i32::from(ProcError::StackTooSmall), -2);
        assert_eq!(i32::from(ProcError::TableFull), -1);
        assert_eq!(i32::from(ProcError::NoChildren), -2);
        assert_eq!(i32::from(ProcError::NotBlocked), -2);
        assert_eq!(i32::from(ProcError::Interrupted), -1);
    }

    #[test]
    fn ipc_error_codes() {
        assert_eq!(i32::from(IpcError::Invalid), -1);
        assert_eq!(i32::from(IpcError::WouldBlock), -2);
        assert_eq!(i32::from(IpcError::Interrupted), -3);
    }
}
