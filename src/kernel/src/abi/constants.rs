//! Fixed limits of the kernel core.
//!
//! Every table in the core has a hard capacity so that resource exhaustion
//! is an explicit condition rather than an allocation failure.

/// Number of slots in the process table. A pid maps to slot
/// `pid % MAX_PROC`; allocation skips occupied slots.
pub const MAX_PROC: usize = 50;

/// Maximum process name length, in bytes. Exceeding it is a caller bug and
/// halts the machine.
pub const MAX_NAME: usize = 32;

/// Maximum start-argument length, in bytes. Same fatality as `MAX_NAME`.
pub const MAX_ARG: usize = 64;

/// Smallest stack a process may be forked with.
pub const MIN_STACK: usize = 64 * 1024;

/// Highest-precedence priority level (lower number runs first).
pub const HIGHEST_PRIORITY: u8 = 1;

/// Lowest-precedence priority level available to ordinary processes.
pub const LOWEST_PRIORITY: u8 = 5;

/// Reserved priority of the singleton idle process, below the normal range.
pub const IDLE_PRIORITY: u8 = 6;

/// Number of ready-queue levels (priorities `1..=IDLE_PRIORITY`).
pub const PRIORITY_LEVELS: usize = IDLE_PRIORITY as usize;

/// Number of slots in the mailbox table.
pub const MAX_MBOX: usize = 50;

/// Size of the mail-slot pool shared by all mailboxes.
pub const MAX_SLOTS: usize = 200;

/// Largest message a mail slot can carry, in bytes.
pub const MAX_MESSAGE: usize = 144;

/// Block reasons at or below this value are reserved for built-in states.
/// `block_me` rejects them; `unblock_proc` refuses to wake them.
pub const RESERVED_STATUS_LIMIT: i32 = 10;

/// Block reason of a sender waiting for mailbox capacity.
pub const SEND_BLOCKED: i32 = 11;

/// Block reason of a receiver waiting for a message.
pub const RECV_BLOCKED: i32 = 12;

/// Default time-slice quantum, in microseconds.
pub const TIME_SLICE_US: i64 = 80_000;

/// Default interval between clock interrupts, in microseconds.
pub const CLOCK_TICK_US: i64 = 20_000;
