//! Machine substrate boundary.
//!
//! The kernel core never saves registers, toggles interrupt lines, or reads
//! hardware clocks itself; it consumes the narrow interface below. The core
//! stays portable across substrates — the host simulation in [`host`] is the
//! implementation used by the demo binary and the test suites.

pub mod host;

use bitflags::bitflags;

pub use host::HostMachine;

/// Opaque handle to a saved execution context (stack + resume point).
pub type ContextId = usize;

bitflags! {
    /// Processor status word.
    ///
    /// `CURRENT_*` bits describe the executing context; the `PREV_*` shadows
    /// hold the state to restore when an interrupt or trap returns.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Psr: u32 {
        /// Kernel privilege.
        const CURRENT_MODE = 1 << 0;
        /// Interrupts enabled.
        const CURRENT_INT = 1 << 1;
        const PREV_MODE = 1 << 2;
        const PREV_INT = 1 << 3;
    }
}

/// The simulated machine the kernel core runs on.
///
/// Exactly one context executes at a time. A blocking kernel operation
/// suspends its context through [`Machine::context_switch`]; control comes
/// back only when some later switch restores that context.
pub trait Machine: Send + Sync {
    /// Context of the bootstrap thread of control. It is never scheduled;
    /// it resumes only when the machine halts.
    fn boot_context(&self) -> ContextId;

    /// Register a fresh context with its own stack of at least `stack_size`
    /// bytes. `entry` runs when the context is first switched to.
    fn context_init(&self, stack_size: usize, entry: Box<dyn FnOnce() + Send>) -> ContextId;

    /// Suspend `save` (if given) and resume `restore`. `save == None` makes
    /// the switch one-way: the calling context is abandoned and will never
    /// be resumed. Switching a context to itself is a no-op.
    fn context_switch(&self, save: Option<ContextId>, restore: ContextId);

    /// Release the bookkeeping of a context that will never run again.
    fn context_free(&self, ctx: ContextId);

    /// Called by a context that has finished for good, after it has handed
    /// control away. Never returns.
    fn context_exit(&self) -> !;

    fn psr_get(&self) -> Psr;
    fn psr_set(&self, psr: Psr);

    /// Monotonic clock, microseconds.
    fn clock_us(&self) -> i64;

    /// Install the clock-interrupt handler.
    fn set_clock_handler(&self, handler: Box<dyn Fn() + Send + Sync>);

    /// Idle until the next interrupt, delivering it if interrupts are
    /// enabled.
    fn wait_int(&self);

    /// Dispatcher hook: `old` is swapped out, `new` is swapped in.
    fn note_switch(&self, old: Option<u32>, new: u32) {
        let _ = (old, new);
    }

    /// Stop the machine with an exit code. The bootstrap context resumes.
    fn halt(&self, code: i32) -> !;

    /// Exit code recorded by `halt`, once the machine has halted.
    fn halt_code(&self) -> Option<i32>;
}
