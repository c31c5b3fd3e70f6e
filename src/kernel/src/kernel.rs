//! The kernel object and the boot flow.
//!
//! All mutable kernel tables live in one `KernelState` behind a single
//! lock; holding the guard is the critical section that the simulated
//! "interrupts disabled" state mirrors. Every public operation enters the
//! critical section on its way in and releases it either at its tail or by
//! handing the guard to the dispatcher.

use std::sync::{Arc, Weak};

use log::{error, info};
use spin::{Mutex, MutexGuard};

use crate::abi::constants::{IDLE_PRIORITY, MIN_STACK, TIME_SLICE_US};
use crate::hal::{HostMachine, Machine, Psr};
use crate::kernel_core::ipc::MboxState;
use crate::kernel_core::scheduler::ReadyQueues;
use crate::process::{Pid, ProcStatus, ProcTable};

/// Tunables fixed at boot.
#[derive(Debug, Clone, Copy)]
pub struct BootConfig {
    /// Quantum a process may hold the CPU before the clock interrupt
    /// forces a reschedule, microseconds.
    pub time_slice_us: i64,
    /// Priority of the start process.
    pub start_priority: u8,
    /// Stack size of the start process, bytes.
    pub start_stack: usize,
}

impl Default for BootConfig {
    fn default() -> Self {
        BootConfig {
            time_slice_us: TIME_SLICE_US,
            start_priority: 1,
            start_stack: 2 * MIN_STACK,
        }
    }
}

/// Every mutable table of the core, owned as one unit.
pub(crate) struct KernelState {
    pub(crate) procs: ProcTable,
    pub(crate) ready: ReadyQueues,
    pub(crate) current: Option<Pid>,
    pub(crate) mbox: MboxState,
}

impl KernelState {
    fn new() -> KernelState {
        KernelState {
            procs: ProcTable::new(),
            ready: ReadyQueues::new(),
            current: None,
            mbox: MboxState::new(),
        }
    }

    /// Put a process back on its ready queue.
    pub(crate) fn make_ready(&mut self, pid: Pid) {
        let priority = {
            let pcb = self.procs.pcb_mut(pid);
            pcb.status = ProcStatus::Ready;
            pcb.priority
        };
        self.ready.enqueue(priority, pid);
    }
}

/// The kernel core: process table, scheduler, and mailboxes over a
/// [`Machine`] substrate.
pub struct Kernel {
    machine: Arc<dyn Machine>,
    config: BootConfig,
    state: Mutex<KernelState>,
    self_ref: Weak<Kernel>,
}

impl Kernel {
    /// Boot on a fresh host machine with default configuration and run
    /// `start` as the first process. Returns the machine's exit code.
    pub fn boot<F>(name: &str, start: F) -> i32
    where
        F: FnOnce(&Kernel, &str) -> i32 + Send + 'static,
    {
        Self::boot_with(Arc::new(HostMachine::new()), BootConfig::default(), name, start)
    }

    /// Boot on the given machine: initialize the tables, install the clock
    /// handler, create the idle and start processes, and dispatch. Returns
    /// when the machine halts.
    pub fn boot_with<F>(machine: Arc<dyn Machine>, config: BootConfig, name: &str, start: F) -> i32
    where
        F: FnOnce(&Kernel, &str) -> i32 + Send + 'static,
    {
        let kernel = Arc::new_cyclic(|weak| Kernel {
            machine: machine.clone(),
            config,
            state: Mutex::new(KernelState::new()),
            self_ref: weak.clone(),
        });
        info!("{} {} booting", crate::KERNEL_NAME, crate::VERSION);

        // Kernel mode, interrupts off until the first dispatch.
        machine.psr_set(Psr::CURRENT_MODE);

        let weak = Arc::downgrade(&kernel);
        machine.set_clock_handler(Box::new(move || {
            if let Some(kernel) = weak.upgrade() {
                kernel.time_slice();
            }
        }));

        // The idle process keeps the machine occupied when everything else
        // is blocked, and is the only process below the normal priority
        // range.
        if let Err(e) = kernel.fork_inner(
            "idle",
            Box::new(|k, _| k.idle_loop()),
            None,
            MIN_STACK,
            IDLE_PRIORITY,
            true,
        ) {
            error!("boot: creating the idle process failed: {}", e);
            machine.halt(1);
        }

        // Forking the start process dispatches away from the bootstrap
        // context; control returns here only once the machine halts.
        if let Err(e) = kernel.fork_inner(
            name,
            Box::new(start),
            None,
            config.start_stack,
            config.start_priority,
            false,
        ) {
            error!("boot: creating the start process failed: {}", e);
            machine.halt(1);
        }

        match machine.halt_code() {
            Some(code) => {
                info!("halted with code {}", code);
                code
            }
            None => {
                error!("bootstrap context resumed without a halt");
                1
            }
        }
    }

    pub(crate) fn machine(&self) -> &dyn Machine {
        &*self.machine
    }

    pub(crate) fn config(&self) -> &BootConfig {
        &self.config
    }

    pub(crate) fn state(&self) -> &Mutex<KernelState> {
        &self.state
    }

    pub(crate) fn self_ref(&self) -> Weak<Kernel> {
        self.self_ref.clone()
    }

    /// Enter the kernel critical section: verify privilege, mask the
    /// clock, take the state lock.
    pub(crate) fn enter(&self, op: &str) -> MutexGuard<'_, KernelState> {
        self.require_kernel_mode(op);
        self.disable_interrupts();
        self.state.lock()
    }

    /// Re-enter after being rescheduled mid-operation.
    pub(crate) fn reenter(&self) -> MutexGuard<'_, KernelState> {
        self.disable_interrupts();
        self.state.lock()
    }

    /// Leave the critical section without a reschedule.
    pub(crate) fn leave(&self, st: MutexGuard<'_, KernelState>) {
        drop(st);
        self.enable_interrupts();
    }

    /// Unrecoverable caller bug: report and stop the machine.
    pub(crate) fn fatal(&self, st: MutexGuard<'_, KernelState>, args: core::fmt::Arguments) -> ! {
        drop(st);
        self.halt_error(args)
    }

    pub(crate) fn halt_error(&self, args: core::fmt::Arguments) -> ! {
        error!("{}", args);
        self.machine.halt(1)
    }

    pub(crate) fn require_kernel_mode(&self, op: &str) {
        if !self.machine.psr_get().contains(Psr::CURRENT_MODE) {
            self.halt_error(format_args!("{}: called while in user mode", op));
        }
    }

    pub(crate) fn disable_interrupts(&self) {
        let psr = self.machine.psr_get();
        if !psr.contains(Psr::CURRENT_MODE) {
            self.halt_error(format_args!("interrupts may only be disabled in kernel mode"));
        }
        self.machine.psr_set(psr - Psr::CURRENT_INT);
    }

    pub(crate) fn enable_interrupts(&self) {
        let psr = self.machine.psr_get();
        if !psr.contains(Psr::CURRENT_MODE) {
            self.halt_error(format_args!("interrupts may only be enabled in kernel mode"));
        }
        self.machine.psr_set(psr | Psr::CURRENT_INT);
    }

    /// Body of the idle process: watch for completion or deadlock, then
    /// sleep until the next interrupt.
    fn idle_loop(&self) -> i32 {
        loop {
            self.check_deadlock();
            self.machine.wait_int();
        }
    }

    /// The idle process runs only when nothing else can. With no device
    /// interrupt sources in the core, a blocked process can only be woken
    /// by another process — so if anything besides idle still exists now,
    /// it will wait forever.
    fn check_deadlock(&self) {
        let st = self.state.lock();
        let remaining = st.procs.num_procs();
        if remaining > 1 {
            error!(
                "deadlock: {} processes remain but none is runnable",
                remaining - 1
            );
            drop(st);
            self.machine.halt(1);
        }
        drop(st);
        info!("all processes completed");
        self.machine.halt(0);
    }
}
