//! Host-side machine simulation.
//!
//! Each context is backed by an OS thread parked on a gate; a context
//! switch opens the target's gate and closes the caller's, so exactly one
//! context makes progress at any moment — the single-logical-CPU model.
//! The clock is virtual: it advances by a fixed cost per context switch,
//! by one tick per `wait_int`, and by whatever a test adds explicitly.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex};
use std::thread;

use log::{error, trace};

use super::{ContextId, Machine, Psr};
use crate::abi::constants::CLOCK_TICK_US;

/// Virtual time consumed by one context switch, microseconds.
const SWITCH_COST_US: i64 = 10;

/// One context's run permission.
struct Gate {
    open: StdMutex<bool>,
    cv: Condvar,
}

impl Gate {
    fn new() -> Arc<Gate> {
        Arc::new(Gate {
            open: StdMutex::new(false),
            cv: Condvar::new(),
        })
    }

    fn close(&self) {
        *self.open.lock().expect("gate lock") = false;
    }

    fn open(&self) {
        *self.open.lock().expect("gate lock") = true;
        self.cv.notify_one();
    }

    fn wait_open(&self) {
        let mut open = self.open.lock().expect("gate lock");
        while !*open {
            open = self.cv.wait(open).expect("gate lock");
        }
    }
}

struct HostInner {
    contexts: spin::Mutex<Vec<Arc<Gate>>>,
    psr: AtomicU32,
    clock: AtomicI64,
    tick_us: i64,
    halt_code: spin::Mutex<Option<i32>>,
    clock_handler: spin::Mutex<Option<Arc<dyn Fn() + Send + Sync>>>,
    boot_thread: thread::ThreadId,
}

impl HostInner {
    /// Record the exit code and resume the bootstrap context.
    fn begin_halt(&self, code: i32) {
        let mut halted = self.halt_code.lock();
        if halted.is_none() {
            *halted = Some(code);
        }
        drop(halted);
        let boot = self.contexts.lock()[BOOT_CONTEXT].clone();
        boot.open();
    }
}

/// The bootstrap thread's context id.
pub const BOOT_CONTEXT: ContextId = 0;

/// Thread-backed [`Machine`] for running the kernel on a host OS.
pub struct HostMachine {
    inner: Arc<HostInner>,
}

impl HostMachine {
    /// A machine whose clock interrupt fires every `tick_us` of virtual
    /// time spent in `wait_int`.
    pub fn with_tick(tick_us: i64) -> Self {
        HostMachine {
            inner: Arc::new(HostInner {
                contexts: spin::Mutex::new(vec![Gate::new()]),
                psr: AtomicU32::new(Psr::CURRENT_MODE.bits()),
                clock: AtomicI64::new(0),
                tick_us,
                halt_code: spin::Mutex::new(None),
                clock_handler: spin::Mutex::new(None),
                boot_thread: thread::current().id(),
            }),
        }
    }

    pub fn new() -> Self {
        Self::with_tick(CLOCK_TICK_US)
    }

    /// Move the virtual clock forward. Test hook for exercising time
    /// slices and CPU accounting without real time passing.
    pub fn advance_clock(&self, us: i64) {
        self.inner.clock.fetch_add(us, Ordering::Relaxed);
    }
}

impl Default for HostMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine for HostMachine {
    fn boot_context(&self) -> ContextId {
        BOOT_CONTEXT
    }

    fn context_init(&self, stack_size: usize, entry: Box<dyn FnOnce() + Send>) -> ContextId {
        let gate = Gate::new();
        let id = {
            let mut contexts = self.inner.contexts.lock();
            contexts.push(gate.clone());
            contexts.len() - 1
        };
        let inner = self.inner.clone();
        thread::Builder::new()
            .name(format!("context-{id}"))
            .stack_size(stack_size)
            .spawn(move || {
                gate.wait_open();
                // A panic here is a kernel bug, not a scheduling event;
                // surface it as an abnormal halt so the embedder sees it
                // instead of a wedged machine.
                if catch_unwind(AssertUnwindSafe(entry)).is_err() {
                    error!("context {} panicked; halting", id);
                    inner.begin_halt(1);
                }
            })
            .expect("spawning a context thread");
        id
    }

    fn context_switch(&self, save: Option<ContextId>, restore: ContextId) {
        if save == Some(restore) {
            return;
        }
        self.inner.clock.fetch_add(SWITCH_COST_US, Ordering::Relaxed);
        let (save_gate, restore_gate) = {
            let contexts = self.inner.contexts.lock();
            (save.map(|s| contexts[s].clone()), contexts[restore].clone())
        };
        // Close our own gate before opening the target's: the target may
        // switch right back before we start waiting, and that wake must
        // not be lost.
        if let Some(gate) = &save_gate {
            gate.close();
        }
        restore_gate.open();
        if let Some(gate) = save_gate {
            gate.wait_open();
        }
    }

    fn context_free(&self, ctx: ContextId) {
        trace!("context {} freed", ctx);
    }

    fn context_exit(&self) -> ! {
        loop {
            thread::park();
        }
    }

    fn psr_get(&self) -> Psr {
        Psr::from_bits_truncate(self.inner.psr.load(Ordering::Relaxed))
    }

    fn psr_set(&self, psr: Psr) {
        self.inner.psr.store(psr.bits(), Ordering::Relaxed);
    }

    fn clock_us(&self) -> i64 {
        self.inner.clock.load(Ordering::Relaxed)
    }

    fn set_clock_handler(&self, handler: Box<dyn Fn() + Send + Sync>) {
        *self.inner.clock_handler.lock() = Some(Arc::from(handler));
    }

    fn wait_int(&self) {
        self.inner.clock.fetch_add(self.inner.tick_us, Ordering::Relaxed);
        if !self.psr_get().contains(Psr::CURRENT_INT) {
            return;
        }
        // Clone out of the lock: the handler may block this context.
        let handler = self.inner.clock_handler.lock().clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn note_switch(&self, old: Option<u32>, new: u32) {
        trace!("swap out {:?}, swap in {}", old, new);
    }

    fn halt(&self, code: i32) -> ! {
        self.inner.begin_halt(code);
        if thread::current().id() == self.inner.boot_thread {
            // Nothing can resume the bootstrap context if it parks here.
            panic!("machine halted during bootstrap (code {code})");
        }
        self.context_exit()
    }

    fn halt_code(&self) -> Option<i32> {
        *self.inner.halt_code.lock()
    }
}
