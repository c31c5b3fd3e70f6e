//! Ready queues and the dispatcher.
//!
//! One FIFO queue per priority level; a lower level number means higher
//! scheduling precedence. The running process stays at the head of its
//! level until it blocks, quits, or is rotated to the back, so a process
//! that yields and remains runnable keeps its place in line.

use heapless::Deque;
use log::trace;
use spin::MutexGuard;

use crate::abi::constants::{MAX_PROC, PRIORITY_LEVELS};
use crate::kernel::{Kernel, KernelState};
use crate::process::{deque_remove, Pid, ProcStatus};

pub struct ReadyQueues {
    levels: [Deque<Pid, MAX_PROC>; PRIORITY_LEVELS],
}

impl ReadyQueues {
    pub fn new() -> ReadyQueues {
        ReadyQueues {
            levels: [const { Deque::new() }; PRIORITY_LEVELS],
        }
    }

    pub fn enqueue(&mut self, priority: u8, pid: Pid) {
        // Capacity equals the process table; a live pid always fits.
        let _ = self.levels[priority as usize - 1].push_back(pid);
    }

    pub fn remove(&mut self, priority: u8, pid: Pid) {
        deque_remove(&mut self.levels[priority as usize - 1], pid);
    }

    /// Move the head of a level to its back.
    pub fn rotate(&mut self, priority: u8) {
        let level = &mut self.levels[priority as usize - 1];
        if let Some(pid) = level.pop_front() {
            let _ = level.push_back(pid);
        }
    }

    /// Head of the first non-empty level, scanning from the highest
    /// precedence down.
    pub fn next(&self) -> Option<Pid> {
        self.levels.iter().find_map(|level| level.front().copied())
    }

    pub fn position(&self, priority: u8, pid: Pid) -> Option<usize> {
        self.levels[priority as usize - 1]
            .iter()
            .position(|&p| p == pid)
    }
}

impl Default for ReadyQueues {
    fn default() -> Self {
        Self::new()
    }
}

impl Kernel {
    /// Select and switch to the highest-precedence runnable process.
    ///
    /// Consumes the state guard: the critical section ends at the context
    /// switch. Control returns to the caller only when its process is
    /// scheduled again — or immediately, if it remains the best choice.
    pub(crate) fn dispatch(&self, st: MutexGuard<'_, KernelState>) {
        self.dispatch_inner(st, true)
    }

    /// `save_current == false` makes the switch one-way (the quit path):
    /// the outgoing context is abandoned rather than suspended.
    pub(crate) fn dispatch_inner(&self, mut st: MutexGuard<'_, KernelState>, save_current: bool) {
        let now = self.machine().clock_us();

        let (old_pid, old_context, new_context, next) = {
            let state = &mut *st;

            // Requeue or retire the outgoing process.
            if let Some(cur) = state.current {
                if let Some(pcb) = state.procs.get_mut(cur) {
                    match pcb.status {
                        ProcStatus::TimeSliced => {
                            pcb.cpu_time += now - pcb.time_started;
                            pcb.time_started = now;
                            pcb.status = ProcStatus::Ready;
                            state.ready.rotate(pcb.priority);
                        }
                        ProcStatus::Running | ProcStatus::Ready => {}
                        ProcStatus::Quit => {} // already dequeued by quit
                        _ => {
                            // Blocked in some form: off the ready list entirely.
                            pcb.cpu_time += now - pcb.time_started;
                            pcb.time_started = now;
                            state.ready.remove(pcb.priority, cur);
                        }
                    }
                }
            }

            let next = match state.ready.next() {
                Some(pid) => pid,
                // Only reachable transiently at bootstrap.
                None => return,
            };

            // A process that yielded voluntarily but is still runnable
            // gives way only to higher precedence; rotate it behind its
            // peers.
            if let Some(cur) = state.current {
                if cur != next {
                    if let Some(pcb) = state.procs.get_mut(cur) {
                        if pcb.status == ProcStatus::Running {
                            pcb.cpu_time += now - pcb.time_started;
                            pcb.time_started = now;
                            pcb.status = ProcStatus::Ready;
                            state.ready.rotate(pcb.priority);
                        }
                    }
                }
            }

            let changed = state.current != Some(next);
            let new_context = {
                let pcb = state.procs.pcb_mut(next);
                pcb.status = ProcStatus::Running;
                if changed {
                    pcb.time_started = now;
                }
                pcb.context
            };

            let old_pid = state.current;
            let old_context = if !save_current {
                None
            } else {
                match old_pid {
                    Some(pid) => state.procs.get(pid).map(|p| p.context),
                    None => Some(self.machine().boot_context()),
                }
            };

            state.current = Some(next);
            (old_pid, old_context, new_context, next)
        };

        trace!("dispatch: {:?} -> {}", old_pid, next);
        self.machine().note_switch(old_pid, next);
        drop(st);
        self.enable_interrupts();
        self.machine().context_switch(old_context, new_context);
    }

    /// Suspend the current process with the given status and reschedule.
    pub(crate) fn block_current(&self, mut st: MutexGuard<'_, KernelState>, status: ProcStatus) {
        let cur = st.current.expect("no running process");
        st.procs.pcb_mut(cur).status = status;
        self.dispatch(st);
    }

    /// Reschedule if the running process has exhausted its quantum;
    /// otherwise just return to it. Invoked from the clock interrupt.
    pub fn time_slice(&self) {
        let st = self.enter("time_slice");
        let now = self.machine().clock_us();
        if let Some(cur) = st.current {
            let elapsed = now - st.procs.pcb(cur).time_started;
            if elapsed > self.config().time_slice_us {
                trace!("time_slice: pid {} exhausted its quantum", cur);
                self.block_current(st, ProcStatus::TimeSliced);
                return;
            }
        }
        self.leave(st);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_priority_then_fifo() {
        let mut ready = ReadyQueues::new();
        ready.enqueue(3, 30);
        ready.enqueue(1, 10);
        ready.enqueue(1, 11);
        assert_eq!(ready.next(), Some(10));
        ready.remove(1, 10);
        assert_eq!(ready.next(), Some(11));
        ready.remove(1, 11);
        assert_eq!(ready.next(), Some(30));
    }

    #[test]
    fn rotation_moves_head_to_back() {
        let mut ready = ReadyQueues::new();
        ready.enqueue(2, 1);
        ready.enqueue(2, 2);
        ready.rotate(2);
        assert_eq!(ready.next(), Some(2));
        assert_eq!(ready.position(2, 1), Some(1));
    }
}
