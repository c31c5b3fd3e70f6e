//! Process table and descriptors.
//!
//! The table owns one slot per possible process; a pid maps to slot
//! `pid % MAX_PROC` and allocation skips occupied slots, so a live pid is
//! resolvable without searching. Family relations (children, unjoined dead
//! children, pending zappers) are bounded FIFO queues of pids kept inside
//! the descriptor they belong to.

pub mod lifecycle;

use core::fmt::Write as _;

use heapless::{Deque, String as HString};

use crate::abi::constants::{MAX_ARG, MAX_NAME, MAX_PROC};
use crate::error::ProcError;
use crate::hal::ContextId;

pub type Pid = u32;

/// Entry point of a process: runs on the process's own context, receives
/// the kernel handle and the start argument, returns the quit status.
pub type StartFn = Box<dyn FnOnce(&crate::Kernel, &str) -> i32 + Send>;

/// Scheduling state of a process.
///
/// The empty table slot is represented by `None` in the table itself, not
/// by a status value. `Blocked` carries the caller-supplied reason from
/// `block_me`; built-in waits have their own variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcStatus {
    Ready,
    Running,
    /// Quantum expired; the dispatcher will rotate it to the back of its
    /// queue.
    TimeSliced,
    JoinBlocked,
    ZapBlocked,
    /// Terminal. The descriptor survives as a zombie until reaped.
    Quit,
    Blocked(i32),
}

impl ProcStatus {
    pub fn is_runnable(&self) -> bool {
        matches!(
            self,
            ProcStatus::Ready | ProcStatus::Running | ProcStatus::TimeSliced
        )
    }
}

impl core::fmt::Display for ProcStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            ProcStatus::Ready => write!(f, "READY"),
            ProcStatus::Running => write!(f, "RUNNING"),
            ProcStatus::TimeSliced => write!(f, "TIME_SLICED"),
            ProcStatus::JoinBlocked => write!(f, "JOIN_BLOCKED"),
            ProcStatus::ZapBlocked => write!(f, "ZAP_BLOCKED"),
            ProcStatus::Quit => write!(f, "QUIT"),
            ProcStatus::Blocked(reason) => write!(f, "BLOCKED({reason})"),
        }
    }
}

/// Process control block.
pub struct Pcb {
    pub pid: Pid,
    pub name: HString<MAX_NAME>,
    pub arg: HString<MAX_ARG>,
    pub priority: u8,
    pub status: ProcStatus,
    pub context: ContextId,
    pub stack_size: usize,
    pub parent: Option<Pid>,
    pub children: Deque<Pid, MAX_PROC>,
    pub dead_children: Deque<Pid, MAX_PROC>,
    pub zappers: Deque<Pid, MAX_PROC>,
    pub quit_status: i32,
    /// Start of the current time slice, microseconds.
    pub time_started: i64,
    /// Accumulated CPU time, microseconds.
    pub cpu_time: i64,
}

impl Pcb {
    pub fn new(pid: Pid, name: HString<MAX_NAME>, arg: HString<MAX_ARG>, priority: u8) -> Pcb {
        Pcb {
            pid,
            name,
            arg,
            priority,
            status: ProcStatus::Ready,
            context: 0,
            stack_size: 0,
            parent: None,
            children: Deque::new(),
            dead_children: Deque::new(),
            zappers: Deque::new(),
            quit_status: 0,
            time_started: 0,
            cpu_time: 0,
        }
    }
}

/// Remove `pid` from a pid queue, preserving the order of the rest.
pub(crate) fn deque_remove<const N: usize>(queue: &mut Deque<Pid, N>, pid: Pid) {
    for _ in 0..queue.len() {
        if let Some(p) = queue.pop_front() {
            if p != pid {
                let _ = queue.push_back(p);
            }
        }
    }
}

/// The fixed-capacity process table.
pub struct ProcTable {
    slots: [Option<Pcb>; MAX_PROC],
    next_pid: Pid,
    num_procs: usize,
}

impl ProcTable {
    pub fn new() -> ProcTable {
        ProcTable {
            slots: [const { None }; MAX_PROC],
            next_pid: 1,
            num_procs: 0,
        }
    }

    pub fn num_procs(&self) -> usize {
        self.num_procs
    }

    /// Reserve the next free pid. The caller must `insert` the descriptor
    /// before releasing the kernel lock.
    pub fn allocate(&mut self) -> Result<Pid, ProcError> {
        if self.num_procs >= MAX_PROC {
            return Err(ProcError::TableFull);
        }
        // Skip slots whose previous occupant collides modulo MAX_PROC.
        while self.slots[self.next_pid as usize % MAX_PROC].is_some() {
            self.next_pid += 1;
        }
        let pid = self.next_pid;
        self.next_pid += 1;
        Ok(pid)
    }

    pub fn insert(&mut self, pcb: Pcb) {
        let slot = pcb.pid as usize % MAX_PROC;
        debug_assert!(self.slots[slot].is_none());
        self.slots[slot] = Some(pcb);
        self.num_procs += 1;
    }

    pub fn get(&self, pid: Pid) -> Option<&Pcb> {
        self.slots[pid as usize % MAX_PROC]
            .as_ref()
            .filter(|p| p.pid == pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Pcb> {
        self.slots[pid as usize % MAX_PROC]
            .as_mut()
            .filter(|p| p.pid == pid)
    }

    /// Look up a pid that is known to be live.
    pub(crate) fn pcb(&self, pid: Pid) -> &Pcb {
        self.get(pid).expect("live pid")
    }

    pub(crate) fn pcb_mut(&mut self, pid: Pid) -> &mut Pcb {
        self.get_mut(pid).expect("live pid")
    }

    /// Return a slot to the empty state.
    pub fn remove(&mut self, pid: Pid) -> Option<Pcb> {
        let slot = pid as usize % MAX_PROC;
        match &self.slots[slot] {
            Some(p) if p.pid == pid => {
                self.num_procs -= 1;
                self.slots[slot].take()
            }
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Pcb> {
        self.slots.iter().filter_map(|s| s.as_ref())
    }

    /// Diagnostic table dump: one line per occupied slot.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<6}{:<8}{:<10}{:<16}{:<7}{:<9}{}",
            "PID", "PARENT", "PRIORITY", "STATUS", "KIDS", "CPU(ms)", "NAME"
        );
        for pcb in self.iter() {
            let parent = match pcb.parent {
                Some(p) => p as i64,
                None => -1,
            };
            let _ = writeln!(
                out,
                "{:<6}{:<8}{:<10}{:<16}{:<7}{:<9}{}",
                pcb.pid,
                parent,
                pcb.priority,
                pcb.status.to_string(),
                pcb.children.len(),
                pcb.cpu_time / 1000,
                pcb.name
            );
        }
        out
    }
}

impl Default for ProcTable {
    fn default() -> Self {
        Self::new()
    }
}
