//! Process lifecycle operations.
//!
//! fork, join, quit, zap and the block/unblock primitives. Every operation
//! runs in the kernel critical section and hands control to the dispatcher
//! whenever scheduling must be re-evaluated; a blocking operation returns
//! only after the dispatcher has resumed its caller.

use heapless::String as HString;
use log::{debug, trace};

use crate::abi::constants::{
    HIGHEST_PRIORITY, IDLE_PRIORITY, LOWEST_PRIORITY, MAX_ARG, MAX_NAME, MIN_STACK,
    RESERVED_STATUS_LIMIT,
};
use crate::error::ProcError;
use crate::kernel::Kernel;
use crate::process::{deque_remove, Pcb, Pid, ProcStatus, StartFn};

impl Kernel {
    /// Create a new process and schedule it.
    ///
    /// The child becomes a child of the calling process (bootstrap forks
    /// have no parent), is enqueued ready at `priority`, and the dispatcher
    /// runs immediately — a child that outranks its parent starts before
    /// `fork` returns.
    pub fn fork(
        &self,
        name: &str,
        entry: StartFn,
        arg: Option<&str>,
        stack_size: usize,
        priority: u8,
    ) -> Result<Pid, ProcError> {
        self.fork_inner(name, entry, arg, stack_size, priority, false)
    }

    pub(crate) fn fork_inner(
        &self,
        name: &str,
        entry: StartFn,
        arg: Option<&str>,
        stack_size: usize,
        priority: u8,
        idle: bool,
    ) -> Result<Pid, ProcError> {
        let mut st = self.enter("fork");
        debug!("fork(): creating process {:?} at priority {}", name, priority);

        if stack_size < MIN_STACK {
            self.leave(st);
            return Err(ProcError::StackTooSmall);
        }
        if name.is_empty() {
            self.leave(st);
            return Err(ProcError::InvalidArgument);
        }
        let in_range = (HIGHEST_PRIORITY..=LOWEST_PRIORITY).contains(&priority);
        if (!idle && !in_range) || (idle && priority != IDLE_PRIORITY) {
            self.leave(st);
            return Err(ProcError::InvalidArgument);
        }
        // Oversized names and arguments are caller bugs, not conditions to
        // report back.
        let mut pname: HString<MAX_NAME> = HString::new();
        if pname.push_str(name).is_err() {
            self.fatal(st, format_args!("fork(): process name too long"));
        }
        let mut parg: HString<MAX_ARG> = HString::new();
        if parg.push_str(arg.unwrap_or("")).is_err() {
            self.fatal(st, format_args!("fork(): start argument too long"));
        }

        let pid = match st.procs.allocate() {
            Ok(pid) => pid,
            Err(e) => {
                self.leave(st);
                return Err(e);
            }
        };

        // The context resumes at the launch trampoline, on its own stack.
        let kernel = self.self_ref();
        let context = self.machine().context_init(
            stack_size,
            Box::new(move || {
                let kernel = kernel.upgrade().expect("machine outlived the kernel");
                kernel.launch(entry);
            }),
        );

        let mut pcb = Pcb::new(pid, pname, parg, priority);
        pcb.context = context;
        pcb.stack_size = stack_size;
        pcb.parent = st.current;
        st.procs.insert(pcb);
        if let Some(parent) = st.current {
            let _ = st.procs.pcb_mut(parent).children.push_back(pid);
        }
        st.make_ready(pid);
        trace!("fork(): pid {} ready in slot {}", pid, pid as usize % crate::abi::constants::MAX_PROC);

        // Re-evaluate scheduling now — except for the idle process, which
        // must not run before the machine has anything else to do.
        if idle {
            self.leave(st);
        } else {
            self.dispatch(st);
        }
        Ok(pid)
    }

    /// First code run in a new process's context: enable interrupts, run
    /// the entry function, and feed its return value to quit.
    pub(crate) fn launch(&self, entry: StartFn) {
        self.enable_interrupts();
        let (pid, arg) = {
            let st = self.state().lock();
            let pid = st.current.expect("launch without a current process");
            (pid, st.procs.pcb(pid).arg.clone())
        };
        debug!("launch(): starting process {}", pid);
        let status = entry(self, arg.as_str());
        trace!("launch(): process {} returned {}", pid, status);
        self.quit_inner(status);
    }

    /// Wait for a child to quit and collect its status.
    ///
    /// Reaps the oldest unjoined dead child, returning its pid and quit
    /// status. Blocks when no child has quit yet. `NoChildren` if the
    /// caller has nothing to wait for; `Interrupted` if the caller was
    /// zapped — the dead child is reaped regardless.
    pub fn join(&self) -> Result<(Pid, i32), ProcError> {
        let mut st = self.enter("join");
        let cur = st.current.expect("join outside process context");

        let pcb = st.procs.pcb(cur);
        if pcb.children.is_empty() && pcb.dead_children.is_empty() {
            self.leave(st);
            return Err(ProcError::NoChildren);
        }

        let child = loop {
            if let Some(child) = st.procs.pcb_mut(cur).dead_children.pop_front() {
                break child;
            }
            trace!("join(): pid {} waiting for a child", cur);
            self.block_current(st, ProcStatus::JoinBlocked);
            st = self.reenter();
        };

        let (child_pid, status, context) = {
            let dead = st.procs.pcb(child);
            (dead.pid, dead.quit_status, dead.context)
        };
        st.procs.remove(child);
        self.machine().context_free(context);
        debug!("join(): pid {} reaped child {} (status {})", cur, child_pid, status);

        let zapped = !st.procs.pcb(cur).zappers.is_empty();
        self.leave(st);
        if zapped {
            Err(ProcError::Interrupted)
        } else {
            Ok((child_pid, status))
        }
    }

    /// Terminate the calling process. Never returns.
    pub fn quit(&self, status: i32) -> ! {
        self.quit_inner(status);
        // Only reached by an explicit quit from inside an entry function;
        // the context has already handed control away for good.
        self.machine().context_exit()
    }

    pub(crate) fn quit_inner(&self, status: i32) {
        let mut st = self.enter("quit");
        let cur = st.current.expect("quit outside process context");
        debug!("quit(): pid {} exiting with status {}", cur, status);

        // Termination is top-down: quitting over a live child is a bug in
        // the caller, not a recoverable state.
        if !st.procs.pcb(cur).children.is_empty() {
            self.fatal(
                st,
                format_args!("quit(): process {} still has active children", cur),
            );
        }

        let (priority, parent) = {
            let pcb = st.procs.pcb_mut(cur);
            pcb.status = ProcStatus::Quit;
            pcb.quit_status = status;
            (pcb.priority, pcb.parent)
        };
        st.ready.remove(priority, cur);

        // Hand ourselves to the parent as a zombie; wake it if it is
        // already waiting in join.
        if let Some(parent) = parent {
            let parent_waiting = {
                let ppcb = st.procs.pcb_mut(parent);
                deque_remove(&mut ppcb.children, cur);
                let _ = ppcb.dead_children.push_back(cur);
                ppcb.status == ProcStatus::JoinBlocked
            };
            if parent_waiting {
                st.make_ready(parent);
            }
        }

        // Everyone blocked zapping this process gets its answer now.
        loop {
            let zapper = st.procs.pcb_mut(cur).zappers.pop_front();
            match zapper {
                Some(z) => st.make_ready(z),
                None => break,
            }
        }

        // Zombie children nobody joined die with us.
        loop {
            let child = st.procs.pcb_mut(cur).dead_children.pop_front();
            match child {
                Some(c) => {
                    if let Some(dead) = st.procs.remove(c) {
                        self.machine().context_free(dead.context);
                    }
                }
                None => break,
            }
        }

        // Without a parent to reap us there is no zombie state to keep.
        if parent.is_none() {
            if let Some(dead) = st.procs.remove(cur) {
                self.machine().context_free(dead.context);
            }
        }

        self.dispatch_inner(st, false);
    }

    /// Ask `pid` to terminate and wait until it quits.
    ///
    /// Cooperative: the target keeps running (or sleeping) until it
    /// observes the request and quits on its own. `Interrupted` if the
    /// caller was itself zapped in the meantime. Zapping a process that
    /// has already quit succeeds immediately.
    pub fn zap(&self, pid: Pid) -> Result<(), ProcError> {
        let mut st = self.enter("zap");
        let cur = st.current.expect("zap outside process context");

        if pid == cur {
            self.fatal(st, format_args!("zap(): process {} tried to zap itself", cur));
        }
        let target_status = match st.procs.get(pid).map(|p| p.status) {
            Some(status) => status,
            None => {
                self.fatal(
                    st,
                    format_args!("zap(): target {} does not exist", pid),
                );
            }
        };
        debug!("zap(): pid {} zapping {}", cur, pid);

        if target_status == ProcStatus::Quit {
            let interrupted = !st.procs.pcb(cur).zappers.is_empty();
            self.leave(st);
            return if interrupted {
                Err(ProcError::Interrupted)
            } else {
                Ok(())
            };
        }

        let _ = st.procs.pcb_mut(pid).zappers.push_back(cur);
        self.block_current(st, ProcStatus::ZapBlocked);

        let st = self.reenter();
        let interrupted = !st.procs.pcb(cur).zappers.is_empty();
        self.leave(st);
        if interrupted {
            Err(ProcError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Whether someone has zapped the calling process. Every blocking
    /// primitive re-checks this on resumption; long-running processes
    /// should poll it and quit cooperatively.
    pub fn is_zapped(&self) -> bool {
        let st = self.state().lock();
        match st.current {
            Some(cur) => !st.procs.pcb(cur).zappers.is_empty(),
            None => false,
        }
    }

    /// Pid of the calling process (0 outside any process context).
    pub fn getpid(&self) -> Pid {
        self.state().lock().current.unwrap_or(0)
    }

    /// Block the calling process under a caller-chosen reason code.
    ///
    /// The reason must exceed `RESERVED_STATUS_LIMIT`; reserved codes
    /// belong to the built-in wait states. Returns `Interrupted` if the
    /// process was zapped while blocked.
    pub fn block_me(&self, reason: i32) -> Result<(), ProcError> {
        let st = self.enter("block_me");
        if reason <= RESERVED_STATUS_LIMIT {
            self.fatal(
                st,
                format_args!("block_me(): reserved block reason {}", reason),
            );
        }
        let cur = st.current.expect("block_me outside process context");
        trace!("block_me(): pid {} blocking with reason {}", cur, reason);
        self.block_current(st, ProcStatus::Blocked(reason));

        let st = self.reenter();
        let zapped = !st.procs.pcb(cur).zappers.is_empty();
        self.leave(st);
        if zapped {
            Err(ProcError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Make a `block_me`-blocked process runnable again.
    ///
    /// `NotBlocked` if the target does not exist, is the caller, or is in
    /// any built-in wait (join, zap, or a runnable state) — only
    /// caller-reason blocks can be lifted from outside. `Interrupted` if
    /// the caller was zapped during the reschedule that follows.
    pub fn unblock_proc(&self, pid: Pid) -> Result<(), ProcError> {
        let mut st = self.enter("unblock_proc");
        let cur = st.current.expect("unblock_proc outside process context");

        let unblockable = pid != cur
            && matches!(
                st.procs.get(pid).map(|p| p.status),
                Some(ProcStatus::Blocked(_))
            );
        if !unblockable {
            self.leave(st);
            return Err(ProcError::NotBlocked);
        }
        debug!("unblock_proc(): pid {} unblocking {}", cur, pid);
        st.make_ready(pid);
        self.dispatch(st);

        let st = self.reenter();
        let zapped = !st.procs.pcb(cur).zappers.is_empty();
        self.leave(st);
        if zapped {
            Err(ProcError::Interrupted)
        } else {
            Ok(())
        }
    }

    /// Cumulative CPU time of the calling process, milliseconds.
    pub fn read_time(&self) -> i64 {
        let st = self.state().lock();
        match st.current {
            Some(cur) => st.procs.pcb(cur).cpu_time / 1000,
            None => 0,
        }
    }

    /// Microsecond timestamp at which the current time slice started.
    pub fn read_cur_start_time(&self) -> i64 {
        let st = self.state().lock();
        match st.current {
            Some(cur) => st.procs.pcb(cur).time_started,
            None => 0,
        }
    }

    /// Diagnostic dump of the process table.
    pub fn dump_processes(&self) -> String {
        self.state().lock().procs.dump()
    }
}
