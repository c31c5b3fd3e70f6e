//! Scheduling and lifecycle behavior, driven through full boots on the
//! host machine. Process bodies record what happened into shared logs;
//! the assertions run on the test thread once the machine has halted.

use std::sync::{Arc, Mutex};

use minos_kernel::abi::constants::MIN_STACK;
use minos_kernel::hal::HostMachine;
use minos_kernel::{BootConfig, Kernel, ProcError};

type Log = Arc<Mutex<Vec<String>>>;

fn log(events: &Log, entry: impl Into<String>) {
    events.lock().unwrap().push(entry.into());
}

fn config(start_priority: u8) -> BootConfig {
    BootConfig {
        start_priority,
        ..BootConfig::default()
    }
}

#[test]
fn fork_then_join_returns_child_pid_and_status() {
    let events: Log = Log::default();
    let ev = events.clone();
    let code = Kernel::boot("start", move |k, _| {
        let child = k
            .fork("child", Box::new(|_, _| 42), None, MIN_STACK, 2)
            .unwrap();
        match k.join() {
            Ok((pid, status)) if pid == child => log(&ev, format!("joined:{status}")),
            other => log(&ev, format!("unexpected:{other:?}")),
        }
        if k.join() == Err(ProcError::NoChildren) {
            log(&ev, "no-children");
        }
        0
    });
    assert_eq!(code, 0);
    assert_eq!(
        events.lock().unwrap().as_slice(),
        ["joined:42", "no-children"]
    );
}

#[test]
fn higher_precedence_child_preempts_its_parent() {
    let events: Log = Log::default();
    let ev = events.clone();
    let machine = Arc::new(HostMachine::new());
    let code = Kernel::boot_with(machine, config(3), "start", move |k, _| {
        let ev2 = ev.clone();
        k.fork(
            "eager",
            Box::new(move |_, _| {
                log(&ev2, "child-ran");
                0
            }),
            None,
            MIN_STACK,
            2,
        )
        .unwrap();
        // With the child at higher precedence, fork must not return
        // until the child has quit.
        log(&ev, "fork-returned");
        k.join().unwrap();
        0
    });
    assert_eq!(code, 0);
    assert_eq!(
        events.lock().unwrap().as_slice(),
        ["child-ran", "fork-returned"]
    );
}

#[test]
fn same_priority_processes_run_in_fork_order() {
    let events: Log = Log::default();
    let ev = events.clone();
    let code = Kernel::boot("start", move |k, _| {
        for name in ["first", "second", "third"] {
            let ev2 = ev.clone();
            k.fork(
                name,
                Box::new(move |_, _| {
                    log(&ev2, name);
                    0
                }),
                None,
                MIN_STACK,
                2,
            )
            .unwrap();
        }
        for _ in 0..3 {
            k.join().unwrap();
        }
        0
    });
    assert_eq!(code, 0);
    assert_eq!(
        events.lock().unwrap().as_slice(),
        ["first", "second", "third"]
    );
}

#[test]
fn exhausted_quantum_rotates_within_the_level() {
    let events: Log = Log::default();
    let ev = events.clone();
    let machine = Arc::new(HostMachine::new());
    let m = machine.clone();
    let code = Kernel::boot_with(machine, config(1), "start", move |k, _| {
        let ev_a = ev.clone();
        let m2 = m.clone();
        k.fork(
            "a",
            Box::new(move |k, _| {
                log(&ev_a, "a:first-half");
                // Burn the quantum, then let the clock interrupt logic run.
                m2.advance_clock(100_000);
                k.time_slice();
                log(&ev_a, "a:second-half");
                0
            }),
            None,
            MIN_STACK,
            2,
        )
        .unwrap();
        let ev_b = ev.clone();
        k.fork(
            "b",
            Box::new(move |_, _| {
                log(&ev_b, "b:ran");
                0
            }),
            None,
            MIN_STACK,
            2,
        )
        .unwrap();
        k.join().unwrap();
        k.join().unwrap();
        0
    });
    assert_eq!(code, 0);
    assert_eq!(
        events.lock().unwrap().as_slice(),
        ["a:first-half", "b:ran", "a:second-half"]
    );
}

#[test]
fn join_without_children_reports_immediately() {
    let code = Kernel::boot("start", |k, _| {
        assert_eq!(k.join(), Err(ProcError::NoChildren));
        0
    });
    assert_eq!(code, 0);
}

#[test]
fn fork_argument_validation() {
    let results: Arc<Mutex<Vec<Result<u32, ProcError>>>> = Arc::default();
    let res = results.clone();
    let code = Kernel::boot("start", move |k, _| {
        res.lock()
            .unwrap()
            .push(k.fork("p", Box::new(|_, _| 0), None, 16, 2));
        res.lock()
            .unwrap()
            .push(k.fork("", Box::new(|_, _| 0), None, MIN_STACK, 2));
        res.lock()
            .unwrap()
            .push(k.fork("p", Box::new(|_, _| 0), None, MIN_STACK, 0));
        res.lock()
            .unwrap()
            .push(k.fork("p", Box::new(|_, _| 0), None, MIN_STACK, 6));
        0
    });
    assert_eq!(code, 0);
    assert_eq!(
        results.lock().unwrap().as_slice(),
        [
            Err(ProcError::StackTooSmall),
            Err(ProcError::InvalidArgument),
            Err(ProcError::InvalidArgument),
            Err(ProcError::InvalidArgument),
        ]
    );
}

#[test]
fn quitting_with_live_children_halts_the_machine() {
    let code = Kernel::boot("start", |k, _| {
        k.fork(
            "stuck",
            Box::new(|k, _| {
                let _ = k.block_me(20);
                0
            }),
            None,
            MIN_STACK,
            2,
        )
        .unwrap();
        // Returning here quits while the child is still alive.
        0
    });
    assert_eq!(code, 1);
}

#[test]
fn zapping_a_finished_process_succeeds_immediately() {
    let events: Log = Log::default();
    let ev = events.clone();
    let machine = Arc::new(HostMachine::new());
    let code = Kernel::boot_with(machine, config(3), "start", move |k, _| {
        let child = k
            .fork("short", Box::new(|_, _| 5), None, MIN_STACK, 2)
            .unwrap();
        // The child outranked us, so it has already quit.
        match k.zap(child) {
            Ok(()) => log(&ev, "zap-ok"),
            Err(e) => log(&ev, format!("zap-err:{e:?}")),
        }
        k.join().unwrap();
        0
    });
    assert_eq!(code, 0);
    assert_eq!(events.lock().unwrap().as_slice(), ["zap-ok"]);
}

#[test]
fn zap_blocks_until_the_target_quits() {
    let events: Log = Log::default();
    let ev = events.clone();
    let machine = Arc::new(HostMachine::new());
    let code = Kernel::boot_with(machine, config(3), "start", move |k, _| {
        let ev_v = ev.clone();
        let victim = k
            .fork(
                "victim",
                Box::new(move |k, _| {
                    // Blocks, and learns of the zap when woken.
                    if k.block_me(20) == Err(ProcError::Interrupted) {
                        log(&ev_v, "victim:saw-zap");
                    }
                    99
                }),
                None,
                MIN_STACK,
                2,
            )
            .unwrap();
        let ev_w = ev.clone();
        k.fork(
            "waker",
            Box::new(move |k, _| {
                log(&ev_w, "waker:unblocking");
                k.unblock_proc(victim).unwrap();
                0
            }),
            None,
            MIN_STACK,
            4,
        )
        .unwrap();
        log(&ev, "start:zapping");
        k.zap(victim).unwrap();
        log(&ev, "start:zap-returned");
        let (pid, status) = k.join().unwrap();
        assert_eq!((pid, status), (victim, 99));
        k.join().unwrap();
        0
    });
    assert_eq!(code, 0);
    assert_eq!(
        events.lock().unwrap().as_slice(),
        [
            "start:zapping",
            "waker:unblocking",
            "victim:saw-zap",
            "start:zap-returned"
        ]
    );
}

#[test]
fn zapper_zapped_while_waiting_is_interrupted() {
    let events: Log = Log::default();
    let ev = events.clone();
    let machine = Arc::new(HostMachine::new());
    let code = Kernel::boot_with(machine, config(3), "start", move |k, _| {
        let b = k
            .fork(
                "b",
                Box::new(|k, _| {
                    let _ = k.block_me(20);
                    7
                }),
                None,
                MIN_STACK,
                2,
            )
            .unwrap();
        let ev_a = ev.clone();
        let a = k
            .fork(
                "a",
                Box::new(move |k, _| {
                    match k.zap(b) {
                        Err(ProcError::Interrupted) => log(&ev_a, "a:interrupted"),
                        other => log(&ev_a, format!("a:unexpected:{other:?}")),
                    }
                    0
                }),
                None,
                MIN_STACK,
                2,
            )
            .unwrap();
        let ev_c = ev.clone();
        k.fork(
            "c",
            Box::new(move |k, _| {
                match k.zap(a) {
                    Ok(()) => log(&ev_c, "c:zap-ok"),
                    Err(e) => log(&ev_c, format!("c:unexpected:{e:?}")),
                }
                0
            }),
            None,
            MIN_STACK,
            2,
        )
        .unwrap();
        // Wake b; its quit releases a, whose own zapper (c) taints the
        // result; a's quit in turn releases c.
        k.unblock_proc(b).unwrap();
        for _ in 0..3 {
            k.join().unwrap();
        }
        0
    });
    assert_eq!(code, 0);
    assert_eq!(
        events.lock().unwrap().as_slice(),
        ["a:interrupted", "c:zap-ok"]
    );
}

#[test]
fn join_interrupted_by_zap_still_reaps_the_zombie() {
    let events: Log = Log::default();
    let ev = events.clone();
    let machine = Arc::new(HostMachine::new());
    let code = Kernel::boot_with(machine, config(3), "start", move |k, _| {
        let ev_p = ev.clone();
        let parent = k
            .fork(
                "parent",
                Box::new(move |k, _| {
                    k.fork("slow", Box::new(|_, _| 5), None, MIN_STACK, 4)
                        .unwrap();
                    match k.join() {
                        Err(ProcError::Interrupted) => log(&ev_p, "parent:join-interrupted"),
                        other => log(&ev_p, format!("parent:unexpected:{other:?}")),
                    }
                    0
                }),
                None,
                MIN_STACK,
                2,
            )
            .unwrap();
        // parent is join-blocked on its slow child; zap it while it waits.
        k.zap(parent).unwrap();
        k.join().unwrap();
        // Exit code 0 also proves the zombie was reaped: a leaked slot
        // would read as a deadlock instead of a clean shutdown.
        0
    });
    assert_eq!(code, 0);
    assert_eq!(
        events.lock().unwrap().as_slice(),
        ["parent:join-interrupted"]
    );
}

#[test]
fn unjoined_zombies_are_reaped_by_the_parents_quit() {
    let code = Kernel::boot("start", |k, _| {
        k.fork(
            "parent",
            Box::new(|k, _| {
                // The child outranks us and quits before fork returns;
                // quitting without joining leaves it to our own quit.
                k.fork("short", Box::new(|_, _| 1), None, MIN_STACK, 1)
                    .unwrap();
                0
            }),
            None,
            MIN_STACK,
            2,
        )
        .unwrap();
        k.join().unwrap();
        0
    });
    // A leaked zombie slot would surface as a deadlock halt (code 1).
    assert_eq!(code, 0);
}

#[test]
fn unblock_proc_rejects_unblockable_targets() {
    let results: Arc<Mutex<Vec<Result<(), ProcError>>>> = Arc::default();
    let res = results.clone();
    let code = Kernel::boot("start", move |k, _| {
        let me = k.getpid();
        res.lock().unwrap().push(k.unblock_proc(9999));
        res.lock().unwrap().push(k.unblock_proc(me));
        let ready = k
            .fork("ready", Box::new(|_, _| 0), None, MIN_STACK, 2)
            .unwrap();
        // The child is ready, not blocked.
        res.lock().unwrap().push(k.unblock_proc(ready));
        k.join().unwrap();
        0
    });
    assert_eq!(code, 0);
    assert_eq!(
        results.lock().unwrap().as_slice(),
        [
            Err(ProcError::NotBlocked),
            Err(ProcError::NotBlocked),
            Err(ProcError::NotBlocked),
        ]
    );
}

#[test]
fn reserved_block_reason_halts_the_machine() {
    let code = Kernel::boot("start", |k, _| {
        let _ = k.block_me(5);
        0
    });
    assert_eq!(code, 1);
}

#[test]
fn blocked_system_with_no_wake_source_is_a_deadlock() {
    let code = Kernel::boot("start", |k, _| {
        let _ = k.block_me(20);
        0
    });
    assert_eq!(code, 1);
}

#[test]
fn dump_shows_live_processes_and_their_states() {
    let dump: Arc<Mutex<String>> = Arc::default();
    let d = dump.clone();
    let machine = Arc::new(HostMachine::new());
    let code = Kernel::boot_with(machine, config(3), "start", move |k, _| {
        // The sleeper outranks us: it runs and parks itself before the
        // dump is taken.
        let sleeper = k
            .fork(
                "sleeper",
                Box::new(|k, _| {
                    let _ = k.block_me(21);
                    0
                }),
                None,
                MIN_STACK,
                2,
            )
            .unwrap();
        *d.lock().unwrap() = k.dump_processes();
        k.unblock_proc(sleeper).unwrap();
        k.join().unwrap();
        0
    });
    assert_eq!(code, 0);
    let dump = dump.lock().unwrap();
    assert!(dump.contains("start"));
    assert!(dump.contains("RUNNING"));
    assert!(dump.contains("sleeper"));
    assert!(dump.contains("BLOCKED(21)"));
    assert!(dump.contains("idle"));
}

#[test]
fn pids_are_unique_and_cpu_time_accumulates() {
    let seen: Arc<Mutex<Vec<u32>>> = Arc::default();
    let times: Arc<Mutex<Vec<i64>>> = Arc::default();
    let s = seen.clone();
    let t = times.clone();
    let machine = Arc::new(HostMachine::new());
    let m = machine.clone();
    let code = Kernel::boot_with(machine, config(1), "start", move |k, _| {
        s.lock().unwrap().push(k.getpid());
        let s2 = s.clone();
        let t2 = t.clone();
        let m2 = m.clone();
        k.fork(
            "worker",
            Box::new(move |k, _| {
                s2.lock().unwrap().push(k.getpid());
                m2.advance_clock(100_000);
                k.time_slice();
                // Rotated once, so the burned quantum is on the books.
                t2.lock().unwrap().push(k.read_time());
                0
            }),
            None,
            MIN_STACK,
            2,
        )
        .unwrap();
        k.join().unwrap();
        0
    });
    assert_eq!(code, 0);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2);
    assert_ne!(seen[0], seen[1]);
    assert!(times.lock().unwrap()[0] >= 100);
}
