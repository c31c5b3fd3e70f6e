//! MINOS demo boot.
//!
//! Boots the kernel on the host machine and runs a small scenario: a
//! rendezvous ping/pong pair, a buffered producer/consumer pair, and a
//! process-table dump while everything is in flight.

use log::LevelFilter;
use minos_kernel::{console, Kernel, KERNEL_NAME, VERSION};

const MIN_STACK: usize = minos_kernel::abi::constants::MIN_STACK;

fn main() {
    let level = std::env::args()
        .find_map(|arg| arg.strip_prefix("--log=").map(str::to_owned))
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    console::init(level);

    println!("======= {} {} booting =======", KERNEL_NAME, VERSION);

    let code = Kernel::boot("start", |k, _| {
        // Rendezvous pair: no buffering, sends and receives pair up.
        let court = k.mbox_create(0, 16).unwrap();
        k.fork(
            "ping",
            Box::new(move |k, _| {
                for n in 0u32..3 {
                    k.mbox_send(court, &n.to_le_bytes()).unwrap();
                }
                0
            }),
            None,
            MIN_STACK,
            3,
        )
        .unwrap();
        k.fork(
            "pong",
            Box::new(move |k, _| {
                let mut buf = [0u8; 16];
                for _ in 0..3 {
                    let len = k.mbox_receive(court, &mut buf).unwrap();
                    let n = u32::from_le_bytes(buf[..len].try_into().unwrap());
                    log::info!("pong: received {}", n);
                }
                0
            }),
            None,
            MIN_STACK,
            3,
        )
        .unwrap();

        // Buffered pair: the producer outruns the consumer and blocks on
        // the full mailbox until slots free up.
        let line = k.mbox_create(2, 32).unwrap();
        k.fork(
            "producer",
            Box::new(move |k, _| {
                for n in 0u32..5 {
                    k.mbox_send(line, format!("item-{n}").as_bytes()).unwrap();
                }
                0
            }),
            None,
            MIN_STACK,
            4,
        )
        .unwrap();
        k.fork(
            "consumer",
            Box::new(move |k, _| {
                let mut buf = [0u8; 32];
                for _ in 0..5 {
                    let len = k.mbox_receive(line, &mut buf).unwrap();
                    log::info!("consumer: got {}", String::from_utf8_lossy(&buf[..len]));
                }
                0
            }),
            None,
            MIN_STACK,
            5,
        )
        .unwrap();

        print!("{}", k.dump_processes());

        // Reap all four workers.
        for _ in 0..4 {
            let (pid, status) = k.join().unwrap();
            log::info!("start: child {} quit with {}", pid, status);
        }
        0
    });

    println!("halted with code {code}");
    std::process::exit(code);
}
