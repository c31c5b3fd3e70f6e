//! MINOS kernel core.
//!
//! An educational operating-system core on a simulated machine: a
//! fixed-capacity process table, a strict-priority preemptive scheduler
//! with FIFO tie-breaking, cooperative forced termination (zap), and
//! synchronous mailbox IPC built on the same blocking primitives.
//!
//! The core consumes its hardware through the [`hal::Machine`] trait; the
//! bundled [`hal::HostMachine`] backs each process context with a gated
//! host thread so the whole system runs — and is tested — in an ordinary
//! process.
//!
//! ```no_run
//! use minos_kernel::Kernel;
//!
//! let code = Kernel::boot("start", |k, _| {
//!     let child = k.fork("child", Box::new(|_, _| 7), None, 64 * 1024, 2).unwrap();
//!     let (pid, status) = k.join().unwrap();
//!     assert_eq!((pid, status), (child, 7));
//!     0
//! });
//! assert_eq!(code, 0);
//! ```

pub mod abi;
pub mod console;
pub mod error;
pub mod hal;
mod kernel;
#[path = "core/mod.rs"]
pub mod kernel_core;
pub mod process;

pub use error::{IpcError, ProcError};
pub use kernel::{BootConfig, Kernel};
pub use kernel_core::ipc::MboxId;
pub use process::{Pid, ProcStatus, StartFn};

pub const KERNEL_NAME: &str = env!("CARGO_PKG_NAME");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
