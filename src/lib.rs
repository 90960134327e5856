//! Process-memory monitoring and fault injection for Linux user-space
//! programs.
//!
//! `fim` launches or attaches to a target process, stops it with ptrace,
//! walks its virtual memory map, flags 64-bit words that look like
//! pointers, and can mutate selected words to simulate bit-flip and
//! stuck-at faults. A bytewise checkpoint of the target's writable memory
//! undoes the damage, and a signal-driven command channel lets the traced
//! process request checkpoint, restore, scan, and injection passes at run
//! time.
//!
//! # Examples
//! ```no_run
//! use fim::{scan_for_pointers, NullStrategy};
//!
//! # fn main() -> fim::Result<()> {
//! let mut controller = fim::attach(1234)?;
//! if let Some(stats) = scan_for_pointers(&controller, &NullStrategy, 4)? {
//!     println!("{}", stats);
//! }
//! controller.detach()?;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod checkpoint;
pub mod error;
pub mod monitor;
pub mod ptrace;
pub mod region;
pub mod scanner;
pub mod self_scan;
pub mod stats;
pub mod strategy;

pub use channel::{CommandInfo, CommandKind};
pub use checkpoint::{CheckpointStore, CriuCheckpoint, MemoryChunk};
pub use error::{FimError, Result};
pub use monitor::{MonitorConfig, MonitorController, MonitorMode};
pub use ptrace::{AttachGuard, ProcessController};
pub use region::{PointerClass, Region, RegionMap};
pub use scanner::scan_for_pointers;
pub use self_scan::SelfScanner;
pub use stats::ScanStats;
pub use strategy::{
    ChangeOutcome, ErrorInjectionStrategy, ErrorType, InjectionQuota, InjectionStrategy,
    NullStrategy, ValueChange,
};

/// Attaches to a running process and returns the controller for it.
///
/// # Arguments
/// * `pid` - Target process ID
pub fn attach(pid: i32) -> Result<ProcessController> {
    let mut controller = ProcessController::new(pid)?;
    controller.attach()?;
    Ok(controller)
}
