//! Signal-driven command channel between the traced process and its
//! monitor.
//!
//! The target raises `SIGUSR1` at the monitor with a packed 64-bit payload
//! in the signal value; the monitor answers with a bare `SIGUSR2`. The
//! monitor-side handlers are async-signal-safe: they perform exactly two
//! atomic stores and nothing else. Everything observable happens in the
//! main loop via [`take_pending_command`].

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use libc::{c_int, c_void, pid_t, siginfo_t};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::getppid;

use crate::error::{FimError, Result};

/// Target -> monitor request signal.
pub const MONITOR_REQUEST_SIGNAL: Signal = Signal::SIGUSR1;
/// Monitor -> target response signal.
pub const MONITOR_RESPONSE_SIGNAL: Signal = Signal::SIGUSR2;

/// How long `send_command` waits for the monitor's acknowledgment.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

const PARAM_BITS: u32 = 28;
const PARAM_MASK: u64 = (1 << PARAM_BITS) - 1;
const KIND_SHIFT: u32 = 56;

/// Largest value either command parameter can carry.
pub const MAX_COMMAND_PARAM: u64 = PARAM_MASK;

/// Requests the target can make of the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CommandKind {
    NoOp = 0,
    /// Snapshot writable memory.
    Checkpoint = 1,
    /// Roll writable memory back to the snapshot.
    Restore = 2,
    /// Run a scan pass with the configured injection strategy.
    InjectErrors = 3,
    /// Run a read-only scan pass.
    Scan = 4,
}

impl CommandKind {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(CommandKind::NoOp),
            1 => Some(CommandKind::Checkpoint),
            2 => Some(CommandKind::Restore),
            3 => Some(CommandKind::InjectErrors),
            4 => Some(CommandKind::Scan),
            _ => None,
        }
    }
}

/// One command with its two 28-bit parameters.
///
/// Packed layout: kind in bits 56..63, `param1` in bits 28..55, `param2`
/// in bits 0..27. The packed form fits one aligned 64-bit store, which is
/// what makes the handler-side hand-off tear-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandInfo {
    pub kind: CommandKind,
    pub param1: u64,
    pub param2: u64,
}

impl CommandInfo {
    pub fn new(kind: CommandKind, param1: u64, param2: u64) -> Self {
        debug_assert!(param1 <= MAX_COMMAND_PARAM && param2 <= MAX_COMMAND_PARAM);
        Self {
            kind,
            param1,
            param2,
        }
    }

    pub fn pack(&self) -> u64 {
        ((self.kind as u64) << KIND_SHIFT)
            | ((self.param1 & PARAM_MASK) << PARAM_BITS)
            | (self.param2 & PARAM_MASK)
    }

    pub fn unpack(raw: u64) -> Self {
        let kind = CommandKind::from_raw((raw >> KIND_SHIFT) as u8).unwrap_or_else(|| {
            log::warn!("unknown command kind in payload {:#x}", raw);
            CommandKind::NoOp
        });
        Self {
            kind,
            param1: (raw >> PARAM_BITS) & PARAM_MASK,
            param2: raw & PARAM_MASK,
        }
    }
}

// Monitor-side slot for the last received command. The payload is a single
// 64-bit word so the handler can hand it over with one aligned store; the
// pending flag publishes it with release ordering and the main loop
// consumes it with acquire.
static PENDING_PAYLOAD: AtomicU64 = AtomicU64::new(0);
static COMMAND_PENDING: AtomicBool = AtomicBool::new(false);
static TRACED_CHILD_PID: AtomicI32 = AtomicI32::new(0);

// Target-side acknowledgment flag.
static RESPONSE_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_request_signal(_signo: c_int, info: *mut siginfo_t, _ctx: *mut c_void) {
    if info.is_null() {
        return;
    }
    let payload = unsafe { (*info).si_value().sival_ptr } as u64;
    PENDING_PAYLOAD.store(payload, Ordering::Relaxed);
    COMMAND_PENDING.store(true, Ordering::Release);
}

extern "C" fn handle_child_fault_signal(_signo: c_int, info: *mut siginfo_t, _ctx: *mut c_void) {
    if info.is_null() {
        return;
    }
    let sender = unsafe { (*info).si_pid() };
    if sender == 0 || sender != TRACED_CHILD_PID.load(Ordering::Relaxed) {
        return;
    }
    // The child crashed on injected damage: synthesize a restore request
    // through the regular dispatch path.
    let payload = CommandInfo::new(CommandKind::Restore, 0, 0).pack();
    PENDING_PAYLOAD.store(payload, Ordering::Relaxed);
    COMMAND_PENDING.store(true, Ordering::Release);
}

extern "C" fn handle_response_signal(_signo: c_int, _info: *mut siginfo_t, _ctx: *mut c_void) {
    RESPONSE_RECEIVED.store(true, Ordering::Release);
}

fn install_handler(signal: Signal, handler: SigHandler) -> Result<()> {
    let action = SigAction::new(handler, SaFlags::SA_SIGINFO, SigSet::empty());
    unsafe { sigaction(signal, &action) }
        .map(|_| ())
        .map_err(|e| FimError::SignalFailed(format!("sigaction({}): {}", signal, e)))
}

/// Installs the monitor-side handlers: the command request handler and the
/// crash-triggered restore handler. Call before launching the child, then
/// publish its pid with [`set_traced_child`].
pub fn install_monitor_handlers() -> Result<()> {
    install_handler(
        MONITOR_REQUEST_SIGNAL,
        SigHandler::SigAction(handle_request_signal),
    )?;
    install_handler(
        Signal::SIGSEGV,
        SigHandler::SigAction(handle_child_fault_signal),
    )?;
    log::info!(
        "installed command handlers (request={}, response={})",
        MONITOR_REQUEST_SIGNAL,
        MONITOR_RESPONSE_SIGNAL
    );
    Ok(())
}

/// Publishes the traced child's pid to the crash handler. Until this is
/// called no fault signal matches and none is synthesized into a restore.
pub fn set_traced_child(pid: pid_t) {
    TRACED_CHILD_PID.store(pid, Ordering::Relaxed);
}

/// Consumes the pending command, if any. Called from the monitor's main
/// loop; never from a handler.
pub fn take_pending_command() -> Option<CommandInfo> {
    if !COMMAND_PENDING.load(Ordering::Acquire) {
        return None;
    }
    COMMAND_PENDING.store(false, Ordering::Release);
    Some(CommandInfo::unpack(PENDING_PAYLOAD.load(Ordering::Relaxed)))
}

/// Acknowledges a command back to the traced process. Sent regardless of
/// whether the dispatch succeeded, so the target's wait always terminates.
pub fn send_response(pid: pid_t) -> Result<()> {
    let value = libc::sigval {
        sival_ptr: std::ptr::null_mut(),
    };
    let ret = unsafe { libc::sigqueue(pid, MONITOR_RESPONSE_SIGNAL as c_int, value) };
    if ret < 0 {
        return Err(FimError::SignalFailed(format!(
            "sigqueue to pid {}: {}",
            pid,
            std::io::Error::last_os_error()
        )));
    }
    log::debug!("sent response to pid {}", pid);
    Ok(())
}

/// Installs the target-side response handler. The traced process calls
/// this once before its first [`send_command`].
pub fn init_traced_process() -> Result<()> {
    install_handler(
        MONITOR_RESPONSE_SIGNAL,
        SigHandler::SigAction(handle_response_signal),
    )
}

/// Sends a command to the monitor (our parent) and waits for the
/// acknowledgment. Returns `false` on oversized parameters, a failed send,
/// or a response timeout.
pub fn send_command(kind: CommandKind, param1: u64, param2: u64) -> bool {
    if param1 > MAX_COMMAND_PARAM || param2 > MAX_COMMAND_PARAM {
        log::error!(
            "command parameters out of range: {:#x}, {:#x}",
            param1,
            param2
        );
        return false;
    }

    RESPONSE_RECEIVED.store(false, Ordering::Release);

    let parent = getppid();
    let info = CommandInfo::new(kind, param1, param2);
    let value = libc::sigval {
        sival_ptr: info.pack() as *mut c_void,
    };

    log::info!("sending {:?} command to monitor pid {}", kind, parent);
    let ret = unsafe {
        libc::sigqueue(parent.as_raw(), MONITOR_REQUEST_SIGNAL as c_int, value)
    };
    if ret < 0 {
        log::error!(
            "failed to send command signal: {}",
            std::io::Error::last_os_error()
        );
        return false;
    }

    let deadline = Instant::now() + COMMAND_TIMEOUT;
    while !RESPONSE_RECEIVED.load(Ordering::Acquire) {
        if Instant::now() >= deadline {
            log::error!("timed out waiting for monitor response");
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }

    true
}

/// Asks the monitor to snapshot our writable memory.
pub fn request_checkpoint() -> bool {
    send_command(CommandKind::Checkpoint, 0, 0)
}

/// Asks the monitor to roll our writable memory back to the snapshot.
pub fn request_restore() -> bool {
    send_command(CommandKind::Restore, 0, 0)
}

/// Asks the monitor for an injection pass with its configured strategy.
pub fn request_error_injection() -> bool {
    send_command(CommandKind::InjectErrors, 0, 0)
}

/// Asks the monitor for a read-only scan pass.
pub fn request_scan() -> bool {
    send_command(CommandKind::Scan, 0, 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Packing Tests ====================

    #[test]
    fn test_pack_layout() {
        let info = CommandInfo::new(CommandKind::InjectErrors, 0x123, 0x456);
        let raw = info.pack();

        assert_eq!(raw >> KIND_SHIFT, CommandKind::InjectErrors as u64);
        assert_eq!((raw >> PARAM_BITS) & PARAM_MASK, 0x123);
        assert_eq!(raw & PARAM_MASK, 0x456);
    }

    #[test]
    fn test_pack_unpack_round_trip() {
        let kinds = [
            CommandKind::NoOp,
            CommandKind::Checkpoint,
            CommandKind::Restore,
            CommandKind::InjectErrors,
            CommandKind::Scan,
        ];
        let params = [0u64, 1, 0xff, 0x0fff_ffff];

        for &kind in &kinds {
            for &p1 in &params {
                for &p2 in &params {
                    let info = CommandInfo::new(kind, p1, p2);
                    assert_eq!(CommandInfo::unpack(info.pack()), info);
                }
            }
        }
    }

    #[test]
    fn test_params_do_not_bleed_into_each_other() {
        let info = CommandInfo::new(CommandKind::NoOp, MAX_COMMAND_PARAM, 0);
        let unpacked = CommandInfo::unpack(info.pack());
        assert_eq!(unpacked.param1, MAX_COMMAND_PARAM);
        assert_eq!(unpacked.param2, 0);

        let info = CommandInfo::new(CommandKind::NoOp, 0, MAX_COMMAND_PARAM);
        let unpacked = CommandInfo::unpack(info.pack());
        assert_eq!(unpacked.param1, 0);
        assert_eq!(unpacked.param2, MAX_COMMAND_PARAM);
    }

    #[test]
    fn test_unused_bits_are_zero() {
        let info = CommandInfo::new(CommandKind::Scan, 0x0aaa_aaaa, 0x0555_5555);
        let raw = info.pack();
        // Bits 56..63 carry the kind; everything else is the two params.
        let reassembled = ((info.kind as u64) << KIND_SHIFT)
            | (info.param1 << PARAM_BITS)
            | info.param2;
        assert_eq!(raw, reassembled);
    }

    #[test]
    fn test_unknown_kind_unpacks_as_noop() {
        let raw = 0x7fu64 << KIND_SHIFT;
        assert_eq!(CommandInfo::unpack(raw).kind, CommandKind::NoOp);
    }

    // ==================== Slot Tests ====================

    #[test]
    fn test_take_pending_command_consumes_slot() {
        let info = CommandInfo::new(CommandKind::Checkpoint, 7, 9);
        PENDING_PAYLOAD.store(info.pack(), Ordering::Relaxed);
        COMMAND_PENDING.store(true, Ordering::Release);

        assert_eq!(take_pending_command(), Some(info));
        assert_eq!(take_pending_command(), None);
    }

    #[test]
    fn test_send_command_rejects_oversized_params() {
        assert!(!send_command(CommandKind::NoOp, MAX_COMMAND_PARAM + 1, 0));
        assert!(!send_command(CommandKind::NoOp, 0, u64::MAX));
    }
}
