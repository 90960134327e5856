//! Ptrace controller owning the attach lifecycle and remote memory I/O.

use std::io;
use std::mem;

use libc::{c_void, pid_t, PTRACE_PEEKDATA, PTRACE_POKEDATA};
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

use crate::error::{FimError, Result};
use crate::region::RegionMap;

const WORD_SIZE: usize = mem::size_of::<libc::c_long>();

/// Controls one target process: attach/detach, the region map, and remote
/// memory reads and writes.
///
/// Remote I/O first tries the batched `process_vm_readv`/`writev` path and
/// falls back to word-granular `PTRACE_PEEKDATA`/`POKEDATA` when the batch
/// fails or transfers short.
pub struct ProcessController {
    target_pid: pid_t,
    is_attached: bool,
    page_size: usize,
    regions: RegionMap,
}

impl ProcessController {
    pub fn new(target_pid: pid_t) -> Result<Self> {
        if target_pid <= 0 {
            return Err(FimError::InvalidPid(target_pid));
        }

        let page_size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
            -1 => 4096,
            n => n as usize,
        };

        Ok(Self {
            target_pid,
            is_attached: false,
            page_size,
            regions: RegionMap::new(),
        })
    }

    pub fn pid(&self) -> pid_t {
        self.target_pid
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn is_attached(&self) -> bool {
        self.is_attached
    }

    /// Region views from the last refresh. Empty unless attached.
    pub fn regions(&self) -> &RegionMap {
        &self.regions
    }

    /// Stops the target and takes ownership of it as a tracer.
    ///
    /// A fresh execve reports a trap stop before the attach SIGSTOP; that
    /// stop is resumed and the wait repeated. Attaching while already
    /// attached is a no-op. On success the region map is refreshed; if the
    /// refresh fails the controller detaches again and reports the failure.
    pub fn attach(&mut self) -> Result<()> {
        if self.is_attached {
            return Ok(());
        }

        let pid = Pid::from_raw(self.target_pid);
        log::info!("attaching to pid {}", self.target_pid);

        ptrace::attach(pid)
            .map_err(|e| FimError::AttachFailed(self.target_pid, e.to_string()))?;

        match waitpid(pid, None) {
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => {}
            Ok(WaitStatus::Stopped(_, Signal::SIGTRAP)) => {
                self.resume_past_exec_trap(pid)?;
            }
            Ok(status) => {
                let _ = ptrace::detach(pid, None);
                return Err(FimError::UnexpectedStop(
                    self.target_pid,
                    format!("{:?}", status),
                ));
            }
            Err(e) => {
                let _ = ptrace::detach(pid, None);
                return Err(FimError::AttachFailed(
                    self.target_pid,
                    format!("waitpid failed: {}", e),
                ));
            }
        }

        self.is_attached = true;

        if let Err(e) = self.refresh_regions() {
            let _ = self.detach();
            return Err(e);
        }

        Ok(())
    }

    /// Consumes the trap stop a just-exec'd child reports and waits for the
    /// attach SIGSTOP instead.
    fn resume_past_exec_trap(&self, pid: Pid) -> Result<()> {
        if let Err(e) = ptrace::cont(pid, None) {
            let _ = ptrace::detach(pid, None);
            return Err(FimError::AttachFailed(
                self.target_pid,
                format!("failed to resume past exec trap: {}", e),
            ));
        }

        match waitpid(pid, None) {
            Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => Ok(()),
            Ok(status) => {
                let _ = ptrace::detach(pid, None);
                Err(FimError::UnexpectedStop(
                    self.target_pid,
                    format!("{:?}", status),
                ))
            }
            Err(e) => {
                let _ = ptrace::detach(pid, None);
                Err(FimError::AttachFailed(
                    self.target_pid,
                    format!("waitpid failed: {}", e),
                ))
            }
        }
    }

    /// Releases the target. Detaching a detached controller succeeds.
    ///
    /// The controller is marked detached even when the ptrace call fails
    /// (the usual cause is the target having exited), so the error is
    /// reported but never wedges the state machine.
    pub fn detach(&mut self) -> Result<()> {
        if !self.is_attached {
            return Ok(());
        }

        log::info!("detaching from pid {}", self.target_pid);
        self.is_attached = false;
        self.regions.clear();

        ptrace::detach(Pid::from_raw(self.target_pid), None)
            .map_err(|e| FimError::DetachFailed(self.target_pid, e.to_string()))
    }

    /// Rebuilds the region map from `/proc/<pid>/maps`.
    pub fn refresh_regions(&mut self) -> Result<()> {
        if !self.is_attached {
            return Err(FimError::NotAttached);
        }
        self.regions.refresh(self.target_pid)
    }

    /// Reads `buf.len()` bytes of target memory starting at `addr`.
    pub fn read_memory(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        if !self.is_attached {
            return Err(FimError::NotAttached);
        }
        if buf.is_empty() {
            return Ok(());
        }

        let local = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: addr as *mut c_void,
            iov_len: buf.len(),
        };

        let nread = unsafe {
            libc::process_vm_readv(self.target_pid, &local, 1, &remote, 1, 0)
        };
        if nread == buf.len() as isize {
            return Ok(());
        }

        // The batch failed outright or transferred short; either way the
        // word-granular path decides whether the range is truly readable.
        self.read_words(addr, buf)
    }

    fn read_words(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let words = buf.len().div_ceil(WORD_SIZE);
        for i in 0..words {
            let word_addr = addr + (i * WORD_SIZE) as u64;
            let word = self.peek_word(word_addr)?.to_ne_bytes();

            let offset = i * WORD_SIZE;
            let take = WORD_SIZE.min(buf.len() - offset);
            buf[offset..offset + take].copy_from_slice(&word[..take]);
        }
        Ok(())
    }

    /// Writes `buf` into target memory starting at `addr`.
    pub fn write_memory(&self, addr: u64, buf: &[u8]) -> Result<()> {
        if !self.is_attached {
            return Err(FimError::NotAttached);
        }
        if buf.is_empty() {
            return Ok(());
        }

        let local = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
        let remote = libc::iovec {
            iov_base: addr as *mut c_void,
            iov_len: buf.len(),
        };

        let written = unsafe {
            libc::process_vm_writev(self.target_pid, &local, 1, &remote, 1, 0)
        };
        if written == buf.len() as isize {
            return Ok(());
        }
        if written >= 0 {
            log::error!(
                "partial write via process_vm_writev: {} of {} bytes at {:#x}",
                written,
                buf.len(),
                addr
            );
        }

        self.write_words(addr, buf)
    }

    fn write_words(&self, addr: u64, buf: &[u8]) -> Result<()> {
        let full_words = buf.len() / WORD_SIZE;
        for i in 0..full_words {
            let offset = i * WORD_SIZE;
            let mut word = [0u8; WORD_SIZE];
            word.copy_from_slice(&buf[offset..offset + WORD_SIZE]);
            self.poke_word(addr + offset as u64, libc::c_long::from_ne_bytes(word))?;
        }

        // The tail is narrower than a word: read-modify-write the final
        // word so the neighbouring bytes survive.
        let remaining = buf.len() % WORD_SIZE;
        if remaining > 0 {
            let tail_addr = addr + (full_words * WORD_SIZE) as u64;
            let mut word = self.peek_word(tail_addr)?.to_ne_bytes();
            word[..remaining].copy_from_slice(&buf[full_words * WORD_SIZE..]);
            self.poke_word(tail_addr, libc::c_long::from_ne_bytes(word))?;
        }

        Ok(())
    }

    fn peek_word(&self, addr: u64) -> Result<libc::c_long> {
        unsafe { *libc::__errno_location() = 0 };
        let ret = unsafe {
            libc::ptrace(
                PTRACE_PEEKDATA,
                self.target_pid,
                addr as *mut c_void,
                std::ptr::null_mut::<c_void>(),
            )
        };
        let errno = io::Error::last_os_error();
        if ret == -1 && errno.raw_os_error() != Some(0) {
            return Err(FimError::ReadFailed {
                addr,
                len: WORD_SIZE,
                reason: errno.to_string(),
            });
        }
        Ok(ret)
    }

    fn poke_word(&self, addr: u64, data: libc::c_long) -> Result<()> {
        let ret = unsafe {
            libc::ptrace(
                PTRACE_POKEDATA,
                self.target_pid,
                addr as *mut c_void,
                data as *mut c_void,
            )
        };
        if ret == -1 {
            return Err(FimError::WriteFailed {
                addr,
                len: WORD_SIZE,
                reason: io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }
}

impl Drop for ProcessController {
    fn drop(&mut self) {
        if self.is_attached {
            if let Err(e) = self.detach() {
                log::error!("detach on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Construction Tests ====================

    #[test]
    fn test_new_rejects_zero_pid() {
        assert!(matches!(
            ProcessController::new(0),
            Err(FimError::InvalidPid(0))
        ));
    }

    #[test]
    fn test_new_rejects_negative_pid() {
        assert!(matches!(
            ProcessController::new(-5),
            Err(FimError::InvalidPid(-5))
        ));
    }

    #[test]
    fn test_new_starts_detached() {
        let controller = ProcessController::new(1234).unwrap();
        assert!(!controller.is_attached());
        assert!(controller.regions().is_empty());
        assert!(controller.page_size() >= 4096);
    }

    // ==================== Detached I/O Tests ====================

    #[test]
    fn test_read_fails_fast_when_detached() {
        let controller = ProcessController::new(1234).unwrap();
        let mut buf = [0u8; 8];
        assert!(matches!(
            controller.read_memory(0x1000, &mut buf),
            Err(FimError::NotAttached)
        ));
    }

    #[test]
    fn test_write_fails_fast_when_detached() {
        let controller = ProcessController::new(1234).unwrap();
        assert!(matches!(
            controller.write_memory(0x1000, &[0u8; 8]),
            Err(FimError::NotAttached)
        ));
    }

    #[test]
    fn test_refresh_fails_when_detached() {
        let mut controller = ProcessController::new(1234).unwrap();
        assert!(matches!(
            controller.refresh_regions(),
            Err(FimError::NotAttached)
        ));
    }

    #[test]
    fn test_detach_when_detached_is_noop() {
        let mut controller = ProcessController::new(1234).unwrap();
        assert!(controller.detach().is_ok());
        assert!(controller.detach().is_ok());
    }
}
