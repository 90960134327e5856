//! Monitor control loop: periodic scanning and command dispatch.

use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;

use crate::channel::{self, CommandInfo, CommandKind};
use crate::checkpoint::{CheckpointStore, CriuCheckpoint};
use crate::error::Result;
use crate::ptrace::{AttachGuard, ProcessController};
use crate::scanner::scan_for_pointers;
use crate::strategy::{ErrorInjectionStrategy, NullStrategy};

/// How the monitor decides when to act on the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorMode {
    /// Scan on a fixed interval until the child exits or the iteration
    /// limit is reached. A limit of one gives a single delayed scan.
    Periodic,
    /// Idle until the traced process requests work over the command
    /// channel.
    Command,
}

#[derive(Debug, Clone, Copy)]
pub struct MonitorConfig {
    pub initial_delay: Duration,
    pub interval: Duration,
    pub iteration_limit: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(1000),
            interval: Duration::from_millis(1000),
            iteration_limit: None,
        }
    }
}

/// Drives one traced child: owns the process controller, the injection
/// strategy, and the checkpoint store, and runs the mode-specific loop.
pub struct MonitorController {
    controller: ProcessController,
    strategy: ErrorInjectionStrategy,
    checkpoint: CheckpointStore,
    num_threads: usize,
    mode: MonitorMode,
    config: MonitorConfig,
}

impl MonitorController {
    pub fn new(
        child_pid: i32,
        strategy: ErrorInjectionStrategy,
        num_threads: usize,
        mode: MonitorMode,
        config: MonitorConfig,
    ) -> Result<Self> {
        Ok(Self {
            controller: ProcessController::new(child_pid)?,
            strategy,
            checkpoint: CheckpointStore::new(),
            num_threads: num_threads.max(1),
            mode,
            config,
        })
    }

    pub fn child_pid(&self) -> i32 {
        self.controller.pid()
    }

    /// Runs the configured loop until the child exits (clean success) or
    /// the monitor can no longer operate on it.
    pub fn start_monitoring(&mut self) -> Result<()> {
        match self.mode {
            MonitorMode::Periodic => self.run_periodic(),
            MonitorMode::Command => self.run_command_loop(),
        }
    }

    /// Non-blocking liveness poll. Consuming the exit status here is what
    /// ends both loops cleanly once the child is gone.
    fn check_child_running(&self) -> bool {
        let pid = Pid::from_raw(self.controller.pid());
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(WaitStatus::Exited(_, code)) => {
                log::info!("child exited with code {}", code);
                false
            }
            Ok(WaitStatus::Signaled(_, sig, _)) => {
                log::info!("child terminated by signal {}", sig);
                false
            }
            Ok(status) => {
                log::debug!("child stopped: {:?}", status);
                true
            }
            Err(Errno::ECHILD) => {
                log::info!("child already reaped");
                false
            }
            Err(e) => {
                log::error!("liveness check failed: {}", e);
                false
            }
        }
    }

    fn run_periodic(&mut self) -> Result<()> {
        if !self.config.initial_delay.is_zero() {
            log::info!(
                "waiting {} ms before first scan",
                self.config.initial_delay.as_millis()
            );
            thread::sleep(self.config.initial_delay);
        }

        let mut iterations = 0u64;
        while self.check_child_running() {
            {
                let guard = AttachGuard::new(&mut self.controller)?;
                match scan_for_pointers(&guard, &self.strategy, self.num_threads)? {
                    Some(stats) => log::info!("{}", stats),
                    None => log::warn!("scan cancelled by strategy"),
                }
            }

            iterations += 1;
            if let Some(limit) = self.config.iteration_limit {
                if iterations >= limit {
                    log::info!("iteration limit {} reached", limit);
                    break;
                }
            }

            thread::sleep(self.config.interval);
        }
        Ok(())
    }

    fn run_command_loop(&mut self) -> Result<()> {
        while self.check_child_running() {
            if let Some(cmd) = channel::take_pending_command() {
                log::info!("received {:?} command", cmd.kind);
                if let Err(e) = self.process_command(cmd) {
                    log::error!("command processing failed: {}", e);
                }
            }
            thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }

    /// Dispatches one command under an attach guard and acknowledges it
    /// whether or not it succeeded, so the target's wait always returns.
    fn process_command(&mut self, cmd: CommandInfo) -> Result<()> {
        let result = self.dispatch(cmd);
        if let Err(e) = channel::send_response(self.controller.pid()) {
            log::error!("failed to signal command completion: {}", e);
        }
        result
    }

    fn dispatch(&mut self, cmd: CommandInfo) -> Result<()> {
        let Self {
            controller,
            strategy,
            checkpoint,
            num_threads,
            ..
        } = self;

        let mut guard = AttachGuard::new(controller)?;

        match cmd.kind {
            CommandKind::NoOp => {
                log::info!("handling NoOp");
                Ok(())
            }
            CommandKind::Checkpoint => {
                log::info!("creating checkpoint");
                if cfg!(feature = "criu") {
                    CriuCheckpoint::new(guard.pid()).create(&mut guard)
                } else {
                    checkpoint.create(&mut guard)
                }
            }
            CommandKind::Restore => {
                log::info!("restoring from checkpoint");
                if cfg!(feature = "criu") {
                    CriuCheckpoint::new(guard.pid()).restore(&mut guard)
                } else {
                    checkpoint.restore(&mut guard)
                }
            }
            CommandKind::InjectErrors => {
                log::info!("injecting errors");
                match scan_for_pointers(&guard, strategy, *num_threads)? {
                    Some(stats) => log::info!("{}", stats),
                    None => log::warn!("injection scan cancelled by strategy"),
                }
                Ok(())
            }
            CommandKind::Scan => {
                match scan_for_pointers(&guard, &NullStrategy, *num_threads)? {
                    Some(stats) => log::info!("{}", stats),
                    None => log::warn!("scan cancelled by strategy"),
                }
                Ok(())
            }
        }
    }
}
