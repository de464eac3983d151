// Copyright 2019-2020 Benjamin Fry <benjaminfry@me.com>
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;

use libc::{c_int, c_void, siginfo_t};
use nix::errno::Errno;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{info, warn};

use crate::runner::{Registry, RunState};
use crate::Error;

/// The registry the installed SIGCHLD handler reports to, null when none is installed
static ACTIVE: AtomicPtr<Registry> = AtomicPtr::new(ptr::null_mut());

/// A status change of a child process
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildEvent {
    Exited(i32),
    Killed(Signal),
    Dumped(Signal),
    Trapped,
    Stopped,
    Continued,
}

impl ChildEvent {
    /// The process is gone, or as good as gone for the supervisor
    pub fn is_terminal(self) -> bool {
        match self {
            Self::Exited(_) | Self::Killed(_) | Self::Dumped(_) | Self::Trapped => true,
            Self::Stopped | Self::Continued => false,
        }
    }

    pub fn from_wait_status(status: WaitStatus) -> Option<(Pid, Self)> {
        let pid = status.pid()?;
        let event = match status {
            WaitStatus::Exited(_, code) => Self::Exited(code),
            WaitStatus::Signaled(_, signal, true) => Self::Dumped(signal),
            WaitStatus::Signaled(_, signal, false) => Self::Killed(signal),
            WaitStatus::Stopped(..) => Self::Stopped,
            WaitStatus::Continued(_) => Self::Continued,
            // ptrace stops
            _ => Self::Trapped,
        };

        Some((pid, event))
    }
}

impl Registry {
    /// Applies a child status change to the runner owning `pid`.
    ///
    /// Safe to call from a signal handler: no allocation, no lock, only atomic writes and an
    ///  unlink from the process group index. Returns false if no runner owns the process.
    pub fn notify(&self, pid: Pid, event: ChildEvent) -> bool {
        let runner = match self.lookup_by_pid(pid) {
            Some(runner) => runner,
            None => return false,
        };

        match event {
            // unlink first, a Terminated runner must never be found by group id again
            event if event.is_terminal() => {
                self.remove_by_pgid(runner);
                runner.update_state(|_| RunState::Terminated);
            }
            ChildEvent::Stopped => {
                runner.update_state(|state| match state {
                    RunState::Terminating | RunState::Terminated => state,
                    _ => RunState::Stopped,
                });
            }
            _ => {
                runner.update_state(|state| match state {
                    RunState::Terminating | RunState::Terminated => state,
                    _ => RunState::Running,
                });
            }
        }

        true
    }

    /// Collects the pending status of every indexed group leader, returns how many changes were
    ///  applied.
    ///
    /// SIGCHLD deliveries coalesce, so every leader is asked rather than only the one reported.
    ///  Leaders that are not children of this process are skipped.
    pub fn reap(&self) -> usize {
        let flags = WaitPidFlag::WNOHANG | WaitPidFlag::WUNTRACED | WaitPidFlag::WCONTINUED;
        let mut applied = 0;

        for runner in self.iter_by_pgid() {
            let leader = runner.leader();
            while let Ok(status) = waitpid(leader, Some(flags)) {
                let (pid, event) = match ChildEvent::from_wait_status(status) {
                    Some(change) => change,
                    None => break,
                };

                if self.notify(pid, event) {
                    applied += 1;
                }
                if event.is_terminal() {
                    break;
                }
            }
        }

        applied
    }
}

extern "C" fn on_sigchld(_signum: c_int, _info: *mut siginfo_t, _context: *mut c_void) {
    let errno = Errno::last_raw();

    // the pointer is cleared before the owning Reaper releases the registry
    let registry = unsafe { ACTIVE.load(Ordering::Acquire).as_ref() };
    if let Some(registry) = registry {
        registry.reap();
    }

    Errno::set_raw(errno);
}

/// Owns the process wide SIGCHLD disposition for one registry.
///
/// Only one Reaper may be installed at a time. Dropping it restores the previous disposition.
#[derive(Debug)]
pub struct Reaper {
    registry: Arc<Registry>,
    previous: SigAction,
}

impl Reaper {
    /// Installs the SIGCHLD handler.
    ///
    /// The disposition restarts interrupted system calls and leaves children unreaped until the
    ///  handler queries them, so their exit status is never lost.
    pub fn install(registry: Arc<Registry>) -> Result<Self, Error> {
        let raw = Arc::as_ptr(&registry) as *mut Registry;
        ACTIVE
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::from("a SIGCHLD reaper is already installed"))?;

        let mut mask = SigSet::empty();
        mask.add(Signal::SIGCHLD);
        let action = SigAction::new(
            SigHandler::SigAction(on_sigchld),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
            mask,
        );

        // the handler only reads the registry kept alive by this Reaper
        let previous = match unsafe { sigaction(Signal::SIGCHLD, &action) } {
            Ok(previous) => previous,
            Err(err) => {
                ACTIVE.store(ptr::null_mut(), Ordering::Release);
                return Err(err.into());
            }
        };

        info!("SIGCHLD reaper installed");
        Ok(Self { registry, previous })
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        if let Err(err) = unsafe { sigaction(Signal::SIGCHLD, &self.previous) } {
            warn!("failed to restore the SIGCHLD disposition: {}", err);
        }
        ACTIVE.store(ptr::null_mut(), Ordering::Release);
        info!(
            "SIGCHLD reaper removed, {} process groups still indexed",
            self.registry.iter_by_pgid().count()
        );
    }
}

/// Blocks SIGCHLD on the current thread until dropped, the previous mask is then restored
#[derive(Debug)]
#[must_use]
pub struct ChildSignalBlock {
    previous: SigSet,
}

impl ChildSignalBlock {
    pub fn new() -> Result<Self, Error> {
        let mut set = SigSet::empty();
        set.add(Signal::SIGCHLD);
        let previous = set.thread_swap_mask(SigmaskHow::SIG_BLOCK)?;

        Ok(Self { previous })
    }
}

impl Drop for ChildSignalBlock {
    fn drop(&mut self) {
        if let Err(err) = self.previous.thread_set_mask() {
            warn!("failed to restore the signal mask: {}", err);
        }
    }
}

/// Permanently blocks SIGCHLD on the calling thread.
///
/// For every thread of the process except the control thread, so that the handler always
///  interrupts the thread that owns the registry.
pub fn block_child_signals() -> Result<(), Error> {
    let mut set = SigSet::empty();
    set.add(Signal::SIGCHLD);
    set.thread_block()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::manifest::Manifest;
    use crate::runner::Children;

    fn registry_with(leaders: &[i32]) -> Registry {
        let registry = Registry::new(8, 8, 4).unwrap();
        let manifest = Arc::new(Manifest::from_value(json!({"public": {"id": "a"}})).unwrap());
        for leader in leaders {
            let runner = registry.allocate(manifest.clone()).unwrap();
            registry.insert_by_pgid(
                runner,
                Children {
                    leader: Pid::from_raw(*leader),
                    app: Pid::from_raw(*leader),
                },
            );
        }
        registry
    }

    fn state_of(registry: &Registry, leader: i32) -> Option<RunState> {
        registry
            .iter()
            .find(|runner| runner.leader() == Pid::from_raw(leader))
            .map(|runner| runner.state())
    }

    #[test]
    fn test_unknown_pid_is_ignored() {
        let registry = registry_with(&[1000, 1001]);

        assert!(!registry.notify(Pid::from_raw(i32::MAX), ChildEvent::Exited(0)));
        assert_eq!(state_of(&registry, 1000), Some(RunState::Running));
        assert_eq!(state_of(&registry, 1001), Some(RunState::Running));
    }

    #[test]
    fn test_stop_and_continue() {
        let registry = registry_with(&[1000, 1001]);

        assert!(registry.notify(Pid::from_raw(1000), ChildEvent::Stopped));
        assert_eq!(state_of(&registry, 1000), Some(RunState::Stopped));
        assert_eq!(state_of(&registry, 1001), Some(RunState::Running));

        assert!(registry.notify(Pid::from_raw(1000), ChildEvent::Continued));
        assert_eq!(state_of(&registry, 1000), Some(RunState::Running));
    }

    #[test]
    fn test_exit_evicts_from_group_index() {
        let registry = registry_with(&[1000, 1004]);

        assert!(registry.notify(Pid::from_raw(1004), ChildEvent::Killed(Signal::SIGKILL)));
        assert_eq!(state_of(&registry, 1004), Some(RunState::Terminated));
        assert!(registry.lookup_by_pgid(Pid::from_raw(1004)).is_none());
        assert!(registry.lookup_by_pgid(Pid::from_raw(1000)).is_some());

        // a second report for a reused pid finds nothing
        assert!(!registry.notify(Pid::from_raw(1004), ChildEvent::Exited(0)));
    }

    #[test]
    fn test_terminating_is_not_downgraded() {
        let registry = registry_with(&[1000]);
        let runner = registry.lookup_by_pgid(Pid::from_raw(1000)).unwrap();
        runner.transition(RunState::Running, RunState::Terminating);

        registry.notify(Pid::from_raw(1000), ChildEvent::Stopped);
        assert_eq!(runner.state(), RunState::Terminating);
        registry.notify(Pid::from_raw(1000), ChildEvent::Continued);
        assert_eq!(runner.state(), RunState::Terminating);

        registry.notify(Pid::from_raw(1000), ChildEvent::Dumped(Signal::SIGSEGV));
        assert_eq!(runner.state(), RunState::Terminated);
    }

    #[test]
    fn test_from_wait_status() {
        let pid = Pid::from_raw(42);
        assert_eq!(
            ChildEvent::from_wait_status(WaitStatus::Exited(pid, 3)),
            Some((pid, ChildEvent::Exited(3)))
        );
        assert_eq!(
            ChildEvent::from_wait_status(WaitStatus::Signaled(pid, Signal::SIGABRT, true)),
            Some((pid, ChildEvent::Dumped(Signal::SIGABRT)))
        );
        assert_eq!(
            ChildEvent::from_wait_status(WaitStatus::Signaled(pid, Signal::SIGTERM, false)),
            Some((pid, ChildEvent::Killed(Signal::SIGTERM)))
        );
        assert_eq!(
            ChildEvent::from_wait_status(WaitStatus::Stopped(pid, Signal::SIGSTOP)),
            Some((pid, ChildEvent::Stopped))
        );
        assert_eq!(
            ChildEvent::from_wait_status(WaitStatus::Continued(pid)),
            Some((pid, ChildEvent::Continued))
        );
        assert_eq!(ChildEvent::from_wait_status(WaitStatus::StillAlive), None);
        assert!(!ChildEvent::Stopped.is_terminal());
        assert!(ChildEvent::Trapped.is_terminal());
    }

    #[test]
    fn test_reap_skips_foreign_leaders() {
        // not children of this process, waitpid fails and nothing changes
        let registry = registry_with(&[i32::MAX - 1]);
        assert_eq!(registry.reap(), 0);
        assert_eq!(state_of(&registry, i32::MAX - 1), Some(RunState::Running));
    }

    #[test]
    fn test_child_signal_block() {
        let blocked = ChildSignalBlock::new().unwrap();
        assert!(SigSet::thread_get_mask().unwrap().contains(Signal::SIGCHLD));
        drop(blocked);
        assert!(!SigSet::thread_get_mask().unwrap().contains(Signal::SIGCHLD));
    }
}
